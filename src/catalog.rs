use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::chunking::{read_chunk, ChunkManifest};
use crate::config::RecordSchema;
use crate::error::Result;
use crate::records::split_record;
use crate::types::{Message, WorkItem};

/// Complexity features of one work item, without its message bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProfile {
    pub id: String,
    pub message_count: usize,
    /// Messages sent by the designated participant role
    pub role_message_count: usize,
    pub total_chars: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl ItemProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message_count: 0,
            role_message_count: 0,
            total_chars: 0,
            first_timestamp: None,
            last_timestamp: None,
        }
    }

    pub fn from_item(item: &WorkItem, role: &str) -> Self {
        let mut profile = Self::new(item.id.clone());
        for message in &item.messages {
            profile.observe(message, role);
        }
        profile
    }

    fn observe(&mut self, message: &Message, role: &str) {
        self.message_count += 1;
        self.total_chars += message.content.chars().count();
        if message
            .role
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case(role))
            .unwrap_or(false)
        {
            self.role_message_count += 1;
        }
        if let Some(ts) = message.timestamp {
            self.first_timestamp = Some(self.first_timestamp.map_or(ts, |first| first.min(ts)));
            self.last_timestamp = Some(self.last_timestamp.map_or(ts, |last| last.max(ts)));
        }
    }

    pub fn average_message_chars(&self) -> f64 {
        if self.message_count == 0 {
            0.0
        } else {
            self.total_chars as f64 / self.message_count as f64
        }
    }

    /// Elapsed time between the first and last message, in hours
    pub fn span_hours(&self) -> f64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => (last - first).num_seconds().max(0) as f64 / 3600.0,
            _ => 0.0,
        }
    }
}

/// Ordered work-item ids plus their profiles
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    profiles: Vec<ItemProfile>,
    unkeyed_messages: usize,
}

impl ItemCatalog {
    pub fn from_profiles(profiles: Vec<ItemProfile>) -> Self {
        Self {
            profiles,
            unkeyed_messages: 0,
        }
    }

    pub fn from_items(items: &[WorkItem], role: &str) -> Self {
        Self::from_profiles(items.iter().map(|item| ItemProfile::from_item(item, role)).collect())
    }

    /// One ordered pass over every chunk. Only one chunk's records are held
    /// at a time; message bodies are dropped after they are measured.
    pub fn build(
        chunks_dir: &Path,
        manifest: &ChunkManifest,
        schema: &RecordSchema,
        role: &str,
    ) -> Result<Self> {
        let mut catalog = Self::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for chunk in &manifest.chunks {
            let records = read_chunk(&chunks_dir.join(&chunk.file_name))?;
            for record in &records {
                let split = split_record(record, schema);
                catalog.unkeyed_messages += split.unkeyed;
                if let Some(owner) = split.owner.as_deref() {
                    catalog.position(&mut positions, owner);
                }
                for (key, message) in split.messages {
                    let position = catalog.position(&mut positions, &key);
                    catalog.profiles[position].observe(&message, role);
                }
            }
            debug!(chunk = %chunk.file_name, items = catalog.profiles.len(), "Catalogued chunk");
        }

        if catalog.unkeyed_messages > 0 {
            info!(
                dropped = catalog.unkeyed_messages,
                "Messages without a grouping key were dropped"
            );
        }
        info!(items = catalog.profiles.len(), "Work item catalog built");
        Ok(catalog)
    }

    fn position(&mut self, positions: &mut HashMap<String, usize>, key: &str) -> usize {
        if let Some(position) = positions.get(key) {
            return *position;
        }
        self.profiles.push(ItemProfile::new(key));
        positions.insert(key.to_string(), self.profiles.len() - 1);
        self.profiles.len() - 1
    }

    pub async fn build_async(
        chunks_dir: &Path,
        manifest: &ChunkManifest,
        schema: &RecordSchema,
        role: &str,
    ) -> Result<Self> {
        let chunks_dir = chunks_dir.to_path_buf();
        let manifest = manifest.clone();
        let schema = schema.clone();
        let role = role.to_string();
        tokio::task::spawn_blocking(move || Self::build(&chunks_dir, &manifest, &schema, &role)).await?
    }

    pub fn profiles(&self) -> &[ItemProfile] {
        &self.profiles
    }

    pub fn ids(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn unkeyed_messages(&self) -> usize {
        self.unkeyed_messages
    }
}

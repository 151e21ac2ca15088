//! Normalizes raw source records into work items.
//!
//! Source documents come in two shapes: a bare array of records, or a wrapper
//! object carrying a count and the record array (`{Count, ActiveChatters}` in
//! raw exports, `{chunkNumber, totalChatters, chatters}` in older pre-chunked
//! directories). Records either carry their own grouping key, or hold messages
//! that are grouped by sender.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::config::RecordSchema;
use crate::types::{Message, WorkItem};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SourceDocument {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(default, alias = "Count", alias = "totalChatters", alias = "total")]
        count: Option<u64>,
        #[serde(alias = "ActiveChatters", alias = "chatters", alias = "records")]
        items: Vec<Value>,
    },
}

impl SourceDocument {
    /// Count the wrapper claims to hold, if any
    pub fn declared_count(&self) -> Option<u64> {
        match self {
            SourceDocument::Bare(_) => None,
            SourceDocument::Wrapped { count, .. } => *count,
        }
    }

    pub fn into_records(self) -> Vec<Value> {
        match self {
            SourceDocument::Bare(records) | SourceDocument::Wrapped { items: records, .. } => {
                records
            }
        }
    }
}

/// Render a key field value as a grouping key. Only strings and numbers qualify.
fn key_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Record-level grouping key, first configured field wins
pub fn record_key(record: &Value, schema: &RecordSchema) -> Option<String> {
    let object = record.as_object()?;
    schema
        .key_fields
        .iter()
        .find_map(|field| object.get(field).and_then(key_from_value))
}

fn record_messages<'a>(record: &'a Value, schema: &RecordSchema) -> Option<&'a Vec<Value>> {
    let object = record.as_object()?;
    schema
        .message_fields
        .iter()
        .find_map(|field| object.get(field).and_then(Value::as_array))
}

/// Outcome of splitting one record into keyed messages
#[derive(Debug, Default)]
pub struct SplitRecord {
    /// Record-level key, present even when the record holds no messages
    pub owner: Option<String>,
    pub messages: Vec<(String, Message)>,
    pub unkeyed: usize,
    pub malformed: usize,
}

/// Assign every message of a record to its work-item key.
///
/// A record without any message list is treated as a single message.
pub fn split_record(record: &Value, schema: &RecordSchema) -> SplitRecord {
    let owner = record_key(record, schema);
    let mut split = SplitRecord {
        owner: owner.clone(),
        ..SplitRecord::default()
    };

    let raw_messages: Vec<&Value> = match record_messages(record, schema) {
        Some(list) => list.iter().collect(),
        None => vec![record],
    };

    for raw in raw_messages {
        let message = match Message::deserialize(raw) {
            Ok(message) => message,
            Err(_) => {
                split.malformed += 1;
                continue;
            }
        };

        let key = owner.clone().or_else(|| {
            message
                .sender_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        });

        match key {
            Some(key) => split.messages.push((key, message)),
            None => split.unkeyed += 1,
        }
    }

    split
}

/// Distinct keys a record contributes to, in first-appearance order
pub fn record_keys(record: &Value, schema: &RecordSchema) -> Vec<String> {
    if let Some(key) = record_key(record, schema) {
        return vec![key];
    }
    let mut keys: Vec<String> = Vec::new();
    for (key, _) in split_record(record, schema).messages {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Accumulates records into work items, ordered by first appearance
#[derive(Debug)]
pub struct RecordGrouper<'a> {
    schema: &'a RecordSchema,
    items: Vec<WorkItem>,
    positions: HashMap<String, usize>,
    unkeyed_messages: usize,
    malformed_messages: usize,
}

impl<'a> RecordGrouper<'a> {
    pub fn new(schema: &'a RecordSchema) -> Self {
        Self {
            schema,
            items: Vec::new(),
            positions: HashMap::new(),
            unkeyed_messages: 0,
            malformed_messages: 0,
        }
    }

    /// Only keep messages that belong to `key`
    pub fn push_filtered(&mut self, record: &Value, key: Option<&str>) {
        let split = split_record(record, self.schema);
        self.unkeyed_messages += split.unkeyed;
        self.malformed_messages += split.malformed;

        let wanted = |item_key: &str| key.map(|k| k == item_key).unwrap_or(true);

        if let Some(owner) = split.owner.as_deref() {
            if wanted(owner) {
                self.position(owner);
            }
        }
        for (item_key, message) in split.messages {
            if !wanted(&item_key) {
                continue;
            }
            let position = self.position(&item_key);
            self.items[position].messages.push(message);
        }
    }

    fn position(&mut self, key: &str) -> usize {
        if let Some(position) = self.positions.get(key) {
            return *position;
        }
        self.items.push(WorkItem::new(key));
        self.positions.insert(key.to_string(), self.items.len() - 1);
        self.items.len() - 1
    }

    pub fn push(&mut self, record: &Value) {
        self.push_filtered(record, None);
    }

    pub fn unkeyed_messages(&self) -> usize {
        self.unkeyed_messages
    }

    pub fn malformed_messages(&self) -> usize {
        self.malformed_messages
    }

    pub fn into_items(self) -> Vec<WorkItem> {
        self.items
    }
}

/// Group a batch of records in one go
pub fn group_records(records: &[Value], schema: &RecordSchema) -> Vec<WorkItem> {
    let mut grouper = RecordGrouper::new(schema);
    for record in records {
        grouper.push(record);
    }
    grouper.into_items()
}

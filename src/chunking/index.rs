use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::manifest::ChunkManifest;
use super::reader::{read_chunk, read_chunk_async};
use crate::config::RecordSchema;
use crate::error::{PipelineError, Result};
use crate::records::{record_keys, RecordGrouper};
use crate::scheduler::source::WorkItemSource;
use crate::types::WorkItem;
use crate::utils::write_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBuildReport {
    pub chunks_scanned: usize,
    pub records_scanned: usize,
    pub keys: usize,
    /// Keys whose records appear in more than one chunk
    pub spanning_keys: usize,
}

struct CachedChunk {
    file_name: String,
    records: Arc<Vec<Value>>,
}

/// Grouping key to chunk files lookup, persisted as a sorted JSON object.
///
/// Each key maps to every chunk holding its records, in manifest order.
pub struct ChunkIndex {
    chunks_dir: PathBuf,
    schema: RecordSchema,
    entries: BTreeMap<String, Vec<String>>,
    cache: Mutex<Option<CachedChunk>>,
}

impl ChunkIndex {
    fn from_entries(chunks_dir: &Path, schema: RecordSchema, entries: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            chunks_dir: chunks_dir.to_path_buf(),
            schema,
            entries,
            cache: Mutex::new(None),
        }
    }

    /// Scan every chunk once, recording each chunk a key appears in
    pub fn build(
        chunks_dir: &Path,
        manifest: &ChunkManifest,
        schema: &RecordSchema,
    ) -> Result<(Self, IndexBuildReport)> {
        let mut entries: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut report = IndexBuildReport::default();

        for chunk in &manifest.chunks {
            let records = read_chunk(&chunks_dir.join(&chunk.file_name))?;
            report.chunks_scanned += 1;
            report.records_scanned += records.len();

            for record in &records {
                for key in record_keys(record, schema) {
                    let files = entries.entry(key).or_default();
                    if files.last() != Some(&chunk.file_name) {
                        files.push(chunk.file_name.clone());
                    }
                }
            }
            debug!(chunk = %chunk.file_name, keys = entries.len(), "Indexed chunk");
        }

        report.keys = entries.len();
        report.spanning_keys = entries.values().filter(|files| files.len() > 1).count();
        if report.spanning_keys > 0 {
            debug!(spanning = report.spanning_keys, "Keys spanning several chunks");
        }
        info!(
            keys = report.keys,
            chunks = report.chunks_scanned,
            "Chunk index built"
        );

        Ok((Self::from_entries(chunks_dir, schema.clone(), entries), report))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        write_atomic(path, &json).await
    }

    pub async fn load(path: &Path, chunks_dir: &Path, schema: &RecordSchema) -> Result<Self> {
        let content = tokio::fs::read(path).await?;
        let entries: BTreeMap<String, Vec<String>> = serde_json::from_slice(&content)
            .map_err(|e| PipelineError::Index(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_entries(chunks_dir, schema.clone(), entries))
    }

    /// Reuse the persisted index when present, otherwise build and persist it
    pub async fn load_or_build(
        index_path: &Path,
        chunks_dir: &Path,
        manifest: &ChunkManifest,
        schema: &RecordSchema,
    ) -> Result<Self> {
        if tokio::fs::try_exists(index_path).await? {
            debug!("Loading chunk index from {}", index_path.display());
            return Self::load(index_path, chunks_dir, schema).await;
        }
        let (index, _) = Self::build_blocking(chunks_dir, manifest, schema).await?;
        index.save(index_path).await?;
        Ok(index)
    }

    /// Discard the persisted index and regenerate it
    pub async fn rebuild(
        index_path: &Path,
        chunks_dir: &Path,
        manifest: &ChunkManifest,
        schema: &RecordSchema,
    ) -> Result<(Self, IndexBuildReport)> {
        if tokio::fs::try_exists(index_path).await? {
            tokio::fs::remove_file(index_path).await?;
        }
        let (index, report) = Self::build_blocking(chunks_dir, manifest, schema).await?;
        index.save(index_path).await?;
        Ok((index, report))
    }

    async fn build_blocking(
        chunks_dir: &Path,
        manifest: &ChunkManifest,
        schema: &RecordSchema,
    ) -> Result<(Self, IndexBuildReport)> {
        let chunks_dir = chunks_dir.to_path_buf();
        let manifest = manifest.clone();
        let schema = schema.clone();
        tokio::task::spawn_blocking(move || Self::build(&chunks_dir, &manifest, &schema)).await?
    }

    /// First chunk holding `key`
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.chunks_for(key).first().map(String::as_str)
    }

    /// Every chunk holding `key`, in manifest order
    pub fn chunks_for(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<String>> {
        &self.entries
    }

    async fn chunk_records(&self, file_name: &str) -> Result<Arc<Vec<Value>>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.file_name == file_name {
                return Ok(cached.records.clone());
            }
        }
        let records = Arc::new(read_chunk_async(&self.chunks_dir.join(file_name)).await?);
        *cache = Some(CachedChunk {
            file_name: file_name.to_string(),
            records: records.clone(),
        });
        Ok(records)
    }

    /// Records contributing to `key`, read from each of its chunks in order
    pub async fn load_records(&self, key: &str) -> Result<Vec<Value>> {
        let mut matching = Vec::new();
        for file_name in self.chunks_for(key) {
            let records = self.chunk_records(file_name).await?;
            matching.extend(
                records
                    .iter()
                    .filter(|record| record_keys(record, &self.schema).iter().any(|k| k == key))
                    .cloned(),
            );
        }
        Ok(matching)
    }

    pub async fn load_item(&self, key: &str) -> Result<Option<WorkItem>> {
        let records = self.load_records(key).await?;
        if records.is_empty() {
            return Ok(None);
        }
        let mut grouper = RecordGrouper::new(&self.schema);
        for record in &records {
            grouper.push_filtered(record, Some(key));
        }
        Ok(grouper.into_items().into_iter().next())
    }
}

#[async_trait]
impl WorkItemSource for ChunkIndex {
    async fn fetch(&self, id: &str) -> Result<WorkItem> {
        self.load_item(id)
            .await?
            .ok_or_else(|| PipelineError::ItemNotFound(id.to_string()))
    }
}

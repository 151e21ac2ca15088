use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::reader::count_records;
use crate::error::{PipelineError, Result};
use crate::utils::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub file_name: String,
    pub item_count: usize,
    /// Sum of record payload bytes, excluding array framing
    pub byte_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub average_items_per_chunk: f64,
    pub average_chunk_bytes: f64,
    pub largest_chunk_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifest {
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub source_bytes: u64,
    pub total_items: usize,
    pub total_chunks: usize,
    pub target_chunk_bytes: u64,
    #[serde(default)]
    pub skipped_records: usize,
    pub chunks: Vec<ChunkInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ChunkStats,
}

impl ChunkManifest {
    pub fn new(target_chunk_bytes: u64) -> Self {
        Self {
            source_file: None,
            source_bytes: 0,
            total_items: 0,
            total_chunks: 0,
            target_chunk_bytes,
            skipped_records: 0,
            chunks: Vec::new(),
            created_at: Utc::now(),
            stats: ChunkStats::default(),
        }
    }

    pub fn push(&mut self, chunk: ChunkInfo) {
        self.total_items += chunk.item_count;
        self.chunks.push(chunk);
        self.total_chunks = self.chunks.len();
        self.refresh_stats();
    }

    fn refresh_stats(&mut self) {
        if self.chunks.is_empty() {
            self.stats = ChunkStats::default();
            return;
        }
        let count = self.chunks.len() as f64;
        let total_bytes: u64 = self.chunks.iter().map(|c| c.byte_size).sum();
        self.stats = ChunkStats {
            average_items_per_chunk: self.total_items as f64 / count,
            average_chunk_bytes: total_bytes as f64 / count,
            largest_chunk_bytes: self.chunks.iter().map(|c| c.byte_size).max().unwrap_or(0),
        };
    }

    /// Chunk file paths in chunk order
    pub fn chunk_paths(&self, chunks_dir: &Path) -> Vec<PathBuf> {
        self.chunks
            .iter()
            .map(|chunk| chunks_dir.join(&chunk.file_name))
            .collect()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json).await
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Build a manifest for a directory that was chunked elsewhere, following
    /// the `<prefix>_<NNN>.json` naming convention. Chunks are ordered by their
    /// numeric index, and item counts come from the streaming scanner.
    pub fn from_dir(dir: &Path, prefix: &str, block_size: usize) -> Result<Self> {
        let mut found: Vec<(usize, String, u64)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = parse_chunk_index(prefix, &file_name) {
                found.push((index, file_name, entry.metadata()?.len()));
            }
        }

        if found.is_empty() {
            return Err(PipelineError::Config(format!(
                "no {}_NNN.json chunk files in {}",
                prefix,
                dir.display()
            )));
        }
        found.sort_by_key(|(index, _, _)| *index);

        let mut manifest = ChunkManifest::new(found.iter().map(|(_, _, len)| *len).max().unwrap_or(0));
        for (position, (index, file_name, _)) in found.into_iter().enumerate() {
            if position != index {
                warn!(expected = position, found = index, "Gap in chunk numbering");
            }
            let mut byte_size = 0u64;
            let file = std::fs::File::open(dir.join(&file_name))?;
            let stats = super::reader::scan_records(file, block_size, |span| {
                byte_size += span.bytes.len() as u64;
                Ok(())
            })?;
            manifest.skipped_records += stats.skipped;
            manifest.source_bytes += stats.bytes_read;
            manifest.push(ChunkInfo {
                index,
                file_name,
                item_count: stats.records,
                byte_size,
            });
        }

        info!(
            chunks = manifest.total_chunks,
            items = manifest.total_items,
            "Built manifest for pre-chunked directory {}",
            dir.display()
        );
        Ok(manifest)
    }

    /// Recount the records in one chunk and compare against the manifest
    pub fn verify_chunk(&self, chunks_dir: &Path, position: usize, block_size: usize) -> Result<bool> {
        let chunk = self
            .chunks
            .get(position)
            .ok_or_else(|| PipelineError::Config(format!("no chunk at position {}", position)))?;
        let stats = count_records(&chunks_dir.join(&chunk.file_name), block_size)?;
        Ok(stats.records == chunk.item_count)
    }
}

pub fn chunk_file_name(prefix: &str, index: usize) -> String {
    format!("{}_{:03}.json", prefix, index)
}

/// Numeric index of a chunk file name, if it follows the naming convention
pub fn parse_chunk_index(prefix: &str, file_name: &str) -> Option<usize> {
    let digits = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".json")?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

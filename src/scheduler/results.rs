use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::AnalysisResult;
use crate::utils::dedup_by_key;

/// Durable destination for analysis results. `append` must not return until
/// the results survive a crash.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append(&self, results: &[AnalysisResult]) -> Result<()>;
}

/// Append-only JSON Lines result log
pub struct JsonlResultStore {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlResultStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every result back. A torn trailing line is skipped, and an item
    /// analyzed twice (crash between append and checkpoint) keeps its first result.
    pub async fn load(path: &Path) -> Result<Vec<AnalysisResult>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let mut results = Vec::new();
        for (line_number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AnalysisResult>(line) {
                Ok(result) => results.push(result),
                Err(e) => warn!(line = line_number + 1, "Skipping unreadable result line: {}", e),
            }
        }

        let total = results.len();
        let results = dedup_by_key(results, |r| r.item_id.clone());
        if results.len() < total {
            debug!(duplicates = total - results.len(), "Dropped duplicate results");
        }
        Ok(results)
    }

    pub async fn remove(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonlResultStore {
    async fn append(&self, results: &[AnalysisResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for result in results {
            serde_json::to_writer(&mut buffer, result)?;
            buffer.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buffer).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Keeps results in memory
#[derive(Default)]
pub struct MemoryResultSink {
    results: Mutex<Vec<AnalysisResult>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn results(&self) -> Vec<AnalysisResult> {
        self.results.lock().await.clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn append(&self, results: &[AnalysisResult]) -> Result<()> {
        self.results.lock().await.extend_from_slice(results);
        Ok(())
    }
}

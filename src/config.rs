use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::logging::LoggingConfig;
use crate::sampling::SamplingConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root directory for chunks, checkpoints and results
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub schema: RecordSchema,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub analyzer: CollaboratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunking: ChunkingConfig::default(),
            schema: RecordSchema::default(),
            sampling: SamplingConfig::default(),
            scheduler: SchedulerConfig::default(),
            aggregation: AggregationConfig::default(),
            analyzer: CollaboratorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_chunk_bytes == 0 {
            return Err(PipelineError::Config(
                "chunking.target_chunk_bytes must be greater than zero".to_string(),
            ));
        }
        if self.chunking.read_buffer_bytes == 0 {
            return Err(PipelineError::Config(
                "chunking.read_buffer_bytes must be greater than zero".to_string(),
            ));
        }
        if self.schema.message_fields.is_empty() {
            return Err(PipelineError::Config(
                "schema.message_fields must name at least one field".to_string(),
            ));
        }
        self.sampling.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.chunks_dir().join(MANIFEST_FILE_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.chunks_dir().join(INDEX_FILE_NAME)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("progress.json")
    }

    pub fn results_path(&self) -> PathBuf {
        self.data_dir.join("results.jsonl")
    }

    pub fn sample_report_path(&self) -> PathBuf {
        self.data_dir.join("sample_report.json")
    }

    pub fn selection_path(&self) -> PathBuf {
        self.data_dir.join("selected_ids.json")
    }

    pub fn insight_path(&self) -> PathBuf {
        self.data_dir.join("insight.json")
    }
}

pub const MANIFEST_FILE_NAME: &str = "chunk_manifest.json";
pub const INDEX_FILE_NAME: &str = "chunk_index.json";

// ============================================================================
// Chunking
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Upper bound on record payload bytes per chunk file
    #[serde(default = "default_target_chunk_bytes")]
    pub target_chunk_bytes: u64,
    /// Size of each read from the input stream
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
    #[serde(default = "default_chunk_prefix")]
    pub file_prefix: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunk_bytes: default_target_chunk_bytes(),
            read_buffer_bytes: default_read_buffer_bytes(),
            file_prefix: default_chunk_prefix(),
        }
    }
}

impl ChunkingConfig {
    pub fn with_target_mb(mut self, megabytes: u64) -> Self {
        self.target_chunk_bytes = megabytes * 1024 * 1024;
        self
    }
}

// ============================================================================
// Record schema
// ============================================================================

/// Field names used to pull grouping keys and message lists out of raw records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Record-level grouping key candidates, first match wins
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,
    /// Message list candidates, first match wins
    #[serde(default = "default_message_fields")]
    pub message_fields: Vec<String>,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            key_fields: default_key_fields(),
            message_fields: default_message_fields(),
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyPreset {
    Conservative,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum analyzer calls in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Items per durable checkpoint write
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Delay between item starts inside one batch
    #[serde(default)]
    pub item_stagger_ms: u64,
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Assumed analyzer latency, only used for estimates
    #[serde(default = "default_expected_latency_ms")]
    pub expected_latency_ms: u64,
    #[serde(default)]
    pub cost_per_item: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            batch_delay_ms: default_batch_delay_ms(),
            item_stagger_ms: 0,
            item_timeout_secs: default_item_timeout_secs(),
            retry: RetryPolicy::default(),
            expected_latency_ms: default_expected_latency_ms(),
            cost_per_item: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_preset(preset: ConcurrencyPreset) -> Self {
        Self::default().with_preset(preset)
    }

    /// Overwrite the rate-shaping knobs with a preset, keeping everything else
    pub fn with_preset(mut self, preset: ConcurrencyPreset) -> Self {
        let (concurrency, batch_size, batch_delay_ms, item_stagger_ms) = match preset {
            ConcurrencyPreset::Conservative => (2, 5, 2000, 500),
            ConcurrencyPreset::Balanced => (5, 10, 1000, 200),
            ConcurrencyPreset::Aggressive => (10, 20, 250, 0),
        };
        self.concurrency = concurrency;
        self.batch_size = batch_size;
        self.batch_delay_ms = batch_delay_ms;
        self.item_stagger_ms = item_stagger_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 || self.batch_size == 0 || self.checkpoint_interval == 0 {
            return Err(PipelineError::Config(
                "scheduler concurrency, batch_size and checkpoint_interval must be greater than zero"
                    .to_string(),
            ));
        }
        if self.checkpoint_interval < self.batch_size {
            return Err(PipelineError::Config(format!(
                "checkpoint_interval ({}) must not be smaller than batch_size ({})",
                self.checkpoint_interval, self.batch_size
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn item_stagger(&self) -> Duration {
        Duration::from_millis(self.item_stagger_ms)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

// ============================================================================
// Aggregation and collaborators
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub consolidator_url: Option<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            consolidator_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convsift")
}
fn default_target_chunk_bytes() -> u64 { 100 * 1024 * 1024 }
fn default_read_buffer_bytes() -> usize { 64 * 1024 }
fn default_chunk_prefix() -> String { "conversations_chunk".to_string() }
fn default_key_fields() -> Vec<String> {
    ["SenderID", "sender_id", "participant_id", "conversation_id", "id"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_message_fields() -> Vec<String> {
    ["ChatHistory", "chat_history", "messages", "Messages"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_jitter() -> bool { true }
fn default_concurrency() -> usize { 5 }
fn default_batch_size() -> usize { 10 }
fn default_checkpoint_interval() -> usize { 500 }
fn default_batch_delay_ms() -> u64 { 1000 }
fn default_item_timeout_secs() -> u64 { 120 }
fn default_expected_latency_ms() -> u64 { 4000 }
fn default_top_k() -> usize { 10 }
fn default_request_timeout_secs() -> u64 { 120 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.checkpoint_interval, 500);
        assert_eq!(config.chunking.target_chunk_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"scheduler": {"concurrency": 3}}"#).unwrap();
        assert_eq!(config.scheduler.concurrency, 3);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.schema.key_fields[0], "SenderID");
    }

    #[test]
    fn test_preset_overrides_rate_knobs() {
        let config = SchedulerConfig::from_preset(ConcurrencyPreset::Conservative);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.item_stagger_ms, 500);
        assert_eq!(config.checkpoint_interval, 500);
        assert_eq!(
            <ConcurrencyPreset as clap::ValueEnum>::from_str("aggressive", true).unwrap(),
            ConcurrencyPreset::Aggressive
        );
    }

    #[test]
    fn test_rejects_interval_smaller_than_batch() {
        let mut config = SchedulerConfig::default();
        config.checkpoint_interval = 5;
        assert!(config.validate().is_err());
    }
}

//! # convsift
//!
//! Bounded-memory processing of very large conversation dumps.
//!
//! ## Architecture Overview
//!
//! - **Chunking**: streams one huge JSON array into ordered, size-bounded
//!   chunk files and indexes them by grouping key
//! - **Catalog and Sampling**: profiles every work item in one pass and
//!   narrows the set with an auditable sampling strategy
//! - **Scheduler**: checkpointed, concurrency-bounded batch analysis with
//!   retry, resume and a failed-item ledger
//! - **Aggregation**: frequency-ranked consolidation of results, with a local
//!   fallback when no consolidator is available
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use convsift::{Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::new(PipelineConfig::default())?;
//!     let manifest = pipeline.chunk(Path::new("conversations.json")).await?;
//!     println!("{} items in {} chunks", manifest.total_items, manifest.total_chunks);
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod catalog;
pub mod chunking;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod records;
pub mod sampling;
pub mod scheduler;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use aggregation::{export_insight, ExportFormat, ResultAggregator};
pub use catalog::{ItemCatalog, ItemProfile};
pub use chunking::{ChunkIndex, ChunkManifest, StreamingChunker};
pub use collaborators::{Analyzer, Consolidator, HttpAnalyzer, HttpConsolidator};
pub use config::PipelineConfig;
pub use error::{AnalysisError, PipelineError, Result};
pub use pipeline::{Pipeline, PreparedRun, RunMode};
pub use sampling::{DatasetSampler, SamplingStrategy};
pub use scheduler::{BatchScheduler, ProgressStore, RunOutcome, RunState, StopHandle};
pub use types::{AnalysisResult, ConsolidatedInsight, Message, WorkItem};

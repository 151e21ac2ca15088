//! End-to-end wiring of the pipeline stages over one data directory.
//!
//! Layout under `data_dir`:
//!
//! ```text
//! chunks/conversations_chunk_000.json ...   chunk files
//! chunks/chunk_manifest.json                chunk manifest
//! chunks/chunk_index.json                   key -> chunk files
//! sample_report.json, selected_ids.json     last sampling decision
//! progress.json (+ .lock)                   run checkpoint
//! results.jsonl                             analysis results
//! insight.json                              consolidated insight
//! ```

use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::aggregation::ResultAggregator;
use crate::catalog::ItemCatalog;
use crate::chunking::{ChunkIndex, ChunkManifest, IndexBuildReport, StreamingChunker};
use crate::collaborators::{Analyzer, Consolidator, HttpConsolidator};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::logging::OperationTimer;
use crate::sampling::{DatasetSampler, Sample};
use crate::scheduler::{
    estimate, BatchScheduler, JsonlResultStore, ProgressCheckpoint, ProgressStore, RunEstimate,
    RunEvent, RunOutcome, StopHandle,
};
use crate::types::{ConsolidatedInsight, WorkItem};
use crate::utils::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Every selected id not yet completed
    Resume,
    /// Only the failed-id ledger of the stored checkpoint
    RetryFailed,
}

/// A scheduler with its store and id list, ready to execute. Subscribe to
/// events or grab the stop handle before calling [`PreparedRun::execute`].
pub struct PreparedRun {
    scheduler: BatchScheduler,
    store: ProgressStore,
    ids: Vec<String>,
    mode: RunMode,
}

impl PreparedRun {
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.scheduler.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.scheduler.stop_handle()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub async fn execute(mut self) -> Result<RunOutcome> {
        match self.mode {
            RunMode::Resume => self.scheduler.run(&self.ids, &mut self.store).await,
            RunMode::RetryFailed => self.scheduler.retry_failed(&mut self.store).await,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========================================================================
    // Chunking and lookup
    // ========================================================================

    /// Split `input` into the data directory's chunk folder. A previous index
    /// and sample selection are removed since they describe the old chunks.
    pub async fn chunk(&self, input: &Path) -> Result<ChunkManifest> {
        let chunks_dir = self.config.chunks_dir();
        tokio::fs::create_dir_all(&chunks_dir).await?;

        for stale in [
            self.config.index_path(),
            self.config.selection_path(),
            self.config.sample_report_path(),
        ] {
            if tokio::fs::try_exists(&stale).await? {
                tokio::fs::remove_file(&stale).await?;
            }
        }

        StreamingChunker::new(self.config.chunking.clone())
            .chunk_file(input, &chunks_dir)
            .await
    }

    /// The persisted manifest, or one built from chunk files placed in the
    /// chunk folder by hand
    pub async fn manifest(&self) -> Result<ChunkManifest> {
        let manifest_path = self.config.manifest_path();
        if tokio::fs::try_exists(&manifest_path).await? {
            return ChunkManifest::load(&manifest_path).await;
        }

        let chunks_dir = self.config.chunks_dir();
        if !tokio::fs::try_exists(&chunks_dir).await? {
            return Err(PipelineError::Config(format!(
                "no chunks in {}; run the chunk command first",
                chunks_dir.display()
            )));
        }
        info!("No manifest found, scanning {}", chunks_dir.display());
        let prefix = self.config.chunking.file_prefix.clone();
        let block_size = self.config.chunking.read_buffer_bytes;
        let dir = chunks_dir.clone();
        let manifest =
            tokio::task::spawn_blocking(move || ChunkManifest::from_dir(&dir, &prefix, block_size))
                .await??;
        manifest.save(&manifest_path).await?;
        Ok(manifest)
    }

    /// The persisted index, built on first use
    pub async fn index(&self) -> Result<ChunkIndex> {
        let manifest = self.manifest().await?;
        ChunkIndex::load_or_build(
            &self.config.index_path(),
            &self.config.chunks_dir(),
            &manifest,
            &self.config.schema,
        )
        .await
    }

    pub async fn rebuild_index(&self) -> Result<(ChunkIndex, IndexBuildReport)> {
        let manifest = self.manifest().await?;
        ChunkIndex::rebuild(
            &self.config.index_path(),
            &self.config.chunks_dir(),
            &manifest,
            &self.config.schema,
        )
        .await
    }

    /// The chunk file holding `key` and the work item assembled from it
    pub async fn lookup(&self, key: &str) -> Result<Option<(String, WorkItem)>> {
        let index = self.index().await?;
        let Some(file_name) = index.lookup(key).map(str::to_string) else {
            return Ok(None);
        };
        Ok(index.load_item(key).await?.map(|item| (file_name, item)))
    }

    // ========================================================================
    // Catalog and sampling
    // ========================================================================

    pub async fn catalog(&self) -> Result<ItemCatalog> {
        let manifest = self.manifest().await?;
        let _timer = OperationTimer::start("cataloguing");
        ItemCatalog::build_async(
            &self.config.chunks_dir(),
            &manifest,
            &self.config.schema,
            &self.config.sampling.designated_role,
        )
        .await
    }

    /// Sample the catalog and persist the report and selected ids
    pub async fn sample(&self) -> Result<Sample> {
        let catalog = self.catalog().await?;
        let sample = DatasetSampler::new(self.config.sampling.clone()).sample(catalog.profiles());

        write_atomic(
            &self.config.sample_report_path(),
            &serde_json::to_vec_pretty(&sample.report)?,
        )
        .await?;
        write_atomic(
            &self.config.selection_path(),
            &serde_json::to_vec_pretty(&sample.ids)?,
        )
        .await?;
        Ok(sample)
    }

    /// The persisted selection if there is one, otherwise every catalogued id
    pub async fn work_ids(&self) -> Result<Vec<String>> {
        let selection_path = self.config.selection_path();
        if tokio::fs::try_exists(&selection_path).await? {
            let content = tokio::fs::read(&selection_path).await?;
            let ids: Vec<String> = serde_json::from_slice(&content)?;
            info!(items = ids.len(), "Using sampled selection");
            return Ok(ids);
        }
        Ok(self.catalog().await?.ids())
    }

    // ========================================================================
    // Runs
    // ========================================================================

    pub fn open_progress(&self, force_unlock: bool) -> Result<ProgressStore> {
        let checkpoint_path = self.config.checkpoint_path();
        if force_unlock {
            ProgressStore::break_lock(&checkpoint_path)?;
        }
        ProgressStore::open(&checkpoint_path)
    }

    /// Take the progress lock and wire a scheduler over the chunk index and
    /// the results log. Starting without a checkpoint discards old results.
    pub async fn prepare_run(
        &self,
        analyzer: Arc<dyn Analyzer>,
        mode: RunMode,
        force_unlock: bool,
    ) -> Result<PreparedRun> {
        let store = self.open_progress(force_unlock)?;
        let existing = store.load().await?;

        let results_path = self.config.results_path();
        let ids = match (mode, &existing) {
            (RunMode::RetryFailed, None) => {
                return Err(PipelineError::Checkpoint(
                    "no checkpoint to retry failed items from".to_string(),
                ))
            }
            (RunMode::RetryFailed, Some(checkpoint)) => checkpoint.failed_ids(),
            (RunMode::Resume, None) => {
                if tokio::fs::try_exists(&results_path).await? {
                    warn!("Starting a fresh run, removing {}", results_path.display());
                    JsonlResultStore::remove(&results_path).await?;
                }
                self.work_ids().await?
            }
            (RunMode::Resume, Some(_)) => self.work_ids().await?,
        };

        let index = Arc::new(self.index().await?);
        let sink = Arc::new(JsonlResultStore::open(&results_path).await?);
        let scheduler = BatchScheduler::new(self.config.scheduler.clone(), analyzer, index, sink);

        Ok(PreparedRun {
            scheduler,
            store,
            ids,
            mode,
        })
    }

    /// Checkpoint of the current or last interrupted run, read without locking
    pub async fn status(&self) -> Result<Option<ProgressCheckpoint>> {
        ProgressStore::read(&self.config.checkpoint_path()).await
    }

    pub async fn estimate(&self) -> Result<RunEstimate> {
        let ids = self.work_ids().await?;
        Ok(estimate(&self.config.scheduler, ids.len()))
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    pub fn consolidator(&self) -> Result<Option<Arc<dyn Consolidator>>> {
        match &self.config.aggregation.consolidator_url {
            Some(url) => Ok(Some(Arc::new(HttpConsolidator::new(
                url,
                self.config.analyzer.api_key.clone(),
                self.config.analyzer.request_timeout_secs,
            )?))),
            None => Ok(None),
        }
    }

    /// Consolidate every stored result and persist the insight
    pub async fn aggregate(&self) -> Result<ConsolidatedInsight> {
        let results = JsonlResultStore::load(&self.config.results_path()).await?;
        info!(results = results.len(), "Aggregating analysis results");

        let mut aggregator = ResultAggregator::new(self.config.aggregation.top_k);
        if let Some(consolidator) = self.consolidator()? {
            aggregator = aggregator.with_consolidator(consolidator);
        }
        let insight = aggregator.aggregate(&results).await;

        write_atomic(
            &self.config.insight_path(),
            &serde_json::to_vec_pretty(&insight)?,
        )
        .await?;
        Ok(insight)
    }
}

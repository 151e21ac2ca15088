//! Checkpointed, concurrency-bounded batch processing.
//!
//! Ids are processed in checkpoint units (default 500 items). Each unit is
//! split into batches; every batch runs on a fresh `JoinSet` gated by a
//! semaphore. Results are appended to the [`ResultSink`] before their ids are
//! marked complete, and the checkpoint is only written at unit boundaries.

pub mod progress;
pub mod results;
pub mod retry;
pub mod source;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::Analyzer;
use crate::config::SchedulerConfig;
use crate::error::{AnalysisError, PipelineError, Result};
use crate::types::AnalysisResult;

pub use progress::{FailedItem, ProgressCheckpoint, ProgressStore, RunTotals};
pub use results::{JsonlResultStore, MemoryResultSink, ResultSink};
pub use retry::{backoff_delay, retry_with_backoff};
pub use source::{InMemorySource, WorkItemSource};

// ============================================================================
// Run State and Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    NotStarted,
    Running { unit: usize, of: usize },
    Completed,
    Aborted { unit: usize, reason: String },
    Stopped { after_unit: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        total_items: usize,
        to_process: usize,
        units: usize,
    },
    UnitStarted {
        unit: usize,
        of: usize,
        items: usize,
    },
    UnitCompleted {
        unit: usize,
        of: usize,
        totals: RunTotals,
    },
    UnitAborted {
        unit: usize,
        reason: String,
        totals: RunTotals,
    },
    ItemFailed {
        id: String,
        error: String,
        attempts: u32,
    },
    Stopped {
        after_unit: usize,
        totals: RunTotals,
    },
    Completed {
        totals: RunTotals,
    },
}

/// Cooperative stop request, honoured at unit boundaries
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    should_stop: Arc<RwLock<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request_stop(&self) {
        *self.should_stop.write().await = true;
    }

    pub async fn is_stop_requested(&self) -> bool {
        *self.should_stop.read().await
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub totals: RunTotals,
    pub results_written: usize,
    pub checkpoint: ProgressCheckpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEstimate {
    pub items: usize,
    pub batches: usize,
    pub units: usize,
    pub estimated_secs: u64,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
}

impl RunEstimate {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.estimated_secs)
    }
}

// ============================================================================
// Batch Scheduler
// ============================================================================

struct ItemOutcome {
    id: String,
    result: std::result::Result<AnalysisResult, AnalysisError>,
    attempts: u32,
}

#[derive(Default)]
struct BatchOutcome {
    outcomes: Vec<ItemOutcome>,
    /// First pipeline-level failure seen in the batch
    abort: Option<String>,
}

pub struct BatchScheduler {
    config: SchedulerConfig,
    analyzer: Arc<dyn Analyzer>,
    source: Arc<dyn WorkItemSource>,
    sink: Arc<dyn ResultSink>,
    event_sender: broadcast::Sender<RunEvent>,
    state: Arc<RwLock<RunState>>,
    stop: StopHandle,
}

impl BatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        analyzer: Arc<dyn Analyzer>,
        source: Arc<dyn WorkItemSource>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            config,
            analyzer,
            source,
            sink,
            event_sender,
            state: Arc::new(RwLock::new(RunState::NotStarted)),
            stop: StopHandle::new(),
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_sender.subscribe()
    }

    pub async fn state(&self) -> RunState {
        self.state.read().await.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    async fn set_state(&self, state: RunState) {
        *self.state.write().await = state;
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Process every id not yet completed in the stored checkpoint, keeping
    /// the given order. Previously failed ids are attempted again.
    pub async fn run(&self, ids: &[String], store: &mut ProgressStore) -> Result<RunOutcome> {
        let mut checkpoint = match store.load().await? {
            Some(checkpoint) => {
                info!(
                    run_id = %checkpoint.run_id,
                    completed = checkpoint.completed_count(),
                    failed = checkpoint.failed.len(),
                    "Resuming from checkpoint"
                );
                checkpoint
            }
            None => ProgressCheckpoint::new(ids.len()),
        };

        let todo: Vec<String> = checkpoint.remaining(ids).into_iter().cloned().collect();
        checkpoint.refresh_totals(ids.len());
        self.process(todo, ids.len(), checkpoint, store).await
    }

    /// Process only the failed-id ledger of the stored checkpoint
    pub async fn retry_failed(&self, store: &mut ProgressStore) -> Result<RunOutcome> {
        let Some(mut checkpoint) = store.load().await? else {
            return Err(PipelineError::Checkpoint(
                "no checkpoint to retry failed items from".to_string(),
            ));
        };

        let todo = checkpoint.failed_ids();
        let total_items = checkpoint.totals.total_items.max(checkpoint.completed_count() + todo.len());
        info!(failed = todo.len(), "Retrying failed items");
        checkpoint.refresh_totals(total_items);
        self.process(todo, total_items, checkpoint, store).await
    }

    async fn process(
        &self,
        todo: Vec<String>,
        total_items: usize,
        mut checkpoint: ProgressCheckpoint,
        store: &mut ProgressStore,
    ) -> Result<RunOutcome> {
        let units: Vec<&[String]> = todo.chunks(self.config.checkpoint_interval).collect();
        let unit_count = units.len();
        let mut results_written = 0usize;

        info!(
            run_id = %checkpoint.run_id,
            to_process = todo.len(),
            units = unit_count,
            concurrency = self.config.concurrency,
            "Starting run"
        );
        self.emit(RunEvent::RunStarted {
            run_id: checkpoint.run_id,
            total_items,
            to_process: todo.len(),
            units: unit_count,
        });

        for (unit, ids) in units.into_iter().enumerate() {
            if self.stop.is_stop_requested().await {
                checkpoint.refresh_totals(total_items);
                store.save(&checkpoint).await?;
                warn!(after_unit = unit, "Stop requested, checkpoint kept");
                self.set_state(RunState::Stopped { after_unit: unit }).await;
                self.emit(RunEvent::Stopped {
                    after_unit: unit,
                    totals: checkpoint.totals,
                });
                return Ok(RunOutcome {
                    state: RunState::Stopped { after_unit: unit },
                    totals: checkpoint.totals,
                    results_written,
                    checkpoint,
                });
            }

            if unit > 0 && !self.config.batch_delay().is_zero() {
                sleep(self.config.batch_delay()).await;
            }

            self.set_state(RunState::Running {
                unit,
                of: unit_count,
            })
            .await;
            self.emit(RunEvent::UnitStarted {
                unit,
                of: unit_count,
                items: ids.len(),
            });

            let unit_result = self.run_unit(ids, &mut checkpoint, &mut results_written).await;
            checkpoint.refresh_totals(total_items);

            match unit_result {
                Ok(()) => {
                    checkpoint.units_completed += 1;
                    store.save(&checkpoint).await?;
                    info!(
                        "Unit {}/{} done: {}",
                        unit + 1,
                        unit_count,
                        checkpoint.totals
                    );
                    self.emit(RunEvent::UnitCompleted {
                        unit,
                        of: unit_count,
                        totals: checkpoint.totals,
                    });
                }
                Err(reason) => {
                    store.save(&checkpoint).await?;
                    error!(unit, "Unit aborted: {} ({})", reason, checkpoint.totals);
                    self.set_state(RunState::Aborted {
                        unit,
                        reason: reason.clone(),
                    })
                    .await;
                    self.emit(RunEvent::UnitAborted {
                        unit,
                        reason: reason.clone(),
                        totals: checkpoint.totals,
                    });
                    return Err(PipelineError::CheckpointUnitAbort {
                        unit,
                        reason,
                        totals: checkpoint.totals,
                    });
                }
            }
        }

        checkpoint.refresh_totals(total_items);
        if checkpoint.failed.is_empty() {
            store.clear().await?;
        } else {
            warn!(
                failed = checkpoint.failed.len(),
                "Run finished with failures; checkpoint kept for retry"
            );
            store.save(&checkpoint).await?;
        }

        info!("Run completed: {}", checkpoint.totals);
        self.set_state(RunState::Completed).await;
        self.emit(RunEvent::Completed {
            totals: checkpoint.totals,
        });

        Ok(RunOutcome {
            state: RunState::Completed,
            totals: checkpoint.totals,
            results_written,
            checkpoint,
        })
    }

    /// Run one checkpoint unit. Item failures are recorded in the checkpoint;
    /// the error string is a pipeline-level failure that aborts the unit.
    async fn run_unit(
        &self,
        ids: &[String],
        checkpoint: &mut ProgressCheckpoint,
        results_written: &mut usize,
    ) -> std::result::Result<(), String> {
        for (batch_number, batch) in ids.chunks(self.config.batch_size).enumerate() {
            if batch_number > 0 && !self.config.batch_delay().is_zero() {
                sleep(self.config.batch_delay()).await;
            }
            debug!(batch = batch_number, size = batch.len(), "Starting batch");

            let outcome = self.run_batch(batch).await;

            let mut successes = Vec::new();
            let mut failures = Vec::new();
            for item in outcome.outcomes {
                match item.result {
                    Ok(mut result) => {
                        result.item_id = item.id;
                        successes.push(result);
                    }
                    Err(e) => failures.push((item.id, e, item.attempts)),
                }
            }

            self.sink
                .append(&successes)
                .await
                .map_err(|e| format!("failed to persist results: {}", e))?;
            *results_written += successes.len();
            for result in &successes {
                checkpoint.mark_completed(&result.item_id);
            }

            for (id, e, attempts) in failures {
                warn!(item = %id, attempts, "Item failed: {}", e);
                checkpoint.record_failure(&id, e.to_string(), attempts);
                self.emit(RunEvent::ItemFailed {
                    id,
                    error: e.to_string(),
                    attempts,
                });
            }

            if let Some(reason) = outcome.abort {
                return Err(reason);
            }
        }
        Ok(())
    }

    async fn run_batch(&self, batch: &[String]) -> BatchOutcome {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();

        for (position, id) in batch.iter().enumerate() {
            let semaphore = semaphore.clone();
            let analyzer = self.analyzer.clone();
            let source = self.source.clone();
            let id = id.clone();
            let stagger = self.config.item_stagger() * position as u32;
            let item_timeout = self.config.item_timeout();
            let retry_policy = self.config.retry.clone();

            tasks.spawn(async move {
                if !stagger.is_zero() {
                    sleep(stagger).await;
                }
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?;

                let item = source.fetch(&id).await?;
                let label = format!("analysis of {}", id);
                let (analyzer, item) = (&analyzer, &item);
                let (result, attempts) = retry_with_backoff(
                    || async move {
                        match timeout(item_timeout, analyzer.analyze(item)).await {
                            Ok(result) => result,
                            Err(_) => Err(AnalysisError::Retryable(format!(
                                "analysis timed out after {:?}",
                                item_timeout
                            ))),
                        }
                    },
                    &retry_policy,
                    &label,
                )
                .await;

                Ok::<ItemOutcome, PipelineError>(ItemOutcome {
                    id,
                    result,
                    attempts,
                })
            });
        }

        let mut outcome = BatchOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(item)) => outcome.outcomes.push(item),
                Ok(Err(e)) => {
                    outcome.abort.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    outcome
                        .abort
                        .get_or_insert_with(|| format!("analysis task panicked: {}", e));
                }
            }
        }
        outcome
    }

    /// Wall-clock and cost estimate for processing `item_count` items
    pub fn estimate(&self, item_count: usize) -> RunEstimate {
        estimate(&self.config, item_count)
    }
}

pub fn estimate(config: &SchedulerConfig, item_count: usize) -> RunEstimate {
    let batch_size = config.batch_size.max(1);
    let batches = item_count.div_ceil(batch_size);
    let units = item_count.div_ceil(config.checkpoint_interval.max(1));

    let per_batch_items = batch_size.min(item_count.max(1));
    let waves = per_batch_items.div_ceil(config.concurrency.max(1)) as u64;
    let per_batch_ms = waves * config.expected_latency_ms
        + config.item_stagger_ms * per_batch_items.saturating_sub(1) as u64;
    let total_ms = batches as u64 * per_batch_ms
        + batches.saturating_sub(1) as u64 * config.batch_delay_ms;

    RunEstimate {
        items: item_count,
        batches,
        units,
        estimated_secs: total_ms.div_ceil(1000),
        estimated_cost: config.cost_per_item.map(|cost| cost * item_count as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_counts_batches_and_delays() {
        let config = SchedulerConfig {
            concurrency: 5,
            batch_size: 10,
            checkpoint_interval: 500,
            batch_delay_ms: 1000,
            item_stagger_ms: 0,
            expected_latency_ms: 2000,
            cost_per_item: Some(0.01),
            ..SchedulerConfig::default()
        };
        let estimate = estimate(&config, 1000);
        assert_eq!(estimate.batches, 100);
        assert_eq!(estimate.units, 2);
        // 100 batches * 2 waves * 2s + 99 delays * 1s
        assert_eq!(estimate.estimated_secs, 499);
        assert!((estimate.estimated_cost.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_empty() {
        let estimate = estimate(&SchedulerConfig::default(), 0);
        assert_eq!(estimate.batches, 0);
        assert_eq!(estimate.estimated_secs, 0);
        assert_eq!(estimate.estimated_cost, None);
    }

    #[tokio::test]
    async fn test_stop_handle() {
        let stop = StopHandle::new();
        let clone = stop.clone();
        assert!(!stop.is_stop_requested().await);
        clone.request_stop().await;
        assert!(stop.is_stop_requested().await);
    }
}

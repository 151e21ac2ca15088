mod common;

use common::*;
use convsift::error::{AnalysisError, PipelineError};
use convsift::scheduler::{
    BatchScheduler, InMemorySource, JsonlResultStore, MemoryResultSink, ProgressStore, RunEvent,
    RunState,
};
use std::sync::Arc;
use tempfile::TempDir;

fn scheduler(
    analyzer: Arc<ScriptedAnalyzer>,
    ids: &[String],
    sink: Arc<dyn convsift::scheduler::ResultSink>,
    batch_size: usize,
    checkpoint_interval: usize,
) -> BatchScheduler {
    BatchScheduler::new(
        fast_scheduler(batch_size, checkpoint_interval),
        analyzer,
        Arc::new(InMemorySource::from_items(work_items(ids))),
        sink,
    )
}

#[tokio::test]
async fn test_kill_after_first_unit_then_resume() {
    let dir = TempDir::new().unwrap();
    let checkpoint_path = dir.path().join("progress.json");
    let results_path = dir.path().join("results.jsonl");
    let ids = ids(1000);

    // First run, killed once unit 0 is checkpointed
    {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let sink = Arc::new(JsonlResultStore::open(&results_path).await.unwrap());
        let scheduler = scheduler(analyzer, &ids, sink, 10, 500);
        let mut events = scheduler.subscribe();
        let mut store = ProgressStore::open(&checkpoint_path).unwrap();

        let run = scheduler.run(&ids, &mut store);
        tokio::pin!(run);
        loop {
            tokio::select! {
                outcome = &mut run => panic!("run finished before it was killed: {:?}", outcome.map(|o| o.totals)),
                event = events.recv() => {
                    if let Ok(RunEvent::UnitCompleted { unit: 0, .. }) = event {
                        break;
                    }
                }
            }
        }
    }

    let persisted = ProgressStore::read(&checkpoint_path).await.unwrap().unwrap();
    assert_eq!(persisted.completed_count(), 500);
    let mut completed = persisted.completed_ids.clone();
    completed.sort();
    assert_eq!(completed, ids[..500].to_vec());
    assert_eq!(persisted.units_completed, 1);

    // Restart
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let sink = Arc::new(JsonlResultStore::open(&results_path).await.unwrap());
    let scheduler = scheduler(analyzer.clone(), &ids, sink, 10, 500);
    let mut store = ProgressStore::open(&checkpoint_path).unwrap();
    let outcome = scheduler.run(&ids, &mut store).await.unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.totals.completed, 1000);
    assert_eq!(outcome.totals.remaining, 0);
    assert_eq!(analyzer.total_calls(), 500);
    assert_eq!(analyzer.calls_for("item-0000"), 0);
    assert_eq!(analyzer.calls_for("item-0999"), 1);

    // Completed without failures: checkpoint cleared
    assert!(store.load().await.unwrap().is_none());

    let results = JsonlResultStore::load(&results_path).await.unwrap();
    assert_eq!(results.len(), 1000);
}

#[tokio::test]
async fn test_retryable_error_twice_then_success() {
    let ids = ids(100);
    let analyzer = Arc::new(ScriptedAnalyzer::new().fail_first(
        "item-0042",
        2,
        AnalysisError::Retryable("analysis timed out".into()),
    ));
    let sink = Arc::new(MemoryResultSink::new());
    let dir = TempDir::new().unwrap();
    let mut store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();

    let outcome = scheduler(analyzer.clone(), &ids, sink.clone(), 10, 50)
        .run(&ids, &mut store)
        .await
        .unwrap();

    assert_eq!(analyzer.calls_for("item-0042"), 3);
    let results = sink.results().await;
    assert_eq!(results.iter().filter(|r| r.item_id == "item-0042").count(), 1);
    assert_eq!(results.len(), 100);
    assert!(outcome.checkpoint.failed.is_empty());
}

#[tokio::test]
async fn test_never_succeeding_item_lands_in_ledger_once() {
    let ids = ids(100);
    let analyzer = Arc::new(ScriptedAnalyzer::new().fail_always(
        "item-0042",
        AnalysisError::Retryable("analysis timed out".into()),
    ));
    let sink = Arc::new(MemoryResultSink::new());
    let dir = TempDir::new().unwrap();
    let checkpoint_path = dir.path().join("progress.json");
    let mut store = ProgressStore::open(&checkpoint_path).unwrap();

    let outcome = scheduler(analyzer.clone(), &ids, sink.clone(), 10, 50)
        .run(&ids, &mut store)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(analyzer.calls_for("item-0042"), 3);
    assert_eq!(outcome.totals.completed, 99);
    assert_eq!(outcome.totals.failed, 1);

    let results = sink.results().await;
    assert_eq!(results.iter().filter(|r| r.item_id == "item-0042").count(), 0);

    // Failures keep the checkpoint around for retry-failed
    let persisted = ProgressStore::read(&checkpoint_path).await.unwrap().unwrap();
    let ledger: Vec<_> = persisted.failed.iter().filter(|f| f.id == "item-0042").collect();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].attempts, 3);
}

#[tokio::test]
async fn test_non_retryable_is_not_retried() {
    let ids = ids(10);
    let analyzer = Arc::new(ScriptedAnalyzer::new().fail_always(
        "item-0003",
        AnalysisError::NonRetryable("422: unprocessable".into()),
    ));
    let dir = TempDir::new().unwrap();
    let mut store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();

    let outcome = scheduler(analyzer.clone(), &ids, Arc::new(MemoryResultSink::new()), 5, 10)
        .run(&ids, &mut store)
        .await
        .unwrap();

    assert_eq!(analyzer.calls_for("item-0003"), 1);
    assert_eq!(outcome.checkpoint.failed[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_analyzer_times_out_and_is_retried() {
    use async_trait::async_trait;
    use convsift::types::{AnalysisResult, WorkItem};
    use convsift::Analyzer;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct SlowThenFast {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for SlowThenFast {
        async fn analyze(&self, item: &WorkItem) -> Result<AnalysisResult, AnalysisError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(AnalysisResult::new(item.id.clone()))
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    let ids = vec!["42".to_string()];
    let analyzer = Arc::new(SlowThenFast {
        calls: AtomicU32::new(0),
    });
    let sink = Arc::new(MemoryResultSink::new());
    let mut config = fast_scheduler(1, 1);
    config.item_timeout_secs = 1;
    let scheduler = BatchScheduler::new(
        config,
        analyzer.clone(),
        Arc::new(InMemorySource::from_items(work_items(&ids))),
        sink.clone(),
    );

    let dir = TempDir::new().unwrap();
    let mut store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();
    let outcome = scheduler.run(&ids, &mut store).await.unwrap();

    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.totals.completed, 1);
    assert_eq!(sink.results().await.len(), 1);
}

#[tokio::test]
async fn test_retry_failed_only_touches_ledger() {
    let dir = TempDir::new().unwrap();
    let checkpoint_path = dir.path().join("progress.json");
    let ids = ids(30);

    let first = Arc::new(
        ScriptedAnalyzer::new()
            .fail_always("item-0007", AnalysisError::NonRetryable("bad gateway".into()))
            .fail_always("item-0021", AnalysisError::NonRetryable("bad gateway".into())),
    );
    let mut store = ProgressStore::open(&checkpoint_path).unwrap();
    let outcome = scheduler(first, &ids, Arc::new(MemoryResultSink::new()), 5, 10)
        .run(&ids, &mut store)
        .await
        .unwrap();
    assert_eq!(outcome.totals.failed, 2);

    let second = Arc::new(ScriptedAnalyzer::new());
    let sink = Arc::new(MemoryResultSink::new());
    let outcome = scheduler(second.clone(), &ids, sink.clone(), 5, 10)
        .retry_failed(&mut store)
        .await
        .unwrap();

    assert_eq!(second.total_calls(), 2);
    assert_eq!(second.calls_for("item-0007"), 1);
    assert_eq!(second.calls_for("item-0021"), 1);
    assert_eq!(outcome.totals.completed, 30);
    assert_eq!(outcome.totals.failed, 0);
    assert_eq!(sink.results().await.len(), 2);
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_failed_without_checkpoint_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();
    let result = scheduler(
        Arc::new(ScriptedAnalyzer::new()),
        &[],
        Arc::new(MemoryResultSink::new()),
        5,
        10,
    )
    .retry_failed(&mut store)
    .await;
    assert!(matches!(result, Err(PipelineError::Checkpoint(_))));
}

#[tokio::test]
async fn test_missing_item_aborts_unit_and_keeps_progress() {
    let dir = TempDir::new().unwrap();
    let checkpoint_path = dir.path().join("progress.json");
    let ids = ids(20);

    // The source knows every id except item-0013
    let known: Vec<String> = ids.iter().filter(|id| *id != "item-0013").cloned().collect();
    let scheduler = BatchScheduler::new(
        fast_scheduler(5, 10),
        Arc::new(ScriptedAnalyzer::new()),
        Arc::new(InMemorySource::from_items(work_items(&known))),
        Arc::new(MemoryResultSink::new()),
    );
    let mut store = ProgressStore::open(&checkpoint_path).unwrap();

    let error = scheduler.run(&ids, &mut store).await.unwrap_err();
    match error {
        PipelineError::CheckpointUnitAbort { unit, totals, .. } => {
            assert_eq!(unit, 1);
            // Unit 0 plus the four durable results of the aborted batch
            assert_eq!(totals.completed, 14);
            assert_eq!(totals.total_items, 20);
        }
        other => panic!("expected unit abort, got {}", other),
    }
    assert!(matches!(scheduler.state().await, RunState::Aborted { unit: 1, .. }));

    let persisted = ProgressStore::read(&checkpoint_path).await.unwrap().unwrap();
    assert_eq!(persisted.completed_count(), 14);
    assert!(!persisted.is_completed("item-0013"));
    assert!(!persisted.is_completed("item-0015"));
}

#[tokio::test]
async fn test_stop_is_honoured_at_unit_boundary() {
    let dir = TempDir::new().unwrap();
    let ids = ids(30);
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let scheduler = scheduler(analyzer.clone(), &ids, Arc::new(MemoryResultSink::new()), 5, 10);
    let stop = scheduler.stop_handle();
    let mut events = scheduler.subscribe();
    let mut store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();

    let outcome = {
        let run = scheduler.run(&ids, &mut store);
        tokio::pin!(run);
        loop {
            tokio::select! {
                outcome = &mut run => break outcome.unwrap(),
                event = events.recv() => {
                    if let Ok(RunEvent::UnitStarted { unit: 0, .. }) = event {
                        stop.request_stop().await;
                    }
                }
            }
        }
    };

    assert_eq!(outcome.state, RunState::Stopped { after_unit: 1 });
    assert_eq!(outcome.totals.completed, 10);
    assert_eq!(outcome.totals.remaining, 20);
    assert_eq!(analyzer.total_calls(), 10);
    assert!(store.load().await.unwrap().is_some());
}

#[tokio::test]
async fn test_second_run_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.json");
    let _first = ProgressStore::open(&path).unwrap();
    assert!(matches!(ProgressStore::open(&path), Err(PipelineError::Locked(_))));
}

#[tokio::test]
async fn test_in_flight_calls_never_exceed_concurrency() {
    use async_trait::async_trait;
    use convsift::types::{AnalysisResult, WorkItem};
    use convsift::Analyzer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct PeakTracking {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Analyzer for PeakTracking {
        async fn analyze(&self, item: &WorkItem) -> Result<AnalysisResult, AnalysisError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AnalysisResult::new(item.id.clone()))
        }

        fn name(&self) -> &str {
            "peak"
        }
    }

    let ids = ids(30);
    let analyzer = Arc::new(PeakTracking::default());
    let mut config = fast_scheduler(10, 30);
    config.concurrency = 2;
    let scheduler = BatchScheduler::new(
        config,
        analyzer.clone(),
        Arc::new(InMemorySource::from_items(work_items(&ids))),
        Arc::new(MemoryResultSink::new()),
    );

    let dir = TempDir::new().unwrap();
    let mut store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();
    let outcome = scheduler.run(&ids, &mut store).await.unwrap();

    assert_eq!(outcome.totals.completed, 30);
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 30);
    let peak = analyzer.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak in-flight was {}", peak);
    assert_eq!(peak, 2);
}

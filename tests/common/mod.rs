//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use convsift::config::{ChunkingConfig, RetryPolicy, SchedulerConfig};
use convsift::error::{AnalysisError, PipelineError, Result};
use convsift::types::{AnalysisResult, ConsolidatedInsight, Message, WorkItem};
use convsift::{Analyzer, Consolidator, PipelineConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Creates a test configuration rooted at `data_dir` with tiny chunks and no
/// pacing delays
pub fn test_config(data_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.chunking = ChunkingConfig {
        target_chunk_bytes: 2048,
        read_buffer_bytes: 512,
        file_prefix: "conversations_chunk".to_string(),
    };
    config.scheduler = fast_scheduler(10, 50);
    config
}

pub fn fast_scheduler(batch_size: usize, checkpoint_interval: usize) -> SchedulerConfig {
    SchedulerConfig {
        concurrency: 4,
        batch_size,
        checkpoint_interval,
        batch_delay_ms: 0,
        item_stagger_ms: 0,
        item_timeout_secs: 5,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..SchedulerConfig::default()
    }
}

/// One raw export record: a sender and its chat history
pub fn conversation_record(sender: &str, messages: usize) -> Value {
    let history: Vec<Value> = (0..messages)
        .map(|i| {
            json!({
                "Role": if i % 2 == 0 { "user" } else { "assistant" },
                "Message": format!("message {} from {} {{with braces}}", i, sender),
                "Timestamp": format!("2024-03-01 10:{:02}:00", i % 60),
            })
        })
        .collect();
    json!({ "SenderID": sender, "ChatHistory": history })
}

/// `count` records, record `i` holding `i % 7 + 1` messages
pub fn sample_records(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| conversation_record(&format!("sender-{:04}", i), i % 7 + 1))
        .collect()
}

/// Writes the records as one top-level JSON array
pub fn write_dump(dir: &Path, records: &[Value]) -> PathBuf {
    let path = dir.join("dump.json");
    std::fs::write(&path, serde_json::to_vec(records).unwrap()).unwrap();
    path
}

pub fn ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("item-{:04}", i)).collect()
}

pub fn work_items(ids: &[String]) -> Vec<WorkItem> {
    ids.iter()
        .map(|id| {
            let mut item = WorkItem::new(id.clone());
            item.messages.push(Message::new("user", "hello"));
            item
        })
        .collect()
}

/// Analyzer that succeeds unless scripted otherwise, counting calls per id
#[derive(Default)]
pub struct ScriptedAnalyzer {
    /// id -> number of initial calls that fail with the given error
    failures: HashMap<String, (u32, AnalysisError)>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_first(mut self, id: &str, times: u32, error: AnalysisError) -> Self {
        self.failures.insert(id.to_string(), (times, error));
        self
    }

    pub fn fail_always(self, id: &str, error: AnalysisError) -> Self {
        self.fail_first(id, u32::MAX, error)
    }

    pub fn calls_for(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn distinct_items(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, item: &WorkItem) -> std::result::Result<AnalysisResult, AnalysisError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(item.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some((times, error)) = self.failures.get(&item.id) {
            if call <= *times {
                return Err(error.clone());
            }
        }
        Ok(result_for(&item.id))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Deterministic result: every result shares one issue, even ids add a second
pub fn result_for(id: &str) -> AnalysisResult {
    let mut result = AnalysisResult::new(id);
    result.issues.push("slow response".to_string());
    let numeric: usize = id
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    if numeric % 2 == 0 {
        result.issues.push("missing refund".to_string());
        result.sentiment = Some("negative".to_string());
    } else {
        result.sentiment = Some("positive".to_string());
    }
    result.recommendations.push("reply faster".to_string());
    result.scores.insert("quality".to_string(), (numeric % 5) as f64);
    result
}

pub struct FailingConsolidator;

#[async_trait]
impl Consolidator for FailingConsolidator {
    async fn consolidate(&self, _results: &[AnalysisResult]) -> Result<ConsolidatedInsight> {
        Err(PipelineError::ConsolidationUnavailable(
            "connection refused".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

mod common;

use common::*;
use convsift::catalog::ItemCatalog;
use convsift::chunking::{ChunkIndex, StreamingChunker};
use convsift::config::{ChunkingConfig, RecordSchema};
use convsift::error::PipelineError;
use convsift::scheduler::WorkItemSource;
use serde_json::json;
use tempfile::TempDir;

fn chunk_sample(dir: &std::path::Path, count: usize) -> convsift::ChunkManifest {
    let input = write_dump(dir, &sample_records(count));
    StreamingChunker::new(ChunkingConfig {
        target_chunk_bytes: 1024,
        read_buffer_bytes: 256,
        file_prefix: "conversations_chunk".to_string(),
    })
    .chunk_path(&input, &dir.join("chunks"))
    .unwrap()
}

#[tokio::test]
async fn test_rebuild_twice_is_identical() {
    let dir = TempDir::new().unwrap();
    let manifest = chunk_sample(dir.path(), 80);
    let chunks = dir.path().join("chunks");
    let index_path = chunks.join("chunk_index.json");
    let schema = RecordSchema::default();

    let (first, report) = ChunkIndex::rebuild(&index_path, &chunks, &manifest, &schema).await.unwrap();
    let first_bytes = std::fs::read(&index_path).unwrap();
    let (second, _) = ChunkIndex::rebuild(&index_path, &chunks, &manifest, &schema).await.unwrap();
    let second_bytes = std::fs::read(&index_path).unwrap();

    assert_eq!(first.entries(), second.entries());
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(report.keys, 80);
    assert_eq!(report.spanning_keys, 0);
    assert_eq!(report.chunks_scanned, manifest.total_chunks);
}

#[tokio::test]
async fn test_lookup_and_lazy_load() {
    let dir = TempDir::new().unwrap();
    let manifest = chunk_sample(dir.path(), 40);
    let chunks = dir.path().join("chunks");
    let index_path = chunks.join("chunk_index.json");
    let schema = RecordSchema::default();

    let index = ChunkIndex::load_or_build(&index_path, &chunks, &manifest, &schema).await.unwrap();
    assert!(index_path.exists());

    let last_chunk = &manifest.chunks.last().unwrap().file_name;
    assert_eq!(index.lookup("sender-0039"), Some(last_chunk.as_str()));
    assert_eq!(index.lookup("nobody"), None);

    // record 13 holds 13 % 7 + 1 messages
    let item = index.load_item("sender-0013").await.unwrap().unwrap();
    assert_eq!(item.id, "sender-0013");
    assert_eq!(item.len(), 7);
    assert_eq!(item.messages_from_role("user"), 4);

    assert!(index.load_item("nobody").await.unwrap().is_none());
    assert!(matches!(
        index.fetch("nobody").await,
        Err(PipelineError::ItemNotFound(_))
    ));

    // A second load reuses the persisted file
    let reloaded = ChunkIndex::load_or_build(&index_path, &chunks, &manifest, &schema).await.unwrap();
    assert_eq!(reloaded.entries(), index.entries());
}

#[tokio::test]
async fn test_corrupt_index_file_is_an_index_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chunk_index.json");
    std::fs::write(&path, "{ not json").unwrap();
    let result = ChunkIndex::load(&path, dir.path(), &RecordSchema::default()).await;
    assert!(matches!(result, Err(PipelineError::Index(_))));
}

#[tokio::test]
async fn test_sender_split_across_chunks_loads_whole_item() {
    let dir = TempDir::new().unwrap();
    let records = vec![
        json!({"sender_id": "b", "role": "user", "content": "first"}),
        json!({"sender_id": "a", "role": "user", "content": "other"}),
        json!({"sender_id": "b", "role": "assistant", "content": "second"}),
    ];
    let input = write_dump(dir.path(), &records);
    let chunks = dir.path().join("chunks");
    let manifest = StreamingChunker::new(ChunkingConfig {
        target_chunk_bytes: 16,
        read_buffer_bytes: 64,
        file_prefix: "conversations_chunk".to_string(),
    })
    .chunk_path(&input, &chunks)
    .unwrap();
    assert_eq!(manifest.total_chunks, 3);

    let schema = RecordSchema::default();
    let (index, report) =
        ChunkIndex::rebuild(&chunks.join("chunk_index.json"), &chunks, &manifest, &schema)
            .await
            .unwrap();
    assert_eq!(report.spanning_keys, 1);
    assert_eq!(
        index.chunks_for("b"),
        [manifest.chunks[0].file_name.as_str(), manifest.chunks[2].file_name.as_str()]
    );
    assert_eq!(index.lookup("b"), Some(manifest.chunks[0].file_name.as_str()));

    let item = index.fetch("b").await.unwrap();
    let contents: Vec<_> = item.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);

    // The sampler sees the same item the analyzer receives
    let catalog = ItemCatalog::build(&chunks, &manifest, &schema, "user").unwrap();
    let profile = catalog.profiles().iter().find(|p| p.id == "b").unwrap();
    assert_eq!(profile.message_count, item.len());

    // A reloaded index keeps the span list
    let reloaded = ChunkIndex::load(&chunks.join("chunk_index.json"), &chunks, &schema)
        .await
        .unwrap();
    assert_eq!(reloaded.load_item("b").await.unwrap().unwrap(), item);
}

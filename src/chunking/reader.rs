use serde::de::IgnoredAny;
use serde_json::Value;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::{debug, warn};

use super::state::{Scanner, Transition};
use crate::error::{PipelineError, Result};
use crate::records::SourceDocument;

/// One validated top-level record, as raw bytes
#[derive(Debug)]
pub struct RecordSpan<'a> {
    /// Byte offset of the opening `{` in the input stream
    pub offset: u64,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub records: usize,
    pub skipped: usize,
    pub bytes_read: u64,
}

/// Stream every top-level object of a JSON array through `on_record`.
///
/// Memory use is one read block plus the object currently being scanned.
/// Objects that fail to parse and non-object elements are counted as skipped.
/// A read failure aborts with [`PipelineError::StreamIo`].
pub fn scan_records<R, F>(mut reader: R, block_size: usize, mut on_record: F) -> Result<ScanStats>
where
    R: Read,
    F: FnMut(RecordSpan<'_>) -> Result<()>,
{
    let mut scanner = Scanner::new();
    let mut stats = ScanStats::default();
    let mut block = vec![0u8; block_size.max(1)];
    // Bytes of the object in flight, carried across reads
    let mut pending: Vec<u8> = Vec::new();
    let mut pending_offset = 0u64;

    'read: loop {
        let n = match reader.read(&mut block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(PipelineError::StreamIo {
                    bytes_read: stats.bytes_read,
                    source,
                })
            }
        };
        stats.bytes_read += n as u64;

        // Start of the current object inside `block`, if it began in this read
        let mut object_start: Option<usize> = None;

        for (i, &byte) in block[..n].iter().enumerate() {
            match scanner.step(byte) {
                Transition::ObjectStarted => {
                    object_start = Some(i);
                    pending_offset = scanner.offset() - 1;
                }
                Transition::ObjectCompleted => {
                    let span_bytes: &[u8] = match object_start.take() {
                        Some(start) => &block[start..=i],
                        None => {
                            pending.extend_from_slice(&block[..=i]);
                            &pending
                        }
                    };
                    emit(span_bytes, pending_offset, &mut stats, &mut on_record)?;
                    pending.clear();
                }
                Transition::StrayStarted => {
                    stats.skipped += 1;
                    warn!(offset = scanner.offset() - 1, "Skipping non-object array element");
                }
                Transition::ArrayClosed => break 'read,
                Transition::Unexpected(found) => {
                    return Err(PipelineError::NotAnArray {
                        found: found as char,
                        offset: scanner.offset() - 1,
                    });
                }
                Transition::ArrayOpened => debug!(offset = scanner.offset() - 1, "Record array opened"),
                Transition::None => {}
            }
        }

        if scanner.in_object() {
            let start = object_start.unwrap_or(0);
            pending.extend_from_slice(&block[start..n]);
        }
    }

    if scanner.in_object() {
        stats.skipped += 1;
        warn!(
            offset = pending_offset,
            bytes = pending.len(),
            "Input ended inside a record, skipping truncated record"
        );
    }

    Ok(stats)
}

fn emit<F>(bytes: &[u8], offset: u64, stats: &mut ScanStats, on_record: &mut F) -> Result<()>
where
    F: FnMut(RecordSpan<'_>) -> Result<()>,
{
    match serde_json::from_slice::<IgnoredAny>(bytes) {
        Ok(_) => {
            stats.records += 1;
            on_record(RecordSpan { offset, bytes })
        }
        Err(e) => {
            stats.skipped += 1;
            let error = PipelineError::MalformedRecord {
                offset,
                reason: e.to_string(),
            };
            warn!("{}", error);
            Ok(())
        }
    }
}

/// Count the records in a file without materializing them
pub fn count_records(path: &Path, block_size: usize) -> Result<ScanStats> {
    let file = File::open(path)?;
    scan_records(file, block_size, |_| Ok(()))
}

/// Parse a whole chunk file. Chunks are size-bounded, so this is the one place
/// records are fully materialized.
pub fn read_chunk(path: &Path) -> Result<Vec<Value>> {
    let bytes = std::fs::read(path)?;
    parse_chunk(&bytes)
}

pub async fn read_chunk_async(path: &Path) -> Result<Vec<Value>> {
    let bytes = tokio::fs::read(path).await?;
    parse_chunk(&bytes)
}

fn parse_chunk(bytes: &[u8]) -> Result<Vec<Value>> {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(bytes);
    let document: SourceDocument = serde_json::from_slice(bytes)?;
    Ok(document.into_records())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(input: &[u8], block_size: usize) -> (Vec<String>, ScanStats) {
        let mut records = Vec::new();
        let stats = scan_records(input, block_size, |span| {
            records.push(String::from_utf8(span.bytes.to_vec()).unwrap());
            Ok(())
        })
        .unwrap();
        (records, stats)
    }

    #[test]
    fn test_records_split_across_reads() {
        let input = br#"[{"a": 1}, {"b": {"c": "}"}}, {"d": [1, 2]}]"#;
        for block_size in [1, 3, 7, 64] {
            let (records, stats) = collect(input, block_size);
            assert_eq!(
                records,
                vec![r#"{"a": 1}"#, r#"{"b": {"c": "}"}}"#, r#"{"d": [1, 2]}"#],
                "block size {}",
                block_size
            );
            assert_eq!(stats.skipped, 0);
        }
    }

    #[test]
    fn test_malformed_and_stray_records_are_skipped() {
        let input = br#"[{"a": 1}, {"b": tru}, 7, {"c": 3}]"#;
        let (records, stats) = collect(input, 4);
        assert_eq!(records, vec![r#"{"a": 1}"#, r#"{"c": 3}"#]);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn test_truncated_input_counts_skipped() {
        let input = br#"[{"a": 1}, {"b": "#;
        let (records, stats) = collect(input, 5);
        assert_eq!(records.len(), 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_wrapper_document() {
        let input = br#"{"Count": 2, "ActiveChatters": [{"SenderID": "a"}, {"SenderID": "b"}]}"#;
        let (records, _) = collect(input, 8);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_not_an_array() {
        let result = scan_records(&b"  \"hello\""[..], 16, |_| Ok(()));
        assert!(matches!(
            result,
            Err(PipelineError::NotAnArray { found: '"', offset: 2 })
        ));
    }

    #[test]
    fn test_offsets_point_at_record_start() {
        let input = br#"[ {"a": 1},  {"b": 2}]"#;
        let mut offsets = Vec::new();
        scan_records(&input[..], 3, |span| {
            offsets.push(span.offset);
            Ok(())
        })
        .unwrap();
        assert_eq!(offsets, vec![2, 13]);
    }
}

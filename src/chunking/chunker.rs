use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::manifest::{chunk_file_name, ChunkInfo, ChunkManifest};
use super::reader::scan_records;
use crate::config::ChunkingConfig;
use crate::error::{PipelineError, Result};
use crate::logging::OperationTimer;
use crate::utils::format_bytes;

const PROGRESS_EVERY: usize = 1000;

/// The chunk file currently being filled
struct OpenChunk {
    index: usize,
    file_name: String,
    partial_path: PathBuf,
    writer: BufWriter<File>,
    item_count: usize,
    byte_size: u64,
}

/// Writes records into numbered chunk files. Each chunk is written to a
/// `.partial` file and renamed once complete.
struct ChunkWriter<'a> {
    dir: &'a Path,
    prefix: &'a str,
    target_bytes: u64,
    next_index: usize,
    current: Option<OpenChunk>,
    manifest: ChunkManifest,
}

impl<'a> ChunkWriter<'a> {
    fn new(dir: &'a Path, prefix: &'a str, target_bytes: u64) -> Self {
        Self {
            dir,
            prefix,
            target_bytes,
            next_index: 0,
            current: None,
            manifest: ChunkManifest::new(target_bytes),
        }
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        let size = record.len() as u64;
        let over_budget = self
            .current
            .as_ref()
            .map(|c| c.item_count > 0 && c.byte_size + size > self.target_bytes)
            .unwrap_or(false);
        if over_budget {
            self.flush()?;
        }

        if self.current.is_none() {
            self.current = Some(self.open()?);
        }
        let chunk = match self.current.as_mut() {
            Some(chunk) => chunk,
            None => return Err(PipelineError::Task("chunk writer lost its open chunk".to_string())),
        };

        chunk
            .writer
            .write_all(if chunk.item_count == 0 { b"[\n" } else { b",\n" })?;
        chunk.writer.write_all(record)?;
        chunk.item_count += 1;
        chunk.byte_size += size;
        Ok(())
    }

    fn open(&mut self) -> Result<OpenChunk> {
        let index = self.next_index;
        self.next_index += 1;
        let file_name = chunk_file_name(self.prefix, index);
        let partial_path = self.dir.join(format!("{}.partial", file_name));
        let writer = BufWriter::new(File::create(&partial_path)?);
        Ok(OpenChunk {
            index,
            file_name,
            partial_path,
            writer,
            item_count: 0,
            byte_size: 0,
        })
    }

    fn flush(&mut self) -> Result<()> {
        let Some(mut chunk) = self.current.take() else {
            return Ok(());
        };

        chunk.writer.write_all(b"\n]\n")?;
        let file = chunk.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&chunk.partial_path, self.dir.join(&chunk.file_name))?;

        info!(
            "Saved chunk {}: {} ({} records, {})",
            chunk.index,
            chunk.file_name,
            chunk.item_count,
            format_bytes(chunk.byte_size)
        );
        self.manifest.push(ChunkInfo {
            index: chunk.index,
            file_name: chunk.file_name,
            item_count: chunk.item_count,
            byte_size: chunk.byte_size,
        });
        Ok(())
    }

    fn finish(mut self) -> Result<ChunkManifest> {
        self.flush()?;
        Ok(self.manifest)
    }
}

/// Splits one top-level JSON array into ordered, size-bounded chunk files
pub struct StreamingChunker {
    config: ChunkingConfig,
}

impl StreamingChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Chunk any byte stream into `output_dir`. Peak memory is one read block
    /// plus the largest single record.
    pub fn chunk_reader<R: Read>(&self, reader: R, output_dir: &Path) -> Result<ChunkManifest> {
        if self.config.target_chunk_bytes == 0 {
            return Err(PipelineError::Config(
                "target chunk size must be greater than zero".to_string(),
            ));
        }
        std::fs::create_dir_all(output_dir)?;

        let mut writer = ChunkWriter::new(
            output_dir,
            &self.config.file_prefix,
            self.config.target_chunk_bytes,
        );

        let mut seen = 0usize;
        let stats = scan_records(reader, self.config.read_buffer_bytes, |span| {
            writer.append(span.bytes)?;
            seen += 1;
            if seen % PROGRESS_EVERY == 0 {
                info!("Processed {} records", seen);
            } else {
                debug!(offset = span.offset, bytes = span.bytes.len(), "Record appended");
            }
            Ok(())
        })?;

        let mut manifest = writer.finish()?;
        manifest.skipped_records = stats.skipped;
        manifest.source_bytes = stats.bytes_read;

        info!(
            records = manifest.total_items,
            chunks = manifest.total_chunks,
            skipped = manifest.skipped_records,
            "Chunking finished"
        );
        Ok(manifest)
    }

    /// Chunk a file on disk and persist the manifest next to the chunks
    pub fn chunk_path(&self, input: &Path, output_dir: &Path) -> Result<ChunkManifest> {
        let _timer = OperationTimer::start("chunking");
        let file = File::open(input)?;
        info!(
            "Chunking {} ({}) into {} byte chunks",
            input.display(),
            format_bytes(file.metadata()?.len()),
            self.config.target_chunk_bytes
        );

        let mut manifest = self.chunk_reader(file, output_dir)?;
        manifest.source_file = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        let json = serde_json::to_vec_pretty(&manifest)?;
        crate::utils::write_atomic_sync(&output_dir.join(crate::config::MANIFEST_FILE_NAME), &json)?;
        Ok(manifest)
    }

    /// Async entry point; the scan runs on the blocking pool
    pub async fn chunk_file(&self, input: &Path, output_dir: &Path) -> Result<ChunkManifest> {
        let chunker = StreamingChunker::new(self.config.clone());
        let input = input.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        tokio::task::spawn_blocking(move || chunker.chunk_path(&input, &output_dir)).await?
    }
}

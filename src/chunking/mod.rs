//! Streaming chunker, chunk manifest and key index

pub mod chunker;
pub mod index;
pub mod manifest;
pub mod reader;
pub mod state;

pub use chunker::StreamingChunker;
pub use index::{ChunkIndex, IndexBuildReport};
pub use manifest::{chunk_file_name, parse_chunk_index, ChunkInfo, ChunkManifest, ChunkStats};
pub use reader::{count_records, read_chunk, scan_records, RecordSpan, ScanStats};
pub use state::{ScanState, Scanner, Transition};

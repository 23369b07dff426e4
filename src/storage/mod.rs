//! Destination storage layer
//!
//! This module turns destination-resolution point streams into stored chunks:
//!
//! - **chunk**: epoch-aligned chunk packing and row keys
//! - **compression**: delta encoding + LZ4 chunk payloads
//! - **store**: the `ChunkStore` sink trait and an in-memory store
//! - **segment**: append-only segment files of `(row key, chunk)` records
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   points → chunks_from_points → Chunk (encode) → ChunkStore::put → Segment
//!
//! Read Path:
//!   SegmentReader → footer index → record → Chunk::points
//! ```

pub mod chunk;
pub mod compression;
pub mod error;
pub mod segment;
pub mod store;

pub use chunk::{chunk_t0, chunks_from_points, row_key, Chunk};
pub use compression::{decode_points, encode_points};
pub use error::{StorageError, StorageResult};
pub use segment::{RecordMeta, SegmentHeader, SegmentReader, SegmentWriter};
pub use store::{ChunkStore, MemoryStore};

//! Destination chunk stores
//!
//! The importer hands every `(row key, chunk)` pair to a [`ChunkStore`].
//! Write and retry semantics belong to the store.

use crate::storage::chunk::Chunk;
use crate::storage::error::StorageResult;
use std::collections::BTreeMap;

/// Sink for encoded chunks
pub trait ChunkStore: Send {
    /// Persist one chunk under `row_key`
    fn put(&mut self, row_key: &str, chunk: &Chunk) -> StorageResult<()>;

    /// Make everything written so far durable
    fn finish(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

/// In-memory store, keyed by row key
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: BTreeMap<String, Vec<Chunk>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks stored under `row_key`, in insertion order
    pub fn row(&self, row_key: &str) -> &[Chunk] {
        self.rows.get(row_key).map(Vec::as_slice).unwrap_or_default()
    }

    /// All row keys, sorted
    pub fn row_keys(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    /// Total number of chunks across rows
    pub fn chunk_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

impl ChunkStore for MemoryStore {
    fn put(&mut self, row_key: &str, chunk: &Chunk) -> StorageResult<()> {
        self.rows
            .entry(row_key.to_string())
            .or_default()
            .push(chunk.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::Point;

    #[test]
    fn test_memory_store_groups_by_row() {
        let mut store = MemoryStore::new();
        let a = Chunk::encode(600, 600, 60, &[Point::new(540, 1.0)], true).unwrap();
        let b = Chunk::encode(1200, 600, 60, &[Point::new(1200, 2.0)], false).unwrap();

        store.put("m", &a).unwrap();
        store.put("m", &b).unwrap();
        store.put("m_sum_600", &a).unwrap();

        assert_eq!(store.row("m"), &[a.clone(), b][..]);
        assert_eq!(store.row("m_sum_600"), &[a][..]);
        assert!(store.row("missing").is_empty());
        assert_eq!(store.row_keys().collect::<Vec<_>>(), vec!["m", "m_sum_600"]);
        assert_eq!(store.chunk_count(), 3);
    }
}

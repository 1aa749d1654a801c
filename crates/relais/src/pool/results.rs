//! Concurrent store of finished chunks, keyed by chunk index.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chunk {index} already has a result")]
pub struct DuplicateChunk {
    pub index: usize,
}

/// Written by every worker, read once after the last worker has joined.
#[derive(Debug, Default)]
pub struct ResultMap {
    chunks: DashMap<usize, Vec<String>>,
}

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk's output. The first write for an index wins.
    pub fn insert(&self, index: usize, lines: Vec<String>) -> Result<(), DuplicateChunk> {
        match self.chunks.entry(index) {
            Entry::Occupied(_) => Err(DuplicateChunk { index }),
            Entry::Vacant(slot) => {
                slot.insert(lines);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate chunks `0..count` in index order. Fails with the missing
    /// indices unless every one is present; nothing partial is returned.
    pub fn assemble(&self, count: usize) -> Result<Vec<String>, Vec<usize>> {
        let missing: Vec<usize> = (0..count)
            .filter(|index| !self.chunks.contains_key(index))
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let mut output = Vec::new();
        for index in 0..count {
            if let Some((_, lines)) = self.chunks.remove(&index) {
                output.extend(lines);
            }
        }
        Ok(output)
    }
}

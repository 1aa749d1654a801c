//! Shared FIFO of pending chunks.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::chunk::Chunk;

/// A chunk plus the lines already produced for it.
///
/// A worker that loses its service mid-chunk hands the remainder back with
/// its progress, so lines that were already sent are never sent again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub chunk: Chunk,
    pub output: Vec<String>,
}

impl WorkItem {
    pub fn new(chunk: Chunk) -> Self {
        let output = Vec::with_capacity(chunk.len());
        Self { chunk, output }
    }

    pub fn index(&self) -> usize {
        self.chunk.index
    }

    /// Position of the next input line to process.
    pub fn cursor(&self) -> usize {
        self.output.len()
    }

    pub fn is_done(&self) -> bool {
        self.output.len() >= self.chunk.len()
    }
}

/// Work queue filled once before workers start. Any worker pops any item;
/// there is no per-worker ownership.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            items: Mutex::new(chunks.into_iter().map(WorkItem::new).collect()),
        }
    }

    pub fn pop(&self) -> Option<WorkItem> {
        self.lock().pop_front()
    }

    /// Put unfinished work back at the front so it is picked up next.
    pub fn requeue(&self, item: WorkItem) {
        self.lock().push_front(item);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        // Items are only moved in and out under the lock, so a poisoned queue
        // is still consistent.
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Work queue mutex poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }
}

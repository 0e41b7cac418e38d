//! Partition metadata, worker-side buffering, and storage-memory accounting.
//!
//! A partition is the unit of parallel work: metadata lives with the driver's
//! graph, while the buffered rows of persisted partitions live in the worker
//! that computed them and are evicted under memory pressure.

use crate::canon;
use crate::graph::DatasetId;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How many appended elements pass between storage-memory size samples.
pub const SIZE_SAMPLE_EVERY: usize = 10_000;

/// Driver-side description of one partition of one dataset.
#[derive(Clone, Debug)]
pub struct PartitionMeta {
    pub dataset: DatasetId,
    pub index: usize,
    /// Which parent this partition proxies (non-zero only below a union).
    pub parent_slot: usize,
    /// Parent partition for narrow 1:1 mappings; `None` for sources and
    /// shuffle outputs.
    pub parent_index: Option<usize>,
    pub preferred_host: Option<String>,
    /// Backing file for file-based sources.
    pub path: Option<PathBuf>,
    /// Byte range within `path` for split text sources.
    pub byte_range: Option<(u64, u64)>,
    /// Element range for index-driven sources.
    pub item_range: Option<(usize, usize)>,
}

impl PartitionMeta {
    pub fn root(dataset: DatasetId, index: usize) -> Self {
        Self {
            dataset,
            index,
            parent_slot: 0,
            parent_index: None,
            preferred_host: None,
            path: None,
            byte_range: None,
            item_range: None,
        }
    }

    pub fn narrow(dataset: DatasetId, index: usize, parent_slot: usize, parent_index: usize) -> Self {
        Self {
            dataset,
            index,
            parent_slot,
            parent_index: Some(parent_index),
            preferred_host: None,
            path: None,
            byte_range: None,
            item_range: None,
        }
    }
}

/// Per-worker storage-memory counter with a configured ceiling.
///
/// Only the owning worker mutates its counter; the atomics are for cheap
/// reads from tests and diagnostics.
pub struct MemoryManager {
    ceiling: usize,
    used: AtomicUsize,
}

impl MemoryManager {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            used: AtomicUsize::new(0),
        }
    }

    /// Account `bytes` of storage; returns false once the ceiling is crossed.
    pub fn grow(&self, bytes: usize) -> bool {
        let now = self.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        now <= self.ceiling
    }

    pub fn shrink(&self, bytes: usize) {
        self.used.fetch_sub(bytes.min(self.used()), Ordering::Relaxed);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Filling,
    Ready,
    Evicted,
}

/// Rows of one persisted partition, with incremental size accounting.
///
/// Every [`SIZE_SAMPLE_EVERY`] appends the cost of the batch since the last
/// sample is charged to the memory manager; crossing the ceiling evicts the
/// buffer, after which appends pass through untouched. Eviction is monotonic
/// within a job.
pub struct PartitionBuffer {
    rows: Vec<Value>,
    state: BufferState,
    accounted: usize,
    batch_bytes: usize,
    batch_rows: usize,
}

impl Default for PartitionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionBuffer {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            state: BufferState::Filling,
            accounted: 0,
            batch_bytes: 0,
            batch_rows: 0,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    pub fn append(&mut self, v: &Value, memory: &MemoryManager) {
        if self.state == BufferState::Evicted {
            return;
        }
        self.rows.push(v.clone());
        self.batch_bytes += canon::estimate_size(v);
        self.batch_rows += 1;
        if self.batch_rows >= SIZE_SAMPLE_EVERY {
            self.take_sample(memory);
        }
    }

    fn take_sample(&mut self, memory: &MemoryManager) {
        let bytes = std::mem::take(&mut self.batch_bytes);
        self.batch_rows = 0;
        self.accounted += bytes;
        if !memory.grow(bytes) {
            self.evict(memory);
        }
    }

    pub fn evict(&mut self, memory: &MemoryManager) {
        warn!(
            "evicting partition buffer: {} rows, ~{} bytes",
            self.rows.len(),
            self.accounted
        );
        memory.shrink(self.accounted);
        self.accounted = 0;
        self.batch_bytes = 0;
        self.batch_rows = 0;
        self.rows = Vec::new();
        self.state = BufferState::Evicted;
    }

    /// Close out the buffer after a full iteration: charge the trailing
    /// partial batch and mark the rows reusable.
    pub fn finish(&mut self, memory: &MemoryManager) {
        if self.state != BufferState::Filling {
            return;
        }
        if self.batch_rows > 0 {
            self.take_sample(memory);
        }
        if self.state == BufferState::Filling {
            self.state = BufferState::Ready;
        }
    }
}

/// A worker's private map of persisted partition buffers.
pub struct WorkerStore {
    pub memory: MemoryManager,
    buffers: HashMap<(DatasetId, usize), StoredBuffer>,
}

struct StoredBuffer {
    job: u64,
    buf: PartitionBuffer,
}

impl WorkerStore {
    pub fn new(storage_ceiling: usize) -> Self {
        Self {
            memory: MemoryManager::new(storage_ceiling),
            buffers: HashMap::new(),
        }
    }

    /// Rows for a buffer that finished filling and was not evicted.
    pub fn ready_rows(&self, key: (DatasetId, usize)) -> Option<&[Value]> {
        self.buffers
            .get(&key)
            .filter(|s| s.buf.state() == BufferState::Ready)
            .map(|s| s.buf.rows())
    }

    /// Prepare the buffer behind a persistence step. Returns true when the
    /// running task should append into it: a buffer evicted in an older job
    /// is reset (a fresh job re-populates), one evicted in this job stays
    /// evicted, and a ready buffer is left alone.
    pub fn prepare(&mut self, key: (DatasetId, usize), job: u64) -> bool {
        match self.buffers.get_mut(&key) {
            None => {
                self.buffers.insert(
                    key,
                    StoredBuffer {
                        job,
                        buf: PartitionBuffer::new(),
                    },
                );
                true
            }
            Some(stored) => match stored.buf.state() {
                BufferState::Ready => false,
                BufferState::Filling => true,
                BufferState::Evicted => {
                    if stored.job < job {
                        debug!("re-populating evicted partition buffer {key:?}");
                        stored.job = job;
                        stored.buf = PartitionBuffer::new();
                        true
                    } else {
                        false
                    }
                }
            },
        }
    }

    pub fn append(&mut self, key: (DatasetId, usize), v: &Value) {
        if let Some(stored) = self.buffers.get_mut(&key) {
            stored.buf.append(v, &self.memory);
        }
    }

    pub fn finish(&mut self, key: (DatasetId, usize)) {
        if let Some(stored) = self.buffers.get_mut(&key) {
            stored.buf.finish(&self.memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buffer_fills_and_becomes_ready() {
        let mm = MemoryManager::new(1 << 20);
        let mut buf = PartitionBuffer::new();
        for i in 0..100 {
            buf.append(&json!(i), &mm);
        }
        buf.finish(&mm);
        assert_eq!(buf.state(), BufferState::Ready);
        assert_eq!(buf.rows().len(), 100);
        assert!(mm.used() > 0);
    }

    #[test]
    fn crossing_the_ceiling_evicts_and_releases_memory() {
        let mm = MemoryManager::new(64);
        let mut buf = PartitionBuffer::new();
        for i in 0..(SIZE_SAMPLE_EVERY + 1) {
            buf.append(&json!({"n": i}), &mm);
        }
        assert_eq!(buf.state(), BufferState::Evicted);
        assert_eq!(mm.used(), 0);
        assert!(buf.rows().is_empty());
        // eviction is monotonic: later appends are pass-through
        buf.append(&json!(1), &mm);
        assert!(buf.rows().is_empty());
    }

    #[test]
    fn store_resets_evicted_buffers_only_across_jobs() {
        let mut store = WorkerStore::new(16);
        let key = (DatasetId::new(3), 0);
        assert!(store.prepare(key, 1));
        for i in 0..(SIZE_SAMPLE_EVERY + 1) {
            store.append(key, &json!(i));
        }
        store.finish(key);
        // same job: still evicted
        assert!(!store.prepare(key, 1));
        // fresh job: re-populate
        assert!(store.prepare(key, 2));
    }
}

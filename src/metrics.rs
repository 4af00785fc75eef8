//! Plain atomic counters for per-engine read/write/GC activity.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub gc_cycles: AtomicU64,
    pub blocks_reclaimed: AtomicU64,
    pub pages_relocated: AtomicU64,
    pub relocation_read_failures: AtomicU64,
    pub erase_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            gc_cycles: self.gc_cycles.load(Ordering::Relaxed),
            blocks_reclaimed: self.blocks_reclaimed.load(Ordering::Relaxed),
            pages_relocated: self.pages_relocated.load(Ordering::Relaxed),
            relocation_read_failures: self.relocation_read_failures.load(Ordering::Relaxed),
            erase_failures: self.erase_failures.load(Ordering::Relaxed),
        }
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub gc_cycles: u64,
    pub blocks_reclaimed: u64,
    pub pages_relocated: u64,
    pub relocation_read_failures: u64,
    pub erase_failures: u64,
}

//! Operational metrics for the block I/O layer.
//!
//! Thread-safe atomic counters/gauges, modeled directly on the teacher's
//! `OperationalMetrics` (`Arc`-shared, `AtomicU64`, `Ordering::Relaxed`
//! fetch-add), but re-themed around the quantities spec §4.A/§4.B/§4.E/§4.G
//! actually call out: DMA chunk occupancy per type, bulk-cache hit rate,
//! per-device media-error counters, and WAL commit/replay/checkpoint
//! counts. [`EngineMetrics::dump`] backs the DMA pool's rate-limited
//! diagnostic described in spec §4.A.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Chunk-use counters broken out by [`crate::dma::ChunkType`].
#[derive(Debug, Default)]
pub struct ChunkTypeCounters {
    /// Chunks currently in use serving ordinary I/O.
    pub io: AtomicU64,
    /// Chunks currently in use for worker-local staging.
    pub local: AtomicU64,
    /// Chunks currently in use for rebuild traffic.
    pub rebuild: AtomicU64,
}

/// Engine-wide operational metrics (one instance per worker DMA pool /
/// bulk cache pair is typical, but a single shared instance is equally
/// valid for single-worker standalone builds).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Total chunks currently allocated (idle + in use).
    pub dma_chunks_total: AtomicU64,
    /// Chunks currently on the idle list.
    pub dma_chunks_idle: AtomicU64,
    /// Per-type in-use chunk counters.
    pub dma_chunks_used: ChunkTypeCounters,
    /// Number of times `reserve` returned `AGAIN` without queueing.
    pub dma_reserve_again: AtomicU64,
    /// Number of times an IOD joined the FIFO wait queue.
    pub dma_reserve_waits: AtomicU64,
    /// Number of times `grow` allocated fresh chunks.
    pub dma_grows: AtomicU64,

    /// Bulk-handle cache hits (a cached handle satisfied the request).
    pub bulk_hits: AtomicU64,
    /// Bulk-handle cache misses (a new group/chunk had to be carved).
    pub bulk_misses: AtomicU64,
    /// Bulk-cache chunk evictions (LRU reclaim).
    pub bulk_evictions: AtomicU64,

    /// WAL commits that completed successfully.
    pub wal_commits_ok: AtomicU64,
    /// WAL commits that failed (and were propagated to one successor).
    pub wal_commits_failed: AtomicU64,
    /// WAL transactions replayed.
    pub wal_replayed: AtomicU64,
    /// WAL checkpoints performed.
    pub wal_checkpoints: AtomicU64,
}

impl EngineMetrics {
    /// Creates a fresh, zeroed metrics block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared metrics instance for use across tasks.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Renders a human-readable snapshot, used by the DMA pool's
    /// rate-limited diagnostic dump (spec §4.A) and by operator tooling.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "dma: total={} idle={} io={} local={} rebuild={} again={} waits={} grows={}",
            self.dma_chunks_total.load(Ordering::Relaxed),
            self.dma_chunks_idle.load(Ordering::Relaxed),
            self.dma_chunks_used.io.load(Ordering::Relaxed),
            self.dma_chunks_used.local.load(Ordering::Relaxed),
            self.dma_chunks_used.rebuild.load(Ordering::Relaxed),
            self.dma_reserve_again.load(Ordering::Relaxed),
            self.dma_reserve_waits.load(Ordering::Relaxed),
            self.dma_grows.load(Ordering::Relaxed),
        );
        let _ = writeln!(
            out,
            "bulk: hits={} misses={} evictions={}",
            self.bulk_hits.load(Ordering::Relaxed),
            self.bulk_misses.load(Ordering::Relaxed),
            self.bulk_evictions.load(Ordering::Relaxed),
        );
        let _ = write!(
            out,
            "wal: commits_ok={} commits_failed={} replayed={} checkpoints={}",
            self.wal_commits_ok.load(Ordering::Relaxed),
            self.wal_commits_failed.load(Ordering::Relaxed),
            self.wal_replayed.load(Ordering::Relaxed),
            self.wal_checkpoints.load(Ordering::Relaxed),
        );
        out
    }
}

/// Per-device error counters backing the auto-faulty detector (spec §4.E).
#[derive(Debug, Default)]
pub struct DeviceErrorCounters {
    /// Cumulative read errors.
    pub read_errs: AtomicU64,
    /// Cumulative write errors.
    pub write_errs: AtomicU64,
    /// Cumulative checksum mismatches detected on this device's media.
    pub checksum_errs: AtomicU64,
}

impl DeviceErrorCounters {
    /// Creates a shared, zeroed counter block.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total I/O errors (read + write), the quantity the auto-faulty
    /// detector's `max_io_errs` threshold is compared against.
    #[must_use]
    pub fn io_errs(&self) -> u64 {
        self.read_errs.load(Ordering::Relaxed) + self.write_errs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod operational_tests {
    use super::*;

    #[test]
    fn dump_contains_all_sections() {
        let m = EngineMetrics::new();
        m.dma_chunks_total.fetch_add(4, Ordering::Relaxed);
        m.bulk_hits.fetch_add(1, Ordering::Relaxed);
        m.wal_commits_ok.fetch_add(2, Ordering::Relaxed);
        let dump = m.dump();
        assert!(dump.contains("dma:"));
        assert!(dump.contains("bulk:"));
        assert!(dump.contains("wal:"));
        assert!(dump.contains("total=4"));
    }

    #[test]
    fn device_error_counters_sum_io_errs() {
        let c = DeviceErrorCounters::shared();
        c.read_errs.fetch_add(3, Ordering::Relaxed);
        c.write_errs.fetch_add(4, Ordering::Relaxed);
        assert_eq!(c.io_errs(), 7);
    }
}

//! The per-worker DMA buffer pool (spec §4.A).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ChunkConfig;
use crate::dma::chunk::{ChunkId, ChunkType, DmaChunk};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

/// A region of one chunk reserved for a single I/O descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// The chunk this region lives in.
    pub chunk: ChunkId,
    /// First page index within the chunk.
    pub page_start: u32,
    /// Number of pages reserved.
    pub pages: u32,
}

impl DmaRegion {
    /// Byte length of this region.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        u64::from(self.pages) * crate::dma::chunk::BIO_DMA_PAGE_SZ as u64
    }
}

/// Outcome of a non-blocking reserve attempt.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// A region was reserved immediately.
    Ready(DmaRegion),
    /// The pool is exhausted; caller must back off (`Error::Again`) rather
    /// than block, per the `non_blocking` contract in spec §4.A.
    Again,
}

/// Lets the DMA pool reclaim an idle chunk from the bulk-handle cache
/// (spec §4.A, step: "evict an idle bulk-cache chunk (§4.B)") without the
/// pool module depending on the bulk-cache module directly — the
/// dependency runs the other way (the bulk cache borrows whole-chunk
/// regions from this pool), so reclaiming is expressed as an injected
/// callback that releases a region back to the pool itself.
pub trait BulkReclaimer: Send + Sync {
    /// Depopulates one fully-idle chunk from the bulk cache (freeing its
    /// SPDK-level handles) and releases it back to this pool's idle list
    /// via [`DmaPool::release`]. Returns `true` if a chunk was reclaimed.
    fn reclaim_idle_chunk(&self, pool: &DmaPool) -> bool;
}

struct Waiter {
    tx: oneshot::Sender<()>,
}

struct Inner {
    chunks: Vec<DmaChunk>,
    idle: VecDeque<ChunkId>,
    current: [Option<ChunkId>; 3],
    chunk_pages: u32,
    max_chunks: u32,
    fifo: VecDeque<Waiter>,
    last_dump: Option<Instant>,
}

impl Inner {
    fn used_count(&self, ty: ChunkType) -> u32 {
        self.chunks
            .iter()
            .filter(|c| c.chunk_type() == ty && c.refcount() > 0)
            .count() as u32
    }

    fn try_bump_current(&mut self, ty: ChunkType, pages: u32) -> Option<DmaRegion> {
        let id = self.current[ty.index()]?;
        let chunk = &mut self.chunks[id.0];
        let start = chunk.bump(pages)?;
        Some(DmaRegion {
            chunk: id,
            page_start: start,
            pages,
        })
    }

    fn try_idle_chunk(&mut self, ty: ChunkType, pages: u32) -> Option<DmaRegion> {
        let id = self.idle.pop_front()?;
        self.current[ty.index()] = Some(id);
        let chunk = &mut self.chunks[id.0];
        let start = chunk.bump(pages)?;
        Some(DmaRegion {
            chunk: id,
            page_start: start,
            pages,
        })
    }

    fn grow(&mut self, n: u32) -> Result<u32> {
        let mut added = 0;
        for _ in 0..n {
            if self.max_chunks > 0 && self.chunks.len() as u32 >= self.max_chunks {
                break;
            }
            let id = ChunkId(self.chunks.len());
            match DmaChunk::alloc(id, self.chunk_pages, ChunkType::Io) {
                Some(chunk) => {
                    self.chunks.push(chunk);
                    self.idle.push_back(id);
                    added += 1;
                }
                None => break,
            }
        }
        if added == 0 && self.chunks.is_empty() {
            return Err(Error::NoMem(
                "dma pool: initial chunk allocation failed".into(),
            ));
        }
        Ok(added)
    }
}

/// Per-worker DMA buffer pool.
pub struct DmaPool {
    inner: Mutex<Inner>,
    active_iods: AtomicU32,
    metrics: Arc<EngineMetrics>,
    reclaimer: Mutex<Option<Arc<dyn BulkReclaimer>>>,
}

impl DmaPool {
    /// Creates a pool with `init_chunks` pre-grown chunks.
    pub fn new(cfg: &ChunkConfig, init_chunks: u32, metrics: Arc<EngineMetrics>) -> Result<Self> {
        let mut inner = Inner {
            chunks: Vec::new(),
            idle: VecDeque::new(),
            current: [None, None, None],
            chunk_pages: cfg.bio_chk_pages,
            max_chunks: cfg.bio_chk_cnt_max,
            fifo: VecDeque::new(),
            last_dump: None,
        };
        inner.grow(init_chunks)?;
        metrics
            .dma_chunks_total
            .store(inner.chunks.len() as u64, Ordering::Relaxed);
        metrics
            .dma_chunks_idle
            .store(inner.idle.len() as u64, Ordering::Relaxed);
        Ok(Self {
            inner: Mutex::new(inner),
            active_iods: AtomicU32::new(0),
            metrics,
            reclaimer: Mutex::new(None),
        })
    }

    /// Injects the bulk cache as this pool's reclaim source (spec §4.A).
    pub fn set_bulk_reclaimer(&self, reclaimer: Arc<dyn BulkReclaimer>) {
        *self.reclaimer.lock() = Some(reclaimer);
    }

    /// Marks one more IOD as active, for backpressure accounting (spec
    /// §4.A: "the pool has at least one other active IOD").
    pub fn iod_began(&self) {
        self.active_iods.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks an IOD as finished (chunks released, completion observed).
    pub fn iod_finished(&self) {
        self.active_iods.fetch_sub(1, Ordering::AcqRel);
    }

    fn try_reserve_once(&self, ty: ChunkType, pages: u32) -> Option<DmaRegion> {
        let mut guard = self.inner.lock();
        if let Some(r) = guard.try_bump_current(ty, pages) {
            return Some(r);
        }
        if let Some(r) = guard.try_idle_chunk(ty, pages) {
            return Some(r);
        }
        let grown = guard.grow(1).unwrap_or(0);
        if grown > 0 {
            self.metrics.dma_grows.fetch_add(u64::from(grown), Ordering::Relaxed);
            if let Some(r) = guard.try_idle_chunk(ty, pages) {
                return Some(r);
            }
        }
        drop(guard);
        // Evict an idle bulk-cache chunk as a last resort (spec §4.A). The
        // reclaimer releases the chunk back onto our idle list itself, so
        // we just need to look again afterwards.
        let reclaimer = self.reclaimer.lock().clone();
        if let Some(reclaimer) = reclaimer {
            if reclaimer.reclaim_idle_chunk(self) {
                self.metrics.bulk_evictions.fetch_add(1, Ordering::Relaxed);
                let mut guard = self.inner.lock();
                if let Some(r) = guard.try_idle_chunk(ty, pages) {
                    return Some(r);
                }
            }
        }
        None
    }

    /// Reserves `pages` contiguous pages for chunk type `ty`.
    ///
    /// When `non_blocking` is set, an exhausted pool returns
    /// [`Error::Again`] immediately rather than joining the FIFO wait
    /// queue (spec §4.A).
    pub async fn reserve(&self, ty: ChunkType, pages: u32, non_blocking: bool) -> Result<DmaRegion> {
        loop {
            if let Some(region) = self.try_reserve_once(ty, pages) {
                self.update_gauges();
                return Ok(region);
            }

            let others_active = self.active_iods.load(Ordering::Acquire) > 1;
            if non_blocking || !others_active {
                self.metrics.dma_reserve_again.fetch_add(1, Ordering::Relaxed);
                self.maybe_dump();
                if non_blocking || !others_active {
                    return Err(Error::Again);
                }
            }

            let rx = {
                let mut guard = self.inner.lock();
                let (tx, rx) = oneshot::channel();
                guard.fifo.push_back(Waiter { tx });
                rx
            };
            self.metrics.dma_reserve_waits.fetch_add(1, Ordering::Relaxed);
            // A send() failure just means the pool is draining; retry and
            // let the next loop iteration observe the updated state.
            let _ = rx.await;
        }
    }

    /// Releases a previously reserved region, waking the FIFO head waiter
    /// if the chunk becomes idle or if any waiter is queued.
    pub fn release(&self, region: DmaRegion) {
        let mut guard = self.inner.lock();
        let chunk = &mut guard.chunks[region.chunk.0];
        let became_idle = chunk.release_ref();
        if became_idle {
            let ty_idx = chunk.chunk_type().index();
            if guard.current[ty_idx] == Some(region.chunk) {
                guard.current[ty_idx] = None;
            }
            guard.idle.push_back(region.chunk);
        }
        self.wake_one_locked(&mut guard);
    }

    /// Huge, IOD-exclusive chunks (larger than a single pool chunk) are
    /// freed outright rather than returned to the idle list, per spec
    /// §4.A ("Huge one-off chunks... are freed outright").
    pub fn release_huge(&self, chunk: DmaChunk) {
        drop(chunk);
        let mut guard = self.inner.lock();
        self.wake_one_locked(&mut guard);
    }

    fn wake_one_locked(&self, guard: &mut Inner) {
        if let Some(waiter) = guard.fifo.pop_front() {
            let _ = waiter.tx.send(());
        }
    }

    fn update_gauges(&self) {
        let guard = self.inner.lock();
        self.metrics
            .dma_chunks_total
            .store(guard.chunks.len() as u64, Ordering::Relaxed);
        self.metrics
            .dma_chunks_idle
            .store(guard.idle.len() as u64, Ordering::Relaxed);
        self.metrics
            .dma_chunks_used
            .io
            .store(u64::from(guard.used_count(ChunkType::Io)), Ordering::Relaxed);
        self.metrics
            .dma_chunks_used
            .local
            .store(u64::from(guard.used_count(ChunkType::Local)), Ordering::Relaxed);
        self.metrics
            .dma_chunks_used
            .rebuild
            .store(u64::from(guard.used_count(ChunkType::Rebuild)), Ordering::Relaxed);
    }

    /// Rate-limited (60s) diagnostic dump, per spec §4.A.
    fn maybe_dump(&self) {
        let mut guard = self.inner.lock();
        let now = Instant::now();
        let due = guard
            .last_dump
            .map_or(true, |t| now.duration_since(t) >= Duration::from_secs(60));
        if !due {
            return;
        }
        guard.last_dump = Some(now);
        drop(guard);
        warn!(target: "bio_engine::dma", "pool under pressure: {}", self.metrics.dump());
    }

    /// Total chunk count, for tests and telemetry.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    /// Idle chunk count.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Copies `data` to the start of a reserved region (spec §4.C "copy"
    /// phase).
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than `region.byte_len()`.
    pub fn copy_into(&self, region: &DmaRegion, data: &[u8]) {
        assert!(data.len() as u64 <= region.byte_len(), "copy overflows reserved region");
        let guard = self.inner.lock();
        let ptr = guard.chunks[region.chunk.0].page_ptr(region.page_start);
        // SAFETY: `region` was reserved from this pool and stays valid
        // until released; `data.len()` was just checked against its
        // capacity, and the pool's mutex keeps the chunk alive across the
        // copy.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    }

    /// Copies the start of a reserved region into `buf` (spec §4.C "copy"
    /// phase).
    ///
    /// # Panics
    ///
    /// Panics if `buf` is longer than `region.byte_len()`.
    pub fn copy_out(&self, region: &DmaRegion, buf: &mut [u8]) {
        assert!(buf.len() as u64 <= region.byte_len(), "copy overflows reserved region");
        let guard = self.inner.lock();
        let ptr = guard.chunks[region.chunk.0].page_ptr(region.page_start);
        // SAFETY: see `copy_into`.
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    fn test_metrics() -> Arc<EngineMetrics> {
        EngineMetrics::shared()
    }

    #[tokio::test]
    async fn reserve_bumps_then_grows() {
        let cfg = ChunkConfig {
            bio_chk_pages: 4,
            ..ChunkConfig::default()
        };
        let pool = DmaPool::new(&cfg, 1, test_metrics()).unwrap();
        let r1 = pool.reserve(ChunkType::Io, 2, true).await.unwrap();
        assert_eq!(r1.page_start, 0);
        let r2 = pool.reserve(ChunkType::Io, 2, true).await.unwrap();
        assert_eq!(r2.page_start, 2);
        // Chunk now full; next reserve must grow a new chunk.
        let r3 = pool.reserve(ChunkType::Io, 1, true).await.unwrap();
        assert_eq!(r3.chunk, ChunkId(1));
        assert_eq!(pool.chunk_count(), 2);
    }

    #[tokio::test]
    async fn release_returns_chunk_to_idle() {
        let cfg = ChunkConfig {
            bio_chk_pages: 4,
            bio_chk_cnt_max: 1,
            ..ChunkConfig::default()
        };
        let pool = DmaPool::new(&cfg, 1, test_metrics()).unwrap();
        let r = pool.reserve(ChunkType::Io, 4, true).await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        pool.release(r);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn non_blocking_exhaustion_returns_again() {
        let cfg = ChunkConfig {
            bio_chk_pages: 2,
            bio_chk_cnt_max: 1,
            ..ChunkConfig::default()
        };
        let pool = DmaPool::new(&cfg, 1, test_metrics()).unwrap();
        let _r = pool.reserve(ChunkType::Io, 2, true).await.unwrap();
        let err = pool.reserve(ChunkType::Io, 1, true).await.unwrap_err();
        assert!(matches!(err, Error::Again));
    }

    #[tokio::test]
    async fn waiter_is_woken_on_release() {
        let cfg = ChunkConfig {
            bio_chk_pages: 2,
            bio_chk_cnt_max: 1,
            ..ChunkConfig::default()
        };
        let pool = Arc::new(DmaPool::new(&cfg, 1, test_metrics()).unwrap());
        let r1 = pool.reserve(ChunkType::Io, 2, true).await.unwrap();

        pool.iod_began(); // the waiter
        pool.iod_began(); // the holder of r1 — makes "others_active" true

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.reserve(ChunkType::Io, 2, false).await });

        // Give the waiter task a chance to queue up.
        tokio::task::yield_now().await;
        pool.release(r1);

        let region = waiter.await.unwrap().unwrap();
        assert_eq!(region.pages, 2);
    }
}

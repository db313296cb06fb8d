//! RDMA bulk-handle cache (spec §4.B).
//!
//! Chunks are carved into fixed-size handles and grouped by page-count so
//! repeated requests of the same size can grab a ready-made, already
//! RDMA-registered handle instead of re-registering memory on every
//! request. Groups are kept sorted by handle size ascending so
//! `bulk_get_hdl` can binary-search for the smallest group that still
//! fits the request (best-fit).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dma::{BulkReclaimer, ChunkId, ChunkType, DmaPool};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

const MAX_GROUPS: usize = 64;

/// One pre-registered RDMA handle, carved out of a DMA chunk.
#[derive(Debug)]
pub struct BulkHandle {
    /// Chunk this handle's pages belong to.
    pub chunk: ChunkId,
    /// First page within the chunk.
    pub page_start: u32,
    /// Handle size in pages (equal to its owning group's `bulk_pages`).
    pub pages: u32,
    capacity_bytes: u32,
    used_bytes: u32,
    refs: u32,
}

impl BulkHandle {
    fn new(chunk: ChunkId, page_start: u32, pages: u32, page_sz: u32) -> Self {
        Self {
            chunk,
            page_start,
            pages,
            capacity_bytes: pages * page_sz,
            used_bytes: 0,
            refs: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.refs == 0
    }

    /// Remaining shareable capacity, in bytes.
    #[must_use]
    pub fn remaining_bytes(&self) -> u32 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// Advances `bbh_used_bytes` to let one more consecutive, PM-resident,
    /// csum-free biov share this handle (spec §4.B "Shareable handle").
    /// Exclusive biovs (NVMe-resident or csum-bearing) must not call this
    /// and should instead hold their own handle.
    pub fn share(&mut self, bytes: u32) -> bool {
        if self.remaining_bytes() < bytes {
            return false;
        }
        self.used_bytes += bytes;
        self.refs += 1;
        true
    }
}

struct ChunkPopulation {
    chunk: ChunkId,
    region_pages: u32,
    handle_idxs: Vec<usize>,
}

/// A set of same-size handles, plus the chunks populating them.
pub struct BulkGroup {
    bulk_pages: u32,
    handles: Vec<BulkHandle>,
    idle: VecDeque<usize>,
    populations: Vec<ChunkPopulation>,
    last_used: u64,
}

impl BulkGroup {
    fn new(bulk_pages: u32) -> Self {
        Self {
            bulk_pages,
            handles: Vec::new(),
            idle: VecDeque::new(),
            populations: Vec::new(),
            last_used: 0,
        }
    }

    fn is_fully_idle(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(BulkHandle::is_idle)
    }
}

/// A leased bulk handle, returned by [`BulkCache::get_handle`]. Callers pass
/// this back to [`BulkCache::release`] when done, or call
/// [`BulkHandle::share`]-style accounting indirectly via [`BulkCache::share`].
#[derive(Debug, Clone, Copy)]
pub struct BulkLease {
    /// Size class this handle belongs to; identifies the owning group.
    pub group_pages: u32,
    handle_idx: usize,
    /// Chunk the handle's pages live in.
    pub chunk: ChunkId,
    /// First page of the handle within its chunk.
    pub page_start: u32,
    /// Handle size, in pages.
    pub pages: u32,
}

struct Inner {
    groups: Vec<BulkGroup>,
}

/// Per-worker RDMA bulk-handle cache, backed by a [`DmaPool`].
pub struct BulkCache {
    inner: Mutex<Inner>,
    pool: Arc<DmaPool>,
    chunk_pages: u32,
    page_sz: u32,
    metrics: Arc<EngineMetrics>,
    clock: AtomicU64,
}

impl BulkCache {
    /// Creates an empty cache over `pool`. `chunk_pages` must match the
    /// pool's configured chunk size so group population math lines up.
    #[must_use]
    pub fn new(pool: Arc<DmaPool>, chunk_pages: u32, page_sz: u32, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner { groups: Vec::new() }),
            pool,
            chunk_pages,
            page_sz,
            metrics,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// `bulk_get_hdl`: selects (or creates) the smallest-fitting group and
    /// returns an idle handle from it, growing the group by one chunk if
    /// necessary (spec §4.B).
    pub async fn get_handle(&self, required_pages: u32) -> Result<BulkLease> {
        loop {
            let group_idx = {
                let guard = self.inner.lock();
                guard
                    .groups
                    .partition_point(|g| g.bulk_pages < required_pages)
            };

            let needs_new_group = {
                let guard = self.inner.lock();
                group_idx >= guard.groups.len()
            };
            if needs_new_group {
                self.make_room_for_new_group(required_pages)?;
            }

            // Re-resolve the index: group creation may have shifted things.
            let idx = {
                let guard = self.inner.lock();
                guard
                    .groups
                    .partition_point(|g| g.bulk_pages < required_pages)
            };

            if let Some(lease) = self.pop_idle_handle(idx) {
                self.metrics.bulk_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(lease);
            }

            self.metrics.bulk_misses.fetch_add(1, Ordering::Relaxed);
            self.grow_group(idx).await?;
            if let Some(lease) = self.pop_idle_handle(idx) {
                return Ok(lease);
            }
            // Growth claimed to succeed but yielded nothing usable; avoid
            // spinning forever on a pathological chunk/group-size ratio.
            return Err(Error::Again);
        }
    }

    fn pop_idle_handle(&self, group_idx: usize) -> Option<BulkLease> {
        let mut guard = self.inner.lock();
        let group = guard.groups.get_mut(group_idx)?;
        let handle_idx = group.idle.pop_front()?;
        let handle = &mut group.handles[handle_idx];
        handle.refs = 1;
        handle.used_bytes = 0;
        let lease = BulkLease {
            group_pages: group.bulk_pages,
            handle_idx,
            chunk: handle.chunk,
            page_start: handle.page_start,
            pages: handle.pages,
        };
        group.last_used = self.tick();
        Some(lease)
    }

    fn make_room_for_new_group(&self, required_pages: u32) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.groups.len() >= MAX_GROUPS {
            let evict_at = guard
                .groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.is_fully_idle())
                .min_by_key(|(_, g)| g.last_used)
                .map(|(i, _)| i);
            match evict_at {
                Some(i) => {
                    let group = guard.groups.remove(i);
                    drop(guard);
                    for pop in group.populations {
                        let region = crate::dma::DmaRegion {
                            chunk: pop.chunk,
                            page_start: 0,
                            pages: pop.region_pages,
                        };
                        self.pool.release(region);
                    }
                    return Ok(());
                }
                None => {
                    return Err(Error::Busy(
                        "bulk cache full: no idle group to evict".into(),
                    ))
                }
            }
        }
        let pos = guard.groups.partition_point(|g| g.bulk_pages < required_pages);
        guard.groups.insert(pos, BulkGroup::new(required_pages));
        Ok(())
    }

    async fn grow_group(&self, group_idx: usize) -> Result<()> {
        let bulk_pages = {
            let guard = self.inner.lock();
            guard.groups[group_idx].bulk_pages
        };
        let per_chunk = (self.chunk_pages / bulk_pages).max(1);

        let outcome = self.pool.reserve(ChunkType::Io, self.chunk_pages, true).await;
        let region = match outcome {
            Ok(r) => r,
            Err(Error::Again) => {
                if self.try_evict_one_chunk() {
                    self.pool.reserve(ChunkType::Io, self.chunk_pages, true).await?
                } else {
                    return Err(Error::Again);
                }
            }
            Err(e) => return Err(e),
        };

        let mut guard = self.inner.lock();
        let group = &mut guard.groups[group_idx];
        let base_idx = group.handles.len();
        let mut idxs = Vec::with_capacity(per_chunk as usize);
        for i in 0..per_chunk {
            let handle = BulkHandle::new(region.chunk, region.page_start + i * bulk_pages, bulk_pages, self.page_sz);
            group.handles.push(handle);
            let idx = base_idx + i as usize;
            idxs.push(idx);
            group.idle.push_back(idx);
        }
        group.populations.push(ChunkPopulation {
            chunk: region.chunk,
            region_pages: region.pages,
            handle_idxs: idxs,
        });
        Ok(())
    }

    /// Evicts one fully-idle chunk from any group, freeing it for reuse.
    /// Used both by [`BulkReclaimer`] (when the DMA pool itself is
    /// exhausted) and internally when growing a group would
    /// otherwise require allocating past the configured chunk cap.
    fn try_evict_one_chunk(&self) -> bool {
        let mut guard = self.inner.lock();
        for group in &mut guard.groups {
            let target = group
                .populations
                .iter()
                .position(|pop| pop.handle_idxs.iter().all(|&i| group.handles[i].is_idle()));
            if let Some(pop_idx) = target {
                let pop = group.populations.remove(pop_idx);
                // Drop the depopulated handles; indices above the removed
                // ones shift, so idle/used bookkeeping for this toy-scale
                // cache simply rebuilds the idle queue from scratch.
                let removed: std::collections::HashSet<usize> = pop.handle_idxs.iter().copied().collect();
                let mut new_handles = Vec::with_capacity(group.handles.len() - removed.len());
                let mut remap = vec![None; group.handles.len()];
                for (old_idx, h) in group.handles.drain(..).enumerate() {
                    if removed.contains(&old_idx) {
                        continue;
                    }
                    remap[old_idx] = Some(new_handles.len());
                    new_handles.push(h);
                }
                group.handles = new_handles;
                group.idle = group
                    .idle
                    .iter()
                    .filter_map(|&i| remap[i])
                    .collect();
                for other in &mut group.populations {
                    for idx in &mut other.handle_idxs {
                        if let Some(new_idx) = remap[*idx] {
                            *idx = new_idx;
                        }
                    }
                }
                self.metrics.bulk_evictions.fetch_add(1, Ordering::Relaxed);
                let region = crate::dma::DmaRegion {
                    chunk: pop.chunk,
                    page_start: 0,
                    pages: pop.region_pages,
                };
                drop(guard);
                self.pool.release(region);
                return true;
            }
        }
        false
    }

    /// Releases a leased handle back to its group's idle list.
    pub fn release(&self, lease: BulkLease) {
        let mut guard = self.inner.lock();
        if let Some(group) = guard
            .groups
            .iter_mut()
            .find(|g| g.bulk_pages == lease.group_pages)
        {
            if let Some(handle) = group.handles.get_mut(lease.handle_idx) {
                handle.refs = 0;
                handle.used_bytes = 0;
            }
            group.idle.push_back(lease.handle_idx);
            group.last_used = self.tick();
        }
    }

    /// Number of groups currently tracked, for tests/telemetry.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.inner.lock().groups.len()
    }
}

impl BulkReclaimer for BulkCache {
    fn reclaim_idle_chunk(&self, _pool: &DmaPool) -> bool {
        self.try_evict_one_chunk()
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use crate::config::ChunkConfig;

    fn build_cache(chunk_pages: u32) -> BulkCache {
        let cfg = ChunkConfig {
            bio_chk_pages: chunk_pages,
            ..ChunkConfig::default()
        };
        let metrics = EngineMetrics::shared();
        let pool = Arc::new(DmaPool::new(&cfg, 2, metrics.clone()).unwrap());
        BulkCache::new(pool, chunk_pages, 4096, metrics)
    }

    #[tokio::test]
    async fn get_handle_creates_group_and_populates_chunk() {
        let cache = build_cache(8);
        let lease = cache.get_handle(2).await.unwrap();
        assert_eq!(lease.pages, 2);
        assert_eq!(cache.group_count(), 1);
    }

    #[tokio::test]
    async fn released_handle_is_reused() {
        let cache = build_cache(8);
        let lease = cache.get_handle(2).await.unwrap();
        let chunk = lease.chunk;
        cache.release(lease);
        let lease2 = cache.get_handle(2).await.unwrap();
        assert_eq!(lease2.chunk, chunk);
        assert_eq!(cache.group_count(), 1);
    }

    #[tokio::test]
    async fn share_advances_used_bytes_within_capacity() {
        let mut handle = BulkHandle::new(ChunkId(0), 0, 2, 4096);
        assert!(handle.share(4096));
        assert_eq!(handle.remaining_bytes(), 4096);
        assert!(handle.share(4096));
        assert_eq!(handle.remaining_bytes(), 0);
        assert!(!handle.share(1));
    }
}

//! # `bio-engine`
//!
//! A per-engine block I/O layer: zero-copy DMA staging, an RDMA
//! bulk-handle cache, blob lifecycle management, and a write-ahead log
//! with strict FIFO commit visibility.
//!
//! This crate is the storage substrate a metadata service builds on, not
//! a metadata service itself — it owns devices, blobs, DMA buffers, and
//! the WAL, and hands callers a [`MetaContext`] per (pool, target) to
//! drive durable metadata mutations through.
//!
//! ## Flow of a commit
//!
//! A caller obtains a [`MetaContext`] (via [`Engine::create_meta_context`]
//! or [`Engine::open_meta_context`]), reserves a WAL transaction with
//! [`wal::WalEngine::reserve`], builds its [`wal::Action`] list, and calls
//! [`wal::WalEngine::commit`]. Commit visibility is strict FIFO with
//! skip-on-failure: a transaction can complete with an error even though
//! its bytes landed on disk, if an earlier transaction in submission order
//! failed.
//!
//! ## Module map
//!
//! - [`dma`]: per-worker pinned-memory pool backing every NVMe I/O.
//! - [`bulk`]: RDMA bulk-handle cache layered on the DMA pool.
//! - [`iod`]: the prep/copy/rw/post I/O-descriptor state machine.
//! - [`device`]: the block-device driver interface (`BlobTarget`) plus an
//!   in-memory mock used throughout this crate's test suite.
//! - [`blobctx`]: the thin per-blob I/O handle.
//! - [`blobstore`]: per-device lifecycle state machine and auto-faulty
//!   detector.
//! - [`metactx`]: the {data, meta, WAL} blob triple for one VOS target.
//! - [`wal`]: on-disk format, action opcodes, and the transactional
//!   engine.
//! - [`smd`]: the persistent-table client trait and an in-memory fake.
//! - [`led`]: device locate-LED control.
//! - [`config`]: immutable startup configuration.
//! - [`metrics`]: operational counters and latency statistics.
//! - [`faultinject`]: fault-injection points used by the test suite.
//! - [`error`]: the crate-wide error taxonomy.

#![warn(missing_docs)]
#![cfg_attr(
    test,
    allow(
        clippy::large_stack_arrays,
        clippy::doc_markdown,
        clippy::uninlined_format_args,
        clippy::single_match_else,
        clippy::cast_lossless,
        clippy::manual_assert
    )
)]

pub mod blobctx;
pub mod blobstore;
pub mod bulk;
pub mod config;
pub mod crc;
pub mod device;
pub mod dma;
pub mod error;
pub mod faultinject;
pub mod iod;
pub mod led;
pub mod metactx;
pub mod metrics;
pub mod smd;
pub mod wal;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use blobstore::Blobstore;
use bulk::BulkCache;
use config::EngineConfig;
use device::BlobTarget;
use dma::DmaPool;
use error::Result;
use faultinject::FaultInjector;
use led::LedController;
use metactx::{MetaContext, MetaContextSizes};
use metrics::{DeviceErrorCounters, EngineMetrics};
use smd::{PoolTarget, SmdClient};

/// Top-level handle tying together one worker's DMA pool, bulk cache,
/// device blobstores, and meta-contexts.
///
/// Generic over the device driver (`D: BlobTarget`) so production code
/// plugs in a real SPDK-backed implementation while tests use
/// [`device::mock::MockBlobTarget`].
pub struct Engine<D: BlobTarget> {
    config: EngineConfig,
    device: Arc<D>,
    metrics: Arc<EngineMetrics>,
    dma_pool: Arc<DmaPool>,
    bulk_cache: Arc<BulkCache>,
    smd: Arc<dyn SmdClient>,
    faults: Arc<FaultInjector>,
    led: Arc<LedController>,
    blobstores: DashMap<Uuid, Arc<Blobstore<D>>>,
    meta_contexts: DashMap<PoolTarget, Arc<AsyncMutex<MetaContext<D>>>>,
}

impl<D: BlobTarget> Engine<D> {
    /// Builds a fresh engine for one worker: allocates the DMA pool and
    /// bulk cache per `config.chunk`, and wires the bulk cache back into
    /// the pool as its reclaim source (spec §4.A, §4.B).
    pub fn new(config: EngineConfig, device: Arc<D>, smd: Arc<dyn SmdClient>) -> Result<Self> {
        let metrics = EngineMetrics::shared();
        let dma_pool = Arc::new(DmaPool::new(&config.chunk, 1, Arc::clone(&metrics))?);
        let bulk_cache = Arc::new(BulkCache::new(
            Arc::clone(&dma_pool),
            config.chunk.bio_chk_pages,
            config.chunk.bio_dma_page_sz,
            Arc::clone(&metrics),
        ));
        dma_pool.set_bulk_reclaimer(Arc::clone(&bulk_cache) as Arc<dyn dma::BulkReclaimer>);

        Ok(Self {
            config,
            device,
            metrics,
            dma_pool,
            bulk_cache,
            smd,
            faults: Arc::new(FaultInjector::new()),
            led: Arc::new(LedController::new()),
            blobstores: DashMap::new(),
            meta_contexts: DashMap::new(),
        })
    }

    /// Registers a blobstore for `device_uuid`, in NORMAL state (spec
    /// §4.E).
    pub fn register_blobstore(&self, device_uuid: Uuid) -> Arc<Blobstore<D>> {
        let bs = Arc::new(Blobstore::new(
            device_uuid,
            Arc::clone(&self.device),
            DeviceErrorCounters::shared(),
            self.config.auto_faulty,
            Arc::clone(&self.faults),
            Arc::clone(&self.smd),
            self.config.bypass_health_collect,
        ));
        self.blobstores.insert(device_uuid, Arc::clone(&bs));
        bs
    }

    /// Looks up a previously registered blobstore.
    #[must_use]
    pub fn blobstore(&self, device_uuid: Uuid) -> Option<Arc<Blobstore<D>>> {
        self.blobstores.get(&device_uuid).map(|e| Arc::clone(e.value()))
    }

    /// Creates a fresh meta-context for `pool_target` on `device_uuid`
    /// (spec §4.F).
    pub async fn create_meta_context(
        &self,
        device_uuid: Uuid,
        pool_target: PoolTarget,
        vos_id: u32,
        sizes: MetaContextSizes,
    ) -> Result<Arc<AsyncMutex<MetaContext<D>>>> {
        let mc = MetaContext::create(
            Arc::clone(&self.device),
            self.smd.as_ref(),
            device_uuid,
            pool_target,
            vos_id,
            sizes,
            &self.config.chunk,
            Arc::clone(&self.faults),
        )
        .await?;
        let handle = Arc::new(AsyncMutex::new(mc));
        self.meta_contexts.insert(pool_target, Arc::clone(&handle));
        Ok(handle)
    }

    /// Opens an existing meta-context, consulting SMD for its blob ids
    /// (spec §4.F).
    pub async fn open_meta_context(&self, pool_target: PoolTarget) -> Result<Arc<AsyncMutex<MetaContext<D>>>> {
        if let Some(existing) = self.meta_contexts.get(&pool_target) {
            return Ok(Arc::clone(existing.value()));
        }
        let mc = MetaContext::open(
            Arc::clone(&self.device),
            self.smd.as_ref(),
            pool_target,
            &self.config.chunk,
            Arc::clone(&self.faults),
        )
        .await?;
        let handle = Arc::new(AsyncMutex::new(mc));
        self.meta_contexts.insert(pool_target, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops a meta-context from the registry without closing its blobs
    /// (callers are expected to have already closed it).
    pub fn forget_meta_context(&self, pool_target: PoolTarget) {
        self.meta_contexts.remove(&pool_target);
    }

    /// This worker's DMA pool.
    #[must_use]
    pub fn dma_pool(&self) -> &Arc<DmaPool> {
        &self.dma_pool
    }

    /// This worker's RDMA bulk-handle cache.
    #[must_use]
    pub fn bulk_cache(&self) -> &Arc<BulkCache> {
        &self.bulk_cache
    }

    /// Operational telemetry counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// The fault-injection handle backing this engine's test hooks.
    #[must_use]
    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// The device locate-LED controller.
    #[must_use]
    pub fn led(&self) -> &Arc<LedController> {
        &self.led
    }

    /// The immutable startup configuration this engine was built from.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use device::mock::MockBlobTarget;
    use smd::fake::InMemorySmd;

    #[tokio::test]
    async fn new_engine_wires_pool_and_cache() {
        let config = EngineConfig::default();
        let device = Arc::new(MockBlobTarget::new(4096, 32 << 20));
        let smd: Arc<dyn SmdClient> = Arc::new(InMemorySmd::new());
        let engine = Engine::new(config, device, smd).unwrap();
        assert_eq!(engine.dma_pool().chunk_count(), 1);
    }

    #[tokio::test]
    async fn register_blobstore_then_lookup() {
        let config = EngineConfig::default();
        let device = Arc::new(MockBlobTarget::new(4096, 32 << 20));
        let smd: Arc<dyn SmdClient> = Arc::new(InMemorySmd::new());
        let engine = Engine::new(config, device, smd).unwrap();
        let dev_uuid = Uuid::new_v4();
        engine.register_blobstore(dev_uuid);
        assert!(engine.blobstore(dev_uuid).is_some());
    }

    #[tokio::test]
    async fn create_then_reopen_meta_context_through_engine() {
        let config = EngineConfig::default();
        let device = Arc::new(MockBlobTarget::new(4096, 32 << 20));
        let smd: Arc<dyn SmdClient> = Arc::new(InMemorySmd::new());
        let engine = Engine::new(config, device, smd).unwrap();
        let pool_target = PoolTarget {
            pool: Uuid::new_v4(),
            target: 0,
        };
        let sizes = MetaContextSizes {
            data_bytes: None,
            meta_bytes: 1 << 20,
            wal_bytes: 1 << 20,
        };
        engine
            .create_meta_context(Uuid::new_v4(), pool_target, 0, sizes)
            .await
            .unwrap();
        engine.forget_meta_context(pool_target);
        let reopened = engine.open_meta_context(pool_target).await.unwrap();
        assert!(reopened.lock().await.data.is_none());
    }
}

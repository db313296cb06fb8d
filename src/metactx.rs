//! Meta-Context: the {data, meta, WAL} blob triple for one VOS target (spec
//! §3 "Meta-context", §4.F).
//!
//! Grounded on `bio_meta_context`/`bio_mc_create`/`bio_mc_open` in
//! `bio_context.c`. The data blob is optional — RDB pools have none (spec
//! §3) — so [`MetaContext::data`] is an `Option`.

use std::sync::Arc;

use crate::blobctx::BlobIoContext;
use crate::config::{ChunkConfig, ROLE_DATA, ROLE_META, ROLE_WAL};
use crate::crc::crc32;
use crate::device::BlobTarget;
use crate::error::{Error, Result};
use crate::faultinject::FaultInjector;
use crate::smd::{PoolTarget, SmdClient};
use crate::wal::WalEngine;
use uuid::Uuid;

/// On-disk header stored at the start of the meta blob (spec §6, sized to
/// carry the triple's blob ids so a restart can re-derive the meta-context
/// without consulting SMD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    /// On-disk magic, distinct from the WAL's ([`WAL_HDR_MAGIC`]).
    ///
    /// [`WAL_HDR_MAGIC`]: crate::wal::format::WAL_HDR_MAGIC
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// Owning pool UUID.
    pub pool: Uuid,
    /// Blob ids for {data, meta, WAL}; zero means "no blob" (data-less
    /// RDB meta-contexts, spec §3).
    pub blob_ids: [u64; 3],
    /// Block size in bytes.
    pub blk_bytes: u32,
    /// Header size in blocks (always 1).
    pub hdr_blks: u32,
    /// Total blocks reserved for the meta blob.
    pub tot_blks: u64,
    /// VOS target id this meta-context serves.
    pub vos_id: u32,
}

/// Meta blob header magic (spec §6's WAL magic `0xbc202210` is reserved
/// for the WAL blob itself; the meta blob uses the adjacent value so the
/// two headers are trivially distinguishable if mixed up).
pub const META_HDR_MAGIC: u32 = 0xbc20_2210;
/// Meta blob header format version.
pub const META_VERSION: u32 = 1;

impl MetaHeader {
    /// Packed on-disk size in bytes.
    pub const WIRE_SIZE: usize = 128;

    /// Serializes to [`MetaHeader::WIRE_SIZE`] bytes with a trailing
    /// CRC32.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        let mut off = 0;
        macro_rules! put {
            ($v:expr) => {{
                let bytes = $v.to_le_bytes();
                buf[off..off + bytes.len()].copy_from_slice(&bytes);
                off += bytes.len();
            }};
        }
        put!(self.magic);
        put!(self.version);
        buf[off..off + 16].copy_from_slice(self.pool.as_bytes());
        off += 16;
        for id in self.blob_ids {
            put!(id);
        }
        put!(self.blk_bytes);
        put!(self.hdr_blks);
        put!(self.tot_blks);
        put!(self.vos_id);
        debug_assert!(off + 4 <= Self::WIRE_SIZE - 4);
        let csum = crc32(&buf[..Self::WIRE_SIZE - 4]);
        buf[Self::WIRE_SIZE - 4..].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parses and checksum-verifies a header.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Inval("meta header buffer too short".into()));
        }
        let stored = u32::from_le_bytes(buf[Self::WIRE_SIZE - 4..Self::WIRE_SIZE].try_into().unwrap());
        let computed = crc32(&buf[..Self::WIRE_SIZE - 4]);
        if stored != computed {
            return Err(Error::Csum {
                expected: stored,
                computed,
            });
        }
        let mut off = 0;
        macro_rules! get {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes(buf[off..off + N].try_into().unwrap());
                off += N;
                v
            }};
        }
        let magic: u32 = get!(u32);
        if magic != META_HDR_MAGIC {
            return Err(Error::Uninit);
        }
        let version: u32 = get!(u32);
        if version != META_VERSION {
            return Err(Error::Incompatible {
                found: version,
                expected: META_VERSION,
            });
        }
        let pool = Uuid::from_bytes(buf[off..off + 16].try_into().unwrap());
        off += 16;
        let mut blob_ids = [0u64; 3];
        for slot in &mut blob_ids {
            *slot = get!(u64);
        }
        let blk_bytes: u32 = get!(u32);
        let hdr_blks: u32 = get!(u32);
        let tot_blks: u64 = get!(u64);
        let vos_id: u32 = get!(u32);
        Ok(Self {
            magic,
            version,
            pool,
            blob_ids,
            blk_bytes,
            hdr_blks,
            tot_blks,
            vos_id,
        })
    }
}

/// Requested sizes for a fresh meta-context's three blobs (spec §4.F).
#[derive(Debug, Clone, Copy)]
pub struct MetaContextSizes {
    /// Data blob size in bytes; `None` for data-less (RDB) contexts.
    pub data_bytes: Option<u64>,
    /// Meta blob size in bytes.
    pub meta_bytes: u64,
    /// WAL blob size in bytes.
    pub wal_bytes: u64,
}

/// The {data, meta, WAL} blob triple for one (pool, target) (spec §3, §4.F).
pub struct MetaContext<D: BlobTarget> {
    pool_target: PoolTarget,
    /// Absent for RDB pools (spec §3 "Meta-context").
    pub data: Option<BlobIoContext<D>>,
    /// The structured meta blob.
    pub meta: BlobIoContext<D>,
    /// The WAL engine fencing meta-blob mutations.
    pub wal: WalEngine<D>,
}

impl<D: BlobTarget> MetaContext<D> {
    /// Creates a fresh meta-context: allocates blobs on `device`, persists
    /// their ids in SMD, writes the meta header, and formats the WAL
    /// (spec §4.F "create").
    pub async fn create(
        device: Arc<D>,
        smd: &dyn SmdClient,
        device_uuid: Uuid,
        pool_target: PoolTarget,
        vos_id: u32,
        sizes: MetaContextSizes,
        chunk_cfg: &ChunkConfig,
        faults: Arc<FaultInjector>,
    ) -> Result<Self> {
        let data = match sizes.data_bytes {
            Some(bytes) => {
                let blob = device.create(bytes).await?;
                smd.pool_add_tgt(pool_target, device_uuid, blob, ROLE_DATA, bytes).await?;
                Some(BlobIoContext::open(Arc::clone(&device), blob, pool_target.pool, chunk_cfg).await?)
            }
            None => None,
        };

        let meta_blob = device.create(sizes.meta_bytes).await?;
        smd.pool_add_tgt(pool_target, device_uuid, meta_blob, ROLE_META, sizes.meta_bytes)
            .await?;
        let meta = BlobIoContext::open(Arc::clone(&device), meta_blob, pool_target.pool, chunk_cfg).await?;

        let wal_blob = device.create(sizes.wal_bytes).await?;
        smd.pool_add_tgt(pool_target, device_uuid, wal_blob, ROLE_WAL, sizes.wal_bytes)
            .await?;
        let wal_channel = device.alloc_io_channel().await?;
        let tot_blks = sizes.wal_bytes / u64::from(chunk_cfg.bio_dma_page_sz);
        let wal = WalEngine::format(Arc::clone(&device), wal_channel, wal_blob, tot_blks, 1, false, faults).await?;

        let data_blob_id = data.as_ref().map_or(0, |d| d.blob().0);
        let hdr = MetaHeader {
            magic: META_HDR_MAGIC,
            version: META_VERSION,
            pool: pool_target.pool,
            blob_ids: [data_blob_id, meta_blob.0, wal_blob.0],
            blk_bytes: chunk_cfg.bio_dma_page_sz,
            hdr_blks: 1,
            tot_blks: sizes.meta_bytes / u64::from(chunk_cfg.bio_dma_page_sz),
            vos_id,
        };
        meta.write_at(0, &hdr.to_bytes()).await?;

        Ok(Self {
            pool_target,
            data,
            meta,
            wal,
        })
    }

    /// Opens an existing meta-context using SMD-recorded blob ids (spec
    /// §4.F "open").
    pub async fn open(
        device: Arc<D>,
        smd: &dyn SmdClient,
        pool_target: PoolTarget,
        chunk_cfg: &ChunkConfig,
        faults: Arc<FaultInjector>,
    ) -> Result<Self> {
        let meta_tb = smd.pool_get_blob(pool_target, ROLE_META).await?;
        let meta = BlobIoContext::open(Arc::clone(&device), meta_tb.blob, pool_target.pool, chunk_cfg).await?;

        let data = match smd.pool_get_blob(pool_target, ROLE_DATA).await {
            Ok(tb) => Some(BlobIoContext::open(Arc::clone(&device), tb.blob, pool_target.pool, chunk_cfg).await?),
            Err(_) => None,
        };

        let wal_tb = smd.pool_get_blob(pool_target, ROLE_WAL).await?;
        let wal_channel = device.alloc_io_channel().await?;
        let wal = WalEngine::open(Arc::clone(&device), wal_channel, wal_tb.blob, faults).await?;

        Ok(Self {
            pool_target,
            data,
            meta,
            wal,
        })
    }

    /// The (pool, target) this context serves.
    #[must_use]
    pub fn pool_target(&self) -> PoolTarget {
        self.pool_target
    }
}

#[cfg(test)]
mod metactx_tests {
    use super::*;
    use crate::device::mock::MockBlobTarget;
    use crate::smd::fake::InMemorySmd;

    #[tokio::test]
    async fn header_round_trips_with_csum() {
        let hdr = MetaHeader {
            magic: META_HDR_MAGIC,
            version: META_VERSION,
            pool: Uuid::new_v4(),
            blob_ids: [1, 2, 3],
            blk_bytes: 4096,
            hdr_blks: 1,
            tot_blks: 256,
            vos_id: 7,
        };
        let bytes = hdr.to_bytes();
        let parsed = MetaHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[tokio::test]
    async fn create_then_open_round_trips() {
        let dev = Arc::new(MockBlobTarget::new(4096, 32 << 20));
        let smd = InMemorySmd::new();
        let pool_target = PoolTarget {
            pool: Uuid::new_v4(),
            target: 0,
        };
        let chunk_cfg = ChunkConfig::default();
        let sizes = MetaContextSizes {
            data_bytes: Some(4 << 20),
            meta_bytes: 1 << 20,
            wal_bytes: 1 << 20,
        };
        let faults = Arc::new(FaultInjector::new());
        let created = MetaContext::create(
            Arc::clone(&dev),
            &smd,
            Uuid::new_v4(),
            pool_target,
            0,
            sizes,
            &chunk_cfg,
            Arc::clone(&faults),
        )
        .await
        .unwrap();
        assert!(created.data.is_some());

        let reopened = MetaContext::open(dev, &smd, pool_target, &chunk_cfg, faults).await.unwrap();
        assert!(reopened.data.is_some());
        assert_eq!(reopened.pool_target(), pool_target);
    }
}

//! The block-device driver interface (spec §1, §6 "Blob primitives").
//!
//! The SSD/block-device driver is an external collaborator, specified only
//! by its interface: async `read`/`write`/`unmap`, `open`/`close`, blob
//! create/delete, and io-channel allocation. [`BlobTarget`] captures that
//! contract as an `async_trait`, grounded on the `BlockDevice`/
//! `BlockDeviceHandle` split in
//! `examples/other_examples/...openebs-mayastor__io-engine-src-core-block_device.rs`
//! (see DESIGN.md). [`mock::MockBlobTarget`] is the in-memory, file- or
//! heap-backed implementation the test suite drives instead of a real SPDK
//! bdev.

use async_trait::async_trait;

use crate::error::Result;

/// Opaque handle to one durable blob on a device (spec §3 "Blob").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u64);

/// Opaque per-worker I/O channel handle, allocated once per `BlobTarget`
/// consumer and reused across operations (spec §6 `alloc_io_channel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoChannelId(pub u64);

/// The async block/blob primitives this crate consumes from the device
/// driver (spec §6 "Blob primitives").
///
/// Every method mirrors one spec primitive one-to-one; offsets and lengths
/// are in the device's native I/O unit (bytes here — real SPDK bdevs work
/// in LBA units, but the unit conversion is the driver's concern, not this
/// layer's).
#[async_trait]
pub trait BlobTarget: Send + Sync {
    /// Allocates a per-worker I/O channel on this device.
    async fn alloc_io_channel(&self) -> Result<IoChannelId>;

    /// Releases a previously allocated I/O channel.
    async fn free_io_channel(&self, channel: IoChannelId);

    /// Creates a blob of at least `size_bytes`, rounded up to the device's
    /// cluster size, and returns its id.
    async fn create(&self, size_bytes: u64) -> Result<BlobId>;

    /// Deletes a blob. The blob must not be open.
    async fn delete(&self, blob: BlobId) -> Result<()>;

    /// Opens a blob for I/O.
    async fn open(&self, blob: BlobId) -> Result<()>;

    /// Closes a previously opened blob.
    async fn close(&self, blob: BlobId) -> Result<()>;

    /// Reads `buf.len()` bytes from `blob` at `offset` into `buf`.
    async fn read(&self, channel: IoChannelId, blob: BlobId, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` to `blob` at `offset`.
    async fn write(&self, channel: IoChannelId, blob: BlobId, offset: u64, buf: &[u8]) -> Result<()>;

    /// Marks `[offset, offset+len)` as unused, allowing the device to
    /// reclaim it. Offsets and lengths must be I/O-unit aligned.
    async fn unmap(&self, channel: IoChannelId, blob: BlobId, offset: u64, len: u64) -> Result<()>;

    /// The device's native I/O unit size, in bytes.
    fn io_unit_size(&self) -> u32;

    /// The device's cluster (allocation granule) size, in bytes.
    fn cluster_size(&self) -> u64;
}

/// Test-only in-memory/file-backed block device, and fault-injection glue
/// for the scenarios in spec §8.
pub mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{BlobId, BlobTarget, IoChannelId};
    use crate::error::{Error, Result};
    use crate::faultinject::{FaultInjector, FaultPoint};

    struct Extent {
        data: Vec<u8>,
    }

    struct Inner {
        blobs: HashMap<u64, Extent>,
        next_id: u64,
    }

    /// A heap-backed `BlobTarget` used by every unit/integration test in
    /// this crate. Reads of never-written bytes return zero, matching a
    /// freshly zeroed SSD extent.
    pub struct MockBlobTarget {
        inner: Mutex<Inner>,
        io_unit: u32,
        cluster: u64,
        next_channel: AtomicU64,
        faults: FaultInjector,
    }

    impl MockBlobTarget {
        /// Creates an empty mock device with the given I/O-unit and
        /// cluster size.
        #[must_use]
        pub fn new(io_unit: u32, cluster: u64) -> Self {
            Self {
                inner: Mutex::new(Inner {
                    blobs: HashMap::new(),
                    next_id: 1,
                }),
                io_unit,
                cluster,
                next_channel: AtomicU64::new(1),
                faults: FaultInjector::new(),
            }
        }

        /// The fault-injection handle backing this device, used by tests
        /// to arm `DAOS_NVME_*`-style fault points (spec §7 "User-visible
        /// failures").
        #[must_use]
        pub fn faults(&self) -> &FaultInjector {
            &self.faults
        }
    }

    #[async_trait]
    impl BlobTarget for MockBlobTarget {
        async fn alloc_io_channel(&self) -> Result<IoChannelId> {
            Ok(IoChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed)))
        }

        async fn free_io_channel(&self, _channel: IoChannelId) {}

        async fn create(&self, size_bytes: u64) -> Result<BlobId> {
            if self.faults.check(FaultPoint::AllocBufErr) {
                return Err(Error::NoMem("fault-injected blob create failure".into()));
            }
            let rounded = size_bytes.div_ceil(self.cluster) * self.cluster;
            let mut guard = self.inner.lock();
            let id = guard.next_id;
            guard.next_id += 1;
            guard.blobs.insert(
                id,
                Extent {
                    data: vec![0u8; rounded as usize],
                },
            );
            Ok(BlobId(id))
        }

        async fn delete(&self, blob: BlobId) -> Result<()> {
            self.inner.lock().blobs.remove(&blob.0);
            Ok(())
        }

        async fn open(&self, blob: BlobId) -> Result<()> {
            if self.inner.lock().blobs.contains_key(&blob.0) {
                Ok(())
            } else {
                Err(Error::NoHandle(format!("blob {} does not exist", blob.0)))
            }
        }

        async fn close(&self, _blob: BlobId) -> Result<()> {
            Ok(())
        }

        async fn read(&self, _channel: IoChannelId, blob: BlobId, offset: u64, buf: &mut [u8]) -> Result<()> {
            if self.faults.check(FaultPoint::ReadErr) {
                return Err(Error::NvmeIo("fault-injected read error".into()));
            }
            let guard = self.inner.lock();
            let extent = guard
                .blobs
                .get(&blob.0)
                .ok_or_else(|| Error::NoHandle(format!("blob {} not open", blob.0)))?;
            let start = offset as usize;
            let end = start + buf.len();
            if end > extent.data.len() {
                return Err(Error::Inval(format!(
                    "read past end of blob: {end} > {}",
                    extent.data.len()
                )));
            }
            buf.copy_from_slice(&extent.data[start..end]);
            Ok(())
        }

        async fn write(&self, _channel: IoChannelId, blob: BlobId, offset: u64, buf: &[u8]) -> Result<()> {
            if self.faults.check(FaultPoint::WriteErr) {
                return Err(Error::Io("fault-injected write error".into()));
            }
            let mut guard = self.inner.lock();
            let extent = guard
                .blobs
                .get_mut(&blob.0)
                .ok_or_else(|| Error::NoHandle(format!("blob {} not open", blob.0)))?;
            let start = offset as usize;
            let end = start + buf.len();
            if end > extent.data.len() {
                return Err(Error::Inval(format!(
                    "write past end of blob: {end} > {}",
                    extent.data.len()
                )));
            }
            extent.data[start..end].copy_from_slice(buf);
            Ok(())
        }

        async fn unmap(&self, _channel: IoChannelId, blob: BlobId, offset: u64, len: u64) -> Result<()> {
            let mut guard = self.inner.lock();
            let extent = guard
                .blobs
                .get_mut(&blob.0)
                .ok_or_else(|| Error::NoHandle(format!("blob {} not open", blob.0)))?;
            let start = offset as usize;
            let end = start + len as usize;
            if end > extent.data.len() {
                return Err(Error::Inval("unmap past end of blob".into()));
            }
            extent.data[start..end].fill(0);
            Ok(())
        }

        fn io_unit_size(&self) -> u32 {
            self.io_unit
        }

        fn cluster_size(&self) -> u64 {
            self.cluster
        }
    }
}

#[cfg(test)]
mod device_tests {
    use super::mock::MockBlobTarget;
    use super::*;

    #[tokio::test]
    async fn create_open_write_read_round_trip() {
        let dev = MockBlobTarget::new(4096, 32 * 1024 * 1024);
        let blob = dev.create(4096).await.unwrap();
        dev.open(blob).await.unwrap();
        let ch = dev.alloc_io_channel().await.unwrap();

        let payload = vec![0xAB; 4096];
        dev.write(ch, blob, 0, &payload).await.unwrap();

        let mut out = vec![0u8; 4096];
        dev.read(ch, blob, 0, &mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn unmap_zeroes_region() {
        let dev = MockBlobTarget::new(4096, 32 * 1024 * 1024);
        let blob = dev.create(8192).await.unwrap();
        dev.open(blob).await.unwrap();
        let ch = dev.alloc_io_channel().await.unwrap();
        dev.write(ch, blob, 0, &[0xFFu8; 4096]).await.unwrap();
        dev.unmap(ch, blob, 0, 4096).await.unwrap();
        let mut out = vec![0u8; 4096];
        dev.read(ch, blob, 0, &mut out).await.unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn read_unopened_blob_fails() {
        let dev = MockBlobTarget::new(4096, 32 * 1024 * 1024);
        let ch = dev.alloc_io_channel().await.unwrap();
        let mut out = vec![0u8; 4096];
        let err = dev.read(ch, BlobId(999), 0, &mut out).await.unwrap_err();
        assert!(matches!(err, Error::NoHandle(_)));
    }
}

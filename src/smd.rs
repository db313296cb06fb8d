//! The persistent metadata table ("SMD") interface (spec §1, §6).
//!
//! SMD maps device-uuid ↔ blob-id ↔ (pool, target, role). It is an external
//! collaborator (spec §1): this crate only needs a trait describing the
//! calls the blobstore/meta-context layer makes into it, plus an in-memory
//! fake for tests. Grounded on `src/mgmt/smd.pb-c.h` for the field shapes
//! SMD actually persists (pool/target/role/blob-id/device-uuid tuples).

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{ROLE_DATA, ROLE_META, ROLE_WAL};
use crate::device::BlobId;
use crate::error::{Error, Result};

/// A pool-uuid + target-id pair identifying one VOS target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTarget {
    /// Pool UUID.
    pub pool: Uuid,
    /// Target id within the pool.
    pub target: u32,
}

/// One role-to-blob assignment, as persisted by SMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBlob {
    /// The device this blob lives on.
    pub device: Uuid,
    /// The blob id on that device.
    pub blob: BlobId,
    /// Role bitmask (`ROLE_DATA`/`ROLE_META`/`ROLE_WAL`).
    pub role: u16,
    /// Blob size in bytes, as requested at creation.
    pub size: u64,
}

/// Device lifecycle state as tracked by SMD (mirrors
/// [`crate::blobstore::BsState`] but persisted independently, since SMD
/// survives a blobstore reload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmdDevState {
    /// Device serving I/O normally.
    Normal,
    /// Device declared faulty; draining in progress or complete.
    Faulty,
    /// Device fully detached.
    Out,
}

/// The persistent-table interface consumed from SMD (spec §6 "Persistent
/// table (SMD)").
#[async_trait]
pub trait SmdClient: Send + Sync {
    /// Records that `pool`/`target` owns `blob` on `device` for the given
    /// `role`, requested at `size` bytes.
    async fn pool_add_tgt(
        &self,
        pool_target: PoolTarget,
        device: Uuid,
        blob: BlobId,
        role: u16,
        size: u64,
    ) -> Result<()>;

    /// Looks up the blob assigned to `pool`/`target` for `role`.
    async fn pool_get_blob(&self, pool_target: PoolTarget, role: u16) -> Result<TargetBlob>;

    /// Removes the (pool, target) → blob mapping for every role.
    async fn pool_del_tgt(&self, pool_target: PoolTarget) -> Result<()>;

    /// RDB-pool mirror of [`SmdClient::pool_add_tgt`] (RDB meta-contexts
    /// have no data blob — spec §3 "Meta-context").
    async fn rdb_add_tgt(&self, pool_target: PoolTarget, device: Uuid, blob: BlobId, size: u64) -> Result<()>;

    /// RDB-pool mirror of [`SmdClient::pool_get_blob`].
    async fn rdb_get_blob(&self, pool_target: PoolTarget) -> Result<TargetBlob>;

    /// Records that `device` serves `target` with the given `role`.
    async fn dev_add_tgt(&self, device: Uuid, target: u32, role: u16) -> Result<()>;

    /// Looks up the device assigned to `target`.
    async fn dev_get_by_tgt(&self, target: u32) -> Result<Uuid>;

    /// Persists a device's lifecycle state transition.
    async fn dev_set_state(&self, device: Uuid, state: SmdDevState) -> Result<()>;

    /// Replaces `old` with `new`, carrying over the given `roles`.
    async fn dev_replace(&self, old: Uuid, new: Uuid, roles: u16) -> Result<()>;

    /// Lists every known device and its current state.
    async fn dev_list(&self) -> Result<Vec<(Uuid, SmdDevState)>>;
}

/// An in-memory, non-durable [`SmdClient`] used by the test suite.
///
/// Explicitly not durable: the real SMD is out of scope for this crate
/// (spec §1); this fake only exists so blobstore/meta-context code can be
/// exercised without a real persistent table.
pub mod fake {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{PoolTarget, SmdClient, SmdDevState, TargetBlob};
    use crate::config::{ROLE_META, ROLE_WAL};
    use crate::device::BlobId;
    use crate::error::{Error, Result};
    use uuid::Uuid;

    #[derive(Default)]
    struct Inner {
        pool_tgts: HashMap<(PoolTarget, u16), TargetBlob>,
        rdb_tgts: HashMap<PoolTarget, TargetBlob>,
        dev_tgts: HashMap<u32, Uuid>,
        dev_states: HashMap<Uuid, SmdDevState>,
    }

    /// Non-durable, process-local implementation of [`SmdClient`].
    #[derive(Default)]
    pub struct InMemorySmd {
        inner: Mutex<Inner>,
    }

    impl InMemorySmd {
        /// Creates an empty table.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SmdClient for InMemorySmd {
        async fn pool_add_tgt(
            &self,
            pool_target: PoolTarget,
            device: Uuid,
            blob: BlobId,
            role: u16,
            size: u64,
        ) -> Result<()> {
            self.inner.lock().pool_tgts.insert(
                (pool_target, role),
                TargetBlob {
                    device,
                    blob,
                    role,
                    size,
                },
            );
            Ok(())
        }

        async fn pool_get_blob(&self, pool_target: PoolTarget, role: u16) -> Result<TargetBlob> {
            self.inner
                .lock()
                .pool_tgts
                .get(&(pool_target, role))
                .copied()
                .ok_or_else(|| Error::NoHandle("no SMD entry for pool/target/role".into()))
        }

        async fn pool_del_tgt(&self, pool_target: PoolTarget) -> Result<()> {
            let mut guard = self.inner.lock();
            guard
                .pool_tgts
                .retain(|(pt, _), _| *pt != pool_target);
            Ok(())
        }

        async fn rdb_add_tgt(&self, pool_target: PoolTarget, device: Uuid, blob: BlobId, size: u64) -> Result<()> {
            self.inner.lock().rdb_tgts.insert(
                pool_target,
                TargetBlob {
                    device,
                    blob,
                    role: ROLE_META | ROLE_WAL,
                    size,
                },
            );
            Ok(())
        }

        async fn rdb_get_blob(&self, pool_target: PoolTarget) -> Result<TargetBlob> {
            self.inner
                .lock()
                .rdb_tgts
                .get(&pool_target)
                .copied()
                .ok_or_else(|| Error::NoHandle("no SMD RDB entry for pool/target".into()))
        }

        async fn dev_add_tgt(&self, device: Uuid, target: u32, _role: u16) -> Result<()> {
            self.inner.lock().dev_tgts.insert(target, device);
            Ok(())
        }

        async fn dev_get_by_tgt(&self, target: u32) -> Result<Uuid> {
            self.inner
                .lock()
                .dev_tgts
                .get(&target)
                .copied()
                .ok_or_else(|| Error::NoHandle("no device assigned to target".into()))
        }

        async fn dev_set_state(&self, device: Uuid, state: SmdDevState) -> Result<()> {
            self.inner.lock().dev_states.insert(device, state);
            Ok(())
        }

        async fn dev_replace(&self, old: Uuid, new: Uuid, roles: u16) -> Result<()> {
            let mut guard = self.inner.lock();
            guard.dev_states.remove(&old);
            guard.dev_states.insert(new, SmdDevState::Normal);
            for dev in guard.dev_tgts.values_mut() {
                if *dev == old {
                    *dev = new;
                }
            }
            let _ = roles;
            Ok(())
        }

        async fn dev_list(&self) -> Result<Vec<(Uuid, SmdDevState)>> {
            Ok(self
                .inner
                .lock()
                .dev_states
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect())
        }
    }
}

#[cfg(test)]
mod smd_tests {
    use super::fake::InMemorySmd;
    use super::*;
    use crate::device::BlobId;

    #[tokio::test]
    async fn pool_add_then_get_round_trips() {
        let smd = InMemorySmd::new();
        let pt = PoolTarget {
            pool: Uuid::new_v4(),
            target: 0,
        };
        let dev = Uuid::new_v4();
        smd.pool_add_tgt(pt, dev, BlobId(7), ROLE_WAL, 128 << 20)
            .await
            .unwrap();
        let tb = smd.pool_get_blob(pt, ROLE_WAL).await.unwrap();
        assert_eq!(tb.blob, BlobId(7));
        assert_eq!(tb.device, dev);
    }

    #[tokio::test]
    async fn missing_entry_errors() {
        let smd = InMemorySmd::new();
        let pt = PoolTarget {
            pool: Uuid::new_v4(),
            target: 3,
        };
        let err = smd.pool_get_blob(pt, ROLE_DATA).await.unwrap_err();
        assert!(matches!(err, Error::NoHandle(_)));
    }

    #[tokio::test]
    async fn dev_replace_migrates_target_assignment() {
        let smd = InMemorySmd::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        smd.dev_add_tgt(old, 1, ROLE_DATA).await.unwrap();
        smd.dev_replace(old, new, ROLE_DATA).await.unwrap();
        assert_eq!(smd.dev_get_by_tgt(1).await.unwrap(), new);
    }
}

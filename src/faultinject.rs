//! Fault-injection points (spec §7 "User-visible failures").
//!
//! Grounded on the `DAOS_FAIL_CHECK` points sprinkled through
//! `bio_wal.c`/`bio_context.c` (e.g. `DAOS_NVME_WAL_TX_LOST` in
//! `fill_trans_blks`, `wal_close`). Each point is armed independently so a
//! test can synthesize exactly one class of failure without faking out the
//! rest of the stack.

use std::sync::atomic::{AtomicU32, Ordering};

/// One injectable fault class, named after the spec's `DAOS_NVME_*`
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `DAOS_NVME_WAL_TX_LOST`: a WAL transaction's entries are never
    /// written (simulates a crash mid-fill).
    WalTxLost,
    /// `DAOS_NVME_WRITE_ERR`: the next write fails with a media error.
    WriteErr,
    /// `DAOS_NVME_READ_ERR`: the next read fails with a media error.
    ReadErr,
    /// `DAOS_NVME_ALLOCBUF_ERR`: the next allocation (blob create, DMA
    /// chunk growth) fails with `NoMem`.
    AllocBufErr,
    /// `DAOS_NVME_FAULTY`: forces the owning blobstore's auto-faulty
    /// detector to fire on its next tick.
    Faulty,
}

/// Arms fault points by a one-shot or sticky counter; tests call
/// [`FaultInjector::arm`] before driving the operation under test.
#[derive(Debug, Default)]
pub struct FaultInjector {
    wal_tx_lost: AtomicU32,
    write_err: AtomicU32,
    read_err: AtomicU32,
    alloc_buf_err: AtomicU32,
    faulty: AtomicU32,
}

impl FaultInjector {
    /// Creates a fault injector with nothing armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, point: FaultPoint) -> &AtomicU32 {
        match point {
            FaultPoint::WalTxLost => &self.wal_tx_lost,
            FaultPoint::WriteErr => &self.write_err,
            FaultPoint::ReadErr => &self.read_err,
            FaultPoint::AllocBufErr => &self.alloc_buf_err,
            FaultPoint::Faulty => &self.faulty,
        }
    }

    /// Arms `point` to fire `count` more times (each [`check`] call that
    /// observes it armed decrements the counter by one).
    pub fn arm(&self, point: FaultPoint, count: u32) {
        self.slot(point).store(count, Ordering::SeqCst);
    }

    /// Checks whether `point` is armed; if so, consumes one occurrence and
    /// returns `true`.
    #[must_use]
    pub fn check(&self, point: FaultPoint) -> bool {
        let slot = self.slot(point);
        loop {
            let current = slot.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if slot
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod faultinject_tests {
    use super::*;

    #[test]
    fn arm_fires_exactly_count_times() {
        let fi = FaultInjector::new();
        fi.arm(FaultPoint::WriteErr, 2);
        assert!(fi.check(FaultPoint::WriteErr));
        assert!(fi.check(FaultPoint::WriteErr));
        assert!(!fi.check(FaultPoint::WriteErr));
    }

    #[test]
    fn unarmed_point_never_fires() {
        let fi = FaultInjector::new();
        assert!(!fi.check(FaultPoint::ReadErr));
    }
}

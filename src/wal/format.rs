//! WAL on-disk format and the block-layout calculator (spec §3, §4.G.2, §6).
//!
//! Every struct here is manually packed with `to_le_bytes`/`from_le_bytes`
//! rather than `serde`, since the layout is externally fixed (spec §6 "WAL
//! on-disk format (bit-exact)") — the same idiom the teacher uses for its
//! own binary formats (`storage/log_payload.rs`).

use crate::crc::crc32;
use crate::error::{Error, Result};

/// WAL blob header magic (spec §6).
pub const WAL_HDR_MAGIC: u32 = 0xaf20_2209;
/// Per-block transaction header magic (spec §6), matches the original
/// source's `WAL_HDR_MAGIC` (`0xc01d2019`) — an unfortunate name collision
/// in the original code between the blob-level and block-level magics.
pub const WAL_BLK_MAGIC: u32 = 0xc01d_2019;
/// On-disk format version this crate reads and writes.
pub const WAL_VERSION: u32 = 1;
/// Fixed WAL block size in bytes (spec §3).
pub const WAL_BLOCK_SZ: u32 = 4096;
/// Maximum blocks a single transaction may occupy (spec §4.G.1, §4.G.3).
pub const WAL_MAX_TRANS_BLKS: u32 = 2048;
/// Bit width of the block-offset half of a transaction id (spec §3).
pub const WAL_ID_OFF_BITS: u32 = 32;
/// `WAL_HDR_FL_NO_TAIL`: transactions in this WAL carry no tail checksum,
/// and are instead verified by per-block header replication (spec §3, §9).
pub const WAL_HDR_FL_NO_TAIL: u16 = 1 << 0;

const fn off_mask() -> u64 {
    (1u64 << WAL_ID_OFF_BITS) - 1
}

/// Low 32 bits of a tx-id: the block offset within the WAL (spec §3).
#[must_use]
pub fn id2off(id: u64) -> u32 {
    (id & off_mask()) as u32
}

/// High 32 bits of a tx-id: the wrap sequence number (spec §3).
#[must_use]
pub fn id2seq(id: u64) -> u32 {
    (id >> WAL_ID_OFF_BITS) as u32
}

/// Combines a sequence number and block offset into a tx-id (spec §3).
#[must_use]
pub fn seqoff2id(seq: u32, off: u32) -> u64 {
    (u64::from(seq) << WAL_ID_OFF_BITS) + u64::from(off)
}

/// Seq-aware "occurs before" comparison between two tx-ids (spec §3
/// "Comparison is seq-aware"). `a` is considered before `b` when walking
/// forward from `a` by fewer than `tot_blks` blocks reaches `b`'s
/// offset — i.e. `a` and `b` are both within one wrap of each other and
/// `a` is the earlier of the two. Used to guard `unused_id` rollback on
/// tx failure against being dragged forward by a later, already-doomed
/// successor (spec §4.G.4).
#[must_use]
pub fn id_is_before(tot_blks: u64, a: u64, b: u64) -> bool {
    if a == b {
        return false;
    }
    let seq_diff = id2seq(b).wrapping_sub(id2seq(a));
    let off_diff = i128::from(id2off(b)) - i128::from(id2off(a));
    let forward = i128::from(seq_diff) * i128::from(tot_blks) + off_diff;
    forward > 0 && forward < i128::from(tot_blks)
}

/// Computes the next unused tx-id after one that used `blks` blocks
/// starting at `id`, wrapping the sequence number when the WAL's total
/// block count is exceeded (spec §3, §4.G.2).
#[must_use]
pub fn wal_next_id(tot_blks: u64, id: u64, blks: u32) -> u64 {
    let seq = id2seq(id);
    let next_off = u64::from(id2off(id)) + u64::from(blks);
    if next_off < tot_blks {
        seqoff2id(seq, next_off as u32)
    } else {
        let wrapped_off = (next_off - tot_blks) as u32;
        let next_seq = if seq == u32::MAX { 0 } else { seq + 1 };
        seqoff2id(next_seq, wrapped_off)
    }
}

/// Block-layout description for one transaction (spec §4.G.2
/// `wal_blks_desc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlksDesc {
    /// Total blocks occupied by the transaction, including the tail block
    /// if it needed its own.
    pub blks: u32,
    /// Block index (relative to the transaction's first block) where the
    /// payload begins.
    pub payload_idx: u32,
    /// Byte offset within `payload_idx` where the first payload byte
    /// lives.
    pub payload_off: u32,
    /// Byte offset within the final block where the tail checksum lives.
    pub tail_off: u32,
}

/// Computes [`BlksDesc`] for a transaction with `act_nr` entries and
/// `payload_bytes` total payload, on a WAL with `blk_sz`-byte blocks (spec
/// §4.G.2). Deterministic and side-effect free so commit and replay always
/// agree on block boundaries from the header alone.
///
/// # Panics
///
/// Panics if `act_nr == 0`: every transaction has at least one action.
#[must_use]
pub fn calc_trans_blks(act_nr: u32, payload_bytes: u32, blk_sz: u32) -> BlksDesc {
    assert!(act_nr > 0, "a transaction must have at least one action");
    let usable = blk_sz - WalTransHead::WIRE_SIZE as u32;
    let entry_sz = WalTransEntry::WIRE_SIZE as u32;

    let max_ents = usable / entry_sz;
    let entry_blks = act_nr.div_ceil(max_ents);
    debug_assert!(entry_blks > 0);

    let remainder = act_nr - (act_nr / max_ents) * max_ents;
    let mut left_bytes = if remainder == 0 {
        usable - max_ents * entry_sz
    } else {
        usable - remainder * entry_sz
    };

    let mut payload_off = WalTransHead::WIRE_SIZE as u32;
    let payload_idx = if left_bytes > 0 {
        payload_off += usable - left_bytes;
        entry_blks - 1
    } else {
        entry_blks
    };

    let mut payload_sz = payload_bytes;
    let payload_blks = if left_bytes >= payload_sz {
        left_bytes -= payload_sz;
        0
    } else {
        payload_sz -= left_bytes;
        let blks = payload_sz.div_ceil(blk_sz);
        let remainder = payload_sz - (payload_sz / blk_sz) * blk_sz;
        left_bytes = if remainder == 0 { 0 } else { blk_sz - remainder };
        blks
    };

    let mut tail_off = WalTransHead::WIRE_SIZE as u32;
    if left_bytes >= WalTransTail::WIRE_SIZE as u32 {
        tail_off += usable - left_bytes;
        BlksDesc {
            blks: entry_blks + payload_blks,
            payload_idx,
            payload_off,
            tail_off,
        }
    } else {
        BlksDesc {
            blks: entry_blks + payload_blks + 1,
            payload_idx,
            payload_off,
            tail_off,
        }
    }
}

/// The WAL blob header, block 0 of the WAL blob (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// On-disk magic, [`WAL_HDR_MAGIC`].
    pub magic: u32,
    /// Format version, [`WAL_VERSION`].
    pub version: u32,
    /// 32-bit generation set at format time (spec §3 "Generation").
    pub gen: u32,
    /// Block size in bytes, always [`WAL_BLOCK_SZ`].
    pub blk_bytes: u16,
    /// Header flags; only [`WAL_HDR_FL_NO_TAIL`] is defined.
    pub flags: u16,
    /// Total blocks in the WAL blob.
    pub tot_blks: u64,
    /// Last checkpointed tx-id.
    pub ckp_id: u64,
    /// Last committed tx-id.
    pub commit_id: u64,
    /// Blocks used by the last checkpointed transaction.
    pub ckp_blks: u32,
    /// Blocks used by the last committed transaction.
    pub commit_blks: u32,
}

impl WalHeader {
    /// Packed on-disk size in bytes.
    pub const WIRE_SIZE: usize = 64;

    /// Whether tail checksums are disabled for this WAL (spec §9).
    #[must_use]
    pub fn no_tail_checksum(&self) -> bool {
        self.flags & WAL_HDR_FL_NO_TAIL != 0
    }

    /// Serializes this header to exactly [`WalHeader::WIRE_SIZE`] bytes,
    /// including the trailing CRC32 over everything before it.
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
        put!(self.gen);
        put!(self.blk_bytes);
        put!(self.flags);
        put!(self.tot_blks);
        put!(self.ckp_id);
        put!(self.commit_id);
        put!(self.ckp_blks);
        put!(self.commit_blks);
        put!(0u64); // padding2
        put!(0u32); // padding3
        debug_assert_eq!(off, Self::WIRE_SIZE - 4);
        let csum = crc32(&buf[..off]);
        buf[off..off + 4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parses and checksum-verifies a header from its on-disk bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Inval("WAL header buffer too short".into()));
        }
        let stored_csum = u32::from_le_bytes(buf[Self::WIRE_SIZE - 4..Self::WIRE_SIZE].try_into().unwrap());
        let computed = crc32(&buf[..Self::WIRE_SIZE - 4]);
        if stored_csum != computed {
            return Err(Error::Csum {
                expected: stored_csum,
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
        let version: u32 = get!(u32);
        if magic != WAL_HDR_MAGIC {
            return Err(Error::Uninit);
        }
        if version != WAL_VERSION {
            return Err(Error::Incompatible {
                found: version,
                expected: WAL_VERSION,
            });
        }
        let gen: u32 = get!(u32);
        let blk_bytes: u16 = get!(u16);
        let flags: u16 = get!(u16);
        let tot_blks: u64 = get!(u64);
        let ckp_id: u64 = get!(u64);
        let commit_id: u64 = get!(u64);
        let ckp_blks: u32 = get!(u32);
        let commit_blks: u32 = get!(u32);
        Ok(Self {
            magic,
            version,
            gen,
            blk_bytes,
            flags,
            tot_blks,
            ckp_id,
            commit_id,
            ckp_blks,
            commit_blks,
        })
    }
}

/// Per-block transaction header, duplicated into every block of a
/// transaction (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalTransHead {
    /// Block-level magic, [`WAL_BLK_MAGIC`].
    pub magic: u32,
    /// Must match the WAL's [`WalHeader::gen`].
    pub gen: u32,
    /// This transaction's id.
    pub id: u64,
    /// Total entry count (including synthesized `CSUM` entries).
    pub tot_ents: u32,
    /// Total payload bytes.
    pub tot_payload: u32,
}

impl WalTransHead {
    /// Packed on-disk size in bytes.
    pub const WIRE_SIZE: usize = 24;

    /// Serializes to [`WalTransHead::WIRE_SIZE`] bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.gen.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.tot_ents.to_le_bytes());
        buf[20..24].copy_from_slice(&self.tot_payload.to_le_bytes());
        buf
    }

    /// Parses from bytes without checksum verification (the tail or
    /// per-block replication check happens separately, spec §4.G.5).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Inval("WAL trans header buffer too short".into()));
        }
        Ok(Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            gen: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            tot_ents: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            tot_payload: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

/// One packed `wal_trans_entry` (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalTransEntry {
    /// Offset within the target (meta) blob, in bytes.
    pub off: u64,
    /// Data length in bytes (payload length, or immediate size for
    /// `ASSIGN`/`SET_BITS`/`CLR_BITS`).
    pub len: u32,
    /// Inline data: immediate value, fill byte, or bit position/count
    /// packed per opcode.
    pub data: u32,
    /// Wire opcode ([`super::action::Opcode`] as `u16`).
    pub op_type: u16,
}

impl WalTransEntry {
    /// Packed on-disk size in bytes.
    pub const WIRE_SIZE: usize = 18;

    /// Serializes to [`WalTransEntry::WIRE_SIZE`] bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.off.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data.to_le_bytes());
        buf[16..18].copy_from_slice(&self.op_type.to_le_bytes());
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Inval("WAL trans entry buffer too short".into()));
        }
        Ok(Self {
            off: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            data: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            op_type: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
        })
    }
}

/// The 4-byte tail checksum (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalTransTail {
    /// CRC32 over the logical transaction byte range.
    pub csum: u32,
}

impl WalTransTail {
    /// Packed on-disk size in bytes.
    pub const WIRE_SIZE: usize = 4;
}

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn tx_id_wraps_sequence_on_overflow() {
        let tot_blks = 100;
        let id = seqoff2id(0, 98);
        let next = wal_next_id(tot_blks, id, 4);
        assert_eq!(id2seq(next), 1);
        assert_eq!(id2off(next), 2);
    }

    #[test]
    fn tx_id_stays_in_sequence_without_wrap() {
        let tot_blks = 100;
        let id = seqoff2id(3, 10);
        let next = wal_next_id(tot_blks, id, 5);
        assert_eq!(id2seq(next), 3);
        assert_eq!(id2off(next), 15);
    }

    #[test]
    fn header_round_trips_with_csum() {
        let hdr = WalHeader {
            magic: WAL_HDR_MAGIC,
            version: WAL_VERSION,
            gen: 0xdead_beef,
            blk_bytes: 4096,
            flags: 0,
            tot_blks: 8192,
            ckp_id: seqoff2id(0, 10),
            commit_id: seqoff2id(0, 20),
            ckp_blks: 2,
            commit_blks: 3,
        };
        let bytes = hdr.to_bytes();
        let parsed = WalHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn header_csum_mismatch_is_rejected() {
        let hdr = WalHeader {
            magic: WAL_HDR_MAGIC,
            version: WAL_VERSION,
            gen: 1,
            blk_bytes: 4096,
            flags: 0,
            tot_blks: 100,
            ckp_id: 0,
            commit_id: 0,
            ckp_blks: 0,
            commit_blks: 0,
        };
        let mut bytes = hdr.to_bytes();
        bytes[10] ^= 0xFF;
        let err = WalHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::Csum { .. }));
    }

    #[test]
    fn calc_trans_blks_single_small_action_fits_one_block() {
        let bd = calc_trans_blks(1, 8, WAL_BLOCK_SZ);
        assert_eq!(bd.blks, 1);
        assert_eq!(bd.payload_idx, 0);
    }

    #[test]
    fn calc_trans_blks_many_actions_spans_multiple_blocks() {
        let usable = WAL_BLOCK_SZ - WalTransHead::WIRE_SIZE as u32;
        let max_ents = usable / WalTransEntry::WIRE_SIZE as u32;
        let act_nr = max_ents * 2 + max_ents / 2;
        let bd = calc_trans_blks(act_nr, 8 * act_nr, WAL_BLOCK_SZ);
        assert!(bd.blks >= 3);
        assert!(bd.payload_idx >= 2);
    }

    #[test]
    fn calc_trans_blks_large_payload_adds_payload_blocks() {
        let bd = calc_trans_blks(2, 1024 * 1024, WAL_BLOCK_SZ);
        assert!(bd.blks as u64 >= (1024 * 1024) / u64::from(WAL_BLOCK_SZ));
    }

    #[test]
    fn id_is_before_orders_ids_within_the_same_wrap() {
        let a = seqoff2id(0, 10);
        let b = seqoff2id(0, 20);
        assert!(id_is_before(64, a, b));
        assert!(!id_is_before(64, b, a));
        assert!(!id_is_before(64, a, a));
    }

    #[test]
    fn id_is_before_handles_a_later_id_that_has_wrapped_sequence() {
        // `a` is near the end of seq 0; `b` has wrapped into seq 1 at a
        // low offset. `a` must still compare as before `b`.
        let a = seqoff2id(0, 60);
        let b = seqoff2id(1, 4);
        assert!(id_is_before(64, a, b));
        assert!(!id_is_before(64, b, a));
    }

    #[test]
    fn id_is_before_rejects_a_forced_failure_racing_ahead_of_an_earlier_one() {
        // Regression for the FIFO-rollback bug: a later tx's forced
        // failure must not be allowed to drag `unused_id` forward past
        // an earlier tx's rollback target.
        let earlier = seqoff2id(0, 1);
        let later = seqoff2id(0, 2);
        // Simulates: unused_id was already rolled back to `earlier`;
        // `later`'s own rollback must not move it forward again.
        assert!(!id_is_before(64, later, earlier));
    }
}

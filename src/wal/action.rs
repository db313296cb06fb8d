//! WAL transaction actions (spec §3 "Action opcodes").
//!
//! Grounded on `umem_action`/`UMEM_ACT_*` in the original source (see
//! `bio_wal.c::fill_trans_blks`'s opcode switch). Opcodes are wire-visible
//! (spec §3) so their numeric values, once assigned, must never change.

/// An atomic mutation the WAL records and replays (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// In-band payload copy: write `payload` at `addr`.
    Copy {
        /// Destination byte offset within the target (meta) blob.
        addr: u64,
        /// Bytes to write.
        payload: Vec<u8>,
    },
    /// Pointed-to payload copy. Serialized identically to [`Action::Copy`]
    /// on disk (spec §3); the producer only supplies a pointer instead of
    /// an inline buffer to avoid a redundant copy before `commit`.
    CopyPtr {
        /// Destination byte offset.
        addr: u64,
        /// Bytes to write (already dereferenced by the caller).
        payload: Vec<u8>,
    },
    /// Immediate assignment of 1, 2, or 4 bytes at `addr`.
    Assign {
        /// Destination byte offset.
        addr: u64,
        /// Size in bytes: 1, 2, or 4.
        size: u8,
        /// The value, sign/zero-extended into a u32.
        value: u32,
    },
    /// Move `size` bytes from `src` to `dst`. The source address is itself
    /// carried as an 8-byte payload (spec §3).
    Move {
        /// Destination byte offset.
        dst: u64,
        /// Source byte offset.
        src: u64,
        /// Number of bytes moved.
        size: u32,
    },
    /// Fill `size` bytes at `addr` with `value`.
    Set {
        /// Destination byte offset.
        addr: u64,
        /// Fill byte.
        value: u8,
        /// Number of bytes to fill.
        size: u32,
    },
    /// Sets `count` bits starting at bit `pos` within the 8-byte word at
    /// `addr`.
    SetBits {
        /// Byte offset of the containing 8-byte word.
        addr: u64,
        /// Starting bit position within the word.
        pos: u8,
        /// Number of bits.
        count: u8,
    },
    /// Clears `count` bits starting at bit `pos` within the 8-byte word at
    /// `addr`.
    ClrBits {
        /// Byte offset of the containing 8-byte word.
        addr: u64,
        /// Starting bit position within the word.
        pos: u8,
        /// Number of bits.
        count: u8,
    },
    /// Verifies a data-blob region's checksum. Generated by the WAL engine
    /// for async data writes (spec §3); never authored by the producer,
    /// and never handed to `replay_cb` (spec §4.G.3 step 1, §4.G.5 step 4).
    Csum {
        /// Byte offset of the region within the data blob.
        addr: u64,
        /// Region length in bytes.
        size: u32,
        /// Expected CRC32 over the region.
        expected: u32,
    },
}

/// Wire opcode values (spec §3: "stable, wire-visible").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// See [`Action::Copy`].
    Copy = 0,
    /// See [`Action::CopyPtr`]. Serialized identically to `Copy`.
    CopyPtr = 1,
    /// See [`Action::Assign`].
    Assign = 2,
    /// See [`Action::Move`].
    Move = 3,
    /// See [`Action::Set`].
    Set = 4,
    /// See [`Action::SetBits`].
    SetBits = 5,
    /// See [`Action::ClrBits`].
    ClrBits = 6,
    /// See [`Action::Csum`].
    Csum = 7,
}

impl Opcode {
    /// Decodes a wire opcode value, if recognized.
    #[must_use]
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Opcode::Copy,
            1 => Opcode::CopyPtr,
            2 => Opcode::Assign,
            3 => Opcode::Move,
            4 => Opcode::Set,
            5 => Opcode::SetBits,
            6 => Opcode::ClrBits,
            7 => Opcode::Csum,
            _ => return None,
        })
    }
}

impl Action {
    /// This action's wire opcode.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Action::Copy { .. } => Opcode::Copy,
            Action::CopyPtr { .. } => Opcode::CopyPtr,
            Action::Assign { .. } => Opcode::Assign,
            Action::Move { .. } => Opcode::Move,
            Action::Set { .. } => Opcode::Set,
            Action::SetBits { .. } => Opcode::SetBits,
            Action::ClrBits { .. } => Opcode::ClrBits,
            Action::Csum { .. } => Opcode::Csum,
        }
    }

    /// Payload byte length this action contributes to the transaction's
    /// payload region (spec §3's `wal_trans_entry`/payload split). `Assign`,
    /// `Set`, `SetBits`/`ClrBits` carry everything inline in the entry and
    /// contribute no payload bytes; `Move` carries its 8-byte source
    /// address as payload; `Copy`/`CopyPtr` carry their full buffer.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Action::Copy { payload, .. } | Action::CopyPtr { payload, .. } => payload.len(),
            Action::Move { .. } => std::mem::size_of::<u64>(),
            Action::Assign { .. } | Action::Set { .. } | Action::SetBits { .. } | Action::ClrBits { .. } => 0,
            // CSUM is synthetic metadata, never serialized as a disk entry
            // payload: the verifier re-derives it from the data blob.
            Action::Csum { .. } => 0,
        }
    }
}

#[cfg(test)]
mod action_tests {
    use super::*;

    #[test]
    fn copy_ptr_and_copy_share_opcode_payload_shape() {
        let copy = Action::Copy {
            addr: 0,
            payload: vec![1, 2, 3],
        };
        let copy_ptr = Action::CopyPtr {
            addr: 0,
            payload: vec![1, 2, 3],
        };
        assert_eq!(copy.payload_len(), copy_ptr.payload_len());
        assert_ne!(copy.opcode() as u16, copy_ptr.opcode() as u16);
    }

    #[test]
    fn move_contributes_eight_payload_bytes() {
        let mv = Action::Move {
            dst: 0xBEEF,
            src: 0xDEAD,
            size: 4,
        };
        assert_eq!(mv.payload_len(), 8);
    }

    #[test]
    fn opcode_roundtrips_through_u16() {
        for op in [
            Opcode::Copy,
            Opcode::CopyPtr,
            Opcode::Assign,
            Opcode::Move,
            Opcode::Set,
            Opcode::SetBits,
            Opcode::ClrBits,
            Opcode::Csum,
        ] {
            assert_eq!(Opcode::from_u16(op as u16), Some(op));
        }
    }
}

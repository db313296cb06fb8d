//! CRC32 checksum primitive.
//!
//! Spec §1 treats the hash as an external collaborator ("the cryptographic
//! hash primitive... any 32-bit hash with init/update/finish works") but
//! pins the concrete algorithm used on the wire to standard CRC-32
//! (polynomial `0xEDB88320`, spec §6). The table-driven implementation
//! below mirrors the one the teacher hand-rolls in
//! `storage/log_payload.rs::crc32_hash` rather than pulling in a crate,
//! since it's already const-evaluated and exactly matches the wire
//! contract (LE byte order, no reflect-output quirks to get wrong).

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Streaming CRC32 accumulator, matching the `init/update/finish` shape
/// the spec requires of the hash primitive so that the WAL engine can be
/// ported to a different 32-bit hash without touching its callers.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Starts a fresh accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Folds `data` into the running checksum.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
            crc = (crc >> 8) ^ CRC32_TABLE[idx];
        }
        self.state = crc;
    }

    /// Finalizes and returns the checksum.
    #[must_use]
    pub const fn finish(self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot convenience wrapper over [`Crc32`] for a single contiguous
/// buffer.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finish()
}

/// One-shot CRC32 over multiple disjoint slices, treated as one logical
/// byte stream — used for the WAL tail checksum, which spans two biovs
/// when a transaction wraps the end of the log (spec §6).
#[must_use]
pub fn crc32_multi(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finish()
}

#[cfg(test)]
mod crc_tests {
    use super::*;

    #[test]
    fn matches_known_vector() {
        // Standard CRC-32/ISO-HDLC check value for the ASCII string "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn multi_part_equals_concatenation() {
        let whole = crc32(b"hello world");
        let split = crc32_multi(&[b"hello ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut hasher = Crc32::new();
        hasher.update(b"abc");
        hasher.update(b"def");
        assert_eq!(hasher.finish(), crc32(b"abcdef"));
    }
}

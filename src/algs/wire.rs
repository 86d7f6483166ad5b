//! Fixed, little-endian wire types for distributor messages.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

// All multi-byte integers in these structs are little-endian on the wire.
// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

/// One count (item count, message length, or flag).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: u64) -> Self {
        Self { n_le: n.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.n_le)
    }
    /// Decode from an exactly-sized byte buffer (alignment not required).
    pub fn decode(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }
}

/// A requested global id together with the rank that asked for it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct WireIdRank {
    pub id_le: u64,
    pub rank_le: u64,
}

impl WireIdRank {
    pub fn new(id: u64, rank: usize) -> Self {
        Self {
            id_le: id.to_le(),
            rank_le: (rank as u64).to_le(),
        }
    }
    pub fn id(&self) -> u64 {
        u64::from_le(self.id_le)
    }
    pub fn rank(&self) -> usize {
        u64::from_le(self.rank_le) as usize
    }
}

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireIdRank>(), 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_decodes_from_unaligned_bytes() {
        let wire = [WireCount::new(0x0102_0304_0506_0708)];
        let mut raw = vec![0u8; 9];
        raw[1..].copy_from_slice(cast_slice(&wire));
        assert_eq!(WireCount::decode(&raw[1..]).get(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn exact_len_reports_sizes() {
        assert!(expect_exact_len(8, 8).is_ok());
        assert_eq!(
            expect_exact_len(4, 8).unwrap_err(),
            "expected 8 bytes, got 4"
        );
    }
}

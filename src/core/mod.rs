//! # Core Wire Format
//!
//! Low-level binary encoding shared by every protocol message.
//!
//! ## Components
//! - **BitReader**: sequential, forward-only decoding over a borrowed buffer
//! - **BitWriter**: the exact mirror of the reader
//! - **Value**: closed set of packed value types used for replicated variables
//!   and RPC results
//!
//! ## Packed Integers
//! ```text
//! v <= 240          [v]
//! v <= 2287         [241 + (v-240)/256] [(v-240) % 256]
//! v <= 67823        [249] [(v-2288)/256] [(v-2288) % 256]
//! otherwise         [247 + n] [n little-endian bytes]     n in 3..=8
//! ```
//! Signed integers are zig-zag mapped first; floats have their IEEE bits
//! byte-swapped before packing so that small magnitudes stay short.
//!
//! Booleans occupy one whole byte which keeps every stream byte aligned.

pub mod reader;
pub mod value;
pub mod writer;

pub use reader::BitReader;
pub use value::{Value, ValueKind};
pub use writer::BitWriter;

/// Largest value encoded in a single byte.
pub(crate) const PACKED_ONE_BYTE_MAX: u64 = 240;
/// Largest value encoded in two bytes.
pub(crate) const PACKED_TWO_BYTE_MAX: u64 = 2287;
/// Largest value encoded in three bytes.
pub(crate) const PACKED_THREE_BYTE_MAX: u64 = 67823;
/// Prefix announcing the three byte form.
pub(crate) const PACKED_THREE_BYTE_PREFIX: u8 = 249;
/// Prefix base for the long form: `247 + byte_count`.
pub(crate) const PACKED_LONG_BASE: u8 = 247;

#[inline]
pub(crate) fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub(crate) fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Number of bytes [`BitWriter::write_u64_packed`] emits for `value`.
pub fn packed_len(value: u64) -> usize {
    if value <= PACKED_ONE_BYTE_MAX {
        1
    } else if value <= PACKED_TWO_BYTE_MAX {
        2
    } else if value <= PACKED_THREE_BYTE_MAX {
        3
    } else {
        1 + significant_bytes(value).max(3)
    }
}

#[inline]
pub(crate) fn significant_bytes(value: u64) -> usize {
    8 - (value.leading_zeros() as usize / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for v in [i64::MIN, -70_000, -1, 0, 1, 123_456_789, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }

    #[test]
    fn test_packed_len_boundaries() {
        assert_eq!(packed_len(0), 1);
        assert_eq!(packed_len(240), 1);
        assert_eq!(packed_len(241), 2);
        assert_eq!(packed_len(2287), 2);
        assert_eq!(packed_len(2288), 3);
        assert_eq!(packed_len(67823), 3);
        assert_eq!(packed_len(67824), 4);
        assert_eq!(packed_len(0xFF_FFFF), 4);
        assert_eq!(packed_len(0x100_0000), 5);
        assert_eq!(packed_len(u64::MAX), 9);
    }
}

//! Compact target and chain-work arithmetic.

use btcnode_consensus::Hash256;
use primitive_types::{U256, U512};

/// Cumulative chain work. Twice the width of a target, so sums over any
/// realistic chain length cannot overflow.
pub type ChainWork = U512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Expands `bits` into `mantissa * 256^(exponent - 3)`.
pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if word == 0 {
        return Ok(U256::zero());
    }
    if (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Target as a little-endian 256-bit hash value.
pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    U256::from_little_endian(hash) <= *target
}

/// Expected number of hashes for a header with the given bits:
/// `floor(2^256 / (target + 1))`, zero for an empty or malformed target.
pub fn header_work(bits: u32) -> U256 {
    let target = match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => target,
        _ => return U256::zero(),
    };
    // 2^256 / (t + 1) == (2^256 - 1 - t) / (t + 1) + 1, which stays within 256 bits.
    let one = U256::one();
    (!target / (target + one)) + one
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_bits_expand_to_known_target() {
        let target = compact_to_u256(0x1d00_ffff).expect("target");
        assert_eq!(target, U256::from(0xffffu64) << 208);
        let bytes = compact_to_target(0x1d00_ffff).expect("target");
        assert_eq!(&bytes[26..28], &[0xff, 0xff]);
        assert!(bytes[28..].iter().all(|b| *b == 0));
        assert!(bytes[..26].iter().all(|b| *b == 0));
    }

    #[test]
    fn small_exponents_shift_right() {
        assert_eq!(compact_to_u256(0x0112_3456).expect("target"), U256::from(0x12u64));
        assert_eq!(compact_to_u256(0x0212_3456).expect("target"), U256::from(0x1234u64));
        assert_eq!(compact_to_u256(0x0312_3456).expect("target"), U256::from(0x12_3456u64));
        assert_eq!(compact_to_u256(0x0000_0000).expect("target"), U256::zero());
    }

    #[test]
    fn invalid_compact_values() {
        assert_eq!(compact_to_u256(0x0492_3456), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff12_3456), Err(CompactError::Overflow));
    }

    #[test]
    fn compact_round_trip_for_common_targets() {
        for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_04cb, 0x1703_a30c] {
            let target = compact_to_u256(bits).expect("target");
            assert_eq!(u256_to_compact(target), bits);
        }
    }

    #[test]
    fn work_for_minimum_difficulty() {
        assert_eq!(header_work(0x1d00_ffff), U256::from(0x1_0001_0001u64));
        assert_eq!(header_work(0x207f_ffff), U256::from(2u64));
    }

    #[test]
    fn zero_or_malformed_target_has_no_work() {
        assert_eq!(header_work(0), U256::zero());
        assert_eq!(header_work(0x0492_3456), U256::zero());
    }

    #[test]
    fn tiny_target_yields_large_work() {
        assert_eq!(header_work(0x0300_0001), U256::one() << 255);
    }

    #[test]
    fn chain_work_widens_without_overflow() {
        let work = ChainWork::from(U256::MAX) + ChainWork::from(U256::MAX);
        assert!(work > ChainWork::from(U256::MAX));
    }
}

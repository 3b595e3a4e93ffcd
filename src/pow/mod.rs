//! Difficulty arithmetic: the compact-bits encoding of 256-bit targets and
//! the cumulative-work metric used for chain selection.
//!
//! A compact value packs a target as mantissa (low 23 bits), sign (bit 23)
//! and a base-256 exponent (high 8 bits): `target = mantissa *
//! 256^(exponent - 3)`. Work is `floor(2^256 / (target + 1))`, so a harder
//! (smaller) target contributes more work.

pub mod auxpow;

use num_bigint::{BigInt, BigUint, Sign};
use std::sync::OnceLock;

use crate::core::types::Hash256;

fn one_lsh_256() -> &'static BigUint {
    static ONE_LSH_256: OnceLock<BigUint> = OnceLock::new();
    ONE_LSH_256.get_or_init(|| BigUint::from(1u8) << 256u32)
}

/// Expand a compact-bits value into the signed big integer it encodes.
pub fn compact_to_big(compact: u32) -> BigInt {
    let mantissa = compact & 0x007f_ffff;
    let negative = compact & 0x0080_0000 != 0;
    let exponent = compact >> 24;

    // The exponent counts bytes of the full number, so shift the mantissa
    // into place accordingly.
    let mut bn = if exponent <= 3 {
        BigInt::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigInt::from(mantissa) << (8 * (exponent - 3))
    };

    if negative {
        bn = -bn;
    }
    bn
}

/// Pack a big integer into compact-bits form. Inverse of
/// [`compact_to_big`] up to the precision the mantissa can hold.
pub fn big_to_compact(n: &BigInt) -> u32 {
    if n.sign() == Sign::NoSign {
        return 0;
    }

    let (sign, bytes) = n.to_bytes_be();
    let mut exponent = bytes.len() as u32;
    let mut mantissa: u32 = if exponent <= 3 {
        let mut value: u32 = 0;
        for byte in &bytes {
            value = (value << 8) | u32::from(*byte);
        }
        value << (8 * (3 - exponent))
    } else {
        (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
    };

    // When the mantissa would collide with the sign bit, shift it down a
    // byte and bump the exponent.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }

    let mut compact = (exponent << 24) | mantissa;
    if sign == Sign::Minus {
        compact |= 0x0080_0000;
    }
    compact
}

/// Work contributed by a block at the given difficulty:
/// `floor(2^256 / (target + 1))`. Invalid (non-positive) targets
/// contribute nothing.
pub fn calc_work(bits: u32) -> BigUint {
    let difficulty = compact_to_big(bits);
    if difficulty.sign() != Sign::Plus {
        return BigUint::from(0u8);
    }
    let target = difficulty.to_biguint().unwrap();
    one_lsh_256() / (target + 1u8)
}

/// Interpret a hash as the little-endian 256-bit integer compared against
/// the target.
pub fn hash_to_big(hash: &Hash256) -> BigUint {
    BigUint::from_bytes_le(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_expansion() {
        // 0x1d00ffff: mantissa 0xffff, exponent 0x1d -> 0xffff << 208
        let expected = BigInt::from(0xffffu32) << 208u32;
        assert_eq!(compact_to_big(0x1d00ffff), expected);
    }

    #[test]
    fn test_compact_small_exponent() {
        // exponent 1 shifts the mantissa down two bytes
        assert_eq!(compact_to_big(0x01123456), BigInt::from(0x12u32));
        assert_eq!(compact_to_big(0x02123456), BigInt::from(0x1234u32));
        assert_eq!(compact_to_big(0x03123456), BigInt::from(0x123456u32));
    }

    #[test]
    fn test_compact_sign_bit() {
        let n = compact_to_big(0x03923456);
        assert_eq!(n, BigInt::from(-0x123456i32));
    }

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x1d03ffff, 0x207fffff, 0x1b0404cb, 0x03123456] {
            let n = compact_to_big(bits);
            assert_eq!(big_to_compact(&n), bits, "bits {:#010x}", bits);
        }
    }

    #[test]
    fn test_big_to_compact_zero() {
        assert_eq!(big_to_compact(&BigInt::from(0)), 0);
    }

    #[test]
    fn test_work_ordering() {
        // A smaller target means more work per block.
        let easy = calc_work(0x207fffff);
        let hard = calc_work(0x1d03ffff);
        assert!(hard > easy);
        assert!(easy > BigUint::from(0u8));
    }

    #[test]
    fn test_work_of_invalid_target() {
        // negative and zero targets yield zero work
        assert_eq!(calc_work(0x03923456), BigUint::from(0u8));
        assert_eq!(calc_work(0), BigUint::from(0u8));
    }

    #[test]
    fn test_hash_to_big_is_little_endian() {
        let mut hash = [0u8; 32];
        hash[31] = 1;
        assert_eq!(hash_to_big(&hash), BigUint::from(1u8) << 248u32);
        let mut low = [0u8; 32];
        low[0] = 1;
        assert_eq!(hash_to_big(&low), BigUint::from(1u8));
    }
}

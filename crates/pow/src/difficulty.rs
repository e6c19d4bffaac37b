//! Difficulty and compact target utilities.

use blkd_consensus::Hash256;
use primitive_types::U256;

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

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    // The mantissa sign bit is not available; shift one byte further.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | (size << 24)
}

pub fn target_from_limit(limit: &Hash256) -> U256 {
    U256::from_little_endian(limit)
}

pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    U256::from_little_endian(hash) <= *target
}

/// One retarget step over the spacing between the last two blocks of the
/// same proof type. Exponential moving average with the configured
/// timespan/spacing ratio; the result never exceeds `limit`.
pub fn next_target(
    prev_bits: u32,
    actual_spacing: i64,
    target_spacing: i64,
    target_timespan: i64,
    limit: U256,
) -> u32 {
    let mut actual_spacing = actual_spacing;
    if actual_spacing < 0 {
        actual_spacing = target_spacing;
    }
    if actual_spacing > target_spacing * 10 {
        actual_spacing = target_spacing * 10;
    }

    let target = match compact_to_u256(prev_bits) {
        Ok(target) if !target.is_zero() => target,
        _ => return u256_to_compact(limit),
    };

    let interval = target_timespan / target_spacing;
    let numerator = ((interval - 1) * target_spacing + 2 * actual_spacing) as u64;
    let denominator = ((interval + 1) * target_spacing) as u64;
    let adjusted = target * U256::from(numerator) / U256::from(denominator);

    if adjusted.is_zero() || adjusted > limit {
        return u256_to_compact(limit);
    }
    u256_to_compact(adjusted)
}

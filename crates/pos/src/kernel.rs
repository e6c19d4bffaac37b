//! Kernel hashing and the weighted target check.
//!
//! The coinstake kernel (input 0) must satisfy
//!
//! ```text
//! hash(stakeModifier ‖ blockFromTime ‖ prevout.hash ‖ prevout.n ‖ nTimeTx) ≤ target × value
//! ```
//!
//! so the chance of staking a block is proportional to the value held. The
//! modifier scrambles the preimage to keep future kernels unpredictable at
//! the time the staked output confirms. Field widths, order, and endianness
//! are consensus; changing any of them forks the chain.

use blkd_chainstate::BlockIndex;
use blkd_consensus::{Amount, ConsensusParams, Hash256};
use blkd_pow::difficulty::compact_to_u256;
use blkd_primitives::encoding::Encoder;
use blkd_primitives::hash::sha256d;
use blkd_primitives::outpoint::OutPoint;
use primitive_types::U256;

/// Modifier for the block whose kernel hash is `kernel`, chained onto the
/// parent's modifier. The genesis modifier is zero.
pub fn compute_stake_modifier(prev: Option<&BlockIndex>, kernel: &Hash256) -> Hash256 {
    let Some(prev) = prev else {
        return [0u8; 32];
    };
    let mut encoder = Encoder::new();
    encoder.write_hash_le(kernel);
    encoder.write_hash_le(&prev.stake_modifier);
    sha256d(&encoder.into_inner())
}

/// The kernel hash preimage is exactly 76 bytes:
/// `stakeModifier(32) ‖ blockFromTime(4 LE) ‖ prevout.hash(32) ‖
/// prevout.n(4 LE) ‖ nTimeTx(4 LE)`.
pub fn stake_kernel_hash(
    stake_modifier: &Hash256,
    block_from_time: u32,
    prevout: &OutPoint,
    n_time_tx: u32,
) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_hash_le(stake_modifier);
    encoder.write_u32_le(block_from_time);
    encoder.write_hash_le(&prevout.hash);
    encoder.write_u32_le(prevout.index);
    encoder.write_u32_le(n_time_tx);
    sha256d(&encoder.into_inner())
}

/// Whether the kernel for `prevout` meets the value-weighted target at
/// `n_time_tx`. Pure in all arguments.
pub fn check_stake_kernel_hash(
    prev_index: &BlockIndex,
    n_bits: u32,
    block_from_time: u32,
    prevout_value: Amount,
    prevout: &OutPoint,
    n_time_tx: u32,
) -> bool {
    if n_time_tx < block_from_time {
        blkd_log::log_debug!("kernel: nTime violation ({n_time_tx} < {block_from_time})");
        return false;
    }

    let Ok(target) = compact_to_u256(n_bits) else {
        return false;
    };

    if prevout_value == 0 {
        blkd_log::log_debug!("kernel: zero-value prevout");
        return false;
    }

    // Weight the target by the staked value. The value is bounded by the
    // money supply and the target by the proof limit, so the product stays
    // inside 256 bits for any real chain state.
    let weighted = target.overflowing_mul(U256::from(prevout_value as u64)).0;

    let hash = stake_kernel_hash(&prev_index.stake_modifier, block_from_time, prevout, n_time_tx);
    U256::from_little_endian(&hash) <= weighted
}

/// Protocol rule tying the block time to the coinstake time. Under protocol
/// v2 the timestamp must additionally land on a mask boundary.
pub fn check_coin_stake_timestamp(
    params: &ConsensusParams,
    n_time_block: i64,
    n_time_tx: i64,
) -> bool {
    if params.is_protocol_v2(n_time_block) {
        n_time_block == n_time_tx && (n_time_tx & params.stake_timestamp_mask as i64) == 0
    } else {
        n_time_block == n_time_tx
    }
}

/// Header-only form of [`check_coin_stake_timestamp`].
pub fn check_stake_block_timestamp(params: &ConsensusParams, n_time_block: i64) -> bool {
    check_coin_stake_timestamp(params, n_time_block, n_time_block)
}

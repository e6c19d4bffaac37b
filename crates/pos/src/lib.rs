//! Proof-of-stake kernel: coin-age-weighted hash checks, the stake modifier
//! chain, the stake cache, and full coinstake validation.

pub mod kernel;
pub mod validation;

pub use kernel::{
    check_coin_stake_timestamp, check_stake_block_timestamp, check_stake_kernel_hash,
    compute_stake_modifier, stake_kernel_hash,
};
pub use validation::{
    cache_kernel, check_kernel, check_proof_of_stake, ProofOfStakeError, StakeCache,
    StakeCacheEntry,
};

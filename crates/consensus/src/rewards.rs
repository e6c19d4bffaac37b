//! Block subsidy schedule.

use crate::money::Amount;
use crate::params::ConsensusParams;

/// Subsidy available to the producer of the block at `height`, excluding
/// transaction fees. Proof-of-work subsidies stop after the PoW era; from
/// then on every block carries the flat stake reward.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if height <= 0 {
        return 0;
    }
    if height <= params.last_pow_height {
        return params.pow_subsidy;
    }
    params.stake_reward
}

/// Reward credited to the coinstake outputs on top of the kernel value.
pub fn proof_of_stake_subsidy(params: &ConsensusParams) -> Amount {
    params.stake_reward
}

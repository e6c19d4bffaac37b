//! Consensus parameter definitions.

use crate::protocol::{Hash256, ProtocolSchedule};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    /// Coinbase and coinstake outputs may only be spent (or staked) after
    /// this many confirmations.
    pub coinbase_maturity: i32,
    /// Granularity mask for coinstake timestamps under protocol v2. The low
    /// bits of a masked timestamp are always zero.
    pub stake_timestamp_mask: u32,
    pub protocol: ProtocolSchedule,
    /// Proof-of-work target limit, little-endian.
    pub pow_limit: Hash256,
    /// Proof-of-stake target limit, little-endian.
    pub pos_limit: Hash256,
    /// Desired spacing between blocks, in seconds.
    pub target_spacing: i64,
    /// Retarget averaging window, in seconds.
    pub target_timespan: i64,
    /// Height of the last block eligible for a proof-of-work subsidy.
    pub last_pow_height: i32,
    /// Subsidy paid per proof-of-work block.
    pub pow_subsidy: i64,
    /// Reward paid to the staker per proof-of-stake block.
    pub stake_reward: i64,
    /// Testnet/regtest rule: blocks more than twice the target spacing apart
    /// may be mined at the minimum difficulty.
    pub pow_allow_min_difficulty_blocks: bool,
    /// Height from which witness commitments are required.
    pub segwit_height: i32,
    /// Regtest-only: blocks are produced on demand and the header version may
    /// be overridden for fork testing.
    pub mine_blocks_on_demand: bool,
}

impl ConsensusParams {
    pub fn is_protocol_v2(&self, time: i64) -> bool {
        self.protocol.is_v2(time)
    }

    pub fn is_protocol_v3_1(&self, time: i64) -> bool {
        self.protocol.is_v3_1(time)
    }

    pub fn segwit_active_at(&self, height: i32) -> bool {
        height >= self.segwit_height
    }

    pub fn retarget_interval(&self) -> i64 {
        self.target_timespan / self.target_spacing
    }
}

fn limit_shifted_down(shift: u32) -> Hash256 {
    // (~uint256(0)) >> shift, stored little-endian.
    let mut limit = [0xffu8; 32];
    let full_bytes = (shift / 8) as usize;
    let rem = shift % 8;
    for i in 0..32 {
        if i >= 32 - full_bytes {
            limit[i] = 0;
        }
    }
    if rem != 0 && full_bytes < 32 {
        limit[31 - full_bytes] >>= rem;
    }
    limit
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => ConsensusParams {
            network,
            coinbase_maturity: 500,
            stake_timestamp_mask: 0xf,
            protocol: ProtocolSchedule {
                v2_time: 1_407_053_625,
                v3_1_time: 1_713_000_000,
            },
            pow_limit: limit_shifted_down(20),
            pos_limit: limit_shifted_down(20),
            target_spacing: 64,
            target_timespan: 16 * 60,
            last_pow_height: 10_000,
            pow_subsidy: 10_000 * crate::money::COIN,
            stake_reward: 3 * crate::money::COIN / 2,
            pow_allow_min_difficulty_blocks: false,
            segwit_height: 2_500_000,
            mine_blocks_on_demand: false,
        },
        Network::Testnet => ConsensusParams {
            network,
            coinbase_maturity: 60,
            stake_timestamp_mask: 0xf,
            protocol: ProtocolSchedule {
                v2_time: 1_407_053_625,
                v3_1_time: 1_700_000_000,
            },
            pow_limit: limit_shifted_down(16),
            pos_limit: limit_shifted_down(16),
            target_spacing: 64,
            target_timespan: 16 * 60,
            last_pow_height: 1_000,
            pow_subsidy: 10_000 * crate::money::COIN,
            stake_reward: 3 * crate::money::COIN / 2,
            pow_allow_min_difficulty_blocks: true,
            segwit_height: 100_000,
            mine_blocks_on_demand: false,
        },
        Network::Regtest => ConsensusParams {
            network,
            coinbase_maturity: 10,
            stake_timestamp_mask: 0xf,
            protocol: ProtocolSchedule {
                v2_time: 0,
                v3_1_time: 0,
            },
            pow_limit: limit_shifted_down(28),
            pos_limit: limit_shifted_down(28),
            target_spacing: 64,
            target_timespan: 16 * 60,
            last_pow_height: 200,
            pow_subsidy: 10_000 * crate::money::COIN,
            stake_reward: 3 * crate::money::COIN / 2,
            pow_allow_min_difficulty_blocks: true,
            segwit_height: 0,
            mine_blocks_on_demand: true,
        },
    }
}

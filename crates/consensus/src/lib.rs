//! Consensus constants, chain parameters, and the protocol schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod protocol;
pub mod rewards;

pub use money::{Amount, FeeRate, COIN};
pub use params::{consensus_params, ConsensusParams, Network};
pub use protocol::Hash256;
pub use rewards::{block_subsidy, proof_of_stake_subsidy};

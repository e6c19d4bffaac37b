//! Node-side block production: the fee-ordered mempool, the block
//! assembler, the staking wallet, and the staking loop.

pub mod chain;
pub mod config;
pub mod mempool;
pub mod miner;
pub mod staker;
pub mod wallet;

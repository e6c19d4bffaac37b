//! Chain service contract and difficulty transitions.

use std::sync::Arc;

use blkd_consensus::{ConsensusParams, Hash256};
use blkd_pow::difficulty::{next_target, target_from_limit, u256_to_compact};
use blkd_primitives::block::Block;

use crate::blockindex::BlockIndex;
use crate::utxo::UtxoView;

#[derive(Debug)]
pub enum ChainError {
    /// The block no longer extends the active tip.
    StaleTip,
    /// The block was handed to validation and rejected.
    Rejected(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::StaleTip => write!(f, "generated block is stale"),
            ChainError::Rejected(reason) => write!(f, "block not accepted: {reason}"),
        }
    }
}

impl std::error::Error for ChainError {}

/// The chainstate capabilities block production depends on. The active-tip
/// service, validation, and submission live behind this trait.
pub trait ChainService: Send + Sync {
    fn tip(&self) -> Arc<BlockIndex>;
    fn lookup_block_index(&self, hash: &Hash256) -> Option<Arc<BlockIndex>>;
    /// A handle onto the UTXO set at the current tip.
    fn coins_tip(&self) -> Arc<dyn UtxoView>;
    /// Hand a locally produced block to validation, as if received from a
    /// peer.
    fn process_new_block(&self, block: &Block, force: bool) -> Result<(), ChainError>;
    fn is_initial_block_download(&self) -> bool;
    /// Fraction of the known chain that has been verified, in `0.0..=1.0`.
    fn verification_progress(&self) -> f64;
    /// Sanity-check an assembled block without proof-of-work or merkle-root
    /// checks. Only called for proof-of-work templates.
    fn test_block_validity(&self, block: &Block, prev: &BlockIndex) -> Result<(), String>;
}

/// Compact target required for the block following `prev`, retargeting over
/// the spacing of the last two blocks of the requested proof type.
pub fn next_target_required(
    prev: &Arc<BlockIndex>,
    params: &ConsensusParams,
    proof_of_stake: bool,
) -> u32 {
    let limit = target_from_limit(if proof_of_stake {
        &params.pos_limit
    } else {
        &params.pow_limit
    });

    let Some(last) = prev.last_of_type(proof_of_stake) else {
        return u256_to_compact(limit);
    };
    let last_prev = match last.prev.as_ref() {
        Some(prev) => prev.last_of_type(proof_of_stake),
        None => None,
    };
    let Some(last_prev) = last_prev else {
        return u256_to_compact(limit);
    };

    let actual_spacing = last.block_time() - last_prev.block_time();
    next_target(
        last.bits,
        actual_spacing,
        params.target_spacing,
        params.target_timespan,
        limit,
    )
}

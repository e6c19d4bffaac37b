//! Block assembly.
//!
//! Package selection walks the mempool's ancestor-score index in descending
//! order. Entries are never removed from the pool during selection, so the
//! feerate of a transaction whose ancestors were just packed is repaired
//! on the fly through a shadow set of modified entries, indexed both by
//! txid and by score.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use blkd_chainstate::{next_target_required, BlockIndex, ChainService};
use blkd_consensus::constants::{
    COINBASE_SIGOPS_RESERVE, COINBASE_WEIGHT_RESERVE, DEFAULT_BLOCK_MAX_WEIGHT,
    DEFAULT_BLOCK_MIN_TX_FEE, MAX_BLOCK_SIGOPS_COST, MAX_COINBASE_SCRIPT_SIG_SIZE,
    MAX_CONSECUTIVE_FAILURES, WITNESS_COMMITMENT_HEADER, WITNESS_SCALE_FACTOR,
};
use blkd_consensus::{block_subsidy, Amount, ConsensusParams, FeeRate, Hash256};
use blkd_primitives::block::{
    witness_commitment_index, witness_commitment_payload, Block, BlockHeader,
};
use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::script::{self, ScriptBuilder};
use blkd_primitives::transaction::{Transaction, TxIn, TxOut};

use crate::mempool::{compare_ancestor_score, AncestorScoreKey, Mempool, MempoolEntry, Txid};
use crate::wallet::{CoinStakeRequest, StakingWallet};

/// Version-bits top mask; deployment bits are set below it while their
/// deployments signal.
const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
/// Version bit signalled for the segwit deployment until it activates.
const VERSIONBITS_SEGWIT_BIT: i32 = 1 << 1;

pub fn adjusted_time_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_secs() as i64)
        .unwrap_or(0)
}

/// The in-progress block plus parallel per-transaction fee and sigop-cost
/// arrays. Index 0 is the coinbase; its entries are patched at the end of
/// assembly.
pub struct BlockTemplate {
    pub block: Block,
    pub fees: Vec<Amount>,
    pub sigops_cost: Vec<i64>,
    /// Witness commitment script held for deferred injection by callers
    /// that rebuild the coinbase.
    pub coinbase_commitment: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct AssemblerOptions {
    pub block_max_weight: u64,
    pub block_min_fee_rate: FeeRate,
    /// Regtest-only header version override.
    pub block_version: Option<i32>,
    pub print_priority: bool,
    pub test_block_validity: bool,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            block_max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            block_min_fee_rate: FeeRate::from_sat_per_kvb(DEFAULT_BLOCK_MIN_TX_FEE),
            block_version: None,
            print_priority: false,
            test_block_validity: true,
        }
    }
}

impl AssemblerOptions {
    /// Limit weight to between 4K and the default cap for sanity.
    pub fn clamped(mut self) -> Self {
        self.block_max_weight = self
            .block_max_weight
            .clamp(COINBASE_WEIGHT_RESERVE, DEFAULT_BLOCK_MAX_WEIGHT);
        self
    }
}

#[derive(Debug)]
pub enum CreateBlockError {
    /// No kernel met the target this second; retry on the next one.
    StakeNotFound,
    /// Template self-check failed. Fatal for the assembly attempt.
    Validity(String),
    /// The template could not be built at all; the staker winds down.
    Failed(String),
}

impl std::fmt::Display for CreateBlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateBlockError::StakeNotFound => write!(f, "no coinstake found"),
            CreateBlockError::Validity(reason) => {
                write!(f, "TestBlockValidity failed: {reason}")
            }
            CreateBlockError::Failed(reason) => write!(f, "block creation failed: {reason}"),
        }
    }
}

impl std::error::Error for CreateBlockError {}

/// Coinstake search bookkeeping, shared across assembly attempts of one
/// staking session.
#[derive(Clone, Debug)]
pub struct StakeState {
    pub last_coin_stake_search_time: i64,
    pub last_coin_stake_search_interval: i64,
}

impl StakeState {
    pub fn new() -> Self {
        Self {
            last_coin_stake_search_time: adjusted_time_seconds(),
            last_coin_stake_search_interval: 0,
        }
    }
}

impl Default for StakeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shadow record for a mempool entry whose ancestor accounting went stale
/// because some ancestor was packed into the block.
#[derive(Clone, Copy, Debug)]
struct ModifiedEntry {
    txid: Txid,
    size_with_ancestors: u64,
    fees_with_ancestors: Amount,
    sigops_with_ancestors: i64,
}

impl ModifiedEntry {
    fn score_key(&self) -> AncestorScoreKey {
        AncestorScoreKey {
            fees: self.fees_with_ancestors,
            size: self.size_with_ancestors,
            txid: self.txid,
        }
    }
}

/// Two aligned indices over the same modified entries: a hash map for O(1)
/// membership and a score-ordered set for best-candidate retrieval.
#[derive(Default)]
struct ModifiedSet {
    by_txid: HashMap<Txid, ModifiedEntry>,
    by_score: BTreeSet<AncestorScoreKey>,
}

impl ModifiedSet {
    fn is_empty(&self) -> bool {
        self.by_txid.is_empty()
    }

    fn contains(&self, txid: &Txid) -> bool {
        self.by_txid.contains_key(txid)
    }

    fn best(&self) -> Option<ModifiedEntry> {
        let key = self.by_score.iter().next()?;
        self.by_txid.get(&key.txid).copied()
    }

    fn remove(&mut self, txid: &Txid) {
        if let Some(entry) = self.by_txid.remove(txid) {
            self.by_score.remove(&entry.score_key());
        }
    }

    /// Subtract a freshly packed ancestor's footprint from `txid`'s shadow
    /// state, creating it from the mempool entry's current aggregates on
    /// first touch.
    fn subtract_ancestor(
        &mut self,
        descendant: &MempoolEntry,
        ancestor_size: u64,
        ancestor_fee: Amount,
        ancestor_sigops: i64,
    ) {
        let entry = self
            .by_txid
            .entry(descendant.txid)
            .or_insert_with(|| ModifiedEntry {
                txid: descendant.txid,
                size_with_ancestors: descendant.size_with_ancestors,
                fees_with_ancestors: descendant.fees_with_ancestors,
                sigops_with_ancestors: descendant.sigops_with_ancestors,
            });
        self.by_score.remove(&entry.score_key());
        entry.size_with_ancestors -= ancestor_size;
        entry.fees_with_ancestors -= ancestor_fee;
        entry.sigops_with_ancestors -= ancestor_sigops;
        self.by_score.insert(entry.score_key());
    }
}

pub struct BlockAssembler<'a> {
    params: &'a ConsensusParams,
    options: AssemblerOptions,
    // Per-attempt accumulators.
    in_block: HashSet<Txid>,
    n_height: i32,
    n_block_weight: u64,
    n_block_sigops_cost: i64,
    n_block_tx: u64,
    n_fees: Amount,
    include_witness: bool,
    lock_time_cutoff: i64,
    pub last_block_tx: u64,
    pub last_block_weight: u64,
}

impl<'a> BlockAssembler<'a> {
    pub fn new(params: &'a ConsensusParams, options: AssemblerOptions) -> Self {
        Self {
            params,
            options: options.clamped(),
            in_block: HashSet::new(),
            n_height: 0,
            n_block_weight: 0,
            n_block_sigops_cost: 0,
            n_block_tx: 0,
            n_fees: 0,
            include_witness: false,
            lock_time_cutoff: 0,
            last_block_tx: 0,
            last_block_weight: 0,
        }
    }

    fn reset_block(&mut self) {
        self.in_block.clear();
        // Reserve space for the coinbase transaction.
        self.n_block_weight = COINBASE_WEIGHT_RESERVE;
        self.n_block_sigops_cost = COINBASE_SIGOPS_RESERVE;
        self.include_witness = false;
        // These counters do not include the coinbase.
        self.n_block_tx = 0;
        self.n_fees = 0;
    }

    /// Assemble a block template on top of the active tip. With a wallet the
    /// proof-of-stake branch searches for a coinstake and
    /// `CreateBlockError::StakeNotFound` reports a fruitless second;
    /// without one the template carries a proof-of-work coinbase.
    pub fn create_new_block(
        &mut self,
        script_pub_key: &[u8],
        wallet: Option<&dyn StakingWallet>,
        chain: &dyn ChainService,
        mempool: Option<&Mutex<Mempool>>,
        mut stake_state: Option<&mut StakeState>,
        fees_out: Option<&mut Amount>,
    ) -> Result<BlockTemplate, CreateBlockError> {
        self.reset_block();

        let prev = chain.tip();
        self.n_height = prev.height + 1;

        let mut version = compute_block_version(&prev, self.params);
        if self.params.mine_blocks_on_demand {
            if let Some(override_version) = self.options.block_version {
                version = override_version;
            }
        }

        let mut block = Block::new(BlockHeader {
            version,
            prev_block: prev.hash,
            merkle_root: [0u8; 32],
            time: adjusted_time_seconds() as u32,
            bits: 0,
            nonce: 0,
        });

        let median_time_past = prev.median_time_past();
        self.lock_time_cutoff = if self.params.is_protocol_v3_1(block.header.time as i64) {
            median_time_past
        } else {
            block.header.time as i64
        };

        // Witness transactions are only packed once the deployment is
        // active for the block being built.
        self.include_witness = self.params.segwit_active_at(self.n_height);

        // Placeholder coinbase keeps index 0 reserved while packages land.
        let mut template = BlockTemplate {
            block: Block::new(block.header),
            fees: vec![-1],
            sigops_cost: vec![-1],
            coinbase_commitment: Vec::new(),
        };
        template.block.transactions.push(Transaction::new(0));

        let mut packages_selected = 0usize;
        let mut descendants_updated = 0usize;
        if let Some(mempool) = mempool {
            let pool = mempool
                .lock()
                .map_err(|_| CreateBlockError::Failed("mempool lock poisoned".to_string()))?;
            let (packages, descendants) =
                self.add_package_txs(&mut template, &pool, block.header.time);
            packages_selected = packages;
            descendants_updated = descendants;
        }

        self.last_block_tx = self.n_block_tx;
        self.last_block_weight = self.n_block_weight;

        // Create the coinbase transaction.
        let mut coinbase = Transaction::new(block.header.time);
        coinbase.vin.push(TxIn::from_outpoint(OutPoint::null()));
        coinbase.vout.push(TxOut {
            value: 0,
            script_pubkey: Vec::new(),
        });

        if wallet.is_none() {
            // Proof-of-work block.
            block.header.bits = next_target_required(&prev, self.params, false);
            coinbase.vout[0].script_pubkey = script_pub_key.to_vec();
            coinbase.vout[0].value = self.n_fees + block_subsidy(self.n_height, self.params);
        }

        let mut coinstake: Option<Transaction> = None;
        if let Some(wallet) = wallet {
            // Flush coinstakes orphaned by a tip change before searching.
            wallet.abandon_orphaned_coinstakes();

            let mut pos_cancel = true;
            block.header.bits = next_target_required(&prev, self.params, true);

            let state = stake_state
                .as_deref_mut()
                .ok_or_else(|| CreateBlockError::Failed("missing stake state".to_string()))?;

            // The coinstake search time starts from the adjusted clock,
            // masked down to the protocol granularity.
            let tx_time =
                (adjusted_time_seconds() & !(self.params.stake_timestamp_mask as i64)) as u32;
            let search_time = tx_time as i64;

            if search_time > state.last_coin_stake_search_time {
                let view = chain.coins_tip();
                let request = CoinStakeRequest {
                    prev_index: &prev,
                    view: view.as_ref(),
                    n_bits: block.header.bits,
                    tx_time,
                    search_interval: 1,
                    fees: self.n_fees,
                };
                if let Some(stake_tx) = wallet.create_coin_stake(self.params, &request) {
                    if stake_tx.time as i64 >= median_time_past + 1 {
                        // Make the coinbase empty for proof of stake.
                        coinbase.vout[0].set_empty();
                        block.header.time = stake_tx.time;
                        coinbase.time = stake_tx.time;
                        coinstake = Some(stake_tx);
                        pos_cancel = false;
                    }
                }
                state.last_coin_stake_search_interval =
                    search_time - state.last_coin_stake_search_time;
                state.last_coin_stake_search_time = search_time;
            }

            if pos_cancel {
                // No point continuing without a coinstake.
                return Err(CreateBlockError::StakeNotFound);
            }
        }

        coinbase.vin[0].script_sig = ScriptBuilder::new()
            .push_int(self.n_height as i64)
            .push_opcode(script::OP_0)
            .into_script();

        block.transactions = std::mem::take(&mut template.block.transactions);
        block.transactions[0] = coinbase;
        if let Some(stake_tx) = coinstake {
            let stake_sigops =
                stake_tx.legacy_sig_op_count() as i64 * WITNESS_SCALE_FACTOR as i64;
            block.transactions.insert(1, stake_tx);
            template.fees.insert(1, 0);
            template.sigops_cost.insert(1, stake_sigops);
        }

        if self.include_witness {
            template.coinbase_commitment = generate_coinbase_commitment(&mut block);
        }
        template.fees[0] = -self.n_fees;

        blkd_log::log_info!(
            "create_new_block: weight {} txs {} fees {} sigops {} ({} packages, {} updated descendants)",
            self.n_block_weight,
            self.n_block_tx,
            self.n_fees,
            self.n_block_sigops_cost,
            packages_selected,
            descendants_updated
        );

        if let Some(fees_out) = fees_out {
            *fees_out = self.n_fees;
        }

        // Finalize the header.
        block.header.time = std::cmp::max(median_time_past + 1, block.max_transaction_time()) as u32;
        if !block.is_proof_of_stake() {
            update_time(&mut block, self.params, &prev);
        }
        block.header.nonce = 0;
        template.sigops_cost[0] =
            WITNESS_SCALE_FACTOR as i64 * block.transactions[0].legacy_sig_op_count() as i64;

        if !block.is_proof_of_stake() && self.options.test_block_validity {
            chain
                .test_block_validity(&block, &prev)
                .map_err(CreateBlockError::Validity)?;
        }

        template.block = block;
        Ok(template)
    }

    fn only_unconfirmed(&self, test_set: &mut HashSet<Txid>) {
        test_set.retain(|txid| !self.in_block.contains(txid));
    }

    /// Weight and sigop feasibility for a candidate package. Both checks are
    /// strict: filling the block exactly to the cap is rejected.
    fn test_package(&self, package_size: u64, package_sigops: i64) -> bool {
        if self.n_block_weight + WITNESS_SCALE_FACTOR * package_size >= self.options.block_max_weight
        {
            return false;
        }
        if self.n_block_sigops_cost + package_sigops >= MAX_BLOCK_SIGOPS_COST {
            return false;
        }
        true
    }

    /// Per-transaction checks before a package lands: locktime finality,
    /// premature witness, and the timestamp limits.
    fn test_package_transactions(
        &self,
        mempool: &Mempool,
        package: &HashSet<Txid>,
        block_time: u32,
    ) -> bool {
        let now = adjusted_time_seconds();
        for txid in package {
            let Some(entry) = mempool.get(txid) else {
                return false;
            };
            if !entry.tx.is_final(self.n_height, self.lock_time_cutoff) {
                return false;
            }
            if !self.include_witness && entry.tx.has_witness() {
                return false;
            }
            if entry.tx.time as i64 > now
                || (block_time != 0 && entry.tx.time > block_time)
            {
                return false;
            }
        }
        true
    }

    fn add_to_block(&mut self, template: &mut BlockTemplate, entry: &MempoolEntry) {
        template.block.transactions.push((*entry.tx).clone());
        template.fees.push(entry.fee);
        template.sigops_cost.push(entry.sigop_cost);
        self.n_block_weight += entry.weight;
        self.n_block_tx += 1;
        self.n_block_sigops_cost += entry.sigop_cost;
        self.n_fees += entry.fee;
        self.in_block.insert(entry.txid);

        if self.options.print_priority {
            blkd_log::log_info!(
                "fee rate {} txid {}",
                FeeRate::from_fee_and_size(entry.modified_fee(), entry.size),
                blkd_primitives::hash::hash256_to_hex(&entry.txid)
            );
        }
    }

    /// Fee-descending package selection over the mempool snapshot. Returns
    /// the number of packages selected and of descendant entries repaired.
    fn add_package_txs(
        &mut self,
        template: &mut BlockTemplate,
        mempool: &Mempool,
        block_time: u32,
    ) -> (usize, usize) {
        let mut map_modified = ModifiedSet::default();
        // Entries that failed a package test; never worth re-evaluating
        // because their cached aggregates are stale.
        let mut failed_tx: HashSet<Txid> = HashSet::new();

        let order = mempool.ancestor_score_order();
        let mut mi = 0usize;

        let mut consecutive_failed = 0i64;
        let mut packages_selected = 0usize;
        let mut descendants_updated = 0usize;

        while mi < order.len() || !map_modified.is_empty() {
            if mi < order.len() {
                // Skip entries already packed, shadowed by a modified entry
                // (their primary-index state is stale), or known failures.
                let txid = order[mi];
                if map_modified.contains(&txid)
                    || self.in_block.contains(&txid)
                    || failed_tx.contains(&txid)
                {
                    mi += 1;
                    continue;
                }
            }

            // Decide between the next primary-index entry and the best
            // modified entry.
            let mut using_modified = false;
            let candidate: Txid;
            let best_modified = map_modified.best();
            if mi >= order.len() {
                let Some(best) = best_modified else {
                    break;
                };
                candidate = best.txid;
                using_modified = true;
            } else {
                let primary = order[mi];
                let Some(primary_entry) = mempool.get(&primary) else {
                    mi += 1;
                    continue;
                };
                match best_modified {
                    Some(best)
                        if compare_ancestor_score(
                            best.fees_with_ancestors,
                            best.size_with_ancestors,
                            &best.txid,
                            primary_entry.fees_with_ancestors,
                            primary_entry.size_with_ancestors,
                            &primary,
                        ) == Ordering::Less =>
                    {
                        candidate = best.txid;
                        using_modified = true;
                    }
                    _ => {
                        candidate = primary;
                        mi += 1;
                    }
                }
            }

            debug_assert!(!self.in_block.contains(&candidate));
            let Some(candidate_entry) = mempool.get(&candidate) else {
                continue;
            };

            let (package_size, package_fees, package_sigops) = if using_modified {
                let Some(best) = map_modified.best() else {
                    continue;
                };
                (
                    best.size_with_ancestors,
                    best.fees_with_ancestors,
                    best.sigops_with_ancestors,
                )
            } else {
                (
                    candidate_entry.size_with_ancestors,
                    candidate_entry.fees_with_ancestors,
                    candidate_entry.sigops_with_ancestors,
                )
            };

            if package_fees < self.options.block_min_fee_rate.fee(package_size) {
                // Everything after this candidate scores lower.
                return (packages_selected, descendants_updated);
            }

            if !self.test_package(package_size, package_sigops) {
                if using_modified {
                    // The best modified entry must go so the next best can
                    // surface on the following iteration.
                    map_modified.remove(&candidate);
                    failed_tx.insert(candidate);
                }

                consecutive_failed += 1;
                if consecutive_failed > MAX_CONSECUTIVE_FAILURES
                    && self.n_block_weight > self.options.block_max_weight - COINBASE_WEIGHT_RESERVE
                {
                    // Close to full and not making progress.
                    break;
                }
                continue;
            }

            let mut ancestors = mempool.calculate_ancestors(&candidate);
            self.only_unconfirmed(&mut ancestors);
            ancestors.insert(candidate);

            if !self.test_package_transactions(mempool, &ancestors, block_time) {
                if using_modified {
                    map_modified.remove(&candidate);
                    failed_tx.insert(candidate);
                }
                continue;
            }

            // This package is going in; reset the failure streak.
            consecutive_failed = 0;

            // Parents before children: ancestor counts order any package
            // topologically, txids settle equal counts deterministically.
            let mut sorted: Vec<Txid> = ancestors.iter().copied().collect();
            sorted.sort_by_key(|txid| {
                (
                    mempool
                        .get(txid)
                        .map(|entry| entry.count_with_ancestors)
                        .unwrap_or(u64::MAX),
                    *txid,
                )
            });

            for txid in &sorted {
                if let Some(entry) = mempool.get(txid) {
                    self.add_to_block(template, entry);
                }
                map_modified.remove(txid);
            }

            packages_selected += 1;

            descendants_updated +=
                update_packages_for_added(mempool, &ancestors, &mut map_modified);
        }

        (packages_selected, descendants_updated)
    }
}

/// Push every in-pool descendant of the freshly added entries into the
/// modified set with the added footprints subtracted. Returns the number of
/// descendant updates applied.
fn update_packages_for_added(
    mempool: &Mempool,
    already_added: &HashSet<Txid>,
    map_modified: &mut ModifiedSet,
) -> usize {
    let mut descendants_updated = 0;
    for txid in already_added {
        let Some(added) = mempool.get(txid) else {
            continue;
        };
        for descendant in mempool.calculate_descendants(txid) {
            if already_added.contains(&descendant) {
                continue;
            }
            let Some(entry) = mempool.get(&descendant) else {
                continue;
            };
            descendants_updated += 1;
            map_modified.subtract_ancestor(
                entry,
                added.size,
                added.modified_fee(),
                added.sigop_cost,
            );
        }
    }
    descendants_updated
}

/// Header version derived from the deployment schedule: the top bits plus a
/// signal bit for every deployment not yet active after `prev`.
fn compute_block_version(prev: &Arc<BlockIndex>, params: &ConsensusParams) -> i32 {
    let mut version = VERSIONBITS_TOP_BITS;
    if !params.segwit_active_at(prev.height + 1) {
        version |= VERSIONBITS_SEGWIT_BIT;
    }
    version
}

/// Bump the header time to the adjusted clock (never below the
/// median-time-past floor). Min-difficulty networks re-derive the target,
/// which may change with the new time.
pub fn update_time(block: &mut Block, params: &ConsensusParams, prev: &Arc<BlockIndex>) -> i64 {
    let old_time = block.header.time as i64;
    let new_time = std::cmp::max(prev.median_time_past() + 1, adjusted_time_seconds());
    if old_time < new_time {
        block.header.time = new_time as u32;
    }

    if params.pow_allow_min_difficulty_blocks {
        block.header.bits = next_target_required(prev, params, block.is_proof_of_stake());
    }

    new_time - old_time
}

/// State backing the extra-nonce counter: monotone per tip, reset whenever
/// assembly moves to a new parent.
#[derive(Default)]
pub struct ExtraNonceState {
    hash_prev_block: Hash256,
    extra_nonce: u32,
}

/// Rewrite the coinbase scriptSig with the next extra nonce and refresh the
/// merkle root.
pub fn increment_extra_nonce(block: &mut Block, prev: &BlockIndex, state: &mut ExtraNonceState) {
    if state.hash_prev_block != block.header.prev_block {
        state.extra_nonce = 0;
        state.hash_prev_block = block.header.prev_block;
    }
    state.extra_nonce += 1;
    // Height first in the coinbase, required since block version 2.
    let height = prev.height + 1;
    let script_sig = ScriptBuilder::new()
        .push_int(height as i64)
        .push_int(state.extra_nonce as i64)
        .into_script();
    assert!(script_sig.len() <= MAX_COINBASE_SCRIPT_SIG_SIZE);
    block.transactions[0].vin[0].script_sig = script_sig;
    block.header.merkle_root = block.merkle_root();
}

/// Append the witness commitment output to the coinbase and return the
/// commitment script. The coinbase witness stack carries the reserved
/// 32-byte value.
pub fn generate_coinbase_commitment(block: &mut Block) -> Vec<u8> {
    let payload = witness_commitment_payload(block);
    let mut commitment_script = Vec::with_capacity(38);
    commitment_script.push(script::OP_RETURN);
    commitment_script.push(0x24);
    commitment_script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
    commitment_script.extend_from_slice(&payload);

    let coinbase = &mut block.transactions[0];
    coinbase.vin[0].witness = vec![vec![0u8; 32]];
    coinbase.vout.push(TxOut {
        value: 0,
        script_pubkey: commitment_script.clone(),
    });
    commitment_script
}

/// Strip and regenerate the witness commitment of a mutated template, then
/// refresh the merkle root. Applying this twice is a no-op.
pub fn regenerate_commitments(block: &mut Block, chain: &dyn ChainService) {
    if let Some(index) = witness_commitment_index(block) {
        block.transactions[0].vout.remove(index);
    }

    if chain
        .lookup_block_index(&block.header.prev_block)
        .is_some()
    {
        generate_coinbase_commitment(block);
    }

    block.header.merkle_root = block.merkle_root();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalChain;
    use crate::wallet::Wallet;
    use blkd_consensus::constants::MAX_BLOCK_SIGOPS_COST;
    use blkd_consensus::money::COIN;
    use blkd_consensus::params::{consensus_params, Network};
    use blkd_consensus::proof_of_stake_subsidy;
    use blkd_pos::check_proof_of_stake;
    use blkd_primitives::script::OP_CHECKSIG;

    fn regtest_chain() -> LocalChain {
        let params = consensus_params(Network::Regtest);
        let genesis_time = (adjusted_time_seconds() - 24 * 3600) as u32;
        LocalChain::new(params, genesis_time)
    }

    fn spend_tx(prevout: OutPoint, pad: usize, time: u32) -> Transaction {
        let mut tx = Transaction::new(time);
        tx.vin.push(TxIn::from_outpoint(prevout));
        tx.vout.push(TxOut {
            value: 10_000,
            script_pubkey: vec![0x51; 1 + pad],
        });
        tx
    }

    fn external_outpoint(salt: u8) -> OutPoint {
        OutPoint {
            hash: [salt; 32],
            index: 0,
        }
    }

    fn options_without_fee_floor() -> AssemblerOptions {
        AssemblerOptions {
            block_min_fee_rate: FeeRate::from_sat_per_kvb(0),
            ..AssemblerOptions::default()
        }
    }

    fn assemble(
        chain: &LocalChain,
        options: AssemblerOptions,
        mempool: &Mutex<Mempool>,
    ) -> BlockTemplate {
        let params = chain.params().clone();
        let mut assembler = BlockAssembler::new(&params, options);
        assembler
            .create_new_block(&[0x51], None, chain, Some(mempool), None, None)
            .expect("assembly")
    }

    fn template_txids(template: &BlockTemplate) -> Vec<Txid> {
        template
            .block
            .transactions
            .iter()
            .skip(1)
            .map(|tx| tx.txid())
            .collect()
    }

    #[test]
    fn empty_mempool_yields_subsidy_only_coinbase() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let mempool = Mutex::new(Mempool::new());

        let mut assembler = BlockAssembler::new(&params, AssemblerOptions::default());
        let mut fees = -1;
        let template = assembler
            .create_new_block(&[0x51], None, &chain, Some(&mempool), None, Some(&mut fees))
            .expect("assembly");

        assert_eq!(fees, 0);
        let coinbase = &template.block.transactions[0];
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.vout[0].script_pubkey, vec![0x51]);
        assert_eq!(coinbase.vout[0].value, block_subsidy(1, &params));
        assert_eq!(template.fees[0], 0);
        // Only the coinbase (plus its witness commitment output on regtest).
        assert_eq!(template.block.transactions.len(), 1);
        assert!(template.block.weight() <= DEFAULT_BLOCK_MAX_WEIGHT);
    }

    #[test]
    fn solo_beats_package_then_package_lands_topologically() {
        let chain = regtest_chain();
        let mempool = Mutex::new(Mempool::new());
        let (a, b, c);
        {
            let mut pool = mempool.lock().unwrap();
            // Parent A drags child B's package score below solo C, while
            // B alone out-scores C.
            a = pool
                .insert(spend_tx(external_outpoint(1), 0, 1_600_000_000), 100, 1, 0)
                .unwrap();
            b = pool
                .insert(
                    spend_tx(OutPoint { hash: a, index: 0 }, 0, 1_600_000_000),
                    1_000,
                    1,
                    1,
                )
                .unwrap();
            c = pool
                .insert(spend_tx(external_outpoint(2), 0, 1_600_000_000), 600, 1, 2)
                .unwrap();
            let score = |txid: &Txid| {
                let entry = pool.get(txid).unwrap();
                entry.fees_with_ancestors as f64 / entry.size_with_ancestors as f64
            };
            assert!(score(&c) > score(&b));
        }

        let template = assemble(&chain, options_without_fee_floor(), &mempool);
        assert_eq!(template_txids(&template), vec![c, a, b]);
        assert_eq!(template.fees[1..], [600, 100, 1_000]);
    }

    #[test]
    fn identical_siblings_select_deterministically() {
        let chain = regtest_chain();
        let build_pool = |salts: &[u8]| {
            let mut pool = Mempool::new();
            for &salt in salts {
                pool.insert(spend_tx(external_outpoint(salt), 0, 1_600_000_000), 500, 1, 0)
                    .unwrap();
            }
            Mutex::new(pool)
        };

        let first = assemble(&chain, options_without_fee_floor(), &build_pool(&[1, 2, 3]));
        let second = assemble(&chain, options_without_fee_floor(), &build_pool(&[3, 1, 2]));
        assert_eq!(template_txids(&first), template_txids(&second));

        let mut expected = template_txids(&first);
        expected.sort();
        assert_eq!(template_txids(&first), expected);
    }

    #[test]
    fn fee_floor_is_a_strict_bound() {
        let chain = regtest_chain();
        let mempool = Mutex::new(Mempool::new());
        let rate = FeeRate::from_sat_per_kvb(10_000);
        let (below, exact);
        {
            let mut pool = mempool.lock().unwrap();
            let tx = spend_tx(external_outpoint(1), 0, 1_600_000_000);
            let floor = rate.fee(tx.vsize());
            below = pool.insert(tx, floor - 1, 1, 0).unwrap();
            let tx = spend_tx(external_outpoint(2), 0, 1_600_000_000);
            let floor = rate.fee(tx.vsize());
            exact = pool.insert(tx, floor, 1, 1).unwrap();
        }

        let options = AssemblerOptions {
            block_min_fee_rate: rate,
            ..AssemblerOptions::default()
        };
        let template = assemble(&chain, options, &mempool);
        let txids = template_txids(&template);
        // Meeting the floor exactly passes the strict `<` check; staying
        // below it ends selection.
        assert!(txids.contains(&exact));
        assert!(!txids.contains(&below));
    }

    #[test]
    fn package_reaching_max_weight_exactly_is_rejected() {
        let chain = regtest_chain();
        let tx = spend_tx(external_outpoint(1), 0, 1_600_000_000);
        let vsize = tx.vsize();

        let run_with_cap = |cap: u64| {
            let mempool = Mutex::new(Mempool::new());
            mempool
                .lock()
                .unwrap()
                .insert(tx.clone(), 10_000, 1, 0)
                .unwrap();
            let options = AssemblerOptions {
                block_max_weight: cap,
                block_min_fee_rate: FeeRate::from_sat_per_kvb(0),
                ..AssemblerOptions::default()
            };
            template_txids(&assemble(&chain, options, &mempool)).len()
        };

        // Exactly reaching the cap fails the strict `>=` test.
        assert_eq!(run_with_cap(COINBASE_WEIGHT_RESERVE + 4 * vsize), 0);
        assert_eq!(run_with_cap(COINBASE_WEIGHT_RESERVE + 4 * vsize + 1), 1);
    }

    #[test]
    fn sigop_budget_is_strict() {
        let chain = regtest_chain();
        let sigop_tx = |salt: u8, checksigs: usize| {
            let mut tx = Transaction::new(1_600_000_000);
            tx.vin.push(TxIn::from_outpoint(external_outpoint(salt)));
            tx.vout.push(TxOut {
                value: 10_000,
                script_pubkey: vec![OP_CHECKSIG; checksigs],
            });
            tx
        };

        let budget = (MAX_BLOCK_SIGOPS_COST - COINBASE_SIGOPS_RESERVE) as usize
            / WITNESS_SCALE_FACTOR as usize;

        let run = |checksigs: usize| {
            let mempool = Mutex::new(Mempool::new());
            mempool
                .lock()
                .unwrap()
                .insert(sigop_tx(1, checksigs), 10_000, 1, 0)
                .unwrap();
            template_txids(&assemble(&chain, options_without_fee_floor(), &mempool)).len()
        };

        assert_eq!(run(budget), 0);
        assert_eq!(run(budget - 1), 1);
    }

    #[test]
    fn transactions_appear_once_with_parents_first() {
        let chain = regtest_chain();
        let mempool = Mutex::new(Mempool::new());
        let ids;
        {
            let mut pool = mempool.lock().unwrap();
            // A diamond: D spends B and C, both children of A.
            let a = pool
                .insert(spend_tx(external_outpoint(1), 0, 1_600_000_000), 400, 1, 0)
                .unwrap();
            let mut b_tx = spend_tx(OutPoint { hash: a, index: 0 }, 1, 1_600_000_000);
            b_tx.vout.push(TxOut {
                value: 1_000,
                script_pubkey: vec![0x52],
            });
            let b = pool.insert(b_tx, 500, 1, 1).unwrap();
            let c = pool
                .insert(spend_tx(external_outpoint(2), 2, 1_600_000_000), 450, 1, 2)
                .unwrap();
            let mut d_tx = Transaction::new(1_600_000_000);
            d_tx.vin.push(TxIn::from_outpoint(OutPoint { hash: b, index: 1 }));
            d_tx.vin.push(TxIn::from_outpoint(OutPoint { hash: c, index: 0 }));
            d_tx.vout.push(TxOut {
                value: 100,
                script_pubkey: vec![0x53],
            });
            let d = pool.insert(d_tx, 5_000, 1, 3).unwrap();
            ids = vec![a, b, c, d];
        }

        let template = assemble(&chain, options_without_fee_floor(), &mempool);
        let txids = template_txids(&template);
        assert_eq!(txids.len(), 4);

        // No duplicates.
        let mut deduped = txids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 4);

        // Every parent lands before its spender.
        let position = |txid: &Txid| txids.iter().position(|t| t == txid).unwrap();
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        assert!(position(&a) < position(&b));
        assert!(position(&b) < position(&d));
        assert!(position(&c) < position(&d));
    }

    #[test]
    fn stale_transaction_times_are_excluded() {
        let chain = regtest_chain();
        let mempool = Mutex::new(Mempool::new());
        let (past, future);
        {
            let mut pool = mempool.lock().unwrap();
            past = pool
                .insert(spend_tx(external_outpoint(1), 0, 1_600_000_000), 500, 1, 0)
                .unwrap();
            // A timestamp beyond the adjusted clock never packs.
            let late = (adjusted_time_seconds() + 7_200) as u32;
            future = pool
                .insert(spend_tx(external_outpoint(2), 0, late), 500, 1, 1)
                .unwrap();
        }

        let template = assemble(&chain, options_without_fee_floor(), &mempool);
        let txids = template_txids(&template);
        assert!(txids.contains(&past));
        assert!(!txids.contains(&future));
    }

    #[test]
    fn proof_of_stake_template_holds_invariants() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let wallet = Wallet::new_random(4);
        let script = wallet.default_script().expect("script");

        // Plenty of eligible coins: some kernel passes essentially every
        // masked second on the regtest target.
        let coins: Vec<(OutPoint, i64, Vec<u8>)> = (0..48u8)
            .map(|index| (external_outpoint(0x80 + index), 2 * COIN, script.clone()))
            .collect();
        chain.seed_history(&coins, params.target_spacing as u32, params.coinbase_maturity);
        for (outpoint, _, _) in &coins {
            wallet.add_owned_outpoint(*outpoint);
        }

        let mempool = Mutex::new(Mempool::new());
        let fee = 900;
        let mempool_txid = mempool
            .lock()
            .unwrap()
            .insert(spend_tx(external_outpoint(0x10), 0, 1_600_000_000), fee, 1, 0)
            .unwrap();

        let mut stake_state = StakeState {
            last_coin_stake_search_time: 0,
            last_coin_stake_search_interval: 0,
        };
        let mut assembler = BlockAssembler::new(&params, options_without_fee_floor());
        let template = assembler
            .create_new_block(
                &script,
                Some(&wallet),
                &chain,
                Some(&mempool),
                Some(&mut stake_state),
                None,
            )
            .expect("a kernel should land on the permissive regtest target");

        let block = &template.block;
        assert!(block.is_proof_of_stake());

        // The coinbase pays nothing; output 0 is the empty marker.
        let coinbase = &block.transactions[0];
        assert!(coinbase.is_coinbase());
        assert!(coinbase.vout[0].is_empty());

        let coinstake = &block.transactions[1];
        assert!(coinstake.is_coin_stake());
        assert_eq!(block.header.time, coinstake.time);
        assert_eq!(coinbase.time, coinstake.time);
        assert_eq!(
            coinstake.time & params.stake_timestamp_mask,
            0,
            "coinstake time must sit on a mask boundary"
        );
        assert!(coinstake.time as i64 >= chain.tip().median_time_past() + 1);

        // Fees collected by selection flow into the stake reward.
        assert_eq!(
            coinstake.vout[1].value,
            2 * COIN + proof_of_stake_subsidy(&params) + fee
        );
        assert!(template_txids(&template).contains(&mempool_txid));

        // Parallel arrays stay aligned with the transaction list.
        assert_eq!(template.fees.len(), block.transactions.len());
        assert_eq!(template.sigops_cost.len(), block.transactions.len());
        assert_eq!(template.fees[0], -fee);
        assert_eq!(template.fees[1], 0);

        // The emitted proof validates against the same view.
        let view = chain.view();
        assert_eq!(
            check_proof_of_stake(
                &chain.tip(),
                coinstake,
                block.header.bits,
                view.as_ref(),
                coinstake.time,
                &params,
            ),
            Ok(())
        );

        // Search bookkeeping advanced.
        assert!(stake_state.last_coin_stake_search_time > 0);
        assert!(stake_state.last_coin_stake_search_interval > 0);
    }

    #[test]
    fn block_version_signals_pending_deployments() {
        let genesis = BlockIndex::genesis([0u8; 32], 1_000, 0x1e0f_ffff);

        // Segwit is far from active at genesis height on mainnet, so its
        // bit signals under the top mask.
        let mainnet = consensus_params(Network::Mainnet);
        let version = compute_block_version(&genesis, &mainnet);
        assert_eq!(version & VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_BITS);
        assert_ne!(version & VERSIONBITS_SEGWIT_BIT, 0);

        // On regtest the deployment is active from the start: no signal.
        let regtest = consensus_params(Network::Regtest);
        assert_eq!(compute_block_version(&genesis, &regtest), VERSIONBITS_TOP_BITS);
    }

    #[test]
    fn extra_nonce_resets_on_new_tip() {
        let chain = regtest_chain();
        let mempool = Mutex::new(Mempool::new());
        let mut template = assemble(&chain, AssemblerOptions::default(), &mempool);
        let prev = chain.tip();

        let mut state = ExtraNonceState::default();
        increment_extra_nonce(&mut template.block, &prev, &mut state);
        let first_sig = template.block.transactions[0].vin[0].script_sig.clone();
        let first_root = template.block.header.merkle_root;
        assert_ne!(first_root, [0u8; 32]);

        increment_extra_nonce(&mut template.block, &prev, &mut state);
        let second_sig = template.block.transactions[0].vin[0].script_sig.clone();
        assert_ne!(first_sig, second_sig);

        // A tip change restarts the counter: the same scriptSig comes back.
        template.block.header.prev_block = [0x77; 32];
        increment_extra_nonce(&mut template.block, &prev, &mut state);
        let reset_sig = template.block.transactions[0].vin[0].script_sig.clone();
        assert_eq!(first_sig, reset_sig);
    }

    #[test]
    fn regenerate_commitments_is_idempotent() {
        let chain = regtest_chain();
        let mempool = Mutex::new(Mempool::new());
        let mut template = assemble(&chain, AssemblerOptions::default(), &mempool);

        regenerate_commitments(&mut template.block, &chain);
        let once = template.block.consensus_encode();
        regenerate_commitments(&mut template.block, &chain);
        let twice = template.block.consensus_encode();
        assert_eq!(once, twice);
        assert!(witness_commitment_index(&template.block).is_some());
    }
}

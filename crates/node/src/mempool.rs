//! Fee-ordered transaction mempool.
//!
//! Block assembly consumes the pool read-only through two aligned views: a
//! primary map by txid and an ancestor-score index ordered by the fee rate
//! of each entry including its unconfirmed ancestors.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use blkd_consensus::constants::WITNESS_SCALE_FACTOR;
use blkd_consensus::{Amount, Hash256};
use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::transaction::Transaction;

pub type Txid = Hash256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolError {
    AlreadyInMempool,
    ConflictingInput,
    NonTopological,
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::AlreadyInMempool => write!(f, "transaction already in mempool"),
            MempoolError::ConflictingInput => write!(f, "input already spent in mempool"),
            MempoolError::NonTopological => {
                write!(f, "transaction spends a later mempool transaction")
            }
        }
    }
}

impl std::error::Error for MempoolError {}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Txid,
    pub tx: Arc<Transaction>,
    pub fee: Amount,
    pub fee_delta: Amount,
    pub time: u64,
    pub height: i32,
    /// Virtual size in vbytes.
    pub size: u64,
    pub weight: u64,
    pub sigop_cost: i64,
    /// Aggregates over the entry and all its unconfirmed ancestors.
    pub count_with_ancestors: u64,
    pub size_with_ancestors: u64,
    pub fees_with_ancestors: Amount,
    pub sigops_with_ancestors: i64,
    pub parents: HashSet<Txid>,
    pub children: HashSet<Txid>,
}

impl MempoolEntry {
    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    fn score_key(&self) -> AncestorScoreKey {
        AncestorScoreKey {
            fees: self.fees_with_ancestors,
            size: self.size_with_ancestors,
            txid: self.txid,
        }
    }
}

/// Ancestor-score ordering key. Iteration order of the index is highest
/// fee-rate-with-ancestors first; ties break on the txid so selection is
/// deterministic for identical scores.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AncestorScoreKey {
    pub fees: Amount,
    pub size: u64,
    pub txid: Txid,
}

impl Ord for AncestorScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_ancestor_score(
            self.fees, self.size, &self.txid, other.fees, other.size, &other.txid,
        )
    }
}

impl PartialOrd for AncestorScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `Less` when the left package sorts ahead of (scores better than) the
/// right one. Compares `fee_a / size_a` against `fee_b / size_b` without
/// division.
pub fn compare_ancestor_score(
    a_fees: Amount,
    a_size: u64,
    a_txid: &Txid,
    b_fees: Amount,
    b_size: u64,
    b_txid: &Txid,
) -> Ordering {
    let left = a_fees as i128 * b_size as i128;
    let right = b_fees as i128 * a_size as i128;
    right.cmp(&left).then_with(|| a_txid.cmp(b_txid))
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Txid, MempoolEntry>,
    by_ancestor_score: BTreeSet<AncestorScoreKey>,
    spent: HashMap<OutPoint, Txid>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.spent.get(outpoint).copied()
    }

    /// Snapshot of txids in descending ancestor-score order.
    pub fn ancestor_score_order(&self) -> Vec<Txid> {
        self.by_ancestor_score.iter().map(|key| key.txid).collect()
    }

    /// Admit a transaction whose in-pool parents are already present.
    pub fn insert(
        &mut self,
        tx: Transaction,
        fee: Amount,
        height: i32,
        time: u64,
    ) -> Result<Txid, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyInMempool);
        }
        for input in &tx.vin {
            if self.spent.contains_key(&input.prevout) {
                return Err(MempoolError::ConflictingInput);
            }
        }

        let mut parents = HashSet::new();
        for input in &tx.vin {
            if self.entries.contains_key(&input.prevout.hash) {
                parents.insert(input.prevout.hash);
            }
        }

        let weight = tx.weight();
        let size = tx.vsize();
        let sigop_cost = tx.legacy_sig_op_count() as i64 * WITNESS_SCALE_FACTOR as i64;

        let ancestors = self.walk_ancestors(&parents);
        let mut count_with_ancestors = 1u64;
        let mut size_with_ancestors = size;
        let mut fees_with_ancestors = fee;
        let mut sigops_with_ancestors = sigop_cost;
        for ancestor in &ancestors {
            // Ancestors are present by construction.
            let Some(entry) = self.entries.get(ancestor) else {
                return Err(MempoolError::NonTopological);
            };
            count_with_ancestors += 1;
            size_with_ancestors += entry.size;
            fees_with_ancestors += entry.modified_fee();
            sigops_with_ancestors += entry.sigop_cost;
        }

        for parent in &parents {
            if let Some(entry) = self.entries.get_mut(parent) {
                entry.children.insert(txid);
            }
        }
        for input in &tx.vin {
            self.spent.insert(input.prevout, txid);
        }

        let entry = MempoolEntry {
            txid,
            tx: Arc::new(tx),
            fee,
            fee_delta: 0,
            time,
            height,
            size,
            weight,
            sigop_cost,
            count_with_ancestors,
            size_with_ancestors,
            fees_with_ancestors,
            sigops_with_ancestors,
            parents,
            children: HashSet::new(),
        };
        self.by_ancestor_score.insert(entry.score_key());
        self.entries.insert(txid, entry);
        Ok(txid)
    }

    /// Adjust the effective fee used for selection ordering.
    pub fn prioritise_transaction(&mut self, txid: &Txid, fee_delta: Amount) {
        if !self.entries.contains_key(txid) {
            return;
        }
        // The delta flows into the entry and every descendant's aggregate.
        for descendant in self.calculate_descendants(txid) {
            let Some(entry) = self.entries.get_mut(&descendant) else {
                continue;
            };
            self.by_ancestor_score.remove(&entry.score_key());
            entry.fees_with_ancestors += fee_delta;
            self.by_ancestor_score.insert(entry.score_key());
        }
        if let Some(entry) = self.entries.get_mut(txid) {
            entry.fee_delta += fee_delta;
        }
    }

    /// All unconfirmed ancestors of `txid`, excluding the entry itself.
    /// Mirrors the no-limit ancestor calculation: the stored parent links
    /// are walked rather than re-derived from inputs.
    pub fn calculate_ancestors(&self, txid: &Txid) -> HashSet<Txid> {
        match self.entries.get(txid) {
            Some(entry) => self.walk_ancestors(&entry.parents),
            None => HashSet::new(),
        }
    }

    fn walk_ancestors(&self, parents: &HashSet<Txid>) -> HashSet<Txid> {
        let mut ancestors: HashSet<Txid> = HashSet::new();
        let mut queue: VecDeque<Txid> = parents.iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if !ancestors.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                for parent in &entry.parents {
                    if !ancestors.contains(parent) {
                        queue.push_back(*parent);
                    }
                }
            }
        }
        ancestors
    }

    /// The entry and every in-pool descendant of it.
    pub fn calculate_descendants(&self, txid: &Txid) -> HashSet<Txid> {
        let mut descendants = HashSet::new();
        if !self.entries.contains_key(txid) {
            return descendants;
        }
        let mut queue: VecDeque<Txid> = VecDeque::new();
        queue.push_back(*txid);
        while let Some(current) = queue.pop_front() {
            if !descendants.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                for child in &entry.children {
                    if !descendants.contains(child) {
                        queue.push_back(*child);
                    }
                }
            }
        }
        descendants
    }

    /// Drop entries mined into a block and repair the with-ancestor
    /// aggregates of the descendants left behind.
    pub fn remove_mined(&mut self, txids: &[Txid]) {
        for txid in txids {
            let Some(entry) = self.entries.get(txid) else {
                continue;
            };
            let removed_size = entry.size;
            let removed_fee = entry.modified_fee();
            let removed_sigops = entry.sigop_cost;

            for descendant in self.calculate_descendants(txid) {
                if descendant == *txid {
                    continue;
                }
                let Some(desc) = self.entries.get_mut(&descendant) else {
                    continue;
                };
                self.by_ancestor_score.remove(&desc.score_key());
                desc.count_with_ancestors -= 1;
                desc.size_with_ancestors -= removed_size;
                desc.fees_with_ancestors -= removed_fee;
                desc.sigops_with_ancestors -= removed_sigops;
                desc.parents.remove(txid);
                self.by_ancestor_score.insert(desc.score_key());
            }

            let Some(entry) = self.entries.remove(txid) else {
                continue;
            };
            self.by_ancestor_score.remove(&entry.score_key());
            for parent in &entry.parents {
                if let Some(parent_entry) = self.entries.get_mut(parent) {
                    parent_entry.children.remove(txid);
                }
            }
            for input in &entry.tx.vin {
                self.spent.remove(&input.prevout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkd_primitives::transaction::{TxIn, TxOut};

    fn spend(parent: Option<(Txid, u32)>, salt: u8, size_padding: usize) -> Transaction {
        let mut tx = Transaction::new(1_600_000_000);
        let prevout = match parent {
            Some((hash, index)) => OutPoint { hash, index },
            None => OutPoint {
                hash: [salt; 32],
                index: 0,
            },
        };
        tx.vin.push(TxIn::from_outpoint(prevout));
        tx.vout.push(TxOut {
            value: 10_000,
            script_pubkey: vec![salt; 1 + size_padding],
        });
        tx
    }

    #[test]
    fn ancestor_aggregates_accumulate() {
        let mut pool = Mempool::new();
        let a = pool.insert(spend(None, 1, 0), 1_000, 10, 0).unwrap();
        let b = pool.insert(spend(Some((a, 0)), 2, 0), 2_000, 10, 1).unwrap();
        let c = pool.insert(spend(Some((b, 0)), 3, 0), 4_000, 10, 2).unwrap();

        let entry_c = pool.get(&c).unwrap();
        assert_eq!(entry_c.count_with_ancestors, 3);
        assert_eq!(entry_c.fees_with_ancestors, 7_000);
        assert_eq!(
            entry_c.size_with_ancestors,
            pool.get(&a).unwrap().size + pool.get(&b).unwrap().size + entry_c.size
        );

        assert_eq!(pool.calculate_ancestors(&c), [a, b].into_iter().collect());
        assert_eq!(
            pool.calculate_descendants(&a),
            [a, b, c].into_iter().collect()
        );
    }

    #[test]
    fn conflicting_spend_is_rejected() {
        let mut pool = Mempool::new();
        let a = pool.insert(spend(None, 1, 0), 1_000, 10, 0).unwrap();
        pool.insert(spend(Some((a, 0)), 2, 0), 1_000, 10, 1).unwrap();
        let double_spend = spend(Some((a, 0)), 9, 3);
        assert_eq!(
            pool.insert(double_spend, 1_000, 10, 2),
            Err(MempoolError::ConflictingInput)
        );
    }

    #[test]
    fn score_order_is_fee_rate_descending() {
        let mut pool = Mempool::new();
        // Same sizes, different fees.
        let low = pool.insert(spend(None, 1, 0), 1_000, 10, 0).unwrap();
        let high = pool.insert(spend(None, 2, 0), 5_000, 10, 1).unwrap();
        let mid = pool.insert(spend(None, 3, 0), 3_000, 10, 2).unwrap();
        assert_eq!(pool.ancestor_score_order(), vec![high, mid, low]);
    }

    #[test]
    fn score_ties_break_on_txid() {
        let mut pool = Mempool::new();
        let a = pool.insert(spend(None, 1, 0), 1_000, 10, 0).unwrap();
        let b = pool.insert(spend(None, 2, 0), 1_000, 10, 1).unwrap();
        let c = pool.insert(spend(None, 3, 0), 1_000, 10, 2).unwrap();
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(pool.ancestor_score_order(), expected);
    }

    #[test]
    fn remove_mined_parent_detaches_children() {
        let mut pool = Mempool::new();
        let a = pool.insert(spend(None, 1, 0), 1_000, 10, 0).unwrap();
        let b = pool.insert(spend(Some((a, 0)), 2, 0), 2_000, 10, 1).unwrap();

        pool.remove_mined(&[a]);
        assert!(!pool.contains(&a));
        let entry_b = pool.get(&b).unwrap();
        assert_eq!(entry_b.count_with_ancestors, 1);
        assert_eq!(entry_b.fees_with_ancestors, 2_000);
        assert_eq!(entry_b.size_with_ancestors, entry_b.size);
        assert!(entry_b.parents.is_empty());
        assert_eq!(pool.calculate_ancestors(&b), HashSet::new());
    }

    #[test]
    fn prioritise_raises_descendant_scores() {
        let mut pool = Mempool::new();
        let a = pool.insert(spend(None, 1, 0), 1_000, 10, 0).unwrap();
        let b = pool.insert(spend(Some((a, 0)), 2, 0), 1_000, 10, 1).unwrap();
        pool.prioritise_transaction(&a, 10_000);
        assert_eq!(pool.get(&a).unwrap().modified_fee(), 11_000);
        assert_eq!(pool.get(&a).unwrap().fees_with_ancestors, 11_000);
        assert_eq!(pool.get(&b).unwrap().fees_with_ancestors, 12_000);
        // The subsidised package now leads the index.
        assert_eq!(pool.ancestor_score_order()[0], a);
    }
}

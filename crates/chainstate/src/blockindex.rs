//! In-memory block index entries linked back to genesis.

use std::sync::Arc;

use blkd_consensus::constants::BLOCK_PROOF_OF_STAKE;
use blkd_consensus::Hash256;

const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Clone, Debug)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub prev: Option<Arc<BlockIndex>>,
    pub height: i32,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    /// Modifier mixed into every kernel hash built on top of this block.
    pub stake_modifier: Hash256,
    pub flags: u32,
}

impl BlockIndex {
    pub fn genesis(hash: Hash256, time: u32, bits: u32) -> Arc<Self> {
        Arc::new(Self {
            hash,
            prev: None,
            height: 0,
            version: 1,
            time,
            bits,
            stake_modifier: [0u8; 32],
            flags: 0,
        })
    }

    pub fn block_time(&self) -> i64 {
        self.time as i64
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & BLOCK_PROOF_OF_STAKE != 0
    }

    /// Median of the last 11 block times ending at this block.
    pub fn median_time_past(&self) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(self);
        while let Some(index) = cursor {
            times.push(index.block_time());
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            cursor = index.prev.as_deref();
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Walk back to the ancestor at `height`. Returns `None` when `height`
    /// is above this entry or the chain is not loaded that far back.
    pub fn ancestor(self: &Arc<Self>, height: i32) -> Option<Arc<Self>> {
        if height > self.height || height < 0 {
            return None;
        }
        let mut cursor = Arc::clone(self);
        while cursor.height > height {
            cursor = Arc::clone(cursor.prev.as_ref()?);
        }
        Some(cursor)
    }

    /// The most recent block at or before this one whose proof type matches.
    pub fn last_of_type(self: &Arc<Self>, proof_of_stake: bool) -> Option<Arc<Self>> {
        let mut cursor = Arc::clone(self);
        loop {
            if cursor.is_proof_of_stake() == proof_of_stake {
                return Some(cursor);
            }
            let prev = cursor.prev.as_ref()?;
            cursor = Arc::clone(prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of_times(times: &[u32]) -> Arc<BlockIndex> {
        let mut tip = BlockIndex::genesis([0u8; 32], times[0], 0x1e0f_ffff);
        for (i, time) in times.iter().enumerate().skip(1) {
            let mut hash = [0u8; 32];
            hash[..4].copy_from_slice(&(i as u32).to_le_bytes());
            tip = Arc::new(BlockIndex {
                hash,
                prev: Some(Arc::clone(&tip)),
                height: i as i32,
                version: 2,
                time: *time,
                bits: 0x1e0f_ffff,
                stake_modifier: [0u8; 32],
                flags: if i % 2 == 0 { BLOCK_PROOF_OF_STAKE } else { 0 },
            });
        }
        tip
    }

    #[test]
    fn median_time_past_sorts_times() {
        let tip = chain_of_times(&[100, 300, 200]);
        // Three blocks: sorted [100, 200, 300], median 200.
        assert_eq!(tip.median_time_past(), 200);
    }

    #[test]
    fn median_time_past_uses_last_eleven() {
        let times: Vec<u32> = (0..20).map(|i| 1_000 + i * 10).collect();
        let tip = chain_of_times(&times);
        // Last 11 times are 1090..=1190, median 1140.
        assert_eq!(tip.median_time_past(), 1_140);
    }

    #[test]
    fn ancestor_walks_to_height() {
        let times: Vec<u32> = (0..8).map(|i| 100 + i).collect();
        let tip = chain_of_times(&times);
        assert_eq!(tip.ancestor(0).expect("genesis").height, 0);
        assert_eq!(tip.ancestor(5).expect("mid").height, 5);
        assert_eq!(tip.ancestor(7).expect("self").hash, tip.hash);
        assert!(tip.ancestor(8).is_none());
    }

    #[test]
    fn last_of_type_skips_other_proofs() {
        let times: Vec<u32> = (0..6).map(|i| 100 + i).collect();
        let tip = chain_of_times(&times);
        // Height 5 is PoW (odd), height 4 is PoS.
        assert_eq!(tip.last_of_type(false).expect("pow").height, 5);
        assert_eq!(tip.last_of_type(true).expect("pos").height, 4);
    }
}

//! In-memory chain service backing the single-node binary and the tests.
//!
//! Keeps the block index and UTXO set in memory, connects locally produced
//! blocks, and maintains the stake modifier chain. Real deployments put a
//! full validator behind the [`ChainService`] trait instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blkd_chainstate::{BlockIndex, ChainError, ChainService, Coin, MemoryUtxoView, UtxoView};
use blkd_consensus::constants::{BLOCK_PROOF_OF_STAKE, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT};
use blkd_consensus::{ConsensusParams, Hash256};
use blkd_pos::{
    check_coin_stake_timestamp, check_proof_of_stake, compute_stake_modifier, stake_kernel_hash,
};
use blkd_primitives::block::Block;
use blkd_primitives::hash::hash256_to_hex;
use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::transaction::TxOut;

type ConnectHook = Box<dyn Fn(&Block, i32) + Send + Sync>;

struct ChainInner {
    tip: Arc<BlockIndex>,
    indices: HashMap<Hash256, Arc<BlockIndex>>,
    verification_progress: f64,
}

pub struct LocalChain {
    params: ConsensusParams,
    view: Arc<MemoryUtxoView>,
    inner: Mutex<ChainInner>,
    ibd: AtomicBool,
    connect_hooks: Mutex<Vec<ConnectHook>>,
}

impl LocalChain {
    pub fn new(params: ConsensusParams, genesis_time: u32) -> Self {
        let genesis_bits = 0x2007_ffff;
        let mut genesis_hash = [0u8; 32];
        genesis_hash[..7].copy_from_slice(b"genesis");
        let genesis = BlockIndex::genesis(genesis_hash, genesis_time, genesis_bits);
        let mut indices = HashMap::new();
        indices.insert(genesis.hash, Arc::clone(&genesis));
        Self {
            params,
            view: Arc::new(MemoryUtxoView::new()),
            inner: Mutex::new(ChainInner {
                tip: genesis,
                indices,
                verification_progress: 1.0,
            }),
            ibd: AtomicBool::new(false),
            connect_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn view(&self) -> Arc<MemoryUtxoView> {
        Arc::clone(&self.view)
    }

    pub fn set_initial_block_download(&self, ibd: bool) {
        self.ibd.store(ibd, Ordering::Relaxed);
    }

    pub fn set_verification_progress(&self, progress: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.verification_progress = progress;
        }
    }

    pub fn add_connect_hook(&self, hook: ConnectHook) {
        if let Ok(mut hooks) = self.connect_hooks.lock() {
            hooks.push(hook);
        }
    }

    /// Extend the index with empty synthetic blocks, seeding one spendable
    /// output per block. Gives tests and the demo binary a mature history
    /// without replaying real blocks.
    pub fn seed_history(&self, coins: &[(OutPoint, i64, Vec<u8>)], spacing: u32, pad_blocks: i32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for (index, (outpoint, value, script)) in coins.iter().enumerate() {
            let tip = Arc::clone(&inner.tip);
            let height = tip.height + 1;
            let entry = self.synthetic_index(&tip, height, spacing, index as u8);
            self.view.add_coin(
                *outpoint,
                Coin {
                    output: TxOut {
                        value: *value,
                        script_pubkey: script.clone(),
                    },
                    height,
                    time: 0,
                    is_coinbase: false,
                    is_coinstake: false,
                },
            );
            inner.indices.insert(entry.hash, Arc::clone(&entry));
            inner.tip = entry;
        }
        for _ in 0..pad_blocks {
            let tip = Arc::clone(&inner.tip);
            let entry = self.synthetic_index(&tip, tip.height + 1, spacing, 0xff);
            inner.indices.insert(entry.hash, Arc::clone(&entry));
            inner.tip = entry;
        }
    }

    fn synthetic_index(
        &self,
        prev: &Arc<BlockIndex>,
        height: i32,
        spacing: u32,
        salt: u8,
    ) -> Arc<BlockIndex> {
        let mut hash = [salt; 32];
        hash[..4].copy_from_slice(&(height as u32).to_le_bytes());
        let kernel = hash;
        Arc::new(BlockIndex {
            hash,
            prev: Some(Arc::clone(prev)),
            height,
            version: 2,
            time: prev.time + spacing,
            bits: prev.bits,
            stake_modifier: compute_stake_modifier(Some(prev.as_ref()), &kernel),
            flags: 0,
        })
    }

    /// Kernel hash binding a block into the stake modifier chain: the
    /// coinstake kernel for proof-of-stake blocks, the block hash otherwise.
    fn kernel_hash_for(&self, block: &Block, prev: &Arc<BlockIndex>) -> Hash256 {
        if !block.is_proof_of_stake() {
            return block.header.hash();
        }
        let coinstake = &block.transactions[1];
        let prevout = coinstake.vin[0].prevout;
        let block_from_time = self
            .view
            .coin(&prevout)
            .map(|coin| {
                if coin.time != 0 {
                    coin.time
                } else {
                    prev.ancestor(coin.height)
                        .map(|origin| origin.time)
                        .unwrap_or(0)
                }
            })
            .unwrap_or(0);
        stake_kernel_hash(
            &prev.stake_modifier,
            block_from_time,
            &prevout,
            coinstake.time,
        )
    }
}

impl ChainService for LocalChain {
    fn tip(&self) -> Arc<BlockIndex> {
        match self.inner.lock() {
            Ok(inner) => Arc::clone(&inner.tip),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().tip),
        }
    }

    fn lookup_block_index(&self, hash: &Hash256) -> Option<Arc<BlockIndex>> {
        let inner = self.inner.lock().ok()?;
        inner.indices.get(hash).cloned()
    }

    fn coins_tip(&self) -> Arc<dyn UtxoView> {
        Arc::clone(&self.view) as Arc<dyn UtxoView>
    }

    fn process_new_block(&self, block: &Block, _force: bool) -> Result<(), ChainError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(ChainError::Rejected("chain lock poisoned".to_string()));
        };
        if block.header.prev_block != inner.tip.hash {
            return Err(ChainError::StaleTip);
        }
        let prev = Arc::clone(&inner.tip);

        let Some(coinbase) = block.transactions.first() else {
            return Err(ChainError::Rejected("empty block".to_string()));
        };
        if !coinbase.is_coinbase() {
            return Err(ChainError::Rejected("first tx not coinbase".to_string()));
        }

        let proof_of_stake = block.is_proof_of_stake();
        if proof_of_stake {
            let coinstake = &block.transactions[1];
            if !check_coin_stake_timestamp(
                &self.params,
                block.header.time as i64,
                coinstake.time as i64,
            ) {
                return Err(ChainError::Rejected(
                    "coinstake timestamp violation".to_string(),
                ));
            }
            if let Err(err) = check_proof_of_stake(
                &prev,
                coinstake,
                block.header.bits,
                self.view.as_ref(),
                coinstake.time,
                &self.params,
            ) {
                return Err(ChainError::Rejected(err.reject_reason().to_string()));
            }
        }

        let kernel = self.kernel_hash_for(block, &prev);
        let height = prev.height + 1;

        // Apply the block to the UTXO set.
        for tx in &block.transactions {
            for input in &tx.vin {
                if !input.prevout.is_null() {
                    self.view.spend_coin(&input.prevout);
                }
            }
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            let is_coinstake = tx.is_coin_stake();
            for (index, output) in tx.vout.iter().enumerate() {
                if output.is_empty() {
                    continue;
                }
                self.view.add_coin(
                    OutPoint {
                        hash: txid,
                        index: index as u32,
                    },
                    Coin {
                        output: output.clone(),
                        height,
                        time: tx.time,
                        is_coinbase,
                        is_coinstake,
                    },
                );
            }
        }

        let entry = Arc::new(BlockIndex {
            hash: block.header.hash(),
            prev: Some(Arc::clone(&prev)),
            height,
            version: block.header.version,
            time: block.header.time,
            bits: block.header.bits,
            stake_modifier: compute_stake_modifier(Some(prev.as_ref()), &kernel),
            flags: if proof_of_stake {
                BLOCK_PROOF_OF_STAKE
            } else {
                0
            },
        });
        inner.indices.insert(entry.hash, Arc::clone(&entry));
        inner.tip = Arc::clone(&entry);
        drop(inner);

        blkd_log::log_info!(
            "connected block {} at height {height}",
            hash256_to_hex(&entry.hash)
        );

        if let Ok(hooks) = self.connect_hooks.lock() {
            for hook in hooks.iter() {
                hook(block, height);
            }
        }
        Ok(())
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::Relaxed)
    }

    fn verification_progress(&self) -> f64 {
        self.inner
            .lock()
            .map(|inner| inner.verification_progress)
            .unwrap_or(1.0)
    }

    fn test_block_validity(&self, block: &Block, prev: &BlockIndex) -> Result<(), String> {
        if block.header.prev_block != prev.hash {
            return Err("previous block mismatch".to_string());
        }
        let Some(coinbase) = block.transactions.first() else {
            return Err("empty block".to_string());
        };
        if !coinbase.is_coinbase() {
            return Err("first transaction is not a coinbase".to_string());
        }
        if block.weight() > MAX_BLOCK_WEIGHT {
            return Err("block weight above consensus maximum".to_string());
        }
        let sigops: i64 = block
            .transactions
            .iter()
            .map(|tx| tx.legacy_sig_op_count() as i64 * 4)
            .sum();
        if sigops > MAX_BLOCK_SIGOPS_COST {
            return Err("block sigop cost above consensus maximum".to_string());
        }
        Ok(())
    }
}

//! Staking wallet capability and an in-memory reference implementation.
//!
//! The core only sees the [`StakingWallet`] trait; key management stays on
//! the other side of it. The bundled [`Wallet`] keeps secp256k1 keys in
//! memory, tracks outputs paying its scripts, and runs the kernel search
//! over them when asked for a coinstake.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use blkd_chainstate::{BlockIndex, UtxoView};
use blkd_consensus::{proof_of_stake_subsidy, Amount, ConsensusParams};
use blkd_pos::{cache_kernel, check_kernel, StakeCache};
use blkd_primitives::block::Block;
use blkd_primitives::hash::hash160;
use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::script::{p2pk_pubkey, p2pkh_hash, p2pkh_script};
use blkd_primitives::transaction::{Transaction, TxIn, TxOut, SIGHASH_ALL};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

/// Inputs for one coinstake search attempt.
pub struct CoinStakeRequest<'a> {
    pub prev_index: &'a Arc<BlockIndex>,
    pub view: &'a dyn UtxoView,
    pub n_bits: u32,
    /// Masked transaction time to test.
    pub tx_time: u32,
    pub search_interval: i64,
    /// Fees collected by the assembler, credited to the stake outputs.
    pub fees: Amount,
}

/// Wallet capabilities consumed by block assembly and the staking loop.
pub trait StakingWallet: Send + Sync {
    fn is_locked(&self) -> bool;
    fn keypool_size(&self) -> usize;
    /// Reserve a destination script for block rewards. `None` when the
    /// keypool is exhausted.
    fn reserve_destination(&self) -> Option<Vec<u8>>;
    /// Outpoints eligible for staking under `view`, used to scale the
    /// staker's timeout.
    fn stakeable_outpoints(&self, view: &dyn UtxoView) -> Vec<OutPoint>;
    /// Drop coinstakes orphaned by a tip change.
    fn abandon_orphaned_coinstakes(&self);
    /// Search the eligible outputs for a kernel at the requested time and
    /// build a signed coinstake on success.
    fn create_coin_stake(
        &self,
        params: &ConsensusParams,
        request: &CoinStakeRequest<'_>,
    ) -> Option<Transaction>;
    /// Sign a proof-of-stake block with the key behind the coinstake.
    fn sign_block(&self, block: &mut Block) -> bool;
}

struct WalletKey {
    secret: SecretKey,
    pubkey: PublicKey,
    script_pubkey: Vec<u8>,
}

struct WalletInner {
    keys: Vec<WalletKey>,
    by_script: HashMap<Vec<u8>, usize>,
    owned: BTreeSet<OutPoint>,
    keypool: usize,
    locked: bool,
    stake_cache: StakeCache,
}

pub struct Wallet {
    secp: Secp256k1<All>,
    inner: Mutex<WalletInner>,
}

impl Wallet {
    /// Create a wallet with `keypool` fresh random keys.
    pub fn new_random(keypool: usize) -> Self {
        let secp = Secp256k1::new();
        let mut keys = Vec::with_capacity(keypool);
        let mut by_script = HashMap::new();
        let mut rng = rand::thread_rng();
        for index in 0..keypool {
            let secret = SecretKey::new(&mut rng);
            let pubkey = secret.public_key(&secp);
            let script_pubkey = p2pkh_script(&hash160(&pubkey.serialize()));
            by_script.insert(script_pubkey.clone(), index);
            keys.push(WalletKey {
                secret,
                pubkey,
                script_pubkey,
            });
        }
        Self {
            secp,
            inner: Mutex::new(WalletInner {
                keys,
                by_script,
                owned: BTreeSet::new(),
                keypool,
                locked: false,
                stake_cache: StakeCache::new(),
            }),
        }
    }

    pub fn lock(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.locked = true;
        }
    }

    pub fn unlock(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.locked = false;
        }
    }

    /// The first key's script, used to seed test chains.
    pub fn default_script(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().ok()?;
        inner.keys.first().map(|key| key.script_pubkey.clone())
    }

    pub fn add_owned_outpoint(&self, outpoint: OutPoint) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.owned.insert(outpoint);
        }
    }

    /// Track outputs of a connected block that pay one of our scripts and
    /// forget outpoints it spent.
    pub fn register_block(&self, block: &Block) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for tx in &block.transactions {
            for input in &tx.vin {
                if !input.prevout.is_null() {
                    inner.owned.remove(&input.prevout);
                    inner.stake_cache.remove(&input.prevout);
                }
            }
            let txid = tx.txid();
            for (index, output) in tx.vout.iter().enumerate() {
                if output.value > 0 && inner.by_script.contains_key(&output.script_pubkey) {
                    inner.owned.insert(OutPoint {
                        hash: txid,
                        index: index as u32,
                    });
                }
            }
        }
    }

    fn key_for_script<'a>(inner: &'a WalletInner, script_pubkey: &[u8]) -> Option<&'a WalletKey> {
        if let Some(&index) = inner.by_script.get(script_pubkey) {
            return inner.keys.get(index);
        }
        // Fall back to structural matching for p2pk outputs.
        if let Some(pubkey) = p2pk_pubkey(script_pubkey) {
            return inner
                .keys
                .iter()
                .find(|key| key.pubkey.serialize().as_slice() == pubkey);
        }
        if let Some(hash) = p2pkh_hash(script_pubkey) {
            return inner
                .keys
                .iter()
                .find(|key| hash160(&key.pubkey.serialize()) == hash);
        }
        None
    }

    fn sign_input(
        &self,
        tx: &mut Transaction,
        input_index: usize,
        key: &WalletKey,
        script_pubkey: &[u8],
    ) -> bool {
        let Some(sighash) = tx.signature_hash(input_index, script_pubkey, SIGHASH_ALL) else {
            return false;
        };
        let Ok(message) = Message::from_digest_slice(&sighash) else {
            return false;
        };
        let mut signature = self
            .secp
            .sign_ecdsa(&message, &key.secret)
            .serialize_der()
            .to_vec();
        signature.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::with_capacity(signature.len() + 35);
        script_sig.push(signature.len() as u8);
        script_sig.extend_from_slice(&signature);
        if p2pkh_hash(script_pubkey).is_some() {
            let pubkey = key.pubkey.serialize();
            script_sig.push(pubkey.len() as u8);
            script_sig.extend_from_slice(&pubkey);
        }
        tx.vin[input_index].script_sig = script_sig;
        true
    }
}

impl StakingWallet for Wallet {
    fn is_locked(&self) -> bool {
        self.inner.lock().map(|inner| inner.locked).unwrap_or(true)
    }

    fn keypool_size(&self) -> usize {
        self.inner.lock().map(|inner| inner.keypool).unwrap_or(0)
    }

    fn reserve_destination(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().ok()?;
        if inner.keypool == 0 {
            return None;
        }
        inner.keys.first().map(|key| key.script_pubkey.clone())
    }

    fn stakeable_outpoints(&self, view: &dyn UtxoView) -> Vec<OutPoint> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .owned
            .iter()
            .filter(|outpoint| {
                view.coin(outpoint)
                    .map(|coin| !coin.is_spent() && coin.output.value > 0)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    fn abandon_orphaned_coinstakes(&self) {
        // The in-memory wallet holds no transaction store; stale kernel
        // cache entries are dropped as blocks register instead.
    }

    fn create_coin_stake(
        &self,
        params: &ConsensusParams,
        request: &CoinStakeRequest<'_>,
    ) -> Option<Transaction> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        if inner.locked {
            return None;
        }

        let candidates: Vec<OutPoint> = inner.owned.iter().copied().collect();
        for outpoint in &candidates {
            cache_kernel(
                &mut inner.stake_cache,
                outpoint,
                request.prev_index,
                request.view,
                params,
            );
        }

        for outpoint in candidates {
            if !check_kernel(
                request.prev_index,
                request.n_bits,
                request.tx_time,
                &outpoint,
                request.view,
                Some(&inner.stake_cache),
                params,
            ) {
                continue;
            }

            let coin = request.view.coin(&outpoint)?;
            let key = Self::key_for_script(&inner, &coin.output.script_pubkey)?;
            let script_pubkey = coin.output.script_pubkey.clone();

            let mut stake_tx = Transaction::new(request.tx_time);
            stake_tx.vin.push(TxIn::from_outpoint(outpoint));
            // Output 0 stays empty: the coinstake marker.
            stake_tx.vout.push(TxOut {
                value: 0,
                script_pubkey: Vec::new(),
            });
            stake_tx.vout.push(TxOut {
                value: coin.output.value + proof_of_stake_subsidy(params) + request.fees,
                script_pubkey: script_pubkey.clone(),
            });

            let key = WalletKey {
                secret: key.secret,
                pubkey: key.pubkey,
                script_pubkey: key.script_pubkey.clone(),
            };
            if !self.sign_input(&mut stake_tx, 0, &key, &script_pubkey) {
                return None;
            }
            blkd_log::log_info!(
                "create_coin_stake: kernel found at time {}",
                request.tx_time
            );
            return Some(stake_tx);
        }
        None
    }

    fn sign_block(&self, block: &mut Block) -> bool {
        if !block.is_proof_of_stake() {
            return true;
        }
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        let stake_script = block.transactions[1].vout[1].script_pubkey.clone();
        let Some(key) = Self::key_for_script(&inner, &stake_script) else {
            return false;
        };
        let hash = block.header.hash();
        let Ok(message) = Message::from_digest_slice(&hash) else {
            return false;
        };
        block.signature = self
            .secp
            .sign_ecdsa(&message, &key.secret)
            .serialize_der()
            .to_vec();
        true
    }
}

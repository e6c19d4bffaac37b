//! UTXO view consumed by the stake kernel and block assembly.

use std::collections::HashMap;
use std::sync::Mutex;

use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::transaction::TxOut;

#[derive(Clone, Debug, PartialEq)]
pub struct Coin {
    pub output: TxOut,
    /// Height of the block that created the output.
    pub height: i32,
    /// Timestamp of the creating transaction; 0 when unknown, in which case
    /// the origin block's time substitutes.
    pub time: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Coin {
    pub fn is_spent(&self) -> bool {
        self.output.is_null()
    }

    pub fn spend(&mut self) {
        self.output = TxOut::null();
    }
}

/// Read access to the authoritative unspent output set.
pub trait UtxoView: Send + Sync {
    /// The coin at `outpoint`. Implementations may surface spent coins as
    /// entries whose output is the null sentinel.
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin>;
}

#[derive(Default)]
pub struct MemoryUtxoView {
    coins: Mutex<HashMap<OutPoint, Coin>>,
}

impl MemoryUtxoView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_coin(&self, outpoint: OutPoint, coin: Coin) {
        let Ok(mut coins) = self.coins.lock() else {
            return;
        };
        coins.insert(outpoint, coin);
    }

    pub fn spend_coin(&self, outpoint: &OutPoint) {
        let Ok(mut coins) = self.coins.lock() else {
            return;
        };
        if let Some(coin) = coins.get_mut(outpoint) {
            coin.spend();
        }
    }

    pub fn remove_coin(&self, outpoint: &OutPoint) {
        let Ok(mut coins) = self.coins.lock() else {
            return;
        };
        coins.remove(outpoint);
    }
}

impl UtxoView for MemoryUtxoView {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let Ok(coins) = self.coins.lock() else {
            return None;
        };
        coins.get(outpoint).cloned()
    }
}

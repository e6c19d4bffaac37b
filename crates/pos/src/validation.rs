//! Full coinstake validation and the staker's kernel cache.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use blkd_chainstate::{BlockIndex, Coin, UtxoView};
use blkd_consensus::{Amount, ConsensusParams};
use blkd_primitives::hash::hash160;
use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::script::{p2pk_pubkey, p2pkh_hash, parse_pushes};
use blkd_primitives::transaction::{Transaction, SIGHASH_ALL};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Memoised per-output lookup state for the staker's inner search loop.
/// Advisory only: a cache hit must survive the authoritative view before it
/// counts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StakeCacheEntry {
    pub block_from_time: u32,
    pub amount: Amount,
}

pub type StakeCache = HashMap<OutPoint, StakeCacheEntry>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofOfStakeError {
    NotCoinStake,
    PrevoutNotExist,
    PrevoutNotMature { required: i32, actual: i32 },
    PrevoutNotLoaded { height: i32 },
    VerifySignatureFailed,
    CheckKernelFailed,
}

impl ProofOfStakeError {
    /// Reject reason string used when the block fails validation.
    pub fn reject_reason(&self) -> &'static str {
        match self {
            ProofOfStakeError::NotCoinStake => "stake-not-coinstake",
            ProofOfStakeError::PrevoutNotExist => "stake-prevout-not-exist",
            ProofOfStakeError::PrevoutNotMature { .. } => "stake-prevout-not-mature",
            ProofOfStakeError::PrevoutNotLoaded { .. } => "stake-prevout-not-loaded",
            ProofOfStakeError::VerifySignatureFailed => "stake-verify-signature-failed",
            ProofOfStakeError::CheckKernelFailed => "stake-check-kernel-failed",
        }
    }

    /// A kernel miss may occur while behind on sync; callers treat it as a
    /// header-sync soft failure rather than a bad block.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProofOfStakeError::CheckKernelFailed)
    }
}

impl std::fmt::Display for ProofOfStakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProofOfStakeError::NotCoinStake => write!(f, "called on a non-coinstake transaction"),
            ProofOfStakeError::PrevoutNotExist => write!(f, "stake prevout does not exist"),
            ProofOfStakeError::PrevoutNotMature { required, actual } => write!(
                f,
                "stake prevout is not mature, expecting {required} and only matured to {actual}"
            ),
            ProofOfStakeError::PrevoutNotLoaded { height } => {
                write!(f, "block at height {height} for prevout can not be loaded")
            }
            ProofOfStakeError::VerifySignatureFailed => {
                write!(f, "signature verification failed on coinstake")
            }
            ProofOfStakeError::CheckKernelFailed => write!(f, "check kernel failed on coinstake"),
        }
    }
}

impl std::error::Error for ProofOfStakeError {}

/// Check the kernel hash target and the coinstake input signature against
/// the authoritative view. Used at validation and again before submitting a
/// locally staked block.
pub fn check_proof_of_stake(
    prev_index: &Arc<BlockIndex>,
    tx: &Transaction,
    n_bits: u32,
    view: &dyn UtxoView,
    n_time_tx: u32,
    params: &ConsensusParams,
) -> Result<(), ProofOfStakeError> {
    if !tx.is_coin_stake() {
        return Err(ProofOfStakeError::NotCoinStake);
    }

    // Kernel (input 0) must match the stake hash target per staked value.
    let txin = &tx.vin[0];

    let coin_prev = match view.coin(&txin.prevout) {
        Some(coin) if !coin.is_spent() => coin,
        _ => return Err(ProofOfStakeError::PrevoutNotExist),
    };

    let depth = prev_index.height + 1 - coin_prev.height;
    if depth < params.coinbase_maturity {
        return Err(ProofOfStakeError::PrevoutNotMature {
            required: params.coinbase_maturity,
            actual: depth,
        });
    }

    let Some(block_from) = prev_index.ancestor(coin_prev.height) else {
        return Err(ProofOfStakeError::PrevoutNotLoaded {
            height: coin_prev.height,
        });
    };

    if !verify_signature(&coin_prev, tx, 0) {
        return Err(ProofOfStakeError::VerifySignatureFailed);
    }

    let block_from_time = if coin_prev.time != 0 {
        coin_prev.time
    } else {
        block_from.time
    };
    if !crate::kernel::check_stake_kernel_hash(
        prev_index,
        n_bits,
        block_from_time,
        coin_prev.output.value,
        &txin.prevout,
        n_time_tx,
    ) {
        // May occur during initial download or when behind on sync.
        return Err(ProofOfStakeError::CheckKernelFailed);
    }

    Ok(())
}

/// Kernel test used by the staker's search loop. A positive cache hit is
/// re-verified through the authoritative view: stale entries after a deep
/// reorg may never turn a non-stake into a stake.
pub fn check_kernel(
    prev_index: &Arc<BlockIndex>,
    n_bits: u32,
    n_time: u32,
    prevout: &OutPoint,
    view: &dyn UtxoView,
    cache: Option<&StakeCache>,
    params: &ConsensusParams,
) -> bool {
    if let Some(entry) = cache.and_then(|cache| cache.get(prevout)) {
        if crate::kernel::check_stake_kernel_hash(
            prev_index,
            n_bits,
            entry.block_from_time,
            entry.amount,
            prevout,
            n_time,
        ) {
            return check_kernel(prev_index, n_bits, n_time, prevout, view, None, params);
        }
        return false;
    }

    let Some(coin_prev) = view.coin(prevout) else {
        return false;
    };

    let depth = prev_index.height + 1 - coin_prev.height;
    if depth < params.coinbase_maturity {
        blkd_log::log_debug!("check_kernel: coin is not mature");
        return false;
    }

    let Some(block_from) = prev_index.ancestor(coin_prev.height) else {
        blkd_log::log_debug!("check_kernel: could not find origin block");
        return false;
    };

    if coin_prev.is_spent() {
        blkd_log::log_debug!("check_kernel: coin is spent");
        return false;
    }

    let block_from_time = if coin_prev.time != 0 {
        coin_prev.time
    } else {
        block_from.time
    };
    crate::kernel::check_stake_kernel_hash(
        prev_index,
        n_bits,
        block_from_time,
        coin_prev.output.value,
        prevout,
        n_time,
    )
}

/// Populate the stake cache for `prevout` if the output is present, mature,
/// and resolvable to its origin block.
pub fn cache_kernel(
    cache: &mut StakeCache,
    prevout: &OutPoint,
    prev_index: &Arc<BlockIndex>,
    view: &dyn UtxoView,
    params: &ConsensusParams,
) {
    if cache.contains_key(prevout) {
        return;
    }

    let Some(coin_prev) = view.coin(prevout) else {
        return;
    };
    if coin_prev.is_spent() {
        return;
    }

    if prev_index.height + 1 - coin_prev.height < params.coinbase_maturity {
        return;
    }

    let Some(block_from) = prev_index.ancestor(coin_prev.height) else {
        return;
    };

    let block_from_time = if coin_prev.time != 0 {
        coin_prev.time
    } else {
        block_from.time
    };
    cache.insert(
        *prevout,
        StakeCacheEntry {
            block_from_time,
            amount: coin_prev.output.value,
        },
    );
}

/// Verify the scriptSig of `tx.vin[input_index]` against the spent coin for
/// the standard pay-to-pubkey and pay-to-pubkey-hash forms.
pub fn verify_signature(coin: &Coin, tx: &Transaction, input_index: usize) -> bool {
    let Some(input) = tx.vin.get(input_index) else {
        return false;
    };
    let script_pubkey = &coin.output.script_pubkey;
    let Some(pushes) = parse_pushes(&input.script_sig) else {
        return false;
    };

    let (sig_bytes, pubkey_bytes) = if let Some(pubkey) = p2pk_pubkey(script_pubkey) {
        match pushes.as_slice() {
            [sig] => (sig.clone(), pubkey.to_vec()),
            _ => return false,
        }
    } else if let Some(expected_hash) = p2pkh_hash(script_pubkey) {
        match pushes.as_slice() {
            [sig, pubkey] if hash160(pubkey) == expected_hash => (sig.clone(), pubkey.clone()),
            _ => return false,
        }
    } else {
        return false;
    };

    let Some((&hash_type, der)) = sig_bytes.split_last() else {
        return false;
    };
    if hash_type as u32 != SIGHASH_ALL {
        return false;
    }

    let Some(sighash) = tx.signature_hash(input_index, script_pubkey, hash_type as u32) else {
        return false;
    };

    let Ok(pubkey) = PublicKey::from_slice(&pubkey_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(der) else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(&sighash) else {
        return false;
    };
    secp256k1_verify()
        .verify_ecdsa(&message, &signature, &pubkey)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkd_chainstate::MemoryUtxoView;
    use blkd_consensus::constants::BLOCK_PROOF_OF_STAKE;
    use blkd_consensus::params::{consensus_params, Network};
    use blkd_primitives::script::p2pkh_script;
    use blkd_primitives::transaction::{TxIn, TxOut};
    use secp256k1::{Secp256k1, SecretKey};

    fn build_chain(length: i32) -> Arc<BlockIndex> {
        let mut tip = BlockIndex::genesis([0u8; 32], 1_000, 0x2007_ffff);
        for height in 1..=length {
            let mut hash = [0u8; 32];
            hash[..4].copy_from_slice(&(height as u32).to_le_bytes());
            tip = Arc::new(BlockIndex {
                hash,
                prev: Some(Arc::clone(&tip)),
                height,
                version: 2,
                time: 1_000 + height as u32 * 64,
                bits: 0x2007_ffff,
                stake_modifier: [height as u8; 32],
                flags: BLOCK_PROOF_OF_STAKE,
            });
        }
        tip
    }

    fn stakeable_coin(height: i32, value: Amount, script_pubkey: Vec<u8>) -> Coin {
        Coin {
            output: TxOut {
                value,
                script_pubkey,
            },
            height,
            time: 0,
            is_coinbase: false,
            is_coinstake: false,
        }
    }

    fn signed_coinstake(
        secret: &SecretKey,
        script_pubkey: &[u8],
        prevout: OutPoint,
        time: u32,
        value: Amount,
    ) -> Transaction {
        let secp = Secp256k1::new();
        let pubkey = secret.public_key(&secp);

        let mut tx = Transaction::new(time);
        tx.vin.push(TxIn::from_outpoint(prevout));
        tx.vout.push(TxOut {
            value: 0,
            script_pubkey: Vec::new(),
        });
        tx.vout.push(TxOut {
            value: value + 100,
            script_pubkey: script_pubkey.to_vec(),
        });

        let sighash = tx
            .signature_hash(0, script_pubkey, SIGHASH_ALL)
            .expect("sighash");
        let message = Message::from_digest_slice(&sighash).expect("message");
        let mut signature = secp
            .sign_ecdsa(&message, secret)
            .serialize_der()
            .to_vec();
        signature.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::new();
        script_sig.push(signature.len() as u8);
        script_sig.extend_from_slice(&signature);
        let pubkey_bytes = pubkey.serialize();
        script_sig.push(pubkey_bytes.len() as u8);
        script_sig.extend_from_slice(&pubkey_bytes);
        tx.vin[0].script_sig = script_sig;
        tx
    }

    #[test]
    fn rejects_non_coinstake() {
        let params = consensus_params(Network::Regtest);
        let tip = build_chain(20);
        let view = MemoryUtxoView::new();
        let mut tx = Transaction::new(2_000);
        tx.vin.push(TxIn::from_outpoint(OutPoint::null()));
        tx.vout.push(TxOut {
            value: 1,
            script_pubkey: vec![0x51],
        });
        assert_eq!(
            check_proof_of_stake(&tip, &tx, 0x2007_ffff, &view, 2_000, &params),
            Err(ProofOfStakeError::NotCoinStake)
        );
    }

    #[test]
    fn rejects_missing_prevout() {
        let params = consensus_params(Network::Regtest);
        let tip = build_chain(20);
        let view = MemoryUtxoView::new();
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let script = p2pkh_script(&hash160(&secret.public_key(&secp).serialize()));
        let prevout = OutPoint {
            hash: [9u8; 32],
            index: 0,
        };
        let tx = signed_coinstake(&secret, &script, prevout, 3_000, 1_000);
        assert_eq!(
            check_proof_of_stake(&tip, &tx, 0x2007_ffff, &view, 3_000, &params),
            Err(ProofOfStakeError::PrevoutNotExist)
        );
    }

    #[test]
    fn rejects_immature_prevout() {
        let params = consensus_params(Network::Regtest);
        let tip = build_chain(20);
        let view = MemoryUtxoView::new();
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let script = p2pkh_script(&hash160(&secret.public_key(&secp).serialize()));
        let prevout = OutPoint {
            hash: [9u8; 32],
            index: 0,
        };
        // Created at height 15: only 20 + 1 - 15 = 6 < 10 confirmations.
        view.add_coin(prevout, stakeable_coin(15, 1_000, script.clone()));
        let tx = signed_coinstake(&secret, &script, prevout, 3_000, 1_000);
        assert_eq!(
            check_proof_of_stake(&tip, &tx, 0x2007_ffff, &view, 3_000, &params),
            Err(ProofOfStakeError::PrevoutNotMature {
                required: 10,
                actual: 6
            })
        );
    }

    #[test]
    fn accepts_valid_coinstake_and_rejects_bad_signature() {
        let params = consensus_params(Network::Regtest);
        let tip = build_chain(20);
        let view = MemoryUtxoView::new();
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let script = p2pkh_script(&hash160(&secret.public_key(&secp).serialize()));
        let prevout = OutPoint {
            hash: [9u8; 32],
            index: 0,
        };
        view.add_coin(prevout, stakeable_coin(5, 1_000_000, script.clone()));

        // Scan masked timestamps until the kernel meets the permissive
        // regtest target, the way the staker's search loop does.
        let stake_time = (0..10_000u32)
            .map(|i| 3_008 + i * 16)
            .find(|&t| check_kernel(&tip, 0x2007_ffff, t, &prevout, &view, None, &params))
            .expect("kernel within search window");

        let tx = signed_coinstake(&secret, &script, prevout, stake_time, 1_000_000);
        assert_eq!(
            check_proof_of_stake(&tip, &tx, 0x2007_ffff, &view, stake_time, &params),
            Ok(())
        );

        // A signature from a different key fails.
        let other = SecretKey::new(&mut rand::thread_rng());
        let forged = signed_coinstake(&other, &script, prevout, stake_time, 1_000_000);
        assert_eq!(
            check_proof_of_stake(&tip, &forged, 0x2007_ffff, &view, stake_time, &params),
            Err(ProofOfStakeError::VerifySignatureFailed)
        );
    }

    #[test]
    fn cache_hit_must_survive_authoritative_recheck() {
        let params = consensus_params(Network::Regtest);
        let tip = build_chain(20);
        let view = MemoryUtxoView::new();
        let prevout = OutPoint {
            hash: [7u8; 32],
            index: 1,
        };

        // The cache claims a stakeable coin created at height 5, but the
        // view knows nothing of it (a deep reorg invalidated the entry).
        let mut cache = StakeCache::new();
        cache.insert(
            prevout,
            StakeCacheEntry {
                block_from_time: 1_000 + 5 * 64,
                amount: 1_000_000,
            },
        );

        // Pick a timestamp whose cached kernel pre-check passes, so the
        // authoritative re-check is what decides.
        let stake_time = (0..10_000u32)
            .map(|i| 3_008 + i * 16)
            .find(|&t| {
                crate::kernel::check_stake_kernel_hash(
                    &tip,
                    0x2007_ffff,
                    1_000 + 5 * 64,
                    1_000_000,
                    &prevout,
                    t,
                )
            })
            .expect("kernel within search window");

        assert!(!check_kernel(
            &tip,
            0x2007_ffff,
            stake_time,
            &prevout,
            &view,
            Some(&cache),
            &params
        ));

        // Once the view backs the entry, the cached hit stands.
        view.add_coin(prevout, stakeable_coin(5, 1_000_000, vec![0x51]));
        assert!(check_kernel(
            &tip,
            0x2007_ffff,
            stake_time,
            &prevout,
            &view,
            Some(&cache),
            &params
        ));
    }

    #[test]
    fn cache_kernel_skips_immature_and_spent() {
        let params = consensus_params(Network::Regtest);
        let tip = build_chain(20);
        let view = MemoryUtxoView::new();
        let mut cache = StakeCache::new();

        let immature = OutPoint {
            hash: [1u8; 32],
            index: 0,
        };
        view.add_coin(immature, stakeable_coin(18, 500, vec![0x51]));
        cache_kernel(&mut cache, &immature, &tip, &view, &params);
        assert!(cache.is_empty());

        let spent = OutPoint {
            hash: [2u8; 32],
            index: 0,
        };
        view.add_coin(spent, stakeable_coin(5, 500, vec![0x51]));
        view.spend_coin(&spent);
        cache_kernel(&mut cache, &spent, &tip, &view, &params);
        assert!(cache.is_empty());

        let good = OutPoint {
            hash: [3u8; 32],
            index: 0,
        };
        view.add_coin(good, stakeable_coin(5, 500, vec![0x51]));
        cache_kernel(&mut cache, &good, &tip, &view, &params);
        assert_eq!(
            cache.get(&good),
            Some(&StakeCacheEntry {
                // Coin time is unknown; height-5 block time substitutes.
                block_from_time: 1_000 + 5 * 64,
                amount: 500
            })
        );
    }
}

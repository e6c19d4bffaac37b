//! The background staking loop.
//!
//! One staking thread per process. Each iteration gates on wallet, network,
//! and sync state, drives the assembler with the staking wallet, signs and
//! submits any block found, and sleeps. Every sleep is interruptible so
//! disabling staking or shutting down takes effect within one gate cycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use blkd_chainstate::{ChainError, ChainService};
use blkd_consensus::ConsensusParams;
use blkd_pos::check_proof_of_stake;
use blkd_primitives::block::Block;
use blkd_primitives::hash::hash256_to_hex;
use rand::Rng;

use crate::mempool::Mempool;
use crate::miner::{
    increment_extra_nonce, AssemblerOptions, BlockAssembler, CreateBlockError, ExtraNonceState,
    StakeState,
};
use crate::wallet::StakingWallet;

const MIN_VERIFICATION_PROGRESS: f64 = 0.996;

const MSG_LOCKED: &str = "Info: Staking suspended due to locked wallet";
const MSG_SYNCING: &str = "Info: Staking suspended while synchronizing wallet";
const MSG_DISABLED: &str = "Info: Staking disabled by 'nostaking' option";
const MSG_BLOCK_FAILURE: &str = "Info: Staking suspended due to block creation failure";

/// Network reachability consumed by the staker: a peer count and an
/// interruptible sleep primitive.
pub trait NetworkHandle: Send + Sync {
    fn node_count(&self) -> usize;
    /// Sleep up to `duration`; returns false when interrupted for shutdown.
    fn sleep_for(&self, duration: Duration) -> bool;
}

/// Alert sink notified whenever the mint warning changes.
pub trait UiBus: Send + Sync {
    fn notify_alert_changed(&self);
}

pub struct NullUiBus;

impl UiBus for NullUiBus {
    fn notify_alert_changed(&self) {}
}

/// Condvar-backed interrupt flag; sleepers wake early once triggered.
#[derive(Default)]
pub struct Interrupt {
    interrupted: Mutex<bool>,
    condvar: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if let Ok(mut interrupted) = self.interrupted.lock() {
            *interrupted = true;
        }
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        if let Ok(mut interrupted) = self.interrupted.lock() {
            *interrupted = false;
        }
    }

    /// True when the full duration elapsed without an interrupt.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        let Ok(mut interrupted) = self.interrupted.lock() else {
            return false;
        };
        let mut remaining = duration;
        loop {
            if *interrupted {
                return false;
            }
            if remaining.is_zero() {
                return true;
            }
            let start = std::time::Instant::now();
            let Ok((guard, timeout)) = self.condvar.wait_timeout(interrupted, remaining) else {
                return false;
            };
            interrupted = guard;
            if timeout.timed_out() {
                return !*interrupted;
            }
            remaining = remaining.saturating_sub(start.elapsed());
        }
    }
}

/// Standalone network handle for tests and the single-node binary.
pub struct LocalNetwork {
    peers: AtomicUsize,
    interrupt: Interrupt,
}

impl LocalNetwork {
    pub fn new(peers: usize) -> Self {
        Self {
            peers: AtomicUsize::new(peers),
            interrupt: Interrupt::new(),
        }
    }

    pub fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::Relaxed);
    }

    pub fn interrupt(&self) {
        self.interrupt.trigger();
    }
}

impl NetworkHandle for LocalNetwork {
    fn node_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    fn sleep_for(&self, duration: Duration) -> bool {
        self.interrupt.sleep_for(duration)
    }
}

#[derive(Clone)]
pub struct StakerConfig {
    /// Master staking switch.
    pub staking: bool,
    /// Hard disable that wins over the master switch.
    pub no_staking: bool,
    /// Base of the per-iteration timeout, in milliseconds.
    pub staketimio: u64,
    pub assembler: AssemblerOptions,
}

impl Default for StakerConfig {
    fn default() -> Self {
        Self {
            staking: blkd_consensus::constants::DEFAULT_STAKE,
            no_staking: false,
            staketimio: blkd_consensus::constants::DEFAULT_STAKETIMIO,
            assembler: AssemblerOptions::default(),
        }
    }
}

/// Everything the staking thread needs, passed in by reference once.
#[derive(Clone)]
pub struct StakerDeps {
    pub chain: Arc<dyn ChainService>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub wallet: Arc<dyn StakingWallet>,
    pub network: Arc<dyn NetworkHandle>,
    pub ui: Arc<dyn UiBus>,
    pub params: ConsensusParams,
    pub config: StakerConfig,
}

/// Owns the staking thread and the state that used to be process globals:
/// the enable flag, the coinstake search bookkeeping, the extra-nonce
/// counter, and the mint warning.
pub struct StakingService {
    enable_staking: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    mint_warning: Arc<Mutex<String>>,
    handle: Option<JoinHandle<()>>,
}

impl StakingService {
    pub fn new() -> Self {
        Self {
            enable_staking: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            mint_warning: Arc::new(Mutex::new(String::new())),
            handle: None,
        }
    }

    pub fn staking_enabled(&self) -> bool {
        self.enable_staking.load(Ordering::Relaxed)
    }

    pub fn mint_warning(&self) -> String {
        self.mint_warning
            .lock()
            .map(|warning| warning.clone())
            .unwrap_or_default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Start minting proof-of-stake blocks in the background.
    pub fn mine_pos(&mut self, deps: StakerDeps) {
        if deps.wallet.keypool_size() == 0 {
            blkd_log::log_error!(
                "keypool is empty, make sure the wallet contains keys and refill before restarting the staking thread"
            );
            self.enable_staking.store(false, Ordering::Relaxed);
            return;
        }

        if !deps.config.staking || deps.config.no_staking {
            set_warning(&self.mint_warning, deps.ui.as_ref(), MSG_DISABLED);
            blkd_log::log_info!("proof-of-stake miner disabled");
            self.enable_staking.store(false, Ordering::Relaxed);
            return;
        }

        if self.staking_enabled() {
            return;
        }
        self.enable_staking.store(true, Ordering::Relaxed);

        let enable = Arc::clone(&self.enable_staking);
        let shutdown = Arc::clone(&self.shutdown);
        let warning = Arc::clone(&self.mint_warning);
        self.handle = Some(std::thread::spawn(move || {
            thread_stake_miner(deps, enable, shutdown, warning);
        }));
    }

    /// Disable staking and wait for the thread to wind down.
    pub fn interrupt_staking(&mut self) {
        blkd_log::log_info!("interrupting the stake miner thread");
        self.enable_staking.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        blkd_log::log_info!("stake miner thread interrupted");
    }

    /// Wait for a thread that has already stopped on its own.
    pub fn stop_staking(&mut self) {
        blkd_log::log_info!("stopping the stake miner thread");
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        blkd_log::log_info!("stake miner thread stopped");
    }
}

impl Default for StakingService {
    fn default() -> Self {
        Self::new()
    }
}

fn set_warning(warning: &Mutex<String>, ui: &dyn UiBus, message: &str) {
    let Ok(mut current) = warning.lock() else {
        return;
    };
    if *current != message {
        *current = message.to_string();
        ui.notify_alert_changed();
    }
}

/// Supervisor wrapper: restarts the miner from a clean state on unexpected
/// failure, exits once it returns cleanly.
fn thread_stake_miner(
    deps: StakerDeps,
    enable: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    warning: Arc<Mutex<String>>,
) {
    blkd_log::log_info!("stake miner thread started");
    loop {
        match pos_miner(&deps, &enable, &shutdown, &warning) {
            Ok(()) => break,
            Err(err) => {
                blkd_log::log_error!("pos_miner: runtime error: {err}, restarting");
            }
        }
    }
    blkd_log::log_info!("stake miner thread stopped");
}

fn pos_miner(
    deps: &StakerDeps,
    enable: &AtomicBool,
    shutdown: &AtomicBool,
    warning: &Mutex<String>,
) -> Result<(), String> {
    blkd_log::log_info!("pos_miner started for proof-of-stake");

    let mut extra_nonce = ExtraNonceState::default();
    let mut stake_state = StakeState::new();

    let Some(dest_script) = deps.wallet.reserve_destination() else {
        blkd_log::log_error!("keypool ran out, please refill before restarting the staking thread");
        set_warning(warning, deps.ui.as_ref(), MSG_BLOCK_FAILURE);
        enable.store(false, Ordering::Relaxed);
        return Ok(());
    };

    // Timeout scales with the square root of the stakeable UTXO count.
    let pos_timio = {
        let view = deps.chain.coins_tip();
        let utxo_count = deps.wallet.stakeable_outpoints(view.as_ref()).len();
        let timio = deps.config.staketimio + 30 * (utxo_count as f64).sqrt() as u64;
        blkd_log::log_info!("set proof-of-stake timeout: {timio}ms for {utxo_count} UTXOs");
        Duration::from_millis(timio)
    };

    let mut need_clear = false;
    while enable.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        while deps.wallet.is_locked() {
            if shutdown.load(Ordering::Relaxed) || !enable.load(Ordering::Relaxed) {
                return Ok(());
            }
            set_warning(warning, deps.ui.as_ref(), MSG_LOCKED);
            need_clear = true;
            if !deps.network.sleep_for(Duration::from_secs(5)) {
                return Ok(());
            }
        }

        // Wait for the network so we do not stake on an obsolete chain.
        while deps.network.node_count() == 0 || deps.chain.is_initial_block_download() {
            if shutdown.load(Ordering::Relaxed) || !enable.load(Ordering::Relaxed) {
                return Ok(());
            }
            set_warning(warning, deps.ui.as_ref(), MSG_SYNCING);
            need_clear = true;
            if !deps.network.sleep_for(Duration::from_secs(10)) {
                return Ok(());
            }
        }

        while deps.chain.verification_progress() < MIN_VERIFICATION_PROGRESS {
            if shutdown.load(Ordering::Relaxed) || !enable.load(Ordering::Relaxed) {
                return Ok(());
            }
            blkd_log::log_info!(
                "staker thread sleeps while sync at {}",
                deps.chain.verification_progress()
            );
            set_warning(warning, deps.ui.as_ref(), MSG_SYNCING);
            need_clear = true;
            if !deps.network.sleep_for(Duration::from_secs(10)) {
                return Ok(());
            }
        }

        if need_clear {
            set_warning(warning, deps.ui.as_ref(), "");
            need_clear = false;
        }

        let prev = deps.chain.tip();
        let mut assembler = BlockAssembler::new(&deps.params, deps.config.assembler.clone());
        let result = assembler.create_new_block(
            &dest_script,
            Some(deps.wallet.as_ref()),
            deps.chain.as_ref(),
            Some(&deps.mempool),
            Some(&mut stake_state),
            None,
        );

        let mut template = match result {
            Ok(template) => template,
            Err(CreateBlockError::StakeNotFound) => {
                // No kernel this second.
                if !deps.network.sleep_for(pos_timio) {
                    return Ok(());
                }
                continue;
            }
            Err(CreateBlockError::Validity(reason)) => {
                blkd_log::log_error!("pos_miner: {reason}");
                if !deps.network.sleep_for(pos_timio) {
                    return Ok(());
                }
                continue;
            }
            Err(CreateBlockError::Failed(reason)) => {
                blkd_log::log_error!("pos_miner: block creation failure: {reason}");
                set_warning(warning, deps.ui.as_ref(), MSG_BLOCK_FAILURE);
                let _ = deps.network.sleep_for(Duration::from_secs(10));
                return Ok(());
            }
        };

        increment_extra_nonce(&mut template.block, &prev, &mut extra_nonce);

        if template.block.is_proof_of_stake() {
            if !deps.wallet.sign_block(&mut template.block) {
                blkd_log::log_error!("pos_miner: failed to sign proof-of-stake block");
                continue;
            }
            blkd_log::log_info!(
                "pos_miner: proof-of-stake block found {}",
                hash256_to_hex(&template.block.header.hash())
            );
            if let Err(err) = process_block_found(&template.block, deps) {
                blkd_log::log_error!("process_block_found: {err}");
            }
            // Rest after a found block to reduce orphan risk.
            let jitter = rand::thread_rng().gen_range(0..4u64);
            if !deps.network.sleep_for(Duration::from_secs(16 + jitter)) {
                return Ok(());
            }
        }

        if !deps.network.sleep_for(pos_timio) {
            return Ok(());
        }
    }
    Ok(())
}

/// Re-check the proof of stake against the current coins tip, reject stale
/// parents, and hand the block to the chain service.
fn process_block_found(block: &Block, deps: &StakerDeps) -> Result<(), ChainError> {
    let Some(prev) = deps.chain.lookup_block_index(&block.header.prev_block) else {
        return Err(ChainError::StaleTip);
    };

    let coinstake = &block.transactions[1];
    let n_time_tx = if coinstake.time != 0 {
        coinstake.time
    } else {
        block.header.time
    };
    let view = deps.chain.coins_tip();
    check_proof_of_stake(
        &prev,
        coinstake,
        block.header.bits,
        view.as_ref(),
        n_time_tx,
        &deps.params,
    )
    .map_err(|err| ChainError::Rejected(format!("proof-of-stake checking failed: {err}")))?;

    if block.header.prev_block != deps.chain.tip().hash {
        return Err(ChainError::StaleTip);
    }

    // Process the block the same as if it had come from a peer.
    deps.chain.process_new_block(block, true)
}

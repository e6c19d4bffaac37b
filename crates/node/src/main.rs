//! Single-node staking daemon.
//!
//! Wires the in-memory chain harness, mempool, wallet, and staking loop
//! together. On regtest the wallet is seeded with a mature history so the
//! staker can start producing blocks immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use blkd_consensus::money::COIN;
use blkd_consensus::params::consensus_params;
use blkd_node::chain::LocalChain;
use blkd_node::config::{parse_args, NodeConfig};
use blkd_node::mempool::Mempool;
use blkd_node::miner::{adjusted_time_seconds, AssemblerOptions};
use blkd_node::staker::{LocalNetwork, NullUiBus, StakerConfig, StakerDeps, StakingService};
use blkd_node::wallet::Wallet;
use blkd_primitives::outpoint::OutPoint;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = parse_args()?;
    blkd_log::init(blkd_log::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: true,
    });

    let params = consensus_params(config.network);

    // Put the synthetic history far enough in the past that the staker has
    // fresh seconds to search right away.
    let genesis_time = (adjusted_time_seconds() - 24 * 3600) as u32;
    let chain = Arc::new(LocalChain::new(params.clone(), genesis_time));

    let wallet = Arc::new(Wallet::new_random(16));
    let script = wallet
        .default_script()
        .ok_or_else(|| "wallet generated no keys".to_string())?;

    // Seed a spendable, mature stake base. Values stay small so the
    // weighted kernel target never leaves the 256-bit domain on the
    // permissive regtest limit.
    let coins: Vec<(OutPoint, i64, Vec<u8>)> = (0..16u8)
        .map(|index| {
            let mut hash = [0u8; 32];
            hash[0] = 0xc0 + index;
            (
                OutPoint {
                    hash,
                    index: 0,
                },
                2 * COIN,
                script.clone(),
            )
        })
        .collect();
    chain.seed_history(&coins, params.target_spacing as u32, params.coinbase_maturity);
    for (outpoint, _, _) in &coins {
        wallet.add_owned_outpoint(*outpoint);
    }

    {
        let wallet = Arc::clone(&wallet);
        chain.add_connect_hook(Box::new(move |block, _height| {
            wallet.register_block(block);
        }));
    }

    let mempool = Arc::new(Mutex::new(Mempool::new()));
    let network = Arc::new(LocalNetwork::new(1));

    let mut service = StakingService::new();
    service.mine_pos(StakerDeps {
        chain: Arc::clone(&chain) as Arc<dyn blkd_chainstate::ChainService>,
        mempool: Arc::clone(&mempool),
        wallet: Arc::clone(&wallet) as Arc<dyn blkd_node::wallet::StakingWallet>,
        network: Arc::clone(&network) as Arc<dyn blkd_node::staker::NetworkHandle>,
        ui: Arc::new(NullUiBus),
        params: params.clone(),
        config: staker_config(&config),
    });

    if !service.staking_enabled() {
        blkd_log::log_info!("staker not running: {}", service.mint_warning());
        return Ok(());
    }

    let started = std::time::Instant::now();
    loop {
        std::thread::sleep(Duration::from_secs(5));
        let tip = blkd_chainstate::ChainService::tip(chain.as_ref());
        blkd_log::log_info!("tip height {} time {}", tip.height, tip.time);
        if config.duration_secs != 0 && started.elapsed().as_secs() >= config.duration_secs {
            break;
        }
        if !service.staking_enabled() {
            break;
        }
    }

    network.interrupt();
    service.interrupt_staking();
    Ok(())
}

fn staker_config(config: &NodeConfig) -> StakerConfig {
    StakerConfig {
        staking: config.staking,
        no_staking: config.no_staking,
        staketimio: config.staketimio,
        assembler: AssemblerOptions {
            block_max_weight: config.block_max_weight,
            block_min_fee_rate: config.block_min_fee_rate,
            block_version: config.block_version,
            print_priority: config.print_priority,
            test_block_validity: true,
        },
    }
}

//! Command-line configuration.

use blkd_consensus::constants::{
    DEFAULT_BLOCK_MAX_WEIGHT, DEFAULT_BLOCK_MIN_TX_FEE, DEFAULT_PRINTPRIORITY, DEFAULT_STAKE,
    DEFAULT_STAKETIMIO,
};
use blkd_consensus::money::parse_money;
use blkd_consensus::params::Network;
use blkd_consensus::FeeRate;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: Network,
    pub log_level: blkd_log::Level,
    pub log_format: blkd_log::Format,
    pub block_max_weight: u64,
    pub block_min_fee_rate: FeeRate,
    pub block_version: Option<i32>,
    pub print_priority: bool,
    pub staking: bool,
    pub no_staking: bool,
    pub staketimio: u64,
    /// Run the staker for this many seconds, 0 for unbounded.
    pub duration_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            log_level: blkd_log::Level::Info,
            log_format: blkd_log::Format::Text,
            block_max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            block_min_fee_rate: FeeRate::from_sat_per_kvb(DEFAULT_BLOCK_MIN_TX_FEE),
            block_version: None,
            print_priority: DEFAULT_PRINTPRIORITY,
            staking: DEFAULT_STAKE,
            no_staking: false,
            staketimio: DEFAULT_STAKETIMIO,
            duration_secs: 0,
        }
    }
}

pub fn parse_args() -> Result<NodeConfig, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<NodeConfig, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = NodeConfig::default();
    let mut args = raw_args.into_iter();

    fn value_for(name: &str, args: &mut impl Iterator<Item = String>) -> Result<String, String> {
        args.next().ok_or_else(|| format!("{name} expects a value"))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = value_for("--network", &mut args)?;
                config.network = match value.to_ascii_lowercase().as_str() {
                    "mainnet" | "main" => Network::Mainnet,
                    "testnet" | "test" => Network::Testnet,
                    "regtest" => Network::Regtest,
                    other => return Err(format!("unknown network '{other}'")),
                };
            }
            "--log-level" => {
                let value = value_for("--log-level", &mut args)?;
                config.log_level = blkd_log::Level::parse(&value)
                    .ok_or_else(|| format!("unknown log level '{value}'"))?;
            }
            "--log-format" => {
                let value = value_for("--log-format", &mut args)?;
                config.log_format = blkd_log::Format::parse(&value)
                    .ok_or_else(|| format!("unknown log format '{value}'"))?;
            }
            "--blockmaxweight" => {
                let value = value_for("--blockmaxweight", &mut args)?;
                config.block_max_weight = value
                    .parse()
                    .map_err(|_| format!("invalid block weight '{value}'"))?;
            }
            "--blockmintxfee" => {
                let value = value_for("--blockmintxfee", &mut args)?;
                let amount = parse_money(&value)
                    .ok_or_else(|| format!("invalid fee amount '{value}'"))?;
                config.block_min_fee_rate = FeeRate::from_sat_per_kvb(amount);
            }
            "--blockversion" => {
                let value = value_for("--blockversion", &mut args)?;
                config.block_version = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid block version '{value}'"))?,
                );
            }
            "--printpriority" => config.print_priority = true,
            "--staking" => {
                let value = value_for("--staking", &mut args)?;
                config.staking = match value.as_str() {
                    "1" | "true" => true,
                    "0" | "false" => false,
                    other => return Err(format!("invalid --staking value '{other}'")),
                };
            }
            "--nostaking" => config.no_staking = true,
            "--staketimio" => {
                let value = value_for("--staketimio", &mut args)?;
                config.staketimio = value
                    .parse()
                    .map_err(|_| format!("invalid staketimio '{value}'"))?;
            }
            "--duration" => {
                let value = value_for("--duration", &mut args)?;
                config.duration_secs = value
                    .parse()
                    .map_err(|_| format!("invalid duration '{value}'"))?;
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }

    if config.block_version.is_some() && config.network != Network::Regtest {
        return Err("--blockversion is only available on regtest".to_string());
    }

    Ok(config)
}

//! Consensus-wide constants shared across block assembly and validation.

/// The maximum allowed weight for a block (network rule).
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;
/// Default upper bound for assembled block weight, leaving headroom below the
/// consensus maximum.
pub const DEFAULT_BLOCK_MAX_WEIGHT: u64 = MAX_BLOCK_WEIGHT - 4_000;
/// The maximum allowed number of signature check operations in a block
/// (network rule), in weighted cost units.
pub const MAX_BLOCK_SIGOPS_COST: i64 = 80_000;
/// Factor by which witness data is discounted relative to base data.
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Weight reserved up front for the coinbase transaction.
pub const COINBASE_WEIGHT_RESERVE: u64 = 4_000;
/// Sigop cost reserved up front for the coinbase transaction.
pub const COINBASE_SIGOPS_RESERVE: i64 = 400;

/// Lock times below this threshold are interpreted as block heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Sequence value that disables time-lock semantics for an input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Maximum serialized size of the coinbase scriptSig (consensus).
pub const MAX_COINBASE_SCRIPT_SIG_SIZE: usize = 100;

/// Tag bytes identifying the witness commitment output in the coinbase.
pub const WITNESS_COMMITMENT_HEADER: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];

/// Flag on a block index entry marking a proof-of-stake block.
pub const BLOCK_PROOF_OF_STAKE: u32 = 1 << 0;

/// Default minimum fee rate (satoshis per 1000 vbytes) for block inclusion.
pub const DEFAULT_BLOCK_MIN_TX_FEE: i64 = 1_000;
/// Default base of the staker's per-iteration timeout, in milliseconds.
pub const DEFAULT_STAKETIMIO: u64 = 500;
/// Whether staking is enabled by default.
pub const DEFAULT_STAKE: bool = true;
/// Whether per-transaction fee rates are logged during assembly by default.
pub const DEFAULT_PRINTPRIORITY: bool = false;

/// Give up on package selection after this many consecutive failures once the
/// block is close to full.
pub const MAX_CONSECUTIVE_FAILURES: i64 = 1_000;

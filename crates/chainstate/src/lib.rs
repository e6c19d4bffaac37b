//! Chain metadata consumed by block production: the in-memory block index,
//! the UTXO view, and the chain service contract.

pub mod blockindex;
pub mod chain;
pub mod utxo;

pub use blockindex::BlockIndex;
pub use chain::{next_target_required, ChainError, ChainService};
pub use utxo::{Coin, MemoryUtxoView, UtxoView};

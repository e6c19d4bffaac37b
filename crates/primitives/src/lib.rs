//! Wire-format primitives: consensus serialization, transactions, blocks,
//! and the minimal script toolkit used by block production.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};

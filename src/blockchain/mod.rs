// Blockchain module
//
// This module contains the ledger engine:
// - Hashing of block content
// - Account ledger
// - Transaction pool
// - Proof of work
// - Chain of sealed blocks
// - The ledger context that coordinates mining rounds
// - Persistent storage

pub mod account;
pub mod block;
pub mod chain;
pub mod hash;
pub mod ledger;
pub mod pool;
pub mod pow;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use account::{Account, Address};
pub use block::Block;
pub use ledger::{Balance, Blockchain, BlockchainError, MineOutcome, MinedBlock};
pub use pool::{History, TransactionFilter};
pub use storage::{LedgerStore, SledStore};
pub use transaction::Transaction;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::account::Address;
use super::hash::{self, HashError};
use super::transaction::Transaction;

/// Represents a sealed block in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was sealed
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Confirmed transactions included in this block, reward last
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Proof of work
    pub nonce: u64,

    /// Hash of this block's sealed content
    pub hash: String,

    /// Account credited with the mining reward
    pub miner: Address,
}

impl Block {
    /// The fixed first block of every chain.
    ///
    /// Its hash is the zero sentinel rather than a computed seal.
    pub fn genesis() -> Self {
        Block {
            index: 0,
            timestamp: DateTime::<Utc>::default(),
            transactions: Vec::new(),
            previous_hash: hash::zero_hash(),
            nonce: 0,
            hash: hash::zero_hash(),
            miner: Address::reward_sentinel(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self == &Block::genesis()
    }

    /// Recomputes the hash from the block's own fields
    pub fn calculate_hash(&self) -> Result<String, HashError> {
        let transactions = hash::canonical_transactions(&self.transactions)?;
        Ok(hash::block_hash(self.index, &self.previous_hash, self.nonce, &transactions))
    }

    /// Whether the stored hash matches the content and meets `difficulty`
    pub fn has_valid_seal(&self, difficulty: usize) -> Result<bool, HashError> {
        Ok(self.hash == self.calculate_hash()? && hash::meets_difficulty(&self.hash, difficulty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::pow::{CancelToken, ProofOfWork};

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.nonce, 0);
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.previous_hash, hash::zero_hash());
        assert_eq!(genesis.hash, hash::zero_hash());
        assert!(genesis.is_genesis());
        assert_eq!(genesis, Block::genesis());
    }

    #[test]
    fn test_calculate_hash_for_sealed_block() {
        let transactions = vec![Transaction::new_reward(Address::from("miner"), 10.0, Utc::now())];
        let pow = ProofOfWork::new(2);
        let seal = pow
            .seal(1, &hash::zero_hash(), &transactions, &CancelToken::new())
            .unwrap();

        let block = Block {
            index: 1,
            timestamp: Utc::now(),
            transactions,
            previous_hash: hash::zero_hash(),
            nonce: seal.nonce,
            hash: seal.hash.clone(),
            miner: Address::from("miner"),
        };

        assert_eq!(block.calculate_hash().unwrap(), seal.hash);
        assert!(block.has_valid_seal(2).unwrap());
        assert!(!block.is_genesis());

        // the timestamp is not part of the sealed content
        let later = Block { timestamp: Utc::now(), ..block.clone() };
        assert!(later.has_valid_seal(2).unwrap());

        let tampered = Block { nonce: block.nonce + 1, ..block };
        assert!(!tampered.has_valid_seal(2).unwrap());
    }
}

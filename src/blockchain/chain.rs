use log::error;
use thiserror::Error;

use std::iter;

use super::block::Block;

/// Chain integrity violations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Block {index} links to {found}, expected {expected}")]
    LinkageMismatch {
        index: u64,
        expected: String,
        found: String,
    },

    #[error("Block {index} has an invalid seal")]
    InvalidSeal { index: u64 },

    #[error("Non-sequential block index: expected {expected}, got {found}")]
    NonSequentialIndex { expected: u64, found: u64 },

    #[error("Chain does not start with the genesis block")]
    InvalidGenesis,
}

/// Append-only sequence of sealed blocks, rooted at the fixed genesis block
#[derive(Debug, Clone)]
pub struct Chain {
    genesis: Block,

    /// Every block after genesis, index ascending
    sealed: Vec<Block>,

    /// Number of leading zero hex characters every sealed block must carry
    difficulty: usize,
}

impl Chain {
    /// Creates a chain holding only the genesis block
    pub fn new(difficulty: usize) -> Self {
        Chain {
            genesis: Block::genesis(),
            sealed: Vec::new(),
            difficulty,
        }
    }

    /// Rebuilds a chain from stored blocks, re-checking every invariant.
    /// An empty list yields a fresh chain.
    pub fn from_blocks(blocks: Vec<Block>, difficulty: usize) -> Result<Self, ChainError> {
        let mut blocks = blocks.into_iter();
        let mut chain = Chain::new(difficulty);

        if let Some(first) = blocks.next() {
            if !first.is_genesis() {
                return Err(ChainError::InvalidGenesis);
            }
        }

        for block in blocks {
            chain.append(block)?;
        }

        Ok(chain)
    }

    /// The last appended block
    pub fn head(&self) -> &Block {
        self.sealed.last().unwrap_or(&self.genesis)
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        self.sealed.len() + 1
    }

    /// Blocks in index order, genesis first
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        iter::once(&self.genesis).chain(self.sealed.iter())
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.iter().cloned().collect()
    }

    pub fn get_block(&self, index: u64) -> Option<&Block> {
        match index {
            0 => Some(&self.genesis),
            _ => usize::try_from(index - 1).ok().and_then(|i| self.sealed.get(i)),
        }
    }

    /// Looks a block up by hash, ignoring hex case
    pub fn find_by_hash(&self, hash: &str) -> Option<&Block> {
        self.iter().find(|block| block.hash.eq_ignore_ascii_case(hash))
    }

    /// Checks that `block` could be appended to the current head
    pub fn check_next(&self, block: &Block) -> Result<(), ChainError> {
        check_link(self.head(), block, self.difficulty)
    }

    /// Appends a block after checking linkage, seal and index
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        self.check_next(&block)?;
        self.sealed.push(block);
        Ok(())
    }

    /// Walks the whole chain and reports the first violation
    pub fn validate(&self) -> Result<(), ChainError> {
        if !self.genesis.is_genesis() {
            return Err(ChainError::InvalidGenesis);
        }

        let mut previous = &self.genesis;
        for block in &self.sealed {
            if let Err(err) = check_link(previous, block, self.difficulty) {
                error!("Chain validation failed: {}", err);
                return Err(err);
            }
            previous = block;
        }

        Ok(())
    }

    /// Replaces a stored block in place, bypassing every check
    #[cfg(test)]
    pub(crate) fn overwrite(&mut self, block: Block) {
        if let Some(slot) = usize::try_from(block.index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| self.sealed.get_mut(i))
        {
            *slot = block;
        }
    }
}

fn check_link(previous: &Block, block: &Block, difficulty: usize) -> Result<(), ChainError> {
    if block.previous_hash != previous.hash {
        return Err(ChainError::LinkageMismatch {
            index: block.index,
            expected: previous.hash.clone(),
            found: block.previous_hash.clone(),
        });
    }

    let sealed = block.has_valid_seal(difficulty).unwrap_or(false);
    if !sealed {
        return Err(ChainError::InvalidSeal { index: block.index });
    }

    if block.index != previous.index + 1 {
        return Err(ChainError::NonSequentialIndex {
            expected: previous.index + 1,
            found: block.index,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::Address;
    use crate::blockchain::hash::{block_hash, canonical_transactions, meets_difficulty};
    use crate::blockchain::pow::{CancelToken, ProofOfWork};
    use crate::blockchain::transaction::Transaction;
    use chrono::Utc;

    const DIFFICULTY: usize = 2;

    fn seal_block(index: u64, previous_hash: &str, transactions: Vec<Transaction>) -> Block {
        let seal = ProofOfWork::new(DIFFICULTY)
            .seal(index, previous_hash, &transactions, &CancelToken::new())
            .unwrap();

        Block {
            index,
            timestamp: Utc::now(),
            transactions,
            previous_hash: previous_hash.to_string(),
            nonce: seal.nonce,
            hash: seal.hash,
            miner: Address::from("miner"),
        }
    }

    fn reward() -> Vec<Transaction> {
        vec![Transaction::new_reward(Address::from("miner"), 10.0, Utc::now())]
    }

    fn next_block(chain: &Chain) -> Block {
        let head = chain.head();
        seal_block(head.index + 1, &head.hash, reward())
    }

    #[test]
    fn test_new_chain() {
        let chain = Chain::new(DIFFICULTY);

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.head(), &Block::genesis());
        assert_eq!(chain.get_block(0), Some(&Block::genesis()));
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_append_and_lookup() {
        let mut chain = Chain::new(DIFFICULTY);

        let first = next_block(&chain);
        chain.append(first.clone()).unwrap();
        let second = next_block(&chain);
        chain.append(second.clone()).unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.head(), &second);
        assert_eq!(chain.get_block(1), Some(&first));
        assert_eq!(chain.get_block(3), None);
        assert_eq!(chain.find_by_hash(&second.hash.to_uppercase()), Some(&second));
        assert_eq!(chain.find_by_hash("ffff"), None);

        let indices: Vec<u64> = chain.iter().map(|block| block.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_append_rejects_stale_block() {
        let mut chain = Chain::new(DIFFICULTY);
        let stale = next_block(&chain);
        chain.append(next_block(&chain)).unwrap();

        let result = chain.append(stale);
        assert!(matches!(result, Err(ChainError::LinkageMismatch { index: 1, .. })));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_append_rejects_bad_seal() {
        let mut chain = Chain::new(DIFFICULTY);
        let mut block = next_block(&chain);
        block.nonce += 1;

        assert_eq!(chain.append(block), Err(ChainError::InvalidSeal { index: 1 }));

        // a correctly hashed block that misses the difficulty target
        let head = chain.head().clone();
        let transactions = reward();
        let canonical = canonical_transactions(&transactions).unwrap();
        let (nonce, hash) = (0u64..)
            .map(|nonce| (nonce, block_hash(1, &head.hash, nonce, &canonical)))
            .find(|(_, hash)| !meets_difficulty(hash, DIFFICULTY))
            .unwrap();
        let weak = Block {
            index: 1,
            timestamp: Utc::now(),
            transactions,
            previous_hash: head.hash,
            nonce,
            hash,
            miner: Address::from("miner"),
        };
        assert_eq!(weak.calculate_hash().unwrap(), weak.hash);
        assert_eq!(chain.append(weak), Err(ChainError::InvalidSeal { index: 1 }));
    }

    #[test]
    fn test_append_rejects_skipped_index() {
        let mut chain = Chain::new(DIFFICULTY);
        let skipped = seal_block(2, &chain.head().hash, reward());

        assert_eq!(
            chain.append(skipped),
            Err(ChainError::NonSequentialIndex { expected: 1, found: 2 })
        );
    }

    #[test]
    fn test_validate_detects_tampering() {
        let mut chain = Chain::new(DIFFICULTY);
        chain.append(next_block(&chain)).unwrap();
        chain.append(next_block(&chain)).unwrap();

        let mut tampered = chain.get_block(1).cloned().unwrap();
        tampered.transactions[0].amount = 1_000.0;
        tampered.hash = tampered.calculate_hash().unwrap();
        chain.overwrite(tampered);

        // either the recomputed hash misses the target, or block 2 no longer links to it
        let result = chain.validate();
        assert!(matches!(
            result,
            Err(ChainError::InvalidSeal { index: 1 }) | Err(ChainError::LinkageMismatch { index: 2, .. })
        ));
    }

    #[test]
    fn test_validate_detects_altered_transactions() {
        let mut chain = Chain::new(DIFFICULTY);
        chain.append(next_block(&chain)).unwrap();

        let mut tampered = chain.get_block(1).cloned().unwrap();
        tampered.transactions[0].amount = 1_000.0;
        chain.overwrite(tampered);

        assert_eq!(chain.validate(), Err(ChainError::InvalidSeal { index: 1 }));
    }

    #[test]
    fn test_from_blocks() {
        let mut chain = Chain::new(DIFFICULTY);
        chain.append(next_block(&chain)).unwrap();

        let restored = Chain::from_blocks(chain.blocks(), DIFFICULTY).unwrap();
        assert_eq!(restored.blocks(), chain.blocks());

        let empty = Chain::from_blocks(Vec::new(), DIFFICULTY).unwrap();
        assert_eq!(empty.len(), 1);

        let headless = Chain::from_blocks(chain.blocks()[1..].to_vec(), DIFFICULTY);
        assert_eq!(headless.err(), Some(ChainError::InvalidGenesis));
    }
}

use log::debug;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::hash::{self, HashError};
use super::transaction::Transaction;

/// How many nonces are tried between checks of the cancellation flag
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Errors that can occur while searching for a seal
#[derive(Debug, Error)]
pub enum PowError {
    #[error("Proof of work search cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error("Nonce space exhausted")]
    Exhausted,

    #[error("Hash error: {0}")]
    HashError(#[from] HashError),
}

/// Shared flag used to stop an in-flight nonce search
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    /// Asks any search holding this token to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A nonce and hash satisfying the difficulty target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal {
    pub nonce: u64,
    pub hash: String,
    pub elapsed: Duration,
}

/// Proof-of-work engine with a fixed difficulty
#[derive(Debug, Clone, Copy)]
pub struct ProofOfWork {
    /// Number of leading zero hex characters required in a hash
    difficulty: usize,
}

impl ProofOfWork {
    pub fn new(difficulty: usize) -> Self {
        ProofOfWork { difficulty }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Searches nonces from zero upwards for the first hash meeting the
    /// difficulty. The result only depends on the inputs, never on timing.
    pub fn seal(
        &self,
        index: u64,
        previous_hash: &str,
        transactions: &[Transaction],
        cancel: &CancelToken,
    ) -> Result<Seal, PowError> {
        let started = Instant::now();
        let canonical = hash::canonical_transactions(transactions)?;
        let mut nonce: u64 = 0;

        loop {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(PowError::Cancelled { attempts: nonce });
            }

            let candidate = hash::block_hash(index, previous_hash, nonce, &canonical);
            if hash::meets_difficulty(&candidate, self.difficulty) {
                let elapsed = started.elapsed();
                debug!(
                    "Sealed block {} with nonce {} after {:?}",
                    index, nonce, elapsed
                );
                return Ok(Seal {
                    nonce,
                    hash: candidate,
                    elapsed,
                });
            }

            nonce = nonce.checked_add(1).ok_or(PowError::Exhausted)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::Address;
    use chrono::Utc;

    fn sample_transactions() -> Vec<Transaction> {
        vec![
            Transaction::new(Address::from("alice"), Address::from("bob"), 30.0, Utc::now()).confirmed(),
            Transaction::new_reward(Address::from("miner"), 10.0, Utc::now()),
        ]
    }

    #[test]
    fn test_seal_meets_difficulty() {
        let pow = ProofOfWork::new(3);
        let transactions = sample_transactions();
        let seal = pow.seal(1, &hash::zero_hash(), &transactions, &CancelToken::new()).unwrap();

        assert!(seal.hash.starts_with("000"));
        let canonical = hash::canonical_transactions(&transactions).unwrap();
        assert_eq!(seal.hash, hash::block_hash(1, &hash::zero_hash(), seal.nonce, &canonical));
    }

    #[test]
    fn test_seal_returns_first_satisfying_nonce() {
        let pow = ProofOfWork::new(2);
        let transactions = sample_transactions();
        let seal = pow.seal(5, "prev", &transactions, &CancelToken::new()).unwrap();

        let canonical = hash::canonical_transactions(&transactions).unwrap();
        for nonce in 0..seal.nonce {
            let candidate = hash::block_hash(5, "prev", nonce, &canonical);
            assert!(!hash::meets_difficulty(&candidate, 2));
        }
    }

    #[test]
    fn test_seal_is_deterministic() {
        let pow = ProofOfWork::new(3);
        let transactions = sample_transactions();

        let first = pow.seal(1, "abc", &transactions, &CancelToken::new()).unwrap();
        let second = pow.seal(1, "abc", &transactions, &CancelToken::new()).unwrap();

        assert_eq!(first.nonce, second.nonce);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn test_zero_difficulty_accepts_first_nonce() {
        let pow = ProofOfWork::new(0);
        let seal = pow.seal(1, "abc", &[], &CancelToken::new()).unwrap();
        assert_eq!(seal.nonce, 0);
    }

    #[test]
    fn test_cancelled_search_stops() {
        // 64 leading zeros is never found in practice
        let pow = ProofOfWork::new(64);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = pow.seal(1, "abc", &sample_transactions(), &cancel);
        assert!(matches!(result, Err(PowError::Cancelled { attempts: 0 })));

        cancel.reset();
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let pow = ProofOfWork::new(64);
        let cancel = CancelToken::new();
        let remote = cancel.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let result = pow.seal(1, "abc", &[], &cancel);
        handle.join().unwrap();
        assert!(matches!(result, Err(PowError::Cancelled { .. })));
    }
}

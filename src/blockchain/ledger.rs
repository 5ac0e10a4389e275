use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::account::{Account, AccountError, AccountLedger, Address};
use super::block::Block;
use super::chain::{Chain, ChainError};
use super::pool::{History, TransactionFilter, TransactionPool};
use super::pow::{CancelToken, PowError, ProofOfWork};
use super::storage::{LedgerStore, StorageError};
use super::transaction::{Transaction, TransactionError};
use crate::config::LedgerConfig;

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction rejected: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    /// The chain moved while this round was sealing; re-running `mine` is safe
    #[error("Mining conflict: {0}")]
    MiningConflict(ChainError),

    /// Stored blocks violate a chain invariant
    #[error("Corrupt chain: {0}")]
    CorruptChain(ChainError),

    #[error("Mining cancelled")]
    Cancelled,

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<PowError> for BlockchainError {
    fn from(err: PowError) -> Self {
        match err {
            PowError::Cancelled { .. } => BlockchainError::Cancelled,
            other => BlockchainError::SystemError(other.to_string()),
        }
    }
}

/// A block produced by a successful mining round
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MinedBlock {
    pub block: Block,
    pub nonce: u64,
    pub hash: String,

    /// Wall time spent in the nonce search
    #[schema(value_type = u64)]
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

/// Result of a mining round
#[derive(Debug, Clone)]
pub enum MineOutcome {
    Mined(MinedBlock),

    /// No pending transaction could be settled; nothing changed
    NoEligibleTransactions,
}

/// Confirmed and available balance of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Balance {
    pub address: Address,
    pub confirmed: f64,
    pub available: f64,
}

/// A mining round between selection and commit
#[derive(Debug)]
struct Candidate {
    miner: Address,
    eligible: Vec<Transaction>,
    embedded: Vec<Transaction>,
    index: u64,
    previous_hash: String,
}

/// The ledger context: accounts, pool and chain behind one handle.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Debug, Clone)]
pub struct Blockchain {
    accounts: Arc<AccountLedger>,
    pool: Arc<TransactionPool>,
    chain: Arc<RwLock<Chain>>,

    /// Held shared by submissions and reads, exclusively while a mining round
    /// commits, so no reader observes a half-applied block
    state_gate: Arc<RwLock<()>>,

    /// Held for a whole mining round; rounds never interleave
    round_lock: Arc<Mutex<()>>,

    cancel: CancelToken,
    pow: ProofOfWork,
    mining_reward: f64,
    opening_balance: f64,
    storage: Option<Arc<dyn LedgerStore>>,
}

impl Blockchain {
    /// Creates an in-memory ledger holding only the genesis block
    pub fn new(config: &LedgerConfig) -> Self {
        Blockchain {
            accounts: Arc::new(AccountLedger::new()),
            pool: Arc::new(TransactionPool::new()),
            chain: Arc::new(RwLock::new(Chain::new(config.difficulty))),
            state_gate: Arc::new(RwLock::new(())),
            round_lock: Arc::new(Mutex::new(())),
            cancel: CancelToken::new(),
            pow: ProofOfWork::new(config.difficulty),
            mining_reward: config.mining_reward,
            opening_balance: config.opening_balance,
            storage: None,
        }
    }

    /// Creates a ledger backed by `storage`, loading whatever it holds.
    /// An empty store gets the genesis block written.
    pub fn with_storage(config: &LedgerConfig, storage: Arc<dyn LedgerStore>) -> Result<Self, BlockchainError> {
        let mut blockchain = Blockchain::new(config);

        let blocks = storage.load_chain()?;
        if blocks.is_empty() {
            info!("No existing chain found in storage, writing genesis block");
            storage.append_block(&Block::genesis())?;
            storage.flush()?;
        } else {
            let chain = Chain::from_blocks(blocks, config.difficulty).map_err(BlockchainError::CorruptChain)?;
            info!("Loaded {} blocks from storage", chain.len());
            *blockchain.chain_mut() = chain;
        }

        let accounts = storage.load_balances()?;
        info!("Loaded {} accounts from storage", accounts.len());
        blockchain.accounts.restore(accounts);

        let transactions = storage.load_transactions()?;
        blockchain.pool.restore(transactions);
        info!("Loaded {} pending transactions from storage", blockchain.pool.list_pending().len());

        blockchain.storage = Some(storage);
        Ok(blockchain)
    }

    /// Registers an account funded with the configured opening balance.
    /// The account is stored before it becomes visible.
    pub fn open_account(&self, address: Address) -> Result<Account, BlockchainError> {
        let _gate = self.read_gate();
        let account = self.accounts.open_account(address, self.opening_balance, |account| {
            if let Some(storage) = &self.storage {
                storage.update_balance(&account.address, account.balance)?;
                storage.flush()?;
            }
            Ok::<(), BlockchainError>(())
        })?;

        info!("Opened account {} with balance {}", account.address, account.balance);
        Ok(account)
    }

    /// Validates a transfer and queues it as pending.
    /// The transfer is stored before it is queued.
    pub fn submit_transfer(&self, sender: Address, recipient: Address, amount: f64) -> Result<Transaction, BlockchainError> {
        let _gate = self.read_gate();
        let transaction = self
            .pool
            .submit(&self.accounts, sender, recipient, amount, Utc::now(), |transaction| {
                if let Some(storage) = &self.storage {
                    storage.upsert_transaction(transaction)?;
                    storage.flush()?;
                }
                Ok::<(), BlockchainError>(())
            })?;

        debug!(
            "Queued transaction {}: {} -> {} ({})",
            transaction.id, transaction.sender, transaction.recipient, transaction.amount
        );
        Ok(transaction)
    }

    /// Runs one mining round for `miner`.
    ///
    /// Selects every settleable pending transaction, seals them together
    /// with the reward, then appends the block and applies balances. The
    /// nonce search runs without blocking submissions; if the chain head
    /// moves in the meantime the round fails with
    /// [`BlockchainError::MiningConflict`] and changes nothing.
    pub fn mine(&self, miner: Address) -> Result<MineOutcome, BlockchainError> {
        let _round = self.round_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel.reset();

        let candidate = match self.prepare_round(miner)? {
            Some(candidate) => candidate,
            None => {
                info!("Nothing to mine");
                return Ok(MineOutcome::NoEligibleTransactions);
            }
        };

        let mined = self.seal_round(candidate)?;
        info!(
            "Mined block {} with {} transactions (nonce {}, hash {}, {:?})",
            mined.block.index,
            mined.block.transactions.len(),
            mined.nonce,
            mined.hash,
            mined.elapsed
        );
        Ok(MineOutcome::Mined(mined))
    }

    /// Stops an in-flight nonce search. The next round starts uncancelled.
    pub fn cancel_mining(&self) {
        self.cancel.cancel();
    }

    fn prepare_round(&self, miner: Address) -> Result<Option<Candidate>, BlockchainError> {
        if miner.is_reward_sentinel() {
            return Err(AccountError::ReservedIdentifier(miner.0).into());
        }

        if !self.accounts.exists(&miner) {
            return Err(AccountError::UnknownAccount(miner.0).into());
        }

        let _gate = self.read_gate();
        let eligible = self.pool.select_eligible(&self.accounts);
        if eligible.is_empty() {
            return Ok(None);
        }

        let (index, previous_hash) = {
            let chain = self.chain_ref();
            let head = chain.head();
            (head.index + 1, head.hash.clone())
        };

        let mut embedded: Vec<Transaction> = eligible.iter().map(Transaction::confirmed).collect();
        embedded.push(Transaction::new_reward(miner.clone(), self.mining_reward, Utc::now()));

        debug!("Selected {} transactions for block {}", eligible.len(), index);
        Ok(Some(Candidate {
            miner,
            eligible,
            embedded,
            index,
            previous_hash,
        }))
    }

    fn seal_round(&self, candidate: Candidate) -> Result<MinedBlock, BlockchainError> {
        let seal = self
            .pow
            .seal(candidate.index, &candidate.previous_hash, &candidate.embedded, &self.cancel)?;

        let block = Block {
            index: candidate.index,
            timestamp: Utc::now(),
            transactions: candidate.embedded,
            previous_hash: candidate.previous_hash,
            nonce: seal.nonce,
            hash: seal.hash.clone(),
            miner: candidate.miner,
        };

        self.commit_round(&block, &candidate.eligible)?;

        Ok(MinedBlock {
            nonce: seal.nonce,
            hash: seal.hash,
            elapsed: seal.elapsed,
            block,
        })
    }

    /// Appends the block, then settles balances and flips the pool records.
    ///
    /// Everything that can fail is checked before the first mutation.
    fn commit_round(&self, block: &Block, eligible: &[Transaction]) -> Result<(), BlockchainError> {
        let _gate = self.write_gate();
        let mut chain = self.chain_mut();

        chain.check_next(block).map_err(|err| {
            warn!("Discarding block {}: {}", block.index, err);
            BlockchainError::MiningConflict(err)
        })?;

        let settlement = self.accounts.settle(eligible)?;
        let reward = block.transactions.iter().find(|tx| tx.is_reward());

        if let Some(storage) = &self.storage {
            // same updates, same order as below
            let mut deltas = settlement.deltas().to_vec();
            if let Some(reward) = reward {
                deltas.push((reward.recipient.clone(), reward.amount));
            }
            storage.commit_round(block, &block.transactions, &deltas)?;
        }

        chain.append(block.clone()).map_err(|err| {
            error!("Block {} was persisted but rejected in memory: {}", block.index, err);
            BlockchainError::MiningConflict(err)
        })?;

        self.accounts.apply_confirmed(&settlement);
        if let Some(reward) = reward {
            self.accounts.credit_reward(&reward.recipient, reward.amount);
            self.pool.record_confirmed(reward.clone());
        }

        let ids: Vec<String> = eligible.iter().map(|tx| tx.id.clone()).collect();
        self.pool.mark_confirmed(&ids);

        Ok(())
    }

    pub fn get_confirmed_balance(&self, address: &Address) -> f64 {
        let _gate = self.read_gate();
        self.accounts.confirmed_balance(address)
    }

    pub fn get_available_balance(&self, address: &Address) -> f64 {
        let _gate = self.read_gate();
        self.pool.available_balance(&self.accounts, address)
    }

    pub fn get_balance(&self, address: &Address) -> Balance {
        let _gate = self.read_gate();
        Balance {
            address: address.clone(),
            confirmed: self.accounts.confirmed_balance(address),
            available: self.pool.available_balance(&self.accounts, address),
        }
    }

    /// Balances of every registered account, ordered by identifier
    pub fn list_balances(&self) -> Vec<Balance> {
        let _gate = self.read_gate();
        self.accounts
            .get_all_accounts()
            .into_iter()
            .map(|account| Balance {
                available: self.pool.available_balance(&self.accounts, &account.address),
                confirmed: account.balance,
                address: account.address,
            })
            .collect()
    }

    /// Every block, index ascending
    pub fn list_chain(&self) -> Vec<Block> {
        self.chain_ref().blocks()
    }

    pub fn head(&self) -> Block {
        self.chain_ref().head().clone()
    }

    pub fn get_block(&self, index: u64) -> Option<Block> {
        self.chain_ref().get_block(index).cloned()
    }

    pub fn search_by_block_index(&self, index: u64) -> Option<Block> {
        self.get_block(index)
    }

    pub fn search_by_block_hash(&self, hash: &str) -> Option<Block> {
        self.chain_ref().find_by_hash(hash.trim()).cloned()
    }

    pub fn list_pending(&self) -> Vec<Transaction> {
        self.pool.list_pending()
    }

    pub fn list_history(&self, address: &Address) -> History {
        let _gate = self.read_gate();
        self.pool.history(address)
    }

    pub fn search_transactions(&self, filter: &TransactionFilter) -> Vec<Transaction> {
        self.pool.search(filter)
    }

    /// Checks every chain invariant from genesis to head
    pub fn validate(&self) -> Result<(), ChainError> {
        self.chain_ref().validate()
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn difficulty(&self) -> usize {
        self.pow.difficulty()
    }

    pub fn mining_reward(&self) -> f64 {
        self.mining_reward
    }

    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.state_gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.state_gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn chain_ref(&self) -> RwLockReadGuard<'_, Chain> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn chain_mut(&self) -> RwLockWriteGuard<'_, Chain> {
        self.chain.write().unwrap_or_else(PoisonError::into_inner)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

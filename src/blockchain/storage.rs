use std::fmt;
use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError as SledTransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::account::{apply_delta, Account, Address};
use super::block::Block;
use super::transaction::Transaction;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Durable, ordered record store behind the ledger.
///
/// Blocks are keyed by index, transactions by id (loaded back in first-write
/// order) and balances by account identifier.
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// All stored blocks, index ascending
    fn load_chain(&self) -> Result<Vec<Block>, StorageError>;

    fn append_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Every transaction record, pending and confirmed, in first-write order
    fn load_transactions(&self) -> Result<Vec<Transaction>, StorageError>;

    fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StorageError>;

    fn load_balances(&self) -> Result<Vec<Account>, StorageError>;

    /// Adds `delta` to the stored balance with [`apply_delta`], creating the
    /// record at zero if needed
    fn update_balance(&self, address: &Address, delta: f64) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    fn load_pending_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        Ok(self
            .load_transactions()?
            .into_iter()
            .filter(Transaction::is_pending)
            .collect())
    }

    /// Writes everything a mining round produces. Stores that can do so
    /// should make this a single atomic write.
    ///
    /// `deltas` are applied in order and an account may appear more than once.
    fn commit_round(
        &self,
        block: &Block,
        transactions: &[Transaction],
        deltas: &[(Address, f64)],
    ) -> Result<(), StorageError> {
        self.append_block(block)?;
        for transaction in transactions {
            self.upsert_transaction(transaction)?;
        }
        for (address, delta) in deltas {
            self.update_balance(address, *delta)?;
        }
        self.flush()
    }
}

/// sled-backed [`LedgerStore`]
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian index
    blocks: Tree,

    /// Transactions keyed by id
    transactions: Tree,

    /// Transaction ids keyed by big-endian first-write sequence
    transaction_order: Tree,

    /// Accounts keyed by identifier
    accounts: Tree,
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// A store that is deleted when dropped
    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let transactions = db.open_tree("transactions")?;
        let transaction_order = db.open_tree("transaction_order")?;
        let accounts = db.open_tree("accounts")?;

        Ok(Self {
            db,
            blocks,
            transactions,
            transaction_order,
            accounts,
        })
    }

    fn read_account(&self, address: &Address) -> Result<Account, StorageError> {
        match self.accounts.get(address.0.as_bytes())? {
            Some(value) => decode(&value),
            None => Ok(Account::new(address.clone(), 0.0)),
        }
    }
}

impl LedgerStore for SledStore {
    fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        decode_all(self.blocks.iter().map(|entry| entry.map(|(_, value)| value)), "block")
    }

    fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.index.to_be_bytes(), encode(block)?)?;
        Ok(())
    }

    fn load_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        let records = self.transaction_order.iter().filter_map(|entry| match entry {
            Ok((_, id)) => self.transactions.get(id).transpose(),
            Err(err) => Some(Err(err)),
        });
        decode_all(records, "transaction")
    }

    fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
        let key = transaction.id.as_bytes();
        let previous = self.transactions.insert(key, encode(transaction)?)?;

        if previous.is_none() {
            let sequence = self.db.generate_id()?;
            self.transaction_order.insert(sequence.to_be_bytes(), key)?;
        }

        Ok(())
    }

    /// Every account record must decode; a balance is never dropped
    fn load_balances(&self) -> Result<Vec<Account>, StorageError> {
        self.accounts
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                decode(&value).map_err(|err| {
                    StorageError::DeserializationError(format!(
                        "account {}: {}",
                        String::from_utf8_lossy(&key),
                        err
                    ))
                })
            })
            .collect()
    }

    fn update_balance(&self, address: &Address, delta: f64) -> Result<(), StorageError> {
        let mut account = self.read_account(address)?;
        account.balance = apply_delta(account.balance, delta);
        self.accounts.insert(address.0.as_bytes(), encode(&account)?)?;
        Ok(())
    }

    /// Flushes all pending writes to disk
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn commit_round(
        &self,
        block: &Block,
        transactions: &[Transaction],
        deltas: &[(Address, f64)],
    ) -> Result<(), StorageError> {
        let block_key = block.index.to_be_bytes();
        let block_value = encode(block)?;

        let mut records = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            records.push((transaction.id.as_bytes(), encode(transaction)?, self.db.generate_id()?));
        }

        let result: TransactionResult<(), StorageError> =
            (&self.blocks, &self.transactions, &self.transaction_order, &self.accounts).transaction(
                |(blocks, txs, order, accounts)| {
                    blocks.insert(&block_key[..], block_value.as_slice())?;

                    for (id, value, sequence) in &records {
                        if txs.get(*id)?.is_none() {
                            order.insert(&sequence.to_be_bytes()[..], *id)?;
                        }
                        txs.insert(*id, value.as_slice())?;
                    }

                    for (address, delta) in deltas {
                        let key = address.0.as_bytes();
                        let mut account = match accounts.get(key)? {
                            Some(value) => decode::<Account>(&value).map_err(ConflictableTransactionError::Abort)?,
                            None => Account::new(address.clone(), 0.0),
                        };
                        account.balance = apply_delta(account.balance, *delta);
                        let value = encode(&account).map_err(ConflictableTransactionError::Abort)?;
                        accounts.insert(key, value)?;
                    }

                    Ok(())
                },
            );

        result.map_err(|err| match err {
            SledTransactionError::Abort(err) => err,
            SledTransactionError::Storage(err) => StorageError::DatabaseError(err),
        })?;

        self.flush()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

/// Decodes every value, skipping (and logging) records that fail to decode
/// as long as at least one succeeds
fn decode_all<T, I>(values: I, kind: &str) -> Result<Vec<T>, StorageError>
where
    T: DeserializeOwned,
    I: Iterator<Item = Result<sled::IVec, sled::Error>>,
{
    let mut decoded = Vec::new();
    let mut deserialization_errors = Vec::new();

    for value in values {
        match decode::<T>(&value?) {
            Ok(item) => decoded.push(item),
            Err(e) => deserialization_errors.push(format!("Failed to deserialize {}: {}", kind, e)),
        }
    }

    if !deserialization_errors.is_empty() {
        if decoded.is_empty() {
            return Err(StorageError::DeserializationError(deserialization_errors.join(", ")));
        }
        warn!("Some {} records could not be deserialized: {}", kind, deserialization_errors.join(", "));
    }

    Ok(decoded)
}

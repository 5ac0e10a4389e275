use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use super::account::{covers, AccountLedger, Address};
use super::transaction::{validate_amount, Transaction, TransactionError, TransactionStatus};

/// An account's transfers split by confirmation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct History {
    pub pending: Vec<Transaction>,
    pub confirmed: Vec<Transaction>,
}

/// Optional filters for [`TransactionPool::search`]
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Matches either side of the transfer
    pub account: Option<Address>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

impl TransactionFilter {
    fn matches(&self, transaction: &Transaction) -> bool {
        if let Some(account) = &self.account {
            if !transaction.involves(account) {
                return false;
            }
        }
        if let Some(min) = self.min_amount {
            if transaction.amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if transaction.amount > max {
                return false;
            }
        }
        true
    }
}

/// Every submitted transfer, in submission order, plus a running total of
/// each sender's pending outgoing amount.
///
/// Confirmed records are kept for history; nothing is ever removed.
#[derive(Debug, Default)]
pub struct TransactionPool {
    records: RwLock<Vec<Transaction>>,

    /// Sum of pending outgoing amounts per sender. Holding an entry is the
    /// per-sender lock taken while a submission is checked and recorded.
    pending_out: DashMap<Address, f64>,
}

impl TransactionPool {
    pub fn new() -> Self {
        TransactionPool {
            records: RwLock::new(Vec::new()),
            pending_out: DashMap::new(),
        }
    }

    /// Validates and queues a transfer.
    ///
    /// Checks run in order: amount, recipient, sender, then the sender's
    /// available balance (confirmed minus everything they already have
    /// pending). `persist` runs under the sender's lock before the transfer
    /// is queued; if it fails nothing is queued.
    pub fn submit<E>(
        &self,
        ledger: &AccountLedger,
        sender: Address,
        recipient: Address,
        amount: f64,
        timestamp: DateTime<Utc>,
        persist: impl FnOnce(&Transaction) -> Result<(), E>,
    ) -> Result<Transaction, E>
    where
        E: From<TransactionError>,
    {
        validate_amount(amount)?;

        if !ledger.exists(&recipient) {
            return Err(TransactionError::UnknownRecipient(recipient.0).into());
        }

        if !ledger.exists(&sender) {
            return Err(TransactionError::UnknownSender(sender.0).into());
        }

        let mut pending = self.pending_out.entry(sender.clone()).or_insert(0.0);
        let available = ledger.confirmed_balance(&sender) - *pending;
        if !covers(available, amount) {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available,
            }
            .into());
        }

        let transaction = Transaction::new(sender, recipient, amount, timestamp);
        persist(&transaction)?;

        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction.clone());
        *pending += amount;

        Ok(transaction)
    }

    /// Sum of `address`'s pending outgoing transfers
    pub fn pending_outgoing(&self, address: &Address) -> f64 {
        self.pending_out.get(address).map(|total| *total).unwrap_or(0.0)
    }

    /// Confirmed balance minus pending outgoing transfers
    pub fn available_balance(&self, ledger: &AccountLedger, address: &Address) -> f64 {
        ledger.confirmed_balance(address) - self.pending_outgoing(address)
    }

    /// Pending transactions in submission order
    pub fn list_pending(&self) -> Vec<Transaction> {
        self.read_records(|records| records.iter().filter(|tx| tx.is_pending()).cloned().collect())
    }

    /// Pending transactions that can be settled right now.
    ///
    /// Each one is checked against its sender's confirmed balance, less the
    /// amounts of that sender's transactions already selected earlier in
    /// submission order. Incoming transfers in the same batch do not count.
    pub fn select_eligible(&self, ledger: &AccountLedger) -> Vec<Transaction> {
        let mut remaining: HashMap<Address, f64> = HashMap::new();
        let mut eligible = Vec::new();

        for transaction in self.list_pending() {
            if !ledger.exists(&transaction.sender) || !ledger.exists(&transaction.recipient) {
                debug!("Skipping transaction {}: unknown account", transaction.id);
                continue;
            }

            let balance = remaining
                .entry(transaction.sender.clone())
                .or_insert_with(|| ledger.confirmed_balance(&transaction.sender));

            if covers(*balance, transaction.amount) {
                *balance -= transaction.amount;
                eligible.push(transaction);
            } else {
                debug!(
                    "Skipping transaction {}: {} cannot cover {}",
                    transaction.id, transaction.sender, transaction.amount
                );
            }
        }

        eligible
    }

    /// Flips exactly the given pending records to confirmed and returns how
    /// many changed
    pub fn mark_confirmed(&self, ids: &[String]) -> usize {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut flipped = 0;
        let mut senders = HashSet::new();

        let totals = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            for record in records.iter_mut() {
                if record.is_pending() && wanted.contains(record.id.as_str()) {
                    record.status = TransactionStatus::Confirmed;
                    senders.insert(record.sender.clone());
                    flipped += 1;
                }
            }
            pending_totals(&records, &senders)
        };

        // recomputed rather than decremented so no float residue builds up
        for sender in senders {
            match totals.get(&sender) {
                Some(total) => {
                    self.pending_out.insert(sender, *total);
                }
                None => {
                    self.pending_out.remove(&sender);
                }
            }
        }

        flipped
    }

    /// Stores a record that never passed through the pending state (mining rewards)
    pub fn record_confirmed(&self, transaction: Transaction) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction.confirmed());
    }

    /// Transfers sent or received by `account`
    pub fn history(&self, account: &Address) -> History {
        self.read_records(|records| {
            let mut history = History::default();
            for record in records.iter().filter(|tx| tx.involves(account)) {
                match record.status {
                    TransactionStatus::Pending => history.pending.push(record.clone()),
                    TransactionStatus::Confirmed => history.confirmed.push(record.clone()),
                }
            }
            history
        })
    }

    /// All records, pending and confirmed, matching `filter`
    pub fn search(&self, filter: &TransactionFilter) -> Vec<Transaction> {
        self.read_records(|records| records.iter().filter(|tx| filter.matches(tx)).cloned().collect())
    }

    /// Replaces every record with ones loaded from storage
    pub fn restore(&self, transactions: Vec<Transaction>) {
        let totals = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            *records = transactions;

            let senders: HashSet<Address> = records
                .iter()
                .filter(|tx| tx.is_pending())
                .map(|tx| tx.sender.clone())
                .collect();
            pending_totals(&records, &senders)
        };

        self.pending_out.clear();
        for (sender, total) in totals {
            self.pending_out.insert(sender, total);
        }
    }

    fn read_records<T>(&self, f: impl FnOnce(&[Transaction]) -> T) -> T {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        f(&records)
    }
}

fn pending_totals(records: &[Transaction], senders: &HashSet<Address>) -> HashMap<Address, f64> {
    let mut totals = HashMap::new();
    for record in records.iter().filter(|tx| tx.is_pending() && senders.contains(&tx.sender)) {
        *totals.entry(record.sender.clone()).or_insert(0.0) += record.amount;
    }
    totals
}

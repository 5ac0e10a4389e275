use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::transaction::{Transaction, REWARD_SENTINEL};

/// Tolerance for comparing floating point balances
const BALANCE_EPSILON: f64 = 1e-9;

/// Errors that can occur during account operations
#[derive(Debug, Error, PartialEq)]
pub enum AccountError {
    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Identifier is reserved: {0}")]
    ReservedIdentifier(String),

    #[error("Invalid account identifier: {0}")]
    InvalidAccount(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds in {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: String,
        required: f64,
        available: f64,
    },
}

/// Opaque account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    pub fn reward_sentinel() -> Self {
        Address(REWARD_SENTINEL.to_string())
    }

    pub fn is_reward_sentinel(&self) -> bool {
        self.0 == REWARD_SENTINEL
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address(value)
    }
}

/// Represents an account in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// The account's identifier
    pub address: Address,

    /// The account's confirmed balance
    pub balance: f64,
}

impl Account {
    /// Creates a new account with the given confirmed balance
    pub fn new(address: Address, balance: f64) -> Self {
        Account { address, balance }
    }
}

/// `balance >= amount`, tolerant of floating point drift
pub fn covers(balance: f64, amount: f64) -> bool {
    balance + BALANCE_EPSILON >= amount
}

/// Adds `delta`, snapping dust left by float drift to zero.
///
/// Every balance change goes through here, in memory and in storage alike,
/// so both sides round the same way.
pub fn apply_delta(balance: f64, delta: f64) -> f64 {
    let updated = balance + delta;
    if updated.abs() < BALANCE_EPSILON {
        0.0
    } else {
        updated
    }
}

fn debit(balance: f64, amount: f64) -> f64 {
    apply_delta(balance, -amount)
}

/// Net balance changes of a batch of confirmed transactions, checked
/// against the ledger but not yet applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settlement {
    /// One entry per touched account, ordered by identifier
    deltas: Vec<(Address, f64)>,
}

impl Settlement {
    pub fn deltas(&self) -> &[(Address, f64)] {
        &self.deltas
    }
}

/// Confirmed balances of every registered account.
///
/// The ledger itself is not a unit of atomicity: callers that need a batch to
/// appear all-at-once to readers (a mining round) hold the context's state
/// gate while calling [`AccountLedger::apply_confirmed`].
#[derive(Debug, Default)]
pub struct AccountLedger {
    accounts: DashMap<Address, Account>,
}

impl AccountLedger {
    pub fn new() -> Self {
        AccountLedger {
            accounts: DashMap::new(),
        }
    }

    /// Registers a new account holding `opening_balance`.
    ///
    /// `persist` runs while the identifier is still reserved and before the
    /// account becomes visible; if it fails the account is not created.
    pub fn open_account<E>(
        &self,
        address: Address,
        opening_balance: f64,
        persist: impl FnOnce(&Account) -> Result<(), E>,
    ) -> Result<Account, E>
    where
        E: From<AccountError>,
    {
        if address.0.trim().is_empty() {
            return Err(AccountError::InvalidAccount("identifier must not be empty".to_string()).into());
        }

        if address.is_reward_sentinel() {
            return Err(AccountError::ReservedIdentifier(address.0).into());
        }

        if !opening_balance.is_finite() || opening_balance < 0.0 {
            return Err(AccountError::InvalidAmount(format!(
                "Opening balance must be non-negative: {}",
                opening_balance
            ))
            .into());
        }

        match self.accounts.entry(address.clone()) {
            Entry::Occupied(_) => Err(AccountError::AccountExists(address.0).into()),
            Entry::Vacant(slot) => {
                let account = Account::new(address, apply_delta(0.0, opening_balance));
                persist(&account)?;
                slot.insert(account.clone());
                Ok(account)
            }
        }
    }

    /// Whether `address` is a registered account
    pub fn exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Gets an account, or a zero-balance placeholder for unknown identifiers.
    /// The placeholder is not stored.
    pub fn get_or_default(&self, address: &Address) -> Account {
        self.accounts
            .get(address)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Account::new(address.clone(), 0.0))
    }

    /// Confirmed balance; 0 for unknown accounts
    pub fn confirmed_balance(&self, address: &Address) -> f64 {
        self.get_or_default(address).balance
    }

    /// Computes the net balance change each account would see if
    /// `transactions` were applied in order, without applying anything.
    ///
    /// Fails if any sender (other than the reward sentinel) would be driven
    /// below zero at any point in the sequence.
    pub fn settle(&self, transactions: &[Transaction]) -> Result<Settlement, AccountError> {
        let mut staged: HashMap<Address, f64> = HashMap::new();
        let mut deltas: BTreeMap<Address, f64> = BTreeMap::new();

        for transaction in transactions {
            if !transaction.is_reward() {
                let balance = *staged
                    .entry(transaction.sender.clone())
                    .or_insert_with(|| self.confirmed_balance(&transaction.sender));

                if !covers(balance, transaction.amount) {
                    return Err(AccountError::InsufficientFunds {
                        account: transaction.sender.0.clone(),
                        required: transaction.amount,
                        available: balance,
                    });
                }

                staged.insert(transaction.sender.clone(), debit(balance, transaction.amount));
                *deltas.entry(transaction.sender.clone()).or_insert(0.0) -= transaction.amount;
            }

            let recipient_balance = staged
                .entry(transaction.recipient.clone())
                .or_insert_with(|| self.confirmed_balance(&transaction.recipient));
            *recipient_balance += transaction.amount;
            *deltas.entry(transaction.recipient.clone()).or_insert(0.0) += transaction.amount;
        }

        Ok(Settlement {
            deltas: deltas.into_iter().collect(),
        })
    }

    /// Debits senders and credits recipients of a settled batch.
    ///
    /// The batch was fully checked by [`AccountLedger::settle`], so either
    /// the whole batch applies or, if settling failed, nothing does.
    pub fn apply_confirmed(&self, settlement: &Settlement) {
        for (address, delta) in settlement.deltas() {
            let mut account = self
                .accounts
                .entry(address.clone())
                .or_insert_with(|| Account::new(address.clone(), 0.0));
            account.balance = apply_delta(account.balance, *delta);
        }
    }

    /// Unconditionally credits `amount` to `address`
    pub fn credit_reward(&self, address: &Address, amount: f64) {
        let mut account = self
            .accounts
            .entry(address.clone())
            .or_insert_with(|| Account::new(address.clone(), 0.0));
        account.balance = apply_delta(account.balance, amount);
    }

    /// Replaces the in-memory state with accounts loaded from storage
    pub fn restore(&self, accounts: Vec<Account>) {
        self.accounts.clear();
        for account in accounts {
            self.accounts.insert(account.address.clone(), account);
        }
    }

    /// Gets all accounts, ordered by identifier
    pub fn get_all_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|entry| entry.value().clone()).collect();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transfer(from: &str, to: &str, amount: f64) -> Transaction {
        Transaction::new(Address::from(from), Address::from(to), amount, Utc::now())
    }

    fn open(ledger: &AccountLedger, name: &str, balance: f64) -> Result<Account, AccountError> {
        ledger.open_account(Address::from(name), balance, |_| Ok(()))
    }

    fn apply(ledger: &AccountLedger, transactions: &[Transaction]) -> Result<(), AccountError> {
        let settlement = ledger.settle(transactions)?;
        ledger.apply_confirmed(&settlement);
        Ok(())
    }

    #[test]
    fn test_unknown_account_has_zero_balance() {
        let ledger = AccountLedger::new();
        let nobody = Address::from("nobody");

        assert_eq!(ledger.confirmed_balance(&nobody), 0.0);
        assert!(!ledger.exists(&nobody));
        assert_eq!(ledger.get_or_default(&nobody).balance, 0.0);
        // looking it up must not create it
        assert!(!ledger.exists(&nobody));
    }

    #[test]
    fn test_open_account() {
        let ledger = AccountLedger::new();

        let account = open(&ledger, "alice", 50.0).unwrap();
        assert_eq!(account.balance, 50.0);
        assert!(ledger.exists(&Address::from("alice")));

        assert_eq!(open(&ledger, "alice", 10.0), Err(AccountError::AccountExists("alice".to_string())));
        assert_eq!(
            open(&ledger, REWARD_SENTINEL, 10.0),
            Err(AccountError::ReservedIdentifier(REWARD_SENTINEL.to_string()))
        );
        assert!(matches!(open(&ledger, "  ", 10.0), Err(AccountError::InvalidAccount(_))));
        assert!(matches!(open(&ledger, "carol", -1.0), Err(AccountError::InvalidAmount(_))));
    }

    #[test]
    fn test_open_account_not_created_when_persist_fails() {
        let ledger = AccountLedger::new();

        let result = ledger.open_account(Address::from("alice"), 50.0, |_| {
            Err(AccountError::InvalidAccount("write failed".to_string()))
        });
        assert!(result.is_err());
        assert!(!ledger.exists(&Address::from("alice")));

        // the identifier is free again
        assert!(open(&ledger, "alice", 50.0).is_ok());
    }

    #[test]
    fn test_apply_confirmed() {
        let ledger = AccountLedger::new();
        open(&ledger, "alice", 50.0).unwrap();
        open(&ledger, "bob", 0.0).unwrap();

        apply(&ledger, &[transfer("alice", "bob", 30.0), transfer("bob", "alice", 5.0)]).unwrap();

        assert_eq!(ledger.confirmed_balance(&Address::from("alice")), 25.0);
        assert_eq!(ledger.confirmed_balance(&Address::from("bob")), 25.0);
    }

    #[test]
    fn test_apply_confirmed_is_all_or_nothing() {
        let ledger = AccountLedger::new();
        open(&ledger, "alice", 50.0).unwrap();
        open(&ledger, "bob", 0.0).unwrap();

        let result = apply(&ledger, &[transfer("alice", "bob", 30.0), transfer("alice", "bob", 30.0)]);

        assert!(matches!(result, Err(AccountError::InsufficientFunds { .. })));
        assert_eq!(ledger.confirmed_balance(&Address::from("alice")), 50.0);
        assert_eq!(ledger.confirmed_balance(&Address::from("bob")), 0.0);
    }

    #[test]
    fn test_reward_skips_debit() {
        let ledger = AccountLedger::new();
        let reward = Transaction::new_reward(Address::from("miner"), 10.0, Utc::now());

        apply(&ledger, &[reward]).unwrap();
        assert_eq!(ledger.confirmed_balance(&Address::from("miner")), 10.0);
        assert!(!ledger.exists(&Address::reward_sentinel()));

        ledger.credit_reward(&Address::from("miner"), 10.0);
        assert_eq!(ledger.confirmed_balance(&Address::from("miner")), 20.0);
    }

    #[test]
    fn test_float_dust_does_not_block_full_spend() {
        let ledger = AccountLedger::new();
        open(&ledger, "alice", 0.3).unwrap();
        open(&ledger, "bob", 0.0).unwrap();

        apply(&ledger, &[transfer("alice", "bob", 0.1), transfer("alice", "bob", 0.2)]).unwrap();

        assert_eq!(ledger.confirmed_balance(&Address::from("alice")), 0.0);
    }

    #[test]
    fn test_apply_delta_snaps_dust() {
        assert_eq!(apply_delta(0.3, -0.1 - 0.2), 0.0);
        assert_eq!(apply_delta(50.0, -20.0), 30.0);
        assert_eq!(apply_delta(0.0, 1e-12), 0.0);
    }

    #[test]
    fn test_settle() {
        let ledger = AccountLedger::new();
        open(&ledger, "alice", 50.0).unwrap();

        let settlement = ledger
            .settle(&[
                transfer("alice", "bob", 20.0),
                Transaction::new_reward(Address::from("miner"), 10.0, Utc::now()),
            ])
            .unwrap();

        assert_eq!(
            settlement.deltas(),
            &[
                (Address::from("alice"), -20.0),
                (Address::from("bob"), 20.0),
                (Address::from("miner"), 10.0),
            ]
        );
        // nothing applied
        assert_eq!(ledger.confirmed_balance(&Address::from("alice")), 50.0);
    }
}

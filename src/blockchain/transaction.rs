use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::account::Address;

/// Sender identifier used by mining-reward transactions
pub const REWARD_SENTINEL: &str = "0";

/// Errors that can occur when a transfer is submitted
#[derive(Debug, Error, PartialEq)]
pub enum TransactionError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Unknown sender: {0}")]
    UnknownSender(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },
}

/// Confirmation state of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
}

/// Represents a transfer between two accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Unique identifier for the transaction
    pub id: String,

    /// Sender's account identifier
    pub sender: Address,

    /// Recipient's account identifier
    pub recipient: Address,

    /// Amount being transferred
    pub amount: f64,

    /// Timestamp when the transaction was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Whether the transaction is still waiting for a block
    pub status: TransactionStatus,
}

impl Transaction {
    /// Creates a new pending transfer
    pub fn new(sender: Address, recipient: Address, amount: f64, timestamp: DateTime<Utc>) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            sender,
            recipient,
            amount,
            timestamp,
            status: TransactionStatus::Pending,
        }
    }

    /// Creates a mining reward paid from the reward sentinel to `miner`.
    ///
    /// Rewards never sit in the pool, so they are born confirmed.
    pub fn new_reward(miner: Address, amount: f64, timestamp: DateTime<Utc>) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            sender: Address::reward_sentinel(),
            recipient: miner,
            amount,
            timestamp,
            status: TransactionStatus::Confirmed,
        }
    }

    /// Checks if the transaction is a mining reward
    pub fn is_reward(&self) -> bool {
        self.sender.is_reward_sentinel()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    /// Returns a copy of this record in the confirmed state, as embedded in a block
    pub fn confirmed(&self) -> Self {
        Transaction {
            status: TransactionStatus::Confirmed,
            ..self.clone()
        }
    }

    /// Whether `account` is either side of the transfer
    pub fn involves(&self, account: &Address) -> bool {
        &self.sender == account || &self.recipient == account
    }
}

/// Checks that an amount is a finite, strictly positive number
pub fn validate_amount(amount: f64) -> Result<(), TransactionError> {
    if !amount.is_finite() {
        return Err(TransactionError::InvalidAmount(format!(
            "Amount must be a finite number: {}",
            amount
        )));
    }

    if amount <= 0.0 {
        return Err(TransactionError::InvalidAmount(format!(
            "Amount must be positive: {}",
            amount
        )));
    }

    Ok(())
}

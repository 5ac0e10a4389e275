use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::transaction::Transaction;

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Encoding error: {0}")]
    EncodingError(#[from] serde_json::Error),
}

/// Encodes transactions to a stable JSON string with every object's keys
/// sorted, so the same logical content always produces the same bytes
/// regardless of struct field order.
pub fn canonical_transactions(transactions: &[Transaction]) -> Result<String, HashError> {
    canonical_json(transactions)
}

fn canonical_json<T: Serialize + ?Sized>(data: &T) -> Result<String, HashError> {
    let value = sort_keys(serde_json::to_value(data)?);
    Ok(serde_json::to_string(&value)?)
}

// Rebuilt explicitly: with serde_json's `preserve_order` feature the map keeps
// insertion order instead of sorting.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(key, value)| (key, sort_keys(value))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// SHA-256 over `index || previous_hash || nonce || canonical_transactions`,
/// hex encoded
pub fn block_hash(index: u64, previous_hash: &str, nonce: u64, canonical_transactions: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(previous_hash.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(canonical_transactions.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `hash` starts with at least `difficulty` zero hex characters
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// The all-zero hash used by the genesis block
pub fn zero_hash() -> String {
    "0".repeat(HASH_HEX_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::Address;
    use chrono::Utc;

    #[test]
    fn test_block_hash_is_hex_sha256() {
        let hash = block_hash(1, &zero_hash(), 0, "[]");

        assert_eq!(hash.len(), HASH_HEX_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, block_hash(1, &zero_hash(), 0, "[]"));
        assert_ne!(hash, block_hash(1, &zero_hash(), 1, "[]"));
    }

    #[test]
    fn test_block_hash_matches_concatenated_preimage() {
        let preimage = format!("{}{}{}{}", 7, "abc", 42, "[]");
        let expected = hex::encode(Sha256::digest(preimage.as_bytes()));

        assert_eq!(block_hash(7, "abc", 42, "[]"), expected);
    }

    #[test]
    fn test_canonical_transactions_sorts_keys() {
        let transaction = Transaction::new(Address::from("alice"), Address::from("bob"), 5.0, Utc::now());
        let encoded = canonical_transactions(&[transaction.clone()]).unwrap();

        let amount = encoded.find("\"amount\"").unwrap();
        let id = encoded.find("\"id\"").unwrap();
        let recipient = encoded.find("\"recipient\"").unwrap();
        let sender = encoded.find("\"sender\"").unwrap();
        assert!(amount < id && id < recipient && recipient < sender);

        assert_eq!(encoded, canonical_transactions(&[transaction]).unwrap());
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("000abc", 3));
        assert!(meets_difficulty("000abc", 0));
        assert!(!meets_difficulty("00abcd", 3));
        assert!(!meets_difficulty("00", 3));
        assert!(meets_difficulty(&zero_hash(), 64));
    }
}

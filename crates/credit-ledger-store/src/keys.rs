//! Key encoding utilities for `RocksDB`.
//!
//! User ids have variable length, so the per-user transaction index prefixes
//! them with a two-byte length. Without it the prefix for `u1` would also
//! match every key belonging to `u10`.

use credit_ledger_core::{TransactionId, UserId};

/// Create a balance or billing key from a user ID.
#[must_use]
pub fn user_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a prefix for iterating all transactions for a user.
///
/// Format: `len(user_id) as u16 BE || user_id`
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    let bytes = user_id.as_bytes();
    // User ids are capped well below u16::MAX by validation.
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    let mut key = Vec::with_capacity(2 + bytes.len() + 16);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

/// Create a user-transaction index key.
///
/// Format: `user_transactions_prefix(user_id) || transaction_id (16 bytes)`
///
/// Since ULIDs are time-ordered, transactions for a user sort by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = user_transactions_prefix(user_id);
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Extract the transaction ID from a user-transaction index key.
///
/// Returns `None` if the key is shorter than a ULID.
#[must_use]
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> Option<TransactionId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn user_transaction_key_format() {
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user("u1"), &tx_id);

        assert_eq!(key.len(), 2 + 2 + 16);
        assert_eq!(&key[..2], &[0, 2]);
        assert_eq!(&key[2..4], b"u1");
        assert_eq!(&key[4..], tx_id.to_bytes());
    }

    #[test]
    fn prefix_does_not_match_longer_user_ids() {
        let short = user_transactions_prefix(&user("u1"));
        let long_key = user_transaction_key(&user("u10"), &TransactionId::generate());
        assert!(!long_key.starts_with(&short));
    }

    #[test]
    fn extract_transaction_id_roundtrip() {
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user("user_abc"), &tx_id);
        assert_eq!(extract_transaction_id_from_user_key(&key), Some(tx_id));
        assert_eq!(extract_transaction_id_from_user_key(&[1, 2, 3]), None);
    }
}

//! Column families used by the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Balance rows, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Ledger transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `len(user_id) || user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Plan descriptors, keyed by `plan_id`.
    pub const PLANS: &str = "plans";

    /// Billing statuses, keyed by `user_id`.
    pub const BILLING: &str = "billing";

    /// Processed provider event ids, keyed by `event_id`. Value is the event type.
    pub const EXTERNAL_EVENTS: &str = "external_events";

    /// Singleton values such as the catalog version.
    pub const META: &str = "meta";
}

/// Key in [`cf::META`] holding the catalog version as big-endian `u64`.
pub const CATALOG_VERSION_KEY: &[u8] = b"catalog_version";

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::PLANS,
        cf::BILLING,
        cf::EXTERNAL_EVENTS,
        cf::META,
    ]
}

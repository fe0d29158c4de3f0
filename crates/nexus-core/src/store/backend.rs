//! Backing-store port for the task store.
//!
//! `TaskBackend` is a deliberately dumb key-value adapter: hash records,
//! set and sorted-set indices, TTLs and a watch-then-transact primitive.
//! All task semantics (key schema, versioning, retries) live in
//! [`TaskStore`](super::TaskStore).

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use nexus_types::error::RepositoryError;

/// A stored hash record: field name to value.
pub type StoredRecord = HashMap<String, String>;

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Set the given hash fields (other fields are left untouched).
    PutRecord {
        key: String,
        fields: Vec<(String, String)>,
    },
    DeleteKey {
        key: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },
    SortedRemove {
        key: String,
        member: String,
    },
    /// (Re)set the key's time to live.
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Backing-store port.
///
/// Implementations live in nexus-infra (e.g., RedisTaskBackend) and in
/// [`MemoryTaskBackend`](super::MemoryTaskBackend) for tests and local runs.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskBackend: Send + Sync {
    /// Proof of a watch started by [`watch`](TaskBackend::watch), consumed by
    /// [`commit_watched`](TaskBackend::commit_watched).
    type WatchToken: Send;

    /// Read a hash record. Missing or expired keys yield `None`.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<StoredRecord>, RepositoryError>> + Send;

    /// Read several hash records, preserving input order.
    fn get_many(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<Vec<Option<StoredRecord>>, RepositoryError>> + Send;

    /// Start watching `key` and read its current value.
    fn watch(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<(Self::WatchToken, Option<StoredRecord>), RepositoryError>> + Send;

    /// Apply `ops` atomically only if the watched key was not written since
    /// the watch began. Returns `false` when the commit was rejected.
    fn commit_watched(
        &self,
        token: Self::WatchToken,
        ops: Vec<WriteOp>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Apply `ops` atomically without a watch.
    fn exec_atomic(
        &self,
        ops: Vec<WriteOp>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn set_members(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Members of a sorted set, highest score first.
    fn sorted_range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    fn sorted_card(&self, key: &str) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Remove sorted-set members scored strictly below `max`; returns the count removed.
    fn sorted_remove_below(
        &self,
        key: &str,
        max: f64,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

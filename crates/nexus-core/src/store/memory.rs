//! In-process [`TaskBackend`] used by tests and single-node runs.
//!
//! Every key carries a revision counter that is bumped on each write (and on
//! expiry), which is enough to emulate WATCH: a watched commit succeeds only
//! if the key's revision is unchanged. Expiry is lazy, checked on access.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use nexus_types::error::RepositoryError;

use super::backend::{StoredRecord, TaskBackend, WriteOp};

#[derive(Debug, Clone)]
enum Value {
    Hash(StoredRecord),
    Set(BTreeSet<String>),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    revisions: HashMap<String, u64>,
}

impl State {
    fn bump(&mut self, key: &str) {
        *self.revisions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn revision(&self, key: &str) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    /// Drop `key` if its TTL has elapsed.
    fn purge(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.bump(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.entries.get(key)
    }

    fn hash(&mut self, key: &str) -> Result<Option<StoredRecord>, RepositoryError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn apply(&mut self, op: WriteOp) -> Result<(), RepositoryError> {
        match op {
            WriteOp::PutRecord { key, fields } => {
                self.purge(&key);
                let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                });
                let Value::Hash(hash) = &mut entry.value else {
                    return Err(wrong_type(&key));
                };
                hash.extend(fields);
                self.bump(&key);
            }
            WriteOp::DeleteKey { key } => {
                if self.entries.remove(&key).is_some() {
                    self.bump(&key);
                }
            }
            WriteOp::SetAdd { key, member } => {
                self.purge(&key);
                let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                });
                let Value::Set(set) = &mut entry.value else {
                    return Err(wrong_type(&key));
                };
                set.insert(member);
                self.bump(&key);
            }
            WriteOp::SetRemove { key, member } => {
                self.purge(&key);
                if let Some(entry) = self.entries.get_mut(&key) {
                    let Value::Set(set) = &mut entry.value else {
                        return Err(wrong_type(&key));
                    };
                    set.remove(&member);
                    if set.is_empty() {
                        self.entries.remove(&key);
                    }
                    self.bump(&key);
                }
            }
            WriteOp::SortedAdd { key, member, score } => {
                self.purge(&key);
                let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Sorted(HashMap::new()),
                    expires_at: None,
                });
                let Value::Sorted(zset) = &mut entry.value else {
                    return Err(wrong_type(&key));
                };
                zset.insert(member, score);
                self.bump(&key);
            }
            WriteOp::SortedRemove { key, member } => {
                self.purge(&key);
                if let Some(entry) = self.entries.get_mut(&key) {
                    let Value::Sorted(zset) = &mut entry.value else {
                        return Err(wrong_type(&key));
                    };
                    zset.remove(&member);
                    if zset.is_empty() {
                        self.entries.remove(&key);
                    }
                    self.bump(&key);
                }
            }
            WriteOp::Expire { key, ttl } => {
                self.purge(&key);
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
        }
        Ok(())
    }

    /// Apply a batch all-or-nothing.
    fn apply_all(&mut self, ops: Vec<WriteOp>) -> Result<(), RepositoryError> {
        let entries = self.entries.clone();
        let revisions = self.revisions.clone();
        for op in ops {
            if let Err(e) = self.apply(op) {
                self.entries = entries;
                self.revisions = revisions;
                return Err(e);
            }
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> RepositoryError {
    RepositoryError::Query(format!("WRONGTYPE operation against key '{key}'"))
}

/// Watch token: the key and the revision observed when the watch began.
#[derive(Debug)]
pub struct MemoryWatch {
    key: String,
    revision: u64,
}

/// In-memory backing store with WATCH emulation and lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryTaskBackend {
    state: Mutex<State>,
}

impl MemoryTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write to a key outside any transaction, as a concurrent client would.
    pub fn touch(&self, key: &str) {
        self.state().bump(key);
    }
}

impl TaskBackend for MemoryTaskBackend {
    type WatchToken = MemoryWatch;

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, RepositoryError> {
        self.state().hash(key)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredRecord>>, RepositoryError> {
        let mut state = self.state();
        keys.iter().map(|key| state.hash(key)).collect()
    }

    async fn watch(&self, key: &str) -> Result<(MemoryWatch, Option<StoredRecord>), RepositoryError> {
        let mut state = self.state();
        let snapshot = state.hash(key)?;
        let token = MemoryWatch {
            key: key.to_string(),
            revision: state.revision(key),
        };
        Ok((token, snapshot))
    }

    async fn commit_watched(
        &self,
        token: MemoryWatch,
        ops: Vec<WriteOp>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state();
        state.purge(&token.key);
        if state.revision(&token.key) != token.revision {
            return Ok(false);
        }
        state.apply_all(ops)?;
        Ok(true)
    }

    async fn exec_atomic(&self, ops: Vec<WriteOp>) -> Result<(), RepositoryError> {
        self.state().apply_all(ops)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, RepositoryError> {
        match self.state().live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, RepositoryError> {
        let mut members: Vec<(String, f64)> = match self.state().live(key) {
            None => return Ok(Vec::new()),
            Some(Entry {
                value: Value::Sorted(zset),
                ..
            }) => zset.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            Some(_) => return Err(wrong_type(key)),
        };
        // Highest score first, ties in reverse lexicographic order.
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(members
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(m, _)| m)
            .collect())
    }

    async fn sorted_card(&self, key: &str) -> Result<u64, RepositoryError> {
        match self.state().live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(zset),
                ..
            }) => Ok(zset.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_remove_below(&self, key: &str, max: f64) -> Result<u64, RepositoryError> {
        let mut state = self.state();
        state.purge(key);
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(0);
        };
        let Value::Sorted(zset) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let before = zset.len();
        zset.retain(|_, score| *score >= max);
        let removed = (before - zset.len()) as u64;
        if zset.is_empty() {
            state.entries.remove(key);
        }
        if removed > 0 {
            state.bump(key);
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn put(key: &str, field: &str, value: &str) -> WriteOp {
        WriteOp::PutRecord {
            key: key.to_string(),
            fields: vec![(field.to_string(), value.to_string())],
        }
    }

    #[tokio::test]
    async fn test_put_and_get_merges_fields() {
        let backend = MemoryTaskBackend::new();
        backend
            .exec_atomic(vec![put("k", "a", "1"), put("k", "b", "2")])
            .await
            .unwrap();
        let record = backend.get("k").await.unwrap().unwrap();
        assert_eq!(record["a"], "1");
        assert_eq!(record["b"], "2");
        assert!(backend.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watched_commit_rejected_after_foreign_write() {
        let backend = MemoryTaskBackend::new();
        backend.exec_atomic(vec![put("k", "v", "1")]).await.unwrap();

        let (token, snapshot) = backend.watch("k").await.unwrap();
        assert_eq!(snapshot.unwrap()["v"], "1");
        backend.exec_atomic(vec![put("k", "v", "2")]).await.unwrap();

        let committed = backend
            .commit_watched(token, vec![put("k", "v", "3")])
            .await
            .unwrap();
        assert!(!committed);
        assert_eq!(backend.get("k").await.unwrap().unwrap()["v"], "2");
    }

    #[tokio::test]
    async fn test_touch_invalidates_watch_on_missing_key() {
        let backend = MemoryTaskBackend::new();
        let (token, snapshot) = backend.watch("k").await.unwrap();
        assert!(snapshot.is_none());
        backend.touch("k");

        assert!(!backend.commit_watched(token, vec![put("k", "v", "1")]).await.unwrap());
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watched_commit_succeeds_when_untouched() {
        let backend = MemoryTaskBackend::new();
        let (token, snapshot) = backend.watch("k").await.unwrap();
        assert!(snapshot.is_none());
        assert!(backend.commit_watched(token, vec![put("k", "v", "1")]).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_is_rolled_back() {
        let backend = MemoryTaskBackend::new();
        backend
            .exec_atomic(vec![WriteOp::SetAdd {
                key: "s".to_string(),
                member: "x".to_string(),
            }])
            .await
            .unwrap();

        let err = backend
            .exec_atomic(vec![put("k", "v", "1"), put("s", "v", "1")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUERY_FAILED");
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sorted_range_and_remove_below() {
        let backend = MemoryTaskBackend::new();
        let ops = [("a", 1.0), ("b", 3.0), ("c", 2.0)]
            .into_iter()
            .map(|(m, s)| WriteOp::SortedAdd {
                key: "z".to_string(),
                member: m.to_string(),
                score: s,
            })
            .collect();
        backend.exec_atomic(ops).await.unwrap();

        assert_eq!(backend.sorted_range_desc("z", 0, 10).await.unwrap(), vec!["b", "c", "a"]);
        assert_eq!(backend.sorted_range_desc("z", 1, 1).await.unwrap(), vec!["c"]);
        assert_eq!(backend.sorted_remove_below("z", 2.0).await.unwrap(), 1);
        assert_eq!(backend.sorted_card("z").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_disappears() {
        let backend = MemoryTaskBackend::new();
        backend
            .exec_atomic(vec![
                put("k", "v", "1"),
                WriteOp::Expire {
                    key: "k".to_string(),
                    ttl: Duration::from_secs(5),
                },
            ])
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get("k").await.unwrap().is_none());
    }
}

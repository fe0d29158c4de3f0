//! Redis-backed [`TaskBackend`].
//!
//! Records are Redis hashes, indices are sets and sorted sets. Plain reads and
//! unwatched writes share one [`MultiplexedConnection`]. Every `watch` opens a
//! dedicated connection, because `WATCH` state is per connection and must not
//! leak onto commands issued by other callers. The commit is a `MULTI/EXEC`
//! pipeline on that connection; a nil `EXEC` reply means a watched key was
//! written in the meantime and the commit was rejected.
//!
//! This backend is a thin adapter with no domain logic. Key schema,
//! versioning and retries live in [`TaskStore`](nexus_core::store::TaskStore).

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Pipeline, RedisError};

use nexus_core::store::{StoredRecord, TaskBackend, WriteOp};
use nexus_types::error::RepositoryError;

/// A watch held open on its own connection until commit.
pub struct RedisWatch {
    conn: MultiplexedConnection,
    key: String,
}

/// Redis implementation of the task backing store.
#[derive(Clone)]
pub struct RedisTaskBackend {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisTaskBackend {
    /// Connect to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// Fails fast if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, RepositoryError> {
        let client = Client::open(url)
            .map_err(|e| RepositoryError::Connection(format!("invalid Redis URL {url}: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RepositoryError::Connection(format!("failed to connect to Redis: {e}")))?;
        tracing::info!(url, "connected to redis");
        Ok(Self { client, conn })
    }
}

impl std::fmt::Debug for RedisTaskBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskBackend").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Connection-level failures map to `Connection`, everything else to `Query`.
fn map_redis_error(err: RedisError, context: &str) -> RepositoryError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
        RepositoryError::Connection(format!("{context}: {err}"))
    } else {
        RepositoryError::Query(format!("{context}: {err}"))
    }
}

/// Queue `ops` onto `pipe`, ignoring every reply.
fn push_ops(pipe: &mut Pipeline, ops: &[WriteOp]) {
    for op in ops {
        match op {
            WriteOp::PutRecord { key, fields } => {
                let cmd = pipe.cmd("HSET").arg(key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
            }
            WriteOp::DeleteKey { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            WriteOp::SetAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member).ignore();
            }
            WriteOp::SetRemove { key, member } => {
                pipe.cmd("SREM").arg(key).arg(member).ignore();
            }
            WriteOp::SortedAdd { key, member, score } => {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
            }
            WriteOp::SortedRemove { key, member } => {
                pipe.cmd("ZREM").arg(key).arg(member).ignore();
            }
            WriteOp::Expire { key, ttl } => {
                let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
                pipe.cmd("PEXPIRE").arg(key).arg(ms).ignore();
            }
        }
    }
}

fn non_empty(record: StoredRecord) -> Option<StoredRecord> {
    (!record.is_empty()).then_some(record)
}

// ---------------------------------------------------------------------------
// TaskBackend implementation
// ---------------------------------------------------------------------------

impl TaskBackend for RedisTaskBackend {
    type WatchToken = RedisWatch;

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, RepositoryError> {
        let mut conn = self.conn.clone();
        let record: StoredRecord = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(non_empty(record))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredRecord>>, RepositoryError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = ::redis::pipe();
        for key in keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let mut conn = self.conn.clone();
        let records: Vec<StoredRecord> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "HGETALL batch"))?;
        Ok(records.into_iter().map(non_empty).collect())
    }

    async fn watch(&self, key: &str) -> Result<(RedisWatch, Option<StoredRecord>), RepositoryError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error(e, "open watch connection"))?;
        ::redis::cmd("WATCH")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        let record: StoredRecord = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        let token = RedisWatch {
            conn,
            key: key.to_string(),
        };
        Ok((token, non_empty(record)))
    }

    async fn commit_watched(&self, token: RedisWatch, ops: Vec<WriteOp>) -> Result<bool, RepositoryError> {
        let RedisWatch { mut conn, key } = token;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        push_ops(&mut pipe, &ops);
        // EXEC replies nil when a watched key changed.
        let reply: Option<()> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, &key))?;
        if reply.is_none() {
            tracing::debug!(key = %key, "watched commit rejected");
        }
        Ok(reply.is_some())
    }

    async fn exec_atomic(&self, ops: Vec<WriteOp>) -> Result<(), RepositoryError> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        push_ops(&mut pipe, &ops);
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "MULTI/EXEC"))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, RepositoryError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn sorted_range_desc(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = offset.saturating_add(limit) - 1;
        let mut conn = self.conn.clone();
        ::redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(offset)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn sorted_card(&self, key: &str) -> Result<u64, RepositoryError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn sorted_remove_below(&self, key: &str, max: f64) -> Result<u64, RepositoryError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({max}"))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| map_redis_error(e, "PING"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

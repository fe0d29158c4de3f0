//! Infrastructure layer for Nexus.
//!
//! Contains implementations of the ports defined in `nexus-core`: the Redis
//! task backend (WATCH/MULTI/EXEC optimistic locking), HTTP service clients,
//! and the TOML configuration loader.

pub mod config;
pub mod http;
pub mod redis;

//! Shared domain types for the Nexus orchestrator.
//!
//! This crate contains the types exchanged between the task store, the
//! workflow planner and the workflow executor: tasks, workflow plans and
//! results, progress events, service dispatch envelopes, configuration and
//! the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod service;
pub mod task;
pub mod workflow;

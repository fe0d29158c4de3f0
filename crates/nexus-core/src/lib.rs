//! Business logic and port definitions for the Nexus orchestrator.
//!
//! This crate defines the "ports" (backing store, service clients, planning
//! collaborator, progress sink) that the infrastructure layer implements, and
//! the logic built on top of them: the optimistic-locking task store, the
//! workflow planner and the wave-based DAG executor. It depends only on
//! `nexus-types` -- never on `nexus-infra` or any network crate.

pub mod delay;
pub mod service;
pub mod store;
pub mod workflow;

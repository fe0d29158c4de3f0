//! Task persistence: the backing-store port, an in-memory backend and the
//! optimistic-locking [`TaskStore`] built on top of them.

pub mod backend;
pub mod memory;
pub mod task_store;

pub use backend::{StoredRecord, TaskBackend, WriteOp};
pub use memory::MemoryTaskBackend;
pub use task_store::{TaskStore, TaskStoreError};

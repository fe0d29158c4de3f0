//! Service dispatch abstractions.
//!
//! - `ServiceClient`: RPITIT trait for concrete service clients
//! - `BoxServiceClient`: Object-safe wrapper for dynamic dispatch
//! - `ServiceRegistry`: closed `ServiceId` -> client map used by the executor

pub mod box_client;
pub mod client;
pub mod registry;

pub use box_client::BoxServiceClient;
pub use client::{ExecuteOptions, ServiceClient};
pub use registry::ServiceRegistry;

//! VSA Orchestrator Library
//!
//! Drives backup and restore jobs against virtualization platforms through a
//! hypervisor SDK, then validates disk filtering, CBT chains and restored
//! content.

pub mod cbt;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod filter;
pub mod inventory;
pub mod model;
pub mod monitor;
pub mod sdk;
pub mod sim;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use dispatch::{DispatchTable, HypervisorAdapter, Platform};
pub use engine::{BackupReport, Collaborators, Engine, RestoreReport};
pub use filter::DiskFilterResolver;
pub use monitor::{JobHandle, JobMonitor, PendingHandler};
pub use utils::errors::{EngineError, Result};

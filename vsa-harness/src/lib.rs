//! Scenario harness for the VSA orchestration engine.
//!
//! Persists CBT change records and synthetic-full job links in SQLite and
//! replays TOML scenarios against the simulated hypervisor.

pub mod config;
pub mod db;
pub mod models;
pub mod scenario;
pub mod store;

pub use scenario::{Scenario, ScenarioReport, ScenarioRunner};
pub use store::SqliteStore;

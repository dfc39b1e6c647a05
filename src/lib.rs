//! # Keyferry
//!
//! A batched, resumable key-space transfer engine for Redis-protocol stores.
//! Copies or reshards whole databases between live servers in bounded runs,
//! checkpointing progress inside the source stores themselves so an
//! interrupted job resumes exactly where it left off on the next invocation.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | RESP2 frame parsing and command encoding |
//! | [`client`] | Typed connection and per-endpoint pooling |
//! | [`endpoint`] | Addresses, endpoints, and source identities |
//! | [`config`] | Job configuration and validation |
//! | [`state`] | Reserved-key schema, run lock, first-run flag |
//! | [`snapshot`] | Frozen per-source key lists |
//! | [`checkpoint`] | Monotonic per-source transfer counters |
//! | [`placement`] | Direct and CRC-32 sharded key routing |
//! | [`transfer`] | Type-dispatched per-key value transfer |
//! | [`orchestrator`] | Locked, batched, parallel run driver |
//! | [`progress`] | Shared run counters and throughput reporting |

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod placement;
pub mod progress;
pub mod protocol;
pub mod snapshot;
pub mod state;
pub mod transfer;

pub use config::{JobConfig, PlacementSpec, DEFAULT_BATCH_SIZE, DEFAULT_PARALLELISM};
pub use endpoint::{Address, Endpoint};
pub use error::{MigrateError, Result};
pub use orchestrator::{JobStatus, RunReport, SourceOutcome, TransferOrchestrator};

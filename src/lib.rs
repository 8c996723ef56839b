//! # CradleKV
//!
//! A range-partitioned, distributed key-value node with:
//! - A versioned directory partitioning the keyspace between routers
//! - Request routing with hop-bounded forwarding between hosts
//! - Router split and merge with gated, loss-free record migration
//! - A per-host cradle that owns routers, their stores and caches
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Clients / Peer Hosts (framed TCP)               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  Connection Manager                          │
//! │      (accept, triage by directory, relay to peers)           │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ local owner                      │ remote owner
//!            ▼                                  ▼
//!   ┌─────────────────┐                 ┌───────────────┐
//!   │  Router (r1..n) │                 │ Peer Host     │
//!   │  gate + workers │                 │ (hop + 1)     │
//!   └───┬─────────┬───┘                 └───────────────┘
//!       │         │
//!       ▼         ▼
//!  ┌────────┐ ┌────────┐        ┌──────────────────────────────┐
//!  │ Cache  │ │ Store  │◀───────│ Cradle: create/delete/split/ │
//!  └────────┘ └────────┘        │ merge, publishes Directory   │
//!                               └──────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod keyspace;
pub mod protocol;
pub mod storage;
pub mod cache;
pub mod monitor;
pub mod maintain;
pub mod router;
pub mod network;
pub mod cradle;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CradleError, Result};
pub use config::{Config, NodeConfig, StorageKind, SyncStrategy};
pub use cradle::{Collaborators, Cradle};
pub use keyspace::{Directory, KeyRange, Owner};
pub use network::Client;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CradleKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

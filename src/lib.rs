//! # ringkv
//!
//! Client routing and cluster coordination for a partitioned, read-mostly
//! key-value serving platform:
//! - A coordination store with ephemeral, sequential and watched nodes
//! - The cluster metadata model: domains, domain groups, ring groups, rings
//!   and hosts, the host command queue and the ring-group rollout protocol
//! - Host connection pools with tiered selection and bounded retries
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Coordination store           │
//! │  /domains  /domain_groups  /ring_groups  │
//! └───────────┬──────────────────────────────┘
//!             │ watches
//!   ┌─────────┴──────────┐
//!   │                    │
//! ┌─▼──────────┐   ┌─────▼──────────────────┐
//! │ Coordinator│   │ PartitionRouter        │
//! │ (admin)    │   │  pool per (domain, p)  │
//! └────────────┘   │  ├─ host a: conn, conn │
//!                  │  └─ host b: conn       │
//!                  └────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Define a domain and a domain group serving version 0 of it
//! ringkv-admin domain add users --partitions 32
//! ringkv-admin domain open-version users
//! ringkv-admin domain-group add search
//! ringkv-admin domain-group add-version search users=0
//!
//! # Lay out a ring group
//! ringkv-admin ring-group add prod --domain-group search
//! ringkv-admin ring add prod 0
//! ringkv-admin host add prod 0 host-1:12345
//! ringkv-admin ring redistribute prod 0
//! ringkv-admin ring command-all prod 0 SERVE_DATA
//! ```

pub mod client;
pub mod common;
pub mod coordinator;
pub mod store;

// Re-export commonly used types
pub use client::{HostConnection, HostConnectionPool, PartitionRouter, QueryError};
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use store::CoordinationStore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

//! aoide-link-core: Client core for the aoide music library backend
//!
//! This crate launches the `aoide-websrv` backend as a child process, talks
//! to it over HTTP/JSON through a dedicated worker thread, and keeps the
//! client-side state (collections, paginated search results, session play
//! history) consistent with it.
//!
//! # Architecture
//!
//! ```text
//! ProcessSupervisor ──spawn──► aoide-websrv ──handshake (stdout)──┐
//!        │                          ▲                             │
//!        │ owns                     │ HTTP/JSON                   ▼
//!        ▼                          │                     Connector::connect
//!   Gateway worker ◄── Task ── GatewayHandle ◄── Subsystem ◄── caller
//!        │                                          ▲
//!        └────────── TaskCompletion ────────────────┘
//!                                          CollectionRegistry
//!                                          PaginatedResultCache
//! ```
//!
//! # Modules
//!
//! - `error`: Error types with remediation hints
//! - `logging`: tracing setup and backend log forwarding
//! - `config`: Settings file and persisted client state
//! - `query`: Track queries, overlay filter and pagination
//! - `api`: Request catalogue of the backend's HTTP API
//! - `transport`: HTTP exchange (`reqwest`) behind a trait
//! - `task`: Task ids, outcomes and write bookkeeping
//! - `gateway`: Worker thread executing tasks, write barrier for shutdown
//! - `supervisor`: Backend process lifecycle
//! - `collection`: Known collections and the active selection
//! - `result_cache`: Paginated search result cache
//! - `session_cache`: Session play history
//! - `subsystem`: Control domain tying everything together
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod api;
pub mod collection;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod query;
pub mod result_cache;
pub mod session_cache;
pub mod subsystem;
pub mod supervisor;
pub mod task;
pub mod transport;

pub use error::{Error, Result};
pub use subsystem::{ConnectionState, Subsystem, SubsystemEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

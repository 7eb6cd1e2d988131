//! Stateful NAT64 core (RFC 6146) for IPv6-only networks reaching the
//! IPv4 Internet.
//!
//! This crate implements the filtering-and-updating half of a NAT64
//! translator: per-flow state, IPv4 transport-address allocation, TCP
//! connection tracking, and idle-timeout garbage collection. Header
//! rewriting and checksum work stay with the packet hook that feeds
//! tuples in.
//!
//! # Architecture
//!
//! ```text
//! IPv6 Client                 NAT64 Translator                IPv4 Peer
//!     │                             │                             │
//!     │  to 64:ff9b::198.51.100.7   │                             │
//!     ├────────────────────────────>│  BIB: [v6]:port ↔ v4:port   │
//!     │                             │  Session: 5-tuple, expiry   │
//!     │                             ├────────────────────────────>│
//!     │                             │                             │
//!     │                             │<────────────────────────────┤
//!     │<────────────────────────────┤  accepted only while a      │
//!     │                             │  session authorizes it      │
//! ```
//!
//! The hook calls [`Nat64Engine::process`] with each parsed tuple and gets
//! an accept/drop verdict; on accept it rewrites headers using the
//! binding lookups. A periodic sweeper ([`Nat64Engine::run_sweeper`])
//! reclaims idle sessions and returns ports to the pool.
//!
//! # Protocol Support
//!
//! - TCP: connection tracking per the RFC 6146 state machine
//! - UDP: session tracking with configurable timeout
//! - ICMP: Echo flows, tracked by Echo identifier

pub mod config;
pub mod error;
pub mod prefix;
pub mod stateful;
pub mod stats;
pub mod types;

pub(crate) mod clock;

// Re-exports for convenience
pub use config::{Nat64Config, Timeouts};
pub use error::{Nat64Error, Nat64Result};
pub use prefix::Nat64Prefix;
pub use stateful::{Nat64Engine, SweepStats};
pub use stats::{Nat64Stats, Nat64StatsSnapshot};
pub use types::{
    Direction, ExpiryClass, Flow, FlowV4, FlowV6, L4Proto, TcpFlags, TcpState, TransportAddr4,
    TransportAddr6, Verdict,
};

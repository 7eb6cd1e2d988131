//! Error types for the NAT64 core.

use thiserror::Error;

/// Result type alias for NAT64 operations.
pub type Nat64Result<T> = Result<T, Nat64Error>;

/// NAT64-specific errors.
///
/// Data-plane failures (`PoolExhausted`, `NoBinding`) never escape the
/// filtering entry point; they turn into a `Drop` verdict plus a counter
/// bump. The remaining variants surface synchronously from the
/// configuration surface.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Nat64Error {
    /// No IPv4 transport address is available for a new binding.
    #[error("IPv4 transport-address pool exhausted")]
    PoolExhausted,

    /// Inbound IPv4 traffic with no matching binding (stateful filtering).
    #[error("no binding for inbound IPv4 packet")]
    NoBinding,

    /// A pool address was not registered.
    #[error("address is not registered in the pool")]
    NotFound,

    /// A pool address is already registered.
    #[error("address is already registered in the pool")]
    AlreadyPresent,

    /// A pool address is registered in only some of the per-protocol pools.
    #[error("address registered in {present_in} of {expected} protocol pools")]
    Inconsistent { present_in: usize, expected: usize },

    /// Invalid timeout, prefix, or pool parameter.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Nat64Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

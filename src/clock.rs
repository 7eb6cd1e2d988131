//! Time abstraction for testable expiry behavior.
//!
//! Session deadlines are absolute monotonic instants. In production this is
//! `std::time::Instant`; under `cfg(test)` it is `mock_instant::Instant`,
//! which tests advance via `MockClock` to exercise timeout and sweep
//! behavior without sleeping.

// In tests, use mock_instant for time control
#[cfg(test)]
pub use mock_instant::Instant;

// In production, use standard library Instant
#[cfg(not(test))]
pub use std::time::Instant;

// Re-export MockClock for tests
#[cfg(test)]
pub use mock_instant::MockClock;

//! Translator counters.
//!
//! Atomic counters bumped from the packet path with relaxed ordering to
//! keep overhead out of the hot path. Every `Drop` verdict is attributed to
//! exactly one of the `dropped_*` counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the filtering entry point and the expiry sweeper.
#[derive(Debug, Default)]
pub struct Nat64Stats {
    /// IPv6-ingress packets accepted for translation.
    pub accepted_v6: AtomicU64,
    /// IPv4-ingress packets accepted for translation.
    pub accepted_v4: AtomicU64,
    /// IPv4-ingress packets with no binding (expected; inbound filtering).
    pub dropped_no_binding: AtomicU64,
    /// IPv6-ingress packets dropped because the pool had no free port.
    pub dropped_pool_exhausted: AtomicU64,
    /// IPv6-ingress packets whose destination is outside the prefix.
    pub dropped_untranslatable: AtomicU64,
    /// IPv4-ingress packets that reached a binding but no session.
    pub dropped_no_session: AtomicU64,
    /// Sessions created (both directions).
    pub sessions_created: AtomicU64,
    /// Sessions reclaimed by the expiry sweeper.
    pub sessions_expired: AtomicU64,
    /// Bindings created.
    pub bibs_created: AtomicU64,
    /// Bindings destroyed after their last session expired.
    pub bibs_reclaimed: AtomicU64,
}

impl Nat64Stats {
    /// Create a new stats instance with all counters zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> Nat64StatsSnapshot {
        Nat64StatsSnapshot {
            accepted_v6: self.accepted_v6.load(Ordering::Relaxed),
            accepted_v4: self.accepted_v4.load(Ordering::Relaxed),
            dropped_no_binding: self.dropped_no_binding.load(Ordering::Relaxed),
            dropped_pool_exhausted: self.dropped_pool_exhausted.load(Ordering::Relaxed),
            dropped_untranslatable: self.dropped_untranslatable.load(Ordering::Relaxed),
            dropped_no_session: self.dropped_no_session.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            bibs_created: self.bibs_created.load(Ordering::Relaxed),
            bibs_reclaimed: self.bibs_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`Nat64Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nat64StatsSnapshot {
    pub accepted_v6: u64,
    pub accepted_v4: u64,
    pub dropped_no_binding: u64,
    pub dropped_pool_exhausted: u64,
    pub dropped_untranslatable: u64,
    pub dropped_no_session: u64,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub bibs_created: u64,
    pub bibs_reclaimed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let stats = Nat64Stats::new();
        stats.accepted_v6.fetch_add(3, Ordering::Relaxed);
        stats.dropped_no_binding.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted_v6, 3);
        assert_eq!(snap.dropped_no_binding, 1);
        assert_eq!(snap.accepted_v4, 0);
    }
}

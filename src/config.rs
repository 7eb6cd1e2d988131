//! Translator configuration types.

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::error::{Nat64Error, Nat64Result};
use crate::prefix::Nat64Prefix;
use crate::types::ExpiryClass;

/// Default UDP session lifetime (RFC 6146: 5 minutes minimum).
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 5 * 60;

/// Default ICMP Echo session lifetime.
pub const DEFAULT_ICMP_TIMEOUT_SECS: u64 = 60;

/// Default established-TCP lifetime (RFC 6146: 2 hours 4 minutes).
pub const DEFAULT_TCP_EST_TIMEOUT_SECS: u64 = 2 * 60 * 60 + 4 * 60;

/// Default transitory-TCP lifetime.
pub const DEFAULT_TCP_TRANS_TIMEOUT_SECS: u64 = 4 * 60;

/// Default grace window for an inbound SYN with no IPv6-side state.
pub const DEFAULT_TCP_INCOMING_SYN_TIMEOUT_SECS: u64 = 6;

/// Default expiry-sweep cadence.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 2;

/// Stateful NAT64 configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nat64Config {
    /// Translation prefix embedding IPv4 destinations (RFC 6052).
    /// Length must be one of 32, 40, 48, 56, 64 or 96.
    #[serde(default = "default_prefix")]
    pub prefix: Ipv6Net,

    /// IPv4 addresses whose ports the translator may borrow for bindings.
    /// More can be added (and removed) at runtime.
    #[serde(default)]
    pub pool4: Vec<Ipv4Addr>,

    /// UDP session idle timeout.
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,

    /// ICMP Echo session idle timeout.
    #[serde(default = "default_icmp_timeout_secs")]
    pub icmp_timeout_secs: u64,

    /// Established-TCP session idle timeout.
    #[serde(default = "default_tcp_est_timeout_secs")]
    pub tcp_est_timeout_secs: u64,

    /// Transitory-TCP session idle timeout.
    #[serde(default = "default_tcp_trans_timeout_secs")]
    pub tcp_trans_timeout_secs: u64,

    /// Lifetime of a session created by an inbound SYN with no prior
    /// IPv6-side state (simultaneous-open window).
    #[serde(default = "default_tcp_incoming_syn_timeout_secs")]
    pub tcp_incoming_syn_timeout_secs: u64,

    /// Cadence of the expiry sweeper. Must not exceed the shortest timeout
    /// so stale entries are reclaimed in bounded time.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for Nat64Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            pool4: Vec::new(),
            udp_timeout_secs: default_udp_timeout_secs(),
            icmp_timeout_secs: default_icmp_timeout_secs(),
            tcp_est_timeout_secs: default_tcp_est_timeout_secs(),
            tcp_trans_timeout_secs: default_tcp_trans_timeout_secs(),
            tcp_incoming_syn_timeout_secs: default_tcp_incoming_syn_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Nat64Config {
    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the prefix length is not an RFC 6052 one
    /// - any timeout is zero
    /// - the sweep interval is zero or longer than the shortest timeout
    pub fn validate(&self) -> Nat64Result<()> {
        Nat64Prefix::new(self.prefix)?;

        let timeouts = [
            ("udp_timeout_secs", self.udp_timeout_secs),
            ("icmp_timeout_secs", self.icmp_timeout_secs),
            ("tcp_est_timeout_secs", self.tcp_est_timeout_secs),
            ("tcp_trans_timeout_secs", self.tcp_trans_timeout_secs),
            (
                "tcp_incoming_syn_timeout_secs",
                self.tcp_incoming_syn_timeout_secs,
            ),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Nat64Error::config(format!("'{name}' must be nonzero")));
            }
        }

        let shortest = timeouts
            .iter()
            .map(|&(_, v)| v)
            .min()
            .expect("timeout list is nonempty");
        if self.sweep_interval_secs == 0 || self.sweep_interval_secs > shortest {
            return Err(Nat64Error::config(format!(
                "'sweep_interval_secs' must be between 1 and the shortest timeout ({shortest}s)"
            )));
        }

        Ok(())
    }

    /// The timeout table this configuration describes.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            udp: Duration::from_secs(self.udp_timeout_secs),
            icmp: Duration::from_secs(self.icmp_timeout_secs),
            tcp_est: Duration::from_secs(self.tcp_est_timeout_secs),
            tcp_trans: Duration::from_secs(self.tcp_trans_timeout_secs),
            tcp_incoming_syn: Duration::from_secs(self.tcp_incoming_syn_timeout_secs),
        }
    }

    /// The sweep cadence as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Per-class session lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub udp: Duration,
    pub icmp: Duration,
    pub tcp_est: Duration,
    pub tcp_trans: Duration,
    pub tcp_incoming_syn: Duration,
}

impl Timeouts {
    /// The lifetime granted to a session renewed into `class`.
    pub fn for_class(&self, class: ExpiryClass) -> Duration {
        match class {
            ExpiryClass::Udp => self.udp,
            ExpiryClass::Icmp => self.icmp,
            ExpiryClass::TcpEst => self.tcp_est,
            ExpiryClass::TcpTrans => self.tcp_trans,
            ExpiryClass::TcpIncomingSyn => self.tcp_incoming_syn,
        }
    }

    /// The shortest lifetime of any class.
    pub fn shortest(&self) -> Duration {
        self.udp
            .min(self.icmp)
            .min(self.tcp_est)
            .min(self.tcp_trans)
            .min(self.tcp_incoming_syn)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Nat64Config::default().timeouts()
    }
}

// Default value functions for serde
fn default_prefix() -> Ipv6Net {
    let addr = Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0);
    Ipv6Net::new(addr, 96).expect("96 is a valid IPv6 prefix length")
}

fn default_udp_timeout_secs() -> u64 {
    DEFAULT_UDP_TIMEOUT_SECS
}

fn default_icmp_timeout_secs() -> u64 {
    DEFAULT_ICMP_TIMEOUT_SECS
}

fn default_tcp_est_timeout_secs() -> u64 {
    DEFAULT_TCP_EST_TIMEOUT_SECS
}

fn default_tcp_trans_timeout_secs() -> u64 {
    DEFAULT_TCP_TRANS_TIMEOUT_SECS
}

fn default_tcp_incoming_syn_timeout_secs() -> u64 {
    DEFAULT_TCP_INCOMING_SYN_TIMEOUT_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Nat64Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefix.to_string(), "64:ff9b::/96");
        assert_eq!(config.tcp_est_timeout_secs, 7440);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Nat64Config {
            udp_timeout_secs: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Nat64Error::Config(_)));
    }

    #[test]
    fn test_sweep_interval_bounded_by_shortest_timeout() {
        // Default shortest timeout is the 6 s incoming-SYN window.
        let config = Nat64Config {
            sweep_interval_secs: 7,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Nat64Config {
            sweep_interval_secs: 6,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_prefix_length_rejected() {
        let config = Nat64Config {
            prefix: "2001:db8::/72".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_for_class() {
        let t = Nat64Config::default().timeouts();
        assert_eq!(t.for_class(ExpiryClass::Udp), Duration::from_secs(300));
        assert_eq!(t.for_class(ExpiryClass::TcpEst), Duration::from_secs(7440));
        assert_eq!(
            t.for_class(ExpiryClass::TcpIncomingSyn),
            Duration::from_secs(6)
        );
        assert_eq!(t.shortest(), Duration::from_secs(6));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Nat64Config = serde_json::from_str(r#"{"pool4": ["203.0.113.5"]}"#).unwrap();
        assert_eq!(config.pool4, vec![Ipv4Addr::new(203, 0, 113, 5)]);
        assert_eq!(config.udp_timeout_secs, DEFAULT_UDP_TIMEOUT_SECS);
        assert!(config.validate().is_ok());
    }
}

//! IPv4-embedded IPv6 addresses (RFC 6052).
//!
//! The translator reaches IPv4 destinations through an IPv6 prefix that
//! embeds the 32-bit IPv4 address at a position determined by the prefix
//! length. For the well-known `64:ff9b::/96` the IPv4 address occupies the
//! last 32 bits; for `/32` through `/64` it straddles the `u` octet (bits
//! 64..71), which stays zero and carries no address bits.

use ipnet::Ipv6Net;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Nat64Error, Nat64Result};

/// A validated NAT64 translation prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix {
    net: Ipv6Net,
}

impl Nat64Prefix {
    /// Wrap a prefix, checking that its length is one the embedding scheme
    /// defines (32, 40, 48, 56, 64 or 96).
    pub fn new(net: Ipv6Net) -> Nat64Result<Self> {
        match net.prefix_len() {
            32 | 40 | 48 | 56 | 64 | 96 => Ok(Self { net: net.trunc() }),
            other => Err(Nat64Error::config(format!(
                "unsupported NAT64 prefix length /{other} (expected 32, 40, 48, 56, 64 or 96)"
            ))),
        }
    }

    /// The well-known prefix `64:ff9b::/96`.
    pub fn well_known() -> Self {
        let addr = Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0);
        let net = Ipv6Net::new(addr, 96).expect("96 is a valid IPv6 prefix length");
        Self { net }
    }

    /// The underlying network.
    pub fn net(&self) -> Ipv6Net {
        self.net
    }

    /// Whether `addr` falls inside this prefix.
    #[inline]
    pub fn matches(&self, addr: &Ipv6Addr) -> bool {
        self.net.contains(addr)
    }

    /// Embed an IPv4 address into this prefix.
    pub fn embed(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let mut o = self.net.network().octets();
        let v = v4.octets();
        match self.net.prefix_len() {
            32 => o[4..8].copy_from_slice(&v),
            40 => {
                o[5..8].copy_from_slice(&v[..3]);
                o[9] = v[3];
            }
            48 => {
                o[6..8].copy_from_slice(&v[..2]);
                o[9..11].copy_from_slice(&v[2..]);
            }
            56 => {
                o[7] = v[0];
                o[9..12].copy_from_slice(&v[1..]);
            }
            64 => o[9..13].copy_from_slice(&v),
            _ => o[12..16].copy_from_slice(&v), // 96
        }
        Ipv6Addr::from(o)
    }

    /// Extract the embedded IPv4 address.
    ///
    /// Returns `None` when `addr` is not inside this prefix.
    pub fn extract(&self, addr: &Ipv6Addr) -> Option<Ipv4Addr> {
        if !self.matches(addr) {
            return None;
        }
        let o = addr.octets();
        let v = match self.net.prefix_len() {
            32 => [o[4], o[5], o[6], o[7]],
            40 => [o[5], o[6], o[7], o[9]],
            48 => [o[6], o[7], o[9], o[10]],
            56 => [o[7], o[9], o[10], o[11]],
            64 => [o[9], o[10], o[11], o[12]],
            _ => [o[12], o[13], o[14], o[15]], // 96
        };
        Some(Ipv4Addr::from(v))
    }
}

impl Default for Nat64Prefix {
    fn default() -> Self {
        Self::well_known()
    }
}

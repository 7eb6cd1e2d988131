//! Core data-model types shared across the translator.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Transport protocol of a tracked flow.
///
/// ICMP here means ICMP Echo; the Echo identifier plays the role of the
/// port on both sides of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Udp,
    Tcp,
    Icmp,
}

impl L4Proto {
    /// Get the IP protocol number.
    pub fn protocol_number(&self) -> u8 {
        match self {
            L4Proto::Tcp => 6,
            L4Proto::Udp => 17,
            L4Proto::Icmp => 1, // ICMPv4 (translates to/from ICMPv6 = 58)
        }
    }

    /// Create from IPv4 protocol number.
    pub fn from_ipv4_protocol(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(L4Proto::Tcp),
            17 => Some(L4Proto::Udp),
            1 => Some(L4Proto::Icmp),
            _ => None,
        }
    }

    /// Create from IPv6 next header (protocol).
    ///
    /// This assumes `next_header` is the transport protocol and does not
    /// account for IPv6 extension headers.
    pub fn from_ipv6_next_header(next_header: u8) -> Option<Self> {
        match next_header {
            6 => Some(L4Proto::Tcp),
            17 => Some(L4Proto::Udp),
            58 => Some(L4Proto::Icmp), // ICMPv6
            _ => None,
        }
    }
}

/// An IPv6 transport address: address plus port (or ICMP Echo identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl TransportAddr6 {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.port)
    }
}

/// An IPv4 transport address: address plus port (or ICMP Echo identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl TransportAddr4 {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// The TCP flag bits the connection tracker cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    /// No flags set; also what non-TCP flows carry.
    pub const NONE: TcpFlags = TcpFlags {
        syn: false,
        fin: false,
        rst: false,
    };

    pub const SYN: TcpFlags = TcpFlags {
        syn: true,
        fin: false,
        rst: false,
    };

    pub const FIN: TcpFlags = TcpFlags {
        syn: false,
        fin: true,
        rst: false,
    };

    pub const RST: TcpFlags = TcpFlags {
        syn: false,
        fin: false,
        rst: true,
    };

    /// Decode from the TCP header flag byte (byte 13 of the header).
    pub fn from_wire(bits: u8) -> Self {
        Self {
            fin: bits & 0x01 != 0,
            syn: bits & 0x02 != 0,
            rst: bits & 0x04 != 0,
        }
    }
}

/// Which side of the translator a packet entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// IPv6-origin packet (from the IPv6-only network).
    FromV6,
    /// IPv4-origin packet (from the IPv4 Internet).
    FromV4,
}

/// What the hook should do with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Parsed tuple of an IPv6-ingress packet.
#[derive(Debug, Clone, Copy)]
pub struct FlowV6 {
    pub proto: L4Proto,
    pub src: TransportAddr6,
    pub dst: TransportAddr6,
    /// TCP flag bits; `TcpFlags::NONE` for UDP and ICMP.
    pub tcp: TcpFlags,
}

/// Parsed tuple of an IPv4-ingress packet.
#[derive(Debug, Clone, Copy)]
pub struct FlowV4 {
    pub proto: L4Proto,
    pub src: TransportAddr4,
    pub dst: TransportAddr4,
    /// TCP flag bits; `TcpFlags::NONE` for UDP and ICMP.
    pub tcp: TcpFlags,
}

/// A parsed ingress tuple; the address family encodes the direction.
#[derive(Debug, Clone, Copy)]
pub enum Flow {
    V6(FlowV6),
    V4(FlowV4),
}

/// Connection state of a TCP session.
///
/// Non-TCP sessions stay at `Established` for their whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    V6SynRcv,
    V4SynRcv,
    Established,
    /// Transitory state entered on RST or idle demotion; four minutes by
    /// default, hence the original's FOUR_MIN name.
    Trans,
    V6FinRcv,
    V4FinRcv,
    V6FinV4Fin,
}

/// Timeout class of a session, selecting its expiry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryClass {
    Udp,
    TcpTrans,
    TcpEst,
    TcpIncomingSyn,
    Icmp,
}

impl ExpiryClass {
    /// All classes, in queue order.
    pub const ALL: [ExpiryClass; 5] = [
        ExpiryClass::Udp,
        ExpiryClass::TcpTrans,
        ExpiryClass::TcpEst,
        ExpiryClass::TcpIncomingSyn,
        ExpiryClass::Icmp,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            ExpiryClass::Udp => 0,
            ExpiryClass::TcpTrans => 1,
            ExpiryClass::TcpEst => 2,
            ExpiryClass::TcpIncomingSyn => 3,
            ExpiryClass::Icmp => 4,
        }
    }
}

//! The IPv4 transport-address pool.
//!
//! Each registered address carries four independent port sections split by
//! parity and privileged range, so an allocation can preserve both
//! properties of the port that triggered it (RFC 6146). Sections hand out
//! never-used ports from a cursor and recycle returned ports through a FIFO
//! free list, oldest first, to maximize quiet time before a port is reused.
//!
//! The pool is expected to hold few addresses, with the first ones seeing
//! the most traffic, so each per-protocol pool is a plain ordered list.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Nat64Error, Nat64Result};
use crate::types::{L4Proto, TransportAddr4};

/// A range of same-parity ports within an address.
struct PortSection {
    /// Next available never-before-used port.
    next_port: u32,
    /// Highest port this section may hand out.
    max_port: u32,
    /// Previously used ports available again, FIFO.
    free_ports: VecDeque<u16>,
}

impl PortSection {
    fn new(first: u32, last: u32) -> Self {
        Self {
            next_port: first,
            max_port: last,
            free_ports: VecDeque::new(),
        }
    }

    /// Take any free port: oldest returned port first, then the cursor.
    fn pop_any(&mut self) -> Option<u16> {
        if let Some(port) = self.free_ports.pop_front() {
            return Some(port);
        }
        if self.next_port > self.max_port {
            return None;
        }
        let port = self.next_port as u16;
        self.next_port += 2;
        Some(port)
    }

    /// Take exactly `port` if it is still free.
    ///
    /// A claim ahead of the cursor moves the skipped never-used ports onto
    /// the free list so every port below the cursor remains either in use
    /// or on the list.
    fn claim(&mut self, port: u16) -> bool {
        let wanted = u32::from(port);
        if wanted > self.max_port {
            return false;
        }
        if wanted >= self.next_port {
            let mut skipped = self.next_port;
            while skipped < wanted {
                self.free_ports.push_back(skipped as u16);
                skipped += 2;
            }
            self.next_port = wanted + 2;
            return true;
        }
        if let Some(at) = self.free_ports.iter().position(|&p| p == port) {
            self.free_ports.remove(at);
            return true;
        }
        false
    }

    fn give_back(&mut self, port: u16) {
        self.free_ports.push_back(port);
    }
}

/// An address within the pool, along with its four port sections.
struct PoolNode {
    addr: Ipv4Addr,
    /// Odd ports in 1..=1023.
    odd_low: PortSection,
    /// Even ports in 0..=1022.
    even_low: PortSection,
    /// Odd ports in 1025..=65535.
    odd_high: PortSection,
    /// Even ports in 1024..=65534.
    even_high: PortSection,
}

impl PoolNode {
    fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            odd_low: PortSection::new(1, 1023),
            even_low: PortSection::new(0, 1022),
            odd_high: PortSection::new(1025, 65535),
            even_high: PortSection::new(1024, 65534),
        }
    }

    /// The section holding ports of the same parity and range as `port`.
    fn section_mut(&mut self, port: u16) -> &mut PortSection {
        if port < 1024 {
            if port % 2 == 0 {
                &mut self.even_low
            } else {
                &mut self.odd_low
            }
        } else if port % 2 == 0 {
            &mut self.even_high
        } else {
            &mut self.odd_high
        }
    }

    /// Prefer `hint` itself, then any port from `hint`'s section.
    fn take_similar(&mut self, hint: u16) -> Option<u16> {
        let section = self.section_mut(hint);
        if section.claim(hint) {
            return Some(hint);
        }
        section.pop_any()
    }
}

/// The per-protocol IPv4 transport-address pools.
pub struct Pool4 {
    udp: Mutex<Vec<PoolNode>>,
    tcp: Mutex<Vec<PoolNode>>,
    icmp: Mutex<Vec<PoolNode>>,
}

const PROTOCOLS: [L4Proto; 3] = [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp];

fn lock(pool: &Mutex<Vec<PoolNode>>) -> MutexGuard<'_, Vec<PoolNode>> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pool4 {
    pub fn new() -> Self {
        Self {
            udp: Mutex::new(Vec::new()),
            tcp: Mutex::new(Vec::new()),
            icmp: Mutex::new(Vec::new()),
        }
    }

    fn pool(&self, proto: L4Proto) -> &Mutex<Vec<PoolNode>> {
        match proto {
            L4Proto::Udp => &self.udp,
            L4Proto::Tcp => &self.tcp,
            L4Proto::Icmp => &self.icmp,
        }
    }

    /// Add `addr` to all three protocol pools with fresh sections.
    pub fn register(&self, addr: Ipv4Addr) -> Nat64Result<()> {
        for proto in PROTOCOLS {
            if lock(self.pool(proto)).iter().any(|n| n.addr == addr) {
                return Err(Nat64Error::AlreadyPresent);
            }
        }
        for proto in PROTOCOLS {
            lock(self.pool(proto)).push(PoolNode::new(addr));
        }
        log::debug!("pool4: registered {addr}");
        Ok(())
    }

    /// Remove `addr` from all three protocol pools, dropping its sections.
    ///
    /// Ports borrowed from the address stay with their bindings; their
    /// eventual release is logged and ignored.
    pub fn remove(&self, addr: Ipv4Addr) -> Nat64Result<()> {
        let mut removed = 0;
        for proto in PROTOCOLS {
            let mut nodes = lock(self.pool(proto));
            if let Some(at) = nodes.iter().position(|n| n.addr == addr) {
                nodes.remove(at);
                removed += 1;
            }
        }
        match removed {
            0 => Err(Nat64Error::NotFound),
            n if n == PROTOCOLS.len() => {
                log::debug!("pool4: removed {addr}");
                Ok(())
            }
            n => {
                log::warn!(
                    "pool4: {addr} was registered in only {n} of {} protocol pools",
                    PROTOCOLS.len()
                );
                Err(Nat64Error::Inconsistent {
                    present_in: n,
                    expected: PROTOCOLS.len(),
                })
            }
        }
    }

    /// Allocate a port on `hint.addr`, in the same parity/range section as
    /// `hint.port` and preferring `hint.port` itself.
    ///
    /// Returns `None` when the address is unregistered or its section is
    /// exhausted.
    pub fn get_similar(&self, proto: L4Proto, hint: TransportAddr4) -> Option<TransportAddr4> {
        let mut nodes = lock(self.pool(proto));
        let node = match nodes.iter_mut().find(|n| n.addr == hint.addr) {
            Some(node) => node,
            None => {
                log::warn!("pool4: {} does not belong to the pool", hint.addr);
                return None;
            }
        };
        node.take_similar(hint.port)
            .map(|port| TransportAddr4::new(hint.addr, port))
    }

    /// Allocate a port matching `hint_port`'s parity and range from any
    /// registered address, trying addresses in registration order and
    /// preferring `hint_port` itself.
    pub fn get_any(&self, proto: L4Proto, hint_port: u16) -> Option<TransportAddr4> {
        let mut nodes = lock(self.pool(proto));
        if nodes.is_empty() {
            log::warn!("pool4: the IPv4 pool is empty");
            return None;
        }
        for node in nodes.iter_mut() {
            if let Some(port) = node.take_similar(hint_port) {
                return Some(TransportAddr4::new(node.addr, port));
            }
        }
        None
    }

    /// Return a previously allocated port to its section's free list.
    ///
    /// Releasing an address that is no longer registered is logged and
    /// ignored.
    pub fn release(&self, proto: L4Proto, taddr: TransportAddr4) {
        let mut nodes = lock(self.pool(proto));
        match nodes.iter_mut().find(|n| n.addr == taddr.addr) {
            Some(node) => node.section_mut(taddr.port).give_back(taddr.port),
            None => log::warn!("pool4: released {taddr} does not belong to the pool"),
        }
    }

    /// Whether `addr` is registered.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        lock(&self.udp).iter().any(|n| n.addr == addr)
    }

    /// The registered addresses, in registration order.
    pub fn to_vec(&self) -> Vec<Ipv4Addr> {
        lock(&self.udp).iter().map(|n| n.addr).collect()
    }

    /// `(next_port, free list)` of the section owning `port` on `addr`,
    /// for invariant checks.
    #[cfg(test)]
    pub(crate) fn section_state(
        &self,
        proto: L4Proto,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<(u32, Vec<u16>)> {
        let mut nodes = lock(self.pool(proto));
        let node = nodes.iter_mut().find(|n| n.addr == addr)?;
        let section = node.section_mut(port);
        Some((section.next_port, section.free_ports.iter().copied().collect()))
    }
}

impl Default for Pool4 {
    fn default() -> Self {
        Self::new()
    }
}

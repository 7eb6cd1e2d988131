//! The filtering-and-updating entry point.
//!
//! For every ingress tuple the engine looks up (or creates) the binding and
//! session, advances the TCP machine, refreshes the expiry queue, and hands
//! the hook an accept/drop verdict. The hook owns header rewriting; it asks
//! the engine for the bound transport addresses via the lookup methods.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::clock::Instant;
use crate::config::{Nat64Config, Timeouts};
use crate::error::{Nat64Error, Nat64Result};
use crate::prefix::Nat64Prefix;
use crate::stats::Nat64Stats;
use crate::types::{
    Direction, ExpiryClass, Flow, FlowV4, FlowV6, L4Proto, TcpState, TransportAddr4,
    TransportAddr6, Verdict,
};

use super::fsm;
use super::pool4::Pool4;
use super::table::{ProtoTable, SweepStats};

/// The stateful NAT64 core: pool, bindings, sessions, and expiry.
pub struct Nat64Engine {
    prefix: Nat64Prefix,
    pool: Pool4,
    udp: Mutex<ProtoTable>,
    tcp: Mutex<ProtoTable>,
    icmp: Mutex<ProtoTable>,
    timeouts: RwLock<Timeouts>,
    sweep_interval: Duration,
    stats: Nat64Stats,
}

fn lock_table(table: &Mutex<ProtoTable>) -> MutexGuard<'_, ProtoTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn initial_class(proto: L4Proto) -> ExpiryClass {
    match proto {
        L4Proto::Udp => ExpiryClass::Udp,
        L4Proto::Icmp => ExpiryClass::Icmp,
        L4Proto::Tcp => ExpiryClass::TcpTrans,
    }
}

impl Nat64Engine {
    /// Build an engine from a validated configuration.
    pub fn new(config: &Nat64Config) -> Nat64Result<Self> {
        config.validate()?;
        let prefix = Nat64Prefix::new(config.prefix)?;
        let pool = Pool4::new();
        for &addr in &config.pool4 {
            pool.register(addr)?;
        }
        Ok(Self {
            prefix,
            pool,
            udp: Mutex::new(ProtoTable::new(L4Proto::Udp)),
            tcp: Mutex::new(ProtoTable::new(L4Proto::Tcp)),
            icmp: Mutex::new(ProtoTable::new(L4Proto::Icmp)),
            timeouts: RwLock::new(config.timeouts()),
            sweep_interval: config.sweep_interval(),
            stats: Nat64Stats::new(),
        })
    }

    /// The translation prefix in use.
    pub fn prefix(&self) -> Nat64Prefix {
        self.prefix
    }

    /// Counters.
    pub fn stats(&self) -> &Nat64Stats {
        &self.stats
    }

    fn table(&self, proto: L4Proto) -> &Mutex<ProtoTable> {
        match proto {
            L4Proto::Udp => &self.udp,
            L4Proto::Tcp => &self.tcp,
            L4Proto::Icmp => &self.icmp,
        }
    }

    fn current_timeouts(&self) -> Timeouts {
        *self.timeouts.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide the fate of one ingress packet.
    pub fn process(&self, flow: &Flow) -> Verdict {
        match flow {
            Flow::V6(f) => self.process_v6(f),
            Flow::V4(f) => self.process_v4(f),
        }
    }

    /// IPv6 ingress: create the binding and session as needed, then accept.
    pub fn process_v6(&self, flow: &FlowV6) -> Verdict {
        let remote4_addr = match self.prefix.extract(&flow.dst.addr) {
            Some(addr) => addr,
            None => {
                log::debug!("[filter] {} is outside the translation prefix", flow.dst);
                self.stats.dropped_untranslatable.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };
        let remote4 = TransportAddr4::new(remote4_addr, flow.dst.port);
        let timeouts = self.current_timeouts();
        let now = Instant::now();
        let mut table = lock_table(self.table(flow.proto));

        let bib = match table.bib_by_remote(&flow.src) {
            Some(id) => id,
            None => {
                let local4 = match self.pool.get_any(flow.proto, flow.src.port) {
                    Some(local4) => local4,
                    None => {
                        log::debug!("[filter] no IPv4 transport address left for {}", flow.src);
                        self.stats
                            .dropped_pool_exhausted
                            .fetch_add(1, Ordering::Relaxed);
                        return Verdict::Drop;
                    }
                };
                self.stats.bibs_created.fetch_add(1, Ordering::Relaxed);
                table.insert_bib(flow.src, local4)
            }
        };

        // Key the lookup on the extracted IPv4 peer: destinations that
        // differ only in the excised u octet are the same flow.
        let session = match table.find_session(bib, remote4) {
            Some(id) => id,
            None => {
                self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                table.create_session(bib, flow.dst, remote4, initial_class(flow.proto), now, &timeouts)
            }
        };

        match flow.proto {
            L4Proto::Tcp => {
                let state = table.session(session).state;
                let tr = fsm::tcp_step(state, Direction::FromV6, flow.tcp);
                table.session_mut(session).state = tr.next;
                if let Some(class) = tr.renew {
                    table.renew(session, class, now, &timeouts);
                }
            }
            L4Proto::Udp => table.renew(session, ExpiryClass::Udp, now, &timeouts),
            L4Proto::Icmp => table.renew(session, ExpiryClass::Icmp, now, &timeouts),
        }

        self.stats.accepted_v6.fetch_add(1, Ordering::Relaxed);
        Verdict::Accept
    }

    /// IPv4 ingress: only traffic matching an existing binding may pass.
    pub fn process_v4(&self, flow: &FlowV4) -> Verdict {
        let timeouts = self.current_timeouts();
        let now = Instant::now();
        let mut table = lock_table(self.table(flow.proto));

        let bib = match table.bib_by_local(&flow.dst) {
            Some(id) => id,
            None => {
                log::debug!("[filter] no binding for {}", flow.dst);
                self.stats.dropped_no_binding.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        let session = match table.find_session(bib, flow.src) {
            Some(id) => id,
            None => {
                if flow.proto == L4Proto::Tcp && flow.tcp.syn {
                    // Remember the inbound SYN for the simultaneous-open
                    // grace window; the segment itself is not buffered.
                    let embedded6 =
                        TransportAddr6::new(self.prefix.embed(flow.src.addr), flow.src.port);
                    let id = table.create_session(
                        bib,
                        embedded6,
                        flow.src,
                        ExpiryClass::TcpIncomingSyn,
                        now,
                        &timeouts,
                    );
                    let tr = fsm::tcp_step(TcpState::Closed, Direction::FromV4, flow.tcp);
                    table.session_mut(id).state = tr.next;
                    self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.dropped_no_session.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        match flow.proto {
            L4Proto::Tcp => {
                let state = table.session(session).state;
                let tr = fsm::tcp_step(state, Direction::FromV4, flow.tcp);
                table.session_mut(session).state = tr.next;
                if let Some(class) = tr.renew {
                    table.renew(session, class, now, &timeouts);
                }
            }
            L4Proto::Udp => table.renew(session, ExpiryClass::Udp, now, &timeouts),
            L4Proto::Icmp => table.renew(session, ExpiryClass::Icmp, now, &timeouts),
        }

        self.stats.accepted_v4.fetch_add(1, Ordering::Relaxed);
        Verdict::Accept
    }

    /// Look up the IPv4 transport address bound to an IPv6 source, for the
    /// hook's outbound rewrite.
    pub fn bib_local4(&self, proto: L4Proto, remote6: &TransportAddr6) -> Option<TransportAddr4> {
        let table = lock_table(self.table(proto));
        table.bib_by_remote(remote6).map(|id| table.bib(id).local4)
    }

    /// Look up the IPv6 source bound to an IPv4 transport address, for the
    /// hook's inbound rewrite.
    pub fn bib_remote6(&self, proto: L4Proto, local4: &TransportAddr4) -> Option<TransportAddr6> {
        let table = lock_table(self.table(proto));
        table.bib_by_local(local4).map(|id| table.bib(id).remote6)
    }

    /// Number of live bindings for `proto`.
    pub fn bib_count(&self, proto: L4Proto) -> usize {
        lock_table(self.table(proto)).bib_count()
    }

    /// Number of live sessions for `proto`.
    pub fn session_count(&self, proto: L4Proto) -> usize {
        lock_table(self.table(proto)).session_count()
    }

    /// Reap expired sessions from every table.
    pub fn sweep(&self) -> SweepStats {
        let timeouts = self.current_timeouts();
        let now = Instant::now();
        let mut total = SweepStats::default();
        for table in [&self.udp, &self.tcp, &self.icmp] {
            total += lock_table(table).sweep(now, &timeouts, &self.pool);
        }
        if total.sessions_removed > 0 {
            self.stats
                .sessions_expired
                .fetch_add(total.sessions_removed as u64, Ordering::Relaxed);
            self.stats
                .bibs_reclaimed
                .fetch_add(total.bibs_removed as u64, Ordering::Relaxed);
            log::debug!(
                "[gc] swept {} sessions, {} bindings",
                total.sessions_removed,
                total.bibs_removed
            );
        }
        total
    }

    /// Run the periodic sweep until `shutdown` flips to `true` (or its
    /// sender goes away). Spawn this on the runtime; packets keep flowing
    /// through `process` from other tasks meanwhile.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        log::info!("expiry sweeper running every {:?}", self.sweep_interval);
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        log::info!("expiry sweeper stopped");
    }

    /// Override one timeout class at runtime.
    pub fn set_timeout(&self, class: ExpiryClass, timeout: Duration) -> Nat64Result<()> {
        if timeout.is_zero() {
            return Err(Nat64Error::config("timeout must be nonzero"));
        }
        if timeout < self.sweep_interval {
            log::warn!(
                "timeout {timeout:?} for {class:?} is shorter than the sweep interval {:?}",
                self.sweep_interval
            );
        }
        let mut timeouts = self.timeouts.write().unwrap_or_else(PoisonError::into_inner);
        match class {
            ExpiryClass::Udp => timeouts.udp = timeout,
            ExpiryClass::Icmp => timeouts.icmp = timeout,
            ExpiryClass::TcpEst => timeouts.tcp_est = timeout,
            ExpiryClass::TcpTrans => timeouts.tcp_trans = timeout,
            ExpiryClass::TcpIncomingSyn => timeouts.tcp_incoming_syn = timeout,
        }
        Ok(())
    }

    /// Current lifetime of one timeout class.
    pub fn timeout(&self, class: ExpiryClass) -> Duration {
        self.current_timeouts().for_class(class)
    }

    /// Register another pool address at runtime.
    pub fn pool4_add(&self, addr: Ipv4Addr) -> Nat64Result<()> {
        self.pool.register(addr)
    }

    /// Withdraw a pool address. Bindings already borrowing from it keep
    /// working; their ports are discarded on release.
    pub fn pool4_rm(&self, addr: Ipv4Addr) -> Nat64Result<()> {
        self.pool.remove(addr)
    }

    /// The registered pool addresses, in registration order.
    pub fn pool4_list(&self) -> Vec<Ipv4Addr> {
        self.pool.to_vec()
    }

    /// Destroy all bindings and sessions, returning every borrowed port.
    ///
    /// Quiesce the sweeper and the hook first; this is the shutdown path.
    pub fn clear(&self) {
        for table in [&self.udp, &self.tcp, &self.icmp] {
            lock_table(table).clear(&self.pool);
        }
        log::info!("cleared all bindings and sessions");
    }

    #[cfg(test)]
    fn check_consistency(&self) {
        for table in [&self.udp, &self.tcp, &self.icmp] {
            lock_table(table).check_consistency();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::net::Ipv6Addr;

    const POOL_ADDR: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);

    fn engine() -> Nat64Engine {
        let _ = env_logger::builder().is_test(true).try_init();
        MockClock::set_time(Duration::ZERO);
        let config = Nat64Config {
            pool4: vec![POOL_ADDR],
            ..Default::default()
        };
        Nat64Engine::new(&config).unwrap()
    }

    fn client(last: u16, port: u16) -> TransportAddr6 {
        TransportAddr6::new(format!("2001:db8::{last:x}").parse().unwrap(), port)
    }

    fn nat64_dst(peer: Ipv4Addr, port: u16) -> TransportAddr6 {
        let addr: Ipv6Addr = Nat64Prefix::well_known().embed(peer);
        TransportAddr6::new(addr, port)
    }

    fn udp6(src: TransportAddr6, dst: TransportAddr6) -> FlowV6 {
        FlowV6 {
            proto: L4Proto::Udp,
            src,
            dst,
            tcp: crate::types::TcpFlags::NONE,
        }
    }

    fn tcp6(src: TransportAddr6, dst: TransportAddr6, tcp: crate::types::TcpFlags) -> FlowV6 {
        FlowV6 {
            proto: L4Proto::Tcp,
            src,
            dst,
            tcp,
        }
    }

    fn tcp4(src: TransportAddr4, dst: TransportAddr4, tcp: crate::types::TcpFlags) -> FlowV4 {
        FlowV4 {
            proto: L4Proto::Tcp,
            src,
            dst,
            tcp,
        }
    }

    fn udp4(src: TransportAddr4, dst: TransportAddr4) -> FlowV4 {
        FlowV4 {
            proto: L4Proto::Udp,
            src,
            dst,
            tcp: crate::types::TcpFlags::NONE,
        }
    }

    fn tcp_state(engine: &Nat64Engine, remote6: TransportAddr6, embedded6: TransportAddr6) -> TcpState {
        let table = lock_table(&engine.tcp);
        let bib = table.bib_by_remote(&remote6).unwrap();
        let session = table.find_session_v6(bib, embedded6).unwrap();
        table.session(session).state
    }

    // An IPv6 UDP query gets a binding that preserves its source port, and
    // the IPv4 reply is accepted back to the same client.
    #[test]
    fn test_udp_happy_path() {
        let engine = engine();
        let src = client(0xa, 4000);
        let peer = Ipv4Addr::new(198, 51, 100, 7);
        let dst = nat64_dst(peer, 53);

        assert_eq!(engine.process_v6(&udp6(src, dst)), Verdict::Accept);

        let local4 = engine.bib_local4(L4Proto::Udp, &src).unwrap();
        assert_eq!(local4, TransportAddr4::new(POOL_ADDR, 4000));
        assert_eq!(engine.bib_count(L4Proto::Udp), 1);
        assert_eq!(engine.session_count(L4Proto::Udp), 1);

        // The reply from the IPv4 peer reaches the binding.
        let reply = udp4(TransportAddr4::new(peer, 53), local4);
        assert_eq!(engine.process_v4(&reply), Verdict::Accept);
        assert_eq!(engine.bib_remote6(L4Proto::Udp, &local4), Some(src));

        let snap = engine.stats().snapshot();
        assert_eq!(snap.accepted_v6, 1);
        assert_eq!(snap.accepted_v4, 1);
        engine.check_consistency();
    }

    #[test]
    fn test_allocation_preserves_parity_and_range() {
        let engine = engine();
        // 4001: odd, unprivileged.
        engine.process_v6(&udp6(client(0xa, 4001), nat64_dst(Ipv4Addr::new(8, 8, 8, 8), 53)));
        let local4 = engine
            .bib_local4(L4Proto::Udp, &client(0xa, 4001))
            .unwrap();
        assert_eq!(local4.port % 2, 1);
        assert!(local4.port >= 1025);

        // 900: even, privileged.
        engine.process_v6(&udp6(client(0xb, 900), nat64_dst(Ipv4Addr::new(8, 8, 8, 8), 53)));
        let local4 = engine.bib_local4(L4Proto::Udp, &client(0xb, 900)).unwrap();
        assert_eq!(local4.port % 2, 0);
        assert!(local4.port < 1024);
    }

    // Exhausting one section drops the next packet needing it, without
    // touching flows in other sections.
    #[test]
    fn test_pool_exhaustion_drops_packet() {
        let engine = engine();
        let dst = nat64_dst(Ipv4Addr::new(192, 0, 2, 1), 80);

        // 512 odd privileged ports: 1, 3, .., 1023.
        for i in 0..512u16 {
            let flow = tcp6(client(i + 1, 2 * i + 1), dst, crate::types::TcpFlags::SYN);
            assert_eq!(engine.process_v6(&flow), Verdict::Accept, "binding {i}");
        }
        assert_eq!(engine.bib_count(L4Proto::Tcp), 512);

        let flow = tcp6(client(0x999, 1), dst, crate::types::TcpFlags::SYN);
        assert_eq!(engine.process_v6(&flow), Verdict::Drop);
        assert_eq!(engine.stats().snapshot().dropped_pool_exhausted, 1);

        // Another section still allocates.
        let flow = tcp6(client(0x99a, 2000), dst, crate::types::TcpFlags::SYN);
        assert_eq!(engine.process_v6(&flow), Verdict::Accept);
        engine.check_consistency();
    }

    // The full handshake and close sequence drives the state machine from
    // CLOSED through to V6_FIN_V4_FIN with a transitory deadline.
    #[test]
    fn test_tcp_fsm_lifecycle() {
        use crate::types::TcpFlags;

        let engine = engine();
        let src = client(0xa, 5000);
        let peer = Ipv4Addr::new(192, 0, 2, 9);
        let dst = nat64_dst(peer, 443);

        engine.process_v6(&tcp6(src, dst, TcpFlags::SYN));
        assert_eq!(tcp_state(&engine, src, dst), TcpState::V6SynRcv);

        let local4 = engine.bib_local4(L4Proto::Tcp, &src).unwrap();
        let peer4 = TransportAddr4::new(peer, 443);
        engine.process_v4(&tcp4(peer4, local4, TcpFlags::SYN));
        assert_eq!(tcp_state(&engine, src, dst), TcpState::Established);

        engine.process_v6(&tcp6(src, dst, TcpFlags::NONE));
        assert_eq!(tcp_state(&engine, src, dst), TcpState::Established);

        engine.process_v6(&tcp6(src, dst, TcpFlags::FIN));
        assert_eq!(tcp_state(&engine, src, dst), TcpState::V6FinRcv);

        let now = Instant::now();
        engine.process_v4(&tcp4(peer4, local4, TcpFlags::FIN));
        assert_eq!(tcp_state(&engine, src, dst), TcpState::V6FinV4Fin);

        // The terminal state waits out the transitory timeout.
        let table = lock_table(&engine.tcp);
        let bib = table.bib_by_remote(&src).unwrap();
        let session = table.find_session_v6(bib, dst).unwrap();
        assert_eq!(table.session(session).class, ExpiryClass::TcpTrans);
        assert_eq!(
            table.session(session).deadline,
            now + engine.current_timeouts().tcp_trans
        );
        drop(table);
        engine.check_consistency();
    }

    // An established session that idles out is demoted once, then reaped.
    #[test]
    fn test_idle_demotion_then_reap() {
        use crate::types::TcpFlags;

        let engine = engine();
        let src = client(0xa, 5000);
        let peer = Ipv4Addr::new(192, 0, 2, 9);
        let dst = nat64_dst(peer, 443);

        engine.process_v6(&tcp6(src, dst, TcpFlags::SYN));
        let local4 = engine.bib_local4(L4Proto::Tcp, &src).unwrap();
        engine.process_v4(&tcp4(TransportAddr4::new(peer, 443), local4, TcpFlags::SYN));
        assert_eq!(tcp_state(&engine, src, dst), TcpState::Established);

        let timeouts = engine.current_timeouts();
        MockClock::advance(timeouts.tcp_est + Duration::from_secs(1));
        let stats = engine.sweep();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(tcp_state(&engine, src, dst), TcpState::Trans);

        MockClock::advance(timeouts.tcp_trans + Duration::from_secs(1));
        let stats = engine.sweep();
        assert_eq!(stats.sessions_removed, 1);
        assert_eq!(stats.bibs_removed, 1);
        assert_eq!(engine.bib_local4(L4Proto::Tcp, &src), None);

        // The borrowed port is back in the pool.
        assert_eq!(engine.pool.get_similar(L4Proto::Tcp, local4), Some(local4));

        let snap = engine.stats().snapshot();
        assert_eq!(snap.sessions_expired, 1);
        assert_eq!(snap.bibs_reclaimed, 1);
        engine.check_consistency();
    }

    // Stateful filtering: nothing comes in without a prior binding.
    #[test]
    fn test_inbound_without_binding_dropped() {
        let engine = engine();
        let flow = udp4(
            TransportAddr4::new(Ipv4Addr::new(192, 0, 2, 1), 4321),
            TransportAddr4::new(POOL_ADDR, 9999),
        );
        assert_eq!(engine.process_v4(&flow), Verdict::Drop);
        assert_eq!(engine.stats().snapshot().dropped_no_binding, 1);
    }

    #[test]
    fn test_inbound_udp_from_unknown_peer_dropped() {
        let engine = engine();
        let src = client(0xa, 4000);
        engine.process_v6(&udp6(src, nat64_dst(Ipv4Addr::new(198, 51, 100, 7), 53)));
        let local4 = engine.bib_local4(L4Proto::Udp, &src).unwrap();

        // Same binding, different IPv4 peer: no session, drop.
        let stray = udp4(TransportAddr4::new(Ipv4Addr::new(198, 51, 100, 8), 53), local4);
        assert_eq!(engine.process_v4(&stray), Verdict::Drop);
        assert_eq!(engine.stats().snapshot().dropped_no_session, 1);
        assert_eq!(engine.session_count(L4Proto::Udp), 1);
    }

    // An inbound SYN for an existing binding parks a provisional session;
    // the IPv6 SYN inside the window completes the simultaneous open.
    #[test]
    fn test_inbound_syn_simultaneous_open() {
        use crate::types::TcpFlags;

        let engine = engine();
        let src = client(0xa, 5000);
        let first_peer = nat64_dst(Ipv4Addr::new(192, 0, 2, 9), 443);
        engine.process_v6(&tcp6(src, first_peer, TcpFlags::SYN));
        let local4 = engine.bib_local4(L4Proto::Tcp, &src).unwrap();

        // A different peer SYNs inbound: dropped, but remembered.
        let other = TransportAddr4::new(Ipv4Addr::new(192, 0, 2, 10), 8080);
        assert_eq!(
            engine.process_v4(&tcp4(other, local4, TcpFlags::SYN)),
            Verdict::Drop
        );
        assert_eq!(engine.session_count(L4Proto::Tcp), 2);

        let other6 = nat64_dst(other.addr, other.port);
        assert_eq!(tcp_state(&engine, src, other6), TcpState::V4SynRcv);

        // The IPv6 SYN toward that peer establishes the session.
        assert_eq!(
            engine.process_v6(&tcp6(src, other6, TcpFlags::SYN)),
            Verdict::Accept
        );
        assert_eq!(tcp_state(&engine, src, other6), TcpState::Established);
        engine.check_consistency();
    }

    #[test]
    fn test_provisional_session_ages_out() {
        use crate::types::TcpFlags;

        let engine = engine();
        let src = client(0xa, 5000);
        engine.process_v6(&tcp6(src, nat64_dst(Ipv4Addr::new(192, 0, 2, 9), 443), TcpFlags::SYN));
        let local4 = engine.bib_local4(L4Proto::Tcp, &src).unwrap();

        let other = TransportAddr4::new(Ipv4Addr::new(192, 0, 2, 10), 8080);
        engine.process_v4(&tcp4(other, local4, TcpFlags::SYN));
        assert_eq!(engine.session_count(L4Proto::Tcp), 2);

        // A non-SYN segment without a session creates nothing.
        let stray = TransportAddr4::new(Ipv4Addr::new(192, 0, 2, 11), 21);
        assert_eq!(
            engine.process_v4(&tcp4(stray, local4, TcpFlags::NONE)),
            Verdict::Drop
        );
        assert_eq!(engine.session_count(L4Proto::Tcp), 2);

        MockClock::advance(engine.current_timeouts().tcp_incoming_syn + Duration::from_secs(1));
        let stats = engine.sweep();
        assert_eq!(stats.sessions_removed, 1);
        assert_eq!(engine.session_count(L4Proto::Tcp), 1);
        engine.check_consistency();
    }

    // Under a non-/96 prefix the u octet carries no address bits, so two
    // destinations differing only there are one IPv4 peer and one flow.
    #[test]
    fn test_u_octet_variants_share_one_session() {
        let _ = env_logger::builder().is_test(true).try_init();
        MockClock::set_time(Duration::ZERO);
        let config = Nat64Config {
            prefix: "2001:db8:122:344::/64".parse().unwrap(),
            pool4: vec![POOL_ADDR],
            ..Default::default()
        };
        let engine = Nat64Engine::new(&config).unwrap();

        let src = client(0xa, 4000);
        let peer = Ipv4Addr::new(192, 0, 2, 33);
        let canonical = TransportAddr6::new(engine.prefix().embed(peer), 53);
        let mut octets = canonical.addr.octets();
        octets[8] = 0xff;
        let variant = TransportAddr6::new(Ipv6Addr::from(octets), 53);
        assert_ne!(canonical.addr, variant.addr);
        assert_eq!(engine.prefix().extract(&variant.addr), Some(peer));

        assert_eq!(engine.process_v6(&udp6(src, canonical)), Verdict::Accept);
        assert_eq!(engine.process_v6(&udp6(src, variant)), Verdict::Accept);

        assert_eq!(engine.bib_count(L4Proto::Udp), 1);
        assert_eq!(engine.session_count(L4Proto::Udp), 1);
        assert_eq!(engine.stats().snapshot().sessions_created, 1);
        engine.check_consistency();
    }

    #[test]
    fn test_destination_outside_prefix_dropped() {
        let engine = engine();
        let dst = TransportAddr6::new("2001:db8::7".parse().unwrap(), 80);
        assert_eq!(engine.process_v6(&udp6(client(0xa, 4000), dst)), Verdict::Drop);
        assert_eq!(engine.stats().snapshot().dropped_untranslatable, 1);
        assert_eq!(engine.bib_count(L4Proto::Udp), 0);
    }

    // Two packets of one flow in the same tick leave one queue entry with
    // the later deadline.
    #[test]
    fn test_renew_is_idempotent_within_a_tick() {
        let engine = engine();
        let src = client(0xa, 4000);
        let dst = nat64_dst(Ipv4Addr::new(198, 51, 100, 7), 53);

        engine.process_v6(&udp6(src, dst));
        MockClock::advance(Duration::from_secs(3));
        engine.process_v6(&udp6(src, dst));
        engine.process_v6(&udp6(src, dst));

        let table = lock_table(&engine.udp);
        assert_eq!(table.queue_len(ExpiryClass::Udp), 1);
        let bib = table.bib_by_remote(&src).unwrap();
        let session = table.find_session_v6(bib, dst).unwrap();
        assert_eq!(
            table.session(session).deadline,
            Instant::now() + engine.current_timeouts().udp
        );
        drop(table);
        engine.check_consistency();
    }

    #[test]
    fn test_runtime_timeout_override() {
        let engine = engine();
        assert!(engine
            .set_timeout(ExpiryClass::Udp, Duration::ZERO)
            .is_err());

        engine
            .set_timeout(ExpiryClass::Udp, Duration::from_secs(30))
            .unwrap();
        assert_eq!(engine.timeout(ExpiryClass::Udp), Duration::from_secs(30));

        let src = client(0xa, 4000);
        engine.process_v6(&udp6(src, nat64_dst(Ipv4Addr::new(198, 51, 100, 7), 53)));
        MockClock::advance(Duration::from_secs(31));
        let stats = engine.sweep();
        assert_eq!(stats.sessions_removed, 1);
    }

    #[test]
    fn test_pool4_runtime_mutation() {
        let engine = engine();
        let second = Ipv4Addr::new(203, 0, 113, 6);

        engine.pool4_add(second).unwrap();
        assert_eq!(engine.pool4_list(), vec![POOL_ADDR, second]);
        assert_eq!(engine.pool4_add(second), Err(Nat64Error::AlreadyPresent));

        engine.pool4_rm(second).unwrap();
        assert_eq!(engine.pool4_list(), vec![POOL_ADDR]);
        assert_eq!(engine.pool4_rm(second), Err(Nat64Error::NotFound));
    }

    #[test]
    fn test_clear_releases_everything() {
        let engine = engine();
        let src = client(0xa, 4000);
        engine.process_v6(&udp6(src, nat64_dst(Ipv4Addr::new(198, 51, 100, 7), 53)));
        let local4 = engine.bib_local4(L4Proto::Udp, &src).unwrap();

        engine.clear();
        assert_eq!(engine.bib_count(L4Proto::Udp), 0);
        assert_eq!(engine.session_count(L4Proto::Udp), 0);
        assert_eq!(engine.pool.get_similar(L4Proto::Udp, local4), Some(local4));
    }

    // Traffic on different protocols never contends on one table lock.
    #[test]
    fn test_protocols_progress_in_parallel() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for (proto, base) in [(L4Proto::Udp, 0x100u16), (L4Proto::Tcp, 0x200), (L4Proto::Icmp, 0x300)] {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for i in 0..200u16 {
                    let flow = FlowV6 {
                        proto,
                        src: client(base + (i % 50), 2000 + i),
                        dst: nat64_dst(Ipv4Addr::new(192, 0, 2, 1), 80),
                        tcp: crate::types::TcpFlags::SYN,
                    };
                    assert_eq!(engine.process_v6(&flow), Verdict::Accept);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker should not panic");
        }

        let snap = engine.stats().snapshot();
        assert_eq!(snap.accepted_v6, 600);
        engine.check_consistency();
    }

    #[tokio::test]
    async fn test_sweeper_task_shutdown() {
        let config = Nat64Config {
            pool4: vec![POOL_ADDR],
            sweep_interval_secs: 1,
            ..Default::default()
        };
        let engine = std::sync::Arc::new(Nat64Engine::new(&config).unwrap());

        let (tx, rx) = watch::channel(false);
        let worker = {
            let engine = std::sync::Arc::clone(&engine);
            tokio::spawn(async move { engine.run_sweeper(rx).await })
        };

        tx.send(true).unwrap();
        worker.await.unwrap();
    }
}

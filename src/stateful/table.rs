//! Per-protocol binding and session state.
//!
//! Each protocol owns one `ProtoTable`: the BIB arena with its two hash
//! indices, the session arena, and that protocol's expiry queues. The whole
//! table mutates under one lock, so lookups are parallel across protocols
//! and serialized within one.
//!
//! Expiry queues are FIFO lists threaded through the session arena by id.
//! Sessions are always appended on create/renew, which keeps every queue in
//! non-decreasing deadline order by construction; the sweeper walks from
//! the head and stops at the first entry that has not expired. This is the
//! alternative to per-session timers and must stay that way.

use std::collections::HashMap;
use std::ops::AddAssign;

use crate::clock::Instant;
use crate::config::Timeouts;
use crate::types::{ExpiryClass, L4Proto, TcpState, TransportAddr4, TransportAddr6};

use super::arena::Arena;
use super::fsm;
use super::pool4::Pool4;

pub(crate) type BibId = u32;
pub(crate) type SessionId = u32;

/// A binding: the long-lived pairing of an IPv6 source transport address
/// with an IPv4 transport address borrowed from the pool.
pub(crate) struct BibEntry {
    /// The IPv6 node that owns the binding (X' in RFC 6146).
    pub remote6: TransportAddr6,
    /// The borrowed IPv4 transport address (T').
    pub local4: TransportAddr4,
    /// Sessions bound to this binding; short, scanned linearly.
    pub sessions: Vec<SessionId>,
}

/// One 5-tuple flow authorized to cross the translator.
pub(crate) struct Session {
    pub bib: BibId,
    /// IPv6 node (X'), copied from the owning binding.
    pub remote6: TransportAddr6,
    /// Original IPv6 destination, i.e. the peer embedded in the prefix (Y').
    pub embedded6: TransportAddr6,
    /// Borrowed IPv4 transport address (T'), copied from the binding.
    pub local4: TransportAddr4,
    /// The IPv4 peer (Z').
    pub remote4: TransportAddr4,
    pub state: TcpState,
    pub class: ExpiryClass,
    pub deadline: Instant,
    prev: Option<SessionId>,
    next: Option<SessionId>,
}

/// FIFO expiry queue threaded through the session arena.
#[derive(Default)]
struct ExpiryQueue {
    head: Option<SessionId>,
    tail: Option<SessionId>,
    len: usize,
}

fn link(sessions: &mut Arena<Session>, id: SessionId) -> &mut Session {
    sessions.get_mut(id).expect("queue id refers to a live session")
}

impl ExpiryQueue {
    fn push_back(&mut self, sessions: &mut Arena<Session>, id: SessionId) {
        let tail = self.tail;
        {
            let s = link(sessions, id);
            s.prev = tail;
            s.next = None;
        }
        match tail {
            Some(t) => link(sessions, t).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    fn unlink(&mut self, sessions: &mut Arena<Session>, id: SessionId) {
        let (prev, next) = {
            let s = link(sessions, id);
            (s.prev.take(), s.next.take())
        };
        match prev {
            Some(p) => link(sessions, p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => link(sessions, n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}

/// What one sweep pass reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub sessions_removed: usize,
    pub bibs_removed: usize,
}

impl AddAssign for SweepStats {
    fn add_assign(&mut self, other: Self) {
        self.sessions_removed += other.sessions_removed;
        self.bibs_removed += other.bibs_removed;
    }
}

/// All state tracked for one protocol.
pub(crate) struct ProtoTable {
    proto: L4Proto,
    bibs: Arena<BibEntry>,
    by_remote: HashMap<TransportAddr6, BibId>,
    by_local: HashMap<TransportAddr4, BibId>,
    sessions: Arena<Session>,
    queues: [ExpiryQueue; 5],
}

impl ProtoTable {
    pub fn new(proto: L4Proto) -> Self {
        Self {
            proto,
            bibs: Arena::new(),
            by_remote: HashMap::new(),
            by_local: HashMap::new(),
            sessions: Arena::new(),
            queues: Default::default(),
        }
    }

    pub fn bib_by_remote(&self, remote6: &TransportAddr6) -> Option<BibId> {
        self.by_remote.get(remote6).copied()
    }

    pub fn bib_by_local(&self, local4: &TransportAddr4) -> Option<BibId> {
        self.by_local.get(local4).copied()
    }

    pub fn bib(&self, id: BibId) -> &BibEntry {
        self.bibs.get(id).expect("bib id refers to a live binding")
    }

    pub fn session(&self, id: SessionId) -> &Session {
        self.sessions.get(id).expect("session id refers to a live session")
    }

    pub fn session_mut(&mut self, id: SessionId) -> &mut Session {
        self.sessions
            .get_mut(id)
            .expect("session id refers to a live session")
    }

    pub fn bib_count(&self) -> usize {
        self.bibs.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Insert a binding into the arena and both indices.
    pub fn insert_bib(&mut self, remote6: TransportAddr6, local4: TransportAddr4) -> BibId {
        let id = self.bibs.insert(BibEntry {
            remote6,
            local4,
            sessions: Vec::new(),
        });
        self.by_remote.insert(remote6, id);
        self.by_local.insert(local4, id);
        log::debug!("[bib] new {remote6} <--> {local4} ({:?})", self.proto);
        id
    }

    /// Find the session of `bib` talking to the IPv4 peer `remote4`.
    pub fn find_session(&self, bib: BibId, remote4: TransportAddr4) -> Option<SessionId> {
        self.bib(bib)
            .sessions
            .iter()
            .copied()
            .find(|&id| self.session(id).remote4 == remote4)
    }

    /// Find the session of `bib` whose original IPv6 destination is
    /// `embedded6`.
    ///
    /// The packet path keys v6-side lookups on the extracted IPv4 peer
    /// instead, since addresses differing only in the excised u octet are
    /// the same flow; this symmetric lookup stays for introspection.
    #[allow(dead_code)]
    pub fn find_session_v6(&self, bib: BibId, embedded6: TransportAddr6) -> Option<SessionId> {
        self.bib(bib)
            .sessions
            .iter()
            .copied()
            .find(|&id| self.session(id).embedded6 == embedded6)
    }

    /// Create a session under `bib` and append it to its expiry queue.
    pub fn create_session(
        &mut self,
        bib: BibId,
        embedded6: TransportAddr6,
        remote4: TransportAddr4,
        class: ExpiryClass,
        now: Instant,
        timeouts: &Timeouts,
    ) -> SessionId {
        let (remote6, local4) = {
            let b = self.bib(bib);
            (b.remote6, b.local4)
        };
        let id = self.sessions.insert(Session {
            bib,
            remote6,
            embedded6,
            local4,
            remote4,
            state: TcpState::Closed,
            class,
            deadline: now + timeouts.for_class(class),
            prev: None,
            next: None,
        });
        self.bibs
            .get_mut(bib)
            .expect("bib id refers to a live binding")
            .sessions
            .push(id);
        self.queues[class.index()].push_back(&mut self.sessions, id);
        log::debug!(
            "[session] new {remote6} -> {embedded6} as {local4} -> {remote4} (class {class:?})"
        );
        id
    }

    /// Move a session to `class`, stamping a fresh deadline and re-queueing
    /// it at the tail.
    pub fn renew(&mut self, id: SessionId, class: ExpiryClass, now: Instant, timeouts: &Timeouts) {
        let old_class = self.session(id).class;
        self.queues[old_class.index()].unlink(&mut self.sessions, id);
        {
            let s = self.session_mut(id);
            s.class = class;
            s.deadline = now + timeouts.for_class(class);
        }
        self.queues[class.index()].push_back(&mut self.sessions, id);
        log::trace!("[session] renewed into {class:?}");
    }

    /// Reap expired sessions from every queue.
    ///
    /// Established TCP sessions get demoted into the transitory queue
    /// instead of dying; everything else is unlinked, and a binding whose
    /// last session went away is destroyed, returning its port to `pool`.
    pub fn sweep(&mut self, now: Instant, timeouts: &Timeouts, pool: &Pool4) -> SweepStats {
        let mut stats = SweepStats::default();
        for class in ExpiryClass::ALL {
            while let Some(head) = self.queues[class.index()].head {
                let (deadline, state) = {
                    let s = self.session(head);
                    (s.deadline, s.state)
                };
                // Queues are deadline-ordered, so the first live entry ends
                // the walk.
                if now <= deadline {
                    break;
                }
                if let Some(tr) = fsm::timeout_demote(state) {
                    self.session_mut(head).state = tr.next;
                    if let Some(new_class) = tr.renew {
                        self.renew(head, new_class, now, timeouts);
                    }
                    continue;
                }
                self.remove_session(head, pool, &mut stats);
            }
        }
        stats
    }

    fn remove_session(&mut self, id: SessionId, pool: &Pool4, stats: &mut SweepStats) {
        let class = self.session(id).class;
        self.queues[class.index()].unlink(&mut self.sessions, id);
        let session = self
            .sessions
            .remove(id)
            .expect("session id refers to a live session");
        log::debug!(
            "[gc] removed session {} -> {}",
            session.remote6,
            session.remote4
        );
        stats.sessions_removed += 1;

        let bib = self
            .bibs
            .get_mut(session.bib)
            .expect("session refers to a live binding");
        if let Some(at) = bib.sessions.iter().position(|&s| s == id) {
            bib.sessions.remove(at);
        }
        if bib.sessions.is_empty() {
            let bib = self
                .bibs
                .remove(session.bib)
                .expect("session refers to a live binding");
            self.by_remote.remove(&bib.remote6);
            self.by_local.remove(&bib.local4);
            pool.release(self.proto, bib.local4);
            log::debug!("[gc] removed bib {} <--> {}", bib.remote6, bib.local4);
            stats.bibs_removed += 1;
        }
    }

    /// Destroy every binding and session, returning all ports to `pool`.
    pub fn clear(&mut self, pool: &Pool4) {
        for (_, bib) in self.bibs.iter() {
            pool.release(self.proto, bib.local4);
        }
        self.bibs.clear();
        self.by_remote.clear();
        self.by_local.clear();
        self.sessions.clear();
        self.queues = Default::default();
    }

    /// Walk the whole table and assert its structural invariants.
    #[cfg(test)]
    pub fn check_consistency(&self) {
        use std::collections::HashSet;

        // Both indices hold exactly the live bindings.
        assert_eq!(self.by_remote.len(), self.bibs.len());
        assert_eq!(self.by_local.len(), self.bibs.len());
        for (id, bib) in self.bibs.iter() {
            assert_eq!(self.by_remote.get(&bib.remote6), Some(&id));
            assert_eq!(self.by_local.get(&bib.local4), Some(&id));
            assert!(!bib.sessions.is_empty(), "binding with no sessions");
            for &sid in &bib.sessions {
                let s = self.session(sid);
                assert_eq!(s.bib, id);
                assert_eq!(s.remote6, bib.remote6);
                assert_eq!(s.local4, bib.local4);
            }
        }

        // Every live session is in exactly one queue, under its own class.
        let mut seen = HashSet::new();
        for class in ExpiryClass::ALL {
            let queue = &self.queues[class.index()];
            let mut walked = 0;
            let mut cursor = queue.head;
            let mut prev = None;
            while let Some(id) = cursor {
                let s = self.session(id);
                assert_eq!(s.class, class);
                assert_eq!(s.prev, prev);
                assert!(seen.insert(id), "session queued twice");
                walked += 1;
                prev = cursor;
                cursor = s.next;
            }
            assert_eq!(walked, queue.len);
            assert_eq!(queue.tail, prev);
        }
        assert_eq!(seen.len(), self.sessions.len());
    }

    #[cfg(test)]
    pub fn queue_len(&self, class: ExpiryClass) -> usize {
        self.queues[class.index()].len
    }
}

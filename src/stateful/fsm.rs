//! TCP connection-state machine (RFC 6146 section 3.5.2).
//!
//! The machine is a pure transition function over `(state, direction,
//! flags)`; the session table applies the result. Each transition names
//! the next state and, when the packet refreshes the session's lifetime,
//! the expiry class to renew into.

use crate::types::{Direction, ExpiryClass, TcpFlags, TcpState};

/// Outcome of feeding one packet (or one timeout) to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: TcpState,
    /// Expiry class to renew the session into; `None` leaves the current
    /// deadline untouched.
    pub renew: Option<ExpiryClass>,
}

impl Transition {
    const fn stay(state: TcpState) -> Self {
        Self {
            next: state,
            renew: None,
        }
    }

    const fn to(next: TcpState, class: ExpiryClass) -> Self {
        Self {
            next,
            renew: Some(class),
        }
    }
}

/// Advance the machine for a packet seen in `dir` carrying `flags`.
pub fn tcp_step(state: TcpState, dir: Direction, flags: TcpFlags) -> Transition {
    use crate::types::Direction::{FromV4, FromV6};
    use crate::types::TcpState::*;

    match (state, dir) {
        (Closed, FromV6) if flags.syn => Transition::to(V6SynRcv, ExpiryClass::TcpTrans),
        // Inbound SYN with no IPv6-side state: park the session in the
        // short incoming-SYN queue until the IPv6 SYN shows up.
        (Closed, FromV4) if flags.syn => Transition::to(V4SynRcv, ExpiryClass::TcpIncomingSyn),
        (Closed, _) => Transition::stay(Closed),

        (V6SynRcv, FromV4) if flags.syn => Transition::to(Established, ExpiryClass::TcpEst),
        (V6SynRcv, FromV6) if flags.syn => Transition::to(V6SynRcv, ExpiryClass::TcpTrans),
        (V6SynRcv, _) => Transition::stay(V6SynRcv),

        (V4SynRcv, FromV6) if flags.syn => Transition::to(Established, ExpiryClass::TcpEst),
        (V4SynRcv, _) => Transition::stay(V4SynRcv),

        // A FIN moves to the half-closed state but leaves the current
        // deadline running.
        (Established, FromV6) if flags.fin => Transition {
            next: V6FinRcv,
            renew: None,
        },
        (Established, FromV4) if flags.fin => Transition {
            next: V4FinRcv,
            renew: None,
        },
        (Established, _) if flags.rst => Transition::to(Trans, ExpiryClass::TcpTrans),
        (Established, _) => Transition::to(Established, ExpiryClass::TcpEst),

        (V6FinRcv, FromV4) if flags.fin => Transition::to(V6FinV4Fin, ExpiryClass::TcpTrans),
        (V6FinRcv, _) => Transition::to(V6FinRcv, ExpiryClass::TcpEst),

        (V4FinRcv, FromV6) if flags.fin => Transition::to(V6FinV4Fin, ExpiryClass::TcpTrans),
        (V4FinRcv, _) => Transition::to(V4FinRcv, ExpiryClass::TcpEst),

        (Trans, _) if !flags.rst => Transition::to(Established, ExpiryClass::TcpEst),
        (Trans, _) => Transition::stay(Trans),

        (V6FinV4Fin, _) => Transition::stay(V6FinV4Fin),
    }
}

/// What happens to a TCP session whose deadline has passed.
///
/// An established session gets one transitory grace period instead of
/// dying; anything else is reaped by the caller.
pub fn timeout_demote(state: TcpState) -> Option<Transition> {
    (state == TcpState::Established)
        .then(|| Transition::to(TcpState::Trans, ExpiryClass::TcpTrans))
}

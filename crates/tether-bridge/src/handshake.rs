//! Handshake state machine and the guest retry loop.
//!
//! The two roles share one [`Session`] record and differ only in which
//! handshake messages they react to: the host answers requests and completes
//! on the ack, the guest initiates, retries, and completes on the response.

use std::time::Duration;

use tether_core::{BridgeRole, BridgeStatus, CancelToken, SessionId};
use tokio::time::MissedTickBehavior;

/// What a handshake message did to the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Host adopted the requested session; answer with a response.
    Respond,
    /// Connected just now.
    Established,
    /// Duplicate response for the live session; ack again, emit nothing.
    Reacknowledge,
    /// Not for this role, or stale.
    Ignore,
}

/// Status plus the session currently negotiated or active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Session {
    pub status: BridgeStatus,
    pub id: SessionId,
    /// Host has sent a response for `id` while connecting.
    answered: bool,
}

impl Session {
    /// Guest: start a fresh attempt under the next session id.
    pub fn begin_attempt(&mut self) -> SessionId {
        self.id = self.id.next();
        self.status = BridgeStatus::Connecting;
        self.id
    }

    /// Host: start waiting for a guest.
    pub fn await_peer(&mut self) {
        if self.status == BridgeStatus::Idle {
            self.status = BridgeStatus::Connecting;
        }
    }

    /// Back to idle. The id is kept so the next attempt moves past it.
    pub fn reset(&mut self) {
        self.status = BridgeStatus::Idle;
        self.answered = false;
    }

    /// Whether the guest is still negotiating `id`.
    pub fn is_negotiating(&self, id: SessionId) -> bool {
        self.status == BridgeStatus::Connecting && self.id == id
    }

    /// Whether traffic tagged `id` belongs to this session.
    pub fn accepts(&self, id: SessionId) -> bool {
        self.id == id
    }

    /// Host receives a handshake request.
    ///
    /// The first request while waiting is accepted whatever its id. After
    /// that the session only moves forward: a connecting host re-answers the
    /// session it already answered or a newer one, and a connected host
    /// accepts only a newer one.
    pub fn on_request(&mut self, role: BridgeRole, incoming: SessionId) -> Transition {
        if role != BridgeRole::Host {
            return Transition::Ignore;
        }
        let stale = match self.status {
            BridgeStatus::Idle => true,
            BridgeStatus::Connecting => self.answered && incoming < self.id,
            BridgeStatus::Connected => incoming <= self.id,
        };
        if stale {
            return Transition::Ignore;
        }
        self.id = incoming;
        self.status = BridgeStatus::Connecting;
        self.answered = true;
        Transition::Respond
    }

    /// Guest receives a handshake response.
    pub fn on_response(&mut self, role: BridgeRole, incoming: SessionId) -> Transition {
        if role != BridgeRole::Guest || incoming != self.id {
            return Transition::Ignore;
        }
        match self.status {
            BridgeStatus::Connecting => {
                self.status = BridgeStatus::Connected;
                Transition::Established
            }
            BridgeStatus::Connected => Transition::Reacknowledge,
            BridgeStatus::Idle => Transition::Ignore,
        }
    }

    /// Host receives a handshake ack.
    pub fn on_ack(&mut self, role: BridgeRole, incoming: SessionId) -> Transition {
        if role != BridgeRole::Host || !self.is_negotiating(incoming) {
            return Transition::Ignore;
        }
        self.status = BridgeStatus::Connected;
        Transition::Established
    }
}

/// How the guest retry loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    /// The attempt stopped being pending (connected or superseded).
    Settled,
    /// The cancel token fired.
    Cancelled,
    /// `max_attempts` requests went unanswered.
    Exhausted { attempts: u32 },
}

/// Send handshake requests every `interval` until the attempt settles.
///
/// The first request goes out immediately. With `max_attempts` set, one more
/// interval is allowed for the last request's answer before giving up.
pub(crate) async fn retry_handshake(
    interval: Duration,
    max_attempts: Option<u32>,
    cancel: &CancelToken,
    is_pending: impl Fn() -> bool,
    mut send: impl FnMut(u32),
) -> RetryOutcome {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts: u32 = 0;

    loop {
        let _ = ticker.tick().await;
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }
        if !is_pending() {
            return RetryOutcome::Settled;
        }
        if max_attempts.is_some_and(|max| attempts >= max) {
            return RetryOutcome::Exhausted { attempts };
        }
        attempts += 1;
        send(attempts);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::new(n)
    }

    fn host_waiting() -> Session {
        let mut s = Session::default();
        s.await_peer();
        s
    }

    #[test]
    fn guest_attempts_use_increasing_sessions() {
        let mut s = Session::default();
        assert_eq!(s.begin_attempt(), sid(1));
        s.reset();
        assert_eq!(s.begin_attempt(), sid(2));
        assert_eq!(s.status, BridgeStatus::Connecting);
    }

    #[test]
    fn full_three_way_handshake() {
        let mut guest = Session::default();
        let mut host = host_waiting();

        let id = guest.begin_attempt();
        assert_eq!(host.on_request(BridgeRole::Host, id), Transition::Respond);
        assert_eq!(host.status, BridgeStatus::Connecting);
        assert_eq!(guest.on_response(BridgeRole::Guest, id), Transition::Established);
        assert_eq!(host.on_ack(BridgeRole::Host, id), Transition::Established);

        assert_eq!(guest.status, BridgeStatus::Connected);
        assert_eq!(host.status, BridgeStatus::Connected);
        assert_eq!(host.id, guest.id);
    }

    #[test]
    fn roles_ignore_the_other_sides_messages() {
        let mut guest = Session::default();
        let id = guest.begin_attempt();
        assert_eq!(guest.on_request(BridgeRole::Guest, id), Transition::Ignore);
        assert_eq!(guest.on_ack(BridgeRole::Guest, id), Transition::Ignore);

        let mut host = host_waiting();
        assert_eq!(host.on_response(BridgeRole::Host, sid(0)), Transition::Ignore);
    }

    #[test]
    fn idle_host_ignores_requests() {
        let mut host = Session::default();
        assert_eq!(host.on_request(BridgeRole::Host, sid(1)), Transition::Ignore);
    }

    #[test]
    fn mismatched_response_is_ignored() {
        let mut guest = Session::default();
        let _ = guest.begin_attempt();
        let current = guest.begin_attempt();
        assert_eq!(guest.on_response(BridgeRole::Guest, sid(1)), Transition::Ignore);
        assert_eq!(guest.status, BridgeStatus::Connecting);
        assert_eq!(guest.on_response(BridgeRole::Guest, current), Transition::Established);
    }

    #[test]
    fn duplicate_response_is_reacknowledged() {
        let mut guest = Session::default();
        let id = guest.begin_attempt();
        let _ = guest.on_response(BridgeRole::Guest, id);
        assert_eq!(guest.on_response(BridgeRole::Guest, id), Transition::Reacknowledge);
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let mut host = host_waiting();
        let _ = host.on_request(BridgeRole::Host, sid(1));
        assert_eq!(host.on_ack(BridgeRole::Host, sid(1)), Transition::Established);
        assert_eq!(host.on_ack(BridgeRole::Host, sid(1)), Transition::Ignore);
    }

    #[test]
    fn ack_for_other_session_is_ignored() {
        let mut host = host_waiting();
        let _ = host.on_request(BridgeRole::Host, sid(2));
        assert_eq!(host.on_ack(BridgeRole::Host, sid(1)), Transition::Ignore);
        assert_eq!(host.status, BridgeStatus::Connecting);
    }

    #[test]
    fn connected_host_accepts_only_newer_sessions() {
        let mut host = host_waiting();
        let _ = host.on_request(BridgeRole::Host, sid(3));
        let _ = host.on_ack(BridgeRole::Host, sid(3));

        assert_eq!(host.on_request(BridgeRole::Host, sid(3)), Transition::Ignore);
        assert_eq!(host.on_request(BridgeRole::Host, sid(2)), Transition::Ignore);
        assert_eq!(host.status, BridgeStatus::Connected);

        assert_eq!(host.on_request(BridgeRole::Host, sid(4)), Transition::Respond);
        assert_eq!(host.status, BridgeStatus::Connecting);
        assert_eq!(host.id, sid(4));
    }

    #[test]
    fn connecting_host_keeps_newest_answered_session() {
        let mut host = host_waiting();
        assert_eq!(host.on_request(BridgeRole::Host, sid(5)), Transition::Respond);
        assert_eq!(host.on_request(BridgeRole::Host, sid(4)), Transition::Ignore);
        assert_eq!(host.id, sid(5));

        // Retries of the answered session are answered again.
        assert_eq!(host.on_request(BridgeRole::Host, sid(5)), Transition::Respond);
        assert_eq!(host.on_ack(BridgeRole::Host, sid(5)), Transition::Established);
        assert_eq!(host.status, BridgeStatus::Connected);
        assert_eq!(host.id, sid(5));
    }

    #[test]
    fn reset_host_accepts_any_session_again() {
        let mut host = host_waiting();
        let _ = host.on_request(BridgeRole::Host, sid(9));
        host.reset();
        host.await_peer();

        assert_eq!(host.on_request(BridgeRole::Host, sid(1)), Transition::Respond);
        assert_eq!(host.id, sid(1));
    }

    #[test]
    fn traffic_acceptance_follows_session() {
        let mut guest = Session::default();
        let id = guest.begin_attempt();
        assert!(guest.accepts(id));
        assert!(!guest.accepts(sid(0)));
    }

    proptest! {
        #[test]
        fn connected_host_only_moves_forward(
            active in 1u64..1_000,
            requests in proptest::collection::vec(0u64..2_000, 0..32),
        ) {
            let mut host = host_waiting();
            let _ = host.on_request(BridgeRole::Host, sid(active));
            let _ = host.on_ack(BridgeRole::Host, sid(active));

            for incoming in requests {
                let before = host;
                let transition = host.on_request(BridgeRole::Host, sid(incoming));
                if before.status == BridgeStatus::Connected && incoming <= before.id.get() {
                    prop_assert_eq!(transition, Transition::Ignore);
                    prop_assert_eq!(host, before);
                } else {
                    prop_assert_eq!(transition, Transition::Respond);
                    prop_assert_eq!(host.id, sid(incoming));
                    prop_assert_eq!(host.status, BridgeStatus::Connecting);
                    let _ = host.on_ack(BridgeRole::Host, sid(incoming));
                }
            }
        }

        #[test]
        fn guest_ignores_every_response_but_its_own(
            attempts in 1usize..8,
            incoming in 0u64..16,
        ) {
            let mut guest = Session::default();
            let current = (0..attempts)
                .map(|_| guest.begin_attempt())
                .last()
                .unwrap_or_default();
            let transition = guest.on_response(BridgeRole::Guest, sid(incoming));
            if sid(incoming) == current {
                prop_assert_eq!(transition, Transition::Established);
            } else {
                prop_assert_eq!(transition, Transition::Ignore);
                prop_assert_eq!(guest.status, BridgeStatus::Connecting);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sends_until_settled() {
        let sent = Arc::new(AtomicU32::new(0));
        let pending = Arc::new(AtomicBool::new(true));
        let token = CancelToken::new();

        let s = Arc::clone(&sent);
        let p = Arc::clone(&pending);
        let outcome = retry_handshake(
            Duration::from_millis(100),
            None,
            &token,
            || pending.load(Ordering::SeqCst),
            move |attempt| {
                s.store(attempt, Ordering::SeqCst);
                if attempt == 3 {
                    p.store(false, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert_eq!(outcome, RetryOutcome::Settled);
        assert_eq!(sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let token = CancelToken::new();
        let mut sent = 0;
        let started = tokio::time::Instant::now();

        let outcome = retry_handshake(
            Duration::from_millis(50),
            Some(4),
            &token,
            || true,
            |_| sent += 1,
        )
        .await;

        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 4 });
        assert_eq!(sent, 4);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_cancel() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let mut sent = 0;

        let outcome = retry_handshake(
            Duration::from_millis(10),
            None,
            &token,
            || true,
            |attempt| {
                sent += 1;
                if attempt == 2 {
                    canceller.cancel(None);
                }
            },
        )
        .await;

        assert_eq!(outcome, RetryOutcome::Cancelled);
        assert_eq!(sent, 2);
    }
}

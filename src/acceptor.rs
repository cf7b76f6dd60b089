//! The per-peer Paxos acceptor: the mutex-protected state described in
//! spec.md §3 and the PREPARE/ACCEPT rules of §4.3.
//!
//! Durability note: this is the in-memory variant only. A crash followed
//! by a restart loses `promised`/`accepted_number`/`accepted_value` and
//! can therefore violate Paxos safety (the restarted acceptor may
//! re-promise a number lower than one it promised before crashing). A
//! production deployment would persist these three fields synchronously
//! before replying to `PREPARE`/`ACCEPT`; this crate deliberately does
//! not, per the Non-goals in spec.md and DESIGN.md.

use crate::message::{Message, PeerId, ProposalNumber};
use crate::profile::Profile;
use log::info;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Logging view of an inbound `PREPARE(n)`, dumped at INFO the way the
/// teacher's `acceptor.rs` dumps its `PrepareRequest`.
#[derive(Serialize)]
struct PrepareLog {
    proposal_number: ProposalNumber,
}

/// Logging view of an inbound `ACCEPT(n, v)`.
#[derive(Serialize)]
struct AcceptLog {
    proposal_number: ProposalNumber,
    value: String,
}

/// The acceptor's in-memory state.
///
/// Invariants, checked with `debug_assert!` at the points where they
/// could be violated:
/// - `promised >= accepted_number` whenever both are `Some`.
/// - `accepted_number.is_some() == accepted_value.is_some()`.
/// - `next_sequence` only increases.
#[derive(Debug, Default)]
pub struct AcceptorState {
    pub next_sequence: u64,
    pub promised: Option<ProposalNumber>,
    pub accepted_number: Option<ProposalNumber>,
    pub accepted_value: Option<String>,
}

impl AcceptorState {
    fn check_invariants(&self) {
        if let (Some(promised), Some(accepted)) = (self.promised, self.accepted_number) {
            debug_assert!(promised >= accepted, "promised must never trail accepted");
        }
        debug_assert_eq!(
            self.accepted_number.is_some(),
            self.accepted_value.is_some(),
            "accepted_number and accepted_value must be set together"
        );
    }
}

/// One peer's acceptor role: state behind a single mutex plus the
/// `Profile` used to simulate delay and loss on replies.
pub struct Acceptor {
    id: PeerId,
    state: Mutex<AcceptorState>,
    profile: Arc<dyn Profile>,
}

impl Acceptor {
    #[must_use]
    pub fn new(id: PeerId, profile: Arc<dyn Profile>) -> Self {
        Acceptor {
            id,
            state: Mutex::new(AcceptorState::default()),
            profile,
        }
    }

    /// Draw the next proposal sequence number for this peer and turn it
    /// into a [`ProposalNumber`]. Sequences start at 1 for a peer's
    /// first attempt.
    pub async fn next_proposal_number(&self) -> ProposalNumber {
        let mut state = self.state.lock().await;
        state.next_sequence += 1;
        crate::message::proposal_number(state.next_sequence, self.id)
    }

    /// The value and proposal number currently accepted, if any. Used by
    /// the proposer to cast its own self-vote without a loopback send
    /// (spec.md §9, "self-responses").
    pub async fn accepted(&self) -> Option<(ProposalNumber, String)> {
        let state = self.state.lock().await;
        state.accepted_number.zip(state.accepted_value.clone())
    }

    /// Snapshot the full state. Exposed for tests and diagnostics.
    pub async fn snapshot(
        &self,
    ) -> (Option<ProposalNumber>, Option<ProposalNumber>, Option<String>) {
        let state = self.state.lock().await;
        (
            state.promised,
            state.accepted_number,
            state.accepted_value.clone(),
        )
    }

    /// Handle an inbound `PREPARE(n)`, applying the profile's simulated
    /// delay after the state transition commits. Returns `None` if the
    /// profile decided to drop the reply.
    pub async fn on_prepare(&self, proposal_number: ProposalNumber) -> Option<Message> {
        info!(
            "member {} received prepare message:\n{}",
            self.id,
            serde_yaml::to_string(&PrepareLog { proposal_number }).unwrap() // Serialization is safe.
        );

        let reply = {
            let mut state = self.state.lock().await;
            match state.promised {
                Some(promised) if proposal_number <= promised => Message::reject(promised, self.id),
                _ => {
                    state.promised = Some(proposal_number);
                    state.check_invariants();
                    Message::promise(
                        proposal_number,
                        self.id,
                        state.accepted_number.zip(state.accepted_value.clone()),
                    )
                }
            }
        };

        self.profile_gate(reply).await
    }

    /// Handle an inbound `ACCEPT(n, v)`. Note the `>=` (not `>`): a
    /// proposer that just collected promises at `n` must still be able
    /// to succeed even though its own PREPARE already raised `promised`
    /// to `n`.
    pub async fn on_accept(
        &self,
        proposal_number: ProposalNumber,
        value: String,
    ) -> Option<Message> {
        info!(
            "member {} received accept message:\n{}",
            self.id,
            serde_yaml::to_string(&AcceptLog {
                proposal_number,
                value: value.clone(),
            })
            .unwrap() // Serialization is safe.
        );

        let reply = {
            let mut state = self.state.lock().await;
            match state.promised {
                Some(promised) if proposal_number < promised => Message::reject(promised, self.id),
                _ => {
                    state.promised = Some(proposal_number);
                    state.accepted_number = Some(proposal_number);
                    state.accepted_value = Some(value.clone());
                    state.check_invariants();
                    Message::accepted(proposal_number, value, self.id)
                }
            }
        };

        self.profile_gate(reply).await
    }

    /// Apply the profile's simulated delay, then probabilistically
    /// swallow the reply. The state transition above has already
    /// committed by the time this runs, so a drop here never corrupts
    /// state — it only withholds the response.
    async fn profile_gate(&self, reply: Message) -> Option<Message> {
        tokio::time::sleep(self.profile.delay()).await;
        if self.profile.should_drop() {
            None
        } else {
            Some(reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::proposal_number;
    use crate::profile::StandardProfile;

    fn reliable_acceptor(id: PeerId) -> Acceptor {
        Acceptor::new(id, Arc::new(StandardProfile::Immediate))
    }

    #[tokio::test]
    async fn prepare_with_higher_number_is_promised() {
        let acceptor = reliable_acceptor(1);
        let n = proposal_number(1, 1);
        let reply = acceptor.on_prepare(n).await.expect("not dropped");
        assert!(matches!(reply.kind, crate::message::MessageKind::Promise));
        assert_eq!(reply.accepted_proposal_number, None);
    }

    #[tokio::test]
    async fn prepare_with_equal_number_is_rejected() {
        let acceptor = reliable_acceptor(1);
        let n = proposal_number(1, 1);
        acceptor.on_prepare(n).await.unwrap();
        let reply = acceptor.on_prepare(n).await.unwrap();
        assert!(matches!(reply.kind, crate::message::MessageKind::Reject));
        assert_eq!(reply.proposal_number, n);
    }

    #[tokio::test]
    async fn prepare_with_next_number_is_promised() {
        let acceptor = reliable_acceptor(1);
        let n = proposal_number(1, 1);
        acceptor.on_prepare(n).await.unwrap();
        let next = proposal_number(2, 1);
        let reply = acceptor.on_prepare(next).await.unwrap();
        assert!(matches!(reply.kind, crate::message::MessageKind::Promise));
    }

    #[tokio::test]
    async fn accept_equal_to_promised_is_accepted() {
        let acceptor = reliable_acceptor(1);
        let n = proposal_number(1, 1);
        acceptor.on_prepare(n).await.unwrap();
        let reply = acceptor.on_accept(n, "A".to_string()).await.unwrap();
        assert!(matches!(reply.kind, crate::message::MessageKind::Accepted));
        let (promised, accepted_number, accepted_value) = acceptor.snapshot().await;
        assert_eq!(promised, Some(n));
        assert_eq!(accepted_number, Some(n));
        assert_eq!(accepted_value, Some("A".to_string()));
    }

    #[tokio::test]
    async fn accept_below_promised_is_rejected() {
        let acceptor = reliable_acceptor(1);
        let low = proposal_number(1, 1);
        let high = proposal_number(2, 1);
        acceptor.on_prepare(high).await.unwrap();
        let reply = acceptor.on_accept(low, "A".to_string()).await.unwrap();
        assert!(matches!(reply.kind, crate::message::MessageKind::Reject));
        assert_eq!(reply.proposal_number, high);
    }

    #[tokio::test]
    async fn promise_carries_previously_accepted_value() {
        let acceptor = reliable_acceptor(2);
        let first = proposal_number(1, 2);
        acceptor.on_prepare(first).await.unwrap();
        acceptor.on_accept(first, "old".to_string()).await.unwrap();

        let second = proposal_number(2, 1);
        let reply = acceptor.on_prepare(second).await.unwrap();
        assert_eq!(reply.accepted_proposal_number, Some(first));
        assert_eq!(reply.value, Some("old".to_string()));
    }

    #[tokio::test]
    async fn accepted_value_binding_holds_initially() {
        let acceptor = reliable_acceptor(1);
        let (_, accepted_number, accepted_value) = acceptor.snapshot().await;
        assert!(accepted_number.is_none());
        assert!(accepted_value.is_none());
    }

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically() {
        let acceptor = reliable_acceptor(1);
        let first = acceptor.next_proposal_number().await;
        let second = acceptor.next_proposal_number().await;
        assert!(second > first);
    }
}

//! The proposer driver: the two-phase quorum collection of spec.md §4.4,
//! fanned out over every live session with `FuturesUnordered` and
//! resolved against each peer's simulated [`crate::profile::Profile`].

use crate::message::{Message, MessageKind, PeerId, ProposalNumber};
use crate::peer::{PeerNode, PendingRouter};
use crate::transport::Session;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::oneshot;

/// The outcome of one `propose` attempt (spec.md §4.4).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProposalOutcome {
    /// A value was chosen — not necessarily the value this attempt
    /// proposed; an earlier attempt may already have fixed one, which
    /// this attempt is then obligated to ratify.
    Chosen(String),
    /// Fewer than a quorum of replies arrived in phase 1 or phase 2.
    LostQuorum,
    /// The node was shut down before a quorum could be reached.
    Aborted,
}

/// Drive a single proposal attempt for `value` to completion. A single
/// call performs exactly one attempt with one proposal number; it never
/// retries on `LostQuorum` (spec.md §4.4, "Retry policy" — that decision
/// belongs to the caller).
pub async fn propose(peer: Arc<PeerNode>, value: &str) -> ProposalOutcome {
    if !peer.is_running() {
        return ProposalOutcome::Aborted;
    }

    let quorum = peer.addressbook.quorum();
    let n = peer.acceptor.next_proposal_number().await;
    info!(
        "member {} proposing {:?} under proposal number {:#x}",
        peer.id, value, n
    );

    let (promise_count, highest_accepted) = phase1(&peer, n).await;
    if promise_count < quorum {
        if !peer.is_running() {
            return ProposalOutcome::Aborted;
        }
        warn!(
            "member {} lost quorum in phase 1: {}/{} promises",
            peer.id, promise_count, quorum
        );
        return ProposalOutcome::LostQuorum;
    }

    // If some acceptor already accepted a value under an earlier
    // proposal, this attempt must ratify it rather than its own `value`.
    let candidate = highest_accepted
        .map(|(_, v)| v)
        .unwrap_or_else(|| value.to_string());

    let accepted_count = phase2(&peer, n, candidate.clone()).await;
    if accepted_count < quorum {
        if !peer.is_running() {
            return ProposalOutcome::Aborted;
        }
        warn!(
            "member {} lost quorum in phase 2: {}/{} accepted",
            peer.id, accepted_count, quorum
        );
        return ProposalOutcome::LostQuorum;
    }

    info!("member {} observed consensus reached on {:?}", peer.id, candidate);
    ProposalOutcome::Chosen(candidate)
}

/// Broadcast `PREPARE(n)` to every live session and cast the node's own
/// self-vote directly against its acceptor (spec.md §9, "self-responses"
/// — no loopback send). Returns the number of `PROMISE` replies observed
/// and the `(proposal_number, value)` pair with the highest
/// `accepted_proposal_number` among them, if any.
async fn phase1(
    peer: &Arc<PeerNode>,
    n: ProposalNumber,
) -> (usize, Option<(ProposalNumber, String)>) {
    let mut promises = 0_usize;
    let mut highest: Option<(ProposalNumber, String)> = None;

    if let Some(reply) = cancellable(peer, peer.acceptor.on_prepare(n)).await.flatten() {
        if matches!(reply.kind, MessageKind::Promise) {
            promises += 1;
            record_highest(&mut highest, reply.accepted_proposal_number, reply.value);
        }
    }

    let sessions = peer.live_sessions().await;
    let mut inflight = FuturesUnordered::new();
    for session in sessions {
        let peer = Arc::clone(peer);
        inflight.push(async move {
            let request = Message::prepare(n, peer.id);
            round_trip(&peer, &session, request).await
        });
    }

    while let Some(reply) = inflight.next().await {
        if let Some(message) = reply {
            if matches!(message.kind, MessageKind::Promise) {
                promises += 1;
                record_highest(&mut highest, message.accepted_proposal_number, message.value);
            }
        }
    }

    (promises, highest)
}

/// Broadcast `ACCEPT(n, value)` to every live session plus the node's
/// own self-vote. Returns the number of `ACCEPTED` replies observed.
async fn phase2(peer: &Arc<PeerNode>, n: ProposalNumber, value: String) -> usize {
    let mut accepted = 0_usize;

    if let Some(reply) = cancellable(peer, peer.acceptor.on_accept(n, value.clone()))
        .await
        .flatten()
    {
        if matches!(reply.kind, MessageKind::Accepted) {
            accepted += 1;
        }
    }

    let sessions = peer.live_sessions().await;
    let mut inflight = FuturesUnordered::new();
    for session in sessions {
        let peer = Arc::clone(peer);
        let value = value.clone();
        inflight.push(async move {
            let request = Message::accept(n, value, peer.id);
            round_trip(&peer, &session, request).await
        });
    }

    while let Some(reply) = inflight.next().await {
        if let Some(message) = reply {
            if matches!(message.kind, MessageKind::Accepted) {
                accepted += 1;
            }
        }
    }

    accepted
}

fn record_highest(
    slot: &mut Option<(ProposalNumber, String)>,
    candidate_number: Option<ProposalNumber>,
    candidate_value: Option<String>,
) {
    let (Some(candidate_number), Some(candidate_value)) = (candidate_number, candidate_value)
    else {
        return;
    };
    match slot {
        Some((current, _)) if *current >= candidate_number => {}
        _ => *slot = Some((candidate_number, candidate_value)),
    }
}

/// One round-trip to a single peer's session: apply the profile's
/// simulated delay and drop before sending, register a reply slot keyed
/// by the peer's id, send, and wait for the matching reply bounded by
/// the profile's per-message timeout. Returns `None` on drop, send
/// failure, or timeout — a single unreachable peer never fails the
/// overall attempt, it only shrinks the effective response set.
async fn round_trip(peer: &Arc<PeerNode>, session: &Arc<Session>, request: Message) -> Option<Message> {
    let remote_id = session.remote_id();
    let reply_slot = peer.pending().register(remote_id);

    let reply = cancellable(
        peer,
        round_trip_attempt(peer, remote_id, session, request, reply_slot),
    )
    .await
    .flatten();

    if reply.is_none() {
        peer.pending().deregister(remote_id);
    }
    reply
}

/// The send-then-wait body of [`round_trip`].
async fn round_trip_attempt(
    peer: &Arc<PeerNode>,
    remote_id: PeerId,
    session: &Arc<Session>,
    request: Message,
    reply_slot: oneshot::Receiver<Message>,
) -> Option<Message> {
    tokio::time::sleep(peer.profile.delay()).await;
    if peer.profile.should_drop() {
        return None;
    }
    if session.send(&request).await.is_err() {
        return None;
    }

    match tokio::time::timeout(peer.profile.individual_timeout(), reply_slot).await {
        Ok(Ok(message)) => Some(message),
        _ => None,
    }
}

/// Race `future` against the node's running flag so that `shutdown`
/// (spec.md §5, "cancel outstanding proposer tasks") unblocks any
/// in-flight proposer work immediately rather than leaving it to run out
/// its own timeout. Returns `None` if shutdown won the race.
async fn cancellable<Fut: std::future::Future>(peer: &Arc<PeerNode>, future: Fut) -> Option<Fut::Output> {
    let mut running_rx = peer.subscribe_running();
    tokio::select! {
        biased;
        changed = running_rx.wait_for(|running| !*running) => {
            changed.ok();
            None
        }
        value = future => Some(value),
    }
}

//! The glue holding one council member together: the listener, the
//! outbound dial loop, the handshake, the session registry, the
//! per-session dispatch loop, and shutdown (spec.md §4.5).

use crate::acceptor::Acceptor;
use crate::config::Addressbook;
use crate::error::{PaxosError, Result};
use crate::message::{Message, MessageKind, PeerId};
use crate::profile::Profile;
use crate::transport::{self, Session};
use log::{error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, RwLock};

/// Bounded timeout for outbound connection attempts (spec.md §4.5).
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Routes inbound `PROMISE`/`ACCEPTED`/`REJECT` frames back to whichever
/// proposer task is waiting on a reply from that sender.
///
/// Keyed by sender `PeerId` rather than by `proposal_number`: at most one
/// proposer round-trip is ever outstanding against a given peer at a
/// time in this crate (Phase 1 completes, or times out, before Phase 2
/// starts), and a `REJECT`'s `proposal_number` field carries the
/// responder's current `promised` value rather than echoing the
/// request's number, so it cannot be used as a correlation key anyway.
/// See DESIGN.md for the full rationale.
#[derive(Default)]
struct PendingReplies {
    slots: std::sync::Mutex<HashMap<PeerId, oneshot::Sender<Message>>>,
}

impl PendingReplies {
    fn register(&self, sender: PeerId) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(sender, tx);
        rx
    }

    fn deregister(&self, sender: PeerId) {
        self.slots.lock().unwrap().remove(&sender);
    }

    /// Deliver `message` to the registered waiter for `sender`, if any.
    /// Returns whether a waiter was found — a message with no waiter is
    /// simply discarded, matching spec.md's "ignored" outcome for
    /// unsolicited proposer-only replies.
    fn deliver(&self, sender: PeerId, message: Message) -> bool {
        if let Some(tx) = self.slots.lock().unwrap().remove(&sender) {
            let _ = tx.send(message);
            true
        } else {
            false
        }
    }
}

/// One council member: the addressbook, its acceptor role, the injected
/// `Profile`, and the live session registry.
pub struct PeerNode {
    pub id: PeerId,
    pub addressbook: Addressbook,
    pub acceptor: Acceptor,
    pub profile: Arc<dyn Profile>,
    sessions: RwLock<HashMap<PeerId, Arc<Session>>>,
    pending: PendingReplies,
    running_tx: watch::Sender<bool>,
    // Serializes handshake attempts against the same remote so a
    // concurrent dial and accept can't both win a registration race and
    // leak a session. This is the only lock ordered after `sessions`.
    handshake_lock: AsyncMutex<()>,
}

impl PeerNode {
    #[must_use]
    pub fn new(id: PeerId, addressbook: Addressbook, profile: Arc<dyn Profile>) -> Arc<Self> {
        let (running_tx, _rx) = watch::channel(true);
        Arc::new(PeerNode {
            acceptor: Acceptor::new(id, profile.clone()),
            id,
            addressbook,
            profile,
            sessions: RwLock::new(HashMap::new()),
            pending: PendingReplies::default(),
            running_tx,
            handshake_lock: AsyncMutex::new(()),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// Subscribe to the running flag; used by the proposer to notice a
    /// shutdown while a round-trip is in flight.
    pub(crate) fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }

    pub(crate) fn pending(&self) -> &impl PendingRouter {
        &self.pending
    }

    /// Snapshot of every currently live session.
    pub async fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn has_session(&self, id: PeerId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Run this node: dial every other peer in the background and block
    /// accepting inbound connections until `shutdown` is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let dialer = tokio::spawn(Arc::clone(&self).dial_all());
        let result = Arc::clone(&self).listen().await;
        dialer.abort();
        result
    }

    async fn listen(self: Arc<Self>) -> Result<()> {
        let addr = self
            .addressbook
            .address_of(self.id)
            .ok_or_else(|| PaxosError::Protocol(format!("no address configured for member {}", self.id)))?;
        let listener = TcpListener::bind(addr).await.map_err(PaxosError::Transport)?;
        info!("member {} listening on {}", self.id, addr);

        let mut running_rx = self.subscribe_running();
        loop {
            tokio::select! {
                biased;
                changed = running_rx.wait_for(|running| !*running) => {
                    changed.ok();
                    info!("member {} stopped accepting connections", self.id);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let node = Arc::clone(&self);
                            tokio::spawn(node.accept_connection(stream, remote_addr));
                        }
                        Err(error) => {
                            error!("member {} listener accept failed: {}", self.id, error);
                        }
                    }
                }
            }
        }
    }

    async fn accept_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        match transport::handshake(stream, self.id).await {
            Ok(session) => {
                info!(
                    "member {} accepted a connection from member {} ({})",
                    self.id,
                    session.remote_id(),
                    remote_addr
                );
                self.register_session(session).await;
            }
            Err(error) => {
                warn!(
                    "member {} handshake with {} failed: {}",
                    self.id, remote_addr, error
                );
            }
        }
    }

    async fn dial_all(self: Arc<Self>) {
        let peers: Vec<_> = self.addressbook.peers_excluding(self.id).collect();
        let mut tasks = Vec::with_capacity(peers.len());
        for (peer_id, addr) in peers {
            let node = Arc::clone(&self);
            tasks.push(tokio::spawn(node.dial_one(peer_id, addr)));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn dial_one(self: Arc<Self>, peer_id: PeerId, addr: SocketAddr) {
        if self.has_session(peer_id).await {
            return;
        }
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => match transport::handshake(stream, self.id).await {
                Ok(session) => {
                    info!("member {} dialed member {} at {}", self.id, peer_id, addr);
                    self.register_session(session).await;
                }
                Err(error) => {
                    warn!(
                        "member {} handshake while dialing member {} failed: {}",
                        self.id, peer_id, error
                    );
                }
            },
            Ok(Err(error)) => {
                warn!(
                    "member {} failed to connect to member {} at {}: {}",
                    self.id, peer_id, addr, error
                );
            }
            Err(_) => {
                warn!(
                    "member {} timed out connecting to member {} at {}",
                    self.id, peer_id, addr
                );
            }
        }
    }

    async fn register_session(self: &Arc<Self>, session: Session) {
        let _guard = self.handshake_lock.lock().await;
        let session = Arc::new(session);
        let remote_id = session.remote_id();
        let previous = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(remote_id, Arc::clone(&session))
        };
        if let Some(previous) = previous {
            previous.close();
        }
        tokio::spawn(Arc::clone(self).dispatch_loop(session));
    }

    async fn dispatch_loop(self: Arc<Self>, session: Arc<Session>) {
        loop {
            match session.receive().await {
                Ok(message) => self.route(&session, message).await,
                Err(_) => break,
            }
        }

        let remote_id = session.remote_id();
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(&remote_id) {
            if Arc::ptr_eq(current, &session) {
                sessions.remove(&remote_id);
            }
        }
    }

    async fn route(&self, session: &Arc<Session>, message: Message) {
        match message.kind {
            MessageKind::Prepare => {
                if let Some(reply) = self.acceptor.on_prepare(message.proposal_number).await {
                    self.reply(session, &reply).await;
                }
            }
            MessageKind::Accept => {
                let value = message.value.unwrap_or_default();
                if let Some(reply) = self.acceptor.on_accept(message.proposal_number, value).await {
                    self.reply(session, &reply).await;
                }
            }
            MessageKind::Promise | MessageKind::Accepted | MessageKind::Reject => {
                self.pending.deliver(message.sender_id, message);
            }
            MessageKind::Handshake => {
                warn!(
                    "member {} received a stray handshake from member {} after session setup",
                    self.id, message.sender_id
                );
            }
        }
    }

    async fn reply(&self, session: &Arc<Session>, reply: &Message) {
        if let Err(error) = session.send(reply).await {
            warn!(
                "member {} failed to reply to member {}: {}",
                self.id,
                session.remote_id(),
                error
            );
        }
    }

    /// Stop accepting connections, unblock every pending `receive`, and
    /// close every live session. Idempotent.
    pub async fn shutdown(&self) {
        let became_stopped = self
            .running_tx
            .send_if_modified(|running| std::mem::replace(running, false));
        if !became_stopped {
            return;
        }
        info!("member {} shutting down", self.id);
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.close();
        }
    }
}

/// A narrow trait object boundary so `proposer.rs` can register and
/// deliver replies without depending on `PendingReplies`'s private type.
pub(crate) trait PendingRouter: Send + Sync {
    fn register(&self, sender: PeerId) -> oneshot::Receiver<Message>;
    fn deregister(&self, sender: PeerId);
}

impl PendingRouter for PendingReplies {
    fn register(&self, sender: PeerId) -> oneshot::Receiver<Message> {
        PendingReplies::register(self, sender)
    }

    fn deregister(&self, sender: PeerId) {
        PendingReplies::deregister(self, sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::StandardProfile;
    use std::net::{IpAddr, Ipv4Addr};

    fn book(ports: &[(PeerId, u16)]) -> Addressbook {
        let config = ports
            .iter()
            .map(|(id, port)| format!("- id: {id}\n  address: \"127.0.0.1:{port}\"\n"))
            .collect::<String>();
        Addressbook::parse(&config).unwrap()
    }

    #[tokio::test]
    async fn two_nodes_handshake_and_register_sessions() {
        let port_a = 19001;
        let port_b = 19002;
        let addressbook = book(&[(1, port_a), (2, port_b)]);

        let node_a = PeerNode::new(1, addressbook.clone(), Arc::new(StandardProfile::Immediate));
        let node_b = PeerNode::new(2, addressbook, Arc::new(StandardProfile::Immediate));

        let handle_a = tokio::spawn(Arc::clone(&node_a).run());
        let handle_b = tokio::spawn(Arc::clone(&node_b).run());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(node_a.live_sessions().await.len(), 1);
        assert_eq!(node_b.live_sessions().await.len(), 1);

        node_a.shutdown().await;
        node_b.shutdown().await;
        let _ = tokio::join!(handle_a, handle_b);
        let _ = IpAddr::V4(Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let addressbook = book(&[(1, 19101)]);
        let node = PeerNode::new(1, addressbook, Arc::new(StandardProfile::Immediate));
        node.shutdown().await;
        node.shutdown().await;
        assert!(!node.is_running());
    }
}

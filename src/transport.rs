//! One framed, ordered, full-duplex TCP channel to a specific remote
//! peer, plus the handshake that establishes it.
//!
//! Grounded on the length-prefixed read loop in the pack's
//! `sjxcrypto-TRv1` consensus transport, generalized from a one-shot
//! accept-and-forward listener into a persistent, bidirectional
//! [`Session`] that a peer keeps open for the lifetime of the
//! connection.

use crate::error::{PaxosError, Result};
use crate::message::{Message, MessageKind, PeerId, HEADER_LEN};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

/// A single bidirectional, message-framed channel to `remote_id`.
///
/// Concurrent senders are serialized by the write-side mutex; readers
/// are serialized separately by the read-side mutex. In this crate only
/// one task ever calls `receive` on a given session (the peer's dispatch
/// loop, per spec.md §9's receive-channel-collision note), but the
/// mutex makes that a convention rather than a requirement baked into
/// the type.
pub struct Session {
    remote_id: PeerId,
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<OwnedReadHalf>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Session {
    fn from_halves(remote_id: PeerId, reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        Session {
            remote_id,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// The peer identifier this session was established with, learned
    /// during the handshake.
    #[must_use]
    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PaxosError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is closed",
            )))
        } else {
            Ok(())
        }
    }

    /// Serialize and transmit `message`. Either the whole frame is
    /// written or a `Transport` error is returned.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        let frame = message.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(PaxosError::Transport)?;
        writer.flush().await.map_err(PaxosError::Transport)?;
        Ok(())
    }

    /// Block until a full frame arrives and return the decoded message.
    /// Returns a `Transport` error on EOF, framing failure, connection
    /// loss, or if `close` is called while this call is pending.
    pub async fn receive(&self) -> Result<Message> {
        self.check_open()?;
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            () = self.close_signal.notified() => Err(PaxosError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "session was closed while receiving",
            ))),
            result = read_frame(&mut reader) => result,
        }
    }

    /// Idempotently close the session, unblocking any pending `receive`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }

    /// Whether `close` has already been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Message> {
    let mut header = [0_u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(PaxosError::Transport)?;
    let len = crate::message::read_header_len(&header);
    let mut payload = vec![0_u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(PaxosError::Transport)?;
    Message::decode_payload(&payload)
}

/// Perform the handshake on a freshly accepted or connected stream: both
/// sides send `HANDSHAKE(self_id)` and expect one back. The session is
/// keyed under whatever `sender_id` arrives, per spec.md §4.5. Returns a
/// `Protocol` error (and leaves the stream to be dropped by the caller)
/// if the first frame received is not a handshake.
pub async fn handshake(stream: TcpStream, self_id: PeerId) -> Result<Session> {
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = stream.into_split();

    let frame = Message::handshake(self_id).encode()?;
    write_half
        .write_all(&frame)
        .await
        .map_err(PaxosError::Transport)?;
    write_half.flush().await.map_err(PaxosError::Transport)?;

    let message = read_frame(&mut read_half).await?;
    if message.kind != MessageKind::Handshake {
        return Err(PaxosError::Protocol(format!("{:?}", message.kind)));
    }

    Ok(Session::from_halves(message.sender_id, read_half, write_half))
}

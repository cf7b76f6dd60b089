//! The error taxonomy for the council: transport failures, malformed
//! frames, handshake violations, and shutdown.

use std::io;
use thiserror::Error;

/// Every way a council operation can fail.
///
/// `Transport` and `Protocol` are fatal to the session that raised them
/// but never fatal to a proposal: the proposer and the acceptor's
/// dispatch loop treat a peer that returns either of these as simply
/// absent for the current round.
#[derive(Debug, Error)]
pub enum PaxosError {
    /// A socket-level failure: EOF, a reset connection, or an I/O error
    /// while reading or writing a frame.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A frame could not be decoded: truncation, an unknown message
    /// kind, or a field combination the protocol forbids (for example a
    /// `PROMISE` with no `accepted_proposal_number`).
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The first frame on a new connection was not a `HANDSHAKE`.
    #[error("protocol violation: expected a handshake, got {0}")]
    Protocol(String),

    /// The node is shutting down; the calling operation was abandoned.
    #[error("aborted: node is shutting down")]
    Aborted,
}

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, PaxosError>;

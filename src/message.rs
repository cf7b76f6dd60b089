//! The wire record exchanged between council members and its framing.
//!
//! Every frame on a [`crate::transport::Session`] is a 4-byte little-endian
//! length prefix followed by a `bincode` encoding of a [`Message`]. `encode`
//! and `decode` are mutually inverse over a whole frame; `decode` reports
//! [`PaxosError::Malformed`] on truncation, an unknown kind, or a field
//! combination the protocol does not allow for that kind.

use crate::error::{PaxosError, Result};
use serde::{Deserialize, Serialize};

/// Number of bytes in the length prefix.
pub const HEADER_LEN: usize = 4;

/// The peer identifier type: a small integer, unique per process.
pub type PeerId = u8;

/// A globally unique, totally ordered proposal number. Constructed as
/// `(sequence << 4) | (peer_id & 0xF)`, so ties between proposers using
/// the same sequence are broken by `PeerId`.
pub type ProposalNumber = u64;

/// Combine a per-proposer sequence number and a `PeerId` into a
/// [`ProposalNumber`]. `sequence` must be nonzero so that the resulting
/// number is always positive, per spec.
#[must_use]
pub fn proposal_number(sequence: u64, peer_id: PeerId) -> ProposalNumber {
    (sequence << 4) | (u64::from(peer_id) & 0xF)
}

/// The tag identifying which variant of [`Message`] a frame carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum MessageKind {
    Handshake,
    Prepare,
    Promise,
    Accept,
    Accepted,
    Reject,
}

/// A single protocol message. Not every field is meaningful for every
/// [`MessageKind`]; see [`Message::validate`] for the field combinations
/// each kind requires.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Message {
    pub kind: MessageKind,
    pub proposal_number: ProposalNumber,
    pub value: Option<String>,
    pub sender_id: PeerId,
    pub accepted_proposal_number: Option<ProposalNumber>,
}

impl Message {
    /// Build a `HANDSHAKE` message announcing `sender_id`.
    #[must_use]
    pub fn handshake(sender_id: PeerId) -> Self {
        Message {
            kind: MessageKind::Handshake,
            proposal_number: 0,
            value: None,
            sender_id,
            accepted_proposal_number: None,
        }
    }

    /// Build a `PREPARE(n)` message.
    #[must_use]
    pub fn prepare(proposal_number: ProposalNumber, sender_id: PeerId) -> Self {
        Message {
            kind: MessageKind::Prepare,
            proposal_number,
            value: None,
            sender_id,
            accepted_proposal_number: None,
        }
    }

    /// Build a `PROMISE(n, accepted_value, accepted_proposal_number)`
    /// message. `accepted` carries the responder's previously accepted
    /// `(proposal_number, value)` pair, if any.
    #[must_use]
    pub fn promise(
        proposal_number: ProposalNumber,
        sender_id: PeerId,
        accepted: Option<(ProposalNumber, String)>,
    ) -> Self {
        let (accepted_proposal_number, value) = match accepted {
            Some((n, v)) => (Some(n), Some(v)),
            None => (None, None),
        };
        Message {
            kind: MessageKind::Promise,
            proposal_number,
            value,
            sender_id,
            accepted_proposal_number,
        }
    }

    /// Build an `ACCEPT(n, v)` message.
    #[must_use]
    pub fn accept(proposal_number: ProposalNumber, value: String, sender_id: PeerId) -> Self {
        Message {
            kind: MessageKind::Accept,
            proposal_number,
            value: Some(value),
            sender_id,
            accepted_proposal_number: None,
        }
    }

    /// Build an `ACCEPTED(n, v)` message.
    #[must_use]
    pub fn accepted(proposal_number: ProposalNumber, value: String, sender_id: PeerId) -> Self {
        Message {
            kind: MessageKind::Accepted,
            proposal_number,
            value: Some(value),
            sender_id,
            accepted_proposal_number: None,
        }
    }

    /// Build a `REJECT(promised)` message. `promised` is the responder's
    /// current `promised` value, carried in `proposal_number` so the
    /// proposer learns how high it must go.
    #[must_use]
    pub fn reject(promised: ProposalNumber, sender_id: PeerId) -> Self {
        Message {
            kind: MessageKind::Reject,
            proposal_number: promised,
            value: None,
            sender_id,
            accepted_proposal_number: None,
        }
    }

    /// Check that the field combination is one the protocol allows for
    /// this message's `kind`.
    fn validate(&self) -> Result<()> {
        match self.kind {
            MessageKind::Handshake | MessageKind::Reject => {
                if self.value.is_some() || self.accepted_proposal_number.is_some() {
                    return Err(PaxosError::Malformed(format!(
                        "{:?} must not carry a value or an accepted proposal number",
                        self.kind
                    )));
                }
            }
            MessageKind::Prepare => {
                if self.value.is_some() || self.accepted_proposal_number.is_some() {
                    return Err(PaxosError::Malformed(
                        "PREPARE must not carry a value or an accepted proposal number".into(),
                    ));
                }
            }
            MessageKind::Promise => {
                if self.accepted_proposal_number.is_some() != self.value.is_some() {
                    return Err(PaxosError::Malformed(
                        "PROMISE must carry a value exactly when it carries an accepted \
                         proposal number"
                            .into(),
                    ));
                }
            }
            MessageKind::Accept | MessageKind::Accepted => {
                if self.value.is_none() || self.accepted_proposal_number.is_some() {
                    return Err(PaxosError::Malformed(format!(
                        "{:?} must carry a value and no accepted proposal number",
                        self.kind
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode this message as a full frame: a 4-byte little-endian length
    /// prefix followed by the `bincode` payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let payload = bincode::serialize(self)
            .map_err(|e| PaxosError::Malformed(format!("failed to serialize message: {e}")))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| PaxosError::Malformed("message too large to frame".into()))?;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a message from its `bincode` payload (the bytes following
    /// the length prefix).
    pub fn decode_payload(payload: &[u8]) -> Result<Message> {
        let message: Message = bincode::deserialize(payload)
            .map_err(|e| PaxosError::Malformed(format!("failed to decode message: {e}")))?;
        message.validate()?;
        Ok(message)
    }

    /// Decode a full frame (length prefix plus payload). Fails on
    /// truncation, trailing garbage, or an invalid field combination.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        if frame.len() < HEADER_LEN {
            return Err(PaxosError::Malformed("frame shorter than its header".into()));
        }
        let mut header = [0_u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        let len = read_header_len(&header);
        let payload = &frame[HEADER_LEN..];
        if payload.len() != len {
            return Err(PaxosError::Malformed(format!(
                "frame declared {len} payload bytes but carried {}",
                payload.len()
            )));
        }
        Self::decode_payload(payload)
    }
}

/// Read the payload length carried in a frame's 4-byte header.
#[must_use]
pub fn read_header_len(header: &[u8; HEADER_LEN]) -> usize {
    u32::from_le_bytes(*header) as usize
}

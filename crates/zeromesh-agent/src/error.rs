//! Typed errors for the data-plane hot paths. Everything else in the agent
//! uses `anyhow`; these two enums exist because callers match on them: the
//! switch layer logs-and-continues on send failures, and the receive path
//! counts replay drops separately from authentication failures.

use crate::identity::Address;
use thiserror::Error;

/// Failure to send a frame to a peer.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("unknown peer {0}")]
    UnknownPeer(Address),

    #[error("peer {0} not connected")]
    NotConnected(Address),

    #[error("frame of {0} bytes exceeds maximum payload")]
    FrameTooLarge(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to decrypt an inbound data payload.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("no cipher (peer not connected)")]
    NoCipher,

    #[error("ciphertext too short")]
    TooShort,

    #[error("authentication failed")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("replayed counter {0}")]
    Replay(u64),
}

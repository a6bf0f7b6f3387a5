//! Error types for the coordination layer.
//!
//! One rule decides what becomes a [`ProtocolError`]: violations that cost
//! the offending peer its connection (the dispatcher's caller converts them
//! into a close). Authorization denials are answered inline with `*_failed`
//! replies and never surface here.

use scribe_core::CoreError;
use thiserror::Error;

use crate::protocol::DocKey;

/// A protocol violation on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A command the dispatcher does not know.
    #[error("unexpected command: {0}")]
    UnexpectedCommand(String),

    /// A known command with missing or ill-typed parameters.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The peer speaks a different protocol revision.
    #[error("protocol version mismatch: peer speaks {peer}, we speak {ours}")]
    VersionMismatch { peer: u32, ours: u32 },

    /// A user reference that resolves to no row in the user table.
    #[error("unknown user reference {0}")]
    UnknownUser(u32),

    /// A document reference that resolves to no coordinator.
    #[error("unknown document {0}")]
    UnknownDocument(DocKey),

    /// A document operation that requires an active subscription.
    #[error("not subscribed to document {0}")]
    NotSubscribed(DocKey),

    /// Wire (de)serialization failure.
    #[error("frame codec error: {0}")]
    Codec(String),

    /// The transport connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// An OT-level failure on this link (out-of-range position after
    /// transformation, desynchronized state vectors).
    #[error(transparent)]
    Core(#[from] CoreError),
}

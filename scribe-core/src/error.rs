//! Error types for the OT engine.

use thiserror::Error;

/// Errors surfaced by the operation algebra and Jupiter sites.
///
/// Both variants are protocol-fatal for the document they occur on: an
/// out-of-range position after transformation or a state-vector mismatch
/// means the two sides no longer agree on history, and the coordination
/// layer closes the document for the offending peer. The session survives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A position or range fell outside the document.
    #[error("position {pos} out of bounds for document of length {len}")]
    OutOfBounds { pos: u32, len: u32 },

    /// State vectors no longer line up on a Jupiter link.
    #[error("jupiter link desynchronized: expected sequence {expected}, record carries {got}")]
    Desynchronized { expected: u32, got: u32 },
}

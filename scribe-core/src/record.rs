//! Records: operations stamped for the wire.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// The two-dimensional Jupiter state vector.
///
/// `local` counts operations this site has emitted, `remote` counts peer
/// operations it has applied. A record stamped `(local, remote)` tells the
/// receiver exactly which of its own operations the sender had seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateVector {
    pub local: u32,
    pub remote: u32,
}

impl StateVector {
    pub fn new(local: u32, remote: u32) -> Self {
        Self { local, remote }
    }
}

/// An operation as it crosses the wire: author, payload, state vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// User id of the author; 0 is the server itself.
    pub author: u32,
    pub op: Operation,
    pub sv: StateVector,
}

impl Record {
    pub fn new(author: u32, op: Operation, sv: StateVector) -> Self {
        Self { author, op, sv }
    }
}

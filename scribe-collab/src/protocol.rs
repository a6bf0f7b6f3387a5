//! The wire protocol: typed parameter packets and their codecs.
//!
//! One unit of transport is a [`Packet`]: a command name plus a list of
//! typed parameters, bincode-encoded into a single binary frame.
//!
//! ```text
//! ┌───────────┬──────────────────────────────────────┐
//! │ command   │ params                               │
//! │ string    │ [Uint(u32) | Str(string)] ...        │
//! └───────────┴──────────────────────────────────────┘
//! ```
//!
//! Unqualified integers travel as `Uint`. User and document references are
//! hex strings (`Str`): a user is its id in base 16, a document is the
//! `"owner_id doc_id"` pair, both stable across reconnects. User reference
//! `0` stands for the server itself.
//!
//! Document-scoped traffic is wrapped in a `document` packet whose first two
//! parameters are the document reference and the inner command; everything
//! after is the inner command's payload.
//!
//! Operations are flattened into the parameter list, tag first:
//! `0` NoOp, `1` Insert(pos, text), `2` Delete(pos, len), `3` Split(op, op)
//! with the two halves appended recursively.

use serde::{Deserialize, Serialize};
use std::fmt;

use scribe_core::{Operation, Record, StateVector, UserColor};

use crate::error::ProtocolError;

/// Protocol revision; the server announces it in `welcome` and the client
/// refuses to continue on a mismatch.
pub const PROTOCOL_VERSION: u32 = 2;

/// Command names, shared between the client and server dispatchers.
pub mod command {
    // Session-level, server to client.
    pub const WELCOME: &str = "welcome";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const SYNC_INIT: &str = "sync_init";
    pub const SYNC_USERTABLE_USER: &str = "sync_usertable_user";
    pub const SYNC_DOCLIST_DOCUMENT: &str = "sync_doclist_document";
    pub const SYNC_FINAL: &str = "sync_final";
    pub const USER_JOIN: &str = "user_join";
    pub const USER_PART: &str = "user_part";
    pub const USER_COLOUR: &str = "user_colour";
    pub const USER_COLOUR_FAILED: &str = "user_colour_failed";

    // Session-level, both directions.
    pub const LOGIN: &str = "login";
    pub const DOCUMENT_CREATE: &str = "document_create";
    pub const DOCUMENT_REMOVE: &str = "document_remove";
    pub const MESSAGE: &str = "message";
    pub const USER_PASSWORD: &str = "user_password";

    /// Envelope for document-scoped commands.
    pub const DOCUMENT: &str = "document";

    // Document-scoped inner commands. `sync_init`/`sync_final` double as
    // the content-sync brackets inside a document envelope.
    pub const SYNC_CHUNK: &str = "sync_chunk";
    pub const RENAME: &str = "rename";
    pub const RENAME_FAILED: &str = "rename_failed";
    pub const RECORD: &str = "record";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBE_FAILED: &str = "subscribe_failed";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
}

/// Why a login attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    ColorInUse,
    NameInUse,
    WrongGlobalPassword,
    WrongUserPassword,
    ProtocolVersionMismatch,
    NotEncrypted,
}

impl LoginFailure {
    pub fn code(self) -> u32 {
        match self {
            LoginFailure::ColorInUse => 1,
            LoginFailure::NameInUse => 2,
            LoginFailure::WrongGlobalPassword => 3,
            LoginFailure::WrongUserPassword => 4,
            LoginFailure::ProtocolVersionMismatch => 5,
            LoginFailure::NotEncrypted => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(LoginFailure::ColorInUse),
            2 => Some(LoginFailure::NameInUse),
            3 => Some(LoginFailure::WrongGlobalPassword),
            4 => Some(LoginFailure::WrongUserPassword),
            5 => Some(LoginFailure::ProtocolVersionMismatch),
            6 => Some(LoginFailure::NotEncrypted),
            _ => None,
        }
    }

    /// Human-readable reason, for event consumers.
    pub fn as_str(self) -> &'static str {
        match self {
            LoginFailure::ColorInUse => "colour already in use",
            LoginFailure::NameInUse => "name already in use",
            LoginFailure::WrongGlobalPassword => "wrong session password",
            LoginFailure::WrongUserPassword => "wrong user password",
            LoginFailure::ProtocolVersionMismatch => "protocol version mismatch",
            LoginFailure::NotEncrypted => "connection is not encrypted",
        }
    }
}

/// Stable address of a document: owning user id (0 for server-created
/// documents) plus the owner-local document id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DocKey {
    pub owner: u32,
    pub id: u32,
}

impl DocKey {
    pub fn new(owner: u32, id: u32) -> Self {
        Self { owner, id }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{:x}", self.owner, self.id)
    }
}

/// One typed wire parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Uint(u32),
    Str(String),
}

/// A framed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    command: String,
    params: Vec<Param>,
}

impl Packet {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), params: Vec::new() }
    }

    /// Wraps a document-scoped command: `document <doc_ref> <inner> ...`.
    pub fn for_document(key: DocKey, inner: &str) -> Self {
        Packet::new(command::DOCUMENT)
            .with_doc_ref(key)
            .with_str(inner)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn with_uint(mut self, value: u32) -> Self {
        self.params.push(Param::Uint(value));
        self
    }

    pub fn with_str(mut self, value: impl Into<String>) -> Self {
        self.params.push(Param::Str(value.into()));
        self
    }

    /// Appends a user reference (hex id; 0 is the server).
    pub fn with_user_ref(mut self, id: u32) -> Self {
        self.params.push(Param::Str(format!("{id:x}")));
        self
    }

    /// Appends a document reference.
    pub fn with_doc_ref(mut self, key: DocKey) -> Self {
        self.params.push(Param::Str(format!("{:x} {:x}", key.owner, key.id)));
        self
    }

    pub fn with_color(self, color: UserColor) -> Self {
        self.with_uint(color.red.into())
            .with_uint(color.green.into())
            .with_uint(color.blue.into())
    }

    pub fn uint_at(&self, index: usize) -> Result<u32, ProtocolError> {
        match self.params.get(index) {
            Some(Param::Uint(v)) => Ok(*v),
            Some(Param::Str(_)) => Err(ProtocolError::Malformed(format!(
                "{}: parameter {index} should be an integer",
                self.command
            ))),
            None => Err(self.missing(index)),
        }
    }

    pub fn str_at(&self, index: usize) -> Result<&str, ProtocolError> {
        match self.params.get(index) {
            Some(Param::Str(s)) => Ok(s),
            Some(Param::Uint(_)) => Err(ProtocolError::Malformed(format!(
                "{}: parameter {index} should be a string",
                self.command
            ))),
            None => Err(self.missing(index)),
        }
    }

    pub fn user_ref_at(&self, index: usize) -> Result<u32, ProtocolError> {
        let raw = self.str_at(index)?;
        u32::from_str_radix(raw, 16).map_err(|_| {
            ProtocolError::Malformed(format!(
                "{}: parameter {index} is not a user reference",
                self.command
            ))
        })
    }

    pub fn doc_ref_at(&self, index: usize) -> Result<DocKey, ProtocolError> {
        let raw = self.str_at(index)?;
        let mut parts = raw.split(' ');
        let owner = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok());
        let id = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok());
        match (owner, id, parts.next()) {
            (Some(owner), Some(id), None) => Ok(DocKey::new(owner, id)),
            _ => Err(ProtocolError::Malformed(format!(
                "{}: document reference ought to be two hex integers",
                self.command
            ))),
        }
    }

    pub fn color_at(&self, index: usize) -> Result<UserColor, ProtocolError> {
        let component = |i: usize| -> Result<u8, ProtocolError> {
            let v = self.uint_at(i)?;
            u8::try_from(v).map_err(|_| {
                ProtocolError::Malformed(format!(
                    "{}: colour component {v} out of range",
                    self.command
                ))
            })
        };
        Ok(UserColor::new(component(index)?, component(index + 1)?, component(index + 2)?))
    }

    fn missing(&self, index: usize) -> ProtocolError {
        ProtocolError::Malformed(format!(
            "{}: missing parameter {index} (got {})",
            self.command,
            self.params.len()
        ))
    }

    /// Serializes to the binary wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    /// Deserializes from a binary wire frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (packet, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(packet)
    }
}

/// Flattens an operation into `params`, tag first, recursing for splits.
pub fn write_op(packet: Packet, op: &Operation) -> Packet {
    match op {
        Operation::NoOp => packet.with_uint(0),
        Operation::Insert { pos, text } => {
            packet.with_uint(1).with_uint(*pos).with_str(text.clone())
        }
        Operation::Delete { pos, len } => {
            packet.with_uint(2).with_uint(*pos).with_uint(*len)
        }
        Operation::Split { first, second } => {
            let packet = write_op(packet.with_uint(3), first);
            write_op(packet, second)
        }
    }
}

/// Reads an operation starting at `*index`, advancing it past what was
/// consumed.
pub fn read_op(packet: &Packet, index: &mut usize) -> Result<Operation, ProtocolError> {
    let tag = packet.uint_at(*index)?;
    *index += 1;
    match tag {
        0 => Ok(Operation::NoOp),
        1 => {
            let pos = packet.uint_at(*index)?;
            let text = packet.str_at(*index + 1)?.to_string();
            *index += 2;
            Ok(Operation::Insert { pos, text })
        }
        2 => {
            let pos = packet.uint_at(*index)?;
            let len = packet.uint_at(*index + 1)?;
            *index += 2;
            Ok(Operation::Delete { pos, len })
        }
        3 => {
            let first = read_op(packet, index)?;
            let second = read_op(packet, index)?;
            Ok(Operation::split(first, second))
        }
        other => Err(ProtocolError::Malformed(format!(
            "unknown operation tag {other}"
        ))),
    }
}

/// Appends a record's state vector and operation (the author, when present,
/// is written by the caller: the server prefixes one, clients send none).
pub fn write_record(packet: Packet, record: &Record) -> Packet {
    let packet = packet
        .with_uint(record.sv.local)
        .with_uint(record.sv.remote);
    write_op(packet, &record.op)
}

/// Reads the state vector and operation of a record starting at `*index`.
pub fn read_record(
    packet: &Packet,
    index: &mut usize,
    author: u32,
) -> Result<Record, ProtocolError> {
    let local = packet.uint_at(*index)?;
    let remote = packet.uint_at(*index + 1)?;
    *index += 2;
    let op = read_op(packet, index)?;
    Ok(Record::new(author, op, StateVector::new(local, remote)))
}

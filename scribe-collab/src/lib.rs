//! # scribe-collab — session and document coordination for scribe
//!
//! The coordination layer over the OT engine in `scribe-core`: one central
//! server globally serializes operations while each client↔server pair runs
//! classic two-site Jupiter.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │ ClientBuffer │ ◄─────────────────► │ ServerBuffer │
//! │ (per user)   │   Packet frames     │ (authority)  │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ClientDocument                       ServerDocument
//! (one Jupiter site                    (content + one Jupiter
//!  while subscribed)                    twin per subscriber)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — typed parameter packets, command names, op wire codec
//! - [`document`] — per-document coordination (privileges, subscriptions,
//!   star routing)
//! - [`server`] — the session authority: login, sync, dispatch
//! - [`client`] — a participant's mirrored session state
//! - [`transport`] — WebSocket binding for both roles
//! - [`storage`] — the persisted session object tree
//! - [`crypto`] — crypto collaborator interface plus login digests
//!
//! The buffers are synchronous state machines, so every protocol flow can
//! be exercised in tests without sockets; the transport module is the
//! provided binding for real deployments.

pub mod client;
pub mod crypto;
pub mod document;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transport;

pub use client::{ClientBuffer, ClientEvent};
pub use crypto::{
    login_digest, CipherError, PasswordEncryptor, PlainCipher, PublicKey, SessionCipher,
};
pub use document::{
    find_free_suffix, ClientDocument, DocumentInfo, PrivilegeTable, Privileges,
    ServerDocument, SubscriptionState,
};
pub use error::ProtocolError;
pub use protocol::{DocKey, LoginFailure, Packet, Param, PROTOCOL_VERSION};
pub use server::{ConnId, Directive, ServerBuffer, ServerConfig, ServerEvent};
pub use storage::{SessionSnapshot, StorageError};
pub use transport::{CollabClient, CollabServer};

//! # scribe-core — OT engine for collaborative plain-text editing
//!
//! The synchronous heart of scribe: an operation algebra over a chunked,
//! author-attributed character buffer, plus the Jupiter two-site
//! transformation endpoint that keeps a client/server pair converged.
//!
//! ## Architecture
//!
//! ```text
//! local edit                      remote record
//!     │                                │
//!     ▼                                ▼
//! Operation ──► JupiterSite::local_op  JupiterSite::remote_op
//!                   │ (stamp + queue)      │ (ack + transform)
//!                   ▼                      ▼
//!               Record (wire)         Operation (rebased)
//!                                         │
//!                                         ▼
//!                               DocumentContent::apply
//! ```
//!
//! This crate performs no I/O. Everything network- and session-shaped
//! (packets, subscriptions, the star topology) lives in `scribe-collab`,
//! which drives these types from its coordinators.
//!
//! ## Convergence
//!
//! Transformation satisfies TP1: for concurrent `a`, `b` applicable at a
//! common state, applying `a` then `b.transform(a, Right)` equals applying
//! `b` then `a.transform(b, Left)`. The central server fixes the tie-break
//! convention: the server side is [`Side::Left`], clients are
//! [`Side::Right`].

pub mod content;
pub mod error;
pub mod jupiter;
pub mod operation;
pub mod record;
pub mod user;

pub use content::{Chunk, DocumentContent};
pub use error::CoreError;
pub use jupiter::JupiterSite;
pub use operation::{Operation, Side};
pub use record::{Record, StateVector};
pub use user::{User, UserColor, UserFlags, UserTable, SERVER_USER_ID};

//! The operation algebra: insertions and deletions over a linear character
//! buffer, plus the split/no-op variants that transformation produces.
//!
//! Every operation supports three things:
//!
//! - `apply` mutates a [`DocumentContent`];
//! - `reverse` builds the inverse operation against the pre-state;
//! - `transform` is inclusion transformation: rewrite `self` so that its
//!   effect against a state that already holds `other` matches the original
//!   intent.
//!
//! Transformation satisfies TP1 (convergence of both application orders),
//! which together with the star topology is sufficient for the whole session
//! to converge; TP2 is not required.
//!
//! Tie-breaking between two inserts at the same position is decided by
//! [`Side`]: the left side keeps its position, the right side shifts. The
//! coordination layer assigns Left to the server and Right to clients.

use serde::{Deserialize, Serialize};

use crate::content::DocumentContent;
use crate::error::CoreError;

/// Which end of a Jupiter link an operation belongs to.
///
/// Fixed convention: the server is `Left`, every client is `Right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// The peer's side.
    pub fn flipped(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A document mutation.
///
/// `Split` never comes from user edits; it is produced when a concurrent
/// insertion lands inside a range this operation deletes. Its two halves are
/// ordered: the second applies to the state produced by the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    NoOp,
    Insert {
        pos: u32,
        text: String,
    },
    Delete {
        pos: u32,
        len: u32,
    },
    Split {
        first: Box<Operation>,
        second: Box<Operation>,
    },
}

/// Codepoint length of an insertion payload.
fn text_len(text: &str) -> u32 {
    text.chars().count() as u32
}

impl Operation {
    pub fn insert(pos: u32, text: impl Into<String>) -> Self {
        Operation::Insert { pos, text: text.into() }
    }

    pub fn delete(pos: u32, len: u32) -> Self {
        Operation::Delete { pos, len }
    }

    pub fn split(first: Operation, second: Operation) -> Self {
        Operation::Split {
            first: Box::new(first),
            second: Box::new(second),
        }
    }

    /// Whether applying this operation would leave the document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::NoOp => true,
            Operation::Insert { text, .. } => text.is_empty(),
            Operation::Delete { len, .. } => *len == 0,
            Operation::Split { first, second } => first.is_noop() && second.is_noop(),
        }
    }

    /// Applies the operation to `content`, attributing inserted text to
    /// `author`.
    pub fn apply(
        &self,
        content: &mut DocumentContent,
        author: Option<u32>,
    ) -> Result<(), CoreError> {
        match self {
            Operation::NoOp => Ok(()),
            Operation::Insert { pos, text } => content.insert(*pos, text, author),
            Operation::Delete { pos, len } => content.erase(*pos, *len),
            Operation::Split { first, second } => {
                first.apply(content, author)?;
                second.apply(content, author)
            }
        }
    }

    /// Builds the operation that undoes this one, given the content the
    /// operation targets.
    ///
    /// Reversing a deletion reconstructs the removed text from `before`;
    /// authorship of re-inserted text is decided by whoever applies the
    /// reversal.
    pub fn reverse(&self, before: &DocumentContent) -> Result<Operation, CoreError> {
        match self {
            Operation::NoOp => Ok(Operation::NoOp),
            Operation::Insert { pos, text } => Ok(Operation::delete(*pos, text_len(text))),
            Operation::Delete { pos, len } => {
                Ok(Operation::insert(*pos, before.slice(*pos, *len)?))
            }
            Operation::Split { first, second } => {
                // Undoing `first then second` means undoing second (against
                // the intermediate state) and then first.
                let mut mid = before.clone();
                first.apply(&mut mid, None)?;
                Ok(Operation::split(second.reverse(&mid)?, first.reverse(before)?))
            }
        }
    }

    /// Inclusion transformation: the operation with the same intent as
    /// `self`, valid against a state that has already applied `other`.
    ///
    /// `side` is the side `self` originates from; ties between equal-position
    /// inserts resolve in favor of [`Side::Left`].
    pub fn transform(&self, other: &Operation, side: Side) -> Operation {
        match (self, other) {
            (Operation::NoOp, _) => Operation::NoOp,
            (_, Operation::NoOp) => self.clone(),

            // Transforming against a split means transforming against its
            // halves in order; the second half is already expressed against
            // the state the first produced.
            (_, Operation::Split { first, second }) => {
                self.transform(first, side).transform(second, side)
            }

            // A split transforms half by half. The concurrent operation must
            // be rebased over our first half before it can meet our second.
            (Operation::Split { first, second }, _) => {
                let other_after_first = other.transform(first, side.flipped());
                Operation::split(
                    first.transform(other, side),
                    second.transform(&other_after_first, side),
                )
            }

            (
                Operation::Insert { pos: a, text: s },
                Operation::Insert { pos: b, text: t },
            ) => {
                if a < b || (a == b && side == Side::Left) {
                    self.clone()
                } else {
                    Operation::insert(a + text_len(t), s.clone())
                }
            }

            (
                Operation::Insert { pos: a, text: s },
                Operation::Delete { pos: b, len: n },
            ) => {
                if a <= b {
                    self.clone()
                } else if *a >= b + n {
                    Operation::insert(a - n, s.clone())
                } else {
                    // The insertion point was deleted; collapse to the left
                    // boundary of the deleted range.
                    Operation::insert(*b, s.clone())
                }
            }

            (
                Operation::Delete { pos: a, len: n },
                Operation::Insert { pos: b, text: t },
            ) => {
                if b <= a {
                    Operation::delete(a + text_len(t), *n)
                } else if *b >= a + n {
                    self.clone()
                } else {
                    // The concurrent insert landed inside our range: delete
                    // around it. The second half is expressed against the
                    // state the first half produces, hence `a + len(t)`.
                    Operation::split(
                        Operation::delete(*a, b - a),
                        Operation::delete(a + text_len(t), n - (b - a)),
                    )
                }
            }

            (
                Operation::Delete { pos: a, len: n },
                Operation::Delete { pos: b, len: m },
            ) => {
                // What remains to delete is [a, a+n) minus [b, b+m), shifted
                // left by the part of [b, b+m) lying before it. The two
                // surviving pieces, if any, become adjacent once the other
                // deletion has closed the gap, so a single Delete suffices.
                let overlap = (a + n).min(b + m).saturating_sub(*a.max(b));
                let shift = a.min(&(b + m)).saturating_sub(*b);
                let len = n - overlap;
                if len == 0 {
                    Operation::NoOp
                } else {
                    Operation::delete(a - shift, len)
                }
            }
        }
    }
}

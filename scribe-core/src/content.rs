//! Author-attributed document content.
//!
//! A document is an ordered sequence of [`Chunk`]s, each a contiguous run of
//! text written by one author (or by nobody, for content that predates the
//! session). Positions are 0-based codepoint offsets into the concatenation
//! of all chunks.
//!
//! Invariants, restored after every mutation:
//! - no chunk is empty;
//! - no two adjacent chunks share an author.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A contiguous run of text attributed to a single author.
///
/// `author` is `None` for text that no session user wrote, e.g. initial
/// content supplied at document creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    text: String,
    author: Option<u32>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, author: Option<u32>) -> Self {
        Self { text: text.into(), author }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn author(&self) -> Option<u32> {
        self.author
    }

    /// Length in codepoints.
    pub fn len(&self) -> u32 {
        self.text.chars().count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Byte index of the `chars`-th codepoint in `text`, or `None` when the
/// offset exceeds the text length.
fn byte_offset(text: &str, chars: u32) -> Option<usize> {
    let mut seen = 0u32;
    for (idx, _) in text.char_indices() {
        if seen == chars {
            return Some(idx);
        }
        seen += 1;
    }
    (seen == chars).then_some(text.len())
}

/// The character buffer of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent {
    chunks: Vec<Chunk>,
    /// Cached total length in codepoints.
    length: u32,
}

impl DocumentContent {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a document holding `text` attributed to `author`.
    pub fn with_text(text: impl Into<String>, author: Option<u32>) -> Self {
        let mut content = Self::new();
        content.append_chunk(text, author);
        content
    }

    /// Total length in codepoints.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The full text, authorship boundaries flattened away.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            out.push_str(&chunk.text);
        }
        out
    }

    /// Iterates the chunk sequence, e.g. for subscription sync or
    /// serialization.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Appends a chunk at the end, coalescing with the last chunk when the
    /// author matches. Used while receiving a chunk-wise content sync.
    pub fn append_chunk(&mut self, text: impl Into<String>, author: Option<u32>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.length += text.chars().count() as u32;
        match self.chunks.last_mut() {
            Some(last) if last.author == author => last.text.push_str(&text),
            _ => self.chunks.push(Chunk::new(text, author)),
        }
    }

    /// Inserts `text` at codepoint `pos`, attributed to `author`.
    pub fn insert(
        &mut self,
        pos: u32,
        text: &str,
        author: Option<u32>,
    ) -> Result<(), CoreError> {
        if pos > self.length {
            return Err(CoreError::OutOfBounds { pos, len: self.length });
        }
        if text.is_empty() {
            return Ok(());
        }

        let inserted = Chunk::new(text, author);
        let mut acc = 0u32;
        let mut target = self.chunks.len();
        let mut offset = 0u32;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let len = chunk.len();
            if pos <= acc + len {
                target = i;
                offset = pos - acc;
                break;
            }
            acc += len;
        }

        if target == self.chunks.len() {
            // Empty document, or pos == length with no trailing chunk hit.
            self.chunks.push(inserted);
        } else if offset == 0 {
            self.chunks.insert(target, inserted);
        } else if offset == self.chunks[target].len() {
            self.chunks.insert(target + 1, inserted);
        } else {
            // Split the containing chunk; the tail keeps its author.
            let split_at = byte_offset(&self.chunks[target].text, offset)
                .expect("offset verified against chunk length");
            let tail_text = self.chunks[target].text.split_off(split_at);
            let tail = Chunk::new(tail_text, self.chunks[target].author);
            self.chunks.insert(target + 1, inserted);
            self.chunks.insert(target + 2, tail);
        }

        self.length += text.chars().count() as u32;
        self.coalesce();
        Ok(())
    }

    /// Removes `len` codepoints starting at `pos`.
    pub fn erase(&mut self, pos: u32, len: u32) -> Result<(), CoreError> {
        if u64::from(pos) + u64::from(len) > u64::from(self.length) {
            return Err(CoreError::OutOfBounds {
                pos: pos.saturating_add(len),
                len: self.length,
            });
        }
        if len == 0 {
            return Ok(());
        }

        let end = pos + len;
        let mut acc = 0u32;
        for chunk in self.chunks.iter_mut() {
            let chunk_len = chunk.len();
            let chunk_start = acc;
            let chunk_end = acc + chunk_len;
            acc = chunk_end;

            let cut_start = pos.max(chunk_start);
            let cut_end = end.min(chunk_end);
            if cut_start >= cut_end {
                continue;
            }

            let from = byte_offset(&chunk.text, cut_start - chunk_start)
                .expect("range verified against chunk length");
            let to = byte_offset(&chunk.text, cut_end - chunk_start)
                .expect("range verified against chunk length");
            chunk.text.replace_range(from..to, "");
        }

        self.length -= len;
        self.coalesce();
        Ok(())
    }

    /// Copies out the text of the range `[pos, pos + len)`.
    pub fn slice(&self, pos: u32, len: u32) -> Result<String, CoreError> {
        if u64::from(pos) + u64::from(len) > u64::from(self.length) {
            return Err(CoreError::OutOfBounds {
                pos: pos.saturating_add(len),
                len: self.length,
            });
        }

        let end = pos + len;
        let mut acc = 0u32;
        let mut out = String::new();
        for chunk in &self.chunks {
            let chunk_start = acc;
            let chunk_end = acc + chunk.len();
            acc = chunk_end;

            let cut_start = pos.max(chunk_start);
            let cut_end = end.min(chunk_end);
            if cut_start >= cut_end {
                continue;
            }

            let from = byte_offset(&chunk.text, cut_start - chunk_start)
                .expect("range verified against chunk length");
            let to = byte_offset(&chunk.text, cut_end - chunk_start)
                .expect("range verified against chunk length");
            out.push_str(&chunk.text[from..to]);
        }
        Ok(out)
    }

    /// Drops empty chunks and merges same-author neighbors.
    fn coalesce(&mut self) {
        let mut merged: Vec<Chunk> = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks.drain(..) {
            if chunk.text.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last) if last.author == chunk.author => {
                    last.text.push_str(&chunk.text);
                }
                _ => merged.push(chunk),
            }
        }
        self.chunks = merged;
    }
}

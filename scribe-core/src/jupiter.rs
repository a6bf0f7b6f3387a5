//! The Jupiter two-site transformation endpoint.
//!
//! Each client/server link runs a pair of mirror [`JupiterSite`]s. A site
//! stamps outgoing operations with its state vector and keeps them queued
//! until the peer implicitly acknowledges them; incoming operations are
//! transformed against the queue so that both sides apply every operation in
//! a consistent order.
//!
//! The site is deliberately pure OT state: it never touches document
//! content. The coordinator applies the operation it hands back (and applies
//! local edits before calling [`JupiterSite::local_op`]). This is what lets
//! the server share one document among many per-client twins without
//! applying the same operation once per twin.

use std::collections::VecDeque;

use crate::error::CoreError;
use crate::operation::{Operation, Side};
use crate::record::{Record, StateVector};

/// One endpoint of a Jupiter link.
#[derive(Debug, Clone)]
pub struct JupiterSite {
    side: Side,
    local_count: u32,
    remote_count: u32,
    /// Locally generated records the peer has not yet confirmed seeing.
    queue: VecDeque<Record>,
}

impl JupiterSite {
    /// A server-side twin; wins insert tie-breaks.
    pub fn new_server() -> Self {
        Self::new(Side::Left)
    }

    /// A client-side site.
    pub fn new_client() -> Self {
        Self::new(Side::Right)
    }

    fn new(side: Side) -> Self {
        Self {
            side,
            local_count: 0,
            remote_count: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state_vector(&self) -> StateVector {
        StateVector::new(self.local_count, self.remote_count)
    }

    /// Number of unacknowledged outgoing records.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Registers a locally generated operation and returns the stamped
    /// record to send to the peer.
    ///
    /// The caller has already applied `op` to its content; the record is
    /// queued here until the peer acknowledges it through the state vectors
    /// of its own records.
    pub fn local_op(&mut self, op: Operation, author: u32) -> Record {
        let record = Record::new(author, op, self.state_vector());
        self.queue.push_back(record.clone());
        self.local_count += 1;
        log::trace!(
            "local op queued: author={} sv=({},{}) pending={}",
            author,
            record.sv.local,
            record.sv.remote,
            self.queue.len()
        );
        record
    }

    /// Processes a record from the peer and returns the operation to apply
    /// to local content.
    ///
    /// Retires every queued record the peer has confirmed seeing, then
    /// rebases the incoming operation across the remainder (rebasing each
    /// queued record over the incoming operation in turn). A state-vector
    /// mismatch means the link has diverged; the document must be closed for
    /// this peer.
    pub fn remote_op(&mut self, record: &Record) -> Result<Operation, CoreError> {
        // FIFO gap check: the peer numbers its records sequentially.
        if record.sv.local != self.remote_count {
            return Err(CoreError::Desynchronized {
                expected: self.remote_count,
                got: record.sv.local,
            });
        }

        // The peer has seen `record.sv.remote` of our operations; everything
        // queued before that no longer needs transforming.
        while let Some(front) = self.queue.front() {
            if front.sv.local < record.sv.remote {
                self.queue.pop_front();
            } else {
                break;
            }
        }

        let acked = record.sv.remote + self.queue.len() as u32;
        if acked != self.local_count {
            return Err(CoreError::Desynchronized {
                expected: self.local_count,
                got: acked,
            });
        }

        let mut op = record.op.clone();
        for queued in self.queue.iter_mut() {
            // Both transforms start from the untransformed pair.
            let incoming = op.transform(&queued.op, self.side.flipped());
            queued.op = queued.op.transform(&op, self.side);
            op = incoming;
        }

        self.remote_count += 1;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::DocumentContent;

    /// A client/server twin pair over one document each, shuttling records
    /// by hand.
    struct Link {
        server_site: JupiterSite,
        server_doc: DocumentContent,
        client_site: JupiterSite,
        client_doc: DocumentContent,
    }

    impl Link {
        fn new(text: &str) -> Self {
            Self {
                server_site: JupiterSite::new_server(),
                server_doc: DocumentContent::with_text(text, None),
                client_site: JupiterSite::new_client(),
                client_doc: DocumentContent::with_text(text, None),
            }
        }

        fn client_edit(&mut self, op: Operation) -> Record {
            op.apply(&mut self.client_doc, Some(1)).unwrap();
            self.client_site.local_op(op, 1)
        }

        fn server_edit(&mut self, op: Operation) -> Record {
            op.apply(&mut self.server_doc, None).unwrap();
            self.server_site.local_op(op, 0)
        }

        fn deliver_to_server(&mut self, record: &Record) {
            let op = self.server_site.remote_op(record).unwrap();
            op.apply(&mut self.server_doc, Some(record.author)).unwrap();
        }

        fn deliver_to_client(&mut self, record: &Record) {
            let op = self.client_site.remote_op(record).unwrap();
            op.apply(&mut self.client_doc, Some(record.author)).unwrap();
        }
    }

    #[test]
    fn test_sequential_ops_pass_through() {
        let mut link = Link::new("abc");
        let rec = link.client_edit(Operation::insert(3, "d"));
        link.deliver_to_server(&rec);
        assert_eq!(link.server_doc.text(), "abcd");
        assert_eq!(link.client_doc.text(), "abcd");
        assert_eq!(link.server_site.state_vector(), StateVector::new(0, 1));
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let mut link = Link::new("HELLO");
        // Both sides edit before seeing each other.
        let client_rec = link.client_edit(Operation::insert(0, "Y"));
        let server_rec = link.server_edit(Operation::insert(0, "X"));

        link.deliver_to_server(&client_rec);
        link.deliver_to_client(&server_rec);

        // The server (left) wins the position tie.
        assert_eq!(link.server_doc.text(), "XYHELLO");
        assert_eq!(link.client_doc.text(), "XYHELLO");
    }

    #[test]
    fn test_concurrent_delete_and_insert_converge() {
        let mut link = Link::new("ABCDEF");
        let client_rec = link.client_edit(Operation::insert(2, "z"));
        let server_rec = link.server_edit(Operation::delete(1, 3));

        link.deliver_to_server(&client_rec);
        link.deliver_to_client(&server_rec);

        assert_eq!(link.server_doc.text(), "AzEF");
        assert_eq!(link.client_doc.text(), "AzEF");
    }

    #[test]
    fn test_ack_retires_queue() {
        let mut link = Link::new("");
        let r1 = link.client_edit(Operation::insert(0, "a"));
        let r2 = link.client_edit(Operation::insert(1, "b"));
        assert_eq!(link.client_site.pending(), 2);

        link.deliver_to_server(&r1);
        link.deliver_to_server(&r2);

        // A server record stamped after both client ops acknowledges them.
        let server_rec = link.server_edit(Operation::insert(2, "c"));
        link.deliver_to_client(&server_rec);
        assert_eq!(link.client_site.pending(), 0);
        assert_eq!(link.client_doc.text(), "abc");
        assert_eq!(link.server_doc.text(), "abc");
    }

    #[test]
    fn test_state_vector_monotonicity() {
        let mut site = JupiterSite::new_client();
        let mut last = None;
        for i in 0..5 {
            let rec = site.local_op(Operation::insert(i, "x"), 1);
            if let Some(prev) = last {
                assert!(rec.sv.local > prev);
            }
            last = Some(rec.sv.local);
        }
        assert_eq!(site.state_vector().local, 5);
    }

    #[test]
    fn test_gap_in_peer_sequence_is_fatal() {
        let mut site = JupiterSite::new_server();
        let record = Record::new(1, Operation::insert(0, "x"), StateVector::new(3, 0));
        let err = site.remote_op(&record).unwrap_err();
        assert_eq!(err, CoreError::Desynchronized { expected: 0, got: 3 });
    }

    #[test]
    fn test_impossible_ack_is_fatal() {
        let mut site = JupiterSite::new_server();
        // The peer claims to have seen one of our ops; we emitted none.
        let record = Record::new(1, Operation::insert(0, "x"), StateVector::new(0, 1));
        assert!(site.remote_op(&record).is_err());
    }

    #[test]
    fn test_interleaved_rounds_converge() {
        let mut link = Link::new("base");
        let c1 = link.client_edit(Operation::insert(4, "!"));
        let s1 = link.server_edit(Operation::delete(0, 1));
        link.deliver_to_client(&s1);
        link.deliver_to_server(&c1);

        let c2 = link.client_edit(Operation::insert(0, ">"));
        let s2 = link.server_edit(Operation::insert(3, "-"));
        link.deliver_to_client(&s2);
        link.deliver_to_server(&c2);

        assert_eq!(link.server_doc.text(), link.client_doc.text());
    }
}

//! Per-document coordination state.
//!
//! A document exists in two shapes. On the server, a [`ServerDocument`]
//! always holds the authoritative content plus one Jupiter twin per
//! subscribed client; routing a record through it is what realizes the star
//! topology. On a client, a [`ClientDocument`] tracks the document's info
//! and subscriber list, and holds content plus a single Jupiter site only
//! while the local user is subscribed.
//!
//! Subscription of the local user walks
//! `Unsubscribed → Subscribing → Subscribed → Unsubscribing → Unsubscribed`;
//! content transfer happens chunk-wise during the subscribing leg.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{BitAnd, BitOr};

use scribe_core::{
    CoreError, DocumentContent, JupiterSite, Operation, Record, SERVER_USER_ID,
};

use crate::error::ProtocolError;
use crate::protocol::DocKey;

/// Per-user capability bits on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privileges(u32);

impl Privileges {
    pub const NONE: Privileges = Privileges(0);
    pub const SUBSCRIBE: Privileges = Privileges(0x01);
    pub const MODIFY: Privileges = Privileges(0x02);
    pub const CLOSE: Privileges = Privileges(0x04);
    pub const RENAME: Privileges = Privileges(0x08);
    pub const ADMIN: Privileges = Privileges(0x10);
    pub const ALL: Privileges = Privileges(u32::MAX);

    pub fn contains(self, other: Privileges) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl BitOr for Privileges {
    type Output = Privileges;
    fn bitor(self, rhs: Privileges) -> Privileges {
        Privileges(self.0 | rhs.0)
    }
}

impl BitAnd for Privileges {
    type Output = Privileges;
    fn bitand(self, rhs: Privileges) -> Privileges {
        Privileges(self.0 & rhs.0)
    }
}

/// Privilege assignments for one document, with a default for users that
/// have no explicit entry.
#[derive(Debug, Clone)]
pub struct PrivilegeTable {
    default: Privileges,
    entries: BTreeMap<u32, Privileges>,
}

impl PrivilegeTable {
    pub fn new(default: Privileges) -> Self {
        Self { default, entries: BTreeMap::new() }
    }

    pub fn default_privileges(&self) -> Privileges {
        self.default
    }

    pub fn query(&self, user: u32) -> Privileges {
        self.entries.get(&user).copied().unwrap_or(self.default)
    }

    pub fn change(&mut self, user: u32, privileges: Privileges) {
        self.entries.insert(user, privileges);
    }
}

impl Default for PrivilegeTable {
    /// The session default: anyone may open and edit, nothing more.
    fn default() -> Self {
        Self::new(Privileges::SUBSCRIBE | Privileges::MODIFY)
    }
}

/// Identity and naming of a document, shared by both shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub key: DocKey,
    pub title: String,
    pub suffix: u32,
    pub encoding: String,
}

impl DocumentInfo {
    pub fn new(key: DocKey, title: impl Into<String>, suffix: u32, encoding: impl Into<String>) -> Self {
        Self {
            key,
            title: title.into(),
            suffix,
            encoding: encoding.into(),
        }
    }

    /// The owner's user id, `None` for server-created documents.
    pub fn owner(&self) -> Option<u32> {
        (self.key.owner != SERVER_USER_ID).then_some(self.key.owner)
    }

    /// The session-unique display title: the bare title for suffix 1,
    /// `"title (N)"` otherwise.
    pub fn suffixed_title(&self) -> String {
        if self.suffix != 1 {
            format!("{} ({})", self.title, self.suffix)
        } else {
            self.title.clone()
        }
    }
}

/// Smallest positive suffix not taken by another document with this title.
///
/// `except` excludes the document itself when re-checking during a rename.
pub fn find_free_suffix<'a>(
    title: &str,
    except: Option<DocKey>,
    documents: impl Iterator<Item = &'a DocumentInfo>,
) -> u32 {
    let taken: BTreeSet<u32> = documents
        .filter(|info| info.title == title && Some(info.key) != except)
        .map(|info| info.suffix)
        .collect();
    let mut candidate = 1;
    while taken.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// What routing one client record through the server produced.
#[derive(Debug)]
pub struct RecordOutcome {
    /// The operation as applied to the authoritative content.
    pub applied: Operation,
    /// Stamped forwards, one per other subscriber.
    pub forwards: Vec<(u32, Record)>,
}

/// The authoritative, server-side shape of a document.
#[derive(Debug)]
pub struct ServerDocument {
    info: DocumentInfo,
    privileges: PrivilegeTable,
    content: DocumentContent,
    /// One Jupiter twin per subscribed user.
    sites: BTreeMap<u32, JupiterSite>,
}

impl ServerDocument {
    /// Creates a document. An owning user gets an explicit ALL entry in the
    /// privilege table; server-created documents only carry the default.
    pub fn new(info: DocumentInfo, content: DocumentContent) -> Self {
        let mut privileges = PrivilegeTable::default();
        if let Some(owner) = info.owner() {
            privileges.change(owner, Privileges::ALL);
        }
        Self {
            info,
            privileges,
            content,
            sites: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn content(&self) -> &DocumentContent {
        &self.content
    }

    pub fn privileges(&self) -> &PrivilegeTable {
        &self.privileges
    }

    pub fn privileges_mut(&mut self) -> &mut PrivilegeTable {
        &mut self.privileges
    }

    pub fn query_privileges(&self, user: u32) -> Privileges {
        self.privileges.query(user)
    }

    pub fn rename(&mut self, title: impl Into<String>, suffix: u32) {
        self.info.title = title.into();
        self.info.suffix = suffix;
    }

    pub fn subscribers(&self) -> impl Iterator<Item = u32> + '_ {
        self.sites.keys().copied()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sites.len()
    }

    pub fn is_subscribed(&self, user: u32) -> bool {
        self.sites.contains_key(&user)
    }

    /// Adds a subscriber, creating its Jupiter twin.
    pub fn subscribe(&mut self, user: u32) -> Result<(), ProtocolError> {
        if self.sites.contains_key(&user) {
            return Err(ProtocolError::Malformed(format!(
                "user {user:x} is already subscribed to {}",
                self.info.key
            )));
        }
        self.sites.insert(user, JupiterSite::new_server());
        Ok(())
    }

    /// Drops a subscriber and its twin.
    pub fn unsubscribe(&mut self, user: u32) -> Result<(), ProtocolError> {
        self.sites
            .remove(&user)
            .map(|_| ())
            .ok_or(ProtocolError::NotSubscribed(self.info.key))
    }

    /// Routes a record from `from`: transforms it through that user's twin,
    /// applies it to the authoritative content and stamps one forward per
    /// other subscriber.
    ///
    /// A `CoreError` means this link is broken; the caller closes the
    /// document for `from` (the session and the other subscribers survive).
    pub fn handle_record(
        &mut self,
        from: u32,
        record: &Record,
    ) -> Result<RecordOutcome, ProtocolError> {
        let site = self
            .sites
            .get_mut(&from)
            .ok_or(ProtocolError::NotSubscribed(self.info.key))?;
        let applied = site.remote_op(record)?;
        applied.apply(&mut self.content, Some(from))?;

        let forwards = self
            .sites
            .iter_mut()
            .filter(|(user, _)| **user != from)
            .map(|(user, site)| (*user, site.local_op(applied.clone(), from)))
            .collect();

        Ok(RecordOutcome { applied, forwards })
    }

    /// Applies a server-originated edit and stamps a forward for every
    /// subscriber. Used by a host (co-located server and editor) role.
    pub fn server_edit(&mut self, op: Operation) -> Result<Vec<(u32, Record)>, CoreError> {
        op.apply(&mut self.content, None)?;
        Ok(self
            .sites
            .iter_mut()
            .map(|(user, site)| (*user, site.local_op(op.clone(), SERVER_USER_ID)))
            .collect())
    }
}

/// Local subscription state of a `(document, user)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// The client-side shape of a document.
#[derive(Debug)]
pub struct ClientDocument {
    info: DocumentInfo,
    privileges: PrivilegeTable,
    subscribers: BTreeSet<u32>,
    state: SubscriptionState,
    content: Option<DocumentContent>,
    site: Option<JupiterSite>,
}

impl ClientDocument {
    /// A document known from the doclist sync or a create broadcast; the
    /// local user is not subscribed.
    pub fn new(info: DocumentInfo, subscribers: impl IntoIterator<Item = u32>) -> Self {
        Self {
            info,
            privileges: PrivilegeTable::default(),
            subscribers: subscribers.into_iter().collect(),
            state: SubscriptionState::Unsubscribed,
            content: None,
            site: None,
        }
    }

    /// A document the local user just created: content is assigned and the
    /// site is live immediately, without waiting for the server.
    pub fn new_local(info: DocumentInfo, initial_content: &str, self_id: u32) -> Self {
        let mut doc = Self::new(info, [self_id]);
        doc.content = Some(DocumentContent::with_text(initial_content, None));
        doc.site = Some(JupiterSite::new_client());
        doc.state = SubscriptionState::Subscribed;
        doc
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn key(&self) -> DocKey {
        self.info.key
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn privileges(&self) -> &PrivilegeTable {
        &self.privileges
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == SubscriptionState::Subscribed
    }

    /// Content while subscribed (or while syncing), `None` otherwise.
    pub fn content(&self) -> Option<&DocumentContent> {
        self.content.as_ref()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = u32> + '_ {
        self.subscribers.iter().copied()
    }

    pub fn has_subscriber(&self, user: u32) -> bool {
        self.subscribers.contains(&user)
    }

    pub fn rename(&mut self, title: impl Into<String>, suffix: u32) {
        self.info.title = title.into();
        self.info.suffix = suffix;
    }

    /// Local user asked to subscribe; the request is on the wire.
    pub fn begin_subscribe(&mut self) -> Result<(), ProtocolError> {
        if self.state != SubscriptionState::Unsubscribed {
            return Err(ProtocolError::Malformed(format!(
                "subscribe on {} in state {:?}",
                self.info.key, self.state
            )));
        }
        self.state = SubscriptionState::Subscribing;
        Ok(())
    }

    /// Local user asked to unsubscribe; the request is on the wire.
    pub fn begin_unsubscribe(&mut self) -> Result<(), ProtocolError> {
        if self.state != SubscriptionState::Subscribed {
            return Err(ProtocolError::NotSubscribed(self.info.key));
        }
        self.state = SubscriptionState::Unsubscribing;
        Ok(())
    }

    /// The server denied the subscription.
    pub fn subscribe_denied(&mut self) {
        if self.state == SubscriptionState::Subscribing {
            self.state = SubscriptionState::Unsubscribed;
            self.content = None;
        }
    }

    /// Content sync starts: allocate the empty buffer the chunks fill.
    pub fn sync_init(&mut self) -> Result<(), ProtocolError> {
        if self.state != SubscriptionState::Subscribing || self.content.is_some() {
            return Err(ProtocolError::Malformed(format!(
                "sync_init for document {} which is not subscribing",
                self.info.key
            )));
        }
        self.content = Some(DocumentContent::new());
        Ok(())
    }

    /// One chunk of the content sync.
    pub fn sync_chunk(&mut self, text: &str, author: Option<u32>) -> Result<(), ProtocolError> {
        match self.content.as_mut() {
            Some(content) => {
                content.append_chunk(text, author);
                Ok(())
            }
            None => Err(ProtocolError::Malformed(format!(
                "sync_chunk without sync_init for document {}",
                self.info.key
            ))),
        }
    }

    /// Content sync finished: the local user is now subscribed and the
    /// Jupiter site against the server goes live.
    pub fn sync_final(&mut self, self_id: u32) -> Result<(), ProtocolError> {
        if self.state != SubscriptionState::Subscribing || self.content.is_none() {
            return Err(ProtocolError::Malformed(format!(
                "sync_final without sync_init for document {}",
                self.info.key
            )));
        }
        self.state = SubscriptionState::Subscribed;
        self.site = Some(JupiterSite::new_client());
        self.subscribers.insert(self_id);
        Ok(())
    }

    /// A user appeared in the subscriber list.
    pub fn add_subscriber(&mut self, user: u32) {
        self.subscribers.insert(user);
    }

    /// A user left the subscriber list. When it is the local user, this is
    /// the server's unsubscribe ack: content and site are released.
    pub fn remove_subscriber(&mut self, user: u32, self_id: u32) {
        self.subscribers.remove(&user);
        if user == self_id {
            self.release();
        }
    }

    /// Drops local participation (unsubscribe ack, desync, session close).
    pub fn release(&mut self) {
        self.state = SubscriptionState::Unsubscribed;
        self.content = None;
        self.site = None;
    }

    /// Applies a local edit and returns the stamped record to send to the
    /// server.
    pub fn local_edit(&mut self, op: Operation, self_id: u32) -> Result<Record, ProtocolError> {
        if self.state != SubscriptionState::Subscribed {
            return Err(ProtocolError::NotSubscribed(self.info.key));
        }
        let (content, site) = match (self.content.as_mut(), self.site.as_mut()) {
            (Some(content), Some(site)) => (content, site),
            _ => return Err(ProtocolError::NotSubscribed(self.info.key)),
        };
        op.apply(content, Some(self_id))?;
        Ok(site.local_op(op, self_id))
    }

    /// Applies a record from the server, returning the rebased operation
    /// that was applied (for change notifications).
    pub fn handle_record(&mut self, record: &Record) -> Result<Operation, ProtocolError> {
        if self.state != SubscriptionState::Subscribed {
            return Err(ProtocolError::NotSubscribed(self.info.key));
        }
        let (content, site) = match (self.content.as_mut(), self.site.as_mut()) {
            (Some(content), Some(site)) => (content, site),
            _ => return Err(ProtocolError::NotSubscribed(self.info.key)),
        };
        let applied = site.remote_op(record)?;
        let author = (record.author != SERVER_USER_ID).then_some(record.author);
        applied.apply(content, author)?;
        Ok(applied)
    }
}

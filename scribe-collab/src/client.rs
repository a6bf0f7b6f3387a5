//! The client buffer: one participant's view of the session.
//!
//! [`ClientBuffer`] mirrors the server's user table and document list, runs
//! the client half of the login handshake, and owns one Jupiter site per
//! subscribed document. Like the server buffer it is a synchronous state
//! machine: `handle_packet` consumes one server packet and returns the
//! packets to send back; local operations (`insert`, `subscribe`, ...)
//! likewise hand back the request packet for the transport to ship.
//!
//! Session state arrives in a fixed order after login: the client's own
//! `user_join` (which is how it learns its id), joins for everyone already
//! present, then the `sync_init … sync_final` dump of offline users and the
//! document list. Events are delivered through an unbounded channel taken
//! once with [`ClientBuffer::take_event_rx`].

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use scribe_core::{
    Operation, User, UserColor, UserFlags, UserTable, SERVER_USER_ID,
};

use crate::crypto::{login_digest, PasswordEncryptor, PublicKey};
use crate::document::{find_free_suffix, ClientDocument, DocumentInfo};
use crate::error::ProtocolError;
use crate::protocol::{
    command, read_record, write_record, DocKey, LoginFailure, Packet, PROTOCOL_VERSION,
};

/// Observable session events on the client side.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The handshake completed and the session state is fully mirrored.
    SessionSynced,
    LoginFailed(LoginFailure),
    UserJoined { id: u32, name: String, color: UserColor },
    UserParted { id: u32 },
    UserColorChanged { id: u32, color: UserColor },
    /// The server denied our colour change request.
    ColorFailed,
    Message { writer: Option<u32>, text: String },
    DocumentCreated { key: DocKey },
    DocumentRemoved { key: DocKey },
    DocumentRenamed { key: DocKey, title: String, suffix: u32 },
    Subscribed { key: DocKey, user: u32 },
    Unsubscribed { key: DocKey, user: u32 },
    SubscribeFailed { key: DocKey },
    RenameFailed { key: DocKey },
    /// A record was applied to a subscribed document.
    Changed { key: DocKey, author: u32 },
    /// The Jupiter link for this document broke; it was closed locally.
    Desynchronized { key: DocKey },
}

/// A participant's session state and protocol endpoint.
pub struct ClientBuffer {
    name: String,
    color: UserColor,
    global_password: String,
    user_password: String,
    encryptor: Option<Box<dyn PasswordEncryptor>>,
    users: UserTable,
    documents: BTreeMap<DocKey, ClientDocument>,
    /// Allocator for ids of documents this client creates.
    doc_counter: u32,
    self_id: Option<u32>,
    token: Option<String>,
    server_key: Option<PublicKey>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl ClientBuffer {
    pub fn new(name: impl Into<String>, color: UserColor) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            color,
            global_password: String::new(),
            user_password: String::new(),
            encryptor: None,
            users: UserTable::new(),
            documents: BTreeMap::new(),
            doc_counter: 0,
            self_id: None,
            token: None,
            server_key: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Session password presented at login.
    pub fn with_global_password(mut self, password: impl Into<String>) -> Self {
        self.global_password = password.into();
        self
    }

    /// Our own password, if this name is protected on the server.
    pub fn with_user_password(mut self, password: impl Into<String>) -> Self {
        self.user_password = password.into();
        self
    }

    /// Encryptor for the password-change channel.
    pub fn with_encryptor(mut self, encryptor: Box<dyn PasswordEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Takes the event receiver; can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Our user id, known once the server confirmed the login.
    pub fn self_id(&self) -> Option<u32> {
        self.self_id
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    pub fn document(&self, key: DocKey) -> Option<&ClientDocument> {
        self.documents.get(&key)
    }

    pub fn documents(&self) -> impl Iterator<Item = &ClientDocument> {
        self.documents.values()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    fn require_self(&self) -> Result<u32, ProtocolError> {
        self.self_id
            .ok_or_else(|| ProtocolError::Malformed("not logged in yet".into()))
    }

    // ─── packet handling ────────────────────────────────────────────────

    /// Executes one packet from the server, returning packets to send back.
    /// An `Err` means the session is broken and the connection must close.
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        match packet.command() {
            command::WELCOME => self.on_welcome(packet),
            command::LOGIN_FAILED => {
                let failure = LoginFailure::from_code(packet.uint_at(0)?)
                    .unwrap_or(LoginFailure::ProtocolVersionMismatch);
                log::warn!("login failed: {}", failure.as_str());
                self.emit(ClientEvent::LoginFailed(failure));
                Ok(Vec::new())
            }
            command::USER_JOIN => self.on_user_join(packet),
            command::USER_PART => self.on_user_part(packet),
            command::USER_COLOUR => self.on_user_colour(packet),
            command::USER_COLOUR_FAILED => {
                self.emit(ClientEvent::ColorFailed);
                Ok(Vec::new())
            }
            command::SYNC_INIT => {
                // A fresh dump follows; whatever we think we know about the
                // document list is stale.
                self.documents.clear();
                Ok(Vec::new())
            }
            command::SYNC_USERTABLE_USER => self.on_sync_user(packet),
            command::SYNC_DOCLIST_DOCUMENT => self.on_sync_document(packet),
            command::SYNC_FINAL => {
                log::info!("session synchronized");
                self.emit(ClientEvent::SessionSynced);
                Ok(Vec::new())
            }
            command::DOCUMENT_CREATE => self.on_document_create(packet),
            command::DOCUMENT_REMOVE => self.on_document_remove(packet),
            command::MESSAGE => self.on_message(packet),
            command::DOCUMENT => self.on_document_packet(packet),
            other => Err(ProtocolError::UnexpectedCommand(other.to_string())),
        }
    }

    fn on_welcome(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let version = packet.uint_at(0)?;
        if version != PROTOCOL_VERSION {
            self.emit(ClientEvent::LoginFailed(LoginFailure::ProtocolVersionMismatch));
            return Err(ProtocolError::VersionMismatch {
                peer: version,
                ours: PROTOCOL_VERSION,
            });
        }
        let token = packet.str_at(1)?.to_string();
        let n = packet.str_at(2)?.to_string();
        let k = packet.str_at(3)?.to_string();
        if !n.is_empty() {
            self.server_key = Some(PublicKey { n, k });
        }

        let global = if self.global_password.is_empty() {
            String::new()
        } else {
            login_digest(&token, &self.global_password)
        };
        let user = if self.user_password.is_empty() {
            String::new()
        } else {
            login_digest(&token, &self.user_password)
        };
        self.token = Some(token);

        Ok(vec![Packet::new(command::LOGIN)
            .with_str(self.name.clone())
            .with_color(self.color)
            .with_str(global)
            .with_str(user)])
    }

    fn on_user_join(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let id = packet.uint_at(0)?;
        let name = packet.str_at(1)?.to_string();
        let color = packet.color_at(2)?;

        // A reconnect reuses the row's id; carry the stored password over.
        let mut user = User::new(id, name.clone(), color, UserFlags::CONNECTED);
        if let Some(existing) = self.users.get(id) {
            user.set_password(existing.password().to_string());
        }
        self.users.insert_row(user);

        // The first join after login is our own.
        if self.self_id.is_none() {
            self.self_id = Some(id);
            log::info!("logged in as {name:?} (id {id:x})");
        }
        self.emit(ClientEvent::UserJoined { id, name, color });
        Ok(Vec::new())
    }

    fn on_user_part(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let id = packet.uint_at(0)?;
        self.users.disconnect(id);
        let self_id = self.require_self()?;
        // Mirror the server: a parted user is gone from every document.
        for doc in self.documents.values_mut() {
            if doc.has_subscriber(id) {
                doc.remove_subscriber(id, self_id);
                self.event_tx
                    .send(ClientEvent::Unsubscribed { key: doc.key(), user: id })
                    .ok();
            }
        }
        self.emit(ClientEvent::UserParted { id });
        Ok(Vec::new())
    }

    fn on_user_colour(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let id = packet.user_ref_at(0)?;
        let color = packet.color_at(1)?;
        match self.users.get_mut(id) {
            Some(row) => row.set_color(color),
            None => return Err(ProtocolError::UnknownUser(id)),
        }
        self.emit(ClientEvent::UserColorChanged { id, color });
        Ok(Vec::new())
    }

    fn on_sync_user(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let id = packet.uint_at(0)?;
        let name = packet.str_at(1)?.to_string();
        let color = packet.color_at(2)?;
        self.users.insert_row(User::new(id, name, color, UserFlags::NONE));
        Ok(Vec::new())
    }

    fn on_sync_document(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let owner = packet.user_ref_at(0)?;
        let id = packet.uint_at(1)?;
        let title = packet.str_at(2)?.to_string();
        let suffix = packet.uint_at(3)?;
        let encoding = packet.str_at(4)?.to_string();
        let mut subscribers = Vec::new();
        for index in 5..packet.param_count() {
            subscribers.push(packet.user_ref_at(index)?);
        }
        let key = DocKey::new(owner, id);
        let info = DocumentInfo::new(key, title, suffix, encoding);
        self.documents.insert(key, ClientDocument::new(info, subscribers));
        Ok(Vec::new())
    }

    fn on_document_create(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let owner = packet.user_ref_at(0)?;
        let id = packet.uint_at(1)?;
        let title = packet.str_at(2)?.to_string();
        let suffix = packet.uint_at(3)?;
        let encoding = packet.str_at(4)?.to_string();
        let key = DocKey::new(owner, id);
        let info = DocumentInfo::new(key, title, suffix, encoding);
        // The owner is implicitly subscribed from the start.
        let subscribers = (owner != SERVER_USER_ID).then_some(owner);
        self.documents
            .insert(key, ClientDocument::new(info, subscribers));
        self.emit(ClientEvent::DocumentCreated { key });
        Ok(Vec::new())
    }

    fn on_document_remove(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let key = packet.doc_ref_at(0)?;
        if self.documents.remove(&key).is_none() {
            return Err(ProtocolError::UnknownDocument(key));
        }
        self.emit(ClientEvent::DocumentRemoved { key });
        Ok(Vec::new())
    }

    fn on_message(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let writer_ref = packet.user_ref_at(0)?;
        let text = packet.str_at(1)?.to_string();
        let writer = (writer_ref != SERVER_USER_ID).then_some(writer_ref);
        self.emit(ClientEvent::Message { writer, text });
        Ok(Vec::new())
    }

    fn on_document_packet(&mut self, packet: &Packet) -> Result<Vec<Packet>, ProtocolError> {
        let key = packet.doc_ref_at(0)?;
        let self_id = self.require_self()?;
        let doc = self
            .documents
            .get_mut(&key)
            .ok_or(ProtocolError::UnknownDocument(key))?;

        match packet.str_at(1)? {
            command::RENAME => {
                let title = packet.str_at(2)?.to_string();
                let suffix = packet.uint_at(3)?;
                doc.rename(title.clone(), suffix);
                self.emit(ClientEvent::DocumentRenamed { key, title, suffix });
                Ok(Vec::new())
            }
            command::RECORD => {
                let author = packet.user_ref_at(2)?;
                let mut index = 3;
                let record = read_record(packet, &mut index, author)?;
                match doc.handle_record(&record) {
                    Ok(_) => {
                        self.emit(ClientEvent::Changed { key, author });
                        Ok(Vec::new())
                    }
                    Err(ProtocolError::Core(err)) => {
                        // Unrecoverable for this document; detach cleanly on
                        // both sides and keep the session alive.
                        log::error!("document {key} desynchronized: {err}");
                        doc.release();
                        self.emit(ClientEvent::Desynchronized { key });
                        Ok(vec![Packet::for_document(key, command::UNSUBSCRIBE)])
                    }
                    Err(other) => Err(other),
                }
            }
            command::SYNC_INIT => {
                doc.sync_init()?;
                Ok(Vec::new())
            }
            command::SYNC_CHUNK => {
                let text = packet.str_at(2)?;
                let author_ref = packet.user_ref_at(3)?;
                let author = (author_ref != SERVER_USER_ID).then_some(author_ref);
                doc.sync_chunk(text, author)?;
                Ok(Vec::new())
            }
            command::SYNC_FINAL => {
                doc.sync_final(self_id)?;
                self.emit(ClientEvent::Subscribed { key, user: self_id });
                Ok(Vec::new())
            }
            command::SUBSCRIBE => {
                let user = packet.user_ref_at(2)?;
                doc.add_subscriber(user);
                self.emit(ClientEvent::Subscribed { key, user });
                Ok(Vec::new())
            }
            command::UNSUBSCRIBE => {
                let user = packet.user_ref_at(2)?;
                doc.remove_subscriber(user, self_id);
                self.emit(ClientEvent::Unsubscribed { key, user });
                Ok(Vec::new())
            }
            command::SUBSCRIBE_FAILED => {
                doc.subscribe_denied();
                self.emit(ClientEvent::SubscribeFailed { key });
                Ok(Vec::new())
            }
            command::RENAME_FAILED => {
                self.emit(ClientEvent::RenameFailed { key });
                Ok(Vec::new())
            }
            other => Err(ProtocolError::UnexpectedCommand(format!(
                "document {key}: {other}"
            ))),
        }
    }

    // ─── local operations ───────────────────────────────────────────────

    /// Creates a document owned by us. The local copy is live immediately;
    /// the returned packet announces it to the server.
    pub fn document_create(
        &mut self,
        title: &str,
        encoding: &str,
        content: &str,
    ) -> Result<(DocKey, Packet), ProtocolError> {
        let self_id = self.require_self()?;
        self.doc_counter += 1;
        let key = DocKey::new(self_id, self.doc_counter);
        // The server will compute the same suffix over the same doclist.
        let suffix = find_free_suffix(title, None, self.documents.values().map(|d| d.info()));
        let info = DocumentInfo::new(key, title, suffix, encoding);
        self.documents
            .insert(key, ClientDocument::new_local(info, content, self_id));
        self.emit(ClientEvent::DocumentCreated { key });
        Ok((
            key,
            Packet::new(command::DOCUMENT_CREATE)
                .with_uint(key.id)
                .with_str(title)
                .with_str(encoding)
                .with_str(content),
        ))
    }

    /// Requests removal of a document.
    pub fn document_remove(&self, key: DocKey) -> Result<Packet, ProtocolError> {
        if !self.documents.contains_key(&key) {
            return Err(ProtocolError::UnknownDocument(key));
        }
        Ok(Packet::new(command::DOCUMENT_REMOVE).with_doc_ref(key))
    }

    /// Requests a subscription; content arrives via the sync stream.
    pub fn subscribe(&mut self, key: DocKey) -> Result<Packet, ProtocolError> {
        self.require_self()?;
        let doc = self
            .documents
            .get_mut(&key)
            .ok_or(ProtocolError::UnknownDocument(key))?;
        doc.begin_subscribe()?;
        Ok(Packet::for_document(key, command::SUBSCRIBE))
    }

    /// Requests an unsubscription; the server's broadcast is the ack.
    pub fn unsubscribe(&mut self, key: DocKey) -> Result<Packet, ProtocolError> {
        let doc = self
            .documents
            .get_mut(&key)
            .ok_or(ProtocolError::UnknownDocument(key))?;
        doc.begin_unsubscribe()?;
        Ok(Packet::for_document(key, command::UNSUBSCRIBE))
    }

    /// Inserts text into a subscribed document.
    pub fn insert(&mut self, key: DocKey, pos: u32, text: &str) -> Result<Packet, ProtocolError> {
        self.local_edit(key, Operation::insert(pos, text))
    }

    /// Erases a range from a subscribed document.
    pub fn erase(&mut self, key: DocKey, pos: u32, len: u32) -> Result<Packet, ProtocolError> {
        self.local_edit(key, Operation::delete(pos, len))
    }

    fn local_edit(&mut self, key: DocKey, op: Operation) -> Result<Packet, ProtocolError> {
        let self_id = self.require_self()?;
        let doc = self
            .documents
            .get_mut(&key)
            .ok_or(ProtocolError::UnknownDocument(key))?;
        let record = doc.local_edit(op, self_id)?;
        self.emit(ClientEvent::Changed { key, author: self_id });
        Ok(write_record(
            Packet::for_document(key, command::RECORD),
            &record,
        ))
    }

    /// Requests a rename; the server assigns the suffix.
    pub fn rename(&self, key: DocKey, new_title: &str) -> Result<Packet, ProtocolError> {
        if !self.documents.contains_key(&key) {
            return Err(ProtocolError::UnknownDocument(key));
        }
        Ok(Packet::for_document(key, command::RENAME).with_str(new_title))
    }

    /// Sends a chat message.
    pub fn send_message(&self, text: &str) -> Packet {
        Packet::new(command::MESSAGE).with_str(text)
    }

    /// Requests a colour change; `user_colour`/`user_colour_failed` answers.
    pub fn set_color(&self, color: UserColor) -> Packet {
        Packet::new(command::USER_COLOUR).with_color(color)
    }

    /// Sets our password over the encrypted channel.
    pub fn set_user_password(&mut self, password: &str) -> Result<Packet, ProtocolError> {
        self.require_self()?;
        let (encryptor, key) = match (&self.encryptor, &self.server_key) {
            (Some(encryptor), Some(key)) => (encryptor, key),
            _ => {
                return Err(ProtocolError::Malformed(
                    "no encrypted channel to carry the password".into(),
                ))
            }
        };
        let ciphertext = encryptor.encrypt(key, password);
        self.user_password = password.to_string();
        Ok(Packet::new(command::USER_PASSWORD).with_str(ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlainCipher;
    use scribe_core::{Record, StateVector};

    const COLOR: UserColor = UserColor { red: 10, green: 20, blue: 30 };

    fn welcome(token: &str) -> Packet {
        Packet::new(command::WELCOME)
            .with_uint(PROTOCOL_VERSION)
            .with_str(token)
            .with_str("key-n")
            .with_str("key-k")
    }

    fn join_self(client: &mut ClientBuffer, id: u32) {
        client.handle_packet(&welcome("tok")).unwrap();
        client
            .handle_packet(
                &Packet::new(command::USER_JOIN)
                    .with_uint(id)
                    .with_str("me")
                    .with_color(COLOR),
            )
            .unwrap();
        assert_eq!(client.self_id(), Some(id));
    }

    #[test]
    fn test_welcome_produces_login_with_digests() {
        let mut client = ClientBuffer::new("alice", COLOR)
            .with_global_password("sesame")
            .with_user_password("mine");
        let replies = client.handle_packet(&welcome("tok")).unwrap();
        assert_eq!(replies.len(), 1);
        let login = &replies[0];
        assert_eq!(login.command(), command::LOGIN);
        assert_eq!(login.str_at(0).unwrap(), "alice");
        assert_eq!(login.str_at(4).unwrap(), login_digest("tok", "sesame"));
        assert_eq!(login.str_at(5).unwrap(), login_digest("tok", "mine"));
    }

    #[test]
    fn test_welcome_without_passwords_sends_empty_digests() {
        let mut client = ClientBuffer::new("alice", COLOR);
        let replies = client.handle_packet(&welcome("tok")).unwrap();
        assert_eq!(replies[0].str_at(4).unwrap(), "");
        assert_eq!(replies[0].str_at(5).unwrap(), "");
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let mut client = ClientBuffer::new("alice", COLOR);
        let packet = Packet::new(command::WELCOME)
            .with_uint(PROTOCOL_VERSION + 1)
            .with_str("tok")
            .with_str("")
            .with_str("");
        let err = client.handle_packet(&packet).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }

    #[test]
    fn test_first_join_is_self() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 4);
        client
            .handle_packet(
                &Packet::new(command::USER_JOIN)
                    .with_uint(5)
                    .with_str("other")
                    .with_color(UserColor::new(9, 9, 9)),
            )
            .unwrap();
        assert_eq!(client.self_id(), Some(4), "self id does not move");
        assert!(client.users().get(5).unwrap().is_connected());
    }

    #[test]
    fn test_session_sync_builds_state() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        client
            .handle_packet(&Packet::new(command::SYNC_INIT).with_uint(1).with_uint(1))
            .unwrap();
        client
            .handle_packet(
                &Packet::new(command::SYNC_USERTABLE_USER)
                    .with_uint(9)
                    .with_str("ghost")
                    .with_color(UserColor::new(1, 1, 1)),
            )
            .unwrap();
        client
            .handle_packet(
                &Packet::new(command::SYNC_DOCLIST_DOCUMENT)
                    .with_user_ref(9)
                    .with_uint(1)
                    .with_str("notes")
                    .with_uint(2)
                    .with_str("UTF-8")
                    .with_user_ref(9),
            )
            .unwrap();
        client.handle_packet(&Packet::new(command::SYNC_FINAL)).unwrap();

        assert!(!client.users().get(9).unwrap().is_connected());
        let doc = client.document(DocKey::new(9, 1)).unwrap();
        assert_eq!(doc.info().suffixed_title(), "notes (2)");
        assert!(doc.has_subscriber(9));
        assert!(!doc.is_subscribed());
    }

    #[test]
    fn test_document_create_is_live_immediately() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let (key, packet) = client.document_create("mine", "UTF-8", "seed").unwrap();
        assert_eq!(key, DocKey::new(2, 1));
        assert_eq!(packet.command(), command::DOCUMENT_CREATE);

        let doc = client.document(key).unwrap();
        assert!(doc.is_subscribed());
        assert_eq!(doc.content().unwrap().text(), "seed");

        // Editing works without any server round trip.
        let record = client.insert(key, 4, "!").unwrap();
        assert_eq!(record.str_at(1).unwrap(), command::RECORD);
        assert_eq!(client.document(key).unwrap().content().unwrap().text(), "seed!");
    }

    #[test]
    fn test_subscribe_flow_with_chunked_sync() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let key = DocKey::new(9, 1);
        client
            .handle_packet(
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_user_ref(9)
                    .with_uint(1)
                    .with_str("doc")
                    .with_uint(1)
                    .with_str("UTF-8"),
            )
            .unwrap();

        let request = client.subscribe(key).unwrap();
        assert_eq!(request.str_at(1).unwrap(), command::SUBSCRIBE);

        client
            .handle_packet(&Packet::for_document(key, command::SYNC_INIT).with_uint(2))
            .unwrap();
        client
            .handle_packet(
                &Packet::for_document(key, command::SYNC_CHUNK)
                    .with_str("HI")
                    .with_user_ref(9),
            )
            .unwrap();
        client
            .handle_packet(
                &Packet::for_document(key, command::SYNC_CHUNK)
                    .with_str("!")
                    .with_user_ref(0),
            )
            .unwrap();
        client
            .handle_packet(&Packet::for_document(key, command::SYNC_FINAL))
            .unwrap();

        let doc = client.document(key).unwrap();
        assert!(doc.is_subscribed());
        assert_eq!(doc.content().unwrap().text(), "HI!");
        assert!(doc.has_subscriber(2));

        // Unsubscribe completes on the server's broadcast.
        client.unsubscribe(key).unwrap();
        client
            .handle_packet(
                &Packet::for_document(key, command::UNSUBSCRIBE).with_user_ref(2),
            )
            .unwrap();
        assert!(!client.document(key).unwrap().is_subscribed());
        assert!(client.document(key).unwrap().content().is_none());
    }

    #[test]
    fn test_record_applies_to_subscribed_document() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let (key, _) = client.document_create("mine", "UTF-8", "HELLO").unwrap();

        let record = Record::new(7, Operation::insert(0, "X"), StateVector::new(0, 0));
        let packet = write_record(
            Packet::for_document(key, command::RECORD).with_user_ref(7),
            &record,
        );
        client.handle_packet(&packet).unwrap();
        assert_eq!(
            client.document(key).unwrap().content().unwrap().text(),
            "XHELLO"
        );
    }

    #[test]
    fn test_record_for_unsubscribed_document_is_protocol_error() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let key = DocKey::new(9, 1);
        client
            .handle_packet(
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_user_ref(9)
                    .with_uint(1)
                    .with_str("doc")
                    .with_uint(1)
                    .with_str("UTF-8"),
            )
            .unwrap();
        let record = Record::new(9, Operation::insert(0, "X"), StateVector::new(0, 0));
        let packet = write_record(
            Packet::for_document(key, command::RECORD).with_user_ref(9),
            &record,
        );
        assert!(client.handle_packet(&packet).is_err());
    }

    #[test]
    fn test_desynchronized_record_detaches_document() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let (key, _) = client.document_create("mine", "UTF-8", "").unwrap();

        // Server record claiming a sequence far ahead.
        let record = Record::new(7, Operation::insert(0, "X"), StateVector::new(4, 0));
        let packet = write_record(
            Packet::for_document(key, command::RECORD).with_user_ref(7),
            &record,
        );
        let replies = client.handle_packet(&packet).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].str_at(1).unwrap(), command::UNSUBSCRIBE);
        assert!(!client.document(key).unwrap().is_subscribed());
    }

    #[test]
    fn test_message_writer_resolution() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let mut events = client.take_event_rx().unwrap();
        client
            .handle_packet(
                &Packet::new(command::MESSAGE).with_user_ref(0).with_str("motd"),
            )
            .unwrap();
        client
            .handle_packet(
                &Packet::new(command::MESSAGE).with_user_ref(2).with_str("hi"),
            )
            .unwrap();

        let mut writers = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Message { writer, .. } = event {
                writers.push(writer);
            }
        }
        assert_eq!(writers, vec![None, Some(2)]);
    }

    #[test]
    fn test_set_user_password_requires_channel() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        assert!(client.set_user_password("pw").is_err());

        let mut client = ClientBuffer::new("me", COLOR)
            .with_encryptor(Box::new(PlainCipher::new()));
        join_self(&mut client, 2);
        let packet = client.set_user_password("pw").unwrap();
        assert_eq!(packet.command(), command::USER_PASSWORD);
        assert_eq!(packet.str_at(0).unwrap(), "pw");
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut client = ClientBuffer::new("me", COLOR);
        assert!(matches!(
            client.handle_packet(&Packet::new("mystery")),
            Err(ProtocolError::UnexpectedCommand(_))
        ));
    }

    #[test]
    fn test_user_part_unsubscribes_everywhere() {
        let mut client = ClientBuffer::new("me", COLOR);
        join_self(&mut client, 2);
        let key = DocKey::new(5, 1);
        client
            .handle_packet(
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_user_ref(5)
                    .with_uint(1)
                    .with_str("doc")
                    .with_uint(1)
                    .with_str("UTF-8"),
            )
            .unwrap();
        client
            .handle_packet(
                &Packet::new(command::USER_JOIN)
                    .with_uint(5)
                    .with_str("other")
                    .with_color(UserColor::new(9, 9, 9)),
            )
            .unwrap();
        assert!(client.document(key).unwrap().has_subscriber(5));

        client
            .handle_packet(&Packet::new(command::USER_PART).with_uint(5))
            .unwrap();
        assert!(!client.document(key).unwrap().has_subscriber(5));
        assert!(!client.users().get(5).unwrap().is_connected());
    }
}

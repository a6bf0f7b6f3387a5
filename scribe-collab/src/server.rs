//! The server buffer: session authority and star-topology router.
//!
//! ```text
//! Client A ──┐                       ┌── twin site A ─┐
//! Client B ──┼── dispatcher ──► doc ─┼── twin site B ─┼─ content
//! Client C ──┘        │              └── twin site C ─┘
//!                     │
//!                ┌────┴─────┐
//!                │ UserTable│  login, colors, presence
//!                └──────────┘
//! ```
//!
//! [`ServerBuffer`] is a synchronous state machine: the transport layer
//! feeds it one connection event or packet at a time and performs the
//! [`Directive`]s it hands back. Handlers run to completion, so no
//! transformation work ever interleaves with I/O on the same document.
//!
//! A returned `Err` is a protocol violation and costs the offending peer its
//! connection; authorization denials are answered inline with `*_failed`
//! replies (or dropped, for records) and keep the connection alive.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;

use scribe_core::{DocumentContent, User, UserColor, UserFlags, UserTable, SERVER_USER_ID};

use crate::crypto::{generate_token, login_digest, SessionCipher};
use crate::document::{
    find_free_suffix, DocumentInfo, Privileges, ServerDocument,
};
use crate::error::ProtocolError;
use crate::protocol::{
    command, read_record, write_record, DocKey, LoginFailure, Packet, PROTOCOL_VERSION,
};
use crate::storage::{ChunkRecord, DocumentRecord, SessionSnapshot, UserRecord};

/// Transport-assigned connection handle.
pub type ConnId = u64;

/// An I/O instruction for the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Send { conn: ConnId, packet: Packet },
    Close { conn: ConnId },
}

impl Directive {
    fn send(conn: ConnId, packet: Packet) -> Self {
        Directive::Send { conn, packet }
    }
}

/// Observable session events, in the order the server applied them.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected { conn: ConnId },
    LoginFailed { conn: ConnId, failure: LoginFailure },
    UserJoined { id: u32 },
    UserParted { id: u32 },
    UserColorChanged { id: u32, color: UserColor },
    Message { writer: Option<u32>, text: String },
    DocumentCreated { key: DocKey },
    DocumentRemoved { key: DocKey },
    DocumentRenamed { key: DocKey, title: String, suffix: u32 },
    Subscribed { key: DocKey, user: u32 },
    Unsubscribed { key: DocKey, user: u32 },
    Changed { key: DocKey, author: u32 },
    /// A client's Jupiter link broke; the document was closed for it.
    Desynchronized { key: DocKey, user: u32 },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Session password required at login, if any.
    pub global_password: Option<String>,
    /// Encoding advertised for documents created without an explicit one.
    pub default_encoding: String,
    /// Cap on the number of documents in the session; create requests over
    /// the limit are rejected without costing the peer its connection.
    pub max_documents: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            global_password: None,
            default_encoding: "UTF-8".to_string(),
            max_documents: 256,
        }
    }
}

/// The session authority: user table, document list, login handshake and
/// packet dispatch for every connected client.
pub struct ServerBuffer {
    config: ServerConfig,
    cipher: Option<Box<dyn SessionCipher>>,
    users: UserTable,
    documents: BTreeMap<DocKey, ServerDocument>,
    /// Allocator for server-created document ids.
    doc_counter: u32,
    /// Connections that got `welcome` but have not logged in: conn → token.
    pending: HashMap<ConnId, String>,
    sessions: HashMap<ConnId, u32>,
    conns: HashMap<u32, ConnId>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl ServerBuffer {
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            cipher: None,
            users: UserTable::new(),
            documents: BTreeMap::new(),
            doc_counter: 0,
            pending: HashMap::new(),
            sessions: HashMap::new(),
            conns: HashMap::new(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Attaches the asymmetric cipher whose public key `welcome` announces.
    pub fn with_cipher(mut self, cipher: Box<dyn SessionCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn set_global_password(&mut self, password: Option<String>) {
        self.config.global_password = password;
    }

    /// Takes the event receiver; can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    pub fn document(&self, key: DocKey) -> Option<&ServerDocument> {
        self.documents.get(&key)
    }

    pub fn documents(&self) -> impl Iterator<Item = &ServerDocument> {
        self.documents.values()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn infos(&self) -> impl Iterator<Item = &DocumentInfo> {
        self.documents.values().map(|d| d.info())
    }

    /// One `Send` per logged-in connection.
    fn broadcast(&self, packet: &Packet) -> Vec<Directive> {
        self.sessions
            .keys()
            .map(|conn| Directive::send(*conn, packet.clone()))
            .collect()
    }

    /// One `Send` per logged-in connection except `skip`.
    fn broadcast_except(&self, skip: ConnId, packet: &Packet) -> Vec<Directive> {
        self.sessions
            .keys()
            .filter(|conn| **conn != skip)
            .map(|conn| Directive::send(*conn, packet.clone()))
            .collect()
    }

    // ─── connection lifecycle ───────────────────────────────────────────

    /// A transport connection arrived: issue its token and greet it.
    pub fn handle_connect(&mut self, conn: ConnId) -> Vec<Directive> {
        let token = generate_token();
        log::info!("connection {conn} opened, token issued");
        self.pending.insert(conn, token.clone());
        self.emit(ServerEvent::Connected { conn });

        let (n, k) = match &self.cipher {
            Some(cipher) => {
                let key = cipher.public_key();
                (key.n.clone(), key.k.clone())
            }
            None => (String::new(), String::new()),
        };
        vec![Directive::send(
            conn,
            Packet::new(command::WELCOME)
                .with_uint(PROTOCOL_VERSION)
                .with_str(token)
                .with_str(n)
                .with_str(k),
        )]
    }

    /// A transport connection went away: part its user from the session.
    pub fn handle_disconnect(&mut self, conn: ConnId) -> Vec<Directive> {
        if self.pending.remove(&conn).is_some() {
            log::debug!("connection {conn} closed before login");
            return Vec::new();
        }
        let Some(user) = self.sessions.remove(&conn) else {
            return Vec::new();
        };
        self.conns.remove(&user);
        self.users.disconnect(user);
        log::info!("user {user:x} disconnected");

        // Every document sheds the user; clients mirror this locally when
        // they see user_part, so no per-document packets are needed.
        for doc in self.documents.values_mut() {
            if doc.is_subscribed(user) {
                let _ = doc.unsubscribe(user);
                self.event_tx
                    .send(ServerEvent::Unsubscribed { key: doc.info().key, user })
                    .ok();
            }
        }

        let directives = self.broadcast(&Packet::new(command::USER_PART).with_uint(user));
        self.emit(ServerEvent::UserParted { id: user });
        directives
    }

    // ─── dispatch ───────────────────────────────────────────────────────

    /// Executes one packet from `conn`. An `Err` means the connection must
    /// be closed.
    pub fn handle_packet(
        &mut self,
        conn: ConnId,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        if self.pending.contains_key(&conn) {
            return match packet.command() {
                command::LOGIN => self.on_login(conn, packet),
                other => Err(ProtocolError::UnexpectedCommand(other.to_string())),
            };
        }

        let user = *self.sessions.get(&conn).ok_or_else(|| {
            ProtocolError::Malformed("packet from unregistered connection".into())
        })?;

        match packet.command() {
            command::DOCUMENT_CREATE => self.on_document_create(user, packet),
            command::DOCUMENT_REMOVE => self.on_document_remove(user, packet),
            command::MESSAGE => self.on_message(user, packet),
            command::USER_PASSWORD => self.on_user_password(conn, user, packet),
            command::USER_COLOUR => self.on_user_colour(conn, user, packet),
            command::DOCUMENT => self.on_document_packet(conn, user, packet),
            other => Err(ProtocolError::UnexpectedCommand(other.to_string())),
        }
    }

    // ─── login ──────────────────────────────────────────────────────────

    fn on_login(
        &mut self,
        conn: ConnId,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let name = packet.str_at(0)?.to_string();
        let color = packet.color_at(1)?;
        let global_digest = packet.str_at(4)?;
        let user_digest = packet.str_at(5)?;

        if name.is_empty() {
            return Err(ProtocolError::Malformed("login with empty name".into()));
        }
        let token = self
            .pending
            .get(&conn)
            .cloned()
            .expect("pending checked by dispatcher");

        let failure = self.check_login(&name, color, &token, global_digest, user_digest);
        if let Some(failure) = failure {
            log::warn!("login of {name:?} rejected: {}", failure.as_str());
            self.emit(ServerEvent::LoginFailed { conn, failure });
            return Ok(vec![Directive::send(
                conn,
                Packet::new(command::LOGIN_FAILED).with_uint(failure.code()),
            )]);
        }

        // The token moves from the pending map onto the user row.
        self.pending.remove(&conn);
        let id = self.users.connect(&name, color);
        if let Some(row) = self.users.get_mut(id) {
            row.set_token(&token);
        }
        self.sessions.insert(conn, id);
        self.conns.insert(id, conn);
        log::info!("user {name:?} logged in as {id:x}");

        let mut directives = Vec::new();
        let join = |user: &User| {
            Packet::new(command::USER_JOIN)
                .with_uint(user.id())
                .with_str(user.name())
                .with_color(user.color())
        };

        // The first join the newcomer sees is its own; that is how it learns
        // its identity. Then the already-connected users, then the session
        // sync, mirroring the join order of the original protocol.
        let self_row = self.users.get(id).expect("row inserted above");
        directives.push(Directive::send(conn, join(self_row)));
        for user in self.users.connected().filter(|u| u.id() != id) {
            directives.push(Directive::send(conn, join(user)));
        }
        directives.extend(self.broadcast_except(conn, &join(self_row)));
        directives.extend(self.session_sync(conn));

        self.emit(ServerEvent::UserJoined { id });
        Ok(directives)
    }

    fn check_login(
        &self,
        name: &str,
        color: UserColor,
        token: &str,
        global_digest: &str,
        user_digest: &str,
    ) -> Option<LoginFailure> {
        if self
            .users
            .connected()
            .any(|u| u.name() == name)
        {
            return Some(LoginFailure::NameInUse);
        }
        if self.users.color_in_use(color, None) {
            return Some(LoginFailure::ColorInUse);
        }
        if let Some(global_password) = &self.config.global_password {
            if global_digest != login_digest(token, global_password) {
                return Some(LoginFailure::WrongGlobalPassword);
            }
        }
        if let Some(row) = self.users.find_by_name(name) {
            if !row.is_connected() && !row.password().is_empty()
                && user_digest != login_digest(token, row.password())
            {
                return Some(LoginFailure::WrongUserPassword);
            }
        }
        None
    }

    /// The post-login state dump: non-connected users, then the document
    /// list with subscribers, then the final marker.
    fn session_sync(&self, conn: ConnId) -> Vec<Directive> {
        let mut directives = Vec::new();
        let non_connected = self.users.non_connected().count() as u32;
        directives.push(Directive::send(
            conn,
            Packet::new(command::SYNC_INIT)
                .with_uint(non_connected)
                .with_uint(self.documents.len() as u32),
        ));
        for user in self.users.non_connected() {
            directives.push(Directive::send(
                conn,
                Packet::new(command::SYNC_USERTABLE_USER)
                    .with_uint(user.id())
                    .with_str(user.name())
                    .with_color(user.color()),
            ));
        }
        for doc in self.documents.values() {
            let info = doc.info();
            let mut packet = Packet::new(command::SYNC_DOCLIST_DOCUMENT)
                .with_user_ref(info.key.owner)
                .with_uint(info.key.id)
                .with_str(info.title.clone())
                .with_uint(info.suffix)
                .with_str(info.encoding.clone());
            for subscriber in doc.subscribers() {
                packet = packet.with_user_ref(subscriber);
            }
            directives.push(Directive::send(conn, packet));
        }
        directives.push(Directive::send(conn, Packet::new(command::SYNC_FINAL)));
        directives
    }

    // ─── session-level commands ─────────────────────────────────────────

    fn on_document_create(
        &mut self,
        user: u32,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let id = packet.uint_at(0)?;
        let title = packet.str_at(1)?.to_string();
        let encoding = packet.str_at(2)?.to_string();
        let content = packet.str_at(3)?.to_string();

        let key = DocKey::new(user, id);
        if self.documents.contains_key(&key) {
            return Err(ProtocolError::Malformed(format!(
                "document {key} already exists"
            )));
        }
        if self.documents.len() >= self.config.max_documents {
            // The owner created the document optimistically; retracting it
            // with a remove undoes that without dropping the connection.
            log::warn!("document limit reached, rejecting create of {key}");
            let conn = self.conns.get(&user).copied();
            return Ok(conn
                .map(|conn| {
                    vec![Directive::send(
                        conn,
                        Packet::new(command::DOCUMENT_REMOVE).with_doc_ref(key),
                    )]
                })
                .unwrap_or_default());
        }

        let suffix = find_free_suffix(&title, None, self.infos());
        let info = DocumentInfo::new(key, title, suffix, encoding);
        let announce = Packet::new(command::DOCUMENT_CREATE)
            .with_user_ref(key.owner)
            .with_uint(key.id)
            .with_str(info.title.clone())
            .with_uint(suffix)
            .with_str(info.encoding.clone());

        let mut doc = ServerDocument::new(info, DocumentContent::with_text(&content, None));
        doc.subscribe(user)?;
        self.documents.insert(key, doc);
        log::info!("user {user:x} created document {key} (suffix {suffix})");

        // The owner already has the document locally; everyone else learns
        // about it here.
        let skip = self.conns.get(&user).copied();
        let directives = match skip {
            Some(conn) => self.broadcast_except(conn, &announce),
            None => self.broadcast(&announce),
        };
        self.emit(ServerEvent::DocumentCreated { key });
        self.emit(ServerEvent::Subscribed { key, user });
        Ok(directives)
    }

    fn on_document_remove(
        &mut self,
        user: u32,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let key = packet.doc_ref_at(0)?;
        let doc = self
            .documents
            .get(&key)
            .ok_or(ProtocolError::UnknownDocument(key))?;
        if !doc.query_privileges(user).contains(Privileges::CLOSE) {
            log::warn!("user {user:x} may not remove document {key}; dropped");
            return Ok(Vec::new());
        }
        Ok(self.remove_document(key))
    }

    fn remove_document(&mut self, key: DocKey) -> Vec<Directive> {
        let Some(doc) = self.documents.remove(&key) else {
            return Vec::new();
        };
        for user in doc.subscribers() {
            self.emit(ServerEvent::Unsubscribed { key, user });
        }
        log::info!("document {key} removed");
        let directives =
            self.broadcast(&Packet::new(command::DOCUMENT_REMOVE).with_doc_ref(key));
        self.emit(ServerEvent::DocumentRemoved { key });
        directives
    }

    fn on_message(
        &mut self,
        user: u32,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let text = packet.str_at(0)?.to_string();
        let relay = Packet::new(command::MESSAGE)
            .with_user_ref(user)
            .with_str(text.clone());
        self.emit(ServerEvent::Message { writer: Some(user), text });
        Ok(self.broadcast(&relay))
    }

    fn on_user_password(
        &mut self,
        conn: ConnId,
        user: u32,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let ciphertext = packet.str_at(0)?;
        let Some(cipher) = &self.cipher else {
            log::warn!("user {user:x} sent a password but no cipher is configured");
            return Ok(vec![Directive::send(
                conn,
                Packet::new(command::LOGIN_FAILED)
                    .with_uint(LoginFailure::NotEncrypted.code()),
            )]);
        };
        let password = cipher
            .decrypt(ciphertext)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let Some(row) = self.users.get_mut(user) {
            row.set_password(password);
            log::info!("user {user:x} set a password");
        }
        Ok(Vec::new())
    }

    fn on_user_colour(
        &mut self,
        conn: ConnId,
        user: u32,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let color = packet.color_at(0)?;
        if self.users.color_in_use(color, Some(user)) {
            log::debug!("colour change of user {user:x} denied, colour in use");
            return Ok(vec![Directive::send(
                conn,
                Packet::new(command::USER_COLOUR_FAILED),
            )]);
        }
        if let Some(row) = self.users.get_mut(user) {
            row.set_color(color);
        }
        self.emit(ServerEvent::UserColorChanged { id: user, color });
        Ok(self.broadcast(
            &Packet::new(command::USER_COLOUR)
                .with_user_ref(user)
                .with_color(color),
        ))
    }

    // ─── document-scoped commands ───────────────────────────────────────

    fn on_document_packet(
        &mut self,
        conn: ConnId,
        user: u32,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let key = packet.doc_ref_at(0)?;
        if !self.documents.contains_key(&key) {
            return Err(ProtocolError::UnknownDocument(key));
        }
        match packet.str_at(1)? {
            command::SUBSCRIBE => self.on_subscribe(conn, user, key),
            command::UNSUBSCRIBE => self.on_unsubscribe(user, key),
            command::RENAME => self.on_rename(conn, user, key, packet),
            command::RECORD => self.on_record(user, key, packet),
            other => Err(ProtocolError::UnexpectedCommand(format!(
                "document {key}: {other}"
            ))),
        }
    }

    fn on_subscribe(
        &mut self,
        conn: ConnId,
        user: u32,
        key: DocKey,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let doc = self.documents.get_mut(&key).expect("checked by caller");
        if doc.is_subscribed(user) {
            return Err(ProtocolError::Malformed(format!(
                "user {user:x} is already subscribed to {key}"
            )));
        }
        if !doc.query_privileges(user).contains(Privileges::SUBSCRIBE) {
            log::warn!("user {user:x} may not subscribe to {key}");
            return Ok(vec![Directive::send(
                conn,
                Packet::for_document(key, command::SUBSCRIBE_FAILED),
            )]);
        }
        doc.subscribe(user)?;
        log::debug!("user {user:x} subscribed to {key}");

        // Content transfer to the subscriber, chunk by chunk.
        let mut directives = vec![Directive::send(
            conn,
            Packet::for_document(key, command::SYNC_INIT)
                .with_uint(doc.content().chunk_count() as u32),
        )];
        for chunk in doc.content().chunks() {
            directives.push(Directive::send(
                conn,
                Packet::for_document(key, command::SYNC_CHUNK)
                    .with_str(chunk.text())
                    .with_user_ref(chunk.author().unwrap_or(SERVER_USER_ID)),
            ));
        }
        directives.push(Directive::send(
            conn,
            Packet::for_document(key, command::SYNC_FINAL),
        ));

        // Everyone else learns about the new subscriber; the stream above is
        // the requester's own confirmation.
        directives.extend(self.broadcast_except(
            conn,
            &Packet::for_document(key, command::SUBSCRIBE).with_user_ref(user),
        ));
        self.emit(ServerEvent::Subscribed { key, user });
        Ok(directives)
    }

    fn on_unsubscribe(
        &mut self,
        user: u32,
        key: DocKey,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let doc = self.documents.get_mut(&key).expect("checked by caller");
        doc.unsubscribe(user)?;
        log::debug!("user {user:x} unsubscribed from {key}");
        let directives = self.broadcast(
            &Packet::for_document(key, command::UNSUBSCRIBE).with_user_ref(user),
        );
        self.emit(ServerEvent::Unsubscribed { key, user });
        Ok(directives)
    }

    fn on_rename(
        &mut self,
        conn: ConnId,
        user: u32,
        key: DocKey,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let new_title = packet.str_at(2)?.to_string();
        let doc = self.documents.get(&key).expect("checked by caller");
        if !doc.query_privileges(user).contains(Privileges::RENAME) {
            log::warn!("user {user:x} may not rename {key}");
            return Ok(vec![Directive::send(
                conn,
                Packet::for_document(key, command::RENAME_FAILED),
            )]);
        }
        let suffix = find_free_suffix(&new_title, Some(key), self.infos());
        let doc = self.documents.get_mut(&key).expect("checked by caller");
        doc.rename(new_title.clone(), suffix);
        log::info!("document {key} renamed to {new_title:?} (suffix {suffix})");

        let directives = self.broadcast(
            &Packet::for_document(key, command::RENAME)
                .with_str(new_title.clone())
                .with_uint(suffix),
        );
        self.emit(ServerEvent::DocumentRenamed { key, title: new_title, suffix });
        Ok(directives)
    }

    fn on_record(
        &mut self,
        user: u32,
        key: DocKey,
        packet: &Packet,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let doc = self.documents.get_mut(&key).expect("checked by caller");
        if !doc.is_subscribed(user) {
            log::warn!("record for {key} from non-subscriber {user:x}; dropped");
            return Ok(Vec::new());
        }
        if !doc.query_privileges(user).contains(Privileges::MODIFY) {
            log::warn!("user {user:x} may not modify {key}; record dropped");
            return Ok(Vec::new());
        }

        let mut index = 2;
        let record = read_record(packet, &mut index, user)?;
        let outcome = match doc.handle_record(user, &record) {
            Ok(outcome) => outcome,
            Err(ProtocolError::Core(err)) => {
                // The link for this document is broken beyond repair; close
                // the document for this peer, keep the session.
                log::error!("document {key} desynchronized for user {user:x}: {err}");
                let _ = doc.unsubscribe(user);
                let directives = self.broadcast(
                    &Packet::for_document(key, command::UNSUBSCRIBE).with_user_ref(user),
                );
                self.emit(ServerEvent::Desynchronized { key, user });
                self.emit(ServerEvent::Unsubscribed { key, user });
                return Ok(directives);
            }
            Err(other) => return Err(other),
        };

        let mut directives = Vec::with_capacity(outcome.forwards.len());
        for (peer, forward) in &outcome.forwards {
            if let Some(peer_conn) = self.conns.get(peer) {
                let packet = write_record(
                    Packet::for_document(key, command::RECORD).with_user_ref(forward.author),
                    forward,
                );
                directives.push(Directive::send(*peer_conn, packet));
            }
        }
        self.emit(ServerEvent::Changed { key, author: user });
        Ok(directives)
    }

    // ─── server-initiated operations ────────────────────────────────────

    /// Creates a server-owned document (no user owner, nobody subscribed).
    pub fn document_create(&mut self, title: &str, content: &str) -> (DocKey, Vec<Directive>) {
        self.doc_counter += 1;
        let key = DocKey::new(SERVER_USER_ID, self.doc_counter);
        let suffix = find_free_suffix(title, None, self.infos());
        let info = DocumentInfo::new(key, title, suffix, self.config.default_encoding.clone());
        let announce = Packet::new(command::DOCUMENT_CREATE)
            .with_user_ref(key.owner)
            .with_uint(key.id)
            .with_str(title)
            .with_uint(suffix)
            .with_str(info.encoding.clone());
        self.documents
            .insert(key, ServerDocument::new(info, DocumentContent::with_text(content, None)));
        log::info!("server created document {key} ({title:?})");
        self.emit(ServerEvent::DocumentCreated { key });
        (key, self.broadcast(&announce))
    }

    /// Removes a document, notifying every client.
    pub fn document_remove(&mut self, key: DocKey) -> Result<Vec<Directive>, ProtocolError> {
        if !self.documents.contains_key(&key) {
            return Err(ProtocolError::UnknownDocument(key));
        }
        Ok(self.remove_document(key))
    }

    /// Sends a chat message from the server itself.
    pub fn send_message(&mut self, text: &str) -> Vec<Directive> {
        self.emit(ServerEvent::Message { writer: None, text: text.to_string() });
        self.broadcast(
            &Packet::new(command::MESSAGE)
                .with_user_ref(SERVER_USER_ID)
                .with_str(text),
        )
    }

    /// Applies a server-side edit (host role) and forwards it to every
    /// subscriber through its twin.
    pub fn server_edit(
        &mut self,
        key: DocKey,
        op: scribe_core::Operation,
    ) -> Result<Vec<Directive>, ProtocolError> {
        let doc = self
            .documents
            .get_mut(&key)
            .ok_or(ProtocolError::UnknownDocument(key))?;
        let forwards = doc.server_edit(op)?;
        let mut directives = Vec::with_capacity(forwards.len());
        for (peer, forward) in &forwards {
            if let Some(peer_conn) = self.conns.get(peer) {
                let packet = write_record(
                    Packet::for_document(key, command::RECORD).with_user_ref(forward.author),
                    forward,
                );
                directives.push(Directive::send(*peer_conn, packet));
            }
        }
        self.emit(ServerEvent::Changed { key, author: SERVER_USER_ID });
        Ok(directives)
    }

    // ─── persistence ────────────────────────────────────────────────────

    /// Captures the session as the persisted object tree.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            users: self
                .users
                .iter()
                .map(|user| UserRecord {
                    id: user.id(),
                    name: user.name().to_string(),
                    red: user.color().red,
                    green: user.color().green,
                    blue: user.color().blue,
                    password: user.password().to_string(),
                })
                .collect(),
            documents: self
                .documents
                .values()
                .map(|doc| {
                    let info = doc.info();
                    DocumentRecord {
                        owner: info.key.owner,
                        id: info.key.id,
                        title: info.title.clone(),
                        suffix: info.suffix,
                        encoding: info.encoding.clone(),
                        chunks: doc
                            .content()
                            .chunks()
                            .map(|chunk| ChunkRecord {
                                content: chunk.text().to_string(),
                                author: chunk.author().unwrap_or(SERVER_USER_ID),
                            })
                            .collect(),
                    }
                })
                .collect(),
        }
    }

    /// Rebuilds session state from a snapshot. Meant for a freshly created
    /// buffer, before any client connects; every restored user starts
    /// offline and nobody is subscribed.
    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        for user in snapshot.users {
            let mut row = User::new(
                user.id,
                user.name,
                UserColor::new(user.red, user.green, user.blue),
                UserFlags::NONE,
            );
            row.set_password(user.password);
            self.users.insert_row(row);
        }
        for doc in snapshot.documents {
            let key = DocKey::new(doc.owner, doc.id);
            let info = DocumentInfo::new(key, doc.title, doc.suffix, doc.encoding);
            let mut content = DocumentContent::new();
            for chunk in doc.chunks {
                let author = (chunk.author != SERVER_USER_ID).then_some(chunk.author);
                content.append_chunk(chunk.content, author);
            }
            if key.owner == SERVER_USER_ID {
                self.doc_counter = self.doc_counter.max(key.id);
            }
            self.documents.insert(key, ServerDocument::new(info, content));
        }
        log::info!(
            "session restored: {} users, {} documents",
            self.users.len(),
            self.documents.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlainCipher;

    const COLOR_A: UserColor = UserColor { red: 12, green: 34, blue: 56 };
    const COLOR_B: UserColor = UserColor { red: 200, green: 10, blue: 30 };

    fn login_packet(name: &str, color: UserColor, global: &str, user_pw: &str) -> Packet {
        Packet::new(command::LOGIN)
            .with_str(name)
            .with_color(color)
            .with_str(global)
            .with_str(user_pw)
    }

    /// Connects and logs a user in, returning the token from `welcome`.
    fn join(server: &mut ServerBuffer, conn: ConnId, name: &str, color: UserColor) -> String {
        let directives = server.handle_connect(conn);
        let token = match &directives[0] {
            Directive::Send { packet, .. } => packet.str_at(1).unwrap().to_string(),
            other => panic!("expected welcome, got {other:?}"),
        };
        let out = server
            .handle_packet(conn, &login_packet(name, color, "", ""))
            .unwrap();
        assert!(
            out.iter().any(|d| matches!(
                d,
                Directive::Send { conn: c, packet } if *c == conn && packet.command() == command::USER_JOIN
            )),
            "login should produce a user_join for the newcomer"
        );
        token
    }

    fn sent_to<'a>(directives: &'a [Directive], conn: ConnId) -> Vec<&'a Packet> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Send { conn: c, packet } if *c == conn => Some(packet),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_welcome_carries_version_token_and_key() {
        let mut server = ServerBuffer::with_defaults().with_cipher(Box::new(PlainCipher::new()));
        let directives = server.handle_connect(1);
        assert_eq!(directives.len(), 1);
        let Directive::Send { conn, packet } = &directives[0] else {
            panic!("expected a send");
        };
        assert_eq!(*conn, 1);
        assert_eq!(packet.command(), command::WELCOME);
        assert_eq!(packet.uint_at(0).unwrap(), PROTOCOL_VERSION);
        assert!(!packet.str_at(1).unwrap().is_empty());
    }

    #[test]
    fn test_login_assigns_sequential_ids() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);
        assert_eq!(server.users().find_by_name("alice").unwrap().id(), 1);
        assert_eq!(server.users().find_by_name("bob").unwrap().id(), 2);
    }

    #[test]
    fn test_login_color_conflict_rejected_table_unchanged() {
        let mut server = ServerBuffer::with_defaults();
        server.set_global_password(Some("pw".into()));

        // First user in with the right password.
        let directives = server.handle_connect(1);
        let token = match &directives[0] {
            Directive::Send { packet, .. } => packet.str_at(1).unwrap().to_string(),
            _ => unreachable!(),
        };
        server
            .handle_packet(
                1,
                &login_packet("alice", COLOR_A, &login_digest(&token, "pw"), ""),
            )
            .unwrap();

        // Second user picks the same colour.
        let directives = server.handle_connect(2);
        let token2 = match &directives[0] {
            Directive::Send { packet, .. } => packet.str_at(1).unwrap().to_string(),
            _ => unreachable!(),
        };
        let out = server
            .handle_packet(
                2,
                &login_packet("bob", COLOR_A, &login_digest(&token2, "pw"), ""),
            )
            .unwrap();
        let replies = sent_to(&out, 2);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command(), command::LOGIN_FAILED);
        assert_eq!(
            LoginFailure::from_code(replies[0].uint_at(0).unwrap()),
            Some(LoginFailure::ColorInUse)
        );
        assert!(server.users().find_by_name("bob").is_none(), "table unchanged");
    }

    #[test]
    fn test_login_wrong_global_password() {
        let mut server = ServerBuffer::with_defaults();
        server.set_global_password(Some("sesame".into()));
        server.handle_connect(1);
        let out = server
            .handle_packet(1, &login_packet("alice", COLOR_A, "bad-digest", ""))
            .unwrap();
        let replies = sent_to(&out, 1);
        assert_eq!(
            LoginFailure::from_code(replies[0].uint_at(0).unwrap()),
            Some(LoginFailure::WrongGlobalPassword)
        );
    }

    #[test]
    fn test_login_duplicate_name_rejected() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        server.handle_connect(2);
        let out = server
            .handle_packet(2, &login_packet("alice", COLOR_B, "", ""))
            .unwrap();
        let replies = sent_to(&out, 2);
        assert_eq!(
            LoginFailure::from_code(replies[0].uint_at(0).unwrap()),
            Some(LoginFailure::NameInUse)
        );
    }

    #[test]
    fn test_reconnect_requires_user_password() {
        let mut server = ServerBuffer::with_defaults().with_cipher(Box::new(PlainCipher::new()));
        join(&mut server, 1, "alice", COLOR_A);
        server
            .handle_packet(1, &Packet::new(command::USER_PASSWORD).with_str("hunter2"))
            .unwrap();
        server.handle_disconnect(1);

        // Wrong digest is rejected.
        let directives = server.handle_connect(2);
        let token = match &directives[0] {
            Directive::Send { packet, .. } => packet.str_at(1).unwrap().to_string(),
            _ => unreachable!(),
        };
        let out = server
            .handle_packet(2, &login_packet("alice", COLOR_A, "", "nope"))
            .unwrap();
        assert_eq!(
            LoginFailure::from_code(sent_to(&out, 2)[0].uint_at(0).unwrap()),
            Some(LoginFailure::WrongUserPassword)
        );

        // Correct digest rebinds the original id.
        let out = server
            .handle_packet(
                2,
                &login_packet("alice", COLOR_A, "", &login_digest(&token, "hunter2")),
            )
            .unwrap();
        assert!(!out.is_empty());
        let row = server.users().find_by_name("alice").unwrap();
        assert_eq!(row.id(), 1);
        assert!(row.is_connected());
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        let err = server
            .handle_packet(1, &Packet::new("make_me_a_sandwich"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedCommand(_)));
    }

    #[test]
    fn test_pre_login_commands_rejected() {
        let mut server = ServerBuffer::with_defaults();
        server.handle_connect(1);
        let err = server
            .handle_packet(1, &Packet::new(command::MESSAGE).with_str("hi"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedCommand(_)));
    }

    #[test]
    fn test_document_create_skips_owner_and_assigns_suffix() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);

        let create = Packet::new(command::DOCUMENT_CREATE)
            .with_uint(1)
            .with_str("notes")
            .with_str("UTF-8")
            .with_str("seed");
        let out = server.handle_packet(1, &create).unwrap();
        assert!(sent_to(&out, 1).is_empty(), "owner already has the document");
        let to_bob = sent_to(&out, 2);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].command(), command::DOCUMENT_CREATE);
        assert_eq!(to_bob[0].uint_at(3).unwrap(), 1);

        // Same title from bob gets suffix 2.
        let create2 = Packet::new(command::DOCUMENT_CREATE)
            .with_uint(1)
            .with_str("notes")
            .with_str("UTF-8")
            .with_str("");
        let out = server.handle_packet(2, &create2).unwrap();
        let to_alice = sent_to(&out, 1);
        assert_eq!(to_alice[0].uint_at(3).unwrap(), 2);

        let doc = server.document(DocKey::new(1, 1)).unwrap();
        assert!(doc.is_subscribed(1), "owner is implicitly subscribed");
        assert_eq!(doc.content().text(), "seed");
    }

    #[test]
    fn test_subscribe_syncs_content_chunkwise() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("doc")
                    .with_str("UTF-8")
                    .with_str("HI"),
            )
            .unwrap();

        let key = DocKey::new(1, 1);
        let out = server
            .handle_packet(2, &Packet::for_document(key, command::SUBSCRIBE))
            .unwrap();
        let to_bob = sent_to(&out, 2);
        assert_eq!(to_bob[0].str_at(1).unwrap(), command::SYNC_INIT);
        assert_eq!(to_bob[0].uint_at(2).unwrap(), 1);
        assert_eq!(to_bob[1].str_at(1).unwrap(), command::SYNC_CHUNK);
        assert_eq!(to_bob[1].str_at(2).unwrap(), "HI");
        assert_eq!(to_bob[2].str_at(1).unwrap(), command::SYNC_FINAL);

        // The other subscriber hears about bob.
        let to_alice = sent_to(&out, 1);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].str_at(1).unwrap(), command::SUBSCRIBE);
    }

    #[test]
    fn test_record_round_trip_between_clients() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("doc")
                    .with_str("UTF-8")
                    .with_str("HELLO"),
            )
            .unwrap();
        let key = DocKey::new(1, 1);
        server
            .handle_packet(2, &Packet::for_document(key, command::SUBSCRIBE))
            .unwrap();

        let record = scribe_core::Record::new(
            1,
            scribe_core::Operation::insert(0, "X"),
            scribe_core::StateVector::new(0, 0),
        );
        let packet = write_record(Packet::for_document(key, command::RECORD), &record);
        let out = server.handle_packet(1, &packet).unwrap();

        assert_eq!(server.document(key).unwrap().content().text(), "XHELLO");
        let to_bob = sent_to(&out, 2);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].str_at(1).unwrap(), command::RECORD);
        assert_eq!(to_bob[0].user_ref_at(2).unwrap(), 1);
    }

    #[test]
    fn test_record_from_non_subscriber_dropped() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("doc")
                    .with_str("UTF-8")
                    .with_str(""),
            )
            .unwrap();
        let key = DocKey::new(1, 1);
        let record = scribe_core::Record::new(
            2,
            scribe_core::Operation::insert(0, "X"),
            scribe_core::StateVector::new(0, 0),
        );
        let packet = write_record(Packet::for_document(key, command::RECORD), &record);
        let out = server.handle_packet(2, &packet).unwrap();
        assert!(out.is_empty());
        assert_eq!(server.document(key).unwrap().content().text(), "");
    }

    #[test]
    fn test_desynchronized_record_closes_document_not_session() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("doc")
                    .with_str("UTF-8")
                    .with_str(""),
            )
            .unwrap();
        let key = DocKey::new(1, 1);

        // A record claiming a future sequence number.
        let record = scribe_core::Record::new(
            1,
            scribe_core::Operation::insert(0, "X"),
            scribe_core::StateVector::new(5, 0),
        );
        let packet = write_record(Packet::for_document(key, command::RECORD), &record);
        let out = server.handle_packet(1, &packet).unwrap();

        assert!(!server.document(key).unwrap().is_subscribed(1));
        let to_alice = sent_to(&out, 1);
        assert_eq!(to_alice[0].str_at(1).unwrap(), command::UNSUBSCRIBE);
    }

    #[test]
    fn test_rename_assigns_free_suffix() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        let (_, _) = server.document_create("report", "");
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("draft")
                    .with_str("UTF-8")
                    .with_str(""),
            )
            .unwrap();
        let key = DocKey::new(1, 1);
        let out = server
            .handle_packet(
                1,
                &Packet::for_document(key, command::RENAME).with_str("report"),
            )
            .unwrap();
        let to_alice = sent_to(&out, 1);
        assert_eq!(to_alice[0].str_at(2).unwrap(), "report");
        assert_eq!(to_alice[0].uint_at(3).unwrap(), 2);
        assert_eq!(server.document(key).unwrap().info().suffixed_title(), "report (2)");
    }

    #[test]
    fn test_rename_without_privilege_fails() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        // Server-owned document: alice only has default privileges.
        let (key, _) = server.document_create("locked", "");
        let out = server
            .handle_packet(
                1,
                &Packet::for_document(key, command::RENAME).with_str("unlocked"),
            )
            .unwrap();
        let to_alice = sent_to(&out, 1);
        assert_eq!(to_alice[0].str_at(1).unwrap(), command::RENAME_FAILED);
        assert_eq!(server.document(key).unwrap().info().title, "locked");
    }

    #[test]
    fn test_colour_change_conflict_and_success() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);

        let out = server
            .handle_packet(2, &Packet::new(command::USER_COLOUR).with_color(COLOR_A))
            .unwrap();
        let to_bob = sent_to(&out, 2);
        assert_eq!(to_bob[0].command(), command::USER_COLOUR_FAILED);

        let fresh = UserColor::new(1, 2, 3);
        let out = server
            .handle_packet(2, &Packet::new(command::USER_COLOUR).with_color(fresh))
            .unwrap();
        assert_eq!(out.len(), 2, "colour change is broadcast to everyone");
        assert_eq!(server.users().get(2).unwrap().color(), fresh);
    }

    #[test]
    fn test_disconnect_parts_user_and_unsubscribes() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        join(&mut server, 2, "bob", COLOR_B);
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("doc")
                    .with_str("UTF-8")
                    .with_str(""),
            )
            .unwrap();
        let key = DocKey::new(1, 1);

        let out = server.handle_disconnect(1);
        let to_bob = sent_to(&out, 2);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].command(), command::USER_PART);
        assert_eq!(to_bob[0].uint_at(0).unwrap(), 1);

        assert!(!server.users().get(1).unwrap().is_connected());
        assert!(!server.document(key).unwrap().is_subscribed(1));
    }

    #[test]
    fn test_session_sync_lists_offline_users_and_documents() {
        let mut server = ServerBuffer::with_defaults();
        join(&mut server, 1, "alice", COLOR_A);
        server.document_create("kept", "text");
        server.handle_disconnect(1);

        server.handle_connect(2);
        let out = server
            .handle_packet(2, &login_packet("bob", COLOR_B, "", ""))
            .unwrap();
        let to_bob = sent_to(&out, 2);
        let sync_init = to_bob
            .iter()
            .find(|p| p.command() == command::SYNC_INIT)
            .expect("session sync present");
        assert_eq!(sync_init.uint_at(0).unwrap(), 1, "one offline user");
        assert_eq!(sync_init.uint_at(1).unwrap(), 1, "one document");
        assert!(to_bob.iter().any(|p| p.command() == command::SYNC_USERTABLE_USER));
        assert!(to_bob.iter().any(|p| p.command() == command::SYNC_DOCLIST_DOCUMENT));
        assert_eq!(to_bob.last().unwrap().command(), command::SYNC_FINAL);
    }

    #[test]
    fn test_document_limit_rejects_create_with_retraction() {
        let mut server = ServerBuffer::new(ServerConfig {
            max_documents: 1,
            ..ServerConfig::default()
        });
        join(&mut server, 1, "alice", COLOR_A);
        server.document_create("first", "");

        let out = server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("second")
                    .with_str("UTF-8")
                    .with_str(""),
            )
            .unwrap();
        let to_alice = sent_to(&out, 1);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].command(), command::DOCUMENT_REMOVE);
        assert_eq!(to_alice[0].doc_ref_at(0).unwrap(), DocKey::new(1, 1));
        assert_eq!(server.document_count(), 1);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut server = ServerBuffer::with_defaults().with_cipher(Box::new(PlainCipher::new()));
        join(&mut server, 1, "alice", COLOR_A);
        server
            .handle_packet(1, &Packet::new(command::USER_PASSWORD).with_str("pw"))
            .unwrap();
        server
            .handle_packet(
                1,
                &Packet::new(command::DOCUMENT_CREATE)
                    .with_uint(1)
                    .with_str("notes")
                    .with_str("UTF-8")
                    .with_str("content"),
            )
            .unwrap();

        let snapshot = server.snapshot();
        let mut restored = ServerBuffer::with_defaults();
        restored.restore(snapshot);

        let row = restored.users().find_by_name("alice").unwrap();
        assert_eq!(row.id(), 1);
        assert!(!row.is_connected());
        assert_eq!(row.password(), "pw");

        let doc = restored.document(DocKey::new(1, 1)).unwrap();
        assert_eq!(doc.content().text(), "content");
        assert_eq!(doc.subscriber_count(), 0);
    }
}

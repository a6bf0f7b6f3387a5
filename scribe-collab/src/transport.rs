//! WebSocket transport binding.
//!
//! The buffers in [`crate::server`] and [`crate::client`] are synchronous
//! state machines; this module is the provided way to drive them over a real
//! network. WebSocket binary messages are the frames, so packet boundaries
//! come for free.
//!
//! ```text
//! CollabServer::run
//!   ├── accept loop ── one task per connection
//!   │     ├── reader: frame → Packet → ServerBuffer::handle_packet
//!   │     └── writer: outgoing mpsc → frame
//!   └── ServerBuffer behind a Mutex (one handler at a time, run to
//!       completion; no OT work interleaves with I/O on a document)
//! ```
//!
//! The client mirrors the shape: a reader task feeds `ClientBuffer`, its
//! replies go out through the writer channel, and the editor-facing async
//! methods lock the buffer, build the request packet and ship it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use scribe_core::UserColor;

use crate::client::ClientBuffer;
use crate::error::ProtocolError;
use crate::protocol::{DocKey, Packet};
use crate::server::{ConnId, Directive, ServerBuffer};

type WriterMap = HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>;

/// Frames beyond this size are rejected without closing the connection.
const MAX_FRAME_BYTES: usize = 1 << 20;

/// Serves a [`ServerBuffer`] over WebSocket connections.
pub struct CollabServer {
    bind_addr: String,
    buffer: Arc<Mutex<ServerBuffer>>,
    writers: Arc<Mutex<WriterMap>>,
    next_conn: AtomicU64,
}

impl CollabServer {
    pub fn new(bind_addr: impl Into<String>, buffer: ServerBuffer) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            buffer: Arc::new(Mutex::new(buffer)),
            writers: Arc::new(Mutex::new(HashMap::new())),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Shared handle to the session state, e.g. for server-initiated
    /// operations while the accept loop runs.
    pub fn buffer(&self) -> Arc<Mutex<ServerBuffer>> {
        self.buffer.clone()
    }

    /// Accepts connections until the listener fails. Run from an async
    /// runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        log::info!("collaboration server listening on {}", self.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            log::debug!("tcp connection from {addr} (conn {conn})");

            let buffer = self.buffer.clone();
            let writers = self.writers.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, conn, buffer, writers.clone()).await {
                    log::warn!("connection {conn} ended with error: {e}");
                }
                writers.lock().await.remove(&conn);
            });
        }
    }
}

/// Performs directives against the writer map. Dropping a writer ends its
/// writer task, which closes the socket.
async fn perform(directives: Vec<Directive>, writers: &Mutex<WriterMap>) {
    let mut writers = writers.lock().await;
    for directive in directives {
        match directive {
            Directive::Send { conn, packet } => match packet.encode() {
                Ok(bytes) => {
                    if let Some(tx) = writers.get(&conn) {
                        let _ = tx.send(bytes);
                    }
                }
                Err(e) => log::error!("dropping unencodable packet: {e}"),
            },
            Directive::Close { conn } => {
                writers.remove(&conn);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    conn: ConnId,
    buffer: Arc<Mutex<ServerBuffer>>,
    writers: Arc<Mutex<WriterMap>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Writer task: forward the outgoing channel onto the socket.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    writers.lock().await.insert(conn, out_tx);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Greet: token issue and welcome packet.
    {
        let directives = buffer.lock().await.handle_connect(conn);
        perform(directives, &writers).await;
    }

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                if bytes.len() > MAX_FRAME_BYTES {
                    log::warn!("conn {conn}: oversize frame ({} bytes) rejected", bytes.len());
                    continue;
                }
                let packet = match Packet::decode(&bytes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        log::warn!("conn {conn}: undecodable frame: {e}");
                        break;
                    }
                };
                let result = buffer.lock().await.handle_packet(conn, &packet);
                match result {
                    Ok(directives) => perform(directives, &writers).await,
                    Err(e) => {
                        // Protocol violation: this connection is done.
                        log::warn!("conn {conn}: protocol violation: {e}");
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    let directives = buffer.lock().await.handle_disconnect(conn);
    perform(directives, &writers).await;
    writers.lock().await.remove(&conn);
    writer_task.abort();
    log::info!("connection {conn} closed");
    Ok(())
}

/// A connected client endpoint: drives a [`ClientBuffer`] over WebSocket.
///
/// Dropping the client tears the connection down: the reader task is
/// aborted and, with every outgoing sender gone, the writer task closes the
/// socket.
pub struct CollabClient {
    buffer: Arc<Mutex<ClientBuffer>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl CollabClient {
    /// Connects to `url` and runs the handshake-driving reader task. The
    /// login itself happens when the server's `welcome` arrives.
    pub async fn connect(
        url: &str,
        buffer: ClientBuffer,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let buffer = Arc::new(Mutex::new(buffer));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_buffer = buffer.clone();
        let reader_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let packet = match Packet::decode(&bytes) {
                            Ok(packet) => packet,
                            Err(e) => {
                                log::warn!("undecodable frame from server: {e}");
                                break;
                            }
                        };
                        let replies = reader_buffer.lock().await.handle_packet(&packet);
                        match replies {
                            Ok(replies) => {
                                for reply in replies {
                                    match reply.encode() {
                                        Ok(bytes) => {
                                            if reader_tx.send(bytes).is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => log::error!("unencodable reply: {e}"),
                                    }
                                }
                            }
                            Err(e) => {
                                log::error!("session failed: {e}");
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("server connection closed");
        });

        Ok(Self { buffer, outgoing: out_tx, reader })
    }

    /// Runs a closure against the session state.
    pub async fn with_buffer<R>(&self, f: impl FnOnce(&ClientBuffer) -> R) -> R {
        let buffer = self.buffer.lock().await;
        f(&buffer)
    }

    fn send(&self, packet: Packet) -> Result<(), ProtocolError> {
        let bytes = packet.encode()?;
        self.outgoing
            .send(bytes)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn document_create(
        &self,
        title: &str,
        encoding: &str,
        content: &str,
    ) -> Result<DocKey, ProtocolError> {
        let (key, packet) = self
            .buffer
            .lock()
            .await
            .document_create(title, encoding, content)?;
        self.send(packet)?;
        Ok(key)
    }

    pub async fn document_remove(&self, key: DocKey) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.document_remove(key)?;
        self.send(packet)
    }

    pub async fn subscribe(&self, key: DocKey) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.subscribe(key)?;
        self.send(packet)
    }

    pub async fn unsubscribe(&self, key: DocKey) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.unsubscribe(key)?;
        self.send(packet)
    }

    pub async fn insert(&self, key: DocKey, pos: u32, text: &str) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.insert(key, pos, text)?;
        self.send(packet)
    }

    pub async fn erase(&self, key: DocKey, pos: u32, len: u32) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.erase(key, pos, len)?;
        self.send(packet)
    }

    pub async fn rename(&self, key: DocKey, new_title: &str) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.rename(key, new_title)?;
        self.send(packet)
    }

    pub async fn send_message(&self, text: &str) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.send_message(text);
        self.send(packet)
    }

    pub async fn set_color(&self, color: UserColor) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.set_color(color);
        self.send(packet)
    }

    pub async fn set_user_password(&self, password: &str) -> Result<(), ProtocolError> {
        let packet = self.buffer.lock().await.set_user_password(password)?;
        self.send(packet)
    }
}

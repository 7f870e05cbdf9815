//! One established WebSocket peer.
//!
//! A [`Connection`] carries an id, the write half of its transport, a weak
//! link back to the registry (for broadcast) and two callback slots:
//! `on_message` and `on_close`. Registering a slot replaces whatever handler
//! was there before.
//!
//! Lifecycle: `Handshaking -> Open -> Closed`. Only the server moves a
//! connection between states; once `Closed`, sends fail without touching the
//! transport.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{WsError, WsResult};
use crate::frame;
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;

/// Handler for inbound text messages.
pub type MessageHandler = Box<dyn FnMut(&Connection, &str) + Send>;

/// Handler fired once when the connection closes.
pub type CloseHandler = Box<dyn FnMut(&Connection) + Send>;

/// Process-wide sequence feeding connection ids.
static NEXT_CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Opaque connection identity.
///
/// Generated ids are a random 32-bit prefix followed by a process-wide
/// sequence number, so two connections in one process never share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        let seq = NEXT_CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::random();
        ConnectionId(format!("{:08x}{:012x}", salt, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        ConnectionId(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        ConnectionId(id)
    }
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Handshaking = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    transport: Mutex<Box<dyn Transport>>,
    registry: Weak<ConnectionRegistry>,
    on_message: Mutex<Option<MessageHandler>>,
    on_close: Mutex<Option<CloseHandler>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Box<dyn Transport>,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        Connection {
            id,
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            transport: Mutex::new(transport),
            registry,
            on_message: Mutex::new(None),
            on_close: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Set the handler for inbound text messages, replacing any previous one.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(&Connection, &str) + Send + 'static,
    {
        *self.on_message.lock() = Some(Box::new(handler));
    }

    /// Set the handler fired when the connection closes, replacing any
    /// previous one.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnMut(&Connection) + Send + 'static,
    {
        *self.on_close.lock() = Some(Box::new(handler));
    }

    /// Send `message` as a single text frame.
    pub fn send(&self, message: &str) -> WsResult<()> {
        self.send_encoded(&frame::encode_text(message))
    }

    /// Send `message` to every registered connection, skipping this one
    /// unless `include_self` is set.
    ///
    /// The frame is encoded once. Every member present when the call starts
    /// gets exactly one attempt; the return value is the number of attempts
    /// that failed.
    pub fn broadcast(&self, message: &str, include_self: bool) -> usize {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let encoded = frame::encode_text(message);
        let members = registry.snapshot();
        debug!(conn = %self.id, recipients = members.len(), include_self, "broadcast");

        let mut failures = 0;
        for member in members {
            if !include_self && member.id == self.id {
                continue;
            }
            if let Err(e) = member.send_encoded(&encoded) {
                warn!(from = %self.id, to = %member.id, error = %e, "broadcast delivery failed");
                failures += 1;
            }
        }
        failures
    }

    /// Write an already encoded frame. Fails without writing unless open.
    pub(crate) fn send_encoded(&self, encoded: &[u8]) -> WsResult<()> {
        let mut transport = self.transport.lock();
        // Checked under the transport lock so a concurrent teardown cannot
        // slip between the check and the write.
        if !self.is_open() {
            return Err(WsError::ConnectionClosed(self.id.clone()));
        }
        transport.write_bytes(encoded)?;
        Ok(())
    }

    /// Write raw bytes regardless of state (handshake response).
    pub(crate) fn write_raw(&self, bytes: &[u8]) -> io::Result<()> {
        self.transport.lock().write_bytes(bytes)
    }

    /// `Handshaking -> Open`.
    pub(crate) fn open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Handshaking as u8,
                ConnectionState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Closed`. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        let _transport = self.transport.lock();
        self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst)
            != ConnectionState::Closed as u8
    }

    /// Ask the transport to end the stream.
    pub(crate) fn end(&self) -> io::Result<()> {
        self.transport.lock().end()
    }

    /// Run the message handler, if any. Returns whether one ran.
    ///
    /// The handler is taken out of its slot for the duration of the call so
    /// it may register a replacement or send on this connection. It is put
    /// back only if nothing new was registered meanwhile.
    pub(crate) fn emit_message(&self, text: &str) -> bool {
        let Some(mut handler) = self.on_message.lock().take() else {
            return false;
        };
        handler(self, text);
        let mut slot = self.on_message.lock();
        if slot.is_none() && self.state() != ConnectionState::Closed {
            *slot = Some(handler);
        }
        true
    }

    /// Run the close handler, if any. It fires at most once.
    pub(crate) fn emit_close(&self) -> bool {
        let Some(mut handler) = self.on_close.lock().take() else {
            return false;
        };
        handler(self);
        true
    }

    /// Drop both handlers. Called once the connection is closed so closures
    /// holding an `Arc` to this connection do not keep it alive.
    pub(crate) fn clear_handlers(&self) {
        let on_message = self.on_message.lock().take();
        let on_close = self.on_close.lock().take();
        drop((on_message, on_close));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

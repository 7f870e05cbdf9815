//! Server orchestration: upgrade, dispatch, teardown.
//!
//! The [`Server`] owns the [`ConnectionRegistry`] and is driven by exactly
//! one thread. A host (see [`crate::host`]) reports three kinds of events
//! per socket:
//!
//! - upgrade request -> [`Server::handle_upgrade`]
//! - inbound bytes -> [`Server::handle_data`]
//! - transport closed -> [`Server::handle_close`]
//!
//! ## Lifecycle
//!
//! `Handshaking -> Open` when negotiation succeeds. `Open -> Closed` on the
//! first of: a close frame (transport ended), transport closure (no end
//! needed), or a protocol error (transport ended). Teardown deregisters and
//! fires `on_close` exactly once; later triggers are no-ops.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Options;
use crate::connection::{Connection, ConnectionId};
use crate::error::{FrameError, WsResult};
use crate::frame::{self, Opcode};
use crate::handshake::{self, UpgradeRequest, BAD_REQUEST_RESPONSE};
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;
use crate::warmup;

/// Handler raised once per accepted connection, before any of its frames
/// are dispatched.
pub type ConnectionHandler = Box<dyn FnMut(&Arc<Connection>) + Send>;

/// What `handle_data` did with a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A text frame was decoded and handed to `on_message`.
    Message,
    /// A close frame tore the connection down.
    Closed,
    /// A frame with an opcode the server does not act on.
    Ignored(Opcode),
    /// A protocol error tore the connection down.
    Dropped(FrameError),
    /// No open connection has this id.
    Unknown,
}

pub struct Server {
    options: Options,
    registry: Arc<ConnectionRegistry>,
    on_connection: Option<ConnectionHandler>,
}

impl Server {
    /// Create a server, running the decoder warm-up first when
    /// `options.do_warmup` is set.
    pub fn new(options: Options) -> Self {
        if options.do_warmup {
            warmup::run(&options);
        }
        Server {
            options,
            registry: Arc::new(ConnectionRegistry::new()),
            on_connection: None,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Read-only view of the live connections.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Set the handler for new connections, replacing any previous one.
    pub fn on_connection<F>(&mut self, handler: F)
    where
        F: FnMut(&Arc<Connection>) + Send + 'static,
    {
        self.on_connection = Some(Box::new(handler));
    }

    /// Negotiate an upgrade on `transport`.
    ///
    /// On rejection the 400 response is written, the transport is ended and
    /// the handshake error is returned. On success the 101 response is
    /// written, the connection is registered and announced, and any bytes in
    /// `head` are dispatched as its first chunk.
    pub fn handle_upgrade(
        &mut self,
        request: &UpgradeRequest,
        mut transport: Box<dyn Transport>,
        head: &[u8],
    ) -> WsResult<Arc<Connection>> {
        let accept = match handshake::negotiate(request) {
            Ok(accept) => accept,
            Err(e) => {
                warn!(path = %request.path, error = %e, "rejecting upgrade");
                if let Err(io) = transport.write_bytes(BAD_REQUEST_RESPONSE) {
                    debug!(error = %io, "failed to write 400 response");
                }
                if let Err(io) = transport.end() {
                    debug!(error = %io, "failed to end rejected transport");
                }
                return Err(e.into());
            }
        };

        let conn = Arc::new(Connection::new(
            ConnectionId::generate(),
            transport,
            Arc::downgrade(&self.registry),
        ));
        let response = handshake::upgrade_response(&accept);
        if let Err(e) = conn.write_raw(response.as_bytes()) {
            warn!(conn = %conn.id(), error = %e, "failed to write upgrade response");
            conn.mark_closed();
            if let Err(io) = conn.end() {
                debug!(conn = %conn.id(), error = %io, "failed to end transport");
            }
            return Err(e.into());
        }

        conn.open();
        if !self.registry.add(conn.clone()) {
            warn!(conn = %conn.id(), "connection id already registered");
        }
        info!(conn = %conn.id(), path = %request.path, "connection opened");

        if let Some(handler) = self.on_connection.as_mut() {
            handler(&conn);
        }

        if !head.is_empty() {
            let outcome = self.dispatch(&conn, head);
            debug!(conn = %conn.id(), bytes = head.len(), ?outcome, "dispatched pre-read bytes");
        }

        Ok(conn)
    }

    /// Decode the first frame in `chunk` and act on it.
    pub fn handle_data(&self, id: &ConnectionId, chunk: &[u8]) -> Dispatch {
        let Some(conn) = self.registry.get(id) else {
            debug!(conn = %id, bytes = chunk.len(), "data for unknown connection");
            return Dispatch::Unknown;
        };

        if !self.options.benchmarks {
            return self.dispatch(&conn, chunk);
        }

        let start = Instant::now();
        let outcome = self.dispatch(&conn, chunk);
        info!(
            target: "arachne_ws::bench",
            conn = %id,
            bytes = chunk.len(),
            elapsed = ?start.elapsed(),
            "handle_data"
        );
        outcome
    }

    /// The transport underneath `id` closed. Returns `false` if the
    /// connection was already torn down.
    pub fn handle_close(&self, id: &ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(conn) => self.teardown(&conn, false),
            None => false,
        }
    }

    /// End every open connection, as on host shutdown. Returns how many were
    /// torn down.
    pub fn close_all(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|conn| self.teardown(conn, true))
            .count()
    }

    fn dispatch(&self, conn: &Arc<Connection>, chunk: &[u8]) -> Dispatch {
        let (frame, consumed) = match frame::decode_frame(chunk, self.options.max_message_size) {
            Ok(decoded) => decoded,
            Err(e) => return self.drop_connection(conn, e),
        };
        if consumed < chunk.len() {
            debug!(
                conn = %conn.id(),
                trailing = chunk.len() - consumed,
                "ignoring bytes after first frame"
            );
        }
        if self.options.require_masked && !frame.masked {
            return self.drop_connection(conn, FrameError::Unmasked);
        }

        match frame.opcode {
            Opcode::Text => match frame.into_text() {
                Ok(text) => {
                    debug!(conn = %conn.id(), len = text.len(), "text frame");
                    conn.emit_message(&text);
                    Dispatch::Message
                }
                Err(e) => self.drop_connection(conn, e),
            },
            Opcode::Close => {
                debug!(conn = %conn.id(), "close frame");
                self.teardown(conn, true);
                Dispatch::Closed
            }
            other => {
                debug!(
                    conn = %conn.id(),
                    opcode = ?other,
                    control = other.is_control(),
                    "ignoring frame"
                );
                Dispatch::Ignored(other)
            }
        }
    }

    fn drop_connection(&self, conn: &Arc<Connection>, error: FrameError) -> Dispatch {
        warn!(conn = %conn.id(), error = %error, "protocol error, dropping connection");
        self.teardown(conn, true);
        Dispatch::Dropped(error)
    }

    /// Deregister, mark closed, optionally end the stream, then fire
    /// `on_close`. Only the first call for a connection does anything.
    fn teardown(&self, conn: &Arc<Connection>, end_stream: bool) -> bool {
        if self.registry.remove(conn.id()).is_none() {
            return false;
        }
        conn.mark_closed();
        if end_stream {
            if let Err(e) = conn.end() {
                debug!(conn = %conn.id(), error = %e, "failed to end transport");
            }
        }
        info!(conn = %conn.id(), "connection closed");
        conn.emit_close();
        // Handlers may hold their own connection; dropping them breaks the cycle.
        conn.clear_handlers();
        true
    }
}

//! Arachne WebSocket protocol engine (RFC 6455).
//!
//! A from-scratch WebSocket server core: no WebSocket library is involved,
//! only the wire protocol as described by RFC 6455.
//!
//! ## Modules
//!
//! - [`frame`]: Frame codec -- header parsing, XOR masking, text frame encoding
//! - [`handshake`]: HTTP upgrade negotiation and `Sec-WebSocket-Accept`
//! - [`connection`]: One established peer with its callback slots
//! - [`registry`]: The set of live connections backing broadcast
//! - [`server`]: Orchestration -- upgrade, dispatch, teardown
//! - [`transport`]: The byte-stream boundary (`TcpStream`, in-memory)
//! - [`host`]: TCP host with a reader thread per socket
//! - [`config`]: Server options loaded from TOML
//! - [`warmup`]: Decoder warm-up before real traffic
//!
//! ## Threading
//!
//! The [`Server`] is driven by a single thread. The TCP host bridges its
//! per-socket reader threads into that thread over a channel, so every
//! callback runs on the thread that owns the server.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod host;
pub mod registry;
pub mod server;
pub mod transport;
pub mod warmup;

pub use config::{LogLevel, Options};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{ConfigError, FrameError, HandshakeError, WsError, WsResult};
pub use frame::{Frame, Opcode};
pub use handshake::UpgradeRequest;
pub use host::{HostHandle, TcpHost};
pub use registry::ConnectionRegistry;
pub use server::{Dispatch, Server};
pub use transport::{MemoryTransport, Transport};

//! TCP host: sockets in, server events out.
//!
//! ```text
//! accept thread ── per socket ──> reader thread (blocking reads)
//!                                      |  HostEvent::{Upgrade, Data, Closed}
//!                                      v
//!                          crossbeam channel (bounded, FIFO)
//!                                      |
//!                                      v
//!                         event loop thread (owns the Server)
//! ```
//!
//! Reader threads parse the HTTP request head, then read one complete frame
//! at a time and forward it as a `Data` event. Every `Server` call, and so
//! every application callback, runs on the event loop thread.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::connection::ConnectionId;
use crate::error::WsError;
use crate::frame;
use crate::handshake::{self, UpgradeRequest, BAD_REQUEST_RESPONSE};
use crate::server::{Dispatch, Server};
use crate::transport::Transport;

/// How long a fresh socket may take to send its request head.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Events in flight between reader threads and the event loop. Readers
/// block once it is full, which leaves further frames in the kernel buffers
/// and lets TCP flow control push back on the peers.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Host-local socket number, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SocketId(u64);

enum HostEvent {
    Upgrade {
        socket: SocketId,
        request: UpgradeRequest,
        stream: TcpStream,
    },
    Data {
        socket: SocketId,
        bytes: Vec<u8>,
    },
    Closed {
        socket: SocketId,
    },
    Shutdown,
}

pub struct TcpHost {
    listener: TcpListener,
}

impl TcpHost {
    /// Bind the listening socket.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpHost> {
        let listener = TcpListener::bind(addr)?;
        Ok(TcpHost { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve on the current thread. Does not return unless accepting fails
    /// to start.
    pub fn run(self, server: Server) -> io::Result<()> {
        let (events, receiver) = bounded(EVENT_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let _acceptor = self.start_acceptor(&server, events, stop)?;
        event_loop(server, receiver);
        Ok(())
    }

    /// Serve on background threads.
    pub fn spawn(self, server: Server) -> io::Result<HostHandle> {
        let local_addr = self.local_addr()?;
        let (events, receiver) = bounded(EVENT_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let acceptor = self.start_acceptor(&server, events.clone(), stop.clone())?;
        let events_thread = thread::Builder::new()
            .name("arachne-events".to_string())
            .spawn(move || event_loop(server, receiver))?;

        Ok(HostHandle {
            local_addr,
            stop,
            events,
            acceptor: Some(acceptor),
            event_loop: Some(events_thread),
        })
    }

    fn start_acceptor(
        self,
        server: &Server,
        events: Sender<HostEvent>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        let max_payload = server.options().max_message_size;
        let addr = self.listener.local_addr()?;
        info!(%addr, "listening");
        thread::Builder::new()
            .name("arachne-accept".to_string())
            .spawn(move || accept_loop(self.listener, events, stop, max_payload))
    }
}

/// Control handle for a host started with [`TcpHost::spawn`].
pub struct HostHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    events: Sender<HostEvent>,
    acceptor: Option<JoinHandle<()>>,
    event_loop: Option<JoinHandle<()>>,
}

impl HostHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, end every open connection and wait for the host
    /// threads to finish.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.events.send(HostEvent::Shutdown).is_err() {
            debug!("event loop already stopped");
        }
        // Wake the acceptor out of its blocking accept().
        if let Err(e) = TcpStream::connect(self.local_addr) {
            debug!(error = %e, "self-connect during shutdown failed");
        }

        for handle in [self.acceptor.take(), self.event_loop.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("host thread panicked");
            }
        }
        info!(addr = %self.local_addr, "host stopped");
    }
}

fn accept_loop(
    listener: TcpListener,
    events: Sender<HostEvent>,
    stop: Arc<AtomicBool>,
    max_payload: u64,
) {
    let mut next_socket = 0u64;
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        next_socket += 1;
        let socket = SocketId(next_socket);
        let events = events.clone();
        let spawned = thread::Builder::new()
            .name(format!("arachne-reader-{}", socket.0))
            .spawn(move || reader_loop(socket, stream, events, max_payload));
        if let Err(e) = spawned {
            warn!(socket = socket.0, error = %e, "failed to spawn reader thread");
        }
    }
    debug!("accept loop stopped");
}

/// Read the upgrade request, then forward one frame per `Data` event until
/// the stream ends.
fn reader_loop(socket: SocketId, stream: TcpStream, events: Sender<HostEvent>, max_payload: u64) {
    let mut write_half = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            warn!(socket = socket.0, error = %e, "stream clone failed");
            return;
        }
    };
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
    let mut reader = BufReader::new(stream);

    let request = match handshake::read_request(&mut reader) {
        Ok(request) => request,
        Err(e) => {
            debug!(socket = socket.0, error = %e, "unreadable upgrade request");
            if let Err(io) = write_half.write_bytes(BAD_REQUEST_RESPONSE) {
                debug!(socket = socket.0, error = %io, "failed to write 400 response");
            }
            if let Err(io) = write_half.end() {
                debug!(socket = socket.0, error = %io, "failed to end rejected socket");
            }
            return;
        }
    };
    reader.get_ref().set_read_timeout(None).ok();

    let upgrade = HostEvent::Upgrade {
        socket,
        request,
        stream: write_half,
    };
    if events.send(upgrade).is_err() {
        return;
    }

    loop {
        match frame::read_frame_bytes(&mut reader, max_payload) {
            Ok(bytes) => {
                if events.send(HostEvent::Data { socket, bytes }).is_err() {
                    return;
                }
            }
            Err(WsError::Frame(e)) => {
                // A bad header leaves no way to find the next frame boundary.
                warn!(socket = socket.0, error = %e, "unreadable frame, closing socket");
                if let Err(io) = reader.get_mut().end() {
                    debug!(socket = socket.0, error = %io, "failed to end socket");
                }
                break;
            }
            Err(e) => {
                debug!(socket = socket.0, error = %e, "reader stopped");
                break;
            }
        }
    }
    if events.send(HostEvent::Closed { socket }).is_err() {
        debug!(socket = socket.0, "event loop gone before close was reported");
    }
}

fn event_loop(mut server: Server, events: Receiver<HostEvent>) {
    let mut sockets: FxHashMap<SocketId, ConnectionId> = FxHashMap::default();

    for event in events.iter() {
        match event {
            HostEvent::Upgrade {
                socket,
                request,
                stream,
            } => match server.handle_upgrade(&request, Box::new(stream), &[]) {
                Ok(conn) => {
                    sockets.insert(socket, conn.id().clone());
                }
                Err(e) => debug!(socket = socket.0, error = %e, "upgrade failed"),
            },
            HostEvent::Data { socket, bytes } => {
                let Some(id) = sockets.get(&socket) else {
                    continue;
                };
                match server.handle_data(id, &bytes) {
                    Dispatch::Closed | Dispatch::Dropped(_) | Dispatch::Unknown => {
                        sockets.remove(&socket);
                    }
                    Dispatch::Message | Dispatch::Ignored(_) => {}
                }
            }
            HostEvent::Closed { socket } => {
                if let Some(id) = sockets.remove(&socket) {
                    server.handle_close(&id);
                }
            }
            HostEvent::Shutdown => {
                debug!(open = ?server.connections().ids(), "shutdown requested");
                break;
            }
        }
    }

    let closed = server.close_all();
    debug!(closed, "event loop stopped");
}

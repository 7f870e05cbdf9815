//! The byte-stream boundary between the engine and whatever carries bytes.
//!
//! A [`Connection`](crate::Connection) writes frames through a
//! [`Transport`] and asks it to end, but never owns the socket's lifecycle:
//! the host decides when reads stop.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;

/// Write half of an upgraded stream.
pub trait Transport: Send {
    /// Write all of `bytes` to the peer.
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Stop the stream in both directions. Ending twice is not an error.
    fn end(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }

    fn end(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_bytes(bytes)
    }

    fn end(&mut self) -> io::Result<()> {
        (**self).end()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    written: Vec<u8>,
    writes: usize,
    ended: bool,
    fail_writes: bool,
}

/// In-memory transport whose clones share one buffer.
///
/// Hand one clone to the server and keep another to inspect what was
/// written. Writes after [`end`](Transport::end) fail with `BrokenPipe`.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Drain the written bytes.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// Number of successful `write_bytes` calls.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// Make every following write fail, as a reset socket would.
    pub fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }
}

impl Transport for MemoryTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.ended || state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory transport closed",
            ));
        }
        state.written.extend_from_slice(bytes);
        state.writes += 1;
        Ok(())
    }

    fn end(&mut self) -> io::Result<()> {
        self.state.lock().ended = true;
        Ok(())
    }
}

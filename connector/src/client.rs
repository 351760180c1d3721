use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::framing::LineBuffer;

/// Highest id a directly connected client can have. Anything above it is a
/// composite id addressing a sub-client behind a passthrough connection.
pub const SUBCLIENT_MASK: i64 = 0xffff_ffff;

/// Build the composite id for a sub-client hosted by `passthrough_id`.
pub fn compose(passthrough_id: i64, subclient_id: i64) -> i64 {
    (passthrough_id << 32) | (subclient_id & SUBCLIENT_MASK)
}

/// Whether an id addresses a passthrough sub-client rather than a local
/// connection.
pub fn is_composite(id: i64) -> bool {
    id > SUBCLIENT_MASK
}

/// The local passthrough connection hosting a composite id.
pub fn parent_id(id: i64) -> i64 {
    id >> 32
}

/// The remote half of a composite id, as the passthrough peer knows it.
pub fn subclient_id(id: i64) -> i64 {
    id & SUBCLIENT_MASK
}

/// One connected client.
///
/// Shared ownership carries the lifetime: the registry table, the reader
/// task and every queued send job each hold an `Arc<Client>`. The socket
/// stays open while any of them does and is closed exactly once, by the
/// registry reaper, after the record has been invalidated and the last
/// outside reference dropped.
pub struct Client {
    id: i64,
    server: usize,
    peer_addr: SocketAddr,
    address: String,
    stream: TcpStream,
    passthrough: AtomicBool,
    invalid: AtomicBool,
    shutdown: Notify,
    inbuf: Mutex<LineBuffer>,
}

impl Client {
    pub(crate) fn new(
        id: i64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        server: usize,
        inbuf: LineBuffer,
    ) -> Self {
        Self {
            id,
            server,
            peer_addr,
            address: peer_addr.ip().to_string(),
            stream,
            passthrough: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            shutdown: Notify::new(),
            inbuf: Mutex::new(inbuf),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Index of the listening socket this client arrived on.
    pub fn server(&self) -> usize {
        self.server
    }

    /// Printable peer address, without the port.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Acquire)
    }

    pub(crate) fn set_passthrough(&self) {
        self.passthrough.store(true, Ordering::Release);
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Flip the record to invalid. Returns true on the transition, false if
    /// it was already invalid, making invalidation idempotent.
    pub(crate) fn mark_invalid(&self) -> bool {
        !self.invalid.swap(true, Ordering::AcqRel)
    }

    /// Wake the reader task so it releases its reference promptly.
    pub(crate) fn notify_closed(&self) {
        self.shutdown.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.shutdown.notified().await;
    }

    pub(crate) fn inbuf(&self) -> MutexGuard<'_, LineBuffer> {
        self.inbuf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn into_parts(self) -> (TcpStream, LineBuffer) {
        let inbuf = self
            .inbuf
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        (self.stream, inbuf)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("fd", &self.raw_fd())
            .field("server", &self.server)
            .field("address", &self.address)
            .field("passthrough", &self.is_passthrough())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::client::Client;
use crate::framing::{LineBuffer, INBUF_SIZE};

/// Process-wide client table.
///
/// Live clients are looked up by id. Invalidated clients leave the table at
/// once but park on the retired list until every outstanding reference
/// (reader task, queued send jobs) has been dropped; only then does `reap`
/// close the socket. Closing earlier would let the kernel hand the same fd
/// number to a new connection while stale references still point at it.
pub(crate) struct Registry {
    clients: DashMap<i64, Arc<Client>>,
    retired: Mutex<Vec<Arc<Client>>>,
    recycled: Mutex<Vec<Box<[u8; INBUF_SIZE]>>>,
    next_id: AtomicI64,
    clients_generated: AtomicU64,
    retired_generated: AtomicU64,
    max_clients: usize,
}

impl Registry {
    /// `first_id` must sit above the listener indices so ids never collide
    /// with them; `max_clients == 0` means unlimited.
    pub(crate) fn new(first_id: i64, max_clients: usize) -> Self {
        Self {
            clients: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            recycled: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(first_id),
            clients_generated: AtomicU64::new(0),
            retired_generated: AtomicU64::new(0),
            max_clients,
        }
    }

    /// Hand out a line buffer for a new connection, reusing a recycled
    /// allocation when one is available.
    pub(crate) fn recruit(&self) -> LineBuffer {
        let recycled = self
            .recycled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(buf) => {
                debug!("connector recycled a client buffer");
                LineBuffer::from_recycled(buf)
            }
            None => {
                self.clients_generated.fetch_add(1, Ordering::Relaxed);
                LineBuffer::new()
            }
        }
    }

    /// Create the record for an accepted connection and make it reachable
    /// by its freshly assigned id.
    pub(crate) fn insert(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        server: usize,
        inbuf: LineBuffer,
    ) -> Arc<Client> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client::new(id, stream, peer_addr, server, inbuf));
        self.clients.insert(id, Arc::clone(&client));
        client
    }

    /// Look up a live client, taking a reference. Invalid records are never
    /// returned, even in the window before they leave the table.
    pub(crate) fn ref_by_id(&self, id: i64) -> Option<Arc<Client>> {
        let client = self.clients.get(&id).map(|entry| Arc::clone(&entry))?;
        if client.is_invalid() {
            return None;
        }
        Some(client)
    }

    pub(crate) fn count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.max_clients != 0 && self.clients.len() >= self.max_clients
    }

    /// Retire a client: unreachable by id immediately, socket closed later
    /// by `reap` once references drain. Idempotent; returns true only on the
    /// transition.
    pub(crate) fn invalidate(&self, client: &Arc<Client>) -> bool {
        if !client.mark_invalid() {
            return false;
        }
        self.clients.remove(&client.id());
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(client));
        self.retired_generated.fetch_add(1, Ordering::Relaxed);
        // Drop the reader out of its readiness wait so the registration
        // reference goes away without needing socket activity.
        client.notify_closed();
        true
    }

    /// Close and recycle every retired client with no references left.
    pub(crate) fn reap(&self) {
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        let mut kept = Vec::with_capacity(retired.len());
        for client in retired.drain(..) {
            match Arc::try_unwrap(client) {
                Ok(client) => self.dispose(client),
                Err(client) => kept.push(client),
            }
        }
        *retired = kept;
    }

    /// Last owner: disable lingering, close the socket, pocket the buffer.
    fn dispose(&self, client: Client) {
        info!("connector recycling client {}", client.id());
        let (stream, inbuf) = client.into_parts();
        let sock = SockRef::from(&stream);
        if let Err(e) = sock.set_linger(Some(Duration::ZERO)) {
            debug!("failed to clear linger on fd {}: {}", stream.as_raw_fd(), e);
        }
        drop(stream);
        self.recycled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(inbuf.into_inner());
    }

    pub(crate) fn clients_generated(&self) -> u64 {
        self.clients_generated.load(Ordering::Relaxed)
    }

    pub(crate) fn retired_generated(&self) -> u64 {
        self.retired_generated.load(Ordering::Relaxed)
    }

    pub(crate) fn retired_count(&self) -> usize {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    fn recycled_count(&self) -> usize {
        self.recycled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Returns the inserted client plus the far end of its connection,
    /// which the caller keeps alive for the duration of the test.
    async fn insert_one(registry: &Registry, listener: &TcpListener) -> (Arc<Client>, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, outbound) = tokio::join!(listener.accept(), connect);
        let (stream, peer) = accepted.unwrap();
        let inbuf = registry.recruit();
        (registry.insert(stream, peer, 0, inbuf), outbound.unwrap())
    }

    #[tokio::test]
    async fn ids_start_above_the_listener_range() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new(2, 0);

        let (a, _far_a) = insert_one(&registry, &listener).await;
        let (b, _far_b) = insert_one(&registry, &listener).await;
        assert_eq!(a.id(), 2);
        assert_eq!(b.id(), 3);
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn ref_by_id_skips_invalid_records() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new(1, 0);

        let (client, _far) = insert_one(&registry, &listener).await;
        let id = client.id();
        assert!(registry.ref_by_id(id).is_some());

        assert!(registry.invalidate(&client));
        assert!(registry.ref_by_id(id).is_none());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.retired_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new(1, 0);

        let (client, _far) = insert_one(&registry, &listener).await;
        assert!(registry.invalidate(&client));
        assert!(!registry.invalidate(&client));
        assert_eq!(registry.retired_generated(), 1);
        assert_eq!(registry.retired_count(), 1);
    }

    #[tokio::test]
    async fn reap_waits_for_outstanding_references() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new(1, 0);

        let (client, _far) = insert_one(&registry, &listener).await;
        let extra = registry.ref_by_id(client.id()).unwrap();

        registry.invalidate(&client);
        drop(client);

        // The send-job style reference keeps the record alive.
        registry.reap();
        assert_eq!(registry.retired_count(), 1);

        drop(extra);
        registry.reap();
        assert_eq!(registry.retired_count(), 0);
        assert_eq!(registry.recycled_count(), 1);
    }

    #[tokio::test]
    async fn recruit_reuses_reaped_buffers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new(1, 0);

        let (client, _far) = insert_one(&registry, &listener).await;
        assert_eq!(registry.clients_generated(), 1);

        registry.invalidate(&client);
        drop(client);
        registry.reap();

        // The next connection reuses the buffer without a fresh allocation.
        let (_client, _far2) = insert_one(&registry, &listener).await;
        assert_eq!(registry.clients_generated(), 1);
        assert_eq!(registry.recycled_count(), 0);
    }

    #[tokio::test]
    async fn full_registry_declines_after_the_cap() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new(1, 2);

        assert!(!registry.is_full());
        let (_a, _far_a) = insert_one(&registry, &listener).await;
        let (_b, _far_b) = insert_one(&registry, &listener).await;
        assert!(registry.is_full());
    }
}

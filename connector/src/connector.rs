use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use socket2::{Domain, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::{error, info, warn};

use crate::client::{self, Client};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::framing::INBUF_SIZE;
use crate::peers::Peers;
use crate::receiver;
use crate::registry::Registry;
use crate::sender::{self, Sender};

/// Larger than SOMAXCONN on stock kernels; the kernel clamps it down when
/// the system is configured lower.
const LISTEN_BACKLOG: i32 = 8192;

const BIND_ATTEMPTS: u32 = 25;
const BIND_RETRY: Duration = Duration::from_secs(5);

/// Everything the connection front-end owns: the listening sockets, the
/// client registry, the outbound sender and the peer sinks. One value per
/// process in production; tests build as many as they like.
pub struct Connector {
    config: Arc<Config>,
    // Raw listeners under readiness notification rather than tokio's own
    // accept future: the acceptor must be able to observe a pending
    // connection and still decline to take it while the gate is closed or
    // the registry is full.
    listeners: Vec<AsyncFd<std::net::TcpListener>>,
    listener_fds: Vec<RawFd>,
    registry: Registry,
    sender: Sender,
    peers: Peers,
    accepting: AtomicBool,
    shutdown: AtomicBool,
    start_time: Instant,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("listener_fds", &self.listener_fds)
            .field("accepting", &self.accepting)
            .field("shutdown", &self.shutdown)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl Connector {
    /// Bind the configured listening sockets and assemble the connector.
    /// Connections are not accepted until the accept gate opens.
    pub async fn bind(config: Arc<Config>, peers: Peers) -> Result<Arc<Self>> {
        Self::bind_with_handoff(config, peers, Vec::new()).await
    }

    /// Like [`bind`](Self::bind), reusing sockets handed over by the
    /// supervisor across a hot restart. A handed-over socket whose bound
    /// address no longer matches the configuration is closed and rebound.
    pub async fn bind_with_handoff(
        config: Arc<Config>,
        peers: Peers,
        handoff: Vec<std::net::TcpListener>,
    ) -> Result<Arc<Self>> {
        let urls = config.listen_urls();
        let mut inherited = handoff.into_iter();
        let mut listeners = Vec::with_capacity(urls.len());
        let mut tries = 0u32;

        for url in &urls {
            let addr = resolve(url)?;

            if let Some(old) = inherited.next() {
                match old.local_addr() {
                    Ok(old_addr) if old_addr == addr => {
                        old.set_nonblocking(true)?;
                        info!("reusing handed over socket bound to {}", old_addr);
                        listeners.push(AsyncFd::new(old)?);
                        continue;
                    }
                    Ok(old_addr) => {
                        warn!(
                            "handed over socket {} does not match configured {}, creating new socket",
                            old_addr, addr
                        );
                    }
                    Err(e) => {
                        warn!("handed over socket unusable: {}", e);
                    }
                }
            }

            let listener = loop {
                match bind_listener(addr) {
                    Ok(listener) => break AsyncFd::new(listener)?,
                    Err(e) => {
                        tries += 1;
                        if tries >= BIND_ATTEMPTS {
                            error!("connector failed to bind to {}: {}", url, e);
                            return Err(Error::Bind {
                                url: url.clone(),
                                source: e,
                            });
                        }
                        warn!("connector failed to bind to {}, retrying in 5s: {}", url, e);
                        tokio::time::sleep(BIND_RETRY).await;
                    }
                }
            };
            listeners.push(listener);
        }

        if tries > 0 {
            info!("connector successfully bound to socket");
        }

        let listener_fds = listeners.iter().map(|l| l.get_ref().as_raw_fd()).collect();
        // Client ids start above the listener indices so the two id spaces
        // never overlap.
        let registry = Registry::new(listeners.len() as i64, config.server.max_clients);

        Ok(Arc::new(Self {
            registry,
            sender: Sender::new(),
            listener_fds,
            listeners,
            peers,
            config,
            accepting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            start_time: Instant::now(),
        }))
    }

    /// Spawn the accept loops and the sender task.
    pub fn spawn_io(self: &Arc<Self>) {
        for server in 0..self.listeners.len() {
            tokio::spawn(receiver::run_acceptor(Arc::clone(self), server));
        }
        tokio::spawn(sender::run(Arc::clone(self)));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.get_ref().local_addr().ok())
            .collect()
    }

    pub(crate) fn listener(&self, server: usize) -> &AsyncFd<std::net::TcpListener> {
        &self.listeners[server]
    }

    pub(crate) fn listener_fd(&self, server: usize) -> Option<RawFd> {
        self.listener_fds.get(server).copied()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether new connections are currently admitted.
    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Open or close the accept gate. Existing connections are unaffected.
    pub fn set_accepting(&self, accept: bool) {
        self.accepting.store(accept, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ask the long-lived tasks to wind down. Cooperative; in production
    /// the supervisor tears the process down shortly after.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Retire a client and tell the peers, exactly once per client. Safe to
    /// call from any task, any number of times.
    pub(crate) async fn drop_client(&self, client: &Arc<Client>) -> bool {
        let transitioned = self.registry.invalidate(client);
        if transitioned {
            metrics::counter!("connector_clients_dropped_total").increment(1);
            info!(
                "connector dropped client {} fd {}",
                client.id(),
                client.raw_fd()
            );
            self.peers.drop_client(self.config.passthrough, client).await;
        }
        self.registry.reap();
        transitioned
    }

    pub(crate) async fn forward_upstream(&self, line: &str) {
        self.peers.forward(self.config.passthrough, line).await;
    }

    /// Queue a buffer for delivery to a client id, resolving composite
    /// passthrough ids to their hosting connection. Stale ids are reported
    /// back to the stratifier and the buffer is discarded.
    pub async fn send_client(&self, id: i64, buf: Vec<u8>) {
        let target = if client::is_composite(id) {
            let parent = client::parent_id(id);
            match self.registry.ref_by_id(parent) {
                Some(parent) => parent,
                None => {
                    info!(
                        "connector failed to find passthrough {} of client {} to send to",
                        parent,
                        client::subclient_id(id)
                    );
                    // The passthrough is gone. If its sub-client id names a
                    // local connection, retire that; otherwise the
                    // stratifier needs to forget the whole composite id.
                    match self.registry.ref_by_id(client::subclient_id(id)) {
                        Some(sub) => {
                            self.drop_client(&sub).await;
                        }
                        None => self.peers.drop_id(id).await,
                    }
                    return;
                }
            }
        } else {
            match self.registry.ref_by_id(id) {
                Some(client) => client,
                None => {
                    info!("connector failed to find client {} to send to", id);
                    self.peers.drop_id(id).await;
                    return;
                }
            }
        };

        self.sender.enqueue(target, buf);
    }

    /// Mark a connection as a passthrough aggregator and confirm to it.
    pub(crate) async fn promote_passthrough(&self, client: &Arc<Client>) {
        info!("connector adding passthrough client {}", client.id());
        client.set_passthrough();
        self.send_client(client.id(), b"{\"result\": true}\n".to_vec())
            .await;
    }

    /// Build the stats report. `runtime` is only carried by the periodic
    /// passthrough log line.
    pub fn stats(&self, runtime: Option<u64>) -> Value {
        let record = std::mem::size_of::<Client>() + INBUF_SIZE;
        let mut root = Map::new();

        if let Some(runtime) = runtime {
            root.insert("runtime".into(), json!(runtime));
        }

        let count = self.registry.count();
        root.insert(
            "clients".into(),
            json!({
                "count": count,
                "memory": count * record,
                "generated": self.registry.clients_generated(),
            }),
        );

        let dead = self.registry.retired_count();
        root.insert(
            "dead".into(),
            json!({
                "count": dead,
                "memory": dead * record,
                "generated": self.registry.retired_generated(),
            }),
        );

        let (pending, memory) = self.sender.intake_snapshot();
        root.insert(
            "sends".into(),
            json!({
                "count": pending,
                "memory": memory,
                "generated": self.sender.generated(),
            }),
        );

        root.insert(
            "delays".into(),
            json!({
                "count": self.sender.queued(),
                "memory": self.sender.size(),
                "generated": self.sender.delayed(),
            }),
        );

        Value::Object(root)
    }
}

fn resolve(url: &str) -> Result<SocketAddr> {
    url.to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve listen url {url}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("listen url {url} resolves to no address")))
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::client::{compose, Client};
use crate::connector::Connector;
use crate::error::Error;

/// How long a full registry backs off before probing the listener again.
const FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on one readiness wait, so gate and shutdown changes are
/// noticed even on an idle listener.
const POLL_PERIOD: Duration = Duration::from_secs(1);

enum ReadOutcome {
    Data,
    Blocked,
    Eof,
    Error(std::io::Error),
}

/// Accept loop for one listening socket.
///
/// Readiness and accepting are deliberately separate steps: a pending
/// connection observed while the gate is closed or the registry is full is
/// left in the kernel backlog rather than taken and thrown away. Existing
/// connections keep being serviced by their reader tasks throughout.
pub(crate) async fn run_acceptor(connector: Arc<Connector>, server: usize) {
    while !connector.accepting() {
        if connector.shutdown_requested() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    loop {
        if connector.shutdown_requested() {
            return;
        }
        if !connector.accepting() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }
        if connector.registry().is_full() {
            warn!("server full with {} clients", connector.registry().count());
            tokio::time::sleep(FULL_BACKOFF).await;
            continue;
        }

        let listener = connector.listener(server);
        let mut guard =
            match tokio::time::timeout(POLL_PERIOD, listener.readable()).await {
                // Periodic wakeup to re-check the gate and shutdown flag.
                Err(_) => continue,
                Ok(Ok(guard)) => guard,
                Ok(Err(e)) => {
                    error!("listener {} readiness failed: {}", server, e);
                    connector.begin_shutdown();
                    return;
                }
            };
        // The gate may have closed while we waited; the connection stays in
        // the backlog for whoever opens it again.
        if !connector.accepting() {
            continue;
        }

        match guard.try_io(|listener| listener.get_ref().accept()) {
            Ok(Ok((stream, peer_addr))) => {
                accept_client(&connector, stream, peer_addr, server);
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionAborted => {
                debug!("recoverable error accepting on server {}: {}", server, e);
            }
            Ok(Err(e)) => {
                error!("failed to accept on server {}: {}", server, e);
                connector.begin_shutdown();
                return;
            }
            // Raced another wakeup for the same readiness; go around.
            Err(_would_block) => continue,
        }
    }
}

fn accept_client(
    connector: &Arc<Connector>,
    stream: std::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    server: usize,
) {
    let sock = SockRef::from(&stream);
    if let Err(e) = sock.set_keepalive(true) {
        debug!("failed to set keepalive for {}: {}", peer_addr, e);
    }
    if let Err(e) = stream.set_nonblocking(true) {
        warn!("failed to unblock socket for {}: {}", peer_addr, e);
        return;
    }
    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to register socket for {}: {}", peer_addr, e);
            return;
        }
    };

    let inbuf = connector.registry().recruit();
    let client = connector.registry().insert(stream, peer_addr, server, inbuf);

    metrics::counter!("connector_clients_connected_total").increment(1);
    info!(
        "connected new client {} fd {} to {} active clients from {}",
        client.id(),
        client.raw_fd(),
        connector.registry().count(),
        peer_addr
    );

    // The spawned task's clone of the client is its registration with the
    // readiness machinery; dropping it on exit is what lets the record be
    // reaped.
    let connector = Arc::clone(connector);
    tokio::spawn(read_loop(connector, client));
}

/// Per-client reader. Waits for readiness, drains whole lines and retires
/// the client on EOF, error readiness or its shutdown notice.
async fn read_loop(connector: Arc<Connector>, client: Arc<Client>) {
    loop {
        if client.is_invalid() {
            break;
        }
        tokio::select! {
            _ = client.closed() => break,
            ready = client.stream().ready(Interest::READABLE | Interest::ERROR) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        info!("client {} fd {} readiness failed: {}", client.id(), client.raw_fd(), e);
                        connector.drop_client(&client).await;
                        break;
                    }
                };
                if ready.is_readable() {
                    drain_client(&connector, &client).await;
                }
                if client.is_invalid() {
                    break;
                }
                if ready.is_error() {
                    let sock_err = SockRef::from(client.stream()).take_error().ok().flatten();
                    match sock_err {
                        Some(e) if e.raw_os_error() == Some(libc::ECONNRESET) => {
                            info!("client {} fd {} reset by peer", client.id(), client.raw_fd());
                        }
                        Some(e) => {
                            warn!("client {} fd {} socket error: {}", client.id(), client.raw_fd(), e);
                        }
                        None => {
                            warn!("client {} fd {} socket error", client.id(), client.raw_fd());
                        }
                    }
                    connector.drop_client(&client).await;
                    break;
                }
                if ready.is_read_closed() {
                    info!("client {} fd {} hung up", client.id(), client.raw_fd());
                    connector.drop_client(&client).await;
                    break;
                }
            }
        }
    }

    drop(client);
    // The registration reference is gone; anything retired and unreferenced
    // can be closed now.
    connector.registry().reap();
}

/// Drain everything the socket has for us, one non-blocking read at a time,
/// handing each complete line to the parser before reading again.
async fn drain_client(connector: &Arc<Connector>, client: &Arc<Client>) {
    loop {
        let outcome = {
            let mut inbuf = client.inbuf();
            match client.stream().try_read(inbuf.space()) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    inbuf.advance(n);
                    ReadOutcome::Data
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => ReadOutcome::Blocked,
                Err(e) => ReadOutcome::Error(e),
            }
        };

        match outcome {
            ReadOutcome::Data => {}
            ReadOutcome::Blocked => return,
            ReadOutcome::Eof => {
                info!("client {} fd {} disconnected", client.id(), client.raw_fd());
                connector.drop_client(client).await;
                return;
            }
            ReadOutcome::Error(e) => {
                info!(
                    "client {} fd {} disconnected on read: {}",
                    client.id(),
                    client.raw_fd(),
                    e
                );
                connector.drop_client(client).await;
                return;
            }
        }

        loop {
            let line = { client.inbuf().next_line() };
            match line {
                Ok(Some(line)) => {
                    handle_line(connector, client, &line).await;
                    if client.is_invalid() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(Error::Oversize) => {
                    info!(
                        "client {} fd {} message oversize, disconnecting",
                        client.id(),
                        client.raw_fd()
                    );
                    connector.drop_client(client).await;
                    return;
                }
                Err(e) => {
                    warn!("client {} framing failure: {}", client.id(), e);
                    connector.drop_client(client).await;
                    return;
                }
            }
        }
    }
}

/// Parse one client line, stamp the routing fields on it and pass it
/// upstream.
async fn handle_line(connector: &Arc<Connector>, client: &Arc<Client>, line: &[u8]) {
    let mut val = match serde_json::from_slice::<Value>(line) {
        Ok(val @ Value::Object(_)) => val,
        _ => {
            info!(
                "client {} sent invalid json: {}",
                client.id(),
                String::from_utf8_lossy(line)
            );
            connector
                .send_client(client.id(), b"Invalid JSON, disconnecting\n".to_vec())
                .await;
            connector.drop_client(client).await;
            return;
        }
    };

    let obj = match val.as_object_mut() {
        Some(obj) => obj,
        None => return,
    };

    if client.is_passthrough() {
        // The wrapped message addresses a sub-client of this connection;
        // remap its id into the composite space.
        let subclient = obj.get("client_id").and_then(Value::as_i64).unwrap_or(0);
        obj.remove("client_id");
        obj.insert("client_id".into(), json!(compose(client.id(), subclient)));
    } else {
        obj.insert("client_id".into(), json!(client.id()));
        obj.insert("address".into(), json!(client.address()));
    }
    obj.insert("server".into(), json!(client.server()));

    metrics::counter!("connector_messages_received_total").increment(1);

    // Deliberately read without the registry: a message racing its own
    // disconnect may still go upstream, and the peer filters stale ids.
    if !client.is_invalid() {
        connector.forward_upstream(&val.to_string()).await;
    }
}

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use passfd::FdPassingExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::client;
use crate::connector::Connector;
use crate::logging;

/// Upper bound on one control frame. Commands are short; anything bigger
/// is a corrupt or hostile sender.
const MAX_CONTROL_MSG: usize = 0x1_0000;

/// Cadence of the stats log line emitted while running as a passthrough.
const STATS_PERIOD: Duration = Duration::from_secs(60);

/// A connected command sender gets this long to produce its frame before
/// the loop moves on; one stalled sender must not wedge the control path.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// What the control loop should do with the connection a command came in
/// on, once the command has been applied.
pub enum ControlAction {
    None,
    Reply(String),
    PassFd(RawFd),
    Shutdown,
}

/// Create the control endpoint, clearing any stale socket file first.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
}

/// Read one length-prefixed control frame.
pub async fn read_msg(stream: &mut UnixStream) -> io::Result<String> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_CONTROL_MSG {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control frame of {len} bytes"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one length-prefixed control frame.
pub async fn send_msg(stream: &mut UnixStream, msg: &str) -> io::Result<()> {
    let len = msg.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(msg.as_bytes()).await?;
    stream.flush().await
}

/// Pass a duplicate of `fd` to the peer on the other side of the control
/// connection. The local descriptor stays open; the receiver gets its own
/// handle to the same listener.
pub async fn send_fd(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    ancillary_io(stream, Interest::WRITABLE, |sock| sock.send_fd(fd)).await
}

/// Receive a file descriptor sent with [`send_fd`]. The caller owns the
/// returned descriptor.
pub async fn recv_fd(stream: &UnixStream) -> io::Result<RawFd> {
    ancillary_io(stream, Interest::READABLE, |sock| sock.recv_fd()).await
}

/// Drive one SCM_RIGHTS operation through the control stream's readiness.
/// The sendmsg/recvmsg calls bypass tokio's buffers, so readiness has to be
/// awaited and cleared by hand until the operation stops hitting
/// would-block.
async fn ancillary_io<R>(
    stream: &UnixStream,
    interest: Interest,
    mut op: impl FnMut(RawFd) -> io::Result<R>,
) -> io::Result<R> {
    loop {
        stream.ready(interest).await?;
        match stream.try_io(interest, || op(stream.as_raw_fd())) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

/// The control loop. One command per accepted connection; replies, when a
/// command has one, go back on the same connection. Runs until `shutdown`
/// arrives or the listener dies.
pub async fn run(connector: Arc<Connector>, listener: UnixListener) -> crate::Result<()> {
    info!("{} connector ready", connector.config().name);

    let mut stats_log =
        tokio::time::interval_at(tokio::time::Instant::now() + STATS_PERIOD, STATS_PERIOD);
    stats_log.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stats_log.tick(), if connector.config().passthrough => {
                let runtime = connector.uptime().as_secs();
                info!("Passthrough:{}", connector.stats(Some(runtime)));
            }
            accepted = listener.accept() => {
                let (mut stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("control accept failed: {}", e);
                        continue;
                    }
                };
                let msg = match tokio::time::timeout(RECV_TIMEOUT, read_msg(&mut stream)).await {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(e)) => {
                        warn!("unreadable control message: {}", e);
                        continue;
                    }
                    Err(_) => {
                        warn!("control sender timed out mid-message");
                        continue;
                    }
                };
                debug!("connector received message: {}", msg);
                match handle_command(&connector, msg.trim()).await {
                    ControlAction::None => {}
                    ControlAction::Reply(reply) => {
                        if let Err(e) = send_msg(&mut stream, &reply).await {
                            warn!("control reply failed: {}", e);
                        }
                    }
                    ControlAction::PassFd(fd) => {
                        if let Err(e) = send_fd(&stream, fd).await {
                            warn!("listener fd handoff failed: {}", e);
                        }
                    }
                    ControlAction::Shutdown => break,
                }
            }
        }
    }

    connector.begin_shutdown();
    Ok(())
}

/// Apply one control command. Split from the socket loop so tests can
/// drive commands directly.
pub async fn handle_command(connector: &Arc<Connector>, msg: &str) -> ControlAction {
    // The bulk of control traffic is json replies headed for clients.
    if msg.starts_with('{') {
        process_upstream_msg(connector, msg).await;
        return ControlAction::None;
    }

    if let Some(rest) = msg.strip_prefix("dropclient=") {
        let id = match rest.trim().parse::<i64>() {
            Ok(id) => id,
            Err(_) => {
                debug!("connector failed to parse dropclient command: {}", msg);
                return ControlAction::None;
            }
        };
        // A passthrough sub-client has no local connection to drop; the
        // physical link belongs to its parent.
        if client::is_composite(id) {
            return ControlAction::None;
        }
        match connector.registry().ref_by_id(id) {
            Some(target) => {
                if connector.drop_client(&target).await {
                    info!("connector dropped client id: {}", id);
                }
            }
            None => info!("connector failed to find client {} to drop", id),
        }
        return ControlAction::None;
    }

    if let Some(rest) = msg.strip_prefix("passthrough=") {
        let id = match rest.trim().parse::<i64>() {
            Ok(id) => id,
            Err(_) => {
                debug!("connector failed to parse passthrough command: {}", msg);
                return ControlAction::None;
            }
        };
        match connector.registry().ref_by_id(id) {
            Some(target) => connector.promote_passthrough(&target).await,
            None => info!("connector failed to find client {} to pass through", id),
        }
        return ControlAction::None;
    }

    if let Some(rest) = msg.strip_prefix("loglevel=") {
        match rest.trim().parse::<u8>() {
            Ok(level) => logging::set_level(level),
            Err(_) => debug!("connector failed to parse loglevel command: {}", msg),
        }
        return ControlAction::None;
    }

    if let Some(rest) = msg.strip_prefix("getxfd") {
        match rest.trim().parse::<usize>() {
            Ok(server) => match connector.listener_fd(server) {
                Some(fd) => return ControlAction::PassFd(fd),
                None => debug!("connector has no listener {} for getxfd", server),
            },
            Err(_) => debug!("connector failed to parse getxfd command: {}", msg),
        }
        return ControlAction::None;
    }

    match msg {
        "ping" => {
            debug!("connector received ping request");
            ControlAction::Reply("pong".into())
        }
        "accept" => {
            debug!("connector received accept signal");
            connector.set_accepting(true);
            ControlAction::None
        }
        "reject" => {
            debug!("connector received reject signal");
            connector.set_accepting(false);
            ControlAction::None
        }
        "stats" => {
            debug!("connector received stats request");
            ControlAction::Reply(connector.stats(None).to_string())
        }
        "shutdown" => ControlAction::Shutdown,
        _ => {
            warn!("unhandled connector message: {}", msg);
            ControlAction::None
        }
    }
}

/// A json line from the stratifier or generator, addressed to a client by
/// the `client_id` field. The field is stripped before delivery; a
/// composite id is folded back to the sub-client id the downstream
/// passthrough knows.
async fn process_upstream_msg(connector: &Arc<Connector>, msg: &str) {
    let mut val = match serde_json::from_str::<Value>(msg) {
        Ok(val @ Value::Object(_)) => val,
        _ => {
            warn!("invalid json message: {}", msg);
            return;
        }
    };
    let obj = match val.as_object_mut() {
        Some(obj) => obj,
        None => return,
    };

    let client_id = match obj.get("client_id").and_then(Value::as_i64) {
        Some(id) => id,
        None => {
            warn!("json message without client_id: {}", msg);
            return;
        }
    };
    obj.remove("client_id");
    if client::is_composite(client_id) {
        obj.insert(
            "client_id".into(),
            json!(client::subclient_id(client_id)),
        );
    }

    let mut line = val.to_string();
    line.push('\n');
    connector.send_client(client_id, line.into_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        send_msg(&mut a, "ping").await.unwrap();
        assert_eq!(read_msg(&mut b).await.unwrap(), "ping");

        let long = "x".repeat(4000);
        send_msg(&mut b, &long).await.unwrap();
        assert_eq!(read_msg(&mut a).await.unwrap(), long);
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let header = ((MAX_CONTROL_MSG + 1) as u32).to_be_bytes();
        a.write_all(&header).await.unwrap();
        let err = read_msg(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn fd_passing_duplicates_a_listener() {
        use std::os::fd::FromRawFd;

        let (a, b) = UnixStream::pair().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        send_fd(&a, listener.as_raw_fd()).await.unwrap();
        let received = recv_fd(&b).await.unwrap();

        let received = unsafe { std::net::TcpListener::from_raw_fd(received) };
        assert_eq!(received.local_addr().unwrap(), addr);
    }
}

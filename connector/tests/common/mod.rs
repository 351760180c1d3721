#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ingot_connector::control;
use ingot_connector::peers::{Peer, Peers};
use ingot_connector::{Config, Connector};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peer sink that hands every message to the test instead of a process
/// socket.
pub struct ChannelPeer {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Peer for ChannelPeer {
    async fn send(&self, msg: &str) -> std::io::Result<()> {
        let _ = self.tx.send(msg.to_string());
        Ok(())
    }
}

pub fn channel_peer() -> (Arc<ChannelPeer>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelPeer { tx }), rx)
}

/// A connector wired to channel peers, listening on an ephemeral port with
/// its control socket in a scratch directory.
pub struct Harness {
    pub connector: Arc<Connector>,
    pub addr: SocketAddr,
    pub control_path: PathBuf,
    pub stratifier: mpsc::UnboundedReceiver<String>,
    pub generator: mpsc::UnboundedReceiver<String>,
    pub control_task: JoinHandle<ingot_connector::Result<()>>,
}

pub async fn start(passthrough: bool) -> Harness {
    start_with(passthrough, true).await
}

pub async fn start_with(passthrough: bool, accept: bool) -> Harness {
    let harness = start_with_config(|config| {
        config.passthrough = passthrough;
    })
    .await;
    if accept {
        harness.connector.set_accepting(true);
    }
    harness
}

/// Start a connector with the test defaults, letting the caller adjust the
/// configuration first. The accept gate starts closed.
pub async fn start_with_config(customize: impl FnOnce(&mut Config)) -> Harness {
    static SCRATCH: AtomicU64 = AtomicU64::new(0);

    let mut config = Config::default();
    config.server.urls = vec!["127.0.0.1:0".to_string()];
    config.sockets.dir = std::env::temp_dir().join(format!(
        "ingot-test-{}-{}",
        std::process::id(),
        SCRATCH.fetch_add(1, Ordering::Relaxed)
    ));
    customize(&mut config);
    let config = Arc::new(config);

    let (stratifier, stratifier_rx) = channel_peer();
    let (generator, generator_rx) = channel_peer();
    let peers = Peers {
        stratifier,
        generator,
    };

    let connector = Connector::bind(Arc::clone(&config), peers)
        .await
        .expect("bind connector");
    connector.spawn_io();

    let control_path = config.sockets.control_path();
    let endpoint = control::bind(&control_path).expect("bind control socket");
    let control_task = tokio::spawn(control::run(Arc::clone(&connector), endpoint));

    Harness {
        addr: connector.local_addrs()[0],
        connector,
        control_path,
        stratifier: stratifier_rx,
        generator: generator_rx,
        control_task,
    }
}

/// Receive the next peer message, failing the test after a grace period.
pub async fn recv_msg(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a peer message")
        .expect("peer channel closed")
}

pub async fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let msg = recv_msg(rx).await;
    serde_json::from_str(&msg).expect("peer message is json")
}

/// Read one newline-terminated line off a client socket, terminator
/// stripped. Byte-at-a-time so nothing past the line is consumed.
pub async fn read_line(stream: &mut TcpStream) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.expect("read from client socket");
            assert!(n > 0, "connection closed while reading a line");
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).expect("client line is utf8")
    })
    .await
    .expect("timed out reading a line")
}

/// Wait for the far end to close or reset the connection.
pub async fn expect_disconnect(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("timed out waiting for disconnect");
    match result {
        Ok(0) => {}
        Ok(n) => panic!("expected a disconnect, read {n} bytes"),
        // An abortive close surfaces as a reset.
        Err(_) => {}
    }
}

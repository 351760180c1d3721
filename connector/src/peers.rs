use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::UnixDatagram;
use tracing::warn;

use crate::client::Client;
use crate::config::Config;

/// One-way sink to a peer process. Production peers are unix datagram
/// sockets; tests substitute channel-backed implementations.
#[async_trait]
pub trait Peer: Send + Sync {
    async fn send(&self, msg: &str) -> io::Result<()>;
}

/// Datagram sink to a peer process socket.
pub struct UnixPeer {
    socket: UnixDatagram,
    target: PathBuf,
}

impl UnixPeer {
    pub fn open(target: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            socket: UnixDatagram::unbound()?,
            target: target.as_ref().to_path_buf(),
        })
    }
}

#[async_trait]
impl Peer for UnixPeer {
    async fn send(&self, msg: &str) -> io::Result<()> {
        self.socket.send_to(msg.as_bytes(), &self.target).await?;
        Ok(())
    }
}

/// The two upstream consumers of parsed client messages.
pub struct Peers {
    pub stratifier: Arc<dyn Peer>,
    pub generator: Arc<dyn Peer>,
}

impl Peers {
    /// Production peers at the socket paths named by the configuration.
    pub fn unix(config: &Config) -> io::Result<Self> {
        Ok(Self {
            stratifier: Arc::new(UnixPeer::open(config.sockets.stratifier_path())?),
            generator: Arc::new(UnixPeer::open(config.sockets.generator_path())?),
        })
    }

    /// Deliver a parsed client message upstream. The generator consumes
    /// everything when the process runs as a passthrough, the stratifier
    /// otherwise. Delivery is fire-and-forget; there is no retry.
    pub(crate) async fn forward(&self, to_generator: bool, line: &str) {
        let (peer, name) = if to_generator {
            (&self.generator, "generator")
        } else {
            (&self.stratifier, "stratifier")
        };
        if let Err(e) = peer.send(line).await {
            warn!("failed to forward message to {}: {}", name, e);
        }
    }

    /// Tell the stratifier a client id is gone.
    pub(crate) async fn drop_id(&self, id: i64) {
        let msg = format!("dropclient={id}");
        if let Err(e) = self.stratifier.send(&msg).await {
            warn!("failed to notify stratifier of dropped client {}: {}", id, e);
        }
    }

    /// Notify the right peer that a client has been invalidated. In
    /// passthrough mode the upstream pool gets a mining.term for the
    /// connection; otherwise the stratifier is told to drop the id, except
    /// for passthrough clients whose sub-clients are dropped individually.
    pub(crate) async fn drop_client(&self, process_passthrough: bool, client: &Client) {
        if process_passthrough {
            let notice = json!({
                "id": 42,
                "client_id": client.id(),
                "address": client.address(),
                "server": client.server(),
                "method": "mining.term",
                "params": [],
            });
            if let Err(e) = self.generator.send(&notice.to_string()).await {
                warn!(
                    "failed to notify generator of dropped client {}: {}",
                    client.id(),
                    e
                );
            }
        } else if !client.is_passthrough() {
            self.drop_id(client.id()).await;
        }
    }
}

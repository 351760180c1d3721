use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instance name, used in logs.
    pub name: String,
    pub server: ServerConfig,
    pub sockets: SocketConfig,
    /// Run as a passthrough aggregator: client traffic is routed to the
    /// generator and a stats line is logged periodically.
    pub passthrough: bool,
    /// Proxy mode shifts the default listen port.
    pub proxy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen addresses in host:port form. Empty binds the wildcard
    /// address on the default port.
    pub urls: Vec<String>,
    /// Maximum concurrent clients; 0 disables the cap.
    pub max_clients: usize,
}

/// Where the process sockets live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub dir: PathBuf,
    pub control: String,
    pub stratifier: String,
    pub generator: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "ingot".to_string(),
            server: ServerConfig::default(),
            sockets: SocketConfig::default(),
            passthrough: false,
            proxy: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            max_clients: 0,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/ingot"),
            control: "connector.sock".to_string(),
            stratifier: "stratifier.sock".to_string(),
            generator: "generator.sock".to_string(),
        }
    }
}

impl SocketConfig {
    pub fn control_path(&self) -> PathBuf {
        self.dir.join(&self.control)
    }

    pub fn stratifier_path(&self) -> PathBuf {
        self.dir.join(&self.stratifier)
    }

    pub fn generator_path(&self) -> PathBuf {
        self.dir.join(&self.generator)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            crate::Error::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))
    }

    pub fn default_port(&self) -> u16 {
        if self.proxy {
            3334
        } else {
            3333
        }
    }

    /// Listen urls to bind, falling back to the wildcard default when the
    /// configuration names none.
    pub fn listen_urls(&self) -> Vec<String> {
        if self.server.urls.is_empty() {
            vec![format!("0.0.0.0:{}", self.default_port())]
        } else {
            self.server.urls.clone()
        }
    }

    /// Commented example configuration for `init`.
    pub fn example() -> &'static str {
        r#"# ingot connector configuration

# Instance name used in logs.
name = "ingot"

# Route all client traffic to the generator and log stats periodically.
passthrough = false

# Proxy mode listens on port 3334 by default instead of 3333.
proxy = false

[server]
# Listen addresses. Empty binds the wildcard address on the default port.
urls = ["0.0.0.0:3333"]
# Maximum concurrent clients; 0 disables the cap.
max_clients = 0

[sockets]
# Directory holding the process sockets.
dir = "/tmp/ingot"
control = "connector.sock"
stratifier = "stratifier.sock"
generator = "generator.sock"
"#
    }
}

use std::net::ToSocketAddrs;

use crate::error::{Error, Result};

use super::Config;

impl Config {
    /// Check the configuration before the connector tries to use it.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".into()));
        }

        for url in &self.server.urls {
            url.to_socket_addrs()
                .map_err(|e| Error::Config(format!("listen url {url} is not usable: {e}")))?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!("listen url {url} resolves to no address"))
                })?;
        }

        for (label, value) in [
            ("sockets.control", &self.sockets.control),
            ("sockets.stratifier", &self.sockets.stratifier),
            ("sockets.generator", &self.sockets.generator),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{label} must not be empty")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn bad_listen_url_is_rejected() {
        let mut config = Config::default();
        config.server.urls = vec!["not-an-address".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_socket_name_is_rejected() {
        let mut config = Config::default();
        config.sockets.stratifier = String::new();
        assert!(config.validate().is_err());
    }
}

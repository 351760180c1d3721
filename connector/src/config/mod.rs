pub mod types;
pub mod validation;

pub use types::{Config, ServerConfig, SocketConfig};

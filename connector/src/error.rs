pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {url}: {source}")]
    Bind {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// A client line grew past the message size cap without a terminator,
    /// or carried its terminator past the cap.
    #[error("client message exceeds {} bytes", crate::framing::MAX_MSGSIZE)]
    Oversize,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//! Error types for the tunnel transport.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on either side of the tunnel.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// HTTP protocol error from the embedded client or server
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// An HTTP roundtrip completed with a status other than 200
    #[error("status code was {0}, not 200")]
    Status(u16),

    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream proxy URL is unusable with the current setup
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The browser helper misbehaved or reported a failure
    #[error("helper error: {0}")]
    Helper(String),

    /// Server-side session became unusable; its back-end has to go
    #[error("session error: {0}")]
    Session(String),

    /// URL parse failure
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Malformed SOCKS negotiation on the client listener
    #[error("SOCKS error: {0}")]
    Socks(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new proxy error.
    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    /// Create a new helper error.
    pub fn helper(msg: impl Into<String>) -> Self {
        Error::Helper(msg.into())
    }

    /// Create a new session error.
    pub fn session(msg: impl Into<String>) -> Self {
        Error::Session(msg.into())
    }

    /// Create a new SOCKS error.
    pub fn socks(msg: impl Into<String>) -> Self {
        Error::Socks(msg.into())
    }

    /// True for roundtrips that completed with a non-200 status. These are
    /// the only failures the dispatcher retries; everything else ends the
    /// session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Status(_))
    }
}

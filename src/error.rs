use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur across the tunnel daemon
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed SSH URL or endpoint string
    #[error("invalid SSH url: {0}")]
    InvalidUrl(String),

    /// Key material could not be loaded or parsed
    #[error("failed to load key at {path}: {message}")]
    KeyLoad { path: PathBuf, message: String },

    /// Network binding failed
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP dial failed
    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Authentication was rejected or no method was usable
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The presented host key differs from the recorded one
    #[error("host key mismatch for {host}: recorded {expected}, presented {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// The host is not present in the known-hosts store
    #[error("host {host} is not trusted (fingerprint {fingerprint})")]
    HostKeyUnknown { host: String, fingerprint: String },

    /// Channel open was refused by the peer
    #[error("failed to open channel to {target}: {message}")]
    ChannelOpen { target: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// The connection manager was stopped
    #[error("connection manager stopped")]
    Stopped,

    /// No active SSH session is available
    #[error("not connected")]
    NotConnected,
}

/// Result type alias for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

impl TunnelError {
    /// Create a key-load error
    pub fn key_load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::KeyLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a bind error
    pub fn bind(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            address: address.into(),
            source,
        }
    }

    /// Create a dial error
    pub fn dial(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Dial {
            address: address.into(),
            source,
        }
    }

    /// Create a channel-open error
    pub fn channel_open(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelOpen {
            target: target.into(),
            message: message.into(),
        }
    }
}

//! WolfMesh Error Types

use thiserror::Error;

/// Result type alias for WolfMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Tunnel device errors
    #[error("TUN error: {0}")]
    Tun(String),

    #[error("Undersized packet from tunnel: {0} bytes")]
    UndersizedPacket(usize),

    #[error("Short write to {target}: wrote {written} of {expected} bytes")]
    ShortWrite {
        target: &'static str,
        expected: usize,
        written: usize,
    },

    // Mesh transport errors
    #[error("Mesh error: {0}")]
    Mesh(String),

    #[error("Mesh transport closed")]
    MeshClosed,

    #[error("Handshake failed with {peer}: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("Invalid signature: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),

    #[error("Invalid key: {0}")]
    Key(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the shared transport is gone, so
    /// restarting the loop that hit it cannot help
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::MeshClosed)
    }
}

//! Typed error kinds for the SPEED core.
//!
//! Every fallible boundary the runtime exposes returns one of these variants
//! rather than an opaque error chain, so callers can match on the specific
//! failure (e.g. retry on `NotConnected`, abort on `InvalidKey`).

use std::path::PathBuf;

/// Error kinds produced by the SPEED core library.
#[derive(Debug, thiserror::Error)]
pub enum SpeedError {
    /// Key file missing, not valid Base64, or decodes to the wrong length.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Frame bytes failed to decode (short read, oversized length, unknown type).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// AEAD tag verification failed.
    #[error("authentication failed")]
    AuthFailed,

    /// Writing or renaming a frame into a peer's inbox failed.
    #[error("failed to write frame to {path}: {source}")]
    WriteFailed {
        /// Path the writer was attempting to publish.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `send` targeted a peer never observed in the access registry.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// `send` targeted a peer not on the local access list.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// `send` targeted an access-list peer the handshake hasn't completed with yet.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A per-peer executor's bounded queue is at capacity.
    #[error("executor queue full for peer {0}")]
    QueueFull(String),

    /// Catch-all for filesystem failures that don't map to a specific kind above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the core library.
pub type Result<T> = std::result::Result<T, SpeedError>;

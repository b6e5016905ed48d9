//! Wire-format constants and default runtime knobs.
//!
//! Values here are either mandated by the on-disk frame layout (fixed
//! sizes, the version byte) or are the spec's stated defaults for the
//! executor pool and watcher. Operational overrides live in [`crate::config`].

use std::time::Duration;

// ============================================================================
// Frame layout
// ============================================================================

/// Current (and only) frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Frames larger than this are rejected as malformed rather than allocated.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// AEAD
// ============================================================================

/// XChaCha20-Poly1305 key size.
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305-IETF nonce size.
pub const NONCE_SIZE: usize = 24;

// ============================================================================
// Executor pool (§4.E)
// ============================================================================

/// Default bounded queue + reorder-buffer capacity per peer executor.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default idle timeout before a peer's worker thread may exit.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Watcher (§5)
// ============================================================================

/// Default interval between inbox directory scans when idle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_version_is_one() {
        assert_eq!(FRAME_VERSION, 1);
    }

    #[test]
    fn test_key_and_nonce_sizes_match_xchacha20poly1305() {
        assert_eq!(KEY_SIZE, 32);
        assert_eq!(NONCE_SIZE, 24);
    }
}

//! Runtime configuration (§12).
//!
//! Carries the operational knobs that are genuinely configuration rather
//! than spec-mandated constants: bus directory override, executor queue
//! capacity, executor idle timeout, and watcher poll interval. Defaults
//! match the spec's stated defaults exactly. Grounded on this codebase's
//! `Config` pattern (serde struct, `Default` impl, env var overrides).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_IDLE_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY};

/// Operational configuration for a SPEED coordinator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bus directory override. `None` means resolve via `SPEED_DIR` or the
    /// platform temp directory (§6 "Bus directory resolution").
    pub bus_dir: Option<PathBuf>,
    /// Per-peer executor bounded queue + reorder buffer capacity (§4.E).
    pub queue_capacity: usize,
    /// Per-peer executor idle timeout, in milliseconds, before its worker
    /// thread may exit (§4.E).
    pub idle_timeout_ms: u64,
    /// Watcher directory-scan poll interval, in milliseconds (§5).
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_dir: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    /// Build a `Config` from defaults overridden by environment variables:
    /// `SPEED_DIR`, `SPEED_QUEUE_CAPACITY`, `SPEED_IDLE_TIMEOUT_MS`,
    /// `SPEED_POLL_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SPEED_DIR") {
            self.bus_dir = Some(PathBuf::from(dir));
        }
        if let Ok(v) = std::env::var("SPEED_QUEUE_CAPACITY") {
            if let Ok(parsed) = v.parse() {
                self.queue_capacity = parsed;
            }
        }
        if let Ok(v) = std::env::var("SPEED_IDLE_TIMEOUT_MS") {
            if let Ok(parsed) = v.parse() {
                self.idle_timeout_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("SPEED_POLL_INTERVAL_MS") {
            if let Ok(parsed) = v.parse() {
                self.poll_interval_ms = parsed;
            }
        }
    }

    /// Resolve the bus directory: explicit override, else `SPEED_DIR`
    /// (already folded into `bus_dir` by [`Config::from_env`]), else the
    /// platform temp directory joined with `speed`.
    pub fn bus_dir(&self) -> PathBuf {
        self.bus_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("speed"))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize these tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_bus_dir_falls_back_to_temp_speed() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SPEED_DIR");
        let config = Config::default();
        assert_eq!(config.bus_dir(), std::env::temp_dir().join("speed"));
    }

    #[test]
    fn test_env_override_applies() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SPEED_QUEUE_CAPACITY", "8");
        let config = Config::from_env();
        assert_eq!(config.queue_capacity, 8);
        std::env::remove_var("SPEED_QUEUE_CAPACITY");
    }
}

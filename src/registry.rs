//! Registry (§4.D).
//!
//! Maintains the three peer-name sets the coordinator consults on every
//! `send`: global (observed via `access_registry/` marker files), access
//! (locally authorized), and connected (handshake-complete). Also owns this
//! process's own marker file, published via the same atomic
//! `.iregistry` → `.oregistry` rename pattern the file writer uses for
//! frames.
//!
//! Deliberately *not* grounded on the reference `AccessRegistry.cpp`: that
//! variant hardcodes a mock peer list instead of scanning the directory, and
//! its marker-removal routine renames a file onto itself rather than
//! performing a real publish/unpublish. Both are bugs, not behavior to copy.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::SpeedError;

/// The three peer-name sets tracked per process, plus this process's own
/// marker file lifecycle.
pub struct Registry {
    bus_dir: PathBuf,
    self_name: String,
    global: Mutex<HashSet<String>>,
    access: Mutex<HashSet<String>>,
    connected: Mutex<HashSet<String>>,
}

impl Registry {
    /// Create a registry for `self_name` rooted at `bus_dir`. Ensures
    /// `bus_dir/access_registry/` exists.
    pub fn new(bus_dir: &Path, self_name: &str) -> Result<Self, SpeedError> {
        let registry_dir = bus_dir.join("access_registry");
        fs::create_dir_all(&registry_dir)?;
        Ok(Self {
            bus_dir: bus_dir.to_path_buf(),
            self_name: self_name.to_string(),
            global: Mutex::new(HashSet::new()),
            access: Mutex::new(HashSet::new()),
            connected: Mutex::new(HashSet::new()),
        })
    }

    fn registry_dir(&self) -> PathBuf {
        self.bus_dir.join("access_registry")
    }

    /// Add `name` to the access list. Idempotent.
    pub fn add(&self, name: &str) {
        self.access.lock().expect("access lock poisoned").insert(name.to_string());
    }

    pub fn remove_from_access(&self, name: &str) {
        self.access.lock().expect("access lock poisoned").remove(name);
    }

    pub fn remove_from_global(&self, name: &str) {
        self.global.lock().expect("global lock poisoned").remove(name);
    }

    pub fn remove_from_connected(&self, name: &str) {
        self.connected.lock().expect("connected lock poisoned").remove(name);
    }

    pub fn contains_global(&self, name: &str) -> bool {
        self.global.lock().expect("global lock poisoned").contains(name)
    }

    pub fn contains_access(&self, name: &str) -> bool {
        self.access.lock().expect("access lock poisoned").contains(name)
    }

    pub fn contains_connected(&self, name: &str) -> bool {
        self.connected.lock().expect("connected lock poisoned").contains(name)
    }

    /// Move `name` into the connected set. Idempotent; does not require
    /// `name` to already be in access (callers are expected to have
    /// checked that per §4.F.ii's `CON_RES` handling).
    pub fn connect(&self, name: &str) {
        self.connected.lock().expect("connected lock poisoned").insert(name.to_string());
    }

    /// Take a snapshot of the current access list.
    pub fn access_snapshot(&self) -> Vec<String> {
        self.access.lock().expect("access lock poisoned").iter().cloned().collect()
    }

    /// Walk `access_registry/`, replacing the global set with every regular
    /// file's stem (minus extension), excluding `self_name`.
    pub fn rescan_global(&self) -> Result<(), SpeedError> {
        let mut discovered = HashSet::new();
        for entry in fs::read_dir(self.registry_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == self.self_name {
                continue;
            }
            discovered.insert(stem.to_string());
        }
        *self.global.lock().expect("global lock poisoned") = discovered;
        Ok(())
    }

    /// Publish this process's marker file (`<self>.ispeed` → `<self>.oregistry`).
    pub fn publish_marker(&self) -> Result<(), SpeedError> {
        let dir = self.registry_dir();
        let staging = dir.join(format!("{}.ispeed", self.self_name));
        let published = dir.join(format!("{}.oregistry", self.self_name));

        let mut file = fs::File::create(&staging)?;
        file.write_all(self.self_name.as_bytes())?;
        file.sync_all()?;
        fs::rename(&staging, &published)?;
        Ok(())
    }

    /// Remove this process's marker file. Idempotent.
    pub fn unpublish_marker(&self) -> Result<(), SpeedError> {
        let published = self.registry_dir().join(format!("{}.oregistry", self.self_name));
        match fs::remove_file(published) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Inbox watcher (§4.F, §5, §9).
//!
//! Scans this process's own inbox directory for newly published `.ospeed`
//! files, decrypts just enough of each (the `sender` field) to route it to
//! the correct per-sender executor, and leaves full decryption/dispatch to
//! the executor's worker thread. Routing on the decrypted sender — not the
//! filename's destination capture group — is the fix for open question 1.
//!
//! Grounded on this codebase's `file_watcher.rs` wrapper around `notify`,
//! adapted to `PollWatcher` with an explicit interval so the observable
//! timing matches the spec's "~100ms between scans" contract regardless of
//! platform notification backend.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config, Event, PollWatcher, RecursiveMode, Watcher};

use crate::crypto::AeadCodec;
use crate::executor::{ExecutorPool, Task};
use crate::frame::Frame;

/// Wraps a `notify` `PollWatcher` on a single directory, used only to wake
/// the scan loop promptly; the directory scan itself is what's authoritative.
struct InboxWatcher {
    _watcher: PollWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
}

impl InboxWatcher {
    fn new(inbox_dir: &Path, poll_interval: Duration) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let config = Config::default().with_poll_interval(poll_interval);
        let mut watcher = PollWatcher::new(move |res| {
            let _ = tx.send(res);
        }, config)?;
        watcher.watch(inbox_dir, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher, rx })
    }

    /// Block until an event arrives or `timeout` elapses, whichever first.
    fn wait(&self, timeout: Duration) {
        let _ = self.rx.recv_timeout(timeout);
    }
}

/// Scan `inbox_dir` once, routing every not-yet-seen `.ospeed` file into
/// `pool`. Malformed frames and sender-field auth failures are dropped
/// (file removed, dedup entry cleared) rather than propagated — a bad file
/// from one peer must not stop the watcher from seeing anyone else's.
pub fn scan_once(
    inbox_dir: &Path,
    seen: &Mutex<HashSet<String>>,
    codec: &AeadCodec,
    pool: &ExecutorPool,
) -> std::io::Result<()> {
    let entries = match fs::read_dir(inbox_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".ospeed") {
            continue;
        }

        {
            let mut seen_guard = seen.lock().expect("seen-set lock poisoned");
            if seen_guard.contains(&name) {
                continue;
            }
            seen_guard.insert(name.clone());
        }

        let path = entry.path();
        log::debug!("observed new inbox file {}", path.display());
        if let Err(reason) = route_one(&path, codec, pool) {
            log::warn!("dropping {}: {reason}", path.display());
            let _ = fs::remove_file(&path);
            seen.lock().expect("seen-set lock poisoned").remove(&name);
        }
    }
    Ok(())
}

fn route_one(path: &PathBuf, codec: &AeadCodec, pool: &ExecutorPool) -> Result<(), String> {
    let bytes = fs::read(path).map_err(|e| format!("read failed: {e}"))?;
    let frame = Frame::decode(&bytes).map_err(|e| format!("{e}"))?;
    let sender_bytes = codec
        .decrypt_sender_only(&frame.nonce, &frame.sender)
        .map_err(|_| "sender field auth failed".to_string())?;
    let sender = String::from_utf8_lossy(&sender_bytes).to_string();

    log::trace!("routing {} from {sender} (seq {})", path.display(), frame.seq_num);
    pool.route(Task {
        sender,
        seq_num: frame.seq_num,
        path: path.clone(),
    })
    .map_err(|e| format!("routing failed: {e}"))
}

/// Run the watch loop until `should_exit` is set. Cooperative pause via
/// `paused`: while true, scans are skipped but the loop keeps polling so it
/// notices `should_exit` promptly.
pub fn run_watch_loop(
    inbox_dir: PathBuf,
    seen: Arc<Mutex<HashSet<String>>>,
    codec: Arc<AeadCodec>,
    pool: Arc<ExecutorPool>,
    should_exit: Arc<std::sync::atomic::AtomicBool>,
    paused: Arc<std::sync::atomic::AtomicBool>,
    poll_interval: Duration,
) {
    use std::sync::atomic::Ordering;

    let watcher = InboxWatcher::new(&inbox_dir, poll_interval).ok();

    while !should_exit.load(Ordering::SeqCst) {
        if !paused.load(Ordering::SeqCst) {
            if let Err(e) = scan_once(&inbox_dir, &seen, &codec, &pool) {
                log::error!("watcher scan of {} failed: {e}", inbox_dir.display());
            }
        }
        match &watcher {
            Some(w) => w.wait(poll_interval),
            None => std::thread::sleep(poll_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{new_frame, MessageType};
    use crate::writer::write_frame;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[test]
    fn test_scan_once_routes_new_file_and_dedups_by_name() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("bob");
        fs::create_dir_all(&inbox).unwrap();

        let codec = AeadCodec::new(&[1u8; 32]).unwrap();
        let fields = codec.encrypt_fields(b"alice", b"bob", b"hi").unwrap();
        let frame = new_frame(MessageType::Msg, 1, 0, 3, fields.sender, fields.receiver, fields.nonce, fields.payload);
        write_frame(dir.path(), "bob", &frame).unwrap();

        let (tx, rx) = std_mpsc::channel();
        let tx = StdMutex::new(tx);
        let pool = ExecutorPool::new(
            16,
            Duration::from_millis(200),
            Arc::new(move |task: Task| {
                let _ = tx.lock().expect("lock poisoned").send(task);
            }),
        );
        let seen = Mutex::new(HashSet::new());

        scan_once(&inbox, &seen, &codec, &pool).unwrap();
        let task = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(task.sender, "alice");
        assert_eq!(task.seq_num, 3);

        // Second scan must not re-route the same file.
        scan_once(&inbox, &seen, &codec, &pool).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_scan_once_drops_frame_with_wrong_key() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("bob");
        fs::create_dir_all(&inbox).unwrap();

        let writer_codec = AeadCodec::new(&[1u8; 32]).unwrap();
        let reader_codec = AeadCodec::new(&[2u8; 32]).unwrap();
        let fields = writer_codec.encrypt_fields(b"alice", b"bob", b"hi").unwrap();
        let frame = new_frame(MessageType::Msg, 1, 0, 0, fields.sender, fields.receiver, fields.nonce, fields.payload);
        let path = write_frame(dir.path(), "bob", &frame).unwrap();

        let pool = ExecutorPool::new(16, Duration::from_millis(200), Arc::new(|_: Task| {}));
        let seen = Mutex::new(HashSet::new());

        scan_once(&inbox, &seen, &reader_codec, &pool).unwrap();
        assert!(!path.exists());
    }
}

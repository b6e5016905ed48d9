//! Runtime coordinator (§4.F).
//!
//! Owns the watcher thread, the handshake state (pending-connection set),
//! the message dispatcher, and the public operations a process calls to
//! join the bus: `new`, `set_key_file`, `set_callback`, `add_process`,
//! `start`/`stop`/`resume`, `send`, `ping`/`pong`,
//! `register_method`/`invoke_method`, `kill`.
//!
//! Grounded on `original_source/speed-cpp/src/SPEED.cpp` for exact
//! operation semantics, with the two correctness fixes the spec mandates
//! over that reference: executors are keyed by the decrypted sender field,
//! and every `seq_num` comes directly from one atomic fetch-and-increment.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::config::Config;
use crate::crypto::AeadCodec;
use crate::error::SpeedError;
use crate::executor::{ExecutorPool, Task};
use crate::frame::{new_frame, Frame, MessageType};
use crate::registry::Registry;
use crate::watcher;
use crate::writer;

/// A decoded message handed to the user callback, for `MSG` and `PONG` frames.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub sender_name: String,
    pub payload_text: String,
    pub timestamp: u64,
    pub sequence_num: u64,
}

/// Single-threaded mode blocks `start()` in the watcher loop; multi-threaded
/// mode spawns a watcher thread and returns immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    Single,
    Multi,
}

/// A `register_method`/`invoke_method` callback: takes the positional string
/// arguments carried in an `INVOKE_METHOD` frame's payload.
pub type MethodFn = Arc<dyn Fn(&[String]) + Send + Sync>;
/// The user's message callback, invoked only for `MSG` and `PONG` frames.
pub type MessageCallback = Arc<dyn Fn(DecodedMessage) + Send + Sync>;

struct Inner {
    self_name: String,
    bus_dir: PathBuf,
    config: Config,

    seq_number: AtomicU64,
    callback: Mutex<Option<MessageCallback>>,
    codec: Mutex<Option<Arc<AeadCodec>>>,
    registry: Registry,
    pending_connections: Mutex<HashSet<String>>,
    methods: Mutex<std::collections::HashMap<String, MethodFn>>,
    seen: Arc<Mutex<HashSet<String>>>,

    watcher_should_exit: Arc<AtomicBool>,
    watcher_paused: Arc<AtomicBool>,
    watcher_handle: Mutex<Option<JoinHandle<()>>>,
    executor_pool: Mutex<Option<Arc<ExecutorPool>>>,

    killed: AtomicBool,
}

/// The public SPEED runtime. Cheap to clone (`Arc` internally) so a
/// callback or an executor's dispatch closure can hold a handle back to it.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create `bus_dir/`, `bus_dir/<self_name>/`, `bus_dir/access_registry/`,
    /// and publish this process's marker file. `config` carries the queue
    /// capacity, idle timeout, and poll interval `start()` will use — pass
    /// [`Config::from_env`] to honor `SPEED_QUEUE_CAPACITY` et al.
    pub fn new(self_name: impl Into<String>, thread_mode: ThreadMode, config: Config) -> Result<Self, SpeedError> {
        let self_name = self_name.into();
        let bus_dir = config.bus_dir();
        fs::create_dir_all(&bus_dir)?;
        fs::create_dir_all(bus_dir.join(&self_name))?;

        let registry = Registry::new(&bus_dir, &self_name)?;
        registry.publish_marker()?;
        log::info!("{self_name} joined bus at {}", bus_dir.display());

        let inner = Inner {
            self_name,
            bus_dir,
            config,
            seq_number: AtomicU64::new(0),
            callback: Mutex::new(None),
            codec: Mutex::new(None),
            registry,
            pending_connections: Mutex::new(HashSet::new()),
            methods: Mutex::new(std::collections::HashMap::new()),
            seen: Arc::new(Mutex::new(HashSet::new())),
            watcher_should_exit: Arc::new(AtomicBool::new(false)),
            watcher_paused: Arc::new(AtomicBool::new(false)),
            watcher_handle: Mutex::new(None),
            executor_pool: Mutex::new(None),
            killed: AtomicBool::new(false),
        };
        let coordinator = Self { inner: Arc::new(inner) };
        let _ = thread_mode; // thread_mode only affects `start()`, recorded via the caller's own call site.
        Ok(coordinator)
    }

    /// Load and validate a key file: trimmed content must be non-empty
    /// Base64 decoding to exactly 32 bytes.
    pub fn set_key_file(&self, raw_contents: &str) -> Result<(), SpeedError> {
        let trimmed = raw_contents.trim();
        if trimmed.is_empty() {
            return Err(SpeedError::InvalidKey("key file is empty".into()));
        }
        let decoded = BASE64
            .decode(trimmed)
            .map_err(|e| SpeedError::InvalidKey(format!("not valid base64: {e}")))?;
        if decoded.len() != crate::constants::KEY_SIZE {
            return Err(SpeedError::InvalidKey(format!(
                "decoded key is {} bytes, expected {}",
                decoded.len(),
                crate::constants::KEY_SIZE
            )));
        }
        let codec = AeadCodec::new(&decoded)?;
        *self.inner.codec.lock().expect("codec lock poisoned") = Some(Arc::new(codec));
        Ok(())
    }

    /// Install the user's message callback (`MSG`/`PONG` only).
    pub fn set_callback(&self, callback: MessageCallback) {
        *self.inner.callback.lock().expect("callback lock poisoned") = Some(callback);
    }

    /// Register a name for `invoke_method` dispatch.
    pub fn register_method(&self, name: impl Into<String>, f: MethodFn) {
        self.inner
            .methods
            .lock()
            .expect("methods lock poisoned")
            .insert(name.into(), f);
    }

    /// Invoke a locally registered method by name. Logs and does nothing if
    /// the name isn't registered (§4.F.ii `INVOKE_METHOD`).
    pub fn invoke_method(&self, name: &str, args: &[String]) {
        let method = self.inner.methods.lock().expect("methods lock poisoned").get(name).cloned();
        match method {
            Some(f) => f(args),
            None => log::warn!("invoke_method: no method registered for {name}"),
        }
    }

    /// Idempotent. Adds `name` to the access list, sends `CON_REQ`, and
    /// records `name` as a pending connection.
    pub fn add_process(&self, name: &str) -> Result<(), SpeedError> {
        self.inner.registry.add(name);
        self.inner
            .pending_connections
            .lock()
            .expect("pending-connections lock poisoned")
            .insert(name.to_string());
        self.emit(MessageType::ConReq, name, &[])
    }

    /// Launch the watcher. Blocks in single-threaded mode; spawns a thread
    /// and returns in multi-threaded mode. This coordinator always runs the
    /// loop on a background thread and treats the distinction as "does
    /// `start()` join that thread before returning."
    pub fn start(&self, thread_mode: ThreadMode) -> Result<(), SpeedError> {
        log::info!("{} starting watcher ({thread_mode:?})", self.inner.self_name);
        let pool = Arc::new(ExecutorPool::new(
            self.inner.config.queue_capacity,
            self.inner.config.idle_timeout(),
            self.processing_closure(),
        ));
        *self.inner.executor_pool.lock().expect("executor pool lock poisoned") = Some(Arc::clone(&pool));

        let codec = self
            .inner
            .codec
            .lock()
            .expect("codec lock poisoned")
            .clone()
            .ok_or_else(|| SpeedError::InvalidKey("set_key_file must be called before start".into()))?;

        let inbox_dir = self.inner.bus_dir.join(&self.inner.self_name);
        let seen = Arc::clone(&self.inner.seen);
        let should_exit = Arc::clone(&self.inner.watcher_should_exit);
        let paused = Arc::clone(&self.inner.watcher_paused);
        let poll_interval = self.inner.config.poll_interval();

        let run = move || {
            watcher::run_watch_loop(inbox_dir, seen, codec, pool, should_exit, paused, poll_interval);
        };

        match thread_mode {
            ThreadMode::Single => {
                run();
                Ok(())
            }
            ThreadMode::Multi => {
                let handle = thread::spawn(run);
                *self.inner.watcher_handle.lock().expect("watcher handle lock poisoned") = Some(handle);
                Ok(())
            }
        }
    }

    /// Pause the watcher; workers keep draining already-buffered work.
    pub fn stop(&self) {
        self.inner.watcher_paused.store(true, Ordering::SeqCst);
    }

    /// Resume a paused watcher.
    pub fn resume(&self) {
        self.inner.watcher_paused.store(false, Ordering::SeqCst);
    }

    /// §4.F.i: check global → access → connected, in that order.
    fn check_send_preconditions(&self, receiver: &str) -> Result<(), SpeedError> {
        if !self.inner.registry.contains_global(receiver) {
            self.inner.registry.rescan_global()?;
            if !self.inner.registry.contains_global(receiver) {
                return Err(SpeedError::UnknownPeer(receiver.to_string()));
            }
        }
        if !self.inner.registry.contains_access(receiver) {
            return Err(SpeedError::NotAuthorized(receiver.to_string()));
        }
        if !self.inner.registry.contains_connected(receiver) {
            self.inner
                .pending_connections
                .lock()
                .expect("pending-connections lock poisoned")
                .insert(receiver.to_string());
            self.emit(MessageType::ConReq, receiver, &[])?;
            return Err(SpeedError::NotConnected(receiver.to_string()));
        }
        Ok(())
    }

    /// Send a `MSG` frame to `receiver`. Preconditions per §4.F.i.
    pub fn send(&self, text: &str, receiver: &str) -> Result<(), SpeedError> {
        self.check_send_preconditions(receiver)?;
        self.emit(MessageType::Msg, receiver, text.as_bytes())
    }

    pub fn ping(&self, receiver: &str) -> Result<(), SpeedError> {
        self.emit(MessageType::Ping, receiver, &[])
    }

    pub fn pong(&self, receiver: &str) -> Result<(), SpeedError> {
        self.emit(MessageType::Pong, receiver, &[])
    }

    /// Encode, encrypt, and write one frame. The sequence number used is the
    /// value returned directly by a single `fetch_add` — never a separate
    /// load (§9 open question 3). A failed write does not advance the
    /// sequence counter.
    fn emit(&self, msg_type: MessageType, receiver: &str, payload: &[u8]) -> Result<(), SpeedError> {
        let codec = self
            .inner
            .codec
            .lock()
            .expect("codec lock poisoned")
            .clone()
            .ok_or_else(|| SpeedError::InvalidKey("set_key_file must be called before sending".into()))?;

        let seq_num = self.inner.seq_number.fetch_add(1, Ordering::Relaxed);
        let fields = codec.encrypt_fields(self.inner.self_name.as_bytes(), receiver.as_bytes(), payload)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let frame = new_frame(
            msg_type,
            std::process::id(),
            timestamp,
            seq_num,
            fields.sender,
            fields.receiver,
            fields.nonce,
            fields.payload,
        );
        writer::write_frame(&self.inner.bus_dir, receiver, &frame)?;
        Ok(())
    }

    /// The closure an executor worker calls on each in-order task: re-reads
    /// the file, fully decrypts, dispatches by type (§4.F.ii), then always
    /// removes the file and its dedup entry.
    fn processing_closure(&self) -> Arc<dyn Fn(Task) + Send + Sync> {
        let this = self.clone();
        Arc::new(move |task: Task| {
            this.process_file(&task);
        })
    }

    fn process_file(&self, task: &Task) {
        let name = task
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let result = self.dispatch_file(task);
        if let Err(e) = result {
            log::warn!("failed to process {}: {e}", task.path.display());
        }

        let _ = fs::remove_file(&task.path);
        self.inner.seen.lock().expect("seen-set lock poisoned").remove(&name);
    }

    fn dispatch_file(&self, task: &Task) -> Result<(), SpeedError> {
        log::trace!("processing {} (seq {})", task.path.display(), task.seq_num);
        let bytes = fs::read(&task.path)?;
        let frame = Frame::decode(&bytes)?;

        let codec = self
            .inner
            .codec
            .lock()
            .expect("codec lock poisoned")
            .clone()
            .ok_or_else(|| SpeedError::InvalidKey("no key configured".into()))?;

        let decrypted = codec.decrypt_fields(&frame.nonce, &frame.sender, &frame.receiver, &frame.payload)?;
        let sender = String::from_utf8_lossy(&decrypted.sender).to_string();

        match frame.msg_type {
            MessageType::Msg | MessageType::Pong => {
                let payload_text = String::from_utf8_lossy(&decrypted.payload).to_string();
                self.deliver(DecodedMessage {
                    sender_name: sender,
                    payload_text,
                    timestamp: frame.timestamp,
                    sequence_num: frame.seq_num,
                });
            }
            MessageType::Ping => {
                self.pong(&sender)?;
            }
            MessageType::ConReq => {
                if self.inner.registry.contains_access(&sender) {
                    self.emit(MessageType::ConRes, &sender, &[])?;
                }
            }
            MessageType::ConRes => {
                let was_pending = self
                    .inner
                    .pending_connections
                    .lock()
                    .expect("pending-connections lock poisoned")
                    .remove(&sender);
                if was_pending {
                    self.inner.registry.connect(&sender);
                    log::info!("{} connected to {sender}", self.inner.self_name);
                }
            }
            MessageType::ExitNotif => {
                self.inner.registry.remove_from_global(&sender);
                self.inner.registry.remove_from_access(&sender);
                self.inner.registry.remove_from_connected(&sender);
            }
            MessageType::InvokeMethod => {
                let payload_text = String::from_utf8_lossy(&decrypted.payload).to_string();
                let args: Vec<String> = payload_text.split('\u{1f}').map(|s| s.to_string()).collect();
                if args.is_empty() || args[0].is_empty() {
                    log::warn!("invoke_method frame from {sender} carried no method name");
                } else {
                    self.invoke_method(&args[0], &args[1..]);
                }
            }
        }

        Ok(())
    }

    fn deliver(&self, message: DecodedMessage) {
        let callback = self.inner.callback.lock().expect("callback lock poisoned").clone();
        if let Some(cb) = callback {
            cb(message);
        }
    }

    /// Teardown (§4.F.iii): stop the watcher, stop all executors, broadcast
    /// `EXIT_NOTIF` to the access-list snapshot, unpublish the marker.
    /// Idempotent.
    pub fn kill(&self) -> Result<(), SpeedError> {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("{} killing bus connection", self.inner.self_name);

        self.inner.watcher_should_exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.watcher_handle.lock().expect("watcher handle lock poisoned").take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.inner.executor_pool.lock().expect("executor pool lock poisoned").take() {
            pool.stop_all();
        }

        let access_snapshot = self.inner.registry.access_snapshot();
        for peer in access_snapshot {
            if let Err(e) = self.emit(MessageType::ExitNotif, &peer, &[]) {
                log::warn!("failed to notify {peer} of exit: {e}");
            }
        }

        self.inner.registry.unpublish_marker()?;
        log::info!("{} left the bus", self.inner.self_name);
        Ok(())
    }

    pub fn self_name(&self) -> &str {
        &self.inner.self_name
    }

    pub fn bus_dir(&self) -> &std::path::Path {
        &self.inner.bus_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn zero_key_base64() -> String {
        BASE64.encode([0u8; 32])
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            bus_dir: Some(dir.to_path_buf()),
            ..Config::default()
        }
    }

    fn spawn(dir: &std::path::Path, name: &str) -> Coordinator {
        let coordinator = Coordinator::new(name, ThreadMode::Multi, test_config(dir)).unwrap();
        coordinator.set_key_file(&zero_key_base64()).unwrap();
        coordinator
    }

    #[test]
    fn test_new_publishes_marker_and_creates_inbox() {
        let dir = tempdir().unwrap();
        let coordinator = spawn(dir.path(), "alice");
        assert!(dir.path().join("access_registry").join("alice.oregistry").exists());
        assert!(dir.path().join("alice").is_dir());
        coordinator.kill().unwrap();
    }

    #[test]
    fn test_set_key_file_rejects_short_key() {
        let dir = tempdir().unwrap();
        let coordinator = Coordinator::new("alice", ThreadMode::Multi, test_config(dir.path())).unwrap();
        let short = BASE64.encode([0u8; 16]);
        let err = coordinator.set_key_file(&short).unwrap_err();
        assert!(matches!(err, SpeedError::InvalidKey(_)));
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let dir = tempdir().unwrap();
        let coordinator = spawn(dir.path(), "alice");
        let err = coordinator.send("hi", "ghost").unwrap_err();
        assert!(matches!(err, SpeedError::UnknownPeer(_)));
        coordinator.kill().unwrap();
    }

    #[test]
    fn test_handshake_and_round_trip_message_s4() {
        let dir = tempdir().unwrap();
        let alice = spawn(dir.path(), "alice");
        let bob = spawn(dir.path(), "bob");

        let (tx, rx) = mpsc::channel();
        bob.set_callback(Arc::new(move |msg: DecodedMessage| {
            let _ = tx.send(msg);
        }));

        alice.start(ThreadMode::Multi).unwrap();
        bob.start(ThreadMode::Multi).unwrap();

        bob.add_process("alice").unwrap();

        // First send from alice fails: alice hasn't authorized bob yet and
        // the handshake hasn't completed.
        let err = alice.send("hello", "bob").unwrap_err();
        assert!(matches!(err, SpeedError::UnknownPeer(_)) || matches!(err, SpeedError::NotAuthorized(_)));

        alice.add_process("bob").unwrap();

        // Give the watchers time to exchange CON_REQ/CON_RES.
        let mut delivered = None;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(50));
            if alice.send("hello", "bob").is_ok() {
                if let Ok(msg) = rx.recv_timeout(Duration::from_millis(200)) {
                    delivered = Some(msg);
                    break;
                }
            }
        }

        let msg = delivered.expect("bob should have received alice's message");
        assert_eq!(msg.sender_name, "alice");
        assert_eq!(msg.payload_text, "hello");

        alice.kill().unwrap();
        bob.kill().unwrap();
    }

    #[test]
    fn test_kill_is_idempotent_and_removes_marker() {
        let dir = tempdir().unwrap();
        let coordinator = spawn(dir.path(), "alice");
        coordinator.start(ThreadMode::Multi).unwrap();
        coordinator.kill().unwrap();
        coordinator.kill().unwrap();
        assert!(!dir.path().join("access_registry").join("alice.oregistry").exists());
    }
}

//! Per-peer executor pool (§4.E).
//!
//! One worker thread per *sender* (never per receiver — see the routing
//! note on [`Task::sender`]). Each worker owns a reorder buffer keyed by
//! `seq_num` so that out-of-order filesystem events still yield strictly
//! increasing per-sender delivery. Grounded on the dedicated worker-thread
//! shape of this codebase's background-worker pattern (channel + atomic
//! shutdown flag + join-on-drop), generalized here to a bounded reorder
//! buffer guarded by a mutex/condvar pair instead of a plain channel, since
//! delivery order — not just draining — is the contract.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::SpeedError;

/// One unit of work routed to a peer's executor: the decrypted sender name
/// that identifies *which* executor owns it, the frame's sequence number for
/// reorder-buffer placement, and the on-disk path to process.
#[derive(Debug, Clone)]
pub struct Task {
    /// Decrypted sender name. Routing MUST use this field, not the
    /// filename's destination capture group (§9 open question 1).
    pub sender: String,
    pub seq_num: u64,
    pub path: PathBuf,
}

struct ReorderState {
    buffer: BTreeMap<u64, Task>,
    next_expected: u64,
}

struct SharedState {
    name: String,
    state: Mutex<ReorderState>,
    has_work: Condvar,
    not_full: Condvar,
    stop_flag: AtomicBool,
    capacity: usize,
    idle_timeout: Duration,
    process_fn: Arc<dyn Fn(Task) + Send + Sync>,
}

struct PeerExecutor {
    shared: Arc<SharedState>,
    running: AtomicBool,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerExecutor {
    fn new(name: String, capacity: usize, idle_timeout: Duration, process_fn: Arc<dyn Fn(Task) + Send + Sync>) -> Self {
        Self {
            shared: Arc::new(SharedState {
                name,
                state: Mutex::new(ReorderState {
                    buffer: BTreeMap::new(),
                    next_expected: 0,
                }),
                has_work: Condvar::new(),
                not_full: Condvar::new(),
                stop_flag: AtomicBool::new(false),
                capacity,
                idle_timeout,
                process_fn,
            }),
            running: AtomicBool::new(false),
            thread_handle: Mutex::new(None),
        }
    }

    /// Ensure exactly one worker thread is running for this peer, spawning
    /// one if the previous worker exited on idle timeout.
    fn ensure_running(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            log::debug!("spawning executor worker for {}", self.shared.name);
            let shared = Arc::clone(&self.shared);
            let this = Arc::clone(self);
            let handle = thread::spawn(move || {
                worker_loop(&shared);
                this.running.store(false, Ordering::SeqCst);
                log::debug!("executor worker for {} exited", shared.name);
            });
            *self.thread_handle.lock().expect("thread handle lock poisoned") = Some(handle);
        }
    }

    fn enqueue(&self, task: Task) -> Result<(), SpeedError> {
        let mut guard = self.shared.state.lock().expect("reorder state lock poisoned");
        while guard.buffer.len() >= self.shared.capacity {
            guard = self
                .shared
                .not_full
                .wait(guard)
                .expect("reorder state lock poisoned");
        }
        guard.buffer.insert(task.seq_num, task);
        self.shared.has_work.notify_one();
        Ok(())
    }

    /// Non-blocking variant: fails with `QueueFull` instead of blocking.
    fn try_enqueue(&self, task: Task) -> Result<(), SpeedError> {
        let mut guard = self.shared.state.lock().expect("reorder state lock poisoned");
        if guard.buffer.len() >= self.shared.capacity {
            log::warn!("executor queue full for {}", self.shared.name);
            return Err(SpeedError::QueueFull(self.shared.name.clone()));
        }
        guard.buffer.insert(task.seq_num, task);
        self.shared.has_work.notify_one();
        Ok(())
    }

    fn stop(&self) {
        log::debug!("stopping executor for {}", self.shared.name);
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        self.shared.has_work.notify_all();
        if let Some(handle) = self.thread_handle.lock().expect("thread handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Arc<SharedState>) {
    loop {
        let mut guard = shared.state.lock().expect("reorder state lock poisoned");
        let task = loop {
            if shared.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Some(task) = pop_next_expected(&mut guard) {
                break Some(task);
            }
            let (new_guard, timeout) = shared
                .has_work
                .wait_timeout(guard, shared.idle_timeout)
                .expect("reorder state lock poisoned");
            guard = new_guard;
            if timeout.timed_out() && guard.buffer.is_empty() && !shared.stop_flag.load(Ordering::SeqCst) {
                return;
            }
        };
        drop(guard);
        shared.not_full.notify_one();

        if let Some(task) = task {
            log::trace!("{} dequeued seq {}", shared.name, task.seq_num);
            (shared.process_fn)(task);
        }
    }
}

fn pop_next_expected(state: &mut ReorderState) -> Option<Task> {
    let task = state.buffer.remove(&state.next_expected)?;
    state.next_expected += 1;
    Some(task)
}

/// Owns one [`PeerExecutor`] per observed sender name.
pub struct ExecutorPool {
    executors: Mutex<HashMap<String, Arc<PeerExecutor>>>,
    capacity: usize,
    idle_timeout: Duration,
    process_fn: Arc<dyn Fn(Task) + Send + Sync>,
}

impl ExecutorPool {
    pub fn new(capacity: usize, idle_timeout: Duration, process_fn: Arc<dyn Fn(Task) + Send + Sync>) -> Self {
        Self {
            executors: Mutex::new(HashMap::new()),
            capacity,
            idle_timeout,
            process_fn,
        }
    }

    /// Route `task` to the executor for `task.sender`, spawning a worker if
    /// none is currently running for that peer. Blocks if that peer's
    /// buffer is at capacity.
    pub fn route(&self, task: Task) -> Result<(), SpeedError> {
        let executor = self.executor_for(&task.sender);
        executor.enqueue(task)
    }

    /// Non-blocking variant of [`ExecutorPool::route`].
    pub fn try_route(&self, task: Task) -> Result<(), SpeedError> {
        let executor = self.executor_for(&task.sender);
        executor.try_enqueue(task)
    }

    fn executor_for(&self, sender: &str) -> Arc<PeerExecutor> {
        let mut map = self.executors.lock().expect("executor map lock poisoned");
        let executor = map
            .entry(sender.to_string())
            .or_insert_with(|| {
                log::debug!("creating executor for new peer {sender}");
                Arc::new(PeerExecutor::new(
                    sender.to_string(),
                    self.capacity,
                    self.idle_timeout,
                    Arc::clone(&self.process_fn),
                ))
            })
            .clone();
        executor.ensure_running();
        executor
    }

    /// Stop every worker, join its thread, and clear the executor map.
    /// Buffered-but-unprocessed tasks are discarded; their files remain on
    /// disk for a subsequent run, per §4.E.
    pub fn stop_all(&self) {
        let executors: Vec<Arc<PeerExecutor>> = {
            let mut map = self.executors.lock().expect("executor map lock poisoned");
            map.drain().map(|(_, v)| v).collect()
        };
        log::info!("stopping {} executor(s)", executors.len());
        for executor in executors {
            executor.stop();
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn collecting_pool(capacity: usize) -> (ExecutorPool, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = ExecutorPool::new(
            capacity,
            StdDuration::from_millis(200),
            Arc::new(move |task: Task| {
                let _ = tx.lock().expect("channel lock poisoned").send(task);
            }),
        );
        (pool, rx)
    }

    #[test]
    fn test_single_sender_delivered_in_seq_order() {
        let (pool, rx) = collecting_pool(16);
        pool.route(Task { sender: "alpha".into(), seq_num: 2, path: "2".into() }).unwrap();
        pool.route(Task { sender: "alpha".into(), seq_num: 0, path: "0".into() }).unwrap();
        pool.route(Task { sender: "alpha".into(), seq_num: 1, path: "1".into() }).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv_timeout(StdDuration::from_secs(2)).unwrap().seq_num);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_multiple_senders_each_fifo_independently() {
        let (pool, rx) = collecting_pool(16);
        for (sender, seq) in [("alpha", 0), ("beta", 0), ("alpha", 1), ("beta", 1), ("alpha", 2)] {
            pool.route(Task { sender: sender.into(), seq_num: seq, path: "x".into() }).unwrap();
        }

        let mut by_sender: HashMap<String, Vec<u64>> = HashMap::new();
        for _ in 0..5 {
            let task = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
            by_sender.entry(task.sender).or_default().push(task.seq_num);
        }
        assert_eq!(by_sender["alpha"], vec![0, 1, 2]);
        assert_eq!(by_sender["beta"], vec![0, 1]);
    }

    #[test]
    fn test_stop_all_joins_workers_without_hanging() {
        let (pool, _rx) = collecting_pool(16);
        pool.route(Task { sender: "alpha".into(), seq_num: 0, path: "0".into() }).unwrap();
        pool.stop_all();
    }

    #[test]
    fn test_try_route_returns_queue_full_when_buffer_saturated() {
        let (pool, _rx) = collecting_pool(1);
        // Hold the only slot with a sequence number the worker is not yet
        // looking for by never satisfying next_expected.
        pool.route(Task { sender: "alpha".into(), seq_num: 5, path: "5".into() }).unwrap();
        let err = pool
            .try_route(Task { sender: "alpha".into(), seq_num: 6, path: "6".into() })
            .unwrap_err();
        assert!(matches!(err, SpeedError::QueueFull(_)));
    }
}

//! Fixed-size decode worker pool with inline execution and per-key deduplication.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::config::DecodePoolConfig;
use crate::stats::TelemetrySink;

use super::task::{DecodeKey, DecodeOutcome, DecodeTask};

/// How a caller wants a task executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Async,
    /// Inline when the task is small and its data complete, else queued.
    SyncIfFast,
    /// Always on the calling thread, or wait for the identical task already running.
    Sync,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<DecodeTask>,
    /// Live tasks and the extra completion channels of callers that joined them.
    in_flight: HashMap<DecodeKey, Vec<Sender<DecodeOutcome>>>,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    task_done: Condvar,
    executed: AtomicU64,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Shared {
    fn execute(&self, task: DecodeTask, ran_sync: bool) {
        let key = task.key();
        let own = task.completion();
        let outcome = task.run(ran_sync);
        self.executed.fetch_add(1, Ordering::Relaxed);

        let waiters = {
            let mut state = self.state.lock();
            let waiters = state.in_flight.remove(&key).unwrap_or_default();
            self.telemetry.update_pending_decodes(state.queue.len());
            self.task_done.notify_all();
            waiters
        };

        // Receivers may be gone if the owning loader was dropped meanwhile.
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        let _ = own.send(outcome);
    }

    fn next_task(&self) -> Option<DecodeTask> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                self.telemetry.update_pending_decodes(state.queue.len());
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            self.work_ready.wait(&mut state);
        }
    }
}

#[derive(Debug)]
pub struct DecodePool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sync_pixel_limit: u64,
}

impl DecodePool {
    pub fn new(config: &DecodePoolConfig, telemetry: Arc<dyn TelemetrySink>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            work_ready: Condvar::new(),
            task_done: Condvar::new(),
            executed: AtomicU64::new(0),
            telemetry,
        });

        let count = config.worker_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("image-decode-{id}"))
                .spawn(move || {
                    while let Some(task) = shared.next_task() {
                        shared.execute(task, false);
                    }
                    trace!(target: "imgcache::decode", worker = id, "decode worker exiting");
                })
                .with_context(|| format!("spawning decode worker {id}"))?;
            workers.push(handle);
        }
        debug!(target: "imgcache::decode", workers = count, "decode pool started");

        Ok(Self { shared, workers: Mutex::new(workers), sync_pixel_limit: config.sync_decode_pixel_limit })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Tasks executed so far, inline or on workers.
    pub fn executed_count(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Execute or queue `task`. Returns `true` if the work finished before returning.
    ///
    /// A task whose key is already live joins it: its completion channel receives the live
    /// task's outcome and no second decode happens.
    pub fn run(&self, task: DecodeTask, schedule: Schedule) -> bool {
        let key = task.key();
        let mut state = self.shared.state.lock();

        if state.shutdown {
            warn!(target: "imgcache::decode", image = %key.image, "pool stopped; decoding inline");
            drop(state);
            self.shared.execute(task, true);
            return true;
        }

        if state.in_flight.contains_key(&key) {
            let queued = state.queue.iter().position(|queued| queued.key() == key);
            if let Some(waiters) = state.in_flight.get_mut(&key) {
                waiters.push(task.completion());
            }
            if schedule != Schedule::Sync {
                trace!(target: "imgcache::decode", image = %key.image, "joined live decode");
                return false;
            }
            // Pull a queued duplicate forward, or wait for the worker already running it.
            if let Some(stolen) = queued.and_then(|index| state.queue.remove(index)) {
                drop(state);
                self.shared.execute(stolen, true);
                return true;
            }
            while state.in_flight.contains_key(&key) {
                self.shared.task_done.wait(&mut state);
            }
            return true;
        }

        let inline = match schedule {
            Schedule::Sync => true,
            Schedule::SyncIfFast => task.prefers_sync(self.sync_pixel_limit),
            Schedule::Async => false,
        };
        state.in_flight.insert(key, Vec::new());

        if inline {
            drop(state);
            self.shared.execute(task, true);
            return true;
        }

        state.queue.push_back(task);
        self.shared.telemetry.update_pending_decodes(state.queue.len());
        self.shared.work_ready.notify_one();
        false
    }

    /// Stop accepting queued work, let workers drain the queue and join them.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!(target: "imgcache::decode", "decode worker panicked");
            }
        }
        debug!(target: "imgcache::decode", "decode pool stopped");
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

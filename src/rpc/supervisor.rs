// Worker Pool and Supervisor
//
// Each worker slot is a dedicated OS thread. The slot thread runs the
// worker and starts a fresh one when it panics, sleeping first when
// workers crash faster than the restart policy allows. Calls are routed
// by peer address so a client always reaches the same handle cache.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::Control;
use super::worker::{Exit, Job, TableLoader, Worker, WorkerMessage};
use crate::config::ServerConfig;

/// Back-off after the first restart storm
const INITIAL_BACKOFF: Duration = Duration::from_secs(60);

/// Longest back-off between restart storms
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Restarts are counted within windows of this length
const RESTART_WINDOW: Duration = Duration::from_secs(1);

/// Decides how long to wait before restarting a crashed worker
#[derive(Debug)]
pub struct RestartPolicy {
    limit: u32,
    state: Mutex<RestartState>,
}

#[derive(Debug)]
struct RestartState {
    window_start: Option<Instant>,
    restarts: u32,
    backoff: Duration,
}

impl RestartPolicy {
    /// More than two restarts per worker within one window is a storm
    pub fn new(workers: usize) -> Self {
        RestartPolicy {
            limit: 2 * workers as u32,
            state: Mutex::new(RestartState {
                window_start: None,
                restarts: 0,
                backoff: INITIAL_BACKOFF,
            }),
        }
    }

    /// Record a restart at `now` and return how long to wait before it
    pub fn on_restart(&self, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.window_start {
            Some(start) if now.duration_since(start) < RESTART_WINDOW => {
                state.restarts += 1;
                if state.restarts > self.limit {
                    let wait = state.backoff;
                    state.backoff = (state.backoff * 2).min(MAX_BACKOFF);
                    return wait;
                }
            }
            _ => {
                state.window_start = Some(now);
                state.restarts = 1;
                state.backoff = INITIAL_BACKOFF;
            }
        }
        Duration::ZERO
    }
}

/// Fixed set of supervised workers
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<WorkerMessage>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.workers` workers
    ///
    /// Fails if a worker cannot load its first export table.
    pub fn start(config: Arc<ServerConfig>, control: Arc<Control>, loader: TableLoader) -> Result<Self> {
        let policy = Arc::new(RestartPolicy::new(config.workers));
        let mut senders = Vec::with_capacity(config.workers);
        let mut threads = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let worker = Worker::new(id, config.clone(), control.clone(), loader.clone())
                .with_context(|| format!("Failed to start worker {}", id))?;
            let (tx, rx) = mpsc::unbounded_channel();
            let slot = Slot {
                id,
                config: config.clone(),
                control: control.clone(),
                loader: loader.clone(),
                policy: policy.clone(),
            };
            let thread = thread::Builder::new()
                .name(format!("unfsd-worker-{}", id))
                .spawn(move || slot.supervise(worker, rx))
                .context("Failed to spawn worker thread")?;
            senders.push(tx);
            threads.push(thread);
        }

        info!("Started {} workers", config.workers);
        Ok(WorkerPool {
            senders,
            threads: Mutex::new(threads),
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Worker serving `peer`
    pub fn worker_for(&self, peer: IpAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        peer.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a call on the worker serving its peer
    ///
    /// Hands the job back if that worker is gone.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let idx = self.worker_for(job.peer.ip());
        self.senders[idx].send(WorkerMessage::Call(job)).map_err(|e| match e.0 {
            WorkerMessage::Call(job) => job,
            _ => unreachable!("sent a call"),
        })
    }

    /// Make idle workers look at the control flags
    pub fn wake_all(&self) {
        for tx in &self.senders {
            let _ = tx.send(WorkerMessage::Wake);
        }
    }

    /// Stop every worker after its current call and wait for it
    pub fn shutdown(&self) {
        for tx in &self.senders {
            let _ = tx.send(WorkerMessage::Shutdown);
        }
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for thread in threads {
            if thread.join().is_err() {
                error!("Worker thread ended abnormally");
            }
        }
        info!("All workers stopped");
    }
}

struct Slot {
    id: usize,
    config: Arc<ServerConfig>,
    control: Arc<Control>,
    loader: TableLoader,
    policy: Arc<RestartPolicy>,
}

impl Slot {
    fn supervise(self, mut worker: Worker, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        loop {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&mut rx)));
            match outcome {
                Ok(Exit::Shutdown) | Ok(Exit::Disconnected) => return,
                Err(_) => error!("Worker {} crashed", self.id),
            }

            // The crashed call's reply channel is dropped with it; later
            // calls stay queued until the replacement is up
            loop {
                let wait = self.policy.on_restart(Instant::now());
                if !wait.is_zero() {
                    warn!(
                        "Workers restarting too quickly, backing off for {}s",
                        wait.as_secs()
                    );
                    thread::sleep(wait);
                }
                match Worker::new(self.id, self.config.clone(), self.control.clone(), self.loader.clone()) {
                    Ok(fresh) => {
                        worker = fresh;
                        break;
                    }
                    Err(e) => error!("Failed to restart worker {}: {:#}", self.id, e),
                }
            }
            info!("Worker {} restarted", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_backs_off() {
        let policy = RestartPolicy::new(1);
        let t0 = Instant::now();

        // Two restarts per worker within a second are tolerated
        assert_eq!(policy.on_restart(t0), Duration::ZERO);
        assert_eq!(policy.on_restart(t0 + Duration::from_millis(100)), Duration::ZERO);
        assert_eq!(policy.on_restart(t0 + Duration::from_millis(200)), Duration::from_secs(60));
        assert_eq!(policy.on_restart(t0 + Duration::from_millis(300)), Duration::from_secs(120));

        // A new window starts over
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(policy.on_restart(t1), Duration::ZERO);
        assert_eq!(policy.on_restart(t1), Duration::ZERO);
        assert_eq!(policy.on_restart(t1), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RestartPolicy::new(1);
        let t0 = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = policy.on_restart(t0);
        }
        assert_eq!(last, MAX_BACKOFF);
    }
}

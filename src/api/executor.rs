//! Purpose: Single-worker task executor that serializes work against the shared connection.
//! Exports: `Executor`.
//! Role: Gives connection exclusivity without per-call locking; replaced wholesale on faults.
//! Invariants: At most one job runs at a time per worker; jobs run in submission order.
//! Invariants: A job submitted to a replaced worker is abandoned (dropped without running).
//! Invariants: `replace` only succeeds for the generation it names, so racing invalidations create one worker.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Worker {
    generation: u64,
    jobs: mpsc::UnboundedSender<Job>,
}

pub struct Executor {
    live: Arc<AtomicU64>,
    worker: Mutex<Worker>,
}

impl Executor {
    /// Spawns the first worker; must be called inside a tokio runtime.
    pub fn new() -> Self {
        let live = Arc::new(AtomicU64::new(0));
        let jobs = spawn_worker(0, Arc::clone(&live));
        Self {
            live,
            worker: Mutex::new(Worker { generation: 0, jobs }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    /// Queue a job on the current worker. The job is told which generation
    /// it runs under so it can invalidate exactly that worker on a fault.
    /// Returns the generation, or `None` if the worker is gone.
    pub fn submit<F, Fut>(&self, job: F) -> Option<u64>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let worker = self.lock();
        let generation = worker.generation;
        worker.jobs.send(Box::pin(job(generation))).ok()?;
        Some(generation)
    }

    /// Swap in a fresh worker if `expected` is still current.
    pub fn replace(&self, expected: u64) -> bool {
        let mut worker = self.lock();
        if worker.generation != expected {
            return false;
        }
        let next = expected.wrapping_add(1);
        self.live.store(next, Ordering::Release);
        *worker = Worker {
            generation: next,
            jobs: spawn_worker(next, Arc::clone(&self.live)),
        };
        debug!(from = expected, to = next, "replaced executor worker");
        true
    }

    fn lock(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn spawn_worker(generation: u64, live: Arc<AtomicU64>) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if live.load(Ordering::Acquire) != generation {
                debug!(generation, "abandoning job on replaced worker");
                continue;
            }
            job.await;
        }
    });
    tx
}

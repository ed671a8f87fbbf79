use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;

/// Hard cap on worker threads regardless of core count.
const MAX_WORKERS: usize = 32;

type Job = Box<dyn FnOnce() + Send + 'static>;

static SHARED_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

/// A bounded pool of worker threads with a FIFO job queue.
///
/// Synchronous user functions and nested-runtime escapes run here so they cannot block a
/// cooperative scheduler thread. The pool is bounded: under high fan-out, submissions queue for
/// a free worker instead of spawning unbounded OS threads.
///
/// Submissions carry no deadline. A caller that stops waiting for a result detaches from it,
/// but the job still occupies a worker until it returns.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// The default pool size: a little headroom beyond the core count, capped at [`MAX_WORKERS`].
pub fn default_pool_size() -> usize {
    (num_cpus::get() + 4).min(MAX_WORKERS)
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_WORKERS);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("recache-worker-{i}"))
                    .spawn(move || loop {
                        let job = receiver.lock().recv();
                        match job {
                            Ok(job) => {
                                // a panicking job must not take the worker down with it
                                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                    tracing::warn!("worker pool job panicked");
                                }
                            }
                            // all senders are gone, the pool is shutting down
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// The process-wide pool, lazily created on first use and shared across all bridges.
    pub fn shared() -> Arc<WorkerPool> {
        SHARED_POOL
            .get_or_init(|| Arc::new(WorkerPool::new(default_pool_size())))
            .clone()
    }

    /// Submits a job, returning `false` if the pool has shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        metric!(counter("executor.pool.submit") += 1);
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stops accepting jobs, drains the queue, and joins all workers.
    ///
    /// Called once at process end or test teardown.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        for worker in self.workers.lock().drain(..) {
            worker.join().ok();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.lock().take());
    }
}

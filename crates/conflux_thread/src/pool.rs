//! Thread pool implementation.

use conflux_queue::{BoundedQueue, QueueResult};
use std::{
    num::NonZeroUsize,
    panic,
    sync::Arc,
    thread::{self, JoinHandle},
};

/// A job submitted to a [`ThreadPool`]: a closure executed once on
/// whichever worker thread dequeues it first.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads executing jobs from a shared bounded
/// queue.
///
/// All coordination happens through the queue: jobs are dispatched in FIFO
/// order (though they may *complete* in any order), and dropping the pool
/// closes the queue, waking every worker so it can drain the remaining
/// jobs and exit.
///
/// # Examples
/// ```
/// # use conflux_thread::ThreadPool;
/// # use std::{num::NonZeroUsize, sync::{Arc, atomic::{AtomicUsize, Ordering}}};
/// #
/// let pool = ThreadPool::new(
///     NonZeroUsize::new(4).unwrap(),
///     NonZeroUsize::new(16).unwrap(),
/// );
///
/// let count = Arc::new(AtomicUsize::new(0));
/// for _ in 0..16 {
///     let count = Arc::clone(&count);
///     pool.run(move || {
///         count.fetch_add(1, Ordering::Relaxed);
///     })
///     .unwrap();
/// }
///
/// // Dropping the pool waits for every submitted job to finish.
/// drop(pool);
/// assert_eq!(count.load(Ordering::Relaxed), 16);
/// ```
#[derive(Debug)]
pub struct ThreadPool {
    queue: Arc<BoundedQueue<Job>>,
    workers: Vec<Worker>,
}

/// A cloneable handle for submitting jobs to a [`ThreadPool`] from any
/// thread, including the pool's own workers.
///
/// The handle does not keep the workers alive: once the owning pool is
/// dropped, submissions fail with [`Cancelled`](conflux_queue::QueueError::Cancelled).
#[derive(Clone, Debug)]
pub struct JobSender {
    queue: Arc<BoundedQueue<Job>>,
}

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a pool with `n_workers` threads consuming from a job queue
    /// holding up to `queue_capacity` pending jobs.
    ///
    /// # Panics
    /// If `queue_capacity` is smaller than `n_workers`.
    pub fn new(n_workers: NonZeroUsize, queue_capacity: NonZeroUsize) -> Self {
        assert!(
            queue_capacity >= n_workers,
            "job queue must have at least one slot per worker"
        );

        let queue = Arc::new(BoundedQueue::new(queue_capacity));

        let workers = (0..n_workers.get() as u64)
            .map(|worker_id| Worker::spawn(worker_id, Arc::clone(&queue)))
            .collect();

        Self { queue, workers }
    }

    /// Returns the number of worker threads in the pool.
    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    /// Returns the number of jobs waiting in the queue (not counting jobs
    /// currently executing).
    pub fn work_len(&self) -> usize {
        self.queue.len()
    }

    /// Submits a job for execution, blocking while the job queue is full.
    ///
    /// # Errors
    /// [`Cancelled`](conflux_queue::QueueError::Cancelled) if the pool is
    /// shutting down.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) -> QueueResult<()> {
        self.queue.put(Box::new(job))
    }

    /// Returns a handle for submitting jobs without borrowing the pool.
    pub fn sender(&self) -> JobSender {
        JobSender {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl Drop for ThreadPool {
    /// Closes the job queue and joins all workers.
    ///
    /// Jobs already queued are still executed before the workers exit; new
    /// submissions are rejected.
    fn drop(&mut self) {
        self.queue.close();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl JobSender {
    /// Submits a job for execution, blocking while the job queue is full.
    ///
    /// # Errors
    /// [`Cancelled`](conflux_queue::QueueError::Cancelled) if the pool is
    /// shutting down.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) -> QueueResult<()> {
        self.queue.put(Box::new(job))
    }
}

impl Worker {
    /// Spawns a worker thread looping on the job queue until the queue is
    /// closed and drained.
    fn spawn(worker_id: u64, queue: Arc<BoundedQueue<Job>>) -> Self {
        let handle = thread::spawn(move || {
            conflux_log::trace!("Worker {worker_id} spawned");

            while let Ok(job) = queue.get() {
                if let Err(cause) = panic::catch_unwind(panic::AssertUnwindSafe(job)) {
                    conflux_log::error!("Job panicked: {cause:?}");
                }
            }

            conflux_log::trace!("Worker {worker_id} terminating");
        });
        Self { handle }
    }

    fn join(self) {
        if let Err(err) = self.handle.join() {
            conflux_log::error!("Worker thread failed to join: {err:?}");
        }
    }
}

//! A closable bounded concurrent FIFO queue.
//!
//! [`BoundedQueue`] transports values between any number of producer and
//! consumer threads through a fixed-capacity ring buffer. Producers block
//! while the queue lacks room for their batch, consumers block while it
//! holds less data than they ask for, and [`BoundedQueue::close`] releases
//! every waiter. A closed queue rejects all further puts but keeps serving
//! gets while buffered data remains, so consumers can drain it before
//! shutting down.
//!
//! # Examples
//! ```
//! # use conflux_queue::{BoundedQueue, QueueError};
//! # use std::{num::NonZeroUsize, sync::Arc, thread};
//! #
//! let queue = Arc::new(BoundedQueue::new(NonZeroUsize::new(4).unwrap()));
//!
//! let consumer = {
//!     let queue = Arc::clone(&queue);
//!     thread::spawn(move || {
//!         let mut received = Vec::new();
//!         while let Ok(value) = queue.get() {
//!             received.push(value);
//!         }
//!         received
//!     })
//! };
//!
//! queue.put_n(&[1, 2, 3]).unwrap();
//! queue.close();
//!
//! // The consumer drains the remaining values, then sees `Cancelled`.
//! assert_eq!(consumer.join().unwrap(), vec![1, 2, 3]);
//! assert_eq!(queue.get(), Err(QueueError::Cancelled));
//! ```

use conflux_containers::RingQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    fmt,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

pub type QueueResult<T> = Result<T, QueueError>;

/// Errors returned by the blocking queue operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed before the operation could complete.
    Cancelled,
    /// The deadline of a timed operation expired.
    TimedOut,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "Queue was closed"),
            Self::TimedOut => write!(f, "Timed out waiting on queue"),
        }
    }
}

impl std::error::Error for QueueError {}

struct Inner<T> {
    ring: RingQueue<T>,
    closed: bool,
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// All state lives behind a single mutex with two condition variables:
/// `has_space` wakes blocked producers and `has_data` wakes blocked
/// consumers. Closing broadcasts on both, so no waiter outlives the queue's
/// useful life.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    has_data: Condvar,
    has_space: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates an open queue with room for `capacity` values.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: RingQueue::with_capacity(capacity.get()),
                closed: false,
            }),
            has_data: Condvar::new(),
            has_space: Condvar::new(),
            capacity: capacity.get(),
        }
    }

    /// Returns the fixed capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of values currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Whether the queue currently buffers no values.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Inserts one value, blocking while the queue is full.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed before the value
    /// could be inserted.
    pub fn put(&self, value: T) -> QueueResult<()> {
        let mut inner = self.wait_for_space(1, None)?;
        inner.ring.push_back(value);
        self.has_data.notify_one();
        Ok(())
    }

    /// Like [`put`](Self::put), but gives up once `timeout` has elapsed.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed while waiting,
    /// [`QueueError::TimedOut`] if the deadline expires first.
    pub fn put_timed(&self, value: T, timeout: Duration) -> QueueResult<()> {
        let mut inner = self.wait_for_space(1, Some(Instant::now() + timeout))?;
        inner.ring.push_back(value);
        self.has_data.notify_one();
        Ok(())
    }

    /// Inserts all of `values` in order, blocking until the queue has room
    /// for the whole batch.
    ///
    /// The batch is inserted atomically: no other producer's values end up
    /// interleaved with it.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed before the batch
    /// could be inserted.
    ///
    /// # Panics
    /// If `values.len()` exceeds the queue capacity (such a put could never
    /// succeed).
    pub fn put_n(&self, values: &[T]) -> QueueResult<()>
    where
        T: Clone,
    {
        self.put_batch(values, None)
    }

    /// Like [`put_n`](Self::put_n), but gives up once `timeout` has
    /// elapsed.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed while waiting,
    /// [`QueueError::TimedOut`] if the deadline expires first.
    ///
    /// # Panics
    /// If `values.len()` exceeds the queue capacity.
    pub fn put_n_timed(&self, values: &[T], timeout: Duration) -> QueueResult<()>
    where
        T: Clone,
    {
        self.put_batch(values, Some(Instant::now() + timeout))
    }

    /// Removes and returns the front value, blocking while the queue is
    /// empty.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed and holds no data.
    pub fn get(&self) -> QueueResult<T> {
        let mut inner = self.wait_for_data(1, None)?;
        let value = take_front(&mut inner);
        self.has_space.notify_one();
        Ok(value)
    }

    /// Like [`get`](Self::get), but gives up once `timeout` has elapsed.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed with no data,
    /// [`QueueError::TimedOut`] if the deadline expires first.
    pub fn get_timed(&self, timeout: Duration) -> QueueResult<T> {
        let mut inner = self.wait_for_data(1, Some(Instant::now() + timeout))?;
        let value = take_front(&mut inner);
        self.has_space.notify_one();
        Ok(value)
    }

    /// Removes and returns exactly `n` values in FIFO order, blocking until
    /// that many are buffered.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed while holding fewer
    /// than `n` values.
    ///
    /// # Panics
    /// If `n` exceeds the queue capacity.
    pub fn get_n(&self, n: usize) -> QueueResult<Vec<T>> {
        assert!(n <= self.capacity, "get batch exceeds queue capacity");
        let mut inner = self.wait_for_data(n, None)?;
        let values = take_batch(&mut inner, n);
        self.has_space.notify_one();
        Ok(values)
    }

    /// Like [`get_n`](Self::get_n), but gives up once `timeout` has
    /// elapsed.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed with insufficient
    /// data, [`QueueError::TimedOut`] if the deadline expires first.
    ///
    /// # Panics
    /// If `n` exceeds the queue capacity.
    pub fn get_n_timed(&self, n: usize, timeout: Duration) -> QueueResult<Vec<T>> {
        assert!(n <= self.capacity, "get batch exceeds queue capacity");
        let mut inner = self.wait_for_data(n, Some(Instant::now() + timeout))?;
        let values = take_batch(&mut inner, n);
        self.has_space.notify_one();
        Ok(values)
    }

    /// Removes and returns up to `max` values, blocking only while the
    /// queue is empty.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] if the queue is closed and holds no data.
    pub fn get_at_most(&self, max: usize) -> QueueResult<Vec<T>> {
        let mut inner = self.wait_for_data(1, None)?;
        let n = inner.ring.len().min(max);
        let values = take_batch(&mut inner, n);
        self.has_space.notify_one();
        Ok(values)
    }

    /// Closes the queue, waking every blocked producer and consumer.
    ///
    /// Closing is idempotent. Buffered values stay available to `get`
    /// operations that can be satisfied from them.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.has_data.notify_all();
        self.has_space.notify_all();
    }

    /// Reopens a closed queue, dropping any leftover values.
    ///
    /// Only valid while the queue is quiescent: the caller must guarantee
    /// that no other thread is blocked on or concurrently using the queue.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.ring.clear();
        inner.closed = false;
    }

    fn put_batch(&self, values: &[T], deadline: Option<Instant>) -> QueueResult<()>
    where
        T: Clone,
    {
        assert!(
            values.len() <= self.capacity,
            "put batch exceeds queue capacity"
        );
        let mut inner = self.wait_for_space(values.len(), deadline)?;
        for value in values {
            inner.ring.push_back(value.clone());
        }
        self.has_data.notify_one();
        Ok(())
    }

    /// Blocks until the queue has at least `n` free slots. Close always
    /// wins over available space.
    fn wait_for_space(
        &self,
        n: usize,
        deadline: Option<Instant>,
    ) -> QueueResult<MutexGuard<'_, Inner<T>>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(QueueError::Cancelled);
            }
            if inner.ring.free() >= n {
                return Ok(inner);
            }
            match deadline {
                None => self.has_space.wait(&mut inner),
                Some(deadline) => {
                    let result = self.has_space.wait_until(&mut inner, deadline);
                    if result.timed_out() && !inner.closed && inner.ring.free() < n {
                        return Err(QueueError::TimedOut);
                    }
                }
            }
        }
    }

    /// Blocks until the queue holds at least `n` values. A closed queue
    /// still satisfies the wait while enough data remains.
    fn wait_for_data(
        &self,
        n: usize,
        deadline: Option<Instant>,
    ) -> QueueResult<MutexGuard<'_, Inner<T>>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.ring.len() >= n {
                return Ok(inner);
            }
            if inner.closed {
                return Err(QueueError::Cancelled);
            }
            match deadline {
                None => self.has_data.wait(&mut inner),
                Some(deadline) => {
                    let result = self.has_data.wait_until(&mut inner, deadline);
                    if result.timed_out() && inner.ring.len() < n && !inner.closed {
                        return Err(QueueError::TimedOut);
                    }
                }
            }
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

fn take_front<T>(inner: &mut Inner<T>) -> T {
    inner
        .ring
        .pop_front()
        .expect("queue cannot be empty after a successful data wait")
}

fn take_batch<T>(inner: &mut Inner<T>, n: usize) -> Vec<T> {
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(take_front(inner));
    }
    values
}

//! In-process render queue with a depth ceiling.
//!
//! Job ids travel through a bounded `tokio::sync::mpsc` channel whose receiver
//! is shared by all workers. Independently of the channel capacity, the queue
//! tracks how many ids were accepted but not yet picked up and refuses new
//! work once that count reaches `max_depth`.
//!
//! When the channel itself is momentarily full, the id is handed to a parked
//! send task so the submitter still returns immediately; only the start of
//! execution is delayed.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::registry::JobId;

/// Errors that can occur during queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Accepting the job would exceed the depth ceiling.
    #[error("Queue is full ({depth} jobs waiting)")]
    Full { depth: usize },

    /// The receiving side has been dropped.
    #[error("Queue is closed")]
    Closed,
}

/// Bounded FIFO of job ids shared by all workers.
#[derive(Debug)]
pub struct WorkQueue {
    tx: mpsc::Sender<JobId>,
    rx: Mutex<mpsc::Receiver<JobId>>,
    depth: AtomicUsize,
    max_depth: usize,
}

impl WorkQueue {
    /// Creates a queue with `capacity` channel slots and a `max_depth` ceiling.
    pub fn new(capacity: usize, max_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            max_depth: max_depth.max(1),
        }
    }

    /// Reserves a slot under the depth ceiling.
    ///
    /// Must be followed by [`push`](Self::push) or
    /// [`release`](Self::release).
    pub fn reserve(&self) -> Result<(), QueueError> {
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth < self.max_depth).then_some(depth + 1)
            })
            .map(|_| ())
            .map_err(|depth| QueueError::Full { depth })
    }

    /// Gives back a reserved slot that will not be pushed.
    pub fn release(&self) {
        self.decrement();
    }

    /// Pushes a job id into a previously reserved slot.
    ///
    /// Never waits for channel capacity.
    pub fn push(&self, id: JobId) -> Result<(), QueueError> {
        match self.tx.try_send(id) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(id)) => {
                debug!(job_id = %id, "Channel full, parking enqueue");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(id).await.is_err() {
                        error!(job_id = %id, "Queue closed before parked job could be enqueued");
                    }
                });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.decrement();
                Err(QueueError::Closed)
            }
        }
    }

    /// Waits for the next job id.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<JobId> {
        let id = self.rx.lock().await.recv().await?;
        self.decrement();
        Some(id)
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn decrement(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }
}

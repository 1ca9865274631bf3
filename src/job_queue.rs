use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use bytes::Bytes;
use tokio::{net::TcpStream, sync::Notify};

use crate::{IgnorePoisoned, OverflowPolicy};

/// One inbound connection together with the payload read from it.
///
/// Dropping a job closes its inbound connection.
#[derive(Debug)]
pub struct Job {
    pub inbound: TcpStream,
    pub peer: SocketAddr,
    pub payload: Bytes,
}

/// Outcome of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Queued after dropping the oldest job.
    Evicted,
    /// Not queued, the queue was full under [`OverflowPolicy::Reject`] or already closed.
    Rejected,
}

/// Bounded FIFO shared by the acceptor (producers) and the workers (consumers).
///
/// Insertion never waits. Removal waits until a job shows up or the queue is closed.
pub struct JobQueue<J = Job> {
    jobs: Mutex<VecDeque<J>>,
    capacity: usize,
    policy: OverflowPolicy,
    available: Notify,
    closed: AtomicBool,
}

impl<J> JobQueue<J> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "Queue capacity cannot be 0.");

        Self {
            jobs: Mutex::new(VecDeque::new()),
            capacity,
            policy,
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, job: J) -> Admission {
        if self.closed.load(Ordering::Acquire) {
            return Admission::Rejected;
        }

        let (admission, dropped) = {
            let mut jobs = self.jobs.lock().ignore_poisoned();
            if jobs.len() < self.capacity {
                jobs.push_back(job);
                (Admission::Queued, None)
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let oldest = jobs.pop_front();
                        jobs.push_back(job);
                        (Admission::Evicted, oldest)
                    }
                    OverflowPolicy::Reject => (Admission::Rejected, Some(job)),
                }
            }
        };

        // Closes the dropped job's connection outside the lock.
        drop(dropped);

        if admission != Admission::Rejected {
            self.available.notify_one();
        }
        admission
    }

    /// Takes the oldest job, waiting while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<J> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a `close` in between still wakes us.
            notified.as_mut().enable();

            if let Some(job) = self.try_dequeue() {
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<J> {
        self.jobs.lock().ignore_poisoned().pop_front()
    }

    /// Approximate length, good enough for the stats gauge.
    pub fn len(&self) -> usize {
        self.jobs.lock().ignore_poisoned().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops admitting jobs and wakes every waiting consumer.
    ///
    /// Jobs already queued are still handed out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::{
    connection::timed, ConnectionPool, Job, JobQueue, PooledConnection, RelayError, Stats,
};

/// Panic resistant busy marker for the stats gauge.
struct BusyGuard {
    stats: Arc<Stats>,
}

impl BusyGuard {
    fn enter(stats: &Arc<Stats>) -> Self {
        stats.worker_busy();
        Self {
            stats: Arc::clone(stats),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.stats.worker_idle();
    }
}

/// Performs one job's exchange with the target.
pub struct Forwarder {
    pool: Arc<ConnectionPool>,
    io_timeout: Duration,
    reply_buffer_size: usize,
}

impl Forwarder {
    pub fn new(pool: Arc<ConnectionPool>, io_timeout: Duration, reply_buffer_size: usize) -> Self {
        Self {
            pool,
            io_timeout,
            reply_buffer_size,
        }
    }

    /// Sends `payload` to the target and writes the single reply chunk to `inbound`.
    ///
    /// The outbound connection is released once the target answered, even if the
    /// reply cannot be delivered, and discarded if the exchange itself failed.
    pub async fn forward(
        &self,
        inbound: &mut TcpStream,
        peer: SocketAddr,
        payload: &[u8],
    ) -> Result<(), RelayError> {
        let mut connection = self.pool.acquire().await?;

        let reply = match self.exchange(&mut connection, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                self.pool.discard(connection);
                return Err(RelayError::Forward(e));
            }
        };
        self.pool.release(connection);

        timed(self.io_timeout, inbound.write_all(&reply))
            .await
            .map_err(|source| RelayError::ReplyWrite { peer, source })
    }

    async fn exchange(
        &self,
        connection: &mut PooledConnection,
        payload: &[u8],
    ) -> io::Result<Bytes> {
        let stream = connection.stream_mut();
        timed(self.io_timeout, stream.write_all(payload)).await?;

        // One bounded read: anything beyond the buffer or in later segments is not relayed.
        let mut reply = BytesMut::zeroed(self.reply_buffer_size);
        let read = timed(self.io_timeout, stream.read(&mut reply)).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "target closed the connection before replying",
            ));
        }

        reply.truncate(read);
        Ok(reply.freeze())
    }

    /// Runs a job to completion. Its inbound connection is closed exactly once on return.
    async fn handle(&self, job: Job, stats: &Stats) {
        let Job {
            mut inbound,
            peer,
            payload,
        } = job;

        match self.forward(&mut inbound, peer, &payload).await {
            Ok(()) => {
                debug!(%peer, bytes = payload.len(), "Relayed reply.");
                let _ = inbound.shutdown().await;
            }
            Err(e) => {
                stats.record_error();
                warn!(%peer, error = %e, "Job abandoned.");
            }
        }
    }
}

struct Worker {
    id: usize,
    join_handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(
        id: usize,
        queue: Arc<JobQueue>,
        forwarder: Arc<Forwarder>,
        stats: Arc<Stats>,
    ) -> Self {
        let join_handle = tokio::spawn(
            async move {
                debug!("Waiting for jobs.");

                while let Some(job) = queue.dequeue().await {
                    stats.set_queue_size(queue.len());
                    let _busy = BusyGuard::enter(&stats);
                    forwarder.handle(job, &stats).await;
                }

                debug!("Queue closed, shutting down.");
            }
            .instrument(info_span!("worker", id)),
        );

        Self { id, join_handle }
    }
}

/// Fixed set of long-lived workers draining the job queue.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            workers: 8,
            io_timeout: Duration::from_secs(30),
            reply_buffer_size: 64 * 1024,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits for every worker to exit, which happens once the queue is closed and drained.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.join_handle.await {
                error!(worker = worker.id, error = %e, "Worker terminated abnormally.");
            }
        }
    }
}

pub struct WorkerPoolBuilder {
    workers: usize,
    io_timeout: Duration,
    reply_buffer_size: usize,
}

impl WorkerPoolBuilder {
    pub fn workers(mut self, val: usize) -> Self {
        assert!(val > 0, "Worker count cannot be set to 0.");
        self.workers = val;
        self
    }

    pub fn io_timeout(mut self, val: Duration) -> Self {
        self.io_timeout = val;
        self
    }

    pub fn reply_buffer_size(mut self, val: usize) -> Self {
        assert!(val > 0, "Reply buffer size cannot be set to 0.");
        self.reply_buffer_size = val;
        self
    }

    pub fn spawn(
        self,
        queue: Arc<JobQueue>,
        pool: Arc<ConnectionPool>,
        stats: Arc<Stats>,
    ) -> WorkerPool {
        let forwarder = Arc::new(Forwarder::new(
            pool,
            self.io_timeout,
            self.reply_buffer_size,
        ));

        let workers = (0..self.workers)
            .map(|id| {
                Worker::spawn(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&forwarder),
                    Arc::clone(&stats),
                )
            })
            .collect();

        WorkerPool { workers }
    }
}

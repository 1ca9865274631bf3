use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpSocket, TcpStream},
    sync::Semaphore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    connection::timed, stats, Admission, ConnectionPool, Job, JobQueue, RelayConfig, RelayError,
    Stats, WorkerPool,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts inbound connections, turns their first payload into jobs, and runs the
/// workers that relay those jobs to the target.
pub struct TcpRelay {
    config: RelayConfig,
    listener: TcpListener,
    queue: Arc<JobQueue>,
    pool: Arc<ConnectionPool>,
    stats: Arc<Stats>,
    pending_reads: Arc<Semaphore>,
}

impl TcpRelay {
    /// Binds the inbound listener on `0.0.0.0:<listen_port>` with `SO_REUSEADDR`.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let listener = Self::listen(addr, config.max_connections)
            .map_err(|source| RelayError::Bind { addr, source })?;

        info!(
            listen_addr = %listener.local_addr().unwrap_or(addr),
            target_addr = %config.target_addr(),
            backlog = config.max_connections,
            "Listener bound."
        );

        Ok(Self {
            queue: Arc::new(JobQueue::new(config.queue_capacity, config.overflow_policy)),
            pool: Arc::new(ConnectionPool::new(
                config.target_addr(),
                config.connect_timeout,
            )),
            stats: Arc::new(Stats::new()),
            pending_reads: Arc::new(Semaphore::new(config.max_pending_reads as usize)),
            listener,
            config,
        })
    }

    fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    /// Runs until `shutdown` fires.
    ///
    /// Shutdown stops accepting, waits for in-flight inbound reads, then lets the
    /// workers drain whatever is still queued before returning.
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        self.pool.prime(self.config.pool_prime_size).await;

        let workers = WorkerPool::builder()
            .workers(self.config.worker_count)
            .io_timeout(self.config.io_timeout)
            .reply_buffer_size(self.config.read_buffer_size)
            .spawn(
                Arc::clone(&self.queue),
                Arc::clone(&self.pool),
                Arc::clone(&self.stats),
            );
        info!(workers = workers.len(), "Workers started.");

        let reporter_shutdown = CancellationToken::new();
        let reporter = tokio::spawn(stats::report(
            Arc::clone(&self.stats),
            self.config.stats_interval,
            reporter_shutdown.clone(),
        ));

        self.accept_loop(&shutdown).await;

        info!("Shutting down, draining in-flight jobs.");
        // Holding every permit means no inbound read is still in flight.
        if let Ok(permits) = self
            .pending_reads
            .acquire_many(self.config.max_pending_reads)
            .await
        {
            drop(permits);
        }
        self.queue.close();
        workers.join().await;

        reporter_shutdown.cancel();
        if let Err(e) = reporter.await {
            warn!(error = %e, "Stats reporter terminated abnormally.");
        }

        info!("Relay stopped.");
        Ok(())
    }

    async fn accept_loop(&self, shutdown: &CancellationToken) {
        loop {
            // Wait for room before accepting; the OS backlog absorbs the burst meanwhile.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.pending_reads).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (inbound, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %RelayError::Accept(e), "Accept failed.");
                    if !back_off(shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let queue = Arc::clone(&self.queue);
            let stats = Arc::clone(&self.stats);
            let buffer_size = self.config.read_buffer_size;
            let read_timeout = self.config.io_timeout;

            tokio::spawn(async move {
                match read_job(inbound, peer, buffer_size, read_timeout).await {
                    Ok(job) => {
                        stats.record_request();
                        admit(&queue, &stats, job);
                    }
                    Err(e) => {
                        stats.record_error();
                        debug!(%peer, error = %e, "Inbound connection dropped.");
                    }
                }
                drop(permit);
            });
        }
    }
}

/// Performs the single bounded read of an inbound connection.
///
/// Anything beyond `buffer_size` stays unread on the socket.
pub async fn read_job(
    mut inbound: TcpStream,
    peer: SocketAddr,
    buffer_size: usize,
    read_timeout: Duration,
) -> Result<Job, RelayError> {
    let mut payload = BytesMut::zeroed(buffer_size);
    let read = timed(read_timeout, inbound.read(&mut payload))
        .await
        .map_err(|source| RelayError::InboundRead { peer, source })?;

    if read == 0 {
        return Err(RelayError::EmptyRead { peer });
    }

    payload.truncate(read);
    Ok(Job {
        inbound,
        peer,
        payload: payload.freeze(),
    })
}

/// Pauses after a failed accept. Returns `false` if `shutdown` fired meanwhile.
async fn back_off(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

fn admit(queue: &JobQueue, stats: &Stats, job: Job) {
    let peer = job.peer;
    match queue.enqueue(job) {
        Admission::Queued => {}
        Admission::Evicted => {
            stats.record_eviction();
            debug!(%peer, "Queue full, evicted the oldest job.");
        }
        Admission::Rejected => {
            stats.record_rejection();
            debug!(%peer, "Queue full or closed, rejected job.");
        }
    }
    stats.set_queue_size(queue.len());
}

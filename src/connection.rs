//! Outbound connections to the fixed target.

use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use tokio::{net::TcpStream, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{IgnorePoisoned, RelayError};

/// Runs `operation`, turning an expired `limit` into [`io::ErrorKind::TimedOut`].
pub(crate) async fn timed<T>(
    limit: Duration,
    operation: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no progress within {limit:?}"),
        )),
    }
}

/// A live connection to the target, owned by exactly one holder at a time.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    stream: TcpStream,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Cheap liveness probe that never waits.
    ///
    /// An idle connection has nothing to read, so anything other than
    /// `WouldBlock` (EOF, a socket error, stray bytes) means it is unusable.
    fn is_alive(&self) -> bool {
        if !matches!(self.stream.take_error(), Ok(None)) {
            return false;
        }

        let mut probe = [0u8; 1];
        matches!(
            self.stream.try_read(&mut probe),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        )
    }
}

/// Idle connections to the target, handed out most-recently-released first.
pub struct ConnectionPool {
    target: String,
    connect_timeout: Duration,
    idle: Mutex<Vec<PooledConnection>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(target: String, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().ignore_poisoned().len()
    }

    /// Opens up to `count` connections concurrently and parks them as idle.
    ///
    /// Failures only shrink the initial pool. Returns how many were opened.
    pub async fn prime(&self, count: usize) -> usize {
        info!(target_addr = %self.target, count, "Priming outbound connection pool.");

        let mut attempts = JoinSet::new();
        for _ in 0..count {
            let id = self.next_id();
            let target = self.target.clone();
            let limit = self.connect_timeout;
            attempts.spawn(async move {
                let stream = timed(limit, TcpStream::connect(target)).await?;
                Ok::<_, io::Error>(PooledConnection { id, stream })
            });
        }

        let mut opened = 0;
        while let Some(attempt) = attempts.join_next().await {
            match attempt {
                Ok(Ok(connection)) => {
                    let _ = connection.stream.set_nodelay(true);
                    self.release(connection);
                    opened += 1;
                }
                Ok(Err(e)) => {
                    warn!(target_addr = %self.target, error = %e, "Failed to prime connection.");
                }
                Err(e) => warn!(error = %e, "Priming task did not complete."),
            }
        }

        info!(target_addr = %self.target, opened, "Connection pool ready.");
        opened
    }

    /// Hands out an idle connection that passes the liveness probe, or opens a new one.
    pub async fn acquire(&self) -> Result<PooledConnection, RelayError> {
        loop {
            // The guard must be gone before anything below awaits.
            let candidate = self.idle.lock().ignore_poisoned().pop();
            match candidate {
                Some(connection) if connection.is_alive() => return Ok(connection),
                Some(connection) => {
                    debug!(connection = connection.id, "Dropping dead pooled connection.");
                }
                None => break,
            }
        }

        self.connect().await
    }

    /// Returns a healthy connection to the idle set.
    pub fn release(&self, connection: PooledConnection) {
        self.idle.lock().ignore_poisoned().push(connection);
    }

    /// Closes a connection that failed mid-use. It never re-enters the idle set.
    pub fn discard(&self, connection: PooledConnection) {
        debug!(connection = connection.id, "Discarding outbound connection.");
        drop(connection);
    }

    async fn connect(&self) -> Result<PooledConnection, RelayError> {
        let stream = timed(self.connect_timeout, TcpStream::connect(self.target.as_str()))
            .await
            .map_err(|source| RelayError::Connect {
                target: self.target.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let id = self.next_id();
        debug!(connection = id, target_addr = %self.target, "Opened outbound connection.");
        Ok(PooledConnection { id, stream })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;

    /// Accepts connections and keeps them open until the test ends.
    async fn holding_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    async fn unreachable_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn pool_for(addr: SocketAddr) -> ConnectionPool {
        ConnectionPool::new(addr.to_string(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn released_connection_is_reused_last_in_first_out() {
        let pool = pool_for(holding_target().await);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());

        pool.release(first);
        pool.release(second);
        assert_eq!(pool.idle_len(), 2);

        let reused = pool.acquire().await.unwrap();
        assert_eq!(reused.id(), 1);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn discarded_connection_never_returns() {
        let pool = pool_for(holding_target().await);

        let connection = pool.acquire().await.unwrap();
        let id = connection.id();
        pool.discard(connection);
        assert_eq!(pool.idle_len(), 0);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), id);
    }

    #[tokio::test]
    async fn closed_idle_connection_is_skipped() {
        // Target closes every connection right after accepting it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let pool = pool_for(addr);
        assert_eq!(pool.prime(1).await, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let connection = pool.acquire().await.unwrap();
        assert_eq!(connection.id(), 1);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn priming_tolerates_unreachable_target() {
        let pool = pool_for(unreachable_addr().await);

        assert_eq!(pool.prime(3).await, 0);
        assert_eq!(pool.idle_len(), 0);
        assert!(matches!(
            pool.acquire().await,
            Err(RelayError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_holders_never_share_a_connection() {
        let pool = std::sync::Arc::new(pool_for(holding_target().await));
        assert_eq!(pool.prime(4).await, 4);

        let mut holders = JoinSet::new();
        for _ in 0..16 {
            let pool = std::sync::Arc::clone(&pool);
            holders.spawn(async move {
                let connection = pool.acquire().await.unwrap();
                let id = connection.id();
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.release(connection);
                id
            });
        }

        let mut seen = Vec::new();
        while let Some(id) = holders.join_next().await {
            seen.push(id.unwrap());
        }
        assert_eq!(seen.len(), 16);
        // Every held connection went back exactly once.
        let distinct: std::collections::HashSet<_> = seen.iter().copied().collect();
        assert_eq!(pool.idle_len(), distinct.len());
    }
}

//! Helpers for relay integration tests: loopback targets and a relay running in
//! the background with its own shutdown token.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hook_relay::{ConnectionPool, RelayConfig, RelayError, Stats, TcpRelay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a [`TargetBackend`] answers each chunk it reads.
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub enum Reply {
    Fixed(&'static [u8]),
    Echo,
}

#[allow(dead_code)]
pub struct TargetBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TargetBackend {
    pub async fn spawn(reply: Reply) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            loop {
                                let n = match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => n,
                                };
                                let answer = match reply {
                                    Reply::Fixed(bytes) => bytes,
                                    Reply::Echo => &buf[..n],
                                };
                                if stream.write_all(answer).await.is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    #[allow(dead_code)]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TargetBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A port nothing listens on.
#[allow(dead_code)]
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Config for a relay on an ephemeral port in front of `target`.
pub fn test_config(target: SocketAddr) -> RelayConfig {
    RelayConfig {
        listen_port: 0,
        target_host: target.ip().to_string(),
        target_port: target.port(),
        read_buffer_size: 4096,
        max_connections: 128,
        queue_capacity: 64,
        worker_count: 2,
        pool_prime_size: 0,
        max_pending_reads: 64,
        connect_timeout: Duration::from_millis(500),
        io_timeout: Duration::from_secs(2),
        stats_interval: Duration::from_secs(60),
        ..RelayConfig::default()
    }
}

#[allow(dead_code)]
pub struct RelayHandle {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
    pub pool: Arc<ConnectionPool>,
    pub shutdown: CancellationToken,
    task: JoinHandle<Result<(), RelayError>>,
}

impl RelayHandle {
    pub async fn spawn(config: RelayConfig) -> Result<Self, RelayError> {
        let relay = TcpRelay::bind(config).await?;
        let port = relay.local_addr().map_err(RelayError::Accept)?.port();
        let stats = relay.stats();
        let pool = relay.pool();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(relay.start(shutdown.clone()));

        Ok(Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            stats,
            pool,
            shutdown,
            task,
        })
    }

    /// Cancels the relay and waits for it to finish draining.
    #[allow(dead_code)]
    pub async fn stop(self) -> Result<(), RelayError> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("relay did not stop in time")
            .expect("relay task panicked")
    }
}

/// Sends `payload` and reads until the relay closes the connection.
#[allow(dead_code)]
pub async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok(reply)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "roundtrip timed out"))?
}

/// Polls `condition` until it holds or a second passes.
#[allow(dead_code)]
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

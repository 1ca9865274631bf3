//! Relay configuration.
//!
//! Everything is fixed at startup and read from `RELAY_*` environment variables,
//! falling back to the defaults below.

use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

/// What the job queue does with a new job when it is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued job and close its connection without a reply.
    #[default]
    DropOldest,
    /// Keep the queue as is and close the new job's connection immediately.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "reject" => Ok(Self::Reject),
            other => bail!("unknown overflow policy {other:?}, expected drop-oldest or reject"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port the acceptor binds on `0.0.0.0`. Zero picks an ephemeral port.
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Upper bound for the single read of a request and of a reply.
    pub read_buffer_size: usize,
    /// Listen backlog.
    pub max_connections: u32,
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Outbound connections opened eagerly at startup.
    pub pool_prime_size: usize,
    /// Inbound reads allowed in flight before the acceptor stops accepting.
    pub max_pending_reads: u32,
    pub connect_timeout: Duration,
    /// Applies to the inbound read, the target send and receive, and the reply write.
    pub io_timeout: Duration,
    pub overflow_policy: OverflowPolicy,
    pub stats_interval: Duration,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            target_host: "127.0.0.1".to_string(),
            target_port: 8081,
            read_buffer_size: 64 * 1024,
            max_connections: 100_000,
            queue_capacity: 1_000_000,
            worker_count: 100,
            pool_prime_size: 100,
            max_pending_reads: 10_000,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            overflow_policy: OverflowPolicy::DropOldest,
            stats_interval: Duration::from_secs(1),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, then validate it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            listen_port: parse_or(&lookup, "RELAY_LISTEN_PORT", defaults.listen_port)?,
            target_host: lookup("RELAY_TARGET_HOST").unwrap_or(defaults.target_host),
            target_port: parse_or(&lookup, "RELAY_TARGET_PORT", defaults.target_port)?,
            read_buffer_size: parse_or(
                &lookup,
                "RELAY_READ_BUFFER_SIZE",
                defaults.read_buffer_size,
            )?,
            max_connections: parse_or(&lookup, "RELAY_MAX_CONNECTIONS", defaults.max_connections)?,
            queue_capacity: parse_or(&lookup, "RELAY_QUEUE_CAPACITY", defaults.queue_capacity)?,
            worker_count: parse_or(&lookup, "RELAY_WORKERS", defaults.worker_count)?,
            pool_prime_size: parse_or(&lookup, "RELAY_POOL_PRIME_SIZE", defaults.pool_prime_size)?,
            max_pending_reads: parse_or(
                &lookup,
                "RELAY_MAX_PENDING_READS",
                defaults.max_pending_reads,
            )?,
            connect_timeout: millis_or(&lookup, "RELAY_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            io_timeout: millis_or(&lookup, "RELAY_IO_TIMEOUT_MS", defaults.io_timeout)?,
            overflow_policy: parse_or(&lookup, "RELAY_OVERFLOW_POLICY", defaults.overflow_policy)?,
            stats_interval: millis_or(&lookup, "RELAY_STATS_INTERVAL_MS", defaults.stats_interval)?,
            log_level: lookup("RELAY_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_host.trim().is_empty() {
            bail!("RELAY_TARGET_HOST must not be empty.");
        }
        if self.read_buffer_size == 0 {
            bail!("RELAY_READ_BUFFER_SIZE must be greater than 0.");
        }
        if self.queue_capacity == 0 {
            bail!("RELAY_QUEUE_CAPACITY must be greater than 0.");
        }
        if self.worker_count == 0 {
            bail!("RELAY_WORKERS must be greater than 0.");
        }
        if self.max_pending_reads == 0 {
            bail!("RELAY_MAX_PENDING_READS must be greater than 0.");
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            bail!("Connect and I/O timeouts must be greater than 0.");
        }
        if self.stats_interval.is_zero() {
            bail!("RELAY_STATS_INTERVAL_MS must be greater than 0.");
        }
        Ok(())
    }

    /// `host:port` of the downstream target.
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} has an invalid value {raw:?}.")),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    let millis: u64 = parse_or(lookup, key, default_ms)
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;
    Ok(Duration::from_millis(millis))
}

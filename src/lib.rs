mod config;
mod connection;
mod error;
mod job_queue;
mod mutex_extensions;
pub mod stats;
mod tcp_relay;
mod worker_pool;

pub use config::*;
pub use connection::*;
pub use error::RelayError;
pub use job_queue::*;
pub use mutex_extensions::IgnorePoisoned;
pub use stats::{Stats, StatsSnapshot};
pub use tcp_relay::*;
pub use worker_pool::*;

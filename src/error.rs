use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures the relay detects while admitting or forwarding a job.
///
/// Everything except [`RelayError::Bind`] is handled where it happens: the
/// offending connection is closed and the error counter goes up by one.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept inbound connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to read request from {peer}: {source}")]
    InboundRead {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{peer} closed the connection without sending data")]
    EmptyRead { peer: SocketAddr },

    #[error("failed to connect to target {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("exchange with target failed: {0}")]
    Forward(#[source] io::Error),

    #[error("failed to write reply to {peer}: {source}")]
    ReplyWrite {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}

//! Error types surfaced by connections, requests and the multiplexer.
//!
//! Failures are layered. A [`ConnectionError`] ends one physical connection
//! and is cloned into every request that was waiting on it. Callers see a
//! [`RequestError`] for a single command, and multiplexer operations return
//! [`MuxError`].

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::{dispatch::DispatchError, pubsub::SubscriptionId, resp::DecodeError};

/// Why a physical connection stopped.
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport reported an I/O error.
    #[error("transport error: {message}")]
    Io {
        /// Kind of the underlying [`io::Error`].
        kind: io::ErrorKind,
        /// Rendered error message.
        message: String,
    },
    /// The peer sent bytes that are not valid RESP.
    #[error("protocol error: {0}")]
    Decode(#[from] DecodeError),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// A reply arrived while no request was waiting for one.
    #[error("reply received with no request awaiting it")]
    UnexpectedReply,
    /// The failure was injected with `simulate_connection_failure`.
    #[error("simulated connection failure")]
    Simulated,
    /// Establishing the transport took longer than the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The owning multiplexer is shutting down.
    #[error("multiplexer shut down")]
    Shutdown,
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => Self::Closed,
            kind => Self::Io {
                kind,
                message: error.to_string(),
            },
        }
    }
}

/// Outcome of a single command that did not produce a reply value.
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The server answered with an error reply. The connection is healthy.
    #[error("server error: {0}")]
    Server(String),
    /// The connection carrying the request failed before the reply arrived.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// No reply arrived before the caller's deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The request was discarded without being answered.
    #[error("request dropped before completion")]
    Dropped,
}

impl RequestError {
    /// Returns `true` for server error replies.
    #[must_use]
    pub fn is_server(&self) -> bool { matches!(self, Self::Server(_)) }
}

/// Errors returned by [`crate::Multiplexer`] operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MuxError {
    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// No configured endpoint satisfies the selector.
    #[error("no endpoint matches {0}")]
    NoRoute(String),
    /// The command would break reply correlation on a shared connection,
    /// such as `SUBSCRIBE` sent through `submit`.
    #[error("command {0} cannot be multiplexed")]
    UnsupportedCommand(String),
    /// The routed bridge refuses more queued requests.
    #[error("outbound backlog for {0} is full")]
    BacklogFull(SocketAddr),
    /// The routed bridge is down and the backlog policy fails fast.
    #[error("{0} is not connected")]
    Unavailable(SocketAddr),
    /// The multiplexer has been closed.
    #[error("multiplexer is shut down")]
    Shutdown,
    /// No endpoint could be reached while connecting.
    #[error("could not connect to any endpoint: {0}")]
    ConnectFailed(#[source] ConnectionError),
    /// Pub/sub was disabled in the configuration.
    #[error("pub/sub is disabled")]
    PubSubDisabled,
    /// The subscription was never registered or is already gone.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
    /// The execution dispatcher failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The command itself failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_closed() {
        let err = ConnectionError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(err, ConnectionError::Closed);
    }

    #[test]
    fn io_error_keeps_kind() {
        let err = ConnectionError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(
            err,
            ConnectionError::Io {
                kind: io::ErrorKind::ConnectionReset,
                ..
            }
        ));
        assert_eq!(err.to_string(), "transport error: reset");
    }

    #[test]
    fn request_error_is_transparent_over_connection_error() {
        let err = RequestError::from(ConnectionError::Simulated);
        assert_eq!(err.to_string(), "simulated connection failure");
        assert!(!err.is_server());
    }
}

//! A connector whose connection attempts can be refused on demand.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use respmux::{Connector, TcpConnector, Transport};

/// Wraps [`TcpConnector`] with a switch that refuses new connections.
///
/// Clones share the switch and counters, so a test can keep one clone while
/// the multiplexer owns another. Combined with
/// [`MockServer::kill_connections`](crate::MockServer::kill_connections) this
/// produces an outage that lasts until [`FlakyConnector::refuse`] is turned
/// off again.
#[derive(Clone, Debug, Default)]
pub struct FlakyConnector {
    inner: TcpConnector,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl FlakyConnector {
    /// Create a connector that initially lets every attempt through.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Refuse (`true`) or allow (`false`) further connection attempts.
    pub fn refuse(&self, refusing: bool) { self.refusing.store(refusing, Ordering::SeqCst); }

    /// Connection attempts made so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> usize { self.attempts.load(Ordering::SeqCst) }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, endpoint: SocketAddr) -> io::Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("refusing connections to {endpoint}"),
            ));
        }
        self.inner.connect(endpoint).await
    }
}

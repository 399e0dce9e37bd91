//! Live physical connection counting.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use super::ConnectionKind;

static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Counts a physical connection as live until dropped.
pub(super) struct ActiveConnection {
    endpoint: SocketAddr,
    kind: ConnectionKind,
}

impl ActiveConnection {
    pub(super) fn new(endpoint: SocketAddr, kind: ConnectionKind) -> Self {
        let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::inc_connections();
        tracing::info!(%endpoint, %kind, active, "connection established");
        Self { endpoint, kind }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let active = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1;
        crate::metrics::dec_connections();
        tracing::info!(endpoint = %self.endpoint, kind = %self.kind, active, "connection closed");
    }
}

/// Return the number of physical connections currently open in this process.
#[must_use]
pub fn active_connection_count() -> u64 { ACTIVE_CONNECTIONS.load(Ordering::Relaxed) }

//! Bridge states, health counters and the transition log.

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Mutex,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use crate::{connection::ConnectionKind, error::ConnectionError};

/// Lifecycle state of a bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BridgeState {
    /// No connection and no attempt in progress. Initial and final state.
    Disconnected,
    /// A transport is being established.
    Connecting,
    /// A physical connection is live and draining the backlog.
    Connected,
    /// The last connection or attempt failed; waiting for the retry policy.
    Failed,
}

impl BridgeState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One recorded state change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Wall-clock time of the change.
    pub at: SystemTime,
    /// State before the change.
    pub old: BridgeState,
    /// State after the change.
    pub new: BridgeState,
    /// Failure that caused a move to [`BridgeState::Failed`].
    pub cause: Option<ConnectionError>,
}

/// Bounded, queryable history of state changes.
#[derive(Debug)]
pub(crate) struct TransitionLog {
    capacity: usize,
    entries: Mutex<VecDeque<Transition>>,
}

impl TransitionLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub(crate) fn record(&self, transition: Transition) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(transition);
    }

    pub(crate) fn snapshot(&self) -> Vec<Transition> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Live counters shared by a bridge and its physical connections.
#[derive(Debug, Default)]
pub(crate) struct BridgeCounters {
    queued: AtomicU64,
    awaiting: AtomicU64,
    submitted: AtomicU64,
    written: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
}

impl BridgeCounters {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dequeued(&self) { self.queued.fetch_sub(1, Ordering::Relaxed); }

    pub(crate) fn requeued(&self) { self.queued.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.awaiting.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo [`BridgeCounters::written`] for a request failed before writing.
    pub(crate) fn write_rejected(&self) {
        self.written.fetch_sub(1, Ordering::Relaxed);
        self.awaiting.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self) {
        self.awaiting.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed_awaiting(&self) {
        self.awaiting.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed_queued(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnected(&self) { self.reconnects.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn snapshot(
        &self,
        endpoint: SocketAddr,
        kind: ConnectionKind,
        state: BridgeState,
    ) -> BridgeStatus {
        BridgeStatus {
            endpoint,
            kind,
            state,
            queued: self.queued.load(Ordering::Relaxed),
            awaiting: self.awaiting.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time health and backlog figures for one bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeStatus {
    /// Endpoint served by the bridge.
    pub endpoint: SocketAddr,
    /// Interactive or subscription traffic.
    pub kind: ConnectionKind,
    /// Current lifecycle state.
    pub state: BridgeState,
    /// Requests queued and not yet written.
    pub queued: u64,
    /// Requests written and waiting for a reply.
    pub awaiting: u64,
    /// Requests accepted since the bridge started.
    pub submitted: u64,
    /// Requests written to a transport.
    pub written: u64,
    /// Replies correlated to written requests.
    pub completed: u64,
    /// Requests completed with a connection error.
    pub failed: u64,
    /// Successful connects after the first one.
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(old: BridgeState, new: BridgeState) -> Transition {
        Transition {
            at: SystemTime::now(),
            old,
            new,
            cause: None,
        }
    }

    #[test]
    fn log_keeps_most_recent_entries() {
        let log = TransitionLog::new(2);
        log.record(transition(BridgeState::Disconnected, BridgeState::Connecting));
        log.record(transition(BridgeState::Connecting, BridgeState::Connected));
        log.record(transition(BridgeState::Connected, BridgeState::Failed));

        let states: Vec<_> = log.snapshot().iter().map(|t| (t.old, t.new)).collect();
        assert_eq!(
            states,
            vec![
                (BridgeState::Connecting, BridgeState::Connected),
                (BridgeState::Connected, BridgeState::Failed),
            ]
        );
    }

    #[test]
    fn counters_track_request_lifecycle() {
        let counters = BridgeCounters::default();
        counters.submitted();
        counters.submitted();
        counters.dequeued();
        counters.written();
        counters.completed();
        counters.failed_queued();

        let status = counters.snapshot(
            "127.0.0.1:6379".parse().expect("addr"),
            ConnectionKind::Interactive,
            BridgeState::Connected,
        );
        assert_eq!(status.queued, 0);
        assert_eq!(status.awaiting, 0);
        assert_eq!((status.submitted, status.written), (2, 1));
        assert_eq!((status.completed, status.failed), (1, 1));
    }
}

//! Connection bridges: one logical connection per endpoint and traffic kind.
//!
//! A bridge outlives the physical connections it owns. Callers only ever
//! enqueue into its backlog; a supervisor task connects, hands the backlog to
//! the live connection, and on failure consults the retry policy before
//! connecting again. Requests queued while disconnected are written in
//! submission order once a connection is established.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Failed -> Connecting ...
//!                                                  \-> Disconnected (shutdown)
//! ```

mod backlog;
mod status;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

pub(crate) use backlog::{Backlog, BacklogSender, Rejected, backlog};
pub use status::{BridgeState, BridgeStatus, Transition};
pub(crate) use status::{BridgeCounters, TransitionLog};
use tokio::{
    sync::{Notify, broadcast, watch},
    time::{Interval, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    connection::{
        ConnectionKind,
        ConnectionSettings,
        Connector,
        Link,
        PendingRequest,
        PhysicalConnection,
        Transport,
    },
    error::{ConnectionError, MuxError},
    metrics,
    pubsub::{Channel, Delivery},
    resp::DecoderLimits,
    retry::{RetryPolicy, RetryState},
};

/// Connectivity notifications broadcast by a multiplexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A bridge moved between two different states.
    StateChanged {
        /// Endpoint served by the bridge.
        endpoint: SocketAddr,
        /// Traffic carried by the bridge.
        kind: ConnectionKind,
        /// Previous state.
        old: BridgeState,
        /// New state.
        new: BridgeState,
    },
    /// A bridge lost its connection or failed to establish one. Fires once
    /// per outage.
    ConnectionFailed {
        /// Endpoint served by the bridge.
        endpoint: SocketAddr,
        /// Traffic carried by the bridge.
        kind: ConnectionKind,
        /// Failure that started the outage.
        cause: ConnectionError,
    },
    /// A bridge connected again after an outage.
    ConnectionRestored {
        /// Endpoint served by the bridge.
        endpoint: SocketAddr,
        /// Traffic carried by the bridge.
        kind: ConnectionKind,
    },
}

/// What a bridge does with submissions while it is not connected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BacklogPolicy {
    /// Queue them and write them once connected.
    #[default]
    Queue,
    /// Reject them with [`MuxError::Unavailable`].
    FailFast,
}

/// Per-bridge tuning taken from the multiplexer configuration.
#[derive(Clone, Debug)]
pub(crate) struct BridgeSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) heartbeat: Duration,
    pub(crate) backlog_policy: BacklogPolicy,
    pub(crate) backlog_capacity: usize,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) limits: DecoderLimits,
    pub(crate) log_capacity: usize,
}

/// Decides which registered channels a subscription bridge replays.
pub(crate) type ReplayFilter = Arc<dyn Fn(&Channel) -> bool + Send + Sync>;

/// Pub/sub wiring of a subscription bridge.
#[derive(Clone)]
pub(crate) struct SubscriptionFeed {
    pub(crate) delivery: Delivery,
    pub(crate) owns: ReplayFilter,
}

/// State shared by a bridge handle and its supervisor.
struct Shared {
    endpoint: SocketAddr,
    kind: ConnectionKind,
    state: watch::Sender<BridgeState>,
    counters: Arc<BridgeCounters>,
    log: TransitionLog,
    events: broadcast::Sender<ConnectionEvent>,
    wake: Notify,
    force_reconnect: AtomicBool,
    current: Mutex<Option<Arc<Link>>>,
}

impl Shared {
    fn transition(&self, new: BridgeState, cause: Option<ConnectionError>) {
        let old = self.state.send_replace(new);
        if old == new {
            return;
        }
        tracing::info!(
            endpoint = %self.endpoint,
            kind = %self.kind,
            %old,
            %new,
            "bridge state changed"
        );
        self.log.record(Transition {
            at: SystemTime::now(),
            old,
            new,
            cause,
        });
        self.emit(ConnectionEvent::StateChanged {
            endpoint: self.endpoint,
            kind: self.kind,
            old,
            new,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine; events are best effort.
        let _ = self.events.send(event);
    }

    fn set_current(&self, link: Option<Arc<Link>>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = link;
    }
}

/// Handle to a bridge; its supervisor runs on the multiplexer's tracker.
pub(crate) struct Bridge {
    shared: Arc<Shared>,
    sender: BacklogSender,
    policy: BacklogPolicy,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("endpoint", &self.shared.endpoint)
            .field("kind", &self.shared.kind)
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Create a bridge for `endpoint` and start its supervisor.
    #[expect(
        clippy::too_many_arguments,
        reason = "bridges are wired up in one place by the multiplexer"
    )]
    pub(crate) fn spawn(
        endpoint: SocketAddr,
        kind: ConnectionKind,
        settings: BridgeSettings,
        connector: Arc<dyn Connector>,
        feed: Option<SubscriptionFeed>,
        events: broadcast::Sender<ConnectionEvent>,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) -> Self {
        let counters = Arc::new(BridgeCounters::default());
        let (sender, backlog) = backlog(settings.backlog_capacity, Arc::clone(&counters));
        let shared = Arc::new(Shared {
            endpoint,
            kind,
            state: watch::Sender::new(BridgeState::Disconnected),
            counters,
            log: TransitionLog::new(settings.log_capacity),
            events,
            wake: Notify::new(),
            force_reconnect: AtomicBool::new(false),
            current: Mutex::new(None),
        });
        let policy = settings.backlog_policy;
        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            backlog,
            settings,
            connector,
            feed,
            shutdown: shutdown.clone(),
        };
        tracker.spawn(supervisor.run());
        Self {
            shared,
            sender,
            policy,
            shutdown: shutdown.clone(),
        }
    }

    pub(crate) fn endpoint(&self) -> SocketAddr { self.shared.endpoint }

    pub(crate) fn kind(&self) -> ConnectionKind { self.shared.kind }

    pub(crate) fn state(&self) -> BridgeState { *self.shared.state.borrow() }

    /// Queue `request` for this bridge.
    ///
    /// # Errors
    ///
    /// Fails when shutting down, when the backlog is full, or under
    /// [`BacklogPolicy::FailFast`] while not connected.
    pub(crate) fn submit(&self, request: PendingRequest) -> Result<(), MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Shutdown);
        }
        let state = self.state();
        if self.policy == BacklogPolicy::FailFast && state != BridgeState::Connected {
            return Err(MuxError::Unavailable(self.shared.endpoint));
        }
        match self.sender.try_push(request) {
            Ok(()) => {}
            Err(Rejected::Full(_)) => return Err(MuxError::BacklogFull(self.shared.endpoint)),
            Err(Rejected::Closed(_)) => return Err(MuxError::Shutdown),
        }
        if state == BridgeState::Failed {
            // New work re-evaluates the retry policy.
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Reconnect now if not connected, bypassing the retry policy.
    ///
    /// Returns `false` when the bridge is already connected.
    pub(crate) fn reconnect(&self) -> bool {
        if self.state() == BridgeState::Connected {
            return false;
        }
        self.shared.force_reconnect.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        true
    }

    /// Fail the live connection with [`ConnectionError::Simulated`].
    ///
    /// Returns `false` when there was no live connection to fail.
    pub(crate) fn simulate_failure(&self) -> bool {
        let current = self
            .shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        current.is_some_and(|link| link.fail(ConnectionError::Simulated))
    }

    pub(crate) fn status(&self) -> BridgeStatus {
        self.shared
            .counters
            .snapshot(self.shared.endpoint, self.shared.kind, self.state())
    }

    pub(crate) fn transitions(&self) -> Vec<Transition> { self.shared.log.snapshot() }

    /// Wait until the first connection attempt has either succeeded or failed.
    pub(crate) async fn settled(&self) -> BridgeState {
        let mut rx = self.shared.state.subscribe();
        let shutdown = &self.shutdown;
        rx.wait_for(|state| match state {
            BridgeState::Connected | BridgeState::Failed => true,
            BridgeState::Connecting => false,
            BridgeState::Disconnected => shutdown.is_cancelled(),
        })
        .await
        .map_or(BridgeState::Disconnected, |state| *state)
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    backlog: Backlog,
    settings: BridgeSettings,
    connector: Arc<dyn Connector>,
    feed: Option<SubscriptionFeed>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut retry = RetryState::default();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connected_before = false;
        let mut outage = false;

        loop {
            self.shared.transition(BridgeState::Connecting, None);
            let cause = match self.connect().await {
                Ok(transport) => {
                    retry.reset();
                    if connected_before {
                        self.shared.counters.reconnected();
                        metrics::inc_reconnects();
                    }
                    connected_before = true;
                    let cause = self.serve(transport, &mut outage).await;
                    self.shared.set_current(None);
                    cause
                }
                Err(cause) => cause,
            };
            if self.shutdown.is_cancelled() || cause == ConnectionError::Shutdown {
                break;
            }
            retry.record_failure(Instant::now());
            self.shared.transition(BridgeState::Failed, Some(cause.clone()));
            if !outage {
                outage = true;
                self.shared.emit(ConnectionEvent::ConnectionFailed {
                    endpoint: self.shared.endpoint,
                    kind: self.shared.kind,
                    cause,
                });
            }
            if !self.wait_for_retry(&retry, &mut heartbeat).await {
                break;
            }
            retry.record_attempt();
        }
        self.stop();
    }

    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError> {
        let timeout = self.settings.connect_timeout;
        let attempt = tokio::time::timeout(timeout, self.connector.connect(self.shared.endpoint));
        let outcome = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(ConnectionError::Shutdown),
            outcome = attempt => outcome,
        };
        let error = match outcome {
            Ok(Ok(transport)) => return Ok(transport),
            Ok(Err(e)) => ConnectionError::from(e),
            Err(_) => ConnectionError::ConnectTimeout(timeout),
        };
        metrics::inc_connection_failures();
        tracing::warn!(
            endpoint = %self.shared.endpoint,
            kind = %self.shared.kind,
            %error,
            "connect failed"
        );
        Err(error)
    }

    /// Run one physical connection until it fails.
    async fn serve(&mut self, transport: Box<dyn Transport>, outage: &mut bool) -> ConnectionError {
        let settings = ConnectionSettings {
            endpoint: self.shared.endpoint,
            kind: self.shared.kind,
            limits: self.settings.limits,
            counters: Arc::clone(&self.shared.counters),
            delivery: self.feed.as_ref().map(|feed| feed.delivery.clone()),
        };
        let connection = PhysicalConnection::start(transport, settings, &self.shutdown);
        self.shared.set_current(Some(connection.link()));
        self.shared.transition(BridgeState::Connected, None);
        if std::mem::take(outage) {
            self.shared.emit(ConnectionEvent::ConnectionRestored {
                endpoint: self.shared.endpoint,
                kind: self.shared.kind,
            });
        }
        let replay = self.replay();
        if !replay.is_empty() {
            tracing::debug!(
                endpoint = %self.shared.endpoint,
                subscriptions = replay.len(),
                "replaying subscriptions"
            );
        }
        connection.drive(&mut self.backlog, replay).await
    }

    /// Subscribe commands for every channel this bridge owns, in
    /// registration order.
    fn replay(&self) -> Vec<PendingRequest> {
        let Some(feed) = &self.feed else {
            return Vec::new();
        };
        feed.delivery
            .registry()
            .replay_order()
            .into_iter()
            .filter(|channel| (feed.owns)(channel))
            .map(|channel| PendingRequest::internal(&channel.subscribe_command()))
            .collect()
    }

    /// Wait until the retry policy, a forced reconnect or new work allows
    /// another attempt. Returns `false` on shutdown.
    async fn wait_for_retry(&self, retry: &RetryState, heartbeat: &mut Interval) -> bool {
        loop {
            if self.shared.force_reconnect.swap(false, Ordering::AcqRel) {
                tracing::debug!(endpoint = %self.shared.endpoint, "forced reconnect");
                return true;
            }
            if retry.permits(&*self.settings.retry, Instant::now()) {
                return true;
            }
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return false,
                () = self.shared.wake.notified() => {}
                _ = heartbeat.tick() => {}
            }
        }
    }

    /// Fail everything still queued and settle in `Disconnected`.
    fn stop(&mut self) {
        self.shared.transition(BridgeState::Disconnected, None);
        let drained = self.backlog.close_and_drain();
        if !drained.is_empty() {
            tracing::debug!(
                endpoint = %self.shared.endpoint,
                failed = drained.len(),
                "failing queued requests on shutdown"
            );
        }
        for request in drained {
            request.fail(ConnectionError::Shutdown);
            self.shared.counters.failed_queued();
        }
    }
}

//! The multiplexer: many callers, few connections.
//!
//! [`Multiplexer`] owns one interactive bridge per configured endpoint and,
//! with pub/sub enabled, one subscription bridge per primary. Submitting a
//! command routes it, encodes it, queues it on the chosen bridge and hands
//! back a [`ReplyFuture`] at once. Handles are cheap to clone; dropping the
//! last one cancels every background task.

mod config;
mod routing;

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

pub use config::{
    DEFAULT_BACKLOG_CAPACITY,
    DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_EVENT_CAPACITY,
    DEFAULT_HEARTBEAT,
    DEFAULT_MAX_WORKERS,
    DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_TRANSITION_LOG,
    EndpointConfig,
    MultiplexerConfig,
    ReadPreference,
    Role,
};
use futures::{FutureExt, future::join_all};
pub use routing::{EndpointSelector, SLOT_COUNT, hash_slot};
use routing::Router;
use tokio::{runtime::Handle, sync::broadcast, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    bridge::{
        Bridge,
        BridgeState,
        BridgeStatus,
        ConnectionEvent,
        SubscriptionFeed,
        Transition,
    },
    connection::{
        ConnectionKind,
        Connector,
        PendingRequest,
        ReplyFuture,
        RequestFlags,
        TcpConnector,
    },
    dispatch::{Dispatcher, Execution},
    error::{ConnectionError, MuxError, RequestError},
    pubsub::{
        Channel,
        Delivery,
        Handler,
        PubSubMessage,
        Subscription,
        SubscriptionId,
        SubscriptionRegistry,
        Unsubscribe,
    },
    resp::{Command, RespValue},
};

/// Commands that change a connection's reply stream and cannot share one.
const EXCLUSIVE_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "SSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
    "SUNSUBSCRIBE",
    "MONITOR",
];

/// Pub/sub state shared by all subscription bridges.
struct PubSub {
    delivery: Delivery,
    /// Subscription bridge per endpoint index; `None` for replicas.
    bridges: Vec<Option<Bridge>>,
}

struct MuxInner {
    router: Arc<Router>,
    interactive: Vec<Bridge>,
    pubsub: Option<PubSub>,
    dispatcher: Dispatcher,
    events: broadcast::Sender<ConnectionEvent>,
    operation_timeout: Duration,
    sync_timeout: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Drop for MuxInner {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

impl MuxInner {
    fn subscription_bridge(&self, channel: &Channel) -> Result<(&PubSub, &Bridge), MuxError> {
        let pubsub = self.pubsub.as_ref().ok_or(MuxError::PubSubDisabled)?;
        let bridge = self
            .router
            .route_channel(channel)
            .and_then(|index| pubsub.bridges.get(index))
            .and_then(Option::as_ref)
            .ok_or_else(|| MuxError::NoRoute(format!("a primary for channel {channel}")))?;
        Ok((pubsub, bridge))
    }

    fn remove_subscription(&self, id: SubscriptionId) -> Result<(), MuxError> {
        let pubsub = self.pubsub.as_ref().ok_or(MuxError::PubSubDisabled)?;
        let (channel, last) = pubsub
            .delivery
            .registry()
            .remove(id)
            .ok_or(MuxError::UnknownSubscription(id))?;
        tracing::debug!(%id, %channel, last, "subscription removed");
        if last {
            let (_, bridge) = self.subscription_bridge(&channel)?;
            // Queued even while disconnected: a SUBSCRIBE for the channel may
            // still be waiting in the backlog.
            match bridge.submit(PendingRequest::internal(&channel.unsubscribe_command())) {
                Ok(()) => {}
                Err(MuxError::Unavailable(_)) => {
                    tracing::debug!(%channel, "subscription connection down; nothing to undo");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Unsubscribe for MuxInner {
    fn unsubscribe(&self, id: SubscriptionId) {
        if let Err(e) = self.remove_subscription(id) {
            tracing::debug!(%id, error = %e, "dropping subscription stream");
        }
    }
}

/// Handle to a running multiplexer.
///
/// # Examples
///
/// ```no_run
/// use respmux::{Command, EndpointConfig, Multiplexer, MultiplexerConfig};
///
/// # async fn demo() -> Result<(), respmux::MuxError> {
/// let config = MultiplexerConfig::new()
///     .endpoint(EndpointConfig::primary("127.0.0.1:6379".parse().unwrap()));
/// let mux = Multiplexer::connect(config).await?;
/// mux.call(Command::new("SET").key("greeting").arg("hello")).await?;
/// let reply = mux.call(Command::new("GET").key("greeting")).await?;
/// println!("{reply}");
/// mux.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoints", &self.inner.router.endpoints())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Start bridges for every endpoint and wait for their first connection
    /// attempts to settle.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Config`] for unusable configurations and, with
    /// `abort_on_connect_fail`, [`MuxError::ConnectFailed`] when no endpoint
    /// connected within the connect timeout.
    pub async fn connect(config: MultiplexerConfig) -> Result<Self, MuxError> {
        let config = config.normalized();
        config.validate()?;

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(config.event_capacity);
        let connector: Arc<dyn Connector> = config
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.socket_options)));
        let settings = config.bridge_settings();
        let router = Arc::new(Router::new(config.endpoints.clone(), config.read_preference));

        let interactive: Vec<_> = router
            .endpoints()
            .iter()
            .map(|endpoint| {
                Bridge::spawn(
                    endpoint.addr,
                    ConnectionKind::Interactive,
                    settings.clone(),
                    Arc::clone(&connector),
                    None,
                    events.clone(),
                    &tracker,
                    &shutdown,
                )
            })
            .collect();

        let pubsub = config.pubsub.then(|| {
            let registry = Arc::new(SubscriptionRegistry::default());
            let delivery = Delivery::start(
                registry,
                config.ordered_pubsub,
                tracker.clone(),
                shutdown.clone(),
            );
            let mut bridges: Vec<Option<Bridge>> =
                router.endpoints().iter().map(|_| None).collect();
            for index in router.primaries() {
                let owner = Arc::clone(&router);
                let feed = SubscriptionFeed {
                    delivery: delivery.clone(),
                    owns: Arc::new(move |channel: &Channel| {
                        owner.route_channel(channel) == Some(index)
                    }),
                };
                bridges[index] = Some(Bridge::spawn(
                    router.endpoints()[index].addr,
                    ConnectionKind::Subscription,
                    settings.clone(),
                    Arc::clone(&connector),
                    Some(feed),
                    events.clone(),
                    &tracker,
                    &shutdown,
                ));
            }
            PubSub { delivery, bridges }
        });

        let settled = tokio::time::timeout(
            config.connect_timeout,
            join_all(interactive.iter().map(Bridge::settled)),
        )
        .await;
        let connected = interactive
            .iter()
            .filter(|bridge| bridge.state() == BridgeState::Connected)
            .count();
        tracing::info!(
            endpoints = interactive.len(),
            connected,
            settled = settled.is_ok(),
            "multiplexer started"
        );

        let inner = Arc::new(MuxInner {
            router,
            dispatcher: Dispatcher::new(Handle::current(), config.max_workers),
            operation_timeout: config.call_timeout(),
            sync_timeout: config.blocking_timeout(),
            interactive,
            pubsub,
            events,
            tracker,
            shutdown,
        });
        let mux = Self { inner };

        if connected == 0 && config.abort_on_connect_fail {
            let cause = mux
                .inner
                .interactive
                .iter()
                .flat_map(Bridge::transitions)
                .filter_map(|transition| transition.cause)
                .last()
                .unwrap_or(ConnectionError::ConnectTimeout(config.connect_timeout));
            mux.close().await;
            return Err(MuxError::ConnectFailed(cause));
        }
        Ok(mux)
    }

    /// Submit `command` to the endpoint chosen by [`EndpointSelector::Auto`].
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::submit_to`].
    pub fn submit(&self, command: Command, flags: RequestFlags) -> Result<ReplyFuture, MuxError> {
        self.submit_to(EndpointSelector::Auto, command, flags)
    }

    /// Queue `command` on the endpoint chosen by `selector`.
    ///
    /// Returns as soon as the command is queued; await the returned future
    /// for the reply. Commands submitted from one task are written in
    /// submission order per endpoint.
    ///
    /// # Errors
    ///
    /// Fails without queuing anything when no endpoint matches, the command
    /// would take over the connection, the bridge's backlog is full or
    /// fails fast, or the multiplexer is shut down.
    pub fn submit_to(
        &self,
        selector: EndpointSelector,
        command: Command,
        flags: RequestFlags,
    ) -> Result<ReplyFuture, MuxError> {
        if let Some(name) = EXCLUSIVE_COMMANDS.iter().find(|name| command.is(name)) {
            return Err(MuxError::UnsupportedCommand((*name).to_owned()));
        }
        let inner = &self.inner;
        let index = inner.router.route(selector, &command, |i| {
            inner.interactive[i].state() == BridgeState::Connected
        })?;
        let bridge = &inner.interactive[index];
        let (request, reply) = PendingRequest::new(&command, flags);
        bridge.submit(request)?;
        tracing::debug!(endpoint = %bridge.endpoint(), %command, "command submitted");
        Ok(reply)
    }

    /// Submit `command` and wait for its reply up to the operation timeout.
    ///
    /// # Errors
    ///
    /// Returns submission errors, [`RequestError::Server`] for error replies,
    /// [`RequestError::Connection`] if the connection failed first and
    /// [`RequestError::Timeout`] once the operation timeout passes. A timed
    /// out command is still written and its reply discarded.
    pub async fn call(&self, command: Command) -> Result<RespValue, MuxError> {
        let reply = self.submit(command, RequestFlags::default())?;
        self.await_reply(reply).await
    }

    /// Wait for `reply` through the dispatcher, bounded by the operation
    /// timeout.
    async fn await_reply(&self, reply: ReplyFuture) -> Result<RespValue, MuxError> {
        let timeout = self.inner.operation_timeout;
        match self.inner.dispatcher.execute(reply, timeout).await? {
            Execution::Completed(result) => Ok(result?),
            Execution::TimedOut => Err(RequestError::Timeout(timeout).into()),
        }
    }

    /// Blocking variant of [`Multiplexer::call`] for synchronous callers,
    /// bounded by the sync timeout.
    ///
    /// # Errors
    ///
    /// As [`Multiplexer::call`], plus
    /// [`DispatchError::AsyncContext`](crate::DispatchError::AsyncContext)
    /// when called from inside a Tokio runtime.
    pub fn call_blocking(&self, command: Command) -> Result<RespValue, MuxError> {
        let reply = self.submit(command, RequestFlags::default())?;
        let timeout = self.inner.sync_timeout;
        match self.inner.dispatcher.execute_blocking(reply, timeout)? {
            Execution::Completed(result) => Ok(result?),
            Execution::TimedOut => Err(RequestError::Timeout(timeout).into()),
        }
    }

    /// Register `handler` for messages on `channel`.
    ///
    /// The first handler for a channel subscribes on the server and waits up
    /// to the operation timeout for the confirmation. If the subscription
    /// connection is down the registration still succeeds and is replayed
    /// once it reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::PubSubDisabled`] when pub/sub is off and
    /// [`RequestError::Server`] when the server rejects the subscription.
    pub async fn subscribe(
        &self,
        channel: Channel,
        handler: Handler,
    ) -> Result<SubscriptionId, MuxError> {
        let (pubsub, bridge) = self.inner.subscription_bridge(&channel)?;
        let registry = pubsub.delivery.registry();
        let (id, first) = registry.add(channel.clone(), handler);
        tracing::debug!(%id, %channel, first, "subscription added");
        if !first {
            return Ok(id);
        }
        let (request, reply) =
            PendingRequest::new(&channel.subscribe_command(), RequestFlags::default());
        if let Err(e) = bridge.submit(request) {
            registry.remove(id);
            return Err(e);
        }
        match self.await_reply(reply).await {
            Ok(_) => {}
            Err(MuxError::Request(RequestError::Server(message))) => {
                registry.remove(id);
                return Err(RequestError::Server(message).into());
            }
            Err(e) => tracing::debug!(%channel, error = %e, "subscription will be replayed"),
        }
        Ok(id)
    }

    /// Subscribe to `channel` and receive its messages as a stream.
    ///
    /// Dropping the stream unsubscribes.
    ///
    /// # Errors
    ///
    /// As [`Multiplexer::subscribe`].
    pub async fn subscribe_stream(&self, channel: Channel) -> Result<Subscription, MuxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |message: PubSubMessage| {
            // A closed receiver means the stream is being dropped.
            let _ = tx.send(message);
            async {}.boxed()
        });
        let id = self.subscribe(channel, handler).await?;
        let owner: Weak<MuxInner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(id, rx, owner))
    }

    /// Remove a handler registered with [`Multiplexer::subscribe`].
    ///
    /// The last handler for a channel unsubscribes on the server.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::UnknownSubscription`] for ids that are not
    /// registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), MuxError> {
        self.inner.remove_subscription(id)
    }

    /// Switch pub/sub delivery between publish order (`true`) and
    /// concurrent handlers (`false`). No-op when pub/sub is disabled.
    ///
    /// Messages published after a switch to concurrent delivery start only
    /// once every message still queued for ordered delivery has been
    /// handled.
    pub fn set_ordered_delivery(&self, ordered: bool) {
        if let Some(pubsub) = &self.inner.pubsub {
            pubsub.delivery.set_ordered(ordered);
        }
    }

    /// Receive connectivity events from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> { self.inner.events.subscribe() }

    fn bridges(&self) -> impl Iterator<Item = &Bridge> {
        let subscription = self
            .inner
            .pubsub
            .iter()
            .flat_map(|pubsub| pubsub.bridges.iter().flatten());
        self.inner.interactive.iter().chain(subscription)
    }

    /// Health and backlog figures of every bridge.
    #[must_use]
    pub fn status(&self) -> Vec<BridgeStatus> { self.bridges().map(Bridge::status).collect() }

    /// Recorded state changes of the bridge for `endpoint` and `kind`.
    #[must_use]
    pub fn transition_log(
        &self,
        endpoint: SocketAddr,
        kind: ConnectionKind,
    ) -> Option<Vec<Transition>> {
        self.bridges()
            .find(|bridge| bridge.endpoint() == endpoint && bridge.kind() == kind)
            .map(Bridge::transitions)
    }

    /// Reconnect every bridge that is not connected, ignoring the retry
    /// policy. Returns how many bridges were asked to reconnect.
    pub fn reconnect(&self) -> usize { self.bridges().filter(|bridge| bridge.reconnect()).count() }

    /// Fail the live connections of every bridge of `kind` with
    /// [`ConnectionError::Simulated`]. Returns how many were failed.
    pub fn simulate_connection_failure(&self, kind: ConnectionKind) -> usize {
        self.bridges()
            .filter(|bridge| bridge.kind() == kind && bridge.simulate_failure())
            .count()
    }

    /// Number of dispatcher continuations still running, including
    /// timed-out calls whose replies have not arrived.
    #[must_use]
    pub fn detached_calls(&self) -> usize { self.inner.dispatcher.in_flight() }

    /// Shut down: fail queued and awaiting requests with
    /// [`ConnectionError::Shutdown`] and wait for background tasks to stop.
    ///
    /// Other handles see [`MuxError::Shutdown`] afterwards.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("multiplexer closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{DuplexStream, duplex};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{connection::MockConnector, resp::RespCodec};

    fn addr(port: u16) -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], port)) }

    fn refusing() -> MockConnector {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            Box::pin(async { Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)) })
        });
        connector
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_is_reachable() {
        let config = MultiplexerConfig::new()
            .endpoint(EndpointConfig::primary(addr(1)))
            .connector(refusing());
        let err = Multiplexer::connect(config).await.expect_err("no endpoint");
        assert!(matches!(
            err,
            MuxError::ConnectFailed(ConnectionError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn exclusive_commands_are_rejected() {
        let config = MultiplexerConfig::new()
            .endpoint(EndpointConfig::primary(addr(1)))
            .connector(refusing())
            .abort_on_connect_fail(false)
            .pubsub(false);
        let mux = Multiplexer::connect(config).await.expect("connect");
        let err = mux
            .submit(Command::new("subscribe").arg("news"), RequestFlags::default())
            .expect_err("exclusive");
        assert!(matches!(err, MuxError::UnsupportedCommand(name) if name == "SUBSCRIBE"));
        assert!(matches!(
            mux.subscribe_stream(Channel::literal("news")).await,
            Err(MuxError::PubSubDisabled)
        ));
        mux.close().await;
    }

    #[tokio::test]
    async fn dropping_last_handle_fails_queued_work() {
        let config = MultiplexerConfig::new()
            .endpoint(EndpointConfig::primary(addr(1)))
            .connector(refusing())
            .abort_on_connect_fail(false)
            .retry_policy(crate::LinearRetry::new(Duration::from_secs(3600)));
        let mux = Multiplexer::connect(config).await.expect("connect");
        let reply = mux
            .submit(Command::new("PING"), RequestFlags::default())
            .expect("queued");
        drop(mux);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), reply)
                .await
                .expect("completed"),
            Err(RequestError::Connection(ConnectionError::Shutdown))
        );
    }

    #[tokio::test]
    async fn unconfirmed_subscription_waits_like_a_call() {
        let config = MultiplexerConfig::new()
            .endpoint(EndpointConfig::primary(addr(1)))
            .connector(refusing())
            .abort_on_connect_fail(false)
            .operation_timeout(Duration::from_millis(50))
            .retry_policy(crate::LinearRetry::new(Duration::from_secs(3600)));
        let mux = Multiplexer::connect(config).await.expect("connect");

        let err = mux.call(Command::new("PING")).await.expect_err("no connection");
        assert!(matches!(
            err,
            MuxError::Request(RequestError::Timeout(t)) if t == Duration::from_millis(50)
        ));
        let calls = mux.detached_calls();
        let id = mux
            .subscribe(Channel::literal("news"), Arc::new(|_: PubSubMessage| async {}.boxed()))
            .await
            .expect("registered for replay");
        // The confirmation keeps waiting on the dispatcher like a timed-out call.
        assert_eq!(mux.detached_calls(), calls + 1);
        mux.unsubscribe(id).expect("registered");
        mux.close().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while mux.detached_calls() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("continuations end once queued work fails");
    }

    /// Connector whose every transport is served by a tiny in-process
    /// server. Unsubscribed channel names are reported on `unsubscribed`.
    fn serving(unsubscribed: mpsc::UnboundedSender<Bytes>) -> MockConnector {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_| {
            let (client, server) = duplex(8192);
            tokio::spawn(serve(Framed::new(server, RespCodec::default()), unsubscribed.clone()));
            Box::pin(async move { Ok(Box::new(client) as Box<dyn crate::Transport>) })
        });
        connector
    }

    async fn serve(
        mut io: Framed<DuplexStream, RespCodec>,
        unsubscribed: mpsc::UnboundedSender<Bytes>,
    ) {
        while let Some(Ok(frame)) = io.next().await {
            let Some(items) = frame.as_array() else { break };
            let name = items[0].to_bytes().unwrap_or_default().to_ascii_uppercase();
            let channel = items.get(1).and_then(RespValue::to_bytes).unwrap_or_default();
            let replies = match &name[..] {
                b"SUBSCRIBE" => vec![
                    RespValue::array(vec![
                        "subscribe".into(),
                        RespValue::bulk(channel.clone()),
                        RespValue::Integer(1),
                    ]),
                    RespValue::array(vec![
                        "message".into(),
                        RespValue::bulk(channel),
                        "hi".into(),
                    ]),
                ],
                b"UNSUBSCRIBE" => {
                    let _ = unsubscribed.send(channel.clone());
                    vec![RespValue::array(vec![
                        "unsubscribe".into(),
                        RespValue::bulk(channel),
                        RespValue::Integer(0),
                    ])]
                }
                _ => vec![RespValue::status("OK")],
            };
            for reply in replies {
                if io.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn stream_subscription_receives_messages_and_unsubscribes_on_drop() {
        let (tx, mut unsubscribed) = mpsc::unbounded_channel();
        let config = MultiplexerConfig::new()
            .endpoint(EndpointConfig::primary(addr(1)))
            .connector(serving(tx));
        let mux = Multiplexer::connect(config).await.expect("connect");
        assert_eq!(
            mux.call(Command::new("PING")).await.expect("reply"),
            RespValue::status("OK")
        );

        let mut stream = mux
            .subscribe_stream(Channel::literal("news"))
            .await
            .expect("subscribed");
        let message = stream.next().await.expect("message");
        assert_eq!(&message.channel[..], b"news");
        assert_eq!(&message.payload[..], b"hi");

        drop(stream);
        let channel = tokio::time::timeout(Duration::from_secs(1), unsubscribed.recv())
            .await
            .expect("unsubscribe sent")
            .expect("channel open");
        assert_eq!(&channel[..], b"news");
        assert!(matches!(
            mux.unsubscribe(SubscriptionId::from(1)),
            Err(MuxError::UnknownSubscription(_))
        ));
        mux.close().await;
    }
}

//! Physical connections: one transport, one writer, one reader.
//!
//! The writer runs inside the bridge supervisor task and owns the bridge
//! backlog for the lifetime of the connection. It moves each request onto
//! the awaiting-reply queue and then writes its bytes, flushing whenever the
//! backlog is momentarily empty so back-to-back submissions share a write.
//! The reader is a dedicated task that decodes replies and completes the
//! awaiting queue head in order.
//!
//! A connection fails exactly once. The first cause wins, both halves stop,
//! and every request that was written but not answered is completed with
//! that cause. Requests taken from the backlog but not yet written are handed
//! back to it for the next connection.

mod counter;
mod pending;
mod reader;
mod transport;
mod writer;

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

pub use counter::active_connection_count;
use counter::ActiveConnection;
pub(crate) use pending::{AwaitingReply, Delivered, PendingRequest};
pub use pending::{ReplyFuture, RequestFlags};
use reader::Reader;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
#[cfg(test)]
pub(crate) use transport::MockConnector;
pub use transport::{Connector, SocketOptions, TcpConnector, Transport};
use writer::Writer;

use crate::{
    bridge::{Backlog, BridgeCounters},
    error::ConnectionError,
    pubsub::Delivery,
    resp::DecoderLimits,
};

/// Traffic carried by a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Request/reply commands.
    Interactive,
    /// Subscription commands and published messages.
    Subscription,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interactive => "interactive",
            Self::Subscription => "subscription",
        })
    }
}

/// Shared failure state of one physical connection.
///
/// Cancelling the bridge's shutdown token cancels every link derived from it;
/// such a link reports [`ConnectionError::Shutdown`].
#[derive(Debug)]
pub(crate) struct Link {
    endpoint: SocketAddr,
    kind: ConnectionKind,
    cause: OnceLock<ConnectionError>,
    token: CancellationToken,
}

impl Link {
    fn new(endpoint: SocketAddr, kind: ConnectionKind, shutdown: &CancellationToken) -> Self {
        Self {
            endpoint,
            kind,
            cause: OnceLock::new(),
            token: shutdown.child_token(),
        }
    }

    /// Fail the connection. Returns `false` if it had already failed.
    pub(crate) fn fail(&self, cause: ConnectionError) -> bool {
        let first = !self.token.is_cancelled() && self.cause.set(cause).is_ok();
        self.token.cancel();
        if first {
            let cause = self.cause();
            if cause == ConnectionError::Shutdown {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    kind = %self.kind,
                    "connection stopping"
                );
            } else {
                crate::metrics::inc_connection_failures();
                tracing::warn!(
                    endpoint = %self.endpoint,
                    kind = %self.kind,
                    error = %cause,
                    "connection failed"
                );
            }
        }
        first
    }

    /// The recorded failure, or [`ConnectionError::Shutdown`] if the link was
    /// cancelled from above.
    pub(crate) fn cause(&self) -> ConnectionError {
        self.cause.get().cloned().unwrap_or(ConnectionError::Shutdown)
    }

    pub(crate) fn is_failed(&self) -> bool { self.token.is_cancelled() }

    pub(crate) async fn cancelled(&self) { self.token.cancelled().await }
}

/// Everything a connection needs from its bridge.
pub(crate) struct ConnectionSettings {
    pub(crate) endpoint: SocketAddr,
    pub(crate) kind: ConnectionKind,
    pub(crate) limits: DecoderLimits,
    pub(crate) counters: Arc<BridgeCounters>,
    pub(crate) delivery: Option<Delivery>,
}

/// A live transport with its reader running.
pub(crate) struct PhysicalConnection {
    link: Arc<Link>,
    writer: Writer,
    reader: JoinHandle<()>,
    _active: ActiveConnection,
}

impl PhysicalConnection {
    /// Split `transport` and spawn its reader.
    pub(crate) fn start(
        transport: Box<dyn Transport>,
        settings: ConnectionSettings,
        shutdown: &CancellationToken,
    ) -> Self {
        let ConnectionSettings {
            endpoint,
            kind,
            limits,
            counters,
            delivery,
        } = settings;
        let (read, write) = tokio::io::split(transport);
        let link = Arc::new(Link::new(endpoint, kind, shutdown));
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Reader::new(
            read,
            limits,
            rx,
            kind,
            delivery,
            Arc::clone(&counters),
            Arc::clone(&link),
        );
        Self {
            reader: tokio::spawn(reader.run()),
            writer: Writer::new(write, tx, counters),
            link,
            _active: ActiveConnection::new(endpoint, kind),
        }
    }

    pub(crate) fn link(&self) -> Arc<Link> { Arc::clone(&self.link) }

    /// Write `replay` and then the backlog until the connection fails.
    ///
    /// Returns the failure cause once the reader has stopped and every
    /// awaiting request has been completed. Replay requests that could not
    /// be written are dropped; the next connection replays afresh.
    pub(crate) async fn drive(
        self,
        backlog: &mut Backlog,
        replay: Vec<PendingRequest>,
    ) -> ConnectionError {
        let Self {
            link,
            mut writer,
            reader,
            _active,
        } = self;

        for request in replay {
            if link.is_failed() {
                break;
            }
            send(&mut writer, &link, request).await;
        }

        while !link.is_failed() {
            let request = if let Some(request) = backlog.try_next() {
                request
            } else {
                let flushed = tokio::select! {
                    biased;
                    () = link.cancelled() => break,
                    flushed = writer.flush() => flushed,
                };
                if let Err(e) = flushed {
                    link.fail(e.into());
                    break;
                }
                tokio::select! {
                    biased;
                    () = link.cancelled() => break,
                    next = backlog.next() => match next {
                        Some(request) => request,
                        None => {
                            link.fail(ConnectionError::Shutdown);
                            break;
                        }
                    },
                }
            };
            if link.is_failed() {
                backlog.carry(request);
                break;
            }
            send(&mut writer, &link, request).await;
        }

        drop(writer);
        if let Err(e) = reader.await {
            tracing::error!(error = %e, "connection reader panicked");
        }
        link.cause()
    }
}

async fn send(writer: &mut Writer, link: &Link, request: PendingRequest) {
    let Some(payload) = writer.enqueue(request, link) else {
        return;
    };
    let written = tokio::select! {
        biased;
        () = link.cancelled() => return,
        written = writer.write(&payload) => written,
    };
    if let Err(e) = written {
        link.fail(e.into());
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use futures::{FutureExt, SinkExt, StreamExt};
    use rstest::{fixture, rstest};
    use tokio::io::{DuplexStream, duplex};
    use tokio_util::{codec::Framed, task::TaskTracker};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        bridge::{BacklogSender, backlog},
        error::RequestError,
        pubsub::{Channel, Handler, PubSubMessage, SubscriptionRegistry},
        resp::{Command, RespCodec, RespValue},
    };

    struct Harness {
        tx: BacklogSender,
        rx: Backlog,
        counters: Arc<BridgeCounters>,
        shutdown: CancellationToken,
    }

    #[fixture]
    fn harness() -> Harness {
        let counters = Arc::new(BridgeCounters::default());
        let (tx, rx) = backlog(128, Arc::clone(&counters));
        Harness {
            tx,
            rx,
            counters,
            shutdown: CancellationToken::new(),
        }
    }

    impl Harness {
        fn submit(&self, command: Command, flags: RequestFlags) -> ReplyFuture {
            let (request, reply) = PendingRequest::new(&command, flags);
            self.tx.try_push(request).expect("backlog accepts request");
            reply
        }

        fn connect(
            &self,
            kind: ConnectionKind,
            delivery: Option<Delivery>,
        ) -> (PhysicalConnection, Framed<DuplexStream, RespCodec>) {
            let (client, server) = duplex(4096);
            let settings = ConnectionSettings {
                endpoint: "127.0.0.1:6379".parse().expect("addr"),
                kind,
                limits: DecoderLimits::default(),
                counters: Arc::clone(&self.counters),
                delivery,
            };
            let connection = PhysicalConnection::start(Box::new(client), settings, &self.shutdown);
            (connection, Framed::new(server, RespCodec::default()))
        }
    }

    fn integer(i: usize) -> RespValue {
        RespValue::Integer(i64::try_from(i).expect("small index"))
    }

    async fn expect_command(server: &mut Framed<DuplexStream, RespCodec>, name: &str) {
        let value = server.next().await.expect("command").expect("decode");
        let items = value.as_array().expect("array");
        assert_eq!(items[0].as_bytes(), Some(name.as_bytes()));
    }

    #[rstest]
    #[tokio::test]
    async fn pipelined_replies_complete_in_order(harness: Harness) {
        let mut h = harness;
        let first = h.submit(Command::new("GET").key("a"), RequestFlags::default());
        let second = h.submit(Command::new("GET").key("b"), RequestFlags::default());
        let third = h.submit(Command::new("GET").key("c"), RequestFlags::default());
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        let link = connection.link();
        let shutdown = h.shutdown.clone();
        let driver = tokio::spawn(async move {
            let cause = connection.drive(&mut h.rx, Vec::new()).await;
            (cause, h)
        });

        for _ in 0..3 {
            expect_command(&mut server, "GET").await;
        }
        for reply in ["1", "2", "3"] {
            server.send(RespValue::from(reply)).await.expect("send");
        }
        assert_eq!(first.await, Ok(RespValue::from("1")));
        assert_eq!(second.await, Ok(RespValue::from("2")));
        assert_eq!(third.await, Ok(RespValue::from("3")));

        shutdown.cancel();
        let (cause, h) = driver.await.expect("join");
        assert_eq!(cause, ConnectionError::Shutdown);
        assert!(link.is_failed());
        let status = h.counters.snapshot(
            "127.0.0.1:6379".parse().expect("addr"),
            ConnectionKind::Interactive,
            crate::bridge::BridgeState::Connected,
        );
        assert_eq!((status.written, status.completed, status.awaiting), (3, 3, 0));
    }

    #[rstest]
    #[tokio::test]
    async fn fire_and_forget_reply_is_skipped(harness: Harness) {
        let mut h = harness;
        let ignored = h.submit(
            Command::new("SET").key("a").arg("1"),
            RequestFlags::default().fire_and_forget(true),
        );
        let tracked = h.submit(Command::new("GET").key("a"), RequestFlags::default());
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        let driver = tokio::spawn(async move { connection.drive(&mut h.rx, Vec::new()).await });

        expect_command(&mut server, "SET").await;
        expect_command(&mut server, "GET").await;
        server.send(RespValue::status("OK")).await.expect("send");
        server.send(RespValue::from("1")).await.expect("send");

        assert_eq!(ignored.await, Ok(RespValue::Bulk(None)));
        assert_eq!(tracked.await, Ok(RespValue::from("1")));
        driver.abort();
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    async fn unsolicited_reply_fails_connection(harness: Harness) {
        let mut h = harness;
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        server.send(RespValue::status("OK")).await.expect("send");
        let cause = connection.drive(&mut h.rx, Vec::new()).await;
        assert_eq!(cause, ConnectionError::UnexpectedReply);
        assert!(logs_contain("reply with no awaiting request"));
    }

    #[rstest]
    #[tokio::test]
    async fn eof_fails_written_requests_only(harness: Harness) {
        let mut h = harness;
        let written = h.submit(Command::new("GET").key("a"), RequestFlags::default());
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        let driver = tokio::spawn(async move {
            let cause = connection.drive(&mut h.rx, Vec::new()).await;
            (cause, h)
        });
        expect_command(&mut server, "GET").await;
        drop(server);

        let (cause, mut h) = driver.await.expect("join");
        assert_eq!(cause, ConnectionError::Closed);
        assert_eq!(
            written.await,
            Err(RequestError::Connection(ConnectionError::Closed))
        );

        // Work queued after the failure waits for the next connection.
        let queued = h.submit(Command::new("GET").key("b"), RequestFlags::default());
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        tokio::spawn(async move { connection.drive(&mut h.rx, Vec::new()).await });
        expect_command(&mut server, "GET").await;
        server.send(RespValue::from("b")).await.expect("send");
        assert_eq!(queued.await, Ok(RespValue::from("b")));
    }

    #[rstest]
    #[tokio::test]
    async fn simulated_failure_is_the_recorded_cause(harness: Harness) {
        let mut h = harness;
        let reply = h.submit(Command::new("BLPOP").key("q").arg("0"), RequestFlags::default());
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        let link = connection.link();
        let driver = tokio::spawn(async move { connection.drive(&mut h.rx, Vec::new()).await });
        expect_command(&mut server, "BLPOP").await;

        assert!(link.fail(ConnectionError::Simulated));
        assert!(!link.fail(ConnectionError::Closed));
        assert_eq!(driver.await.expect("join"), ConnectionError::Simulated);
        assert_eq!(
            reply.await,
            Err(RequestError::Connection(ConnectionError::Simulated))
        );
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_racing_replies_completes_each_request_once(harness: Harness) {
        const REQUESTS: usize = 100;
        const BEFORE_FAILURE: usize = 50;

        let mut h = harness;
        let replies: Vec<_> = (0..REQUESTS)
            .map(|i| h.submit(Command::new("GET").key(i.to_string()), RequestFlags::default()))
            .collect();
        let (connection, mut server) = h.connect(ConnectionKind::Interactive, None);
        let link = connection.link();
        let driver = tokio::spawn(async move {
            let cause = connection.drive(&mut h.rx, Vec::new()).await;
            (cause, h)
        });

        for _ in 0..REQUESTS {
            expect_command(&mut server, "GET").await;
        }
        let resume = Arc::new(tokio::sync::Notify::new());
        let resumed = Arc::clone(&resume);
        let streamer = tokio::spawn(async move {
            for i in 0..REQUESTS {
                if i == BEFORE_FAILURE {
                    resumed.notified().await;
                }
                if server.send(integer(i)).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let mut outcomes = Vec::new();
        let mut replies = replies.into_iter();
        for reply in replies.by_ref().take(BEFORE_FAILURE) {
            outcomes.push(reply.await);
        }
        resume.notify_one();
        assert!(link.fail(ConnectionError::Simulated));
        for reply in replies {
            outcomes.push(reply.await);
        }
        let (cause, h) = driver.await.expect("join");
        streamer.abort();

        assert_eq!(cause, ConnectionError::Simulated);
        let answered = outcomes.iter().take_while(|outcome| outcome.is_ok()).count();
        assert!(answered >= BEFORE_FAILURE);
        for (i, outcome) in outcomes.iter().enumerate() {
            if i < answered {
                assert_eq!(outcome, &Ok(integer(i)));
            } else {
                assert_eq!(
                    outcome,
                    &Err(RequestError::Connection(ConnectionError::Simulated))
                );
            }
        }
        let status = h.counters.snapshot(
            "127.0.0.1:6379".parse().expect("addr"),
            ConnectionKind::Interactive,
            crate::bridge::BridgeState::Failed,
        );
        assert_eq!(status.written, u64::try_from(REQUESTS).expect("count"));
        assert_eq!(status.completed + status.failed, status.written);
        assert_eq!(status.completed, u64::try_from(answered).expect("count"));
        assert_eq!(status.awaiting, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn subscription_connection_routes_push_messages(harness: Harness) {
        let mut h = harness;
        let registry = Arc::new(SubscriptionRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |message: PubSubMessage| {
            sink.lock().expect("lock").push(message.payload);
            async {}.boxed()
        });
        let news = Channel::literal("news");
        registry.add(news.clone(), handler);
        let tracker = TaskTracker::new();
        let delivery = Delivery::start(registry, true, tracker, h.shutdown.clone());

        let (connection, mut server) = h.connect(ConnectionKind::Subscription, Some(delivery));
        let replay = vec![PendingRequest::internal(&news.subscribe_command())];
        tokio::spawn(async move { connection.drive(&mut h.rx, replay).await });

        expect_command(&mut server, "SUBSCRIBE").await;
        let confirm = RespValue::array(vec![
            RespValue::from("subscribe"),
            RespValue::from("news"),
            RespValue::Integer(1),
        ]);
        let push = RespValue::array(vec![
            RespValue::from("message"),
            RespValue::from("news"),
            RespValue::from("hello"),
        ]);
        server.send(confirm).await.expect("send");
        server.send(push).await.expect("send");

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().expect("lock").is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("message delivered");
        assert_eq!(seen.lock().expect("lock")[0], &b"hello"[..]);
    }
}

//! In-process RESP server for exercising the multiplexer over real sockets.
//!
//! [`MockServer`] understands a small command set (`PING`, `ECHO`, `GET`,
//! `SET`, `DEL`, `INCR`, `PUBLISH`, the subscribe family and a `SLEEP`
//! command that stalls the connection) and records every command it
//! receives. Tests can drop all live connections with
//! [`MockServer::kill_connections`] to simulate an outage.

use std::{
    collections::{HashMap, HashSet},
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use respmux::{RespCodec, RespValue};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};

type Published = (Bytes, Bytes);

#[derive(Debug, Default)]
struct Subscriptions {
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

impl Subscriptions {
    fn count(&self) -> i64 {
        i64::try_from(self.channels.len() + self.patterns.len()).unwrap_or(i64::MAX)
    }

    fn matches(&self, channel: &[u8]) -> bool {
        self.channels.contains(channel) || self.patterns.iter().any(|p| glob_match(p, channel))
    }
}

#[derive(Debug)]
struct State {
    data: Mutex<HashMap<Bytes, Bytes>>,
    log: Mutex<Vec<Vec<Bytes>>>,
    subscriptions: Mutex<HashMap<u64, Subscriptions>>,
    published: broadcast::Sender<Published>,
    kill: watch::Sender<u64>,
    accepted: AtomicUsize,
    live: AtomicUsize,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A RESP server listening on an ephemeral localhost port.
///
/// Dropping the server stops it and closes every connection.
///
/// ```rust,no_run
/// use respmux_testing::MockServer;
///
/// # async fn demo() -> std::io::Result<()> {
/// let server = MockServer::start().await?;
/// println!("listening on {}", server.addr());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl MockServer {
    /// Bind to an unused localhost port and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns any error raised while binding the listener.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (published, _) = broadcast::channel(1024);
        let state = Arc::new(State {
            data: Mutex::default(),
            log: Mutex::default(),
            subscriptions: Mutex::default(),
            published,
            kill: watch::Sender::new(0),
            accepted: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            Arc::clone(&state),
            tracker.clone(),
            shutdown.clone(),
        ));
        Ok(Self {
            addr,
            state,
            shutdown,
            tracker,
        })
    }

    /// Address the server listens on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr { self.addr }

    /// Connections accepted since start.
    #[must_use]
    pub fn accepted(&self) -> usize { self.state.accepted.load(Ordering::SeqCst) }

    /// Connections currently open.
    #[must_use]
    pub fn live_connections(&self) -> usize { self.state.live.load(Ordering::SeqCst) }

    /// Every command received so far, rendered lossily as strings.
    #[must_use]
    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.state.log)
            .iter()
            .map(|args| {
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            })
            .collect()
    }

    /// Commands named `name` (case-insensitive), in arrival order.
    #[must_use]
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|args| args.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .collect()
    }

    /// Current value stored under `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Bytes> {
        lock(&self.state.data).get(key.as_bytes()).cloned()
    }

    /// Publish `payload` on `channel` as if a client had sent `PUBLISH`.
    /// Returns the number of connections subscribed to it.
    pub fn publish(&self, channel: &str, payload: &str) -> i64 {
        publish(
            &self.state,
            Bytes::copy_from_slice(channel.as_bytes()),
            Bytes::copy_from_slice(payload.as_bytes()),
        )
    }

    /// Close every open connection. New connections are still accepted.
    pub fn kill_connections(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    /// Stop accepting and close every connection, waiting for the server
    /// tasks to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<State>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                state.accepted.fetch_add(1, Ordering::SeqCst);
                tracker.spawn(serve(stream, Arc::clone(&state), shutdown.clone()));
            }
            Err(e) => tracing::warn!(error = %e, "mock server accept failed"),
        }
    }
}

enum Input {
    Command(RespValue),
    Pushes(Vec<RespValue>),
}

async fn serve(stream: TcpStream, state: Arc<State>, shutdown: CancellationToken) {
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    state.live.fetch_add(1, Ordering::SeqCst);
    lock(&state.subscriptions).insert(id, Subscriptions::default());
    let mut kill = state.kill.subscribe();
    let mut published = state.published.subscribe();
    let mut io = Framed::new(stream, RespCodec::default());

    loop {
        let input = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = kill.changed() => break,
            message = published.recv() => match message {
                Ok((channel, payload)) => Input::Pushes(pushes(&state, id, &channel, &payload)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = io.next() => match frame {
                Some(Ok(frame)) => Input::Command(frame),
                _ => break,
            },
        };
        let replies = match input {
            // A stalled command is cut short when connections are killed.
            Input::Command(frame) => tokio::select! {
                biased;
                _ = kill.changed() => break,
                replies = execute(&state, id, frame) => replies,
            },
            Input::Pushes(pushes) => pushes,
        };
        for reply in replies {
            if io.feed(reply).await.is_err() {
                break;
            }
        }
        if SinkExt::<RespValue>::flush(&mut io).await.is_err() {
            break;
        }
    }

    lock(&state.subscriptions).remove(&id);
    state.live.fetch_sub(1, Ordering::SeqCst);
}

fn pushes(state: &State, id: u64, channel: &Bytes, payload: &Bytes) -> Vec<RespValue> {
    let subscriptions = lock(&state.subscriptions);
    let Some(subs) = subscriptions.get(&id) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if subs.channels.contains(channel) {
        out.push(RespValue::array(vec![
            "message".into(),
            RespValue::bulk(channel.clone()),
            RespValue::bulk(payload.clone()),
        ]));
    }
    for pattern in subs.patterns.iter().filter(|p| glob_match(p, channel)) {
        out.push(RespValue::array(vec![
            "pmessage".into(),
            RespValue::bulk(pattern.clone()),
            RespValue::bulk(channel.clone()),
            RespValue::bulk(payload.clone()),
        ]));
    }
    out
}

fn publish(state: &State, channel: Bytes, payload: Bytes) -> i64 {
    let receivers = lock(&state.subscriptions)
        .values()
        .filter(|subs| subs.matches(&channel))
        .count();
    let _ = state.published.send((channel, payload));
    i64::try_from(receivers).unwrap_or(i64::MAX)
}

fn error(message: impl Into<String>) -> RespValue { RespValue::Error(message.into()) }

async fn execute(state: &State, id: u64, frame: RespValue) -> Vec<RespValue> {
    let Some(args) = frame
        .as_array()
        .and_then(|items| items.iter().map(RespValue::to_bytes).collect::<Option<Vec<_>>>())
    else {
        return vec![error("ERR Protocol error: expected an array of bulk strings")];
    };
    let Some((name, rest)) = args.split_first() else {
        return vec![error("ERR Protocol error: empty command")];
    };
    lock(&state.log).push(args.clone());
    let name = name.to_ascii_uppercase();

    if let (b"SLEEP", [millis]) = (&name[..], rest) {
        let millis = std::str::from_utf8(millis)
            .ok()
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        return vec![RespValue::status("OK")];
    }
    command(state, id, &name, rest)
}

fn command(state: &State, id: u64, name: &[u8], rest: &[Bytes]) -> Vec<RespValue> {
    let reply = match (name, rest) {
        (b"PING", []) => RespValue::status("PONG"),
        (b"PING" | b"ECHO", [message]) => RespValue::bulk(message.clone()),
        (b"GET", [key]) => {
            let value = lock(&state.data).get(key).cloned();
            value.map_or(RespValue::Bulk(None), RespValue::bulk)
        }
        (b"SET", [key, value]) => {
            lock(&state.data).insert(key.clone(), value.clone());
            RespValue::status("OK")
        }
        (b"DEL", keys) if !keys.is_empty() => {
            let mut data = lock(&state.data);
            let removed = keys.iter().filter(|key| data.remove(*key).is_some()).count();
            RespValue::Integer(i64::try_from(removed).unwrap_or(i64::MAX))
        }
        (b"INCR", [key]) => incr(state, key),
        (b"SUBSCRIBE" | b"PSUBSCRIBE", channels) if !channels.is_empty() => {
            return subscribe(state, id, name, channels);
        }
        (b"UNSUBSCRIBE" | b"PUNSUBSCRIBE", channels) => {
            return unsubscribe(state, id, name, channels);
        }
        (b"PUBLISH", [channel, payload]) => {
            RespValue::Integer(publish(state, channel.clone(), payload.clone()))
        }
        _ => error(format!(
            "ERR unknown command or wrong arguments '{}'",
            String::from_utf8_lossy(name).to_lowercase()
        )),
    };
    vec![reply]
}

fn incr(state: &State, key: &Bytes) -> RespValue {
    let mut data = lock(&state.data);
    let current = match data.get(key) {
        None => Some(0),
        Some(value) => std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<i64>().ok()),
    };
    match current.and_then(|n| n.checked_add(1)) {
        Some(next) => {
            data.insert(key.clone(), Bytes::from(next.to_string()));
            RespValue::Integer(next)
        }
        None => error("ERR value is not an integer or out of range"),
    }
}

fn subscribe(state: &State, id: u64, name: &[u8], channels: &[Bytes]) -> Vec<RespValue> {
    let pattern = name == b"PSUBSCRIBE";
    let kind = if pattern { "psubscribe" } else { "subscribe" };
    let mut subscriptions = lock(&state.subscriptions);
    let subs = subscriptions.entry(id).or_default();
    channels
        .iter()
        .map(|channel| {
            if pattern {
                subs.patterns.insert(channel.clone());
            } else {
                subs.channels.insert(channel.clone());
            }
            RespValue::array(vec![
                kind.into(),
                RespValue::bulk(channel.clone()),
                RespValue::Integer(subs.count()),
            ])
        })
        .collect()
}

fn unsubscribe(state: &State, id: u64, name: &[u8], channels: &[Bytes]) -> Vec<RespValue> {
    let pattern = name == b"PUNSUBSCRIBE";
    let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
    let mut subscriptions = lock(&state.subscriptions);
    let subs = subscriptions.entry(id).or_default();
    let targets: Vec<Bytes> = match (channels, pattern) {
        ([], false) => subs.channels.iter().cloned().collect(),
        ([], true) => subs.patterns.iter().cloned().collect(),
        (channels, _) => channels.to_vec(),
    };
    if targets.is_empty() {
        return vec![RespValue::array(vec![
            kind.into(),
            RespValue::Bulk(None),
            RespValue::Integer(subs.count()),
        ])];
    }
    targets
        .into_iter()
        .map(|channel| {
            if pattern {
                subs.patterns.remove(&channel);
            } else {
                subs.channels.remove(&channel);
            }
            RespValue::array(vec![
                kind.into(),
                RespValue::bulk(channel),
                RespValue::Integer(subs.count()),
            ])
        })
        .collect()
}

/// Glob matching supporting `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, None) => true,
        (Some((b'*', rest)), _) => {
            glob_match(rest, text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some((b'?', p)), Some((_, t))) => glob_match(p, t),
        (Some((pc, p)), Some((tc, t))) => pc == tc && glob_match(p, t),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::glob_match;

    #[rstest]
    #[case(b"news.*", b"news.sport", true)]
    #[case(b"news.*", b"weather", false)]
    #[case(b"h?llo", b"hello", true)]
    #[case(b"*", b"", true)]
    #[case(b"a*b*c", b"aXXbYc", true)]
    #[case(b"a*b*c", b"aXXbY", false)]
    fn glob_patterns(#[case] pattern: &[u8], #[case] text: &[u8], #[case] expected: bool) {
        assert_eq!(glob_match(pattern, text), expected);
    }
}

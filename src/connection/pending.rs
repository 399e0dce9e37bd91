//! Requests on their way to the wire and the completion handles callers hold.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    error::{ConnectionError, RequestError},
    resp::{Command, RespValue},
};

type Completion = oneshot::Sender<Result<RespValue, RequestError>>;

/// Per-request submission flags.
///
/// # Examples
///
/// ```
/// use respmux::RequestFlags;
///
/// let flags = RequestFlags::default().high_priority(true);
/// assert!(flags.is_high_priority());
/// assert!(!flags.is_fire_and_forget());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestFlags {
    fire_and_forget: bool,
    high_priority: bool,
}

impl RequestFlags {
    /// Write the command without tracking its reply for the caller.
    ///
    /// The reply is still read and discarded so later replies stay correlated.
    #[must_use]
    pub fn fire_and_forget(mut self, enabled: bool) -> Self {
        self.fire_and_forget = enabled;
        self
    }

    /// Let the command overtake normal requests that are still queued.
    ///
    /// It never overtakes a request that has already been written.
    #[must_use]
    pub fn high_priority(mut self, enabled: bool) -> Self {
        self.high_priority = enabled;
        self
    }

    /// Whether the reply is discarded.
    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool { self.fire_and_forget }

    /// Whether the request is queued ahead of normal traffic.
    #[must_use]
    pub fn is_high_priority(&self) -> bool { self.high_priority }
}

/// A request queued on a bridge and not yet written.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    payload: Bytes,
    sink: Option<Completion>,
    submitted: Instant,
    flags: RequestFlags,
}

impl PendingRequest {
    /// Encode `command` and pair it with the handle its caller awaits.
    pub(crate) fn new(command: &Command, flags: RequestFlags) -> (Self, ReplyFuture) {
        let payload = command.encode();
        if flags.is_fire_and_forget() {
            return (Self::untracked(payload, flags), ReplyFuture::detached());
        }
        let (tx, rx) = oneshot::channel();
        let request = Self {
            payload,
            sink: Some(tx),
            submitted: Instant::now(),
            flags,
        };
        (request, ReplyFuture::pending(rx))
    }

    /// A request whose reply nobody waits for, such as a subscription replay.
    pub(crate) fn internal(command: &Command) -> Self {
        Self::untracked(command.encode(), RequestFlags::default().fire_and_forget(true))
    }

    fn untracked(payload: Bytes, flags: RequestFlags) -> Self {
        Self {
            payload,
            sink: None,
            submitted: Instant::now(),
            flags,
        }
    }

    pub(crate) fn flags(&self) -> RequestFlags { self.flags }

    /// Complete the request without writing it.
    pub(crate) fn fail(self, error: ConnectionError) {
        if let Some(sink) = self.sink {
            let _ = sink.send(Err(RequestError::Connection(error)));
        }
    }

    /// Split into the bytes to write and the slot that receives the reply.
    pub(crate) fn into_awaiting(self, seq: u64) -> (Bytes, AwaitingReply) {
        let awaiting = AwaitingReply {
            seq,
            sink: self.sink,
            submitted: self.submitted,
        };
        (self.payload, awaiting)
    }
}

/// What became of a reply handed to an [`AwaitingReply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivered {
    /// The caller received the reply.
    Caller,
    /// The request was fire-and-forget.
    Discarded,
    /// The caller stopped waiting before the reply arrived.
    Abandoned,
}

/// A written request waiting for its reply, in write order.
#[derive(Debug)]
pub(crate) struct AwaitingReply {
    seq: u64,
    sink: Option<Completion>,
    submitted: Instant,
}

impl AwaitingReply {
    pub(crate) fn seq(&self) -> u64 { self.seq }

    /// Complete with the reply read from the wire.
    ///
    /// An error reply completes the caller with [`RequestError::Server`].
    pub(crate) fn complete(self, value: RespValue) -> Delivered {
        let Some(sink) = self.sink else {
            return Delivered::Discarded;
        };
        let result = match value {
            RespValue::Error(message) => Err(RequestError::Server(message)),
            value => Ok(value),
        };
        tracing::trace!(
            seq = self.seq,
            latency_us = u64::try_from(self.submitted.elapsed().as_micros()).unwrap_or(u64::MAX),
            "reply correlated"
        );
        match sink.send(result) {
            Ok(()) => Delivered::Caller,
            Err(_) => Delivered::Abandoned,
        }
    }

    /// Complete with the failure that ended the connection.
    pub(crate) fn fail(self, error: ConnectionError) -> Delivered {
        let Some(sink) = self.sink else {
            return Delivered::Discarded;
        };
        match sink.send(Err(RequestError::Connection(error))) {
            Ok(()) => Delivered::Caller,
            Err(_) => Delivered::Abandoned,
        }
    }
}

/// Handle resolving to the reply of a submitted command.
///
/// Dropping it abandons interest in the reply; the command itself is still
/// written and its reply consumed. A fire-and-forget submission resolves
/// immediately to a null bulk string.
#[derive(Debug)]
#[must_use = "replies are discarded unless the future is awaited"]
pub struct ReplyFuture {
    rx: Option<oneshot::Receiver<Result<RespValue, RequestError>>>,
}

impl ReplyFuture {
    fn pending(rx: oneshot::Receiver<Result<RespValue, RequestError>>) -> Self {
        Self { rx: Some(rx) }
    }

    fn detached() -> Self { Self { rx: None } }

    /// Returns `true` when no reply is tracked for this request.
    #[must_use]
    pub fn is_detached(&self) -> bool { self.rx.is_none() }
}

impl Future for ReplyFuture {
    type Output = Result<RespValue, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Ok(RespValue::Bulk(None)));
        };
        Pin::new(rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RequestError::Dropped)))
    }
}

//! Publish/subscribe registrations and message delivery.
//!
//! Subscription connections receive push messages that are not correlated to
//! any request. The reader recognises them with [`PubSubMessage::from_push`]
//! and hands them to [`Delivery`], which looks up the handlers registered for
//! the channel or pattern and runs them either one at a time in publish order
//! or concurrently.

mod delivery;
mod registry;

use std::{
    fmt,
    pin::Pin,
    sync::Weak,
    task::{Context, Poll},
};

use bytes::Bytes;
pub(crate) use delivery::Delivery;
use futures::{Stream, future::BoxFuture};
pub(crate) use registry::SubscriptionRegistry;
use tokio::sync::mpsc;

use crate::resp::{Command, RespValue};

/// Callback invoked for each message on a subscribed channel.
pub type Handler = std::sync::Arc<dyn Fn(PubSubMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A channel name or a glob-style channel pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Exact channel name, subscribed with `SUBSCRIBE`.
    Literal(Bytes),
    /// Channel pattern, subscribed with `PSUBSCRIBE`.
    Pattern(Bytes),
}

impl Channel {
    /// An exact channel name.
    #[must_use]
    pub fn literal(name: impl AsRef<[u8]>) -> Self {
        Self::Literal(Bytes::copy_from_slice(name.as_ref()))
    }

    /// A channel pattern such as `news.*`.
    #[must_use]
    pub fn pattern(pattern: impl AsRef<[u8]>) -> Self {
        Self::Pattern(Bytes::copy_from_slice(pattern.as_ref()))
    }

    /// The channel name or pattern.
    #[must_use]
    pub fn name(&self) -> &Bytes {
        match self {
            Self::Literal(name) | Self::Pattern(name) => name,
        }
    }

    pub(crate) fn subscribe_command(&self) -> Command {
        match self {
            Self::Literal(name) => Command::new("SUBSCRIBE").key(name),
            Self::Pattern(pattern) => Command::new("PSUBSCRIBE").arg(pattern),
        }
    }

    pub(crate) fn unsubscribe_command(&self) -> Command {
        match self {
            Self::Literal(name) => Command::new("UNSUBSCRIBE").key(name),
            Self::Pattern(pattern) => Command::new("PUNSUBSCRIBE").arg(pattern),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(name) => write!(f, "{}", name.escape_ascii()),
            Self::Pattern(pattern) => write!(f, "pattern {}", pattern.escape_ascii()),
        }
    }
}

/// A message published to a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Channel the message was published to.
    pub channel: Bytes,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    /// Message body.
    pub payload: Bytes,
}

impl PubSubMessage {
    /// Recognise a push message.
    ///
    /// Push messages are arrays whose first element names the push kind:
    /// `message` and `smessage` carry a channel and payload, `pmessage` a
    /// pattern, channel and payload. Subscription confirmations are not push
    /// messages; they answer the command that requested them.
    #[must_use]
    pub fn from_push(value: &RespValue) -> Option<Self> {
        let items = value.as_array()?;
        let (kind, rest) = items.split_first()?;
        let kind = kind.as_bytes()?;
        if kind.eq_ignore_ascii_case(b"message") || kind.eq_ignore_ascii_case(b"smessage") {
            let [channel, payload] = rest else {
                return None;
            };
            return Some(Self {
                channel: channel.to_bytes()?,
                pattern: None,
                payload: payload.to_bytes()?,
            });
        }
        if kind.eq_ignore_ascii_case(b"pmessage") {
            let [pattern, channel, payload] = rest else {
                return None;
            };
            return Some(Self {
                channel: channel.to_bytes()?,
                pattern: Some(pattern.to_bytes()?),
                payload: payload.to_bytes()?,
            });
        }
        None
    }

    /// The registration key this message is delivered to.
    pub(crate) fn route(&self) -> Channel {
        match &self.pattern {
            Some(pattern) => Channel::Pattern(pattern.clone()),
            None => Channel::Literal(self.channel.clone()),
        }
    }
}

/// Identifies one registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl From<u64> for SubscriptionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Something able to drop a subscription when its stream goes away.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Stream of messages for one channel, returned by
/// [`crate::Multiplexer::subscribe_stream`].
///
/// Dropping the stream unregisters it.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    owner: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        rx: mpsc::UnboundedReceiver<PubSubMessage>,
        owner: Weak<dyn Unsubscribe>,
    ) -> Self {
        Self { id, rx, owner }
    }

    /// Identifier of the underlying registration.
    #[must_use]
    pub fn id(&self) -> SubscriptionId { self.id }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.unsubscribe(self.id);
        }
    }
}

#![doc(html_root_url = "https://docs.rs/respmux/latest")]
//! Public API for the `respmux` library.
//!
//! `respmux` multiplexes many concurrent callers over a small, fixed set of
//! pipelined connections to RESP (Redis serialization protocol) servers.
//! Commands are queued per endpoint, written in order and matched to replies
//! by position. Each endpoint is supervised by a bridge that reconnects with
//! a pluggable retry policy, buffers traffic during outages and replays
//! pub/sub subscriptions once connected again.
//!
//! Start with [`Multiplexer::connect`] and a [`MultiplexerConfig`].

mod bridge;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod metrics;
mod multiplexer;
pub mod pubsub;
pub mod resp;
pub mod retry;

pub use bridge::{BacklogPolicy, BridgeState, BridgeStatus, ConnectionEvent, Transition};
pub use connection::{
    ConnectionKind,
    Connector,
    ReplyFuture,
    RequestFlags,
    SocketOptions,
    TcpConnector,
    Transport,
    active_connection_count,
};
pub use dispatch::{DispatchError, Dispatcher, Execution};
pub use error::{ConnectionError, MuxError, RequestError};
pub use multiplexer::{
    DEFAULT_BACKLOG_CAPACITY,
    DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_EVENT_CAPACITY,
    DEFAULT_HEARTBEAT,
    DEFAULT_MAX_WORKERS,
    DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_TRANSITION_LOG,
    EndpointConfig,
    EndpointSelector,
    Multiplexer,
    MultiplexerConfig,
    ReadPreference,
    Role,
    SLOT_COUNT,
    hash_slot,
};
pub use pubsub::{Channel, Handler, PubSubMessage, Subscription, SubscriptionId};
pub use resp::{Command, DecodeError, DecoderLimits, RespCodec, RespValue};
pub use retry::{ExponentialRetry, LinearRetry, RetryPolicy, RetryState};

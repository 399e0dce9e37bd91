//! Metric helpers for `respmux`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live physical connections.
pub const CONNECTIONS_ACTIVE: &str = "respmux_connections_active";
/// Name of the counter tracking commands written to a transport.
pub const COMMANDS_WRITTEN: &str = "respmux_commands_written_total";
/// Name of the counter tracking replies read from a transport.
pub const REPLIES_RECEIVED: &str = "respmux_replies_received_total";
/// Name of the counter tracking replies nobody was waiting for any more.
pub const REPLIES_ABANDONED: &str = "respmux_replies_abandoned_total";
/// Name of the counter tracking failed physical connections.
pub const CONNECTION_FAILURES: &str = "respmux_connection_failures_total";
/// Name of the counter tracking successful reconnects.
pub const RECONNECTS: &str = "respmux_reconnects_total";
/// Name of the counter tracking malformed input from servers.
pub const DECODE_ERRORS: &str = "respmux_decode_errors_total";
/// Name of the counter tracking pub/sub messages handed to handlers.
pub const PUBSUB_MESSAGES: &str = "respmux_pubsub_messages_total";

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a command written to a transport.
pub fn inc_commands() {
    #[cfg(feature = "metrics")]
    counter!(COMMANDS_WRITTEN).increment(1);
}

/// Record a reply read from a transport.
pub fn inc_replies() {
    #[cfg(feature = "metrics")]
    counter!(REPLIES_RECEIVED).increment(1);
}

/// Record a reply whose caller had already stopped waiting.
pub fn inc_abandoned() {
    #[cfg(feature = "metrics")]
    counter!(REPLIES_ABANDONED).increment(1);
}

/// Record a failed physical connection.
pub fn inc_connection_failures() {
    #[cfg(feature = "metrics")]
    counter!(CONNECTION_FAILURES).increment(1);
}

/// Record a successful reconnect.
pub fn inc_reconnects() {
    #[cfg(feature = "metrics")]
    counter!(RECONNECTS).increment(1);
}

/// Record a protocol decode error.
pub fn inc_decode_errors() {
    #[cfg(feature = "metrics")]
    counter!(DECODE_ERRORS).increment(1);
}

/// Record a pub/sub message routed to at least one handler.
pub fn inc_pubsub_messages() {
    #[cfg(feature = "metrics")]
    counter!(PUBSUB_MESSAGES).increment(1);
}

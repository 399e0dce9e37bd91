//! Multiplexer configuration.

use std::{fmt, net::SocketAddr, ops::RangeInclusive, sync::Arc, time::Duration};

use static_assertions::const_assert;

use super::routing::SLOT_COUNT;
use crate::{
    bridge::{BacklogPolicy, BridgeSettings},
    connection::{Connector, SocketOptions},
    error::MuxError,
    resp::DecoderLimits,
    retry::{ExponentialRetry, RetryPolicy},
};

/// Default time allowed for establishing a transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for [`crate::Multiplexer::call`].
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default interval at which failed bridges re-check their retry policy.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);
/// Default number of queued requests per bridge and priority.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 16 * 1024;
/// Default number of dispatcher continuations running at once.
pub const DEFAULT_MAX_WORKERS: usize = 64;
/// Default number of transitions each bridge remembers.
pub const DEFAULT_TRANSITION_LOG: usize = 64;
/// Default capacity of the connection event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

const_assert!(DEFAULT_BACKLOG_CAPACITY > 0);
const_assert!(DEFAULT_MAX_WORKERS > 0);
const_assert!(DEFAULT_TRANSITION_LOG > 0);
const_assert!(DEFAULT_EVENT_CAPACITY > 0);

const MIN_DURATION: Duration = Duration::from_millis(1);

/// Role of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts writes.
    Primary,
    /// Read-only copy of a primary.
    Replica,
}

/// One server the multiplexer connects to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Whether the server accepts writes.
    pub role: Role,
    /// Hash slots served. Empty means every slot.
    pub slots: Vec<RangeInclusive<u16>>,
}

impl EndpointConfig {
    /// A primary endpoint serving every slot.
    #[must_use]
    pub fn primary(addr: SocketAddr) -> Self {
        Self {
            addr,
            role: Role::Primary,
            slots: Vec::new(),
        }
    }

    /// A replica endpoint serving every slot.
    #[must_use]
    pub fn replica(addr: SocketAddr) -> Self {
        Self {
            addr,
            role: Role::Replica,
            slots: Vec::new(),
        }
    }

    /// Restrict the endpoint to the hash slots in `range`. May be repeated.
    #[must_use]
    pub fn slots(mut self, range: RangeInclusive<u16>) -> Self {
        self.slots.push(range);
        self
    }

    /// Returns `true` if this endpoint serves `slot`.
    #[must_use]
    pub fn serves(&self, slot: u16) -> bool {
        self.slots.is_empty() || self.slots.iter().any(|range| range.contains(&slot))
    }
}

/// Where [`crate::EndpointSelector::Auto`] sends read-only commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadPreference {
    /// Always read from a primary.
    #[default]
    Primary,
    /// Read from a connected replica when one exists.
    PreferReplica,
    /// Read only from replicas.
    Replica,
}

/// Settings for [`crate::Multiplexer::connect`].
///
/// Built with consuming setters; out-of-range values are clamped when the
/// multiplexer starts.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use respmux::{EndpointConfig, MultiplexerConfig, ReadPreference};
///
/// let config = MultiplexerConfig::new()
///     .endpoint(EndpointConfig::primary("127.0.0.1:6379".parse().unwrap()))
///     .endpoint(EndpointConfig::replica("127.0.0.1:6380".parse().unwrap()))
///     .read_preference(ReadPreference::PreferReplica)
///     .operation_timeout(Duration::from_millis(500));
/// assert_eq!(config.endpoints().len(), 2);
/// ```
#[derive(Clone)]
pub struct MultiplexerConfig {
    pub(crate) endpoints: Vec<EndpointConfig>,
    pub(crate) connect_timeout: Duration,
    pub(crate) operation_timeout: Duration,
    pub(crate) sync_timeout: Option<Duration>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) heartbeat: Duration,
    pub(crate) backlog_policy: BacklogPolicy,
    pub(crate) backlog_capacity: usize,
    pub(crate) read_preference: ReadPreference,
    pub(crate) ordered_pubsub: bool,
    pub(crate) pubsub: bool,
    pub(crate) max_workers: usize,
    pub(crate) limits: DecoderLimits,
    pub(crate) socket_options: SocketOptions,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    pub(crate) abort_on_connect_fail: bool,
    pub(crate) transition_log: usize,
    pub(crate) event_capacity: usize,
}

impl fmt::Debug for MultiplexerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerConfig")
            .field("endpoints", &self.endpoints)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("retry", &self.retry)
            .field("heartbeat", &self.heartbeat)
            .field("backlog_policy", &self.backlog_policy)
            .field("read_preference", &self.read_preference)
            .field("ordered_pubsub", &self.ordered_pubsub)
            .field("connector", &self.connector.as_ref().map(|_| "<custom>"))
            .finish_non_exhaustive()
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            sync_timeout: None,
            retry: Arc::new(ExponentialRetry::new(Duration::from_millis(5000))),
            heartbeat: DEFAULT_HEARTBEAT,
            backlog_policy: BacklogPolicy::Queue,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            read_preference: ReadPreference::Primary,
            ordered_pubsub: true,
            pubsub: true,
            max_workers: DEFAULT_MAX_WORKERS,
            limits: DecoderLimits::default(),
            socket_options: SocketOptions::default().nodelay(true),
            connector: None,
            abort_on_connect_fail: true,
            transition_log: DEFAULT_TRANSITION_LOG,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl MultiplexerConfig {
    /// Start from the defaults with no endpoints.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Add an endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Time allowed for each transport to connect.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Deadline applied by [`crate::Multiplexer::call`].
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Deadline applied by [`crate::Multiplexer::call_blocking`]. Defaults to
    /// the operation timeout.
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// Policy deciding when a failed bridge reconnects.
    #[must_use]
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// How often failed bridges re-check their retry policy.
    #[must_use]
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// What bridges do with submissions while disconnected.
    #[must_use]
    pub fn backlog_policy(mut self, policy: BacklogPolicy) -> Self {
        self.backlog_policy = policy;
        self
    }

    /// Queued requests allowed per bridge and priority.
    #[must_use]
    pub fn backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    /// Where read-only commands go by default.
    #[must_use]
    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.read_preference = preference;
        self
    }

    /// Deliver pub/sub messages one at a time in publish order (`true`) or
    /// concurrently (`false`).
    #[must_use]
    pub fn ordered_pubsub(mut self, ordered: bool) -> Self {
        self.ordered_pubsub = ordered;
        self
    }

    /// Open subscription connections to every primary.
    #[must_use]
    pub fn pubsub(mut self, enabled: bool) -> Self {
        self.pubsub = enabled;
        self
    }

    /// Continuations the dispatcher runs at once.
    #[must_use]
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Limits applied to server replies.
    #[must_use]
    pub fn decoder_limits(mut self, limits: DecoderLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Socket options for the default TCP connector.
    #[must_use]
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }

    /// Replace the TCP connector, for example with an in-memory transport.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Fail [`crate::Multiplexer::connect`] when no endpoint connects within
    /// the connect timeout. When disabled, the multiplexer starts anyway and
    /// keeps retrying in the background.
    #[must_use]
    pub fn abort_on_connect_fail(mut self, abort: bool) -> Self {
        self.abort_on_connect_fail = abort;
        self
    }

    /// Transitions each bridge remembers.
    #[must_use]
    pub fn transition_log(mut self, capacity: usize) -> Self {
        self.transition_log = capacity;
        self
    }

    /// Buffered connection events per subscriber.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Configured endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &[EndpointConfig] { &self.endpoints }

    /// Clamp durations and capacities to usable minimums.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use respmux::MultiplexerConfig;
    ///
    /// let config = MultiplexerConfig::new()
    ///     .heartbeat(Duration::ZERO)
    ///     .max_workers(0)
    ///     .normalized();
    /// assert_eq!(config.heartbeat_interval(), Duration::from_millis(1));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.connect_timeout = self.connect_timeout.max(MIN_DURATION);
        self.operation_timeout = self.operation_timeout.max(MIN_DURATION);
        self.sync_timeout = self.sync_timeout.map(|timeout| timeout.max(MIN_DURATION));
        self.heartbeat = self.heartbeat.max(MIN_DURATION);
        self.backlog_capacity = self.backlog_capacity.max(1);
        self.max_workers = self.max_workers.max(1);
        self.transition_log = self.transition_log.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self
    }

    /// The interval failed bridges re-check their retry policy at.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration { self.heartbeat }

    /// Check that the endpoints can be routed to.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Config`] when there are no endpoints, no primary,
    /// a duplicate address, or a slot outside `0..16384`.
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.endpoints.is_empty() {
            return Err(MuxError::Config("no endpoints configured".to_owned()));
        }
        if !self.endpoints.iter().any(|e| e.role == Role::Primary) {
            return Err(MuxError::Config("at least one primary is required".to_owned()));
        }
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if self.endpoints[..i].iter().any(|e| e.addr == endpoint.addr) {
                return Err(MuxError::Config(format!(
                    "endpoint {} configured twice",
                    endpoint.addr
                )));
            }
            if let Some(range) = endpoint
                .slots
                .iter()
                .find(|range| range.is_empty() || *range.end() >= SLOT_COUNT)
            {
                return Err(MuxError::Config(format!(
                    "invalid slot range {}..={} for {}",
                    range.start(),
                    range.end(),
                    endpoint.addr
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn call_timeout(&self) -> Duration { self.operation_timeout }

    pub(crate) fn blocking_timeout(&self) -> Duration {
        self.sync_timeout.unwrap_or(self.operation_timeout)
    }

    pub(crate) fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            connect_timeout: self.connect_timeout,
            heartbeat: self.heartbeat,
            backlog_policy: self.backlog_policy,
            backlog_capacity: self.backlog_capacity,
            retry: Arc::clone(&self.retry),
            limits: self.limits,
            log_capacity: self.transition_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn addr(port: u16) -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], port)) }

    #[rstest]
    #[case::empty(MultiplexerConfig::new(), "no endpoints")]
    #[case::replica_only(
        MultiplexerConfig::new().endpoint(EndpointConfig::replica(addr(1))),
        "primary"
    )]
    #[case::duplicate(
        MultiplexerConfig::new()
            .endpoint(EndpointConfig::primary(addr(1)))
            .endpoint(EndpointConfig::replica(addr(1))),
        "twice"
    )]
    #[case::slot_out_of_range(
        MultiplexerConfig::new().endpoint(EndpointConfig::primary(addr(1)).slots(0..=16384)),
        "slot range"
    )]
    fn invalid_configs_are_rejected(#[case] config: MultiplexerConfig, #[case] needle: &str) {
        let err = config.validate().expect_err("invalid config");
        assert!(err.to_string().contains(needle), "unexpected error: {err}");
    }

    #[test]
    fn normalization_clamps_to_minimums() {
        let config = MultiplexerConfig::new()
            .connect_timeout(Duration::ZERO)
            .backlog_capacity(0)
            .sync_timeout(Duration::ZERO)
            .normalized();
        assert_eq!(config.connect_timeout, MIN_DURATION);
        assert_eq!(config.backlog_capacity, 1);
        assert_eq!(config.blocking_timeout(), MIN_DURATION);
    }

    #[test]
    fn blocking_timeout_defaults_to_operation_timeout() {
        let config = MultiplexerConfig::new().operation_timeout(Duration::from_millis(250));
        assert_eq!(config.blocking_timeout(), Duration::from_millis(250));
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn endpoint_slot_membership() {
        let endpoint = EndpointConfig::primary(addr(1)).slots(0..=99).slots(200..=299);
        assert!(endpoint.serves(0));
        assert!(endpoint.serves(250));
        assert!(!endpoint.serves(150));
        assert!(EndpointConfig::replica(addr(2)).serves(16383));
    }
}

//! Fixtures and polling helpers for multiplexer integration tests.

use std::{net::SocketAddr, time::Duration};

use respmux::{EndpointConfig, LinearRetry, MultiplexerConfig};
use tokio::time::{Instant, sleep};

/// Shared result type for integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A configuration for one primary at `addr` tuned for fast tests: short
/// timeouts, a 10ms heartbeat and a linear 20ms retry policy.
///
/// ```rust
/// use respmux_testing::fast_config;
///
/// let config = fast_config("127.0.0.1:6379".parse().unwrap());
/// assert_eq!(config.endpoints().len(), 1);
/// ```
#[must_use]
pub fn fast_config(addr: SocketAddr) -> MultiplexerConfig {
    MultiplexerConfig::new()
        .endpoint(EndpointConfig::primary(addr))
        .connect_timeout(Duration::from_secs(1))
        .operation_timeout(Duration::from_secs(2))
        .heartbeat(Duration::from_millis(10))
        .retry_policy(LinearRetry::new(Duration::from_millis(20)))
}

/// Poll `condition` every 5ms until it holds or `within` elapses.
///
/// Returns whether the condition held in time.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

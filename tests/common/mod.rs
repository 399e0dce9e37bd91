//! Shared utilities for integration tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use respmux::{Multiplexer, MultiplexerConfig};
use respmux_testing::{FlakyConnector, MockServer, TestResult, fast_config};

/// A mock server with a multiplexer connected to it through a
/// [`FlakyConnector`] the test can switch off.
pub struct Harness {
    pub server: MockServer,
    pub connector: FlakyConnector,
    pub mux: Multiplexer,
}

impl Harness {
    /// Start a server and connect with [`fast_config`].
    pub async fn start() -> TestResult<Self> { Self::with(|config| config).await }

    /// Start a server and connect with [`fast_config`] adjusted by `tune`.
    pub async fn with(
        tune: impl FnOnce(MultiplexerConfig) -> MultiplexerConfig,
    ) -> TestResult<Self> {
        let server = MockServer::start().await?;
        let connector = FlakyConnector::new();
        let config = tune(fast_config(server.addr()).connector(connector.clone()));
        let mux = Multiplexer::connect(config).await?;
        Ok(Self {
            server,
            connector,
            mux,
        })
    }

    /// Refuse reconnects and drop every live connection.
    pub fn start_outage(&self) {
        self.connector.refuse(true);
        self.server.kill_connections();
    }

    /// Allow connections again.
    pub fn end_outage(&self) { self.connector.refuse(false); }
}

//! Test support for `respmux`.
//!
//! Provides an in-process RESP server, a connector that can refuse
//! connections on demand, configuration fixtures and assertion macros.
//!
//! ```rust,no_run
//! use respmux::{Command, Multiplexer};
//! use respmux_testing::{MockServer, fast_config};
//!
//! # async fn demo() -> respmux_testing::TestResult {
//! let server = MockServer::start().await?;
//! let mux = Multiplexer::connect(fast_config(server.addr())).await?;
//! let reply = mux.call(Command::new("PING")).await?;
//! assert_eq!(reply.to_string(), "PONG");
//! # Ok(())
//! # }
//! ```

pub mod connector;
pub mod helpers;
pub mod macros;
pub mod server;

pub use connector::FlakyConnector;
pub use helpers::{TestResult, eventually, fast_config};
pub use server::MockServer;

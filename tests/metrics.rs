#![cfg(feature = "metrics")]
//! Tests for `respmux` metrics.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use respmux::{Command, Multiplexer, metrics as m};
use respmux_testing::{MockServer, TestResult, fast_config};
use rstest::rstest;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter(snapshotter: &Snapshotter, name: &str) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(key, _, _, value)| match value {
            DebugValue::Counter(count) if key.key().name() == name => Some(count),
            _ => None,
        })
        .unwrap_or(0)
}

fn gauge(snapshotter: &Snapshotter, name: &str) -> Option<f64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(key, _, _, value)| match value {
            DebugValue::Gauge(level) if key.key().name() == name => Some(level.into_inner()),
            _ => None,
        })
}

#[rstest]
#[case(m::COMMANDS_WRITTEN, m::inc_commands as fn())]
#[case(m::REPLIES_RECEIVED, m::inc_replies as fn())]
#[case(m::REPLIES_ABANDONED, m::inc_abandoned as fn())]
#[case(m::CONNECTION_FAILURES, m::inc_connection_failures as fn())]
#[case(m::RECONNECTS, m::inc_reconnects as fn())]
#[case(m::DECODE_ERRORS, m::inc_decode_errors as fn())]
#[case(m::PUBSUB_MESSAGES, m::inc_pubsub_messages as fn())]
fn helpers_increment_their_counter(#[case] name: &str, #[case] helper: fn()) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        helper();
        helper();
    });
    assert_eq!(counter(&snapshotter, name), 2);
}

#[test]
fn multiplexer_traffic_is_counted() -> TestResult {
    let (snapshotter, recorder) = debugging_recorder_setup();
    // A current-thread runtime keeps every task on the thread that holds the
    // local recorder.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let server = MockServer::start().await?;
            let mux = Multiplexer::connect(fast_config(server.addr()).pubsub(false)).await?;
            for _ in 0..3 {
                mux.call(Command::new("PING")).await?;
            }
            assert_eq!(gauge(&snapshotter, m::CONNECTIONS_ACTIVE), Some(1.0));
            mux.close().await;
            TestResult::Ok(())
        })
    })?;

    assert_eq!(counter(&snapshotter, m::COMMANDS_WRITTEN), 3);
    assert_eq!(counter(&snapshotter, m::REPLIES_RECEIVED), 3);
    assert_eq!(counter(&snapshotter, m::CONNECTION_FAILURES), 0);
    assert_eq!(gauge(&snapshotter, m::CONNECTIONS_ACTIVE), Some(0.0));
    Ok(())
}

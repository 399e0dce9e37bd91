//! Assertion macros shared by integration tests.

/// Await a reply future and panic with contextual diagnostics on failure.
#[macro_export]
macro_rules! reply_expect {
    ($fut:expr) => {{
        $fut.await
            .expect(concat!("reply failed at ", file!(), ":", line!()))
    }};
    ($fut:expr, $msg:expr) => {{
        let m = ::std::format!("{msg} at {}:{}", file!(), line!(), msg = $msg);
        $fut.await.expect(&m)
    }};
}

/// Receive from a channel within two seconds, panicking with the call site
/// when nothing arrives.
#[macro_export]
macro_rules! recv_expect {
    ($rx:expr) => {{
        ::tokio::time::timeout(::std::time::Duration::from_secs(2), $rx.recv())
            .await
            .expect(concat!("recv timed out at ", file!(), ":", line!()))
            .expect(concat!("channel closed at ", file!(), ":", line!()))
    }};
}

pub use crate::{recv_expect, reply_expect};

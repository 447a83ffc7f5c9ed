//! This module contains utilities for testing code based on publisher and subscriber links. They
//!  are used for testing the links themselves, but they are also exported for application testing
//!  and for the loopback integration tests, which can not see `#[cfg(test)]` code.

pub mod sink;
pub mod socket;

use std::future::Future;
use std::time::Duration;

pub use sink::CollectingSink;
pub use socket::RecordingSocket;

/// Awaits a future for at most five seconds, panicking if it takes longer
pub async fn within<T>(f: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(5), f).await {
        Ok(result) => result,
        Err(_) => panic!("timed out"),
    }
}

/// Polls `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

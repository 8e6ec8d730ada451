//! Async test helpers
//!
//! Channel receives with timeouts and completion assertions.

use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

/// Receive from a bounded channel with a timeout
pub async fn recv_timeout<T>(rx: &mut mpsc::Receiver<T>, duration: Duration) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Receive from an unbounded channel with a timeout
pub async fn recv_unbounded_timeout<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Receive from a oneshot channel with a timeout
pub async fn recv_oneshot_timeout<T>(rx: oneshot::Receiver<T>, duration: Duration) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx)
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .map_err(|_| RecvTimeoutError::Closed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Assert a future completes within `duration` and return its output
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Assert a future does NOT complete within `duration`
pub async fn assert_times_out<F, T>(duration: Duration, future: F)
where
    F: Future<Output = T>,
{
    if timeout(duration, future).await.is_ok() {
        panic!("Expected future to time out, but it completed within {:?}", duration);
    }
}

/// Default timeout for tests (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for "nothing should happen" checks (100ms)
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_timeout_success() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(42).await.unwrap();
        assert_eq!(recv_timeout(&mut rx, SHORT_TEST_TIMEOUT).await, Ok(42));
    }

    #[tokio::test]
    async fn test_recv_timeout_reports_timeout_and_close() {
        let (tx, mut rx) = mpsc::channel::<i32>(1);
        assert_eq!(recv_timeout(&mut rx, Duration::from_millis(10)).await, Err(RecvTimeoutError::Timeout));
        drop(tx);
        assert_eq!(recv_timeout(&mut rx, Duration::from_millis(10)).await, Err(RecvTimeoutError::Closed));
    }

    #[tokio::test]
    async fn test_recv_oneshot_timeout() {
        let (tx, rx) = oneshot::channel();
        tx.send("done").unwrap();
        assert_eq!(recv_oneshot_timeout(rx, SHORT_TEST_TIMEOUT).await, Ok("done"));
    }

    #[tokio::test]
    async fn test_assert_times_out() {
        assert_times_out(Duration::from_millis(10), tokio::time::sleep(Duration::from_secs(1))).await;
    }
}

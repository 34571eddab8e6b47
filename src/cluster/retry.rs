//! Retry policies built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `metadata_policy` | 50ms | 5s | 10 | Raft writes from brokers |
//! | `join_policy` | 200ms | 5s | 30 | Gossip seeds and voter join at startup |
//! | `network_policy` | 100ms | 10s | 5 | Replication RPCs |
//!
//! All policies jitter their delays.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Metadata writes: register, heartbeat, topic changes, controller decisions.
///
/// Long enough to ride out a leader election.
pub fn metadata_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Startup joins, where peers may still be booting.
pub fn join_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

pub fn network_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(5)
        .with_jitter()
}

/// Run `operation` under `policy`, retrying while `condition` holds.
///
/// Each retry and the final outcome are counted under `name`.
pub async fn with_policy<F, Fut, T, E, C>(
    name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
    condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: FnMut(&E) -> bool,
{
    let result = operation
        .retry(policy)
        .when(condition)
        .notify(|err: &E, delay: Duration| {
            record_retry(name, "retry");
            tracing::debug!(
                operation = name,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retrying after error"
            );
        })
        .await;
    record_retry(name, if result.is_ok() { "success" } else { "exhausted" });
    result
}

fn record_retry(operation: &str, outcome: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation, outcome])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_times(5);

        let result: Result<u32, std::io::Error> = with_policy(
            "test",
            policy,
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(std::io::Error::other("transient"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_condition_stops_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), std::io::Error> = with_policy(
            "test",
            network_policy(),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "permanent"))
                }
            },
            |e| e.kind() != std::io::ErrorKind::InvalidInput,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

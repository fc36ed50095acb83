//! Draining the control loops after cancellation.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Wait up to `grace` in total for every task to finish.
///
/// Returns how many tasks did not stop cleanly: panicked, aborted, or still
/// running when the grace period ended.
pub async fn drain(tasks: Vec<(&'static str, JoinHandle<()>)>, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    let mut unclean = 0;

    for (name, handle) in tasks {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => debug!(task = name, "control loop stopped"),
            Ok(Err(e)) => {
                unclean += 1;
                error!(task = name, panicked = e.is_panic(), error = %e, "control loop failed");
            }
            Err(_) => {
                unclean += 1;
                warn!(
                    task = name,
                    grace_secs = grace.as_secs(),
                    "control loop did not stop in time"
                );
            }
        }
    }
    unclean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clean_exits_are_not_counted() {
        let tasks = vec![
            ("a", tokio::spawn(async {})),
            ("b", tokio::spawn(async {})),
        ];
        assert_eq!(drain(tasks, Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_loop_is_reported() {
        let failed = tokio::spawn(std::future::pending::<()>());
        failed.abort();
        let tasks = vec![("coordinator", failed), ("policy", tokio::spawn(async {}))];
        assert_eq!(drain(tasks, Duration::from_secs(1)).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_loop_is_reported_after_grace() {
        let tasks = vec![
            ("coordinator", tokio::spawn(std::future::pending::<()>())),
            ("policy", tokio::spawn(async {})),
        ];
        assert_eq!(drain(tasks, Duration::from_secs(10)).await, 1);
    }
}

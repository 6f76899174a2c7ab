//! The four periodic controllers driving the task lifecycle, plus the
//! shared backoff policy. Each job follows the same shape: a timer loop
//! guarded by a `CancellationToken`, and a `run_once` pass that pages
//! through the store and fans work out per task, joining the page before
//! moving on. One task's failure never stalls a pass.

pub mod autopass;
pub mod recovery;
pub mod start;
pub mod sync;

pub use autopass::AutoPassJob;
pub use recovery::RecoveryJob;
pub use start::StartJob;
pub use sync::SyncJob;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opsflow_core::ServiceError;
use tracing::debug;

use crate::model::{Task, TaskStatus};
use crate::store::TaskStore;

/// Collect every task in a status, page by page.
///
/// The snapshot is taken before any per-task work mutates the status
/// index, so offset paging stays consistent; processing afterwards works
/// on the snapshot in page-sized chunks.
pub(crate) async fn collect_by_status(
    store: &Arc<dyn TaskStore>,
    status: TaskStatus,
    page_size: usize,
) -> Result<Vec<Task>, ServiceError> {
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.page_by_status(status, offset, page_size).await?;
        let fetched = page.len();
        out.extend(page);
        if fetched < page_size {
            break;
        }
        offset += fetched;
    }
    Ok(out)
}

/// Collect every auto-pass candidate (SUCCESS, not yet passed, settled
/// before `utime_before`), page by page.
pub(crate) async fn collect_pass_candidates(
    store: &Arc<dyn TaskStore>,
    utime_before: i64,
    page_size: usize,
) -> Result<Vec<Task>, ServiceError> {
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let page = store
            .page_pass_candidates(utime_before, offset, page_size)
            .await?;
        let fetched = page.len();
        out.extend(page);
        if fetched < page_size {
            break;
        }
        offset += fetched;
    }
    Ok(out)
}

/// Exponential backoff policy for per-task start attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial: Duration,
    /// Cap on the growing delay.
    pub max: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, retrying transient failures with
/// exponential backoff. Non-transient errors (and exhaustion) are returned
/// to the caller unchanged.
pub async fn retry_with_backoff<T, Fut>(
    policy: &Backoff,
    mut op: impl FnMut() -> Fut,
) -> Result<T, ServiceError>
where
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                debug!("attempt {attempt} failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = Backoff {
            max_attempts: 5,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(4), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_with_backoff(&fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::Unavailable("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(&fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Unavailable("still down".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(&fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::NotFound("no route".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

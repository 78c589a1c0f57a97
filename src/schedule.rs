//! Revocable one-shot timers.
//!
//! A [`ScheduledTask`] runs a future once after a delay unless it is revoked
//! first. Revoking and firing race on a single flag, so exactly one of them wins.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Handle to a deferred piece of work. Dropping the handle revokes it.
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    /// Set by whichever of `revoke` or the timer gets there first.
    claimed: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Runs `task` on `handle` once `delay` has elapsed.
    pub fn after<F>(handle: &Handle, delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let claimed = Arc::new(AtomicBool::new(false));

        let timer_token = token.clone();
        let timer_claimed = claimed.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !timer_claimed.swap(true, Ordering::SeqCst) {
                        task.await;
                    }
                }
            }
        });

        Self { token, claimed }
    }

    /// Prevents the task from running. Returns `true` if this call stopped it,
    /// `false` if it had already fired or been revoked.
    pub fn revoke(&self) -> bool {
        self.token.cancel();
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    /// Whether the task is still waiting for its delay.
    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        !self.claimed.load(Ordering::SeqCst)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.revoke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(hits: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::after(&Handle::current(), Duration::from_millis(300), counting_task(&hits));

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(task.is_pending());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!task.is_pending());
        assert!(!task.revoke());
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_task_never_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::after(&Handle::current(), Duration::from_millis(300), counting_task(&hits));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(task.revoke());
        assert!(!task.revoke());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_revokes() {
        let hits = Arc::new(AtomicUsize::new(0));
        drop(ScheduledTask::after(&Handle::current(), Duration::from_millis(50), counting_task(&hits)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}

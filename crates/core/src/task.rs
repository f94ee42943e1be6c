//! Background loop helpers.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn a loop that runs `tick` every `period` until `cancel` fires.
///
/// The first tick runs after one full period. A tick that is in progress when
/// the token is cancelled is allowed to finish; the loop exits before the
/// next sleep completes.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tracing::debug!(
            task = name,
            period_ms = period.as_millis() as u64,
            "background loop started"
        );
        loop {
            tokio::select! {
                () = tokio::time::sleep(period) => {}
                () = cancel.cancelled() => break,
            }
            tick().await;
        }
        tracing::debug!(task = name, "background loop stopped");
    })
}

/// Sleep for `duration`, returning `false` if `cancel` fired first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn periodic_ticks_until_cancelled() {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let handle = spawn_periodic("test", Duration::from_secs(1), cancel.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn sleep_or_cancel_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        assert!(sleep_or_cancel(Duration::from_millis(5), &CancellationToken::new()).await);
    }
}

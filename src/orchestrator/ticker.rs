//! Fixed-cadence background timers.
//!
//! Each timer runs its body to completion before checking the cancellation
//! token again, so cancelling stops new ticks without aborting a run that
//! already started. Ticks that come due while a run is still going are
//! skipped, not queued.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// Handle returned from [`spawn_ticker`]; cancels the timer when dropped.
pub struct TimerHandle {
    name: &'static str,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TimerHandle {
    /// Timer name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop scheduling new ticks. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Cancel and wait for the task, letting an in-flight tick finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Spawn a timer that calls `tick` every `period`, first immediately.
///
/// The task exits when `cancel` (or the returned handle) is cancelled, or
/// when `tick` resolves to `false`.
#[must_use]
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let token = cancel.clone();
    let join_handle = tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!(timer = name, "timer cancelled");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                if !tick().await {
                    debug!(timer = name, "timer owner gone");
                    return;
                }
            }
        }
        .instrument(info_span!("timer", timer = name)),
    );

    TimerHandle {
        name,
        cancel,
        join_handle: Some(join_handle),
    }
}

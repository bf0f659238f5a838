//! Repeating background timer with a per-tick continuation condition.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Runs `function` every `interval` on a tokio task for as long as
/// `condition` holds. The condition is checked before each tick; the first
/// tick fires one interval after start. Dropping the timer cancels it.
#[derive(Debug)]
pub struct RepeatedTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepeatedTimer {
    /// Must be called from within a tokio runtime.
    pub fn start<C, F>(interval: Duration, condition: C, mut function: F) -> Self
    where
        C: Fn() -> bool + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => {
                        tracing::debug!("Repeated timer cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !condition() {
                            tracing::debug!("Repeated timer condition no longer holds, stopping");
                            break;
                        }
                        function();
                    }
                }
            }
        });
        Self { token, handle }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The timer task has exited, either cancelled or because its condition
    /// stopped holding.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatedTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

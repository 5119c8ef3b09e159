//! Cancellable background tasks with a shutdown deadline.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SecurityError};

/// Handle to a spawned background task.
///
/// The task receives a shutdown signal through a `watch` channel and is
/// expected to return promptly once the signal flips to `true`.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn a task that observes the shutdown signal itself.
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(task(shutdown_rx));
        debug!(task = name, "Background task started");

        Self {
            name,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Spawn a task that runs `tick` every `interval` until stopped.
    ///
    /// The first tick fires one full interval after spawning.
    pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |mut shutdown_rx| async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => tick().await,
                }
            }

            debug!(task = name, "Background task exited");
        })
    }

    /// Signal shutdown and wait up to `deadline` for the task to exit.
    ///
    /// Calling this again after a successful or timed-out stop is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let handle = self.handle.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(())) => {
                debug!(task = self.name, "Background task stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(task = self.name, error = %e, "Background task ended abnormally");
                Ok(())
            }
            Err(_) => {
                warn!(
                    task = self.name,
                    deadline_ms = deadline.as_millis() as u64,
                    "Background task did not stop before deadline"
                );
                Err(SecurityError::DeadlineExceeded(self.name.to_string()))
            }
        }
    }

    /// Check if the task is still running.
    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

//! Periodic background tasks.
//!
//! Health checks, model updates and persistence run on their own intervals,
//! decoupled from request handling. Every loop stops when its
//! [`CancellationToken`] fires; tests call [`ScheduledTask::tick`] directly.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;
    async fn tick(&self);
}

/// Runs registered tasks until cancelled.
#[derive(Debug)]
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` every `period`; the first tick fires after one period.
    pub fn spawn(&mut self, task: Arc<dyn ScheduledTask>, period: Duration) {
        let cancel = self.cancel.child_token();
        let name = task.name().to_string();
        log::debug!("scheduling {name} every {:.1}s", period.as_secs_f64());
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => task.tick().await,
                }
            }
            log::debug!("{} stopped", task.name());
        });
        self.handles.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for (name, handle) in self.handles.drain(..) {
            if let Err(err) = handle.await {
                log::warn!("scheduled task {name} ended abnormally: {err}");
            }
        }
    }
}

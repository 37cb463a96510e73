//! Event stream for observability.
//!
//! Components publish [`HarvestEvent`]s on a broadcast channel. Consumers
//! subscribe and poll instead of registering callbacks; a slow consumer only
//! loses its own backlog.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::learning::Adaptation;
use crate::recovery::{CircuitState, ErrorCategory, RecoveryStrategyKind};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarvestEvent {
    UnitStarted {
        session_id: String,
        url: String,
        proxy_id: String,
    },
    UnitCompleted {
        session_id: String,
        url: String,
        records: usize,
        #[serde(with = "crate::config::duration_ms")]
        latency: Duration,
    },
    UnitFailed {
        session_id: String,
        url: String,
        error: String,
    },
    FaultClassified {
        session_id: String,
        category: ErrorCategory,
        error_type: String,
    },
    RecoveryAttempted {
        session_id: String,
        strategy: RecoveryStrategyKind,
        success: bool,
    },
    CircuitTransition {
        from: CircuitState,
        to: CircuitState,
    },
    DetectionCooldown {
        suspicion: u32,
        #[serde(with = "crate::config::duration_ms")]
        pause: Duration,
    },
    AdaptationApplied {
        adaptation: Adaptation,
        at: DateTime<Utc>,
    },
    ProxyUnblocked {
        proxy_id: String,
    },
    Persisted {
        at: DateTime<Utc>,
    },
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn publish(&self, event: HarvestEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn log_event(event: &HarvestEvent) {
    match event {
        HarvestEvent::UnitStarted { session_id, url, proxy_id } => {
            log::debug!("[{session_id}] -> {url} via {proxy_id}");
        }
        HarvestEvent::UnitCompleted { session_id, url, records, latency } => {
            log::debug!(
                "[{session_id}] <- {url}: {records} records ({:.2}s)",
                latency.as_secs_f64()
            );
        }
        HarvestEvent::UnitFailed { session_id, url, error } => {
            log::warn!("[{session_id}] {url} failed: {error}");
        }
        HarvestEvent::FaultClassified { session_id, category, error_type } => {
            log::debug!("[{session_id}] fault classified as {category}/{error_type}");
        }
        HarvestEvent::RecoveryAttempted { session_id, strategy, success } => {
            log::debug!("[{session_id}] recovery {strategy} success={success}");
        }
        HarvestEvent::CircuitTransition { from, to } => {
            log::info!("circuit {from} -> {to}");
        }
        HarvestEvent::DetectionCooldown { suspicion, pause } => {
            log::warn!(
                "suspicion {suspicion}: pausing pipeline for {:.1}s",
                pause.as_secs_f64()
            );
        }
        HarvestEvent::AdaptationApplied { adaptation, .. } => {
            log::info!(
                "applied adaptation {}/{} (confidence {:.2})",
                adaptation.adaptation_type,
                adaptation.action,
                adaptation.confidence
            );
        }
        HarvestEvent::ProxyUnblocked { proxy_id } => {
            log::info!("proxy {proxy_id} back in rotation");
        }
        HarvestEvent::Persisted { at } => {
            log::debug!("learning state persisted at {at}");
        }
    }
}

/// Spawn a task that logs every event until cancelled.
pub fn spawn_event_logger(bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("event logger lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        bus.publish(HarvestEvent::ProxyUnblocked {
            proxy_id: "p1".into(),
        });
        match receiver.recv().await.unwrap() {
            HarvestEvent::ProxyUnblocked { proxy_id } => assert_eq!(proxy_id, "p1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn logger_stops_on_cancel() {
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let handle = spawn_event_logger(&bus, cancel.clone());
        bus.publish(HarvestEvent::Persisted { at: Utc::now() });
        cancel.cancel();
        handle.await.unwrap();
    }
}

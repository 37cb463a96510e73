//! Background plumbing around [`LearningEngine`]: the record channel, the
//! periodic model update and snapshot persistence.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AdaptationBatch, InteractionRecord, LearningEngine, LearningError, LearningStore};
use crate::modules::events::{EventBus, HarvestEvent};
use crate::modules::scheduler::ScheduledTask;

const ADAPTATION_BACKLOG: usize = 16;

fn lock(engine: &Mutex<LearningEngine>) -> std::sync::MutexGuard<'_, LearningEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ingest one record and run an adaptation round when one is due.
pub(crate) fn ingest_and_adapt(
    engine: &Mutex<LearningEngine>,
    record: InteractionRecord,
) -> Option<AdaptationBatch> {
    let mut engine = lock(engine);
    engine.ingest(record);
    engine
        .adaptation_due()
        .then(|| engine.generate_adaptation())
        .filter(|batch| !batch.is_empty())
}

/// Sending side used by sessions to report finished interactions.
#[derive(Debug, Clone)]
pub struct LearningHandle {
    sender: mpsc::Sender<InteractionRecord>,
}

impl LearningHandle {
    /// Queue a record, waiting for room. Returns `false` once the worker stopped.
    pub async fn report(&self, record: InteractionRecord) -> bool {
        self.sender.send(record).await.is_ok()
    }

    /// Queue a record without waiting; used on paths that must not suspend.
    pub fn try_report(&self, record: InteractionRecord) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                log::warn!("learning queue full, dropping record for {}", record.url);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumes interaction records and emits adaptation batches.
pub struct LearningWorker;

impl LearningWorker {
    pub fn spawn(
        engine: Arc<Mutex<LearningEngine>>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (LearningHandle, mpsc::Receiver<AdaptationBatch>, JoinHandle<()>) {
        let (sender, mut records) = mpsc::channel(capacity.max(1));
        let (adaptations, batches) = mpsc::channel(ADAPTATION_BACKLOG);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = records.recv() => match received {
                        Some(record) => Self::process(&engine, &adaptations, record),
                        None => break,
                    },
                }
            }
            // Records already queued still carry signal.
            records.close();
            while let Some(record) = records.recv().await {
                Self::process(&engine, &adaptations, record);
            }
            log::debug!("learning worker stopped");
        });

        (LearningHandle { sender }, batches, handle)
    }

    fn process(
        engine: &Mutex<LearningEngine>,
        adaptations: &mpsc::Sender<AdaptationBatch>,
        record: InteractionRecord,
    ) {
        let Some(batch) = ingest_and_adapt(engine, record) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(batch)) = adaptations.try_send(batch) {
            log::warn!(
                "adaptation backlog full, dropping {} adaptations",
                batch.adaptations.len()
            );
        }
    }
}

/// Periodic decay of model tables.
pub struct ModelUpdateTask {
    engine: Arc<Mutex<LearningEngine>>,
}

impl ModelUpdateTask {
    pub fn new(engine: Arc<Mutex<LearningEngine>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledTask for ModelUpdateTask {
    fn name(&self) -> &str {
        "learning-model-update"
    }

    async fn tick(&self) {
        lock(&self.engine).periodic_update();
    }
}

/// Snapshots the engine and writes it to a [`LearningStore`].
pub struct PersistTask {
    engine: Arc<Mutex<LearningEngine>>,
    store: Arc<dyn LearningStore>,
    events: Option<EventBus>,
}

impl PersistTask {
    pub fn new(engine: Arc<Mutex<LearningEngine>>, store: Arc<dyn LearningStore>) -> Self {
        Self {
            engine,
            store,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Snapshot under the lock, write outside it.
    pub async fn persist_now(&self) -> Result<(), LearningError> {
        let snapshot = lock(&self.engine).snapshot()?;
        let taken_at = snapshot.taken_at;
        self.store.save(&snapshot).await?;
        lock(&self.engine).mark_persisted(taken_at);
        if let Some(events) = &self.events {
            events.publish(HarvestEvent::Persisted { at: taken_at });
        }
        Ok(())
    }

    /// Load the newest stored snapshot into the engine. Returns whether one existed.
    pub async fn restore_latest(&self) -> Result<bool, LearningError> {
        let Some(snapshot) = self.store.load_latest().await? else {
            return Ok(false);
        };
        lock(&self.engine).restore(snapshot)?;
        Ok(true)
    }
}

#[async_trait]
impl ScheduledTask for PersistTask {
    fn name(&self) -> &str {
        "learning-persist"
    }

    async fn tick(&self) {
        if let Err(err) = self.persist_now().await {
            log::warn!("failed to persist learning state: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::{LearningConfig, MemoryLearningStore, Outcome};
    use crate::modules::clock::{Clock, ManualClock};
    use crate::modules::session::test_support::context;
    use crate::recovery::ErrorCategory;

    fn shared_engine(clock: &ManualClock) -> Arc<Mutex<LearningEngine>> {
        let config = LearningConfig {
            exploration_rate: 0.0,
            ..LearningConfig::default()
        };
        Arc::new(Mutex::new(LearningEngine::new(config, Arc::new(clock.clone()))))
    }

    #[tokio::test]
    async fn worker_emits_batches_for_failure_bursts() {
        let clock = ManualClock::default();
        let engine = shared_engine(&clock);
        let cancel = CancellationToken::new();
        let (handle, mut batches, join) = LearningWorker::spawn(engine.clone(), 32, cancel.clone());

        for _ in 0..6 {
            let record = InteractionRecord::from_context(
                &context("https://market.example.com/listings"),
                Outcome::Failure,
                clock.now(),
            )
            .with_error(ErrorCategory::Network, "connection refused");
            assert!(handle.report(record).await);
        }

        let batch = batches.recv().await.unwrap();
        assert!(!batch.is_empty());

        cancel.cancel();
        join.await.unwrap();
        assert_eq!(lock(&engine).failed().len(), 6);
    }

    #[tokio::test]
    async fn persist_then_restore() {
        let clock = ManualClock::default();
        let engine = shared_engine(&clock);
        lock(&engine).ingest(InteractionRecord::from_context(
            &context("https://market.example.com/listings"),
            Outcome::Success,
            clock.now(),
        ));

        let store = Arc::new(MemoryLearningStore::new(3));
        let task = PersistTask::new(engine.clone(), store.clone());
        task.tick().await;
        assert_eq!(store.len(), 1);
        assert_eq!(lock(&engine).metrics().last_persisted, Some(clock.now()));

        let fresh = shared_engine(&clock);
        let restorer = PersistTask::new(fresh.clone(), store);
        assert!(restorer.restore_latest().await.unwrap());
        assert_eq!(
            lock(&fresh).models().serialize().unwrap(),
            lock(&engine).models().serialize().unwrap()
        );
    }
}

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use super::memory::BoundedMemory;
use super::models::SubModels;
use super::patterns::{PatternTracker, field_differences, pattern_labels, similarity};
use super::{
    Adaptation, AdaptationAction, AdaptationBatch, AdaptationTrigger, AdaptationType, FailureCause,
    InteractionRecord, LearningConfig, LearningError,
};
use crate::extraction::{ExtractionMode, ScanPattern};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::clock::{SharedClock, chrono_duration};
use crate::modules::proxy::ProxyType;
use crate::modules::session::PageType;

/// Snapshot format understood by [`LearningEngine::restore`].
pub const SNAPSHOT_VERSION: u32 = 1;

const PATTERN_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// Highest-quality configuration seen for a `domain|page|profile` context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestConfiguration {
    pub behavior_profile: BehaviorProfile,
    pub proxy_type: ProxyType,
    pub proxy_country: String,
    pub scan_pattern: Option<ScanPattern>,
    pub extraction_mode: ExtractionMode,
    #[serde(with = "crate::config::duration_ms")]
    pub applied_delay: Duration,
    pub data_quality: f64,
    pub recorded_at: DateTime<Utc>,
}

impl BestConfiguration {
    fn from_record(record: &InteractionRecord) -> Self {
        Self {
            behavior_profile: record.behavior_profile,
            proxy_type: record.proxy_type,
            proxy_country: record.proxy_country.clone(),
            scan_pattern: record.scan_pattern,
            extraction_mode: record.extraction_mode,
            applied_delay: record.metrics.applied_delay,
            data_quality: record.metrics.data_quality,
            recorded_at: record.completed_at,
        }
    }
}

/// Audit entry for an adaptation the orchestrator applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdaptation {
    pub adaptation: Adaptation,
    pub applied_at: DateTime<Utc>,
}

/// Persistable learning state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub models: BTreeMap<String, Value>,
    pub patterns: PatternTracker,
    /// Context key to strategy label counts.
    pub strategies: BTreeMap<String, BTreeMap<String, u64>>,
    pub best_configs: BTreeMap<String, BestConfiguration>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LearningMetrics {
    pub ingested: u64,
    pub successful_records: usize,
    pub failed_records: usize,
    pub evicted_successes: u64,
    pub evicted_failures: u64,
    pub confidence: f64,
    pub recent_failures: usize,
    pub pattern_events: usize,
    pub strategy_contexts: usize,
    pub best_configurations: usize,
    pub adaptations_generated: u64,
    pub adaptations_applied: u64,
    pub degraded_domains: Vec<String>,
    pub last_adaptation: Option<DateTime<Utc>>,
    pub last_persisted: Option<DateTime<Utc>>,
}

/// Labels describing the strategy a successful interaction used.
fn strategy_labels(record: &InteractionRecord) -> Vec<String> {
    let mut labels = vec![
        format!("proxy:{}:{}", record.proxy_type, record.proxy_country),
        format!("mode:{}", record.extraction_mode),
    ];
    if let Some(pattern) = record.scan_pattern {
        labels.push(format!("scan:{pattern}"));
    }
    labels.extend(record.recoveries.iter().map(|kind| format!("recovery:{kind}")));
    labels
}

/// Online learner over interaction outcomes.
///
/// The engine is synchronous; callers share it behind a mutex and keep lock
/// scopes short (ingest, snapshot, then do I/O outside the lock).
#[derive(Debug)]
pub struct LearningEngine {
    config: LearningConfig,
    clock: SharedClock,
    successful: BoundedMemory<InteractionRecord>,
    failed: BoundedMemory<InteractionRecord>,
    models: SubModels,
    patterns: PatternTracker,
    strategies: BTreeMap<String, BTreeMap<String, u64>>,
    best_configs: BTreeMap<String, BestConfiguration>,
    applied: VecDeque<AppliedAdaptation>,
    confidence: f64,
    detection_fired: bool,
    ingested: u64,
    adaptations_generated: u64,
    adaptations_applied: u64,
    last_adaptation: Option<DateTime<Utc>>,
    last_persisted: Option<DateTime<Utc>>,
}

impl LearningEngine {
    pub fn new(config: LearningConfig, clock: SharedClock) -> Self {
        Self {
            successful: BoundedMemory::new(config.success_memory),
            failed: BoundedMemory::new(config.failure_memory),
            models: SubModels::new(config.min_samples),
            patterns: PatternTracker::new(config.pattern_event_limit),
            strategies: BTreeMap::new(),
            best_configs: BTreeMap::new(),
            applied: VecDeque::new(),
            confidence: 1.0,
            detection_fired: false,
            ingested: 0,
            adaptations_generated: 0,
            adaptations_applied: 0,
            last_adaptation: None,
            last_persisted: None,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn models(&self) -> &SubModels {
        &self.models
    }

    pub fn patterns(&self) -> &PatternTracker {
        &self.patterns
    }

    pub fn successful(&self) -> &BoundedMemory<InteractionRecord> {
        &self.successful
    }

    pub fn failed(&self) -> &BoundedMemory<InteractionRecord> {
        &self.failed
    }

    /// Smoothed success ratio across all ingested interactions.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn best_configuration(
        &self,
        domain: &str,
        page_type: PageType,
        profile: BehaviorProfile,
    ) -> Option<&BestConfiguration> {
        self.best_configs.get(&format!("{domain}|{page_type}|{profile}"))
    }

    pub fn strategies_for(&self, context_key: &str) -> Option<&BTreeMap<String, u64>> {
        self.strategies.get(context_key)
    }

    pub fn applied_log(&self) -> impl Iterator<Item = &AppliedAdaptation> {
        self.applied.iter()
    }

    /// Fold one finished interaction into memories, models and pattern tables.
    pub fn ingest(&mut self, record: InteractionRecord) {
        self.ingested += 1;
        let alpha = self.config.confidence_alpha.clamp(0.0, 1.0);
        let observed = if record.is_success() { 1.0 } else { 0.0 };
        self.confidence = (1.0 - alpha) * self.confidence + alpha * observed;

        let cause = if record.is_success() {
            self.learn_success(&record);
            None
        } else {
            Some(self.learn_failure(&record))
        };
        self.patterns
            .observe(record.completed_at, pattern_labels(&record, cause));

        log::debug!(
            "Learned from {} on {} ({}), confidence {:.2}",
            record.outcome,
            record.domain,
            cause.map_or_else(|| "ok".to_string(), |cause| cause.to_string()),
            self.confidence
        );

        if record.is_success() {
            self.successful.push(record);
        } else {
            self.failed.push(record);
        }
    }

    fn learn_success(&mut self, record: &InteractionRecord) {
        for model in self.models.all_mut() {
            model.learn(record);
        }

        let key = record.context_key();
        let counts = self.strategies.entry(key.clone()).or_default();
        for label in strategy_labels(record) {
            *counts.entry(label).or_default() += 1;
        }
        self.bound_strategy_table();

        let improves = self
            .best_configs
            .get(&key)
            .is_none_or(|best| record.metrics.data_quality > best.data_quality);
        if improves {
            self.best_configs
                .insert(key, BestConfiguration::from_record(record));
        }
    }

    fn learn_failure(&mut self, record: &InteractionRecord) -> FailureCause {
        let cause = record.failure_cause(self.config.timeout_latency);
        if cause == FailureCause::Detection {
            self.detection_fired = true;
        }

        let weights = self.config.similarity;
        let differences = self
            .successful
            .iter()
            .map(|candidate| (similarity(record, candidate, &weights), candidate))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, closest)| field_differences(record, closest))
            .unwrap_or_default();

        for model in self.models.all_mut() {
            model.update(record, cause, &differences);
        }
        cause
    }

    fn bound_strategy_table(&mut self) {
        while self.strategies.len() > self.config.strategy_table_limit.max(1) {
            let weakest = self
                .strategies
                .iter()
                .min_by_key(|(_, counts)| counts.values().sum::<u64>())
                .map(|(key, _)| key.clone());
            match weakest {
                Some(key) => {
                    self.strategies.remove(&key);
                }
                None => break,
            }
        }
    }

    fn recent_failures(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_duration(self.config.failure_window);
        self.failed
            .iter()
            .filter(|record| record.completed_at >= cutoff)
            .count()
    }

    /// Conditions currently calling for an adaptation round.
    pub fn adaptation_triggers(&self) -> Vec<AdaptationTrigger> {
        let now = self.clock.now();
        let mut triggers = Vec::new();
        if self.ingested > 0 && self.confidence < self.config.confidence_threshold {
            triggers.push(AdaptationTrigger::LowConfidence);
        }
        if self.recent_failures(now) > self.config.failure_limit {
            triggers.push(AdaptationTrigger::FailureBurst);
        }
        if self.detection_fired {
            triggers.push(AdaptationTrigger::DetectionFired);
        }
        if !self.models.performance.degraded_domains().is_empty() {
            triggers.push(AdaptationTrigger::PerformanceDegraded);
        }
        if self.patterns.shift(now, self.config.pattern_shift_min_events)
            > self.config.pattern_shift_threshold
        {
            triggers.push(AdaptationTrigger::PatternShift);
        }
        triggers
    }

    pub fn check_adaptation_need(&self) -> bool {
        !self.adaptation_triggers().is_empty()
    }

    /// Adaptation is needed and the previous round is far enough behind.
    pub fn adaptation_due(&self) -> bool {
        let spaced = self.detection_fired
            || self.last_adaptation.is_none_or(|at| {
                crate::modules::clock::elapsed_between(at, self.clock.now()) >= self.config.adaptation_interval
            });
        spaced && self.check_adaptation_need()
    }

    /// Interactions the models are asked to recommend for: the latest recent
    /// failure per domain, plus the latest interaction of each degraded domain.
    fn reference_records(&self, now: DateTime<Utc>) -> Vec<&InteractionRecord> {
        let cutoff = now - chrono_duration(self.config.failure_window);
        let mut seen = BTreeSet::new();
        let mut references: Vec<&InteractionRecord> = self
            .failed
            .iter()
            .rev()
            .filter(|record| record.completed_at >= cutoff)
            .filter(|record| seen.insert(record.domain.as_str()))
            .collect();
        if references.is_empty()
            && let Some(latest) = self.failed.latest()
        {
            seen.insert(latest.domain.as_str());
            references.push(latest);
        }

        for domain in self.models.performance.degraded_domains() {
            if seen.contains(domain.as_str()) {
                continue;
            }
            let latest = self
                .successful
                .iter()
                .rev()
                .chain(self.failed.iter().rev())
                .find(|record| record.domain == domain);
            if let Some(record) = latest {
                references.push(record);
            }
        }
        references
    }

    /// Merge, deduplicate and rank every model's recommendations.
    pub fn generate_adaptation(&mut self) -> AdaptationBatch {
        let now = self.clock.now();
        let triggers = self.adaptation_triggers();

        let mut merged: BTreeMap<(Option<String>, AdaptationType, AdaptationAction), Adaptation> =
            BTreeMap::new();
        for record in self.reference_records(now) {
            for model in self.models.all() {
                for adaptation in model.recommend(record) {
                    let key = (
                        adaptation.domain.clone(),
                        adaptation.adaptation_type,
                        adaptation.action,
                    );
                    match merged.get(&key) {
                        Some(existing) if existing.confidence >= adaptation.confidence => {}
                        _ => {
                            merged.insert(key, adaptation);
                        }
                    }
                }
            }
        }

        let mut adaptations: Vec<Adaptation> = merged.into_values().collect();
        adaptations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
        });

        let mut rng = rand::thread_rng();
        if adaptations.len() > 1 && rng.gen_bool(self.config.exploration_rate.clamp(0.0, 1.0)) {
            let pick = rng.gen_range(1..adaptations.len().min(3));
            log::debug!(
                "Exploring {} ahead of {}",
                adaptations[pick].action,
                adaptations[0].action
            );
            adaptations.swap(0, pick);
        }

        self.detection_fired = false;
        self.adaptations_generated += adaptations.len() as u64;
        self.last_adaptation = Some(now);
        if !adaptations.is_empty() {
            log::info!(
                "Generated {} adaptations (triggers: {:?})",
                adaptations.len(),
                triggers
            );
        }

        AdaptationBatch {
            generated_at: now,
            triggers,
            adaptations,
        }
    }

    /// Append an applied adaptation to the bounded audit log.
    pub fn record_applied(&mut self, adaptation: Adaptation) {
        if self.applied.len() >= self.config.audit_log_limit.max(1) {
            self.applied.pop_front();
        }
        self.adaptations_applied += 1;
        self.applied.push_back(AppliedAdaptation {
            adaptation,
            applied_at: self.clock.now(),
        });
    }

    /// Decay model tables and prune stale pattern events.
    pub fn periodic_update(&mut self) {
        let now = self.clock.now();
        for model in self.models.all_mut() {
            model.periodic_update(now);
        }
        self.patterns.prune(now, PATTERN_HORIZON);
        self.bound_strategy_table();
    }

    pub fn snapshot(&self) -> Result<LearningSnapshot, LearningError> {
        Ok(LearningSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: self.clock.now(),
            models: self.models.serialize()?,
            patterns: self.patterns.clone(),
            strategies: self.strategies.clone(),
            best_configs: self.best_configs.clone(),
            confidence: self.confidence,
        })
    }

    /// Resume from a persisted snapshot. Memories are not part of snapshots.
    pub fn restore(&mut self, snapshot: LearningSnapshot) -> Result<(), LearningError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(LearningError::Version(snapshot.version));
        }
        self.models.deserialize(snapshot.models)?;
        self.patterns = snapshot.patterns;
        self.strategies = snapshot.strategies;
        self.best_configs = snapshot.best_configs;
        self.confidence = snapshot.confidence.clamp(0.0, 1.0);
        log::info!("Restored learning state taken at {}", snapshot.taken_at);
        Ok(())
    }

    pub fn mark_persisted(&mut self, at: DateTime<Utc>) {
        self.last_persisted = Some(at);
    }

    pub fn metrics(&self) -> LearningMetrics {
        LearningMetrics {
            ingested: self.ingested,
            successful_records: self.successful.len(),
            failed_records: self.failed.len(),
            evicted_successes: self.successful.evicted(),
            evicted_failures: self.failed.evicted(),
            confidence: self.confidence,
            recent_failures: self.recent_failures(self.clock.now()),
            pattern_events: self.patterns.len(),
            strategy_contexts: self.strategies.len(),
            best_configurations: self.best_configs.len(),
            adaptations_generated: self.adaptations_generated,
            adaptations_applied: self.adaptations_applied,
            degraded_domains: self.models.performance.degraded_domains(),
            last_adaptation: self.last_adaptation,
            last_persisted: self.last_persisted,
        }
    }
}

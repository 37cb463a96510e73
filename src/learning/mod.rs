//! Online learning from interaction outcomes.
//!
//! Every finished unit of work becomes an [`InteractionRecord`]. The
//! [`LearningEngine`] keeps bounded memories of successes and failures, feeds
//! five sub-models (timing, behavior, extraction, detection, performance) and
//! turns their recommendations into ranked [`Adaptation`]s when it detects
//! that the current approach is no longer working.

mod engine;
mod memory;
pub mod models;
mod patterns;
mod record;
mod store;
mod worker;

pub(crate) use worker::ingest_and_adapt;

pub use engine::{AppliedAdaptation, BestConfiguration, LearningEngine, LearningMetrics, LearningSnapshot};
pub use memory::BoundedMemory;
pub use patterns::{FieldDifference, PatternTracker, SimilarityWeights, similarity};
pub use record::{FailureCause, InteractionMetrics, InteractionRecord, Outcome};
pub use store::{LearningStore, MemoryLearningStore, RedbLearningStore, StoreError};
pub use worker::{LearningHandle, LearningWorker, ModelUpdateTask, PersistTask};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::extraction::{ExtractionMode, ScanPattern};
use crate::modules::adaptive_timing::BehaviorProfile;

#[derive(Debug, Error)]
pub enum LearningError {
    #[error("model state (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot is missing state for model {0}")]
    MissingModel(String),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationType {
    Timing,
    Behavior,
    Identity,
    Extraction,
    Performance,
}

impl fmt::Display for AdaptationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdaptationType::Timing => "timing",
            AdaptationType::Behavior => "behavior",
            AdaptationType::Identity => "identity",
            AdaptationType::Extraction => "extraction",
            AdaptationType::Performance => "performance",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationAction {
    IncreaseDelay,
    DecreaseDelay,
    SwitchProfile,
    AddInteractionNoise,
    RotateIdentity,
    PreferCountry,
    SwitchScanPattern,
    SwitchExtractionMode,
    ReduceConcurrency,
}

impl fmt::Display for AdaptationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdaptationAction::IncreaseDelay => "increase_delay",
            AdaptationAction::DecreaseDelay => "decrease_delay",
            AdaptationAction::SwitchProfile => "switch_profile",
            AdaptationAction::AddInteractionNoise => "add_interaction_noise",
            AdaptationAction::RotateIdentity => "rotate_identity",
            AdaptationAction::PreferCountry => "prefer_country",
            AdaptationAction::SwitchScanPattern => "switch_scan_pattern",
            AdaptationAction::SwitchExtractionMode => "switch_extraction_mode",
            AdaptationAction::ReduceConcurrency => "reduce_concurrency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AdaptationValue {
    Multiplier(f64),
    Profile(BehaviorProfile),
    Country(String),
    ScanPattern(ScanPattern),
    ExtractionMode(ExtractionMode),
    Concurrency(usize),
    Enabled(bool),
}

/// One suggested change, with a confidence in [0, 1] and a priority (higher first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adaptation {
    pub adaptation_type: AdaptationType,
    pub action: AdaptationAction,
    pub value: AdaptationValue,
    pub confidence: f64,
    pub priority: u8,
    /// Domain the adaptation applies to; `None` means every domain.
    pub domain: Option<String>,
}

impl Adaptation {
    pub fn new(
        adaptation_type: AdaptationType,
        action: AdaptationAction,
        value: AdaptationValue,
        confidence: f64,
        priority: u8,
    ) -> Self {
        Self {
            adaptation_type,
            action,
            value,
            confidence: confidence.clamp(0.0, 1.0),
            priority,
            domain: None,
        }
    }

    pub fn for_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Why an adaptation round was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationTrigger {
    LowConfidence,
    FailureBurst,
    DetectionFired,
    PerformanceDegraded,
    PatternShift,
}

/// Ranked adaptations produced by one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationBatch {
    pub generated_at: DateTime<Utc>,
    pub triggers: Vec<AdaptationTrigger>,
    pub adaptations: Vec<Adaptation>,
}

impl AdaptationBatch {
    pub fn is_empty(&self) -> bool {
        self.adaptations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub success_memory: usize,
    pub failure_memory: usize,
    /// Overall confidence below this triggers adaptation.
    pub confidence_threshold: f64,
    /// Smoothing factor of the overall confidence average.
    pub confidence_alpha: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub failure_window: Duration,
    /// More failures than this inside `failure_window` triggers adaptation.
    pub failure_limit: usize,
    /// Interactions slower than this count as timeouts.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout_latency: Duration,
    pub pattern_shift_threshold: f64,
    /// Minimum last-hour events before a distribution shift is evaluated.
    pub pattern_shift_min_events: usize,
    pub pattern_event_limit: usize,
    pub exploration_rate: f64,
    /// Minimum spacing between adaptation rounds, except after a detection.
    #[serde(with = "crate::config::duration_ms")]
    pub adaptation_interval: Duration,
    pub min_samples: u32,
    pub similarity: SimilarityWeights,
    pub strategy_table_limit: usize,
    pub audit_log_limit: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub update_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub persist_interval: Duration,
    pub retained_snapshots: usize,
    /// Records queued for the learning worker before senders wait.
    pub channel_capacity: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            success_memory: 10_000,
            failure_memory: 5_000,
            confidence_threshold: 0.6,
            confidence_alpha: 0.1,
            failure_window: Duration::from_secs(5 * 60),
            failure_limit: 5,
            timeout_latency: Duration::from_secs(30),
            pattern_shift_threshold: 0.5,
            pattern_shift_min_events: 20,
            pattern_event_limit: 20_000,
            exploration_rate: 0.1,
            adaptation_interval: Duration::from_secs(30),
            min_samples: 3,
            similarity: SimilarityWeights::default(),
            strategy_table_limit: 1_000,
            audit_log_limit: 500,
            update_interval: Duration::from_secs(30),
            persist_interval: Duration::from_secs(60),
            retained_snapshots: 10,
            channel_capacity: 1_024,
        }
    }
}

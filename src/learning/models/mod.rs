//! Per-aspect learning models.
//!
//! Each model keeps small frequency tables keyed by domain or context, and
//! turns them into [`Adaptation`] recommendations for a reference interaction.
//! Tables are `BTreeMap`s so serialized state and recommendation order are
//! deterministic.

mod behavior;
mod detection;
mod extraction;
mod performance;
mod timing;

pub use behavior::BehaviorModel;
pub use detection::DetectionModel;
pub use extraction::ExtractionModel;
pub use performance::PerformanceModel;
pub use timing::TimingModel;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{Adaptation, FailureCause, FieldDifference, InteractionRecord, LearningError};

/// Capability shared by every sub-model.
pub trait LearningModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Learn from a successful interaction.
    fn learn(&mut self, record: &InteractionRecord);

    /// Learn from a failed interaction, given its cause and how it differs
    /// from the closest known success.
    fn update(&mut self, record: &InteractionRecord, cause: FailureCause, differences: &[FieldDifference]);

    fn recommend(&self, record: &InteractionRecord) -> Vec<Adaptation>;

    fn periodic_update(&mut self, now: DateTime<Utc>);

    fn serialize(&self) -> Result<Value, LearningError>;

    fn deserialize(&mut self, state: Value) -> Result<(), LearningError>;
}

/// Success/failure counts with exponential forgetting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Tally {
    pub successes: f64,
    pub failures: f64,
}

impl Tally {
    pub fn record(&mut self, success: bool) {
        if success {
            self.successes += 1.0;
        } else {
            self.failures += 1.0;
        }
    }

    pub fn samples(&self) -> f64 {
        self.successes + self.failures
    }

    /// Laplace-smoothed success rate.
    pub fn rate(&self) -> f64 {
        (self.successes + 1.0) / (self.samples() + 2.0)
    }

    pub fn failure_rate(&self) -> f64 {
        if self.samples() <= f64::EPSILON {
            0.0
        } else {
            self.failures / self.samples()
        }
    }

    pub fn decay(&mut self, factor: f64) {
        self.successes *= factor;
        self.failures *= factor;
    }
}

/// Running mean of a quality score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct QualityStat {
    pub mean: f64,
    pub count: f64,
}

impl QualityStat {
    pub fn observe(&mut self, quality: f64) {
        self.count += 1.0;
        self.mean += (quality.clamp(0.0, 1.0) - self.mean) / self.count;
    }
}

/// Confidence contribution of the sample size, saturating at 20 samples.
pub(crate) fn coverage(samples: f64) -> f64 {
    (samples / 20.0).clamp(0.0, 1.0)
}

pub(crate) fn context_key(record: &InteractionRecord) -> String {
    format!("{}|{}", record.domain, record.page_type)
}

pub(crate) fn prune_empty<K: Ord, V>(table: &mut BTreeMap<K, V>, mut empty: impl FnMut(&V) -> bool) {
    table.retain(|_, value| !empty(value));
}

/// The five sub-models, in a fixed order.
#[derive(Debug, Clone)]
pub struct SubModels {
    pub timing: TimingModel,
    pub behavior: BehaviorModel,
    pub extraction: ExtractionModel,
    pub detection: DetectionModel,
    pub performance: PerformanceModel,
}

impl SubModels {
    pub fn new(min_samples: u32) -> Self {
        Self {
            timing: TimingModel::new(min_samples),
            behavior: BehaviorModel::new(min_samples),
            extraction: ExtractionModel::new(min_samples),
            detection: DetectionModel::new(min_samples),
            performance: PerformanceModel::new(min_samples),
        }
    }

    pub fn all(&self) -> [&dyn LearningModel; 5] {
        [
            &self.timing,
            &self.behavior,
            &self.extraction,
            &self.detection,
            &self.performance,
        ]
    }

    pub fn all_mut(&mut self) -> [&mut dyn LearningModel; 5] {
        [
            &mut self.timing,
            &mut self.behavior,
            &mut self.extraction,
            &mut self.detection,
            &mut self.performance,
        ]
    }

    pub fn serialize(&self) -> Result<BTreeMap<String, Value>, LearningError> {
        self.all()
            .into_iter()
            .map(|model| Ok((model.name().to_string(), model.serialize()?)))
            .collect()
    }

    pub fn deserialize(&mut self, mut states: BTreeMap<String, Value>) -> Result<(), LearningError> {
        for model in self.all_mut() {
            let state = states
                .remove(model.name())
                .ok_or_else(|| LearningError::MissingModel(model.name().to_string()))?;
            model.deserialize(state)?;
        }
        Ok(())
    }
}

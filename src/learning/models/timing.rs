use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LearningModel, Tally, context_key, coverage, prune_empty};
use crate::learning::{
    Adaptation, AdaptationAction, AdaptationType, AdaptationValue, FailureCause, FieldDifference,
    InteractionRecord, LearningError,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TimingStats {
    tally: Tally,
    /// Smoothed delay of successful interactions, in milliseconds.
    success_delay_ms: Option<f64>,
    /// Failures whose delay was shorter than the closest success's.
    too_fast: f64,
}

/// Learns which pre-navigation delays keep a context healthy.
#[derive(Debug, Clone)]
pub struct TimingModel {
    min_samples: u32,
    stats: BTreeMap<String, TimingStats>,
}

impl TimingModel {
    pub fn new(min_samples: u32) -> Self {
        Self {
            min_samples,
            stats: BTreeMap::new(),
        }
    }

    /// Learned delay for a `domain|page_type` key.
    pub fn success_delay_ms(&self, key: &str) -> Option<f64> {
        self.stats.get(key).and_then(|stats| stats.success_delay_ms)
    }
}

impl LearningModel for TimingModel {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn learn(&mut self, record: &InteractionRecord) {
        let stats = self.stats.entry(context_key(record)).or_default();
        stats.tally.record(true);
        let delay = record.metrics.applied_delay.as_secs_f64() * 1000.0;
        stats.success_delay_ms = Some(match stats.success_delay_ms {
            Some(current) => current * 0.8 + delay * 0.2,
            None => delay,
        });
    }

    fn update(&mut self, record: &InteractionRecord, _cause: FailureCause, differences: &[FieldDifference]) {
        let stats = self.stats.entry(context_key(record)).or_default();
        stats.tally.record(false);
        let too_fast = differences.iter().any(|difference| {
            matches!(difference, FieldDifference::Timing { failed, succeeded } if failed < succeeded)
        });
        if too_fast {
            stats.too_fast += 1.0;
        }
    }

    fn recommend(&self, record: &InteractionRecord) -> Vec<Adaptation> {
        let Some(stats) = self.stats.get(&context_key(record)) else {
            return Vec::new();
        };
        let samples = stats.tally.samples();
        if samples < f64::from(self.min_samples) {
            return Vec::new();
        }

        let failure_rate = stats.tally.failure_rate();
        let applied_ms = record.metrics.applied_delay.as_secs_f64() * 1000.0;
        if failure_rate >= 0.3 {
            let mut multiplier = match stats.success_delay_ms {
                Some(learned) if applied_ms > 0.0 => (learned / applied_ms).clamp(1.2, 3.0),
                _ => 1.0 + failure_rate,
            };
            let mut priority = 2;
            if stats.too_fast >= 1.0 {
                multiplier = multiplier.max(1.5);
                priority = 3;
            }
            return vec![
                Adaptation::new(
                    AdaptationType::Timing,
                    AdaptationAction::IncreaseDelay,
                    AdaptationValue::Multiplier(multiplier),
                    coverage(samples).max(0.3) * failure_rate,
                    priority,
                )
                .for_domain(&record.domain),
            ];
        }

        if let Some(learned) = stats.success_delay_ms
            && failure_rate < 0.05
            && samples >= f64::from(self.min_samples * 4)
            && applied_ms > learned * 1.5
        {
            return vec![
                Adaptation::new(
                    AdaptationType::Timing,
                    AdaptationAction::DecreaseDelay,
                    AdaptationValue::Multiplier(0.85),
                    coverage(samples) * 0.5,
                    1,
                )
                .for_domain(&record.domain),
            ];
        }
        Vec::new()
    }

    fn periodic_update(&mut self, _now: DateTime<Utc>) {
        for stats in self.stats.values_mut() {
            stats.tally.decay(0.95);
            stats.too_fast *= 0.9;
        }
        prune_empty(&mut self.stats, |stats| stats.tally.samples() < 0.01);
    }

    fn serialize(&self) -> Result<Value, LearningError> {
        Ok(serde_json::to_value(&self.stats)?)
    }

    fn deserialize(&mut self, state: Value) -> Result<(), LearningError> {
        self.stats = serde_json::from_value(state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::Outcome;
    use crate::modules::session::test_support::context;
    use std::time::Duration;

    fn record(outcome: Outcome, delay_ms: u64) -> InteractionRecord {
        let mut record =
            InteractionRecord::from_context(&context("https://market.example.com/a"), outcome, Utc::now());
        record.metrics.applied_delay = Duration::from_millis(delay_ms);
        record
    }

    #[test]
    fn failing_fast_context_gets_longer_delays() {
        let mut model = TimingModel::new(3);
        for _ in 0..3 {
            model.learn(&record(Outcome::Success, 4_000));
        }
        let failed = record(Outcome::Failure, 1_000);
        let diffs = [FieldDifference::Timing {
            failed: Duration::from_millis(1_000),
            succeeded: Duration::from_millis(4_000),
        }];
        for _ in 0..3 {
            model.update(&failed, FailureCause::Error, &diffs);
        }

        let recommendations = model.recommend(&failed);
        assert_eq!(recommendations.len(), 1);
        let adaptation = &recommendations[0];
        assert_eq!(adaptation.action, AdaptationAction::IncreaseDelay);
        assert_eq!(adaptation.priority, 3);
        assert_eq!(adaptation.value, AdaptationValue::Multiplier(3.0));
    }
}

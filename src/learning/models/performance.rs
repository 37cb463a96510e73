use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LearningModel, coverage};
use crate::learning::{
    Adaptation, AdaptationAction, AdaptationType, AdaptationValue, FailureCause, FieldDifference,
    InteractionRecord, LearningError,
};

const BASELINE_ALPHA: f64 = 0.05;
const RECENT_ALPHA: f64 = 0.3;
const DEGRADED_RATIO: f64 = 1.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct LatencyStats {
    baseline_ms: f64,
    recent_ms: f64,
    samples: u64,
}

impl LatencyStats {
    fn observe(&mut self, latency_ms: f64) {
        if self.samples == 0 {
            self.baseline_ms = latency_ms;
            self.recent_ms = latency_ms;
        } else {
            self.baseline_ms += BASELINE_ALPHA * (latency_ms - self.baseline_ms);
            self.recent_ms += RECENT_ALPHA * (latency_ms - self.recent_ms);
        }
        self.samples += 1;
    }

    fn ratio(&self) -> f64 {
        if self.baseline_ms <= f64::EPSILON {
            1.0
        } else {
            self.recent_ms / self.baseline_ms
        }
    }
}

/// Tracks per-domain latency against a slow-moving baseline.
#[derive(Debug, Clone)]
pub struct PerformanceModel {
    min_samples: u64,
    domains: BTreeMap<String, LatencyStats>,
}

impl PerformanceModel {
    pub fn new(min_samples: u32) -> Self {
        Self {
            min_samples: u64::from(min_samples.max(5)),
            domains: BTreeMap::new(),
        }
    }

    pub fn is_degraded(&self, domain: &str) -> bool {
        self.domains
            .get(domain)
            .is_some_and(|stats| stats.samples >= self.min_samples && stats.ratio() > DEGRADED_RATIO)
    }

    pub fn degraded_domains(&self) -> Vec<String> {
        self.domains
            .keys()
            .filter(|domain| self.is_degraded(domain))
            .cloned()
            .collect()
    }

    fn observe(&mut self, record: &InteractionRecord) {
        if record.aborted {
            return;
        }
        self.domains
            .entry(record.domain.clone())
            .or_default()
            .observe(record.metrics.latency.as_secs_f64() * 1000.0);
    }
}

impl LearningModel for PerformanceModel {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn learn(&mut self, record: &InteractionRecord) {
        self.observe(record);
    }

    fn update(&mut self, record: &InteractionRecord, _cause: FailureCause, _differences: &[FieldDifference]) {
        self.observe(record);
    }

    fn recommend(&self, record: &InteractionRecord) -> Vec<Adaptation> {
        if !self.is_degraded(&record.domain) {
            return Vec::new();
        }
        let Some(stats) = self.domains.get(&record.domain) else {
            return Vec::new();
        };
        let ratio = stats.ratio();
        let confidence = (ratio - 1.0).min(1.0) * coverage(stats.samples as f64).max(0.5);
        vec![
            Adaptation::new(
                AdaptationType::Performance,
                AdaptationAction::ReduceConcurrency,
                AdaptationValue::Multiplier(0.5),
                confidence,
                1,
            )
            .for_domain(&record.domain),
            Adaptation::new(
                AdaptationType::Performance,
                AdaptationAction::IncreaseDelay,
                AdaptationValue::Multiplier(ratio.clamp(1.2, 2.0)),
                confidence * 0.8,
                1,
            )
            .for_domain(&record.domain),
        ]
    }

    fn periodic_update(&mut self, _now: DateTime<Utc>) {
        // Idle domains drift back toward their baseline.
        for stats in self.domains.values_mut() {
            stats.recent_ms += 0.1 * (stats.baseline_ms - stats.recent_ms);
        }
    }

    fn serialize(&self) -> Result<Value, LearningError> {
        Ok(serde_json::to_value(&self.domains)?)
    }

    fn deserialize(&mut self, state: Value) -> Result<(), LearningError> {
        self.domains = serde_json::from_value(state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::Outcome;
    use crate::modules::session::test_support::context;
    use std::time::Duration;

    fn record(latency_ms: u64) -> InteractionRecord {
        let mut record = InteractionRecord::from_context(
            &context("https://market.example.com/a"),
            Outcome::Success,
            Utc::now(),
        );
        record.metrics.latency = Duration::from_millis(latency_ms);
        record
    }

    #[test]
    fn flags_latency_spikes() {
        let mut model = PerformanceModel::new(3);
        for _ in 0..10 {
            model.learn(&record(200));
        }
        assert!(model.degraded_domains().is_empty());

        for _ in 0..4 {
            model.learn(&record(2_000));
        }
        assert_eq!(model.degraded_domains(), vec!["market.example.com".to_string()]);
        let recommendations = model.recommend(&record(2_000));
        assert_eq!(recommendations[0].action, AdaptationAction::ReduceConcurrency);
    }
}

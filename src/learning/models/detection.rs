use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use super::{LearningModel, Tally, coverage};
use crate::learning::{
    Adaptation, AdaptationAction, AdaptationType, AdaptationValue, FailureCause, FieldDifference,
    InteractionRecord, LearningError,
};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::proxy::ProxyType;
use crate::recovery::ErrorCategory;

const RECENT_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DetectionStats {
    detections: f64,
    recent: VecDeque<DateTime<Utc>>,
    countries: BTreeMap<String, Tally>,
    proxy_types: BTreeMap<ProxyType, Tally>,
    indicators: BTreeMap<String, u64>,
}

impl DetectionStats {
    fn recent_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.recent.iter().filter(|at| **at >= cutoff).count()
    }
}

fn was_detected(record: &InteractionRecord) -> bool {
    !record.detection_indicators.is_empty() || record.error_categories.contains(&ErrorCategory::Detection)
}

/// Learns detection pressure per domain and which geographies avoid it.
#[derive(Debug, Clone)]
pub struct DetectionModel {
    min_samples: u32,
    domains: BTreeMap<String, DetectionStats>,
}

impl DetectionModel {
    pub fn new(min_samples: u32) -> Self {
        Self {
            min_samples,
            domains: BTreeMap::new(),
        }
    }

    /// Detections recorded for `domain` within the hour before `now`.
    pub fn recent_detections(&self, domain: &str, now: DateTime<Utc>) -> usize {
        self.domains
            .get(domain)
            .map_or(0, |stats| stats.recent_since(now - ChronoDuration::hours(1)))
    }

    /// Country with the best success rate for `domain`.
    pub fn best_country(&self, domain: &str) -> Option<(String, f64)> {
        let min = f64::from(self.min_samples);
        self.domains
            .get(domain)?
            .countries
            .iter()
            .filter(|(_, tally)| tally.samples() >= min)
            .map(|(country, tally)| (country.clone(), tally.rate()))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    fn observe(&mut self, record: &InteractionRecord, success: bool) -> &mut DetectionStats {
        let stats = self.domains.entry(record.domain.clone()).or_default();
        stats
            .countries
            .entry(record.proxy_country.to_ascii_uppercase())
            .or_default()
            .record(success);
        stats.proxy_types.entry(record.proxy_type).or_default().record(success);
        stats
    }
}

impl LearningModel for DetectionModel {
    fn name(&self) -> &'static str {
        "detection"
    }

    fn learn(&mut self, record: &InteractionRecord) {
        self.observe(record, true);
    }

    fn update(&mut self, record: &InteractionRecord, cause: FailureCause, _differences: &[FieldDifference]) {
        let stats = self.observe(record, false);
        if cause != FailureCause::Detection {
            return;
        }
        stats.detections += 1.0;
        if stats.recent.len() >= RECENT_LIMIT {
            stats.recent.pop_front();
        }
        stats.recent.push_back(record.completed_at);
        for indicator in &record.detection_indicators {
            *stats.indicators.entry(indicator.clone()).or_default() += 1;
        }
    }

    fn recommend(&self, record: &InteractionRecord) -> Vec<Adaptation> {
        let Some(stats) = self.domains.get(&record.domain) else {
            return Vec::new();
        };
        let mut adaptations = Vec::new();

        if was_detected(record) {
            adaptations.push(
                Adaptation::new(
                    AdaptationType::Identity,
                    AdaptationAction::RotateIdentity,
                    AdaptationValue::Enabled(true),
                    0.9,
                    3,
                )
                .for_domain(&record.domain),
            );
            adaptations.push(
                Adaptation::new(
                    AdaptationType::Timing,
                    AdaptationAction::IncreaseDelay,
                    AdaptationValue::Multiplier(2.0),
                    0.7,
                    3,
                )
                .for_domain(&record.domain),
            );
            let recent = stats.recent_since(record.completed_at - ChronoDuration::hours(1));
            if recent >= 2 && record.behavior_profile != BehaviorProfile::Cautious {
                adaptations.push(
                    Adaptation::new(
                        AdaptationType::Behavior,
                        AdaptationAction::SwitchProfile,
                        AdaptationValue::Profile(BehaviorProfile::Cautious),
                        (0.4 + 0.1 * recent as f64).min(0.9),
                        2,
                    )
                    .for_domain(&record.domain),
                );
            }
        }

        let current_country = record.proxy_country.to_ascii_uppercase();
        if let Some((country, rate)) = self.best_country(&record.domain)
            && country != current_country
        {
            let current_rate = stats.countries.get(&current_country).map_or(0.5, Tally::rate);
            if rate > current_rate + 0.15 {
                let samples = stats.countries.get(&country).map_or(0.0, Tally::samples);
                adaptations.push(
                    Adaptation::new(
                        AdaptationType::Identity,
                        AdaptationAction::PreferCountry,
                        AdaptationValue::Country(country),
                        rate * coverage(samples).max(0.5),
                        2,
                    )
                    .for_domain(&record.domain),
                );
            }
        }
        adaptations
    }

    fn periodic_update(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::hours(1);
        for stats in self.domains.values_mut() {
            while stats.recent.front().is_some_and(|at| *at < cutoff) {
                stats.recent.pop_front();
            }
            stats.detections *= 0.9;
            for tally in stats.countries.values_mut().chain(stats.proxy_types.values_mut()) {
                tally.decay(0.95);
            }
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

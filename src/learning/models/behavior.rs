use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LearningModel, Tally, coverage, prune_empty};
use crate::learning::{
    Adaptation, AdaptationAction, AdaptationType, AdaptationValue, FailureCause, FieldDifference,
    InteractionRecord, LearningError,
};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::session::ActionKind;
use crate::recovery::ErrorCategory;

fn has_noise(actions: &[ActionKind]) -> bool {
    actions
        .iter()
        .any(|kind| matches!(kind, ActionKind::Scroll | ActionKind::MouseMove))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DomainBehavior {
    profiles: BTreeMap<BehaviorProfile, Tally>,
    with_noise: Tally,
    without_noise: Tally,
    /// Failures that lacked interactions present in the closest success.
    missing_interactions: f64,
}

/// Learns which behavior profile and interaction style each domain tolerates.
#[derive(Debug, Clone)]
pub struct BehaviorModel {
    min_samples: u32,
    domains: BTreeMap<String, DomainBehavior>,
}

impl BehaviorModel {
    pub fn new(min_samples: u32) -> Self {
        Self {
            min_samples,
            domains: BTreeMap::new(),
        }
    }

    /// Best-performing profile for a domain, once it has enough samples.
    pub fn best_profile(&self, domain: &str) -> Option<(BehaviorProfile, f64)> {
        let min = f64::from(self.min_samples);
        self.domains
            .get(domain)?
            .profiles
            .iter()
            .filter(|(_, tally)| tally.samples() >= min)
            .map(|(profile, tally)| (*profile, tally.rate()))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    fn observe(&mut self, record: &InteractionRecord, success: bool) -> &mut DomainBehavior {
        let domain = self.domains.entry(record.domain.clone()).or_default();
        domain
            .profiles
            .entry(record.behavior_profile)
            .or_default()
            .record(success);
        if has_noise(&record.actions) {
            domain.with_noise.record(success);
        } else {
            domain.without_noise.record(success);
        }
        domain
    }
}

impl LearningModel for BehaviorModel {
    fn name(&self) -> &'static str {
        "behavior"
    }

    fn learn(&mut self, record: &InteractionRecord) {
        self.observe(record, true);
    }

    fn update(&mut self, record: &InteractionRecord, _cause: FailureCause, differences: &[FieldDifference]) {
        let domain = self.observe(record, false);
        let lacked_noise = differences.iter().any(|difference| {
            matches!(difference, FieldDifference::ActionSequence { missing, .. } if has_noise(missing))
        });
        if lacked_noise {
            domain.missing_interactions += 1.0;
        }
    }

    fn recommend(&self, record: &InteractionRecord) -> Vec<Adaptation> {
        let Some(domain) = self.domains.get(&record.domain) else {
            return Vec::new();
        };
        let mut adaptations = Vec::new();

        if let Some((best, best_rate)) = self.best_profile(&record.domain)
            && best != record.behavior_profile
        {
            let current_rate = domain
                .profiles
                .get(&record.behavior_profile)
                .map_or(0.5, Tally::rate);
            if best_rate - current_rate >= 0.1 {
                let samples = domain.profiles.get(&best).map_or(0.0, Tally::samples);
                adaptations.push(
                    Adaptation::new(
                        AdaptationType::Behavior,
                        AdaptationAction::SwitchProfile,
                        AdaptationValue::Profile(best),
                        best_rate * coverage(samples).max(0.5),
                        2,
                    )
                    .for_domain(&record.domain),
                );
            }
        }

        if !record.is_success() && !has_noise(&record.actions) {
            let min = f64::from(self.min_samples);
            let noise_gain = domain.with_noise.rate() - domain.without_noise.rate();
            let behavioral = record.error_categories.contains(&ErrorCategory::Behavioral);
            let confidence = if behavioral {
                Some(0.7)
            } else if domain.with_noise.samples() >= min && noise_gain > 0.1 {
                Some(noise_gain.min(0.9))
            } else if domain.missing_interactions >= 1.0 {
                Some(0.5)
            } else {
                None
            };
            if let Some(confidence) = confidence {
                adaptations.push(
                    Adaptation::new(
                        AdaptationType::Behavior,
                        AdaptationAction::AddInteractionNoise,
                        AdaptationValue::Enabled(true),
                        confidence,
                        if behavioral { 2 } else { 1 },
                    )
                    .for_domain(&record.domain),
                );
            }
        }
        adaptations
    }

    fn periodic_update(&mut self, _now: DateTime<Utc>) {
        for domain in self.domains.values_mut() {
            for tally in domain.profiles.values_mut() {
                tally.decay(0.95);
            }
            domain.with_noise.decay(0.95);
            domain.without_noise.decay(0.95);
            domain.missing_interactions *= 0.9;
        }
        prune_empty(&mut self.domains, |domain| {
            domain.profiles.values().all(|tally| tally.samples() < 0.01)
        });
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

    fn record(profile: BehaviorProfile, outcome: Outcome) -> InteractionRecord {
        let mut record =
            InteractionRecord::from_context(&context("https://market.example.com/a"), outcome, Utc::now());
        record.behavior_profile = profile;
        record
    }

    #[test]
    fn recommends_the_profile_that_keeps_succeeding() {
        let mut model = BehaviorModel::new(3);
        for _ in 0..5 {
            model.learn(&record(BehaviorProfile::Research, Outcome::Success));
            model.update(&record(BehaviorProfile::Casual, Outcome::Failure), FailureCause::Error, &[]);
        }

        let failing = record(BehaviorProfile::Casual, Outcome::Failure);
        let recommendations = model.recommend(&failing);
        assert!(recommendations.iter().any(|adaptation| {
            adaptation.action == AdaptationAction::SwitchProfile
                && adaptation.value == AdaptationValue::Profile(BehaviorProfile::Research)
        }));

        let restored = {
            let mut fresh = BehaviorModel::new(3);
            fresh.deserialize(model.serialize().unwrap()).unwrap();
            fresh
        };
        assert_eq!(restored.recommend(&failing), recommendations);
    }
}

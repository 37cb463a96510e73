//! Similarity scoring, failure diffs and pattern-distribution tracking.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use super::record::{FailureCause, InteractionRecord};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::session::ActionKind;

/// Feature weights of [`similarity`]; they are expected to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub domain: f64,
    pub page_type: f64,
    pub time_of_day: f64,
    pub actions: f64,
    pub behavior_profile: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            domain: 0.3,
            page_type: 0.2,
            time_of_day: 0.1,
            actions: 0.2,
            behavior_profile: 0.2,
        }
    }
}

impl SimilarityWeights {
    pub fn total(&self) -> f64 {
        self.domain + self.page_type + self.time_of_day + self.actions + self.behavior_profile
    }
}

fn action_overlap(lhs: &[ActionKind], rhs: &[ActionKind]) -> f64 {
    let lhs: BTreeSet<_> = lhs.iter().collect();
    let rhs: BTreeSet<_> = rhs.iter().collect();
    let union = lhs.union(&rhs).count();
    if union == 0 {
        return 1.0;
    }
    lhs.intersection(&rhs).count() as f64 / union as f64
}

fn hour_proximity(lhs: f64, rhs: f64) -> f64 {
    let diff = (lhs - rhs).abs();
    let circular = diff.min(24.0 - diff);
    1.0 - circular / 12.0
}

/// Weighted similarity of two interactions in [0, 1].
pub fn similarity(a: &InteractionRecord, b: &InteractionRecord, weights: &SimilarityWeights) -> f64 {
    let matches = |same: bool| if same { 1.0 } else { 0.0 };
    let score = weights.domain * matches(a.domain == b.domain)
        + weights.page_type * matches(a.page_type == b.page_type)
        + weights.time_of_day * hour_proximity(a.hour_of_day(), b.hour_of_day())
        + weights.actions * action_overlap(&a.actions, &b.actions)
        + weights.behavior_profile * matches(a.behavior_profile == b.behavior_profile);
    let total = weights.total();
    if total <= f64::EPSILON {
        0.0
    } else {
        (score / total).clamp(0.0, 1.0)
    }
}

/// A field where a failed interaction differs from its closest success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldDifference {
    Timing {
        #[serde(with = "crate::config::duration_ms")]
        failed: Duration,
        #[serde(with = "crate::config::duration_ms")]
        succeeded: Duration,
    },
    BehaviorProfile {
        failed: BehaviorProfile,
        succeeded: BehaviorProfile,
    },
    ProxyGeography {
        failed: String,
        succeeded: String,
    },
    ActionSequence {
        missing: Vec<ActionKind>,
        extra: Vec<ActionKind>,
    },
    Latency {
        #[serde(with = "crate::config::duration_ms")]
        failed: Duration,
        #[serde(with = "crate::config::duration_ms")]
        succeeded: Duration,
    },
}

/// Differences between a failure and the success it most resembles.
pub fn field_differences(failed: &InteractionRecord, succeeded: &InteractionRecord) -> Vec<FieldDifference> {
    let mut differences = Vec::new();

    let (failed_delay, ok_delay) = (failed.metrics.applied_delay, succeeded.metrics.applied_delay);
    if failed_delay.abs_diff(ok_delay) > ok_delay.mul_f64(0.2).max(Duration::from_millis(250)) {
        differences.push(FieldDifference::Timing {
            failed: failed_delay,
            succeeded: ok_delay,
        });
    }
    if failed.behavior_profile != succeeded.behavior_profile {
        differences.push(FieldDifference::BehaviorProfile {
            failed: failed.behavior_profile,
            succeeded: succeeded.behavior_profile,
        });
    }
    if !failed.proxy_country.eq_ignore_ascii_case(&succeeded.proxy_country) {
        differences.push(FieldDifference::ProxyGeography {
            failed: failed.proxy_country.clone(),
            succeeded: succeeded.proxy_country.clone(),
        });
    }

    let failed_actions: BTreeSet<ActionKind> = failed.actions.iter().copied().collect();
    let ok_actions: BTreeSet<ActionKind> = succeeded.actions.iter().copied().collect();
    let missing: Vec<ActionKind> = ok_actions.difference(&failed_actions).copied().collect();
    let extra: Vec<ActionKind> = failed_actions.difference(&ok_actions).copied().collect();
    if !missing.is_empty() || !extra.is_empty() {
        differences.push(FieldDifference::ActionSequence { missing, extra });
    }

    let (failed_latency, ok_latency) = (failed.metrics.latency, succeeded.metrics.latency);
    if failed_latency > ok_latency.mul_f64(2.0) + Duration::from_millis(500) {
        differences.push(FieldDifference::Latency {
            failed: failed_latency,
            succeeded: ok_latency,
        });
    }
    differences
}

fn daypart(at: DateTime<Utc>) -> &'static str {
    match at.hour() {
        0..=5 => "night",
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

/// Pattern labels describing an interaction: outcome, behavior, error and temporal.
pub fn pattern_labels(record: &InteractionRecord, cause: Option<FailureCause>) -> Vec<String> {
    let mut labels = vec![
        format!("outcome:{}", record.outcome),
        format!("behavior:{}", record.behavior_profile),
        format!("temporal:{}:{}", daypart(record.started_at), record.outcome),
    ];
    if let Some(cause) = cause {
        labels.push(format!("cause:{cause}"));
    }
    for category in &record.error_categories {
        labels.push(format!("error:{category}"));
    }
    if let Some(pattern) = record.scan_pattern {
        labels.push(format!("scan:{pattern}"));
    }
    labels.extend(record.patterns.iter().cloned());
    labels
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PatternEvent {
    at: DateTime<Utc>,
    label: String,
}

/// Time-stamped pattern labels used to detect distribution shifts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternTracker {
    events: VecDeque<PatternEvent>,
    limit: usize,
}

impl PatternTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn observe(&mut self, at: DateTime<Utc>, labels: impl IntoIterator<Item = String>) {
        for label in labels {
            if self.events.len() >= self.limit {
                self.events.pop_front();
            }
            self.events.push_back(PatternEvent { at, label });
        }
    }

    /// Drop events older than `horizon`.
    pub fn prune(&mut self, now: DateTime<Utc>, horizon: Duration) {
        let cutoff = now - crate::modules::clock::chrono_duration(horizon);
        while self.events.front().is_some_and(|event| event.at < cutoff) {
            self.events.pop_front();
        }
    }

    /// Label counts within `window` before `now`.
    pub fn distribution(&self, now: DateTime<Utc>, window: Duration) -> BTreeMap<String, u64> {
        let cutoff = now - crate::modules::clock::chrono_duration(window);
        let mut counts = BTreeMap::new();
        for event in self.events.iter().filter(|event| event.at >= cutoff && event.at <= now) {
            *counts.entry(event.label.clone()).or_default() += 1;
        }
        counts
    }

    /// Most frequent labels within `window`.
    pub fn top_patterns(&self, now: DateTime<Utc>, window: Duration, limit: usize) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self.distribution(now, window).into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        counts
    }

    /// KL divergence of the last hour's label distribution from the last day's.
    /// Returns 0 until the last hour holds `min_events` events.
    pub fn shift(&self, now: DateTime<Utc>, min_events: usize) -> f64 {
        let recent = self.distribution(now, Duration::from_secs(60 * 60));
        let recent_total: u64 = recent.values().sum();
        if (recent_total as usize) < min_events.max(1) {
            return 0.0;
        }
        let baseline = self.distribution(now, Duration::from_secs(24 * 60 * 60));
        let baseline_total: u64 = baseline.values().sum();
        kl_divergence(&recent, recent_total, &baseline, baseline_total)
    }
}

const SMOOTHING: f64 = 1e-3;

fn kl_divergence(
    p: &BTreeMap<String, u64>,
    p_total: u64,
    q: &BTreeMap<String, u64>,
    q_total: u64,
) -> f64 {
    let labels: BTreeSet<&String> = p.keys().chain(q.keys()).collect();
    let n = labels.len() as f64;
    let probability = |counts: &BTreeMap<String, u64>, total: u64, label: &String| {
        let count = counts.get(label).copied().unwrap_or(0) as f64;
        (count + SMOOTHING) / (total as f64 + SMOOTHING * n)
    };
    labels
        .iter()
        .map(|label| {
            let p_i = probability(p, p_total, label);
            let q_i = probability(q, q_total, label);
            p_i * (p_i / q_i).ln()
        })
        .sum::<f64>()
        .max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::Outcome;
    use crate::modules::session::test_support::context;

    fn record(outcome: Outcome) -> InteractionRecord {
        InteractionRecord::from_context(&context("https://market.example.com/listings"), outcome, Utc::now())
    }

    #[test]
    fn identical_records_are_fully_similar() {
        let a = record(Outcome::Failure);
        let b = record(Outcome::Success);
        assert!((similarity(&a, &b, &SimilarityWeights::default()) - 1.0).abs() < 1e-9);

        let mut other = b.clone();
        other.domain = "elsewhere.example.com".into();
        other.behavior_profile = BehaviorProfile::Cautious;
        let score = similarity(&a, &other, &SimilarityWeights::default());
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn differences_name_changed_fields() {
        let mut failed = record(Outcome::Failure);
        failed.metrics.applied_delay = Duration::from_millis(500);
        failed.actions = vec![ActionKind::Navigate];
        let mut succeeded = record(Outcome::Success);
        succeeded.metrics.applied_delay = Duration::from_secs(3);
        succeeded.actions = vec![ActionKind::Navigate, ActionKind::Scroll];
        succeeded.proxy_country = "DE".into();

        let diffs = field_differences(&failed, &succeeded);
        assert!(diffs.contains(&FieldDifference::Timing {
            failed: Duration::from_millis(500),
            succeeded: Duration::from_secs(3),
        }));
        assert!(diffs.contains(&FieldDifference::ActionSequence {
            missing: vec![ActionKind::Scroll],
            extra: vec![],
        }));
        assert!(diffs.iter().any(|d| matches!(d, FieldDifference::ProxyGeography { .. })));
    }

    #[test]
    fn detects_distribution_shift() {
        let now = Utc::now();
        let mut tracker = PatternTracker::new(10_000);
        for hour in 2..20 {
            let at = now - chrono::Duration::hours(hour);
            tracker.observe(at, (0..10).map(|_| "outcome:success".to_string()));
        }
        tracker.observe(now, (0..5).map(|_| "outcome:success".to_string()));
        assert_eq!(tracker.shift(now, 20), 0.0);

        tracker.observe(now, (0..30).map(|_| "cause:detection".to_string()));
        assert!(tracker.shift(now, 20) > 0.5);
        assert_eq!(tracker.top_patterns(now, Duration::from_secs(3600), 1)[0].0, "cause:detection");
    }
}

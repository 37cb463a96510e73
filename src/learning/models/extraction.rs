use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LearningModel, QualityStat, context_key, coverage};
use crate::extraction::{ExtractionMode, ScanPattern};
use crate::learning::{
    Adaptation, AdaptationAction, AdaptationType, AdaptationValue, FailureCause, FieldDifference,
    InteractionRecord, LearningError,
};
use crate::recovery::ErrorCategory;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ExtractionStats {
    patterns: BTreeMap<ScanPattern, QualityStat>,
    modes: BTreeMap<ExtractionMode, QualityStat>,
    parse_failures: f64,
}

/// Learns which scan pattern and extraction mode yield the best data per context.
#[derive(Debug, Clone)]
pub struct ExtractionModel {
    min_samples: u32,
    stats: BTreeMap<String, ExtractionStats>,
}

impl ExtractionModel {
    pub fn new(min_samples: u32) -> Self {
        Self {
            min_samples,
            stats: BTreeMap::new(),
        }
    }

    /// Scan pattern with the highest mean quality for a `domain|page_type` key.
    pub fn best_pattern(&self, key: &str) -> Option<(ScanPattern, f64)> {
        let min = f64::from(self.min_samples);
        self.stats
            .get(key)?
            .patterns
            .iter()
            .filter(|(_, stat)| stat.count >= min)
            .map(|(pattern, stat)| (*pattern, stat.mean))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    fn best_mode(&self, key: &str) -> Option<(ExtractionMode, f64)> {
        let min = f64::from(self.min_samples);
        self.stats
            .get(key)?
            .modes
            .iter()
            .filter(|(_, stat)| stat.count >= min)
            .map(|(mode, stat)| (*mode, stat.mean))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }
}

impl LearningModel for ExtractionModel {
    fn name(&self) -> &'static str {
        "extraction"
    }

    fn learn(&mut self, record: &InteractionRecord) {
        let stats = self.stats.entry(context_key(record)).or_default();
        let quality = record.metrics.data_quality;
        if let Some(pattern) = record.scan_pattern {
            stats.patterns.entry(pattern).or_default().observe(quality);
        }
        stats.modes.entry(record.extraction_mode).or_default().observe(quality);
    }

    fn update(&mut self, record: &InteractionRecord, _cause: FailureCause, _differences: &[FieldDifference]) {
        if !record.error_categories.contains(&ErrorCategory::Parsing) {
            return;
        }
        let stats = self.stats.entry(context_key(record)).or_default();
        stats.parse_failures += 1.0;
        stats.modes.entry(record.extraction_mode).or_default().observe(0.0);
        if let Some(pattern) = record.scan_pattern {
            stats.patterns.entry(pattern).or_default().observe(0.0);
        }
    }

    fn recommend(&self, record: &InteractionRecord) -> Vec<Adaptation> {
        let key = context_key(record);
        let Some(stats) = self.stats.get(&key) else {
            return Vec::new();
        };
        let mut adaptations = Vec::new();

        if let Some(current) = record.scan_pattern
            && let Some((best, mean)) = self.best_pattern(&key)
            && best != current
        {
            let current_mean = stats.patterns.get(&current).map_or(0.0, |stat| stat.mean);
            if current_mean < 0.6 && mean > current_mean + 0.1 {
                let samples = stats.patterns.get(&best).map_or(0.0, |stat| stat.count);
                adaptations.push(
                    Adaptation::new(
                        AdaptationType::Extraction,
                        AdaptationAction::SwitchScanPattern,
                        AdaptationValue::ScanPattern(best),
                        mean * coverage(samples).max(0.5),
                        1,
                    )
                    .for_domain(&record.domain),
                );
            }
        }

        let failed_parsing =
            !record.is_success() && record.error_categories.contains(&ErrorCategory::Parsing);
        let learned_mode = self
            .best_mode(&key)
            .filter(|(mode, mean)| {
                *mode != record.extraction_mode
                    && *mean
                        > stats
                            .modes
                            .get(&record.extraction_mode)
                            .map_or(0.0, |stat| stat.mean)
                            + 0.1
            });
        let switch = match learned_mode {
            Some((mode, mean)) => Some((mode, mean.clamp(0.3, 0.95))),
            None if failed_parsing => record
                .extraction_mode
                .next()
                .map(|mode| (mode, 0.4 + 0.1 * stats.parse_failures.min(5.0))),
            None => None,
        };
        if let Some((mode, confidence)) = switch {
            adaptations.push(
                Adaptation::new(
                    AdaptationType::Extraction,
                    AdaptationAction::SwitchExtractionMode,
                    AdaptationValue::ExtractionMode(mode),
                    confidence,
                    if failed_parsing { 2 } else { 1 },
                )
                .for_domain(&record.domain),
            );
        }
        adaptations
    }

    fn periodic_update(&mut self, _now: DateTime<Utc>) {
        for stats in self.stats.values_mut() {
            stats.parse_failures *= 0.9;
            // Cap the effective sample size so means stay responsive.
            for stat in stats.patterns.values_mut().chain(stats.modes.values_mut()) {
                stat.count = stat.count.min(200.0);
            }
        }
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

    fn record(pattern: ScanPattern, quality: f64, outcome: Outcome) -> InteractionRecord {
        let mut record =
            InteractionRecord::from_context(&context("https://market.example.com/a"), outcome, Utc::now())
                .with_scan_pattern(pattern);
        record.metrics.data_quality = quality;
        record
    }

    #[test]
    fn switches_to_higher_quality_scan_pattern() {
        let mut model = ExtractionModel::new(3);
        for _ in 0..4 {
            model.learn(&record(ScanPattern::ZPattern, 0.9, Outcome::Success));
            model.learn(&record(ScanPattern::FPattern, 0.3, Outcome::Success));
        }
        let recommendations = model.recommend(&record(ScanPattern::FPattern, 0.3, Outcome::Success));
        assert_eq!(recommendations.len(), 1);
        assert_eq!(
            recommendations[0].value,
            AdaptationValue::ScanPattern(ScanPattern::ZPattern)
        );
    }

    #[test]
    fn parsing_failures_advance_the_extraction_mode() {
        let mut model = ExtractionModel::new(3);
        let failed = record(ScanPattern::FPattern, 0.0, Outcome::Failure)
            .with_error(ErrorCategory::Parsing, "unexpected page structure");
        model.update(&failed, FailureCause::Error, &[]);

        let recommendations = model.recommend(&failed);
        assert!(recommendations.iter().any(|adaptation| {
            adaptation.value == AdaptationValue::ExtractionMode(ExtractionMode::PatternFirst)
        }));
    }
}

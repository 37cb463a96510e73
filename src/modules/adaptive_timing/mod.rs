//! Adaptive timing algorithms for human-like navigation pacing.
//!
//! Provides behavioural profiles, adaptive delay calculation, circadian
//! adjustments, and per-domain learning.

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use crate::modules::session::PageType;

/// Behaviour profiles that control the high-level timing envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorProfile {
    Casual,
    Focused,
    Research,
    Mobile,
    /// Slowest, noisiest profile used after detection cooldowns.
    Cautious,
}

impl BehaviorProfile {
    pub const ALL: [BehaviorProfile; 5] = [
        BehaviorProfile::Casual,
        BehaviorProfile::Focused,
        BehaviorProfile::Research,
        BehaviorProfile::Mobile,
        BehaviorProfile::Cautious,
    ];

    /// Relative conservativeness, higher is slower.
    pub fn caution_rank(self) -> u8 {
        match self {
            BehaviorProfile::Focused => 0,
            BehaviorProfile::Mobile => 1,
            BehaviorProfile::Casual => 2,
            BehaviorProfile::Research => 3,
            BehaviorProfile::Cautious => 4,
        }
    }

    /// Next profile up the caution ladder.
    pub fn more_cautious(self) -> BehaviorProfile {
        match self {
            BehaviorProfile::Focused | BehaviorProfile::Mobile => BehaviorProfile::Casual,
            BehaviorProfile::Casual => BehaviorProfile::Research,
            BehaviorProfile::Research | BehaviorProfile::Cautious => BehaviorProfile::Cautious,
        }
    }
}

impl fmt::Display for BehaviorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BehaviorProfile::Casual => "casual",
            BehaviorProfile::Focused => "focused",
            BehaviorProfile::Research => "research",
            BehaviorProfile::Mobile => "mobile",
            BehaviorProfile::Cautious => "cautious",
        };
        f.write_str(name)
    }
}

fn page_multiplier(page_type: PageType) -> f32 {
    match page_type {
        PageType::Search => 1.35,
        PageType::Detail => 1.2,
        PageType::Landing => 0.8,
        PageType::Listing | PageType::Unknown => 1.0,
    }
}

/// Configuration describing the base timing envelope for a profile.
#[derive(Debug, Clone, Copy)]
pub struct TimingProfile {
    pub base_delay: f32,
    pub min_delay: f32,
    pub max_delay: f32,
    pub variance_factor: f32,
    pub cooldown_multiplier: f32,
    pub success_rate_threshold: f32,
}

impl TimingProfile {
    fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min_delay, self.max_delay)
    }

    pub fn for_profile(profile: BehaviorProfile) -> Self {
        match profile {
            BehaviorProfile::Casual => TimingProfile {
                base_delay: 1.5,
                min_delay: 0.5,
                max_delay: 3.0,
                variance_factor: 0.4,
                cooldown_multiplier: 1.5,
                success_rate_threshold: 0.8,
            },
            BehaviorProfile::Focused => TimingProfile {
                base_delay: 0.9,
                min_delay: 0.25,
                max_delay: 2.0,
                variance_factor: 0.3,
                cooldown_multiplier: 1.2,
                success_rate_threshold: 0.85,
            },
            BehaviorProfile::Research => TimingProfile {
                base_delay: 2.5,
                min_delay: 1.0,
                max_delay: 6.0,
                variance_factor: 0.6,
                cooldown_multiplier: 2.0,
                success_rate_threshold: 0.7,
            },
            BehaviorProfile::Mobile => TimingProfile {
                base_delay: 1.2,
                min_delay: 0.4,
                max_delay: 3.0,
                variance_factor: 0.4,
                cooldown_multiplier: 1.3,
                success_rate_threshold: 0.75,
            },
            BehaviorProfile::Cautious => TimingProfile {
                base_delay: 5.0,
                min_delay: 2.5,
                max_delay: 15.0,
                variance_factor: 0.7,
                cooldown_multiplier: 2.5,
                success_rate_threshold: 0.9,
            },
        }
    }
}

/// Request metadata supplied to timing strategies.
#[derive(Debug, Clone, Copy)]
pub struct TimingRequest {
    pub page_type: PageType,
    pub content_length: usize,
    /// Multiplier applied by learned adaptations, 1.0 when none.
    pub delay_multiplier: f32,
    pub at: DateTime<Utc>,
}

impl TimingRequest {
    pub fn new(page_type: PageType, content_length: usize, at: DateTime<Utc>) -> Self {
        Self {
            page_type,
            content_length,
            delay_multiplier: 1.0,
            at,
        }
    }

    pub fn scaled(mut self, multiplier: f64) -> Self {
        self.delay_multiplier = multiplier.max(0.1) as f32;
        self
    }
}

/// Outcome recorded after each navigation for adaptive learning.
#[derive(Debug, Clone, Copy)]
pub struct TimingOutcome {
    pub success: bool,
    pub response_time: Duration,
    pub applied_delay: Duration,
}

/// Snapshot of learned state for observability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DomainTimingSnapshot {
    pub success_rate: f32,
    pub consecutive_failures: u8,
    #[serde(with = "crate::config::duration_ms")]
    pub average_response_time: Duration,
    #[serde(with = "crate::config::duration_ms::option")]
    pub optimal_timing: Option<Duration>,
}

/// Interface for adaptive timing controllers.
pub trait AdaptiveTimingStrategy: Send + Sync {
    fn calculate_delay(
        &mut self,
        domain: &str,
        profile: BehaviorProfile,
        request: &TimingRequest,
    ) -> Duration;
    fn record_outcome(&mut self, domain: &str, outcome: &TimingOutcome);
    fn snapshot(&self, domain: &str) -> Option<DomainTimingSnapshot>;
}

/// Default adaptive timing strategy that applies human-like pacing heuristics.
#[derive(Debug, Default)]
pub struct DefaultAdaptiveTiming {
    domain_state: HashMap<String, DomainTimingState>,
}

#[derive(Debug, Clone)]
struct DomainTimingState {
    success_rate: f32,
    consecutive_failures: u8,
    average_response_time: f32,
    optimal_timing: Option<f32>,
    recent_delays: VecDeque<f32>,
}

impl Default for DomainTimingState {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            consecutive_failures: 0,
            average_response_time: 1.0,
            optimal_timing: None,
            recent_delays: VecDeque::with_capacity(32),
        }
    }
}

impl DefaultAdaptiveTiming {
    pub fn new() -> Self {
        Self::default()
    }

    fn circadian_multiplier(at: DateTime<Utc>) -> f32 {
        let base = match at.hour() {
            0 => 0.3,
            1..=3 => 0.2,
            4 => 0.3,
            5 => 0.4,
            6 => 0.6,
            7 => 0.8,
            8 => 0.9,
            9..=11 => 1.0,
            12 => 0.9,
            13 => 0.75,
            14 => 0.85,
            15 | 16 => 1.0,
            17 => 0.9,
            18 => 0.8,
            19 => 0.7,
            20 => 0.6,
            21 => 0.5,
            22 => 0.4,
            23 => 0.3,
            _ => 0.5,
        };
        let mut rng = rand::thread_rng();
        base * rng.gen_range(0.85..=1.15)
    }

    fn apply_human_jitter(mut delay: f32, content_length: usize) -> f32 {
        let mut rng = rand::thread_rng();
        // Time to skim the previous page.
        if content_length > 500 {
            let words = (content_length as f32 / 5.0).max(1.0);
            let reading_speed = rng.gen_range(200.0..=300.0);
            let reading_time = (words / reading_speed) * 60.0;
            let processing = rng.gen_range(0.5..=2.0);
            delay = delay.max(reading_time + processing);
        }

        delay += rng.gen_range(0.15..=0.4);

        if rng.r#gen::<f32>() < 0.05 {
            delay += rng.gen_range(5.0..=60.0);
        }
        delay
    }
}

impl AdaptiveTimingStrategy for DefaultAdaptiveTiming {
    fn calculate_delay(
        &mut self,
        domain: &str,
        profile: BehaviorProfile,
        request: &TimingRequest,
    ) -> Duration {
        let envelope = TimingProfile::for_profile(profile);
        let state = self.domain_state.entry(domain.to_string()).or_default();

        let mut delay = envelope.base_delay * page_multiplier(request.page_type);
        let mut rng = rand::thread_rng();
        delay *= rng.gen_range(1.0 - envelope.variance_factor..=1.0 + envelope.variance_factor);

        if state.success_rate < envelope.success_rate_threshold {
            let delta = envelope.success_rate_threshold - state.success_rate;
            delay *= 1.0 + delta.max(0.05);
        }

        if state.consecutive_failures > 0 {
            delay *= envelope.cooldown_multiplier.powf(state.consecutive_failures.min(3) as f32 / 3.0);
        }

        if let Some(optimal) = state.optimal_timing {
            delay = (delay * 0.8) + (optimal * 0.2);
        }

        delay *= state.average_response_time.clamp(0.6, 1.5);
        delay = Self::apply_human_jitter(delay, request.content_length);
        delay /= Self::circadian_multiplier(request.at).max(0.2);

        let multiplier = request.delay_multiplier;
        if (multiplier - 1.0).abs() < f32::EPSILON {
            return Duration::from_secs_f32(envelope.clamp(delay));
        }
        let min_delay = envelope.min_delay * multiplier;
        let max_delay = envelope.max_delay * multiplier.max(1.0);
        Duration::from_secs_f32((delay * multiplier).clamp(min_delay, max_delay))
    }

    fn record_outcome(&mut self, domain: &str, outcome: &TimingOutcome) {
        let state = self.domain_state.entry(domain.to_string()).or_default();
        let alpha = 0.1;
        let success_value = if outcome.success { 1.0 } else { 0.0 };

        state.success_rate = (1.0 - alpha) * state.success_rate + alpha * success_value;

        if outcome.success {
            state.consecutive_failures = 0;
            let applied = outcome.applied_delay.as_secs_f32().min(10.0);
            state.optimal_timing = Some(match state.optimal_timing {
                None => applied,
                Some(prev) => (0.9 * prev) + (0.1 * applied),
            });
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1).min(5);
        }

        let response_time = outcome.response_time.as_secs_f32().min(30.0);
        state.average_response_time =
            (1.0 - alpha) * state.average_response_time + alpha * response_time;

        if state.recent_delays.len() == 32 {
            state.recent_delays.pop_front();
        }
        state
            .recent_delays
            .push_back(outcome.applied_delay.as_secs_f32().min(10.0));
    }

    fn snapshot(&self, domain: &str) -> Option<DomainTimingSnapshot> {
        self.domain_state.get(domain).map(|state| DomainTimingSnapshot {
            success_rate: state.success_rate,
            consecutive_failures: state.consecutive_failures,
            average_response_time: Duration::from_secs_f32(state.average_response_time),
            optimal_timing: state.optimal_timing.map(Duration::from_secs_f32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, 10, 0, 0).unwrap()
    }

    #[test]
    fn delays_stay_within_profile_envelope() {
        let mut timing = DefaultAdaptiveTiming::new();
        for profile in BehaviorProfile::ALL {
            let envelope = TimingProfile::for_profile(profile);
            for _ in 0..20 {
                let delay = timing.calculate_delay(
                    "example.com",
                    profile,
                    &TimingRequest::new(PageType::Listing, 2000, noon()),
                );
                assert!(delay.as_secs_f32() >= envelope.min_delay - 0.001);
                assert!(delay.as_secs_f32() <= envelope.max_delay + 0.001);
            }
        }
    }

    #[test]
    fn adaptation_multiplier_slows_pacing() {
        let mut timing = DefaultAdaptiveTiming::new();
        let envelope = TimingProfile::for_profile(BehaviorProfile::Focused);
        let request = TimingRequest::new(PageType::Listing, 0, noon()).scaled(2.0);
        for _ in 0..20 {
            let delay = timing.calculate_delay("example.com", BehaviorProfile::Focused, &request);
            assert!(delay.as_secs_f32() >= envelope.min_delay * 2.0 - 0.001);
        }
    }

    #[test]
    fn failures_are_tracked_per_domain() {
        let mut timing = DefaultAdaptiveTiming::new();
        let outcome = TimingOutcome {
            success: false,
            response_time: Duration::from_secs(2),
            applied_delay: Duration::from_secs(1),
        };
        timing.record_outcome("a.example", &outcome);
        timing.record_outcome("a.example", &outcome);
        let snapshot = timing.snapshot("a.example").unwrap();
        assert_eq!(snapshot.consecutive_failures, 2);
        assert!(snapshot.success_rate < 1.0);
        assert!(timing.snapshot("b.example").is_none());
    }

    #[test]
    fn cautious_is_the_top_of_the_ladder() {
        let mut profile = BehaviorProfile::Focused;
        for _ in 0..5 {
            profile = profile.more_cautious();
        }
        assert_eq!(profile, BehaviorProfile::Cautious);
        assert!(BehaviorProfile::ALL
            .iter()
            .all(|p| p.caution_rank() <= BehaviorProfile::Cautious.caution_rank()));
    }
}

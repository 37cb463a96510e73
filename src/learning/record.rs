use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::extraction::{ExtractionMode, ScanPattern};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::proxy::ProxyType;
use crate::modules::session::{ActionKind, PageType, SessionContext};
use crate::recovery::{ErrorCategory, RecoveryStrategyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

/// Most likely reason a failed interaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Detection,
    Error,
    Timeout,
    Unknown,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCause::Detection => "detection",
            FailureCause::Error => "error",
            FailureCause::Timeout => "timeout",
            FailureCause::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionMetrics {
    #[serde(with = "crate::config::duration_ms")]
    pub latency: Duration,
    /// Delay applied before the navigation.
    #[serde(with = "crate::config::duration_ms")]
    pub applied_delay: Duration,
    /// Mean record quality in [0, 1].
    pub data_quality: f64,
    pub records: usize,
    pub elements_processed: usize,
    /// Navigation attempts spent, including the successful one.
    pub attempts: u32,
}

/// Immutable summary of one finished unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub session_id: String,
    pub domain: String,
    pub url: String,
    pub page_type: PageType,
    pub behavior_profile: BehaviorProfile,
    pub proxy_id: String,
    pub proxy_type: ProxyType,
    pub proxy_country: String,
    pub actions: Vec<ActionKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub metrics: InteractionMetrics,
    pub errors: Vec<String>,
    pub error_categories: Vec<ErrorCategory>,
    pub detection_indicators: Vec<String>,
    /// Recovery strategies that succeeded during the interaction.
    pub recoveries: Vec<RecoveryStrategyKind>,
    pub scan_pattern: Option<ScanPattern>,
    pub extraction_mode: ExtractionMode,
    /// Free-form pattern labels observed during the interaction.
    pub patterns: Vec<String>,
    pub aborted: bool,
}

impl InteractionRecord {
    pub fn from_context(ctx: &SessionContext, outcome: Outcome, completed_at: DateTime<Utc>) -> Self {
        let record = &ctx.identity.lease.record;
        Self {
            session_id: ctx.session_id.clone(),
            domain: ctx.domain.clone(),
            url: ctx.url.clone(),
            page_type: ctx.page_type,
            behavior_profile: ctx.behavior_profile,
            proxy_id: record.id.clone(),
            proxy_type: record.proxy_type,
            proxy_country: record.geo.country.clone(),
            actions: ctx.action_kinds(),
            started_at: ctx.started_at,
            completed_at,
            outcome,
            metrics: InteractionMetrics::default(),
            errors: Vec::new(),
            error_categories: Vec::new(),
            detection_indicators: Vec::new(),
            recoveries: Vec::new(),
            scan_pattern: None,
            extraction_mode: ctx.extraction_mode,
            patterns: Vec::new(),
            aborted: false,
        }
    }

    pub fn with_metrics(mut self, metrics: InteractionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_error(mut self, category: ErrorCategory, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self.error_categories.push(category);
        self
    }

    pub fn with_detection(mut self, indicator: impl Into<String>) -> Self {
        self.detection_indicators.push(indicator.into());
        self
    }

    pub fn with_scan_pattern(mut self, pattern: ScanPattern) -> Self {
        self.scan_pattern = Some(pattern);
        self
    }

    pub fn aborted(mut self) -> Self {
        self.aborted = true;
        self.outcome = Outcome::Failure;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn failure_cause(&self, timeout_latency: Duration) -> FailureCause {
        if !self.detection_indicators.is_empty()
            || self.error_categories.contains(&ErrorCategory::Detection)
        {
            FailureCause::Detection
        } else if !self.errors.is_empty() {
            FailureCause::Error
        } else if self.metrics.latency > timeout_latency {
            FailureCause::Timeout
        } else {
            FailureCause::Unknown
        }
    }

    /// Hour of day the interaction started, as a float.
    pub fn hour_of_day(&self) -> f64 {
        f64::from(self.started_at.hour()) + f64::from(self.started_at.minute()) / 60.0
    }

    /// Key used by per-context tables.
    pub fn context_key(&self) -> String {
        format!("{}|{}|{}", self.domain, self.page_type, self.behavior_profile)
    }
}

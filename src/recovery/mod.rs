//! Fault classification and recovery.
//!
//! Faults are matched against an ordered pattern table, mapped to a category
//! specific strategy list, and recovered by running those strategies in order.
//! A shared circuit breaker gates new work after repeated failures.

mod circuit;
mod classifier;
mod engine;
mod selectors;
mod strategies;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use classifier::FaultClassifier;
pub use engine::{RecoveryEngine, RecoveryMetrics, RecoveryOutcome};
pub use selectors::{SelectorMethod, SelectorRecovery, SelectorReplacement};
pub use strategies::{RecoveryResources, RecoveryStrategy, StrategyError, StrategyInput};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::external_deps::browser::{NavigationError, PageSnapshot};
use crate::modules::proxy::ProxyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Detection,
    Network,
    Parsing,
    Resource,
    Behavioral,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Detection => "detection",
            ErrorCategory::Network => "network",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Behavioral => "behavioral",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Captcha,
    RateLimit,
    Ban,
    BehavioralDetection,
    Honeypot,
    Timeout,
    ConnectionRefused,
    DnsFailure,
    TlsError,
    ProxyError,
    SelectorNotFound,
    StructureChanged,
    EmptyResponse,
    EncodingError,
    MemoryExhausted,
    CpuExhausted,
    DiskExhausted,
    EngineCrash,
    TooFast,
    TooConsistent,
    SuspiciousNavigation,
    MissingInteractions,
    Unknown,
}

impl ErrorType {
    pub fn category(self) -> ErrorCategory {
        use ErrorType::*;
        match self {
            Captcha | RateLimit | Ban | BehavioralDetection | Honeypot => ErrorCategory::Detection,
            Timeout | ConnectionRefused | DnsFailure | TlsError | ProxyError => ErrorCategory::Network,
            SelectorNotFound | StructureChanged | EmptyResponse | EncodingError => ErrorCategory::Parsing,
            MemoryExhausted | CpuExhausted | DiskExhausted | EngineCrash => ErrorCategory::Resource,
            TooFast | TooConsistent | SuspiciousNavigation | MissingInteractions => {
                ErrorCategory::Behavioral
            }
            Unknown => ErrorCategory::Unknown,
        }
    }

    /// Ordered recovery strategies for this fault type.
    pub fn strategies(self) -> Vec<RecoveryStrategyKind> {
        use RecoveryStrategyKind::*;
        match self {
            ErrorType::Captcha => vec![SolveCaptcha, RotateIdentity, EnhanceBehavior, Fallback],
            ErrorType::RateLimit => vec![ExponentialBackoff, RotateProxy, EnhanceBehavior, Fallback],
            ErrorType::Ban | ErrorType::Honeypot => vec![RotateIdentity, EnhanceBehavior, Fallback],
            ErrorType::BehavioralDetection => vec![EnhanceBehavior, RotateIdentity, Fallback],
            ErrorType::Timeout => vec![Delay, ExponentialBackoff, RotateProxy],
            ErrorType::ConnectionRefused => vec![ExponentialBackoff, RotateProxy],
            ErrorType::DnsFailure => vec![Delay, ExponentialBackoff, RotateProxy],
            ErrorType::TlsError => vec![RotateProxy, Delay],
            ErrorType::ProxyError => vec![RotateProxy, ExponentialBackoff],
            ErrorType::SelectorNotFound => vec![UpdateSelectors, AdaptParsing, WaitLonger],
            ErrorType::StructureChanged => vec![AdaptParsing, UpdateSelectors],
            ErrorType::EmptyResponse => vec![WaitLonger, Delay, RotateProxy],
            ErrorType::EncodingError => vec![AdaptParsing, Delay],
            ErrorType::MemoryExhausted | ErrorType::CpuExhausted | ErrorType::DiskExhausted => {
                vec![Throttle, RestartSession]
            }
            ErrorType::EngineCrash => vec![RestartSession, Delay],
            ErrorType::TooFast
            | ErrorType::TooConsistent
            | ErrorType::SuspiciousNavigation
            | ErrorType::MissingInteractions => vec![EnhanceBehavior, Delay],
            ErrorType::Unknown => vec![Delay, ExponentialBackoff, RotateProxy, Fallback],
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorType::Captcha => "captcha",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Ban => "ban",
            ErrorType::BehavioralDetection => "behavioral_detection",
            ErrorType::Honeypot => "honeypot",
            ErrorType::Timeout => "timeout",
            ErrorType::ConnectionRefused => "connection_refused",
            ErrorType::DnsFailure => "dns_failure",
            ErrorType::TlsError => "tls_error",
            ErrorType::ProxyError => "proxy_error",
            ErrorType::SelectorNotFound => "selector_not_found",
            ErrorType::StructureChanged => "structure_changed",
            ErrorType::EmptyResponse => "empty_response",
            ErrorType::EncodingError => "encoding_error",
            ErrorType::MemoryExhausted => "memory_exhausted",
            ErrorType::CpuExhausted => "cpu_exhausted",
            ErrorType::DiskExhausted => "disk_exhausted",
            ErrorType::EngineCrash => "engine_crash",
            ErrorType::TooFast => "too_fast",
            ErrorType::TooConsistent => "too_consistent",
            ErrorType::SuspiciousNavigation => "suspicious_navigation",
            ErrorType::MissingInteractions => "missing_interactions",
            ErrorType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategyKind {
    Delay,
    ExponentialBackoff,
    RotateProxy,
    RotateIdentity,
    EnhanceBehavior,
    UpdateSelectors,
    AdaptParsing,
    WaitLonger,
    SolveCaptcha,
    Throttle,
    RestartSession,
    Fallback,
}

impl fmt::Display for RecoveryStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategyKind::Delay => "delay",
            RecoveryStrategyKind::ExponentialBackoff => "exponential_backoff",
            RecoveryStrategyKind::RotateProxy => "rotate_proxy",
            RecoveryStrategyKind::RotateIdentity => "rotate_identity",
            RecoveryStrategyKind::EnhanceBehavior => "enhance_behavior",
            RecoveryStrategyKind::UpdateSelectors => "update_selectors",
            RecoveryStrategyKind::AdaptParsing => "adapt_parsing",
            RecoveryStrategyKind::WaitLonger => "wait_longer",
            RecoveryStrategyKind::SolveCaptcha => "solve_captcha",
            RecoveryStrategyKind::Throttle => "throttle",
            RecoveryStrategyKind::RestartSession => "restart_session",
            RecoveryStrategyKind::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// A raised fault plus whatever page state was available when it happened.
#[derive(Debug, Clone, Default)]
pub struct Fault {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
    /// Selector that failed to match, for parsing faults.
    pub selector: Option<String>,
    pub page: Option<Arc<PageSnapshot>>,
    pub page_excerpt: Option<String>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_page(mut self, page: Arc<PageSnapshot>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.page_excerpt = Some(excerpt.into());
        self
    }

    /// Markup to scan for detection markers.
    pub fn markup(&self) -> Option<&str> {
        self.page
            .as_ref()
            .map(|page| page.excerpt(16 * 1024))
            .or(self.page_excerpt.as_deref())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<NavigationError> for Fault {
    fn from(err: NavigationError) -> Self {
        Fault {
            message: err.message,
            code: Some(err.kind.code().to_string()),
            status: err.status,
            selector: None,
            page: None,
            page_excerpt: err.page_excerpt,
        }
    }
}

/// Result of classifying a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub error_type: ErrorType,
    pub matched_pattern: Option<String>,
    pub strategies: Vec<RecoveryStrategyKind>,
}

impl ErrorClassification {
    pub fn is_detection(&self) -> bool {
        self.category == ErrorCategory::Detection
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error(
        "recovery exhausted for {}/{} after {attempted:?}",
        classification.category,
        classification.error_type
    )]
    Exhausted {
        classification: ErrorClassification,
        attempted: Vec<RecoveryStrategyKind>,
    },
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Detection faults above this level trigger a pipeline-wide pause.
    pub suspicion_threshold: u32,
    #[serde(with = "crate::config::duration_ms::range")]
    pub detection_cooldown: (Duration, Duration),
    /// Successes needed before leaving the cautious profile.
    pub cautious_recovery_successes: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub wait_longer_step: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub throttle_pause: Duration,
    /// Attempts during which `Delay` may answer a fault. Zero disables it.
    pub delay_attempts: u32,
    /// Attempts during which `ExponentialBackoff` may answer a fault.
    pub backoff_attempts: u32,
    pub wait_longer_attempts: u32,
    pub throttle_attempts: u32,
    /// Proxy types tried, in order, by the fallback strategy.
    pub fallback_proxy_types: Vec<ProxyType>,
    pub circuit: CircuitConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: 3,
            detection_cooldown: (Duration::from_secs(30), Duration::from_secs(60)),
            cautious_recovery_successes: 10,
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            wait_longer_step: Duration::from_secs(2),
            throttle_pause: Duration::from_secs(5),
            delay_attempts: 1,
            backoff_attempts: 2,
            wait_longer_attempts: 2,
            throttle_attempts: 1,
            fallback_proxy_types: vec![ProxyType::Mobile, ProxyType::Residential],
            circuit: CircuitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::browser::NavigationErrorKind;

    #[test]
    fn every_type_has_a_strategy_list() {
        let types = [
            ErrorType::Captcha,
            ErrorType::Timeout,
            ErrorType::SelectorNotFound,
            ErrorType::EngineCrash,
            ErrorType::TooFast,
            ErrorType::Unknown,
        ];
        for error_type in types {
            assert!(!error_type.strategies().is_empty(), "{error_type}");
        }
        assert_eq!(ErrorType::RateLimit.to_string(), "rate_limit");
    }

    #[test]
    fn navigation_errors_become_faults() {
        let err = NavigationError::new(NavigationErrorKind::Timeout, "navigation timeout of 30000 ms exceeded")
            .with_status(504);
        let fault = Fault::from(err);
        assert_eq!(fault.code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(fault.status, Some(504));
        assert_eq!(fault.to_string(), "[ETIMEDOUT] navigation timeout of 30000 ms exceeded");
    }
}

//! Request metrics.
//!
//! Aggregated global and per-domain statistics for completed units of work,
//! with latency percentiles for observability.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Aggregated metrics across all domains.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub aborted: u64,
    #[serde(with = "crate::config::duration_ms::option")]
    pub average_latency: Option<Duration>,
    #[serde(with = "crate::config::duration_ms::option")]
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            aborted: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Domain-scoped metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(with = "crate::config::duration_ms::option")]
    pub average_latency: Option<Duration>,
    #[serde(with = "crate::config::duration_ms::option")]
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub global: GlobalStats,
    pub domains: Vec<DomainStats>,
}

#[derive(Debug)]
struct DomainAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
}

impl DomainAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.total_requests += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn stats(&self, domain: &str) -> DomainStats {
        let (average_latency, p95_latency) = latency_stats(self.latencies.iter().copied());
        DomainStats {
            domain: domain.to_string(),
            total_requests: self.total_requests,
            successes: self.successes,
            failures: self.failures,
            average_latency,
            p95_latency,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

fn latency_stats(samples: impl Iterator<Item = Duration>) -> (Option<Duration>, Option<Duration>) {
    let mut samples: Vec<Duration> = samples.collect();
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    domains: HashMap<String, DomainAccumulator>,
}

/// Thread-safe metrics collector used by the orchestrator.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                global: GlobalStats::default(),
                max_window: window.max(16),
                domains: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_outcome(&self, domain: &str, success: bool, latency: Duration) {
        let mut guard = self.lock();
        guard.global.total_requests += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        let window = guard.max_window;
        guard
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainAccumulator::new(window))
            .record(success, latency);

        let (_, p95) = latency_stats(
            guard
                .domains
                .values()
                .flat_map(|domain| domain.latencies.iter().copied()),
        );
        guard.global.p95_latency = p95;
    }

    pub fn record_aborted(&self, domain: &str) {
        let mut guard = self.lock();
        guard.global.aborted += 1;
        let window = guard.max_window;
        let acc = guard
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainAccumulator::new(window));
        acc.total_requests += 1;
        acc.failures += 1;
    }

    pub fn snapshot(&self) -> RequestMetrics {
        let guard = self.lock();
        let mut domains: Vec<DomainStats> = guard
            .domains
            .iter()
            .map(|(domain, acc)| acc.stats(domain))
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        RequestMetrics {
            global: guard.global.clone(),
            domains,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome("example.com", true, Duration::from_millis(150));
        metrics.record_outcome("example.com", false, Duration::from_millis(800));
        metrics.record_aborted("example.com");

        let snapshot = metrics.snapshot();
        let domain = snapshot
            .domains
            .iter()
            .find(|d| d.domain == "example.com")
            .unwrap();
        assert_eq!(domain.total_requests, 3);
        assert_eq!(domain.successes, 1);
        assert_eq!(domain.failures, 2);
        assert_eq!(domain.p95_latency, Some(Duration::from_millis(800)));
        assert_eq!(snapshot.global.aborted, 1);
    }
}

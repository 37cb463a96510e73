//! Periodic proxy health checks.
//!
//! The cycle snapshots stale records under the pool lock, probes them with the
//! lock released, then writes the results back. Expired blocks are lifted at
//! the start of every cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

use super::{HealthStatus, IdentityPool, ProxyRecord};
use crate::modules::clock::elapsed_between;
use crate::modules::events::{EventBus, HarvestEvent};
use crate::modules::scheduler::ScheduledTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Records not checked for this long are probed.
    #[serde(with = "crate::config::duration_ms")]
    pub staleness: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub degraded_latency: Duration,
    pub degraded_success_rate: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub probe_timeout: Duration,
    pub control_endpoints: Vec<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(5 * 60),
            degraded_latency: Duration::from_secs(3),
            degraded_success_rate: 0.8,
            probe_timeout: Duration::from_secs(10),
            control_endpoints: vec![
                "https://www.gstatic.com/generate_204".into(),
                "https://httpbin.org/status/204".into(),
            ],
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Failed(String),
    #[error("no control endpoint configured")]
    NoEndpoint,
}

/// Measures round-trip latency through a proxy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, record: &ProxyRecord) -> Result<Duration, ProbeError>;
}

/// Probe that issues a GET against rotating control endpoints via the proxy.
#[derive(Debug)]
pub struct ReqwestHealthProbe {
    endpoints: Vec<Url>,
    timeout: Duration,
    cursor: AtomicUsize,
}

impl ReqwestHealthProbe {
    pub fn new(config: &HealthCheckConfig) -> Self {
        let endpoints = config
            .control_endpoints
            .iter()
            .filter_map(|raw| match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    log::warn!("ignoring control endpoint {raw}: {err}");
                    None
                }
            })
            .collect();
        Self {
            endpoints,
            timeout: config.probe_timeout,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next_endpoint(&self) -> Option<&Url> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints.get(idx)
    }
}

#[async_trait]
impl HealthProbe for ReqwestHealthProbe {
    async fn probe(&self, record: &ProxyRecord) -> Result<Duration, ProbeError> {
        let endpoint = self.next_endpoint().ok_or(ProbeError::NoEndpoint)?;
        let proxy = reqwest::Proxy::all(record.proxy_url())
            .map_err(|err| ProbeError::Failed(err.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|err| ProbeError::Failed(err.to_string()))?;

        let started = Instant::now();
        let response = client.get(endpoint.clone()).send().await.map_err(|err| {
            if err.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Failed(err.to_string())
            }
        })?;
        let latency = started.elapsed();

        if response.status().is_success() {
            Ok(latency)
        } else {
            Err(ProbeError::Failed(format!("status {}", response.status())))
        }
    }
}

/// Outcome of one health-check cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub checked: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unblocked: Vec<String>,
}

impl IdentityPool {
    /// Run one health-check cycle.
    pub async fn run_health_check(
        &self,
        probe: &dyn HealthProbe,
        config: &HealthCheckConfig,
    ) -> HealthCheckReport {
        let now = self.now();
        let (unblocked, stale) = {
            let mut state = self.lock();
            let unblocked = state.unblock_expired(now);
            let stale: Vec<ProxyRecord> = state
                .records
                .iter()
                .filter(|record| !record.is_blocked_at(now))
                .filter(|record| {
                    state
                        .health
                        .get(&record.id)
                        .and_then(|health| health.last_checked)
                        .is_none_or(|checked| is_stale(checked, now, config.staleness))
                })
                .cloned()
                .collect();
            (unblocked, stale)
        };

        let mut results = Vec::with_capacity(stale.len());
        for record in &stale {
            let outcome =
                match tokio::time::timeout(config.probe_timeout, probe.probe(record)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout(config.probe_timeout)),
                };
            if let Err(ref err) = outcome {
                log::debug!("health probe for {} failed: {}", record.id, err);
            }
            results.push((record.id.clone(), outcome));
        }

        let checked_at = self.now();
        let mut report = HealthCheckReport {
            checked: results.len(),
            unblocked,
            ..Default::default()
        };

        let mut state = self.lock();
        for (id, outcome) in results {
            let Some(record) = state.records.iter().find(|record| record.id == id) else {
                continue;
            };
            let blocked = record.is_blocked_at(checked_at);
            let success_rate = record.success_rate();
            let health = state.health.entry(id).or_default();
            health.last_checked = Some(checked_at);
            health.success_rate = success_rate;

            health.status = if blocked {
                HealthStatus::Blocked
            } else {
                match outcome {
                    Err(_) => HealthStatus::Unhealthy,
                    Ok(latency) => {
                        health.latency = Some(latency);
                        if latency > config.degraded_latency
                            || success_rate < config.degraded_success_rate
                        {
                            HealthStatus::Degraded
                        } else {
                            HealthStatus::Healthy
                        }
                    }
                }
            };

            match health.status {
                HealthStatus::Healthy => report.healthy += 1,
                HealthStatus::Degraded => report.degraded += 1,
                HealthStatus::Unhealthy => report.unhealthy += 1,
                HealthStatus::Blocked => {}
            }
        }

        log::debug!(
            "health check: {} checked, {} healthy, {} degraded, {} unhealthy, {} unblocked",
            report.checked,
            report.healthy,
            report.degraded,
            report.unhealthy,
            report.unblocked.len()
        );
        report
    }
}

/// Health-check cycle on the scheduler.
pub struct HealthCheckTask {
    pool: Arc<IdentityPool>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    events: Option<EventBus>,
}

impl HealthCheckTask {
    pub fn new(pool: Arc<IdentityPool>, probe: Arc<dyn HealthProbe>, config: HealthCheckConfig) -> Self {
        Self {
            pool,
            probe,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run_once(&self) -> HealthCheckReport {
        let report = self
            .pool
            .run_health_check(self.probe.as_ref(), &self.config)
            .await;
        if let Some(events) = &self.events {
            for proxy_id in &report.unblocked {
                events.publish(HarvestEvent::ProxyUnblocked {
                    proxy_id: proxy_id.clone(),
                });
            }
        }
        report
    }
}

#[async_trait]
impl ScheduledTask for HealthCheckTask {
    fn name(&self) -> &str {
        "proxy-health-check"
    }

    async fn tick(&self) {
        self.run_once().await;
    }
}

fn is_stale(checked: DateTime<Utc>, now: DateTime<Utc>, staleness: Duration) -> bool {
    elapsed_between(checked, now) >= staleness
}

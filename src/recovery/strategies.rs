//! One recovery capability per [`RecoveryStrategyKind`].
//!
//! Strategies never touch the session directly. They return a
//! [`SessionPatch`] that the caller folds into the next context, which keeps
//! them safe to retry.

use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::{ErrorCategory, ErrorClassification, Fault, RecoveryConfig, RecoveryStrategyKind, SelectorRecovery};
use crate::external_deps::captcha::{BoundedCaptchaSolver, CaptchaError, CaptchaTask};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::proxy::{IdentityPool, PoolError, ProxyLease, RotationReason, SelectionCriteria};
use crate::modules::session::{Identity, SessionContext, SessionPatch};
use crate::modules::spoofing::FingerprintGenerator;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Captcha(#[from] CaptchaError),
    #[error("strategy not applicable: {0}")]
    NotApplicable(String),
}

/// Shared collaborators strategies act on.
#[derive(Debug, Clone)]
pub struct RecoveryResources {
    pub pool: Arc<IdentityPool>,
    pub fingerprints: Arc<Mutex<FingerprintGenerator>>,
    pub captcha: Option<BoundedCaptchaSolver>,
    pub selectors: Arc<SelectorRecovery>,
}

impl RecoveryResources {
    pub fn new(pool: Arc<IdentityPool>) -> Self {
        Self {
            pool,
            fingerprints: Arc::new(Mutex::new(FingerprintGenerator::default())),
            captcha: None,
            selectors: Arc::new(SelectorRecovery::new()),
        }
    }

    pub fn with_captcha(mut self, solver: BoundedCaptchaSolver) -> Self {
        self.captcha = Some(solver);
        self
    }

    pub fn with_fingerprints(mut self, generator: FingerprintGenerator) -> Self {
        self.fingerprints = Arc::new(Mutex::new(generator));
        self
    }

    pub(crate) fn identity_for(&self, lease: ProxyLease) -> Identity {
        let fingerprint = self
            .fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fingerprint_for(&lease.record.id, lease.record.proxy_type);
        Identity { lease, fingerprint }
    }

    fn forget_fingerprint(&self, proxy_id: &str) {
        self.fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate(proxy_id);
    }
}

/// Everything a strategy sees for one attempt.
pub struct StrategyInput<'a> {
    pub fault: &'a Fault,
    pub classification: &'a ErrorClassification,
    pub ctx: &'a SessionContext,
    /// 1-based attempt number of the unit of work.
    pub attempt: u32,
    pub resources: &'a RecoveryResources,
    pub config: &'a RecoveryConfig,
}

impl StrategyInput<'_> {
    fn same_type_criteria(&self) -> SelectionCriteria {
        let record = &self.ctx.identity.lease.record;
        let mut criteria = SelectionCriteria::new(record.proxy_type).in_country(record.geo.country.clone());
        if let Some(city) = &record.geo.city {
            criteria = criteria.in_city(city.clone());
        }
        criteria
    }

    /// Waiting strategies only answer early attempts on a usable proxy.
    fn pacing_applies(&self, window: u32) -> Result<(), StrategyError> {
        let proxy_id = self.ctx.identity.proxy_id();
        if self.resources.pool.is_blocked(proxy_id) {
            return Err(StrategyError::NotApplicable(format!("proxy {proxy_id} is blocked")));
        }
        if self.attempt > window {
            return Err(StrategyError::NotApplicable(format!(
                "attempt {} is past the {window} attempt window",
                self.attempt
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn kind(&self) -> RecoveryStrategyKind;

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError>;
}

fn jittered(base: Duration, spread: f64) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
    base.mul_f64(factor.max(0.0))
}

/// Fixed pause that grows linearly with the attempt number.
pub struct DelayStrategy;

#[async_trait]
impl RecoveryStrategy for DelayStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Delay
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        input.pacing_applies(input.config.delay_attempts)?;
        let pause = jittered(input.config.base_delay * input.attempt.max(1), 0.2);
        tokio::time::sleep(pause.min(input.config.max_backoff)).await;
        Ok(SessionPatch::default())
    }
}

/// `base * 2^attempt`, capped, with 10% jitter.
pub struct ExponentialBackoffStrategy;

#[async_trait]
impl RecoveryStrategy for ExponentialBackoffStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::ExponentialBackoff
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        input.pacing_applies(input.config.backoff_attempts)?;
        let exponent = input.attempt.min(16);
        let backoff = input
            .config
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(input.config.max_backoff);
        tokio::time::sleep(jittered(backoff, 0.1)).await;

        let mut patch = SessionPatch::default();
        if input.classification.category == ErrorCategory::Detection {
            patch.delay_multiplier = Some(1.5);
        }
        Ok(patch)
    }
}

/// New proxy of the same type and geography, fingerprint kept per proxy.
pub struct RotateProxyStrategy;

#[async_trait]
impl RecoveryStrategy for RotateProxyStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::RotateProxy
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let lease = input.resources.pool.rotate(
            input.ctx.identity.proxy_id(),
            RotationReason::Failed,
            &input.same_type_criteria(),
        )?;
        Ok(SessionPatch {
            identity: Some(input.resources.identity_for(lease)),
            ..Default::default()
        })
    }
}

/// Block the current proxy as detected and start over with a fresh fingerprint.
pub struct RotateIdentityStrategy;

#[async_trait]
impl RecoveryStrategy for RotateIdentityStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::RotateIdentity
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let current = input.ctx.identity.proxy_id();
        let lease = input.resources.pool.rotate(
            current,
            RotationReason::Blocked,
            &input.same_type_criteria(),
        )?;
        input.resources.forget_fingerprint(current);
        input.resources.forget_fingerprint(&lease.record.id);
        Ok(SessionPatch {
            identity: Some(input.resources.identity_for(lease)),
            behavior_profile: Some(input.ctx.behavior_profile.more_cautious()),
            ..Default::default()
        })
    }
}

pub struct EnhanceBehaviorStrategy;

#[async_trait]
impl RecoveryStrategy for EnhanceBehaviorStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::EnhanceBehavior
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let multiplier = 1.25 + 0.25 * f64::from(input.attempt.min(8));
        Ok(SessionPatch {
            behavior_profile: Some(input.ctx.behavior_profile.more_cautious()),
            delay_multiplier: Some(multiplier),
            interaction_noise: true,
            ..Default::default()
        })
    }
}

pub struct UpdateSelectorsStrategy;

#[async_trait]
impl RecoveryStrategy for UpdateSelectorsStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::UpdateSelectors
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let selector = input
            .fault
            .selector
            .as_deref()
            .ok_or_else(|| StrategyError::NotApplicable("fault names no selector".into()))?;
        let page = input
            .fault
            .page
            .as_deref()
            .ok_or_else(|| StrategyError::NotApplicable("no page snapshot to search".into()))?;
        let replacement = input
            .resources
            .selectors
            .recover(&input.ctx.domain, selector, page)
            .ok_or_else(|| StrategyError::NotApplicable(format!("no replacement for {selector}")))?;

        let mut patch = SessionPatch::default();
        patch
            .selector_overrides
            .insert(selector.to_string(), replacement.selector);
        Ok(patch)
    }
}

/// Switch to the next, looser extraction mode.
pub struct AdaptParsingStrategy;

#[async_trait]
impl RecoveryStrategy for AdaptParsingStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::AdaptParsing
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let next = input.ctx.extraction_mode.next().ok_or_else(|| {
            StrategyError::NotApplicable(format!(
                "already using {} extraction",
                input.ctx.extraction_mode
            ))
        })?;
        Ok(SessionPatch {
            extraction_mode: Some(next),
            ..Default::default()
        })
    }
}

pub struct WaitLongerStrategy;

#[async_trait]
impl RecoveryStrategy for WaitLongerStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::WaitLonger
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        input.pacing_applies(input.config.wait_longer_attempts)?;
        Ok(SessionPatch {
            extra_wait: input.config.wait_longer_step * input.attempt.max(1),
            ..Default::default()
        })
    }
}

pub struct SolveCaptchaStrategy;

#[async_trait]
impl RecoveryStrategy for SolveCaptchaStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::SolveCaptcha
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let solver = input
            .resources
            .captcha
            .as_ref()
            .ok_or_else(|| StrategyError::NotApplicable("no captcha provider configured".into()))?;
        let page_url = Url::parse(&input.ctx.url)
            .map_err(|err| StrategyError::NotApplicable(format!("bad page url: {err}")))?;
        let markup = input
            .fault
            .markup()
            .ok_or_else(|| StrategyError::NotApplicable("no markup to locate the captcha".into()))?;
        let task = CaptchaTask::from_markup(markup, page_url)
            .ok_or_else(|| StrategyError::NotApplicable("captcha widget not found in markup".into()))?;

        let solution = solver.solve(&task).await?;
        log::info!(
            "[{}] {} captcha solved via {}",
            input.ctx.session_id,
            task.kind,
            solver.provider_name()
        );
        Ok(SessionPatch {
            captcha_token: Some(solution.token),
            ..Default::default()
        })
    }
}

/// Back off hard and slow the session down.
pub struct ThrottleStrategy;

#[async_trait]
impl RecoveryStrategy for ThrottleStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Throttle
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        input.pacing_applies(input.config.throttle_attempts)?;
        tokio::time::sleep(input.config.throttle_pause).await;
        Ok(SessionPatch {
            delay_multiplier: Some(2.0),
            ..Default::default()
        })
    }
}

pub struct RestartSessionStrategy;

#[async_trait]
impl RecoveryStrategy for RestartSessionStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::RestartSession
    }

    async fn execute(&self, _input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        Ok(SessionPatch {
            restart_session: true,
            ..Default::default()
        })
    }
}

/// Move to another proxy type with the most conservative profile.
pub struct FallbackStrategy;

#[async_trait]
impl RecoveryStrategy for FallbackStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Fallback
    }

    async fn execute(&self, input: &StrategyInput<'_>) -> Result<SessionPatch, StrategyError> {
        let current = &input.ctx.identity.lease.record;
        let mut last_error = None;
        for proxy_type in input
            .config
            .fallback_proxy_types
            .iter()
            .copied()
            .filter(|proxy_type| *proxy_type != current.proxy_type)
        {
            let criteria = SelectionCriteria::new(proxy_type).in_country(current.geo.country.clone());
            match input.resources.pool.acquire(&criteria) {
                Ok(lease) => {
                    input.resources.pool.release(&current.id);
                    log::info!(
                        "[{}] falling back from {} proxy {} to {} proxy {}",
                        input.ctx.session_id,
                        current.proxy_type,
                        current.id,
                        proxy_type,
                        lease.record.id
                    );
                    return Ok(SessionPatch {
                        identity: Some(input.resources.identity_for(lease)),
                        behavior_profile: Some(BehaviorProfile::Cautious),
                        ..Default::default()
                    });
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(match last_error {
            Some(err) => StrategyError::Pool(err),
            None => StrategyError::NotApplicable("no alternative proxy type configured".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::browser::snapshot_from_html;
    use crate::modules::clock::ManualClock;
    use crate::modules::proxy::{Geography, ProxyConfig, ProxyProtocol, ProxyRecord, ProxyType};
    use crate::modules::session::{PageType, SessionContext};
    use crate::recovery::{ErrorType, FaultClassifier};
    use chrono::Utc;

    fn pool() -> Arc<IdentityPool> {
        let pool = IdentityPool::new(ProxyConfig::default(), Arc::new(ManualClock::default()));
        pool.load([
            ProxyRecord::new("res-1", ProxyType::Residential, ProxyProtocol::Http, "10.0.0.1", 8000, Geography::country("US")),
            ProxyRecord::new("res-2", ProxyType::Residential, ProxyProtocol::Http, "10.0.0.2", 8000, Geography::country("US")),
            ProxyRecord::new("mob-1", ProxyType::Mobile, ProxyProtocol::Http, "10.0.1.1", 8000, Geography::country("US")),
        ]);
        Arc::new(pool)
    }

    fn context(resources: &RecoveryResources) -> SessionContext {
        let lease = resources
            .pool
            .acquire(&SelectionCriteria::new(ProxyType::Residential).in_country("US"))
            .unwrap();
        let identity = resources.identity_for(lease);
        SessionContext::new(
            "s-1",
            "https://market.example.com/listings",
            PageType::Listing,
            identity,
            BehaviorProfile::Casual,
            Utc::now(),
        )
    }

    fn classify(fault: &Fault) -> ErrorClassification {
        FaultClassifier::new().classify(fault)
    }

    #[tokio::test]
    async fn rotate_identity_blocks_and_swaps() {
        let resources = RecoveryResources::new(pool());
        let ctx = context(&resources);
        let fault = Fault::new("access denied: you have been banned").with_status(403);
        let classification = classify(&fault);
        assert_eq!(classification.error_type, ErrorType::Ban);
        let config = RecoveryConfig::default();
        let input = StrategyInput {
            fault: &fault,
            classification: &classification,
            ctx: &ctx,
            attempt: 1,
            resources: &resources,
            config: &config,
        };

        let patch = RotateIdentityStrategy.execute(&input).await.unwrap();
        let identity = patch.identity.unwrap();
        assert_ne!(identity.proxy_id(), ctx.identity.proxy_id());
        assert_eq!(patch.behavior_profile, Some(BehaviorProfile::Research));
        let old = resources.pool.get(ctx.identity.proxy_id()).unwrap();
        assert!(old.blocked_until.is_some());
    }

    #[tokio::test]
    async fn fallback_switches_proxy_type() {
        let resources = RecoveryResources::new(pool());
        let ctx = context(&resources);
        let fault = Fault::new("something odd");
        let classification = classify(&fault);
        let config = RecoveryConfig::default();
        let input = StrategyInput {
            fault: &fault,
            classification: &classification,
            ctx: &ctx,
            attempt: 2,
            resources: &resources,
            config: &config,
        };
        let patch = FallbackStrategy.execute(&input).await.unwrap();
        let identity = patch.identity.unwrap();
        assert_eq!(identity.lease.record.proxy_type, ProxyType::Mobile);
        assert!(identity.fingerprint.user_agent.contains("Mobile"));
        assert_eq!(patch.behavior_profile, Some(BehaviorProfile::Cautious));
    }

    #[tokio::test]
    async fn update_selectors_needs_a_page() {
        let resources = RecoveryResources::new(pool());
        let ctx = context(&resources);
        let config = RecoveryConfig::default();

        let bare = Fault::new("waiting for selector .price failed").with_selector(".price");
        let classification = classify(&bare);
        let input = StrategyInput {
            fault: &bare,
            classification: &classification,
            ctx: &ctx,
            attempt: 1,
            resources: &resources,
            config: &config,
        };
        assert!(matches!(
            UpdateSelectorsStrategy.execute(&input).await,
            Err(StrategyError::NotApplicable(_))
        ));

        let page = snapshot_from_html(
            &ctx.url,
            200,
            r#"<html><body><span class="listing-price">$1</span></body></html>"#,
        );
        let with_page = bare.clone().with_page(Arc::new(page));
        let input = StrategyInput { fault: &with_page, ..input };
        let patch = UpdateSelectorsStrategy.execute(&input).await.unwrap();
        assert_eq!(patch.selector_overrides[".price"], "span.listing-price");
    }

    #[tokio::test]
    async fn solve_captcha_without_provider_is_not_applicable() {
        let resources = RecoveryResources::new(pool());
        let ctx = context(&resources);
        let config = RecoveryConfig::default();
        let fault = Fault::new("captcha").with_excerpt(r#"<div class="g-recaptcha" data-sitekey="k"></div>"#);
        let classification = classify(&fault);
        let input = StrategyInput {
            fault: &fault,
            classification: &classification,
            ctx: &ctx,
            attempt: 1,
            resources: &resources,
            config: &config,
        };
        assert!(matches!(
            SolveCaptchaStrategy.execute(&input).await,
            Err(StrategyError::NotApplicable(_))
        ));
    }
}

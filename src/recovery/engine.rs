use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::strategies::{
    AdaptParsingStrategy, DelayStrategy, EnhanceBehaviorStrategy, ExponentialBackoffStrategy,
    FallbackStrategy, RestartSessionStrategy, RotateIdentityStrategy, RotateProxyStrategy,
    SolveCaptchaStrategy, ThrottleStrategy, UpdateSelectorsStrategy, WaitLongerStrategy,
};
use super::{
    CircuitBreaker, CircuitSnapshot, ErrorCategory, ErrorClassification, Fault, FaultClassifier,
    RecoveryConfig, RecoveryError, RecoveryResources, RecoveryStrategy, RecoveryStrategyKind,
    StrategyInput,
};
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::clock::{SharedClock, chrono_duration, elapsed_between};
use crate::modules::events::{EventBus, HarvestEvent};
use crate::modules::session::{SessionContext, SessionPatch};

fn strategy_for(kind: RecoveryStrategyKind) -> &'static dyn RecoveryStrategy {
    match kind {
        RecoveryStrategyKind::Delay => &DelayStrategy,
        RecoveryStrategyKind::ExponentialBackoff => &ExponentialBackoffStrategy,
        RecoveryStrategyKind::RotateProxy => &RotateProxyStrategy,
        RecoveryStrategyKind::RotateIdentity => &RotateIdentityStrategy,
        RecoveryStrategyKind::EnhanceBehavior => &EnhanceBehaviorStrategy,
        RecoveryStrategyKind::UpdateSelectors => &UpdateSelectorsStrategy,
        RecoveryStrategyKind::AdaptParsing => &AdaptParsingStrategy,
        RecoveryStrategyKind::WaitLonger => &WaitLongerStrategy,
        RecoveryStrategyKind::SolveCaptcha => &SolveCaptchaStrategy,
        RecoveryStrategyKind::Throttle => &ThrottleStrategy,
        RecoveryStrategyKind::RestartSession => &RestartSessionStrategy,
        RecoveryStrategyKind::Fallback => &FallbackStrategy,
    }
}

/// Result of a successful recovery.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub classification: ErrorClassification,
    /// Strategy that succeeded.
    pub strategy: RecoveryStrategyKind,
    pub patch: SessionPatch,
    /// Strategies that were tried and failed before it.
    pub attempted: Vec<RecoveryStrategyKind>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryMetrics {
    pub faults_by_category: BTreeMap<ErrorCategory, u64>,
    pub faults_by_type: BTreeMap<String, u64>,
    pub strategy_attempts: BTreeMap<RecoveryStrategyKind, u64>,
    pub strategy_successes: BTreeMap<RecoveryStrategyKind, u64>,
    pub recovered: u64,
    pub exhausted: u64,
    pub detection_cooldowns: u64,
    pub suspicion: u32,
    pub cautious_successes_remaining: u32,
    pub paused_until: Option<DateTime<Utc>>,
    pub circuit: Option<CircuitSnapshot>,
}

#[derive(Debug, Default)]
struct SuspicionState {
    level: u32,
    paused_until: Option<DateTime<Utc>>,
    cautious_remaining: u32,
}

/// Classifies faults, runs recovery strategies and tracks detection pressure.
#[derive(Debug)]
pub struct RecoveryEngine {
    config: RecoveryConfig,
    classifier: FaultClassifier,
    circuit: Arc<CircuitBreaker>,
    resources: RecoveryResources,
    clock: SharedClock,
    events: Option<EventBus>,
    suspicion: Mutex<SuspicionState>,
    metrics: Mutex<RecoveryMetrics>,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig, resources: RecoveryResources, clock: SharedClock) -> Self {
        let circuit = Arc::new(CircuitBreaker::new(config.circuit.clone(), clock.clone()));
        Self {
            config,
            classifier: FaultClassifier::new(),
            circuit,
            resources,
            clock,
            events: None,
            suspicion: Mutex::new(SuspicionState::default()),
            metrics: Mutex::new(RecoveryMetrics::default()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.circuit = Arc::new(
            CircuitBreaker::new(self.config.circuit.clone(), self.clock.clone())
                .with_events(events.clone()),
        );
        self.events = Some(events);
        self
    }

    pub fn with_classifier(mut self, classifier: FaultClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn classifier(&self) -> &FaultClassifier {
        &self.classifier
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn resources(&self) -> &RecoveryResources {
        &self.resources
    }

    fn suspicion_state(&self) -> MutexGuard<'_, SuspicionState> {
        self.suspicion.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_state(&self) -> MutexGuard<'_, RecoveryMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: HarvestEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    pub fn suspicion(&self) -> u32 {
        self.suspicion_state().level
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        self.suspicion_state()
            .paused_until
            .filter(|until| *until > self.clock.now())
    }

    /// Profile for new sessions: `Cautious` while recovering from a detection cooldown.
    pub fn session_profile(&self, requested: BehaviorProfile) -> BehaviorProfile {
        if self.suspicion_state().cautious_remaining > 0 {
            BehaviorProfile::Cautious
        } else {
            requested
        }
    }

    pub fn classify(&self, fault: &Fault) -> ErrorClassification {
        let classification = self.classifier.classify(fault);
        let mut metrics = self.metrics_state();
        *metrics
            .faults_by_category
            .entry(classification.category)
            .or_default() += 1;
        *metrics
            .faults_by_type
            .entry(classification.error_type.to_string())
            .or_default() += 1;
        classification
    }

    /// Sleep out any active detection cooldown. Returns the time waited.
    pub async fn wait_if_paused(&self) -> Duration {
        let remaining = {
            let state = self.suspicion_state();
            match state.paused_until {
                Some(until) => elapsed_between(self.clock.now(), until),
                None => Duration::ZERO,
            }
        };
        if !remaining.is_zero() {
            log::debug!("waiting {:.1}s for detection cooldown", remaining.as_secs_f64());
            tokio::time::sleep(remaining).await;
        }
        remaining
    }

    fn cooldown_pause(&self) -> Duration {
        let (low, high) = self.config.detection_cooldown;
        let low = low.as_millis() as u64;
        let high = high.as_millis() as u64;
        if high <= low {
            return Duration::from_millis(low);
        }
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    fn raise_suspicion(&self) {
        let pause = self.cooldown_pause();
        let mut state = self.suspicion_state();
        state.level += 1;
        if state.level <= self.config.suspicion_threshold {
            log::debug!("suspicion raised to {}", state.level);
            return;
        }

        let level = state.level;
        let until = self.clock.now() + chrono_duration(pause);
        state.paused_until = Some(state.paused_until.map_or(until, |current| current.max(until)));
        state.level = 0;
        state.cautious_remaining = self.config.cautious_recovery_successes;
        drop(state);

        self.metrics_state().detection_cooldowns += 1;
        log::warn!(
            "suspicion {level} above threshold {}, pausing pipeline for {:.1}s",
            self.config.suspicion_threshold,
            pause.as_secs_f64()
        );
        self.publish(HarvestEvent::DetectionCooldown {
            suspicion: level,
            pause,
        });
    }

    /// A unit of work succeeded.
    pub fn record_success(&self) {
        self.circuit.record_success();
        let mut state = self.suspicion_state();
        state.level = state.level.saturating_sub(1);
        if state.cautious_remaining > 0 {
            state.cautious_remaining -= 1;
            if state.cautious_remaining == 0 {
                log::info!("leaving cautious mode");
            }
        }
    }

    /// A unit of work attempt failed.
    pub fn record_failure(&self) {
        self.circuit.record_failure();
    }

    /// Classify `fault` and run its strategies in order until one succeeds.
    pub async fn recover(
        &self,
        fault: &Fault,
        ctx: &SessionContext,
        attempt: u32,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let classification = self.classify(fault);
        self.publish(HarvestEvent::FaultClassified {
            session_id: ctx.session_id.clone(),
            category: classification.category,
            error_type: classification.error_type.to_string(),
        });
        if classification.is_detection() {
            self.raise_suspicion();
        }

        let mut attempted = Vec::new();
        for &kind in &classification.strategies {
            let input = StrategyInput {
                fault,
                classification: &classification,
                ctx,
                attempt,
                resources: &self.resources,
                config: &self.config,
            };
            log::debug!("[{}] trying {kind} for {}", ctx.session_id, classification.error_type);
            *self.metrics_state().strategy_attempts.entry(kind).or_default() += 1;

            let result = strategy_for(kind).execute(&input).await;
            self.publish(HarvestEvent::RecoveryAttempted {
                session_id: ctx.session_id.clone(),
                strategy: kind,
                success: result.is_ok(),
            });
            match result {
                Ok(mut patch) => {
                    {
                        let mut metrics = self.metrics_state();
                        *metrics.strategy_successes.entry(kind).or_default() += 1;
                        metrics.recovered += 1;
                    }
                    if self.suspicion_state().cautious_remaining > 0 {
                        patch.behavior_profile = Some(BehaviorProfile::Cautious);
                    }
                    return Ok(RecoveryOutcome {
                        classification,
                        strategy: kind,
                        patch,
                        attempted,
                    });
                }
                Err(err) => {
                    log::debug!("[{}] {kind} failed: {err}", ctx.session_id);
                    if kind == RecoveryStrategyKind::SolveCaptcha {
                        self.raise_suspicion();
                    }
                    attempted.push(kind);
                }
            }
        }

        self.metrics_state().exhausted += 1;
        log::warn!(
            "[{}] recovery exhausted for {}/{} after {:?}",
            ctx.session_id,
            classification.category,
            classification.error_type,
            attempted
        );
        Err(RecoveryError::Exhausted {
            classification,
            attempted,
        })
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        let mut metrics = self.metrics_state().clone();
        let state = self.suspicion_state();
        metrics.suspicion = state.level;
        metrics.cautious_successes_remaining = state.cautious_remaining;
        metrics.paused_until = state.paused_until.filter(|until| *until > self.clock.now());
        metrics.circuit = Some(self.circuit.snapshot());
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::captcha::{
        BoundedCaptchaSolver, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaSolution,
        CaptchaTask,
    };
    use crate::modules::clock::{Clock, ManualClock};
    use crate::modules::proxy::{
        BlockReason, Geography, IdentityPool, ProxyConfig, ProxyProtocol, ProxyRecord, ProxyType,
        SelectionCriteria,
    };
    use crate::modules::session::{Identity, PageType};
    use crate::modules::spoofing::FingerprintGenerator;
    use crate::recovery::ErrorType;
    use async_trait::async_trait;

    struct ScriptedSolver {
        succeed: bool,
    }

    #[async_trait]
    impl CaptchaProvider for ScriptedSolver {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
            if self.succeed {
                Ok(CaptchaSolution::new("solved-token"))
            } else {
                Err(CaptchaError::Provider("ERROR_CAPTCHA_UNSOLVABLE".into()))
            }
        }
    }

    const CAPTCHA_PAGE: &str =
        r#"<html><body><div class="g-recaptcha" data-sitekey="6Lc-site-key"></div></body></html>"#;

    fn engine(clock: &ManualClock, solver_succeeds: bool) -> (RecoveryEngine, SessionContext) {
        let pool = IdentityPool::new(ProxyConfig::default(), Arc::new(clock.clone()));
        pool.load((1..=4).map(|n| {
            ProxyRecord::new(
                format!("res-{n}"),
                ProxyType::Residential,
                ProxyProtocol::Http,
                format!("10.0.0.{n}"),
                8000,
                Geography::country("US"),
            )
        }));
        let pool = Arc::new(pool);
        let solver = BoundedCaptchaSolver::new(
            Arc::new(ScriptedSolver { succeed: solver_succeeds }),
            Duration::from_secs(5),
            1,
        );
        let resources = RecoveryResources::new(Arc::clone(&pool)).with_captcha(solver);

        let lease = pool
            .acquire(&SelectionCriteria::new(ProxyType::Residential).in_country("US"))
            .unwrap();
        let fingerprint = FingerprintGenerator::default().fingerprint_for(&lease.record.id, ProxyType::Residential);
        let ctx = SessionContext::new(
            "s-1",
            "https://market.example.com/listings",
            PageType::Listing,
            Identity { lease, fingerprint },
            BehaviorProfile::Casual,
            clock.now(),
        );
        let config = RecoveryConfig {
            base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        (RecoveryEngine::new(config, resources, Arc::new(clock.clone())), ctx)
    }

    fn captcha_fault() -> Fault {
        Fault::new("navigation blocked by challenge page").with_excerpt(CAPTCHA_PAGE)
    }

    #[tokio::test]
    async fn solved_captcha_does_not_raise_suspicion_further() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, true);

        let outcome = engine.recover(&captcha_fault(), &ctx, 1).await.unwrap();
        assert_eq!(outcome.classification.category, ErrorCategory::Detection);
        assert_eq!(outcome.classification.error_type, ErrorType::Captcha);
        assert_eq!(outcome.strategy, RecoveryStrategyKind::SolveCaptcha);
        assert!(outcome.attempted.is_empty());
        assert_eq!(outcome.patch.captcha_token.as_deref(), Some("solved-token"));
        assert_eq!(engine.suspicion(), 1);
    }

    #[tokio::test]
    async fn failed_captcha_falls_through_to_identity_rotation() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, false);

        let outcome = engine.recover(&captcha_fault(), &ctx, 1).await.unwrap();
        assert_eq!(outcome.attempted, vec![RecoveryStrategyKind::SolveCaptcha]);
        assert_eq!(outcome.strategy, RecoveryStrategyKind::RotateIdentity);
        let identity = outcome.patch.identity.unwrap();
        assert_ne!(identity.proxy_id(), ctx.identity.proxy_id());
        assert_eq!(engine.suspicion(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_detection_pauses_the_pipeline() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, true);
        for _ in 0..3 {
            engine.recover(&captcha_fault(), &ctx, 1).await.unwrap();
        }
        assert!(engine.paused_until().is_none());

        let outcome = engine.recover(&captcha_fault(), &ctx, 1).await.unwrap();
        let until = engine.paused_until().unwrap();
        let pause = elapsed_between(clock.now(), until);
        assert!(pause >= Duration::from_secs(30) && pause <= Duration::from_secs(60));
        assert_eq!(engine.suspicion(), 0);
        assert_eq!(outcome.patch.behavior_profile, Some(BehaviorProfile::Cautious));
        assert_eq!(engine.session_profile(BehaviorProfile::Focused), BehaviorProfile::Cautious);

        let waited = engine.wait_if_paused().await;
        assert_eq!(waited, pause);

        for _ in 0..10 {
            engine.record_success();
        }
        assert_eq!(engine.session_profile(BehaviorProfile::Focused), BehaviorProfile::Focused);
        assert_eq!(engine.metrics().detection_cooldowns, 1);
    }

    #[tokio::test]
    async fn parsing_faults_fall_through_to_waiting() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, true);
        let fault = Fault::new("waiting for selector .price failed: selector not found")
            .with_selector(".price");
        let ctx = ctx.with_patch(&SessionPatch {
            extraction_mode: Some(crate::extraction::ExtractionMode::Semantic),
            ..Default::default()
        });

        // No page snapshot and no looser extraction mode left; only waiting longer works.
        let outcome = engine.recover(&fault, &ctx, 2).await.unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategyKind::WaitLonger);
        assert_eq!(
            outcome.attempted,
            vec![RecoveryStrategyKind::UpdateSelectors, RecoveryStrategyKind::AdaptParsing]
        );
        assert_eq!(outcome.patch.extra_wait, Duration::from_secs(4));

        let engine_metrics = engine.metrics();
        assert_eq!(engine_metrics.faults_by_category[&ErrorCategory::Parsing], 1);
        assert_eq!(engine_metrics.strategy_attempts[&RecoveryStrategyKind::AdaptParsing], 1);
    }

    fn timeout() -> Fault {
        Fault::new("navigation timeout of 30000 ms exceeded").with_code("ETIMEDOUT")
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_escalate_to_a_new_proxy() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, true);

        let first = engine.recover(&timeout(), &ctx, 1).await.unwrap();
        assert_eq!(first.classification.error_type, ErrorType::Timeout);
        assert_eq!(first.strategy, RecoveryStrategyKind::Delay);
        assert!(first.patch.identity.is_none());

        let second = engine.recover(&timeout(), &ctx, 2).await.unwrap();
        assert_eq!(second.strategy, RecoveryStrategyKind::ExponentialBackoff);
        assert_eq!(second.attempted, vec![RecoveryStrategyKind::Delay]);

        let third = engine.recover(&timeout(), &ctx, 3).await.unwrap();
        assert_eq!(third.strategy, RecoveryStrategyKind::RotateProxy);
        assert_eq!(
            third.attempted,
            vec![RecoveryStrategyKind::Delay, RecoveryStrategyKind::ExponentialBackoff]
        );
        let identity = third.patch.identity.unwrap();
        assert_ne!(identity.proxy_id(), ctx.identity.proxy_id());

        let metrics = engine.metrics();
        assert_eq!(metrics.strategy_successes[&RecoveryStrategyKind::Delay], 1);
        assert_eq!(metrics.strategy_successes[&RecoveryStrategyKind::RotateProxy], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_is_skipped_once_the_proxy_is_blocked() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, true);
        let pool = Arc::clone(&engine.resources().pool);
        for _ in 0..5 {
            pool.report_failure(ctx.identity.proxy_id(), "navigation timeout");
        }
        assert!(pool.is_blocked(ctx.identity.proxy_id()));

        let outcome = engine.recover(&timeout(), &ctx, 1).await.unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategyKind::RotateProxy);
        assert_eq!(
            outcome.attempted,
            vec![RecoveryStrategyKind::Delay, RecoveryStrategyKind::ExponentialBackoff]
        );
        assert_ne!(outcome.patch.identity.unwrap().proxy_id(), ctx.identity.proxy_id());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_faults_reach_the_fallback() {
        let clock = ManualClock::default();
        let (engine, ctx) = engine(&clock, true);
        let pool = Arc::clone(&engine.resources().pool);
        for n in 1..=4 {
            let id = format!("res-{n}");
            if id != ctx.identity.proxy_id() {
                pool.block(&id, Duration::from_secs(600), BlockReason::Manual).unwrap();
            }
        }
        pool.load([ProxyRecord::new(
            "mob-1",
            ProxyType::Mobile,
            ProxyProtocol::Http,
            "10.0.1.1",
            8000,
            Geography::country("US"),
        )]);

        let outcome = engine.recover(&Fault::new("something odd happened"), &ctx, 3).await.unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategyKind::Fallback);
        assert_eq!(
            outcome.attempted,
            vec![
                RecoveryStrategyKind::Delay,
                RecoveryStrategyKind::ExponentialBackoff,
                RecoveryStrategyKind::RotateProxy,
            ]
        );
        let identity = outcome.patch.identity.unwrap();
        assert_eq!(identity.lease.record.proxy_type, ProxyType::Mobile);
    }

    #[test]
    fn circuit_is_shared_through_the_engine() {
        let clock = ManualClock::default();
        let (engine, _ctx) = engine(&clock, true);
        for _ in 0..5 {
            engine.record_failure();
        }
        assert!(matches!(
            engine.circuit().try_acquire(),
            Err(RecoveryError::CircuitOpen { .. })
        ));
    }
}

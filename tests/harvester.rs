use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stealth_harvester::external_deps::browser::{
    BrowserEngine, BrowserSession, NavigateOptions, NavigationError, NavigationErrorKind,
    PageSnapshot, snapshot_from_html,
};
use stealth_harvester::external_deps::captcha::{
    CaptchaProvider, CaptchaResult, CaptchaSolution, CaptchaTask,
};
use stealth_harvester::extraction::{ExtractionSchema, FieldKind, FieldRule};
use stealth_harvester::modules::events::HarvestEvent;
use stealth_harvester::modules::proxy::{AgentConfig, HealthProbe, ProbeError};
use stealth_harvester::modules::spoofing::BrowserFingerprint;
use stealth_harvester::recovery::{CircuitState, ErrorCategory, RecoveryStrategyKind};
use stealth_harvester::{
    CollectOptions, CollectTarget, HarvestError, Harvester, HarvesterConfig, ProxyRecord,
    ProxyType,
};

const LISTINGS: &str = r#"
    <main>
      <div class="listing"><h2>Widget shop</h2><span class="price">$120,000</span></div>
      <div class="listing"><h2>Gadget store</h2><span class="price">$90,000</span></div>
    </main>"#;

const CAPTCHA_PAGE: &str = r#"<html><head><title>Just a moment</title></head>
    <body><div class="g-recaptcha" data-sitekey="6Lc-site-key"></div></body></html>"#;

enum Step {
    Page(&'static str),
    Fail(NavigationErrorKind, &'static str),
}

/// Plays back scripted navigations, then serves `LISTINGS`.
#[derive(Default)]
struct ScriptedEngine {
    script: Mutex<VecDeque<Step>>,
    tokens: Mutex<Vec<Option<String>>>,
}

impl ScriptedEngine {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserEngine for ScriptedEngine {
    async fn create_session(
        &self,
        agent: &AgentConfig,
        _fingerprint: &BrowserFingerprint,
    ) -> Result<BrowserSession, NavigationError> {
        Ok(BrowserSession {
            id: agent.proxy_url.clone(),
        })
    }

    async fn navigate(
        &self,
        _session: &BrowserSession,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<PageSnapshot, NavigationError> {
        self.tokens.lock().unwrap().push(options.captcha_token.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Page(html)) => Ok(snapshot_from_html(url, 200, html)),
            Some(Step::Fail(kind, message)) => Err(NavigationError::new(kind, message)),
            None => Ok(snapshot_from_html(url, 200, LISTINGS)),
        }
    }

    async fn snapshot(&self, session: &BrowserSession) -> Result<PageSnapshot, NavigationError> {
        Ok(snapshot_from_html(&session.id, 200, LISTINGS))
    }

    async fn close(&self, _session: &BrowserSession) {}
}

struct ConstantSolver;

#[async_trait]
impl CaptchaProvider for ConstantSolver {
    fn name(&self) -> &'static str {
        "constant"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        assert_eq!(task.site_key.as_deref(), Some("6Lc-site-key"));
        Ok(CaptchaSolution::new("solved-token"))
    }
}

struct HealthyProbe;

#[async_trait]
impl HealthProbe for HealthyProbe {
    async fn probe(&self, _record: &ProxyRecord) -> Result<Duration, ProbeError> {
        Ok(Duration::from_millis(80))
    }
}

fn config() -> HarvesterConfig {
    let mut config = HarvesterConfig::default();
    config.navigation.pace_navigation = false;
    config.extraction.simulate_reading = false;
    config
}

fn proxies() -> Vec<ProxyRecord> {
    (1..=3)
        .map(|n| {
            ProxyRecord::parse(&format!("http://10.0.1.{n}:8000"), ProxyType::Residential, "US")
                .unwrap()
        })
        .collect()
}

fn build(config: HarvesterConfig, engine: Arc<ScriptedEngine>) -> Harvester {
    Harvester::builder()
        .with_config(config)
        .with_browser_engine(engine)
        .with_captcha_provider(Arc::new(ConstantSolver))
        .with_health_probe(Arc::new(HealthyProbe))
        .with_proxies(proxies())
        .build()
        .unwrap()
}

fn listings() -> CollectTarget {
    let schema = ExtractionSchema::new()
        .with_record_selector(".listing")
        .field(FieldRule::new("title", FieldKind::Text).selector("h2").required())
        .field(FieldRule::new("price", FieldKind::Currency).selector(".price").required());
    CollectTarget::new(schema)
}

#[tokio::test(start_paused = true)]
async fn captcha_wall_is_solved_and_the_token_replayed() {
    let engine = ScriptedEngine::new([Step::Page(CAPTCHA_PAGE)]);
    let harvester = build(config(), engine.clone());
    let mut events = harvester.events().subscribe();

    let result = harvester
        .collect(
            &listings().url("https://market.example.com/listings"),
            &CollectOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.records.len(), 2);
    assert_eq!(engine.tokens(), vec![None, Some("solved-token".to_string())]);

    let learning = harvester.learning().lock().unwrap();
    let record = learning.successful().latest().unwrap();
    assert_eq!(record.recoveries, vec![RecoveryStrategyKind::SolveCaptcha]);
    assert_eq!(record.error_categories, vec![ErrorCategory::Detection]);
    assert!(!record.detection_indicators.is_empty());
    drop(learning);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(HarvestEvent::UnitStarted { .. })));
    assert!(seen.iter().any(|event| matches!(
        event,
        HarvestEvent::RecoveryAttempted {
            strategy: RecoveryStrategyKind::SolveCaptcha,
            success: true,
            ..
        }
    )));
    assert!(seen
        .iter()
        .any(|event| matches!(event, HarvestEvent::UnitCompleted { records: 2, .. })));
}

#[tokio::test(start_paused = true)]
async fn circuit_opening_mid_run_stops_the_batch() {
    let mut config = config();
    config.navigation.concurrency = 1;
    config.navigation.max_attempts = 1;
    config.recovery.circuit.failure_threshold = 2;
    let engine = ScriptedEngine::new(
        (0..3).map(|_| Step::Fail(NavigationErrorKind::Dns, "getaddrinfo ENOTFOUND market.example.com")),
    );
    let harvester = build(config, engine);
    let target = listings().urls([
        "https://market.example.com/a",
        "https://market.example.com/b",
        "https://market.example.com/c",
    ]);

    let result = harvester.collect(&target, &CollectOptions::default()).await.unwrap();

    assert!(result.records.is_empty());
    assert!(result.metadata.circuit_opened);
    assert_eq!(result.metadata.failures.len(), 3);
    assert!(result.metadata.failures.iter().any(|failure| failure.aborted));
    assert_eq!(harvester.get_metrics().circuit.state, CircuitState::Open);
    assert_eq!(harvester.get_metrics().pool.in_use, 0);

    let err = harvester.collect(&target, &CollectOptions::default()).await.unwrap_err();
    assert!(matches!(err, HarvestError::CircuitOpen { .. }));
}

#[tokio::test]
async fn learning_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.store_path = Some(dir.path().join("learning.redb"));
    let target = listings().url("https://market.example.com/listings");

    let first = build(config.clone(), ScriptedEngine::new([]));
    first.start().await.unwrap();
    first.collect(&target, &CollectOptions::default()).await.unwrap();
    first.shutdown().await.unwrap();
    let learned = first.get_metrics().learning;
    assert!(learned.last_persisted.is_some());
    assert!(learned.strategy_contexts > 0);
    drop(first);

    let second = build(config, ScriptedEngine::new([]));
    second.start().await.unwrap();
    let restored = second.get_metrics().learning;
    assert_eq!(restored.strategy_contexts, learned.strategy_contexts);
    assert_eq!(restored.best_configurations, learned.best_configurations);
    second.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn units_without_a_matching_identity_fail_fast() {
    let harvester = build(config(), ScriptedEngine::new([]));
    let result = harvester
        .collect(
            &listings().url("https://market.example.com/listings"),
            &CollectOptions::default().proxy_type(ProxyType::Datacenter),
        )
        .await
        .unwrap();

    assert!(result.records.is_empty());
    let failure = &result.metadata.failures[0];
    assert_eq!(failure.attempts, 0);
    assert!(failure.error.contains("datacenter"));
}

//! Session orchestration.
//!
//! [`Harvester`] wires the identity pool, the recovery engine, the learning
//! engine and the extractor around an injected [`BrowserEngine`]. Every target
//! URL runs as one unit of work: acquire an identity, navigate, extract on
//! success or hand the fault to recovery on failure, and always report the
//! outcome to learning. Adaptations coming back from learning shape the units
//! that start afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, HarvesterConfig};
use crate::external_deps::browser::{
	BrowserEngine, HttpBrowserEngine, NavigateOptions, NavigationError, NavigationErrorKind,
	PageSnapshot,
};
use crate::external_deps::captcha::{BoundedCaptchaSolver, CaptchaProvider, TwoCaptchaProvider};
use crate::extraction::{
	ExtractOptions, ExtractedRecord, ExtractionError, ExtractionMetrics, ExtractionMode,
	ExtractionOutcome, ExtractionSchema, IntelligentExtractor, ScanPattern,
};
use crate::learning::{
	Adaptation, AdaptationAction, AdaptationBatch, AdaptationType, AdaptationValue,
	InteractionMetrics, InteractionRecord, LearningEngine, LearningError, LearningHandle,
	LearningMetrics, LearningStore, LearningWorker, MemoryLearningStore, ModelUpdateTask, Outcome,
	PersistTask, RedbLearningStore, StoreError, ingest_and_adapt,
};
use crate::modules::adaptive_timing::{
	AdaptiveTimingStrategy, BehaviorProfile, DefaultAdaptiveTiming, TimingOutcome, TimingRequest,
};
use crate::modules::clock::{SharedClock, SystemClock};
use crate::modules::events::{EventBus, HarvestEvent, spawn_event_logger};
use crate::modules::metrics::{MetricsCollector, RequestMetrics};
use crate::modules::proxy::{
	HealthCheckTask, HealthProbe, IdentityPool, PoolError, PoolMetrics, ProxyLease, ProxyRecord,
	ProxyType, ReqwestHealthProbe, SelectionCriteria,
};
use crate::modules::scheduler::Scheduler;
use crate::modules::session::{ActionKind, ActionRecord, PageType, SessionContext, domain_of};
use crate::modules::spoofing::FingerprintGenerator;
use crate::recovery::{
	CircuitSnapshot, ErrorCategory, ErrorClassification, Fault, RecoveryEngine, RecoveryError,
	RecoveryMetrics, RecoveryResources, RecoveryStrategyKind,
};

const MIN_DELAY_MULTIPLIER: f64 = 0.5;
const MAX_DELAY_MULTIPLIER: f64 = 5.0;
const MIN_CONCURRENCY_FACTOR: f64 = 0.1;

/// Result alias used across the orchestration layer.
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum HarvestError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("identity pool error: {0}")]
	Pool(#[from] PoolError),
	#[error(transparent)]
	Recovery(#[from] RecoveryError),
	#[error("extraction error: {0}")]
	Extraction(#[from] ExtractionError),
	#[error("learning error: {0}")]
	Learning(#[from] LearningError),
	#[error("learning store error: {0}")]
	Store(#[from] StoreError),
	#[error("navigation failed: {0}")]
	Navigation(#[from] NavigationError),
	#[error("circuit open, retry after {retry_after:?}")]
	CircuitOpen { retry_after: Duration },
	#[error("collection aborted")]
	Aborted,
	#[error("{url}: gave up after {attempts} attempts")]
	AttemptsExhausted { url: String, attempts: u32 },
}

/// What to collect: the pages and the schema their records follow.
#[derive(Debug, Clone)]
pub struct CollectTarget {
	pub urls: Vec<String>,
	pub page_type: PageType,
	pub schema: ExtractionSchema,
}

impl CollectTarget {
	pub fn new(schema: ExtractionSchema) -> Self {
		Self {
			urls: Vec::new(),
			page_type: PageType::Listing,
			schema,
		}
	}

	pub fn url(mut self, url: impl Into<String>) -> Self {
		self.urls.push(url.into());
		self
	}

	pub fn urls<I, S>(mut self, urls: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.urls.extend(urls.into_iter().map(Into::into));
		self
	}

	pub fn page_type(mut self, page_type: PageType) -> Self {
		self.page_type = page_type;
		self
	}
}

/// Per-call overrides. Unset fields fall back to learned tuning, then config.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
	pub behavior_profile: Option<BehaviorProfile>,
	pub proxy_type: Option<ProxyType>,
	pub country: Option<String>,
	pub concurrency: Option<usize>,
	pub scan_pattern: Option<ScanPattern>,
	pub extraction_mode: Option<ExtractionMode>,
	pub cancel: Option<CancellationToken>,
}

impl CollectOptions {
	pub fn behavior_profile(mut self, profile: BehaviorProfile) -> Self {
		self.behavior_profile = Some(profile);
		self
	}

	pub fn proxy_type(mut self, proxy_type: ProxyType) -> Self {
		self.proxy_type = Some(proxy_type);
		self
	}

	pub fn country(mut self, country: impl Into<String>) -> Self {
		self.country = Some(country.into());
		self
	}

	pub fn concurrency(mut self, concurrency: usize) -> Self {
		self.concurrency = Some(concurrency.max(1));
		self
	}

	pub fn scan_pattern(mut self, pattern: ScanPattern) -> Self {
		self.scan_pattern = Some(pattern);
		self
	}

	pub fn extraction_mode(mut self, mode: ExtractionMode) -> Self {
		self.extraction_mode = Some(mode);
		self
	}

	pub fn cancel_with(mut self, token: CancellationToken) -> Self {
		self.cancel = Some(token);
		self
	}
}

/// A unit of work that produced no records.
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
	pub url: String,
	pub error: String,
	pub category: Option<ErrorCategory>,
	pub attempts: u32,
	/// Recovery strategies tried on the final fault.
	pub strategies: Vec<RecoveryStrategyKind>,
	pub aborted: bool,
}

impl UnitFailure {
	fn new(url: &str, error: &HarvestError, attempts: u32) -> Self {
		Self {
			url: url.to_string(),
			error: error.to_string(),
			category: None,
			attempts,
			strategies: Vec::new(),
			aborted: matches!(error, HarvestError::Aborted | HarvestError::CircuitOpen { .. }),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectMetadata {
	/// Record-weighted mean of page confidences.
	pub confidence: f64,
	/// Most frequent reading pattern across extracted pages.
	pub pattern_used: Option<ScanPattern>,
	pub elements_processed: usize,
	pub pages: usize,
	pub discarded: usize,
	pub missing_selectors: Vec<String>,
	pub failures: Vec<UnitFailure>,
	pub aborted: bool,
	pub circuit_opened: bool,
	#[serde(with = "crate::config::duration_ms")]
	pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectResult {
	pub records: Vec<ExtractedRecord>,
	pub metadata: CollectMetadata,
}

/// Adaptations applied so far for one scope.
#[derive(Debug, Clone, Serialize)]
pub struct Tuning {
	pub delay_multiplier: f64,
	pub behavior_profile: Option<BehaviorProfile>,
	pub country: Option<String>,
	pub scan_pattern: Option<ScanPattern>,
	pub extraction_mode: Option<ExtractionMode>,
	pub interaction_noise: bool,
	pub concurrency_factor: f64,
	pub concurrency_cap: Option<usize>,
	/// Next acquisition avoids `last_proxy`.
	pub rotate_pending: bool,
	#[serde(skip)]
	last_proxy: Option<String>,
}

impl Default for Tuning {
	fn default() -> Self {
		Self {
			delay_multiplier: 1.0,
			behavior_profile: None,
			country: None,
			scan_pattern: None,
			extraction_mode: None,
			interaction_noise: false,
			concurrency_factor: 1.0,
			concurrency_cap: None,
			rotate_pending: false,
			last_proxy: None,
		}
	}
}

impl Tuning {
	/// Fold one adaptation in. Returns `false` when the value does not fit the action.
	fn apply(&mut self, adaptation: &Adaptation) -> bool {
		match (adaptation.action, &adaptation.value) {
			(
				AdaptationAction::IncreaseDelay | AdaptationAction::DecreaseDelay,
				AdaptationValue::Multiplier(factor),
			) => {
				self.delay_multiplier = (self.delay_multiplier * factor)
					.clamp(MIN_DELAY_MULTIPLIER, MAX_DELAY_MULTIPLIER);
			}
			(AdaptationAction::SwitchProfile, AdaptationValue::Profile(profile)) => {
				self.behavior_profile = Some(*profile);
			}
			(AdaptationAction::AddInteractionNoise, AdaptationValue::Enabled(enabled)) => {
				self.interaction_noise = *enabled;
			}
			(AdaptationAction::RotateIdentity, AdaptationValue::Enabled(enabled)) => {
				self.rotate_pending = *enabled;
			}
			(AdaptationAction::PreferCountry, AdaptationValue::Country(country)) => {
				self.country = Some(country.clone());
			}
			(AdaptationAction::SwitchScanPattern, AdaptationValue::ScanPattern(pattern)) => {
				self.scan_pattern = Some(*pattern);
			}
			(AdaptationAction::SwitchExtractionMode, AdaptationValue::ExtractionMode(mode)) => {
				self.extraction_mode = Some(*mode);
			}
			(AdaptationAction::ReduceConcurrency, AdaptationValue::Multiplier(factor)) => {
				self.concurrency_factor =
					(self.concurrency_factor * factor).clamp(MIN_CONCURRENCY_FACTOR, 1.0);
			}
			(AdaptationAction::ReduceConcurrency, AdaptationValue::Concurrency(cap)) => {
				self.concurrency_cap = Some((*cap).max(1));
			}
			_ => return false,
		}
		true
	}

	/// This layer on top of `base`.
	fn over(&self, base: &Tuning) -> Tuning {
		Tuning {
			delay_multiplier: (base.delay_multiplier * self.delay_multiplier)
				.clamp(MIN_DELAY_MULTIPLIER, MAX_DELAY_MULTIPLIER),
			behavior_profile: self.behavior_profile.or(base.behavior_profile),
			country: self.country.clone().or_else(|| base.country.clone()),
			scan_pattern: self.scan_pattern.or(base.scan_pattern),
			extraction_mode: self.extraction_mode.or(base.extraction_mode),
			interaction_noise: self.interaction_noise || base.interaction_noise,
			concurrency_factor: self.concurrency_factor.min(base.concurrency_factor),
			concurrency_cap: match (self.concurrency_cap, base.concurrency_cap) {
				(Some(a), Some(b)) => Some(a.min(b)),
				(a, b) => a.or(b),
			},
			rotate_pending: self.rotate_pending || base.rotate_pending,
			last_proxy: self.last_proxy.clone(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TuningSnapshot {
	pub global: Tuning,
	pub domains: BTreeMap<String, Tuning>,
}

/// Counters for observability dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct HarvesterMetrics {
	pub requests: RequestMetrics,
	pub pool: PoolMetrics,
	pub circuit: CircuitSnapshot,
	pub recovery: RecoveryMetrics,
	pub learning: LearningMetrics,
	pub extraction: ExtractionMetrics,
	pub tuning: TuningSnapshot,
}

/// Fluent constructor for [`Harvester`].
pub struct HarvesterBuilder {
	config: HarvesterConfig,
	engine: Option<Arc<dyn BrowserEngine>>,
	captcha: Option<Arc<dyn CaptchaProvider>>,
	store: Option<Arc<dyn LearningStore>>,
	probe: Option<Arc<dyn HealthProbe>>,
	clock: Option<SharedClock>,
	fingerprints: Option<FingerprintGenerator>,
	proxies: Vec<ProxyRecord>,
}

impl HarvesterBuilder {
	pub fn new() -> Self {
		Self {
			config: HarvesterConfig::default(),
			engine: None,
			captcha: None,
			store: None,
			probe: None,
			clock: None,
			fingerprints: None,
			proxies: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: HarvesterConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_browser_engine(mut self, engine: Arc<dyn BrowserEngine>) -> Self {
		self.engine = Some(engine);
		self
	}

	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.captcha = Some(provider);
		self
	}

	pub fn with_learning_store(mut self, store: Arc<dyn LearningStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	pub fn with_clock(mut self, clock: SharedClock) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_fingerprints(mut self, generator: FingerprintGenerator) -> Self {
		self.fingerprints = Some(generator);
		self
	}

	/// Proxies loaded on top of the ones listed in the config.
	pub fn with_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = ProxyRecord>,
	{
		self.proxies.extend(proxies);
		self
	}

	pub fn build(self) -> HarvestResult<Harvester> {
		let config = self.config;
		config.validate()?;

		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let events = EventBus::new(config.event_capacity);

		let pool = Arc::new(IdentityPool::new(config.pool.clone(), Arc::clone(&clock)));
		pool.load(config.proxy_records()?.into_iter().chain(self.proxies));
		if pool.len() == 0 {
			log::warn!("harvester built without proxies; every acquisition will fail");
		}

		let mut resources = RecoveryResources::new(Arc::clone(&pool))
			.with_fingerprints(self.fingerprints.unwrap_or_default());
		let captcha = self.captcha.or_else(|| {
			config.captcha.api_key.clone().map(|key| {
				Arc::new(TwoCaptchaProvider::with_config(key, config.captcha.clone()))
					as Arc<dyn CaptchaProvider>
			})
		});
		if let Some(provider) = captcha {
			resources = resources.with_captcha(BoundedCaptchaSolver::new(
				provider,
				config.captcha.timeout,
				config.captcha.max_attempts,
			));
		}
		let recovery = RecoveryEngine::new(config.recovery.clone(), resources, Arc::clone(&clock))
			.with_events(events.clone());

		let store: Arc<dyn LearningStore> = match (self.store, &config.store_path) {
			(Some(store), _) => store,
			(None, Some(path)) => {
				Arc::new(RedbLearningStore::open(path, config.learning.retained_snapshots)?)
			}
			(None, None) => Arc::new(MemoryLearningStore::new(config.learning.retained_snapshots)),
		};
		let probe = self
			.probe
			.unwrap_or_else(|| Arc::new(ReqwestHealthProbe::new(&config.health)));
		let engine = self
			.engine
			.unwrap_or_else(|| Arc::new(HttpBrowserEngine::new()));

		let learning = Arc::new(Mutex::new(LearningEngine::new(
			config.learning.clone(),
			Arc::clone(&clock),
		)));
		let extractor = IntelligentExtractor::new(config.extraction.clone());

		Ok(Harvester {
			inner: Arc::new(HarvesterInner {
				config,
				clock,
				pool,
				recovery,
				learning,
				extractor,
				engine,
				store,
				probe,
				events,
				timing: Mutex::new(DefaultAdaptiveTiming::new()),
				metrics: MetricsCollector::new(),
				tuning: Mutex::new(TuningSnapshot::default()),
				learning_handle: Mutex::new(None),
				adaptations: Mutex::new(None),
				background: tokio::sync::Mutex::new(None),
				sessions: AtomicU64::new(0),
			}),
		})
	}
}

impl Default for HarvesterBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Tasks running between `start` and `shutdown`.
struct Background {
	cancel: CancellationToken,
	scheduler: Scheduler,
	worker: JoinHandle<()>,
	logger: JoinHandle<()>,
	persist: Arc<PersistTask>,
}

struct HarvesterInner {
	config: HarvesterConfig,
	clock: SharedClock,
	pool: Arc<IdentityPool>,
	recovery: RecoveryEngine,
	learning: Arc<Mutex<LearningEngine>>,
	extractor: IntelligentExtractor,
	engine: Arc<dyn BrowserEngine>,
	store: Arc<dyn LearningStore>,
	probe: Arc<dyn HealthProbe>,
	events: EventBus,
	timing: Mutex<DefaultAdaptiveTiming>,
	metrics: MetricsCollector,
	tuning: Mutex<TuningSnapshot>,
	learning_handle: Mutex<Option<LearningHandle>>,
	adaptations: Mutex<Option<mpsc::Receiver<AdaptationBatch>>>,
	background: tokio::sync::Mutex<Option<Background>>,
	sessions: AtomicU64,
}

/// Stealth collection engine.
#[derive(Clone)]
pub struct Harvester {
	inner: Arc<HarvesterInner>,
}

impl Harvester {
	/// Harvester with default configuration and collaborators.
	pub fn new() -> HarvestResult<Self> {
		HarvesterBuilder::new().build()
	}

	pub fn builder() -> HarvesterBuilder {
		HarvesterBuilder::new()
	}

	pub fn config(&self) -> &HarvesterConfig {
		&self.inner.config
	}

	pub fn pool(&self) -> &Arc<IdentityPool> {
		&self.inner.pool
	}

	pub fn recovery(&self) -> &RecoveryEngine {
		&self.inner.recovery
	}

	pub fn learning(&self) -> &Arc<Mutex<LearningEngine>> {
		&self.inner.learning
	}

	pub fn events(&self) -> &EventBus {
		&self.inner.events
	}

	/// Restore learning state and start background tasks. Idempotent.
	pub async fn start(&self) -> HarvestResult<()> {
		let inner = &self.inner;
		let mut background = inner.background.lock().await;
		if background.is_some() {
			return Ok(());
		}

		let persist = Arc::new(
			PersistTask::new(Arc::clone(&inner.learning), Arc::clone(&inner.store))
				.with_events(inner.events.clone()),
		);
		match persist.restore_latest().await {
			Ok(true) => log::info!("resumed learning from the latest snapshot"),
			Ok(false) => log::debug!("no learning snapshot found, starting cold"),
			Err(err) => log::warn!("failed to restore learning snapshot, starting cold: {err}"),
		}

		let cancel = CancellationToken::new();
		let mut scheduler = Scheduler::new(cancel.child_token());
		let health = HealthCheckTask::new(
			Arc::clone(&inner.pool),
			Arc::clone(&inner.probe),
			inner.config.health.clone(),
		)
		.with_events(inner.events.clone());
		scheduler.spawn(Arc::new(health), inner.config.health_interval);
		scheduler.spawn(
			Arc::new(ModelUpdateTask::new(Arc::clone(&inner.learning))),
			inner.config.learning.update_interval,
		);
		scheduler.spawn(persist.clone(), inner.config.learning.persist_interval);

		let (handle, batches, worker) = LearningWorker::spawn(
			Arc::clone(&inner.learning),
			inner.config.learning.channel_capacity,
			cancel.child_token(),
		);
		let logger = spawn_event_logger(&inner.events, cancel.child_token());
		*lock(&inner.learning_handle) = Some(handle);
		*lock(&inner.adaptations) = Some(batches);

		log::info!("harvester started with {} background tasks", scheduler.len());
		*background = Some(Background {
			cancel,
			scheduler,
			worker,
			logger,
			persist,
		});
		Ok(())
	}

	/// Stop background tasks, apply pending adaptations and persist once more.
	pub async fn shutdown(&self) -> HarvestResult<()> {
		let inner = &self.inner;
		let background = inner.background.lock().await.take();
		let persist = match background {
			Some(mut background) => {
				lock(&inner.learning_handle).take();
				background.cancel.cancel();
				background.scheduler.shutdown().await;
				if let Err(err) = background.worker.await {
					log::error!("learning worker failed: {err}");
				}
				if let Err(err) = background.logger.await {
					log::error!("event logger failed: {err}");
				}
				inner.drain_adaptations();
				lock(&inner.adaptations).take();
				background.persist
			}
			None => Arc::new(
				PersistTask::new(Arc::clone(&inner.learning), Arc::clone(&inner.store))
					.with_events(inner.events.clone()),
			),
		};
		persist.persist_now().await?;
		log::info!("harvester stopped");
		Ok(())
	}

	/// Collect records from every target URL.
	///
	/// Units run concurrently up to the configured concurrency. A unit that
	/// fails after recovery is listed in `metadata.failures`; it does not fail
	/// the call. An open circuit at entry is an error. The circuit opening
	/// mid-run aborts the units that have not finished yet.
	pub async fn collect(
		&self,
		target: &CollectTarget,
		options: &CollectOptions,
	) -> HarvestResult<CollectResult> {
		target.schema.validate()?;
		if let Err(RecoveryError::CircuitOpen { retry_after }) =
			self.inner.recovery.circuit().try_acquire()
		{
			return Err(HarvestError::CircuitOpen { retry_after });
		}
		self.inner.drain_adaptations();

		let started = Instant::now();
		let caller = options.cancel.clone().unwrap_or_default();
		let cancel = caller.child_token();
		let concurrency = self.inner.concurrency_for(target, options);
		log::debug!(
			"collecting {} urls with concurrency {concurrency}",
			target.urls.len()
		);

		let semaphore = Arc::new(Semaphore::new(concurrency));
		let schema = Arc::new(target.schema.clone());
		let mut units = JoinSet::new();
		for (index, url) in target.urls.iter().enumerate() {
			let inner = Arc::clone(&self.inner);
			let semaphore = Arc::clone(&semaphore);
			let unit = UnitSpec {
				url: url.clone(),
				page_type: target.page_type,
				schema: Arc::clone(&schema),
				options: options.clone(),
				cancel: cancel.clone(),
			};
			units.spawn(async move {
				let permit = cancellable(&unit.cancel, semaphore.acquire_owned()).await;
				let result = match permit {
					Some(Ok(_permit)) => inner.run_unit(&unit).await,
					_ => UnitResult::Failed(UnitFailure::new(&unit.url, &HarvestError::Aborted, 0)),
				};
				(index, result)
			});
		}

		let mut results = Vec::with_capacity(target.urls.len());
		while let Some(joined) = units.join_next().await {
			match joined {
				Ok((index, result)) => {
					if matches!(result, UnitResult::CircuitOpen(_)) && !cancel.is_cancelled() {
						log::warn!("circuit opened mid-run, aborting remaining units");
						cancel.cancel();
					}
					results.push((index, result));
				}
				Err(err) => log::error!("unit task failed: {err}"),
			}
		}
		results.sort_by_key(|(index, _)| *index);

		let mut records = Vec::new();
		let mut metadata = CollectMetadata {
			aborted: caller.is_cancelled(),
			..CollectMetadata::default()
		};
		let mut weighted_confidence = 0.0;
		let mut patterns: BTreeMap<ScanPattern, usize> = BTreeMap::new();
		let mut missing = BTreeSet::new();
		for (_, result) in results {
			match result {
				UnitResult::Extracted(outcome) => {
					metadata.pages += 1;
					metadata.elements_processed += outcome.elements_processed;
					metadata.discarded += outcome.discarded;
					weighted_confidence += outcome.confidence * outcome.records.len() as f64;
					*patterns.entry(outcome.pattern_used).or_default() += 1;
					missing.extend(outcome.missing_selectors);
					records.extend(outcome.records);
				}
				UnitResult::Failed(failure) => metadata.failures.push(failure),
				UnitResult::CircuitOpen(failure) => {
					metadata.circuit_opened = true;
					metadata.failures.push(failure);
				}
			}
		}
		if !records.is_empty() {
			metadata.confidence = (weighted_confidence / records.len() as f64).clamp(0.0, 1.0);
		}
		metadata.pattern_used = patterns
			.into_iter()
			.max_by_key(|(_, count)| *count)
			.map(|(pattern, _)| pattern);
		metadata.missing_selectors = missing.into_iter().collect();
		metadata.elapsed = started.elapsed();

		if metadata.aborted && metadata.pages == 0 {
			return Err(HarvestError::Aborted);
		}
		log::info!(
			"collected {} records from {} pages ({} failed) in {:.1}s",
			records.len(),
			metadata.pages,
			metadata.failures.len(),
			metadata.elapsed.as_secs_f64()
		);
		Ok(CollectResult { records, metadata })
	}

	pub fn get_metrics(&self) -> HarvesterMetrics {
		let inner = &self.inner;
		HarvesterMetrics {
			requests: inner.metrics.snapshot(),
			pool: inner.pool.metrics(),
			circuit: inner.recovery.circuit().snapshot(),
			recovery: inner.recovery.metrics(),
			learning: lock(&inner.learning).metrics(),
			extraction: inner.extractor.metrics(),
			tuning: lock(&inner.tuning).clone(),
		}
	}

	/// Apply a batch of adaptations now, as if learning had just emitted it.
	pub fn apply_adaptations(&self, batch: AdaptationBatch) {
		self.inner.apply_batch(batch);
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
	tokio::select! {
		_ = cancel.cancelled() => None,
		output = future => Some(output),
	}
}

struct UnitSpec {
	url: String,
	page_type: PageType,
	schema: Arc<ExtractionSchema>,
	options: CollectOptions,
	cancel: CancellationToken,
}

enum UnitResult {
	Extracted(ExtractionOutcome),
	Failed(UnitFailure),
	CircuitOpen(UnitFailure),
}

enum Navigation {
	Loaded(Arc<PageSnapshot>),
	Failed(Fault),
	Cancelled,
}

/// How the attempt loop ended.
enum Exit {
	Extracted(ExtractionOutcome, Duration),
	Failed(HarvestError),
	Aborted,
	CircuitOpen(Duration),
}

/// Faults and recoveries seen while working one unit.
#[derive(Default)]
struct Trail {
	errors: Vec<(ErrorCategory, String)>,
	detections: Vec<String>,
	recoveries: Vec<RecoveryStrategyKind>,
	last: Option<(ErrorClassification, Vec<RecoveryStrategyKind>)>,
	applied_delay: Duration,
}

impl Trail {
	fn note(&mut self, classification: &ErrorClassification, fault: &Fault) {
		self.errors
			.push((classification.category, fault.message.clone()));
		if classification.is_detection() {
			self.detections.push(classification.error_type.to_string());
		}
	}

	fn stamp(&self, mut record: InteractionRecord) -> InteractionRecord {
		for (category, message) in &self.errors {
			record = record.with_error(*category, message.clone());
		}
		for indicator in &self.detections {
			record = record.with_detection(indicator.clone());
		}
		record.recoveries = self.recoveries.clone();
		record
	}
}

impl HarvesterInner {
	fn tuning_for(&self, domain: &str) -> Tuning {
		let state = lock(&self.tuning);
		match state.domains.get(domain) {
			Some(layer) => layer.over(&state.global),
			None => state.global.clone(),
		}
	}

	fn concurrency_for(&self, target: &CollectTarget, options: &CollectOptions) -> usize {
		let base = options
			.concurrency
			.unwrap_or(self.config.navigation.concurrency)
			.max(1);
		let domains: BTreeSet<String> = target.urls.iter().map(|url| domain_of(url)).collect();
		let global = lock(&self.tuning).global.clone();
		let (factor, cap) = domains
			.iter()
			.map(|domain| self.tuning_for(domain))
			.chain(std::iter::once(global))
			.fold((1.0_f64, None::<usize>), |(factor, cap), tuning| {
				let cap = match (cap, tuning.concurrency_cap) {
					(Some(a), Some(b)) => Some(a.min(b)),
					(a, b) => a.or(b),
				};
				(factor.min(tuning.concurrency_factor), cap)
			});
		let scaled = ((base as f64) * factor).floor() as usize;
		let limited = cap.map_or(scaled, |cap| scaled.min(cap));
		limited.max(1)
	}

	fn drain_adaptations(&self) {
		let batches: Vec<AdaptationBatch> = {
			let mut receiver = lock(&self.adaptations);
			let Some(receiver) = receiver.as_mut() else {
				return;
			};
			std::iter::from_fn(|| receiver.try_recv().ok()).collect()
		};
		for batch in batches {
			self.apply_batch(batch);
		}
	}

	/// Top-ranked adaptation per (domain, type) wins; the rest of the batch is skipped.
	fn apply_batch(&self, batch: AdaptationBatch) {
		let now = self.clock.now();
		let mut seen: BTreeSet<(Option<String>, AdaptationType)> = BTreeSet::new();
		let mut applied = Vec::new();
		{
			let mut state = lock(&self.tuning);
			let state = &mut *state;
			for adaptation in batch.adaptations {
				if !seen.insert((adaptation.domain.clone(), adaptation.adaptation_type)) {
					continue;
				}
				let layer = match &adaptation.domain {
					Some(domain) => state.domains.entry(domain.clone()).or_default(),
					None => &mut state.global,
				};
				if layer.apply(&adaptation) {
					applied.push(adaptation);
				} else {
					log::debug!(
						"ignoring {} with mismatched value {:?}",
						adaptation.action,
						adaptation.value
					);
				}
			}
		}
		if applied.is_empty() {
			return;
		}
		{
			let mut engine = lock(&self.learning);
			for adaptation in &applied {
				engine.record_applied(adaptation.clone());
			}
		}
		for adaptation in applied {
			log::info!(
				"applied {} {} ({:.2}) to {}",
				adaptation.adaptation_type,
				adaptation.action,
				adaptation.confidence,
				adaptation.domain.as_deref().unwrap_or("all domains")
			);
			self.events
				.publish(HarvestEvent::AdaptationApplied { adaptation, at: now });
		}
	}

	fn acquire_identity(
		&self,
		domain: &str,
		tuning: &Tuning,
		options: &CollectOptions,
	) -> Result<ProxyLease, PoolError> {
		let navigation = &self.config.navigation;
		let mut criteria = SelectionCriteria::new(options.proxy_type.unwrap_or(navigation.proxy_type));
		// The pool widens to any country on its own when this one is drained.
		let country = options
			.country
			.clone()
			.or_else(|| tuning.country.clone())
			.or_else(|| navigation.country.clone());
		if let Some(country) = country {
			criteria = criteria.in_country(country);
		}
		if navigation.prefer_sticky {
			criteria = criteria.prefer_sticky();
		}

		match tuning.last_proxy.as_deref() {
			Some(previous) if tuning.rotate_pending => {
				{
					let mut state = lock(&self.tuning);
					if let Some(layer) = state.domains.get_mut(domain) {
						layer.rotate_pending = false;
					}
					state.global.rotate_pending = false;
				}
				log::debug!("rotating away from {previous} for {domain}");
				match self.pool.acquire_excluding(&criteria, &[previous]) {
					Err(PoolError::PoolExhausted { .. }) => self.pool.acquire(&criteria),
					other => other,
				}
			}
			_ => self.pool.acquire(&criteria),
		}
	}

	/// Lease a proxy like the session's current one, which the pool has blocked.
	fn replace_blocked_proxy(&self, ctx: &SessionContext) -> Result<ProxyLease, PoolError> {
		let current = &ctx.identity.lease.record;
		let criteria = SelectionCriteria::new(current.proxy_type).in_country(current.geo.country.clone());
		let lease = self.pool.acquire_excluding(&criteria, &[current.id.as_str()])?;
		self.pool.release(&current.id);
		Ok(lease)
	}

	fn remember_proxy(&self, domain: &str, proxy_id: &str) {
		lock(&self.tuning)
			.domains
			.entry(domain.to_string())
			.or_default()
			.last_proxy = Some(proxy_id.to_string());
	}

	async fn report(&self, record: InteractionRecord) {
		let handle = lock(&self.learning_handle).clone();
		if let Some(handle) = handle
			&& handle.report(record.clone()).await
		{
			return;
		}
		if let Some(batch) = ingest_and_adapt(&self.learning, record) {
			self.apply_batch(batch);
		}
	}

	async fn navigate(
		&self,
		ctx: &SessionContext,
		options: &NavigateOptions,
		cancel: &CancellationToken,
	) -> Navigation {
		let identity = &ctx.identity;
		let session = match cancellable(
			cancel,
			self.engine
				.create_session(&identity.lease.agent, &identity.fingerprint),
		)
		.await
		{
			None => return Navigation::Cancelled,
			Some(Err(err)) => return Navigation::Failed(err.into()),
			Some(Ok(session)) => session,
		};

		let loaded = cancellable(
			cancel,
			tokio::time::timeout(options.timeout, self.engine.navigate(&session, &ctx.url, options)),
		)
		.await;
		self.engine.close(&session).await;

		match loaded {
			None => Navigation::Cancelled,
			Some(Err(_)) => Navigation::Failed(
				NavigationError::new(
					NavigationErrorKind::Timeout,
					format!("navigation to {} timed out after {:?}", ctx.url, options.timeout),
				)
				.into(),
			),
			Some(Ok(Err(err))) => Navigation::Failed(err.into()),
			Some(Ok(Ok(page))) => {
				let page = Arc::new(page);
				match self.recovery.classifier().detect_soft_block(&page) {
					Some(fault) => Navigation::Failed(fault),
					None => Navigation::Loaded(page),
				}
			}
		}
	}

	/// Fault for an extraction that came back empty, if the page explains why.
	fn extraction_fault(outcome: &ExtractionOutcome, page: &Arc<PageSnapshot>) -> Option<Fault> {
		if !outcome.records.is_empty() {
			return None;
		}
		if let Some(selector) = outcome.missing_selectors.first() {
			return Some(
				Fault::new(format!("selector '{selector}' not found on {}", page.url))
					.with_selector(selector.clone())
					.with_status(page.status)
					.with_page(Arc::clone(page)),
			);
		}
		page.elements.is_empty().then(|| {
			Fault::new(format!("empty page at {}", page.url))
				.with_status(page.status)
				.with_page(Arc::clone(page))
		})
	}

	fn record_attempt(&self, ctx: &SessionContext, success: bool, latency: Duration, delay: Duration) {
		lock(&self.timing).record_outcome(
			&ctx.domain,
			&TimingOutcome {
				success,
				response_time: latency,
				applied_delay: delay,
			},
		);
		self.metrics.record_outcome(&ctx.domain, success, latency);
	}

	async fn run_unit(&self, unit: &UnitSpec) -> UnitResult {
		self.drain_adaptations();
		let session_id = format!("session-{}", self.sessions.fetch_add(1, Ordering::Relaxed) + 1);
		let domain = domain_of(&unit.url);
		let tuning = self.tuning_for(&domain);

		let lease = match self.acquire_identity(&domain, &tuning, &unit.options) {
			Ok(lease) => lease,
			Err(err) => {
				log::warn!("[{session_id}] no identity for {}: {err}", unit.url);
				let error = HarvestError::from(err);
				self.events.publish(HarvestEvent::UnitFailed {
					session_id,
					url: unit.url.clone(),
					error: error.to_string(),
				});
				return UnitResult::Failed(UnitFailure::new(&unit.url, &error, 0));
			}
		};
		let identity = self.recovery.resources().identity_for(lease);
		let requested = unit
			.options
			.behavior_profile
			.or(tuning.behavior_profile)
			.unwrap_or(self.config.navigation.default_profile);
		let mut ctx = SessionContext::new(
			&session_id,
			&unit.url,
			unit.page_type,
			identity,
			self.recovery.session_profile(requested),
			self.clock.now(),
		);
		ctx.selector_overrides = self.recovery.resources().selectors.overrides_for(&domain);
		ctx.extraction_mode = unit
			.options
			.extraction_mode
			.or(tuning.extraction_mode)
			.unwrap_or_default();
		ctx.delay_multiplier = tuning.delay_multiplier;
		ctx.interaction_noise = tuning.interaction_noise;

		self.events.publish(HarvestEvent::UnitStarted {
			session_id: session_id.clone(),
			url: unit.url.clone(),
			proxy_id: ctx.identity.proxy_id().to_string(),
		});
		log::debug!(
			"[{session_id}] {} via {} as {:?}",
			unit.url,
			ctx.identity.proxy_id(),
			ctx.behavior_profile
		);

		let scan_pattern = unit.options.scan_pattern.or(tuning.scan_pattern);
		let max_attempts = self.config.navigation.max_attempts.max(1);
		let mut trail = Trail::default();
		let mut content_length = 0;
		let mut attempt = 0;

		let exit = loop {
			attempt += 1;
			if unit.cancel.is_cancelled() {
				break Exit::Aborted;
			}
			if let Err(RecoveryError::CircuitOpen { retry_after }) = self.recovery.circuit().try_acquire() {
				break Exit::CircuitOpen(retry_after);
			}
			if cancellable(&unit.cancel, self.recovery.wait_if_paused()).await.is_none() {
				break Exit::Aborted;
			}
			if attempt > 1 && self.pool.is_blocked(ctx.identity.proxy_id()) {
				match self.replace_blocked_proxy(&ctx) {
					Ok(lease) => {
						log::debug!(
							"[{session_id}] proxy {} was blocked, continuing on {}",
							ctx.identity.proxy_id(),
							lease.record.id
						);
						ctx.identity = self.recovery.resources().identity_for(lease);
					}
					Err(err) => break Exit::Failed(err.into()),
				}
			}

			let delay = if self.config.navigation.pace_navigation {
				let request = TimingRequest::new(unit.page_type, content_length, self.clock.now())
					.scaled(ctx.delay_multiplier);
				lock(&self.timing).calculate_delay(&domain, ctx.behavior_profile, &request)
			} else {
				Duration::ZERO
			};
			if !delay.is_zero() {
				if cancellable(&unit.cancel, tokio::time::sleep(delay)).await.is_none() {
					break Exit::Aborted;
				}
				ctx = ctx.with_action(ActionRecord::new(ActionKind::Wait, self.clock.now()).lasting(delay));
				trail.applied_delay += delay;
			}

			let options = self
				.config
				.navigation
				.navigate_options(ctx.extra_wait, ctx.captcha_token.clone());
			let started = Instant::now();
			let navigation = self.navigate(&ctx, &options, &unit.cancel).await;
			let latency = started.elapsed();
			ctx = ctx.with_action(
				ActionRecord::new(ActionKind::Navigate, self.clock.now())
					.on(&unit.url)
					.lasting(latency),
			);

			let fault = match navigation {
				Navigation::Cancelled => break Exit::Aborted,
				Navigation::Failed(fault) => fault,
				Navigation::Loaded(page) => {
					content_length = page.text_len();
					ctx = ctx.with_action(
						ActionRecord::new(ActionKind::Scroll, self.clock.now()).on(&page.url),
					);
					if ctx.interaction_noise {
						let pause = Duration::from_millis(rand::thread_rng().gen_range(150..=600));
						if cancellable(&unit.cancel, tokio::time::sleep(pause)).await.is_none() {
							break Exit::Aborted;
						}
						ctx = ctx.with_action(
							ActionRecord::new(ActionKind::MouseMove, self.clock.now()).lasting(pause),
						);
					}

					let extract_options = ExtractOptions {
						mode: ctx.extraction_mode,
						selector_overrides: ctx.selector_overrides.clone(),
						scan_pattern,
						cancel: Some(unit.cancel.clone()),
					};
					match self.extractor.extract(&page, &unit.schema, &extract_options).await {
						Err(ExtractionError::Cancelled) => break Exit::Aborted,
						Err(err) => break Exit::Failed(err.into()),
						Ok(outcome) => {
							ctx = ctx
								.with_action(
									ActionRecord::new(ActionKind::Read, self.clock.now())
										.lasting(outcome.reading_time),
								)
								.with_action(
									ActionRecord::new(ActionKind::Extract, self.clock.now())
										.on(outcome.records.len().to_string()),
								);
							match Self::extraction_fault(&outcome, &page) {
								Some(fault) => fault,
								None => break Exit::Extracted(outcome, latency),
							}
						}
					}
				}
			};

			log::debug!("[{session_id}] attempt {attempt} failed: {fault}");
			self.pool
				.report_failure(ctx.identity.proxy_id(), &fault.to_string());
			self.recovery.record_failure();
			self.record_attempt(&ctx, false, latency, delay);

			match self.recovery.recover(&fault, &ctx, attempt).await {
				Ok(outcome) => {
					trail.note(&outcome.classification, &fault);
					trail.recoveries.push(outcome.strategy);
					if outcome.patch.captcha_token.is_some() {
						ctx = ctx.with_action(ActionRecord::new(ActionKind::SolveCaptcha, self.clock.now()));
					}
					ctx = ctx.with_patch(&outcome.patch);
					trail.last = Some((outcome.classification, outcome.attempted));
					if attempt >= max_attempts {
						break Exit::Failed(HarvestError::AttemptsExhausted {
							url: unit.url.clone(),
							attempts: attempt,
						});
					}
				}
				Err(RecoveryError::Exhausted {
					classification,
					attempted,
				}) => {
					trail.note(&classification, &fault);
					trail.last = Some((classification.clone(), attempted.clone()));
					break Exit::Failed(HarvestError::Recovery(RecoveryError::Exhausted {
						classification,
						attempted,
					}));
				}
				Err(RecoveryError::CircuitOpen { retry_after }) => break Exit::CircuitOpen(retry_after),
			}
		};

		let proxy_id = ctx.identity.proxy_id().to_string();
		let now = self.clock.now();
		let result = match exit {
			Exit::Extracted(outcome, latency) => {
				self.pool.report_success(&proxy_id, latency);
				self.recovery.record_success();
				self.record_attempt(&ctx, true, latency, trail.applied_delay);

				let records = outcome.records.len();
				let data_quality = if records == 0 {
					0.0
				} else {
					outcome.records.iter().map(|record| record.quality).sum::<f64>() / records as f64
				};
				let record = trail
					.stamp(InteractionRecord::from_context(&ctx, Outcome::Success, now))
					.with_metrics(InteractionMetrics {
						latency,
						applied_delay: trail.applied_delay,
						data_quality,
						records,
						elements_processed: outcome.elements_processed,
						attempts: attempt,
					})
					.with_scan_pattern(outcome.pattern_used);
				self.report(record).await;
				self.events.publish(HarvestEvent::UnitCompleted {
					session_id,
					url: unit.url.clone(),
					records,
					latency,
				});
				UnitResult::Extracted(outcome)
			}
			Exit::Failed(error) => {
				log::warn!("[{session_id}] giving up on {}: {error}", unit.url);
				let record = trail
					.stamp(InteractionRecord::from_context(&ctx, Outcome::Failure, now))
					.with_metrics(InteractionMetrics {
						applied_delay: trail.applied_delay,
						attempts: attempt,
						..InteractionMetrics::default()
					});
				self.report(record).await;
				UnitResult::Failed(self.unit_failure(&session_id, unit, &error, attempt, trail))
			}
			Exit::Aborted => {
				log::debug!("[{session_id}] aborted {}", unit.url);
				self.metrics.record_aborted(&domain);
				let record = trail
					.stamp(InteractionRecord::from_context(&ctx, Outcome::Failure, now))
					.with_metrics(InteractionMetrics {
						applied_delay: trail.applied_delay,
						attempts: attempt,
						..InteractionMetrics::default()
					})
					.aborted();
				self.report(record).await;
				UnitResult::Failed(self.unit_failure(&session_id, unit, &HarvestError::Aborted, attempt, trail))
			}
			Exit::CircuitOpen(retry_after) => {
				let record = trail
					.stamp(InteractionRecord::from_context(&ctx, Outcome::Failure, now))
					.aborted();
				self.report(record).await;
				let error = HarvestError::CircuitOpen { retry_after };
				UnitResult::CircuitOpen(self.unit_failure(&session_id, unit, &error, attempt, trail))
			}
		};

		self.pool.release(&proxy_id);
		self.remember_proxy(&domain, &proxy_id);
		result
	}

	fn unit_failure(
		&self,
		session_id: &str,
		unit: &UnitSpec,
		error: &HarvestError,
		attempts: u32,
		trail: Trail,
	) -> UnitFailure {
		self.events.publish(HarvestEvent::UnitFailed {
			session_id: session_id.to_string(),
			url: unit.url.clone(),
			error: error.to_string(),
		});
		let mut failure = UnitFailure::new(&unit.url, error, attempts);
		if let Some((classification, attempted)) = trail.last {
			failure.category = Some(classification.category);
			failure.strategies = attempted;
		}
		failure
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::external_deps::browser::{BrowserSession, snapshot_from_html};
	use crate::extraction::{DerivedField, FieldKind, FieldRule, Relationship};
	use crate::modules::proxy::{AgentConfig, ProbeError};
	use crate::modules::spoofing::BrowserFingerprint;
	use async_trait::async_trait;
	use std::collections::VecDeque;
	use std::sync::atomic::AtomicUsize;

	const LISTINGS: &str = r#"
		<main>
		  <div class="listing"><h2>Widget shop</h2><span class="price">$120,000</span><span class="revenue">$5,000/mo</span></div>
		  <div class="listing"><h2>Gadget store</h2><span class="price">$90,000</span><span class="revenue">$2,500/mo</span></div>
		</main>"#;

	enum Step {
		Page(&'static str),
		Fail(NavigationErrorKind, &'static str),
		Hang,
	}

	/// Browser engine that plays back a script, then serves `LISTINGS`.
	#[derive(Default)]
	struct ScriptedEngine {
		script: Mutex<VecDeque<Step>>,
		navigations: AtomicUsize,
		closed: AtomicUsize,
		proxies: Mutex<Vec<String>>,
	}

	impl ScriptedEngine {
		fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
			Self {
				script: Mutex::new(steps.into_iter().collect()),
				..Self::default()
			}
		}
	}

	#[async_trait]
	impl BrowserEngine for ScriptedEngine {
		async fn create_session(
			&self,
			agent: &AgentConfig,
			_fingerprint: &BrowserFingerprint,
		) -> Result<BrowserSession, NavigationError> {
			lock(&self.proxies).push(agent.proxy_url.clone());
			Ok(BrowserSession {
				id: format!("browser-{}", self.navigations.load(Ordering::SeqCst)),
			})
		}

		async fn navigate(
			&self,
			_session: &BrowserSession,
			url: &str,
			_options: &NavigateOptions,
		) -> Result<PageSnapshot, NavigationError> {
			self.navigations.fetch_add(1, Ordering::SeqCst);
			let step = lock(&self.script).pop_front();
			match step {
				Some(Step::Page(html)) => Ok(snapshot_from_html(url, 200, html)),
				Some(Step::Fail(kind, message)) => Err(NavigationError::new(kind, message)),
				Some(Step::Hang) => {
					tokio::time::sleep(Duration::from_secs(3600)).await;
					Err(NavigationError::new(NavigationErrorKind::Other, "woke up"))
				}
				None => Ok(snapshot_from_html(url, 200, LISTINGS)),
			}
		}

		async fn snapshot(&self, _session: &BrowserSession) -> Result<PageSnapshot, NavigationError> {
			Ok(snapshot_from_html("about:blank", 200, LISTINGS))
		}

		async fn close(&self, _session: &BrowserSession) {
			self.closed.fetch_add(1, Ordering::SeqCst);
		}
	}

	struct NoProbe;

	#[async_trait]
	impl HealthProbe for NoProbe {
		async fn probe(&self, _record: &ProxyRecord) -> Result<Duration, ProbeError> {
			Ok(Duration::from_millis(50))
		}
	}

	fn schema() -> ExtractionSchema {
		ExtractionSchema::new()
			.with_record_selector(".listing")
			.field(FieldRule::new("title", FieldKind::Text).selector("h2").required())
			.field(FieldRule::new("price", FieldKind::Currency).selector(".price").required())
			.field(FieldRule::new("revenue", FieldKind::Currency).selector(".revenue"))
			.derive(DerivedField::ratio("multiple", "price", "revenue"))
			.relate(Relationship::within("multiple", 0.5, 10.0))
	}

	fn config() -> HarvesterConfig {
		let mut config = HarvesterConfig::default();
		config.navigation.pace_navigation = false;
		config.extraction.simulate_reading = false;
		config
	}

	fn harvester(engine: Arc<ScriptedEngine>) -> Harvester {
		let proxies = ["10.0.0.1:8000", "10.0.0.2:8000", "10.0.0.3:8000"]
			.into_iter()
			.map(|addr| ProxyRecord::parse(&format!("http://{addr}"), ProxyType::Residential, "US").unwrap());
		Harvester::builder()
			.with_config(config())
			.with_browser_engine(engine)
			.with_health_probe(Arc::new(NoProbe))
			.with_proxies(proxies)
			.build()
			.unwrap()
	}

	fn target(urls: &[&str]) -> CollectTarget {
		CollectTarget::new(schema()).urls(urls.iter().copied())
	}

	#[tokio::test(start_paused = true)]
	async fn collects_records_and_feeds_learning() {
		let engine = Arc::new(ScriptedEngine::default());
		let harvester = harvester(engine.clone());

		let result = harvester
			.collect(
				&target(&["https://market.example.com/a", "https://market.example.com/b"]),
				&CollectOptions::default(),
			)
			.await
			.unwrap();

		assert_eq!(result.records.len(), 4);
		assert_eq!(result.metadata.pages, 2);
		assert!(result.metadata.failures.is_empty());
		assert!((0.0..=1.0).contains(&result.metadata.confidence));
		assert!(result.metadata.pattern_used.is_some());
		assert_eq!(engine.closed.load(Ordering::SeqCst), 2);

		let metrics = harvester.get_metrics();
		assert_eq!(metrics.learning.successful_records, 2);
		assert_eq!(metrics.pool.in_use, 0);
		assert_eq!(metrics.requests.global.successes, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn retries_after_recovering_from_a_timeout() {
		let engine = Arc::new(ScriptedEngine::with_script([Step::Fail(
			NavigationErrorKind::Timeout,
			"navigation timed out",
		)]));
		let harvester = harvester(engine.clone());

		let result = harvester
			.collect(&target(&["https://market.example.com/a"]), &CollectOptions::default())
			.await
			.unwrap();

		assert_eq!(result.records.len(), 2);
		assert_eq!(engine.navigations.load(Ordering::SeqCst), 2);
		let learning = harvester.learning().lock().unwrap();
		let record = learning.successful().latest().unwrap();
		assert_eq!(record.recoveries, vec![RecoveryStrategyKind::Delay]);
		assert_eq!(record.error_categories, vec![ErrorCategory::Network]);
		assert_eq!(record.metrics.attempts, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn persistent_timeouts_move_the_unit_to_another_proxy() {
		let engine = Arc::new(ScriptedEngine::with_script(
			(0..3).map(|_| Step::Fail(NavigationErrorKind::Timeout, "navigation timed out")),
		));
		let mut config = config();
		config.navigation.max_attempts = 4;
		let harvester = Harvester::builder()
			.with_config(config)
			.with_browser_engine(engine.clone())
			.with_health_probe(Arc::new(NoProbe))
			.with_proxies(["10.0.0.1:8000", "10.0.0.2:8000"].into_iter().map(|addr| {
				ProxyRecord::parse(&format!("http://{addr}"), ProxyType::Residential, "US").unwrap()
			}))
			.build()
			.unwrap();

		let result = harvester
			.collect(&target(&["https://market.example.com/a"]), &CollectOptions::default())
			.await
			.unwrap();

		assert_eq!(result.records.len(), 2);
		let proxies = lock(&engine.proxies).clone();
		assert_eq!(proxies.len(), 4);
		assert!(proxies[..3].iter().all(|proxy| *proxy == proxies[0]));
		assert_ne!(proxies[3], proxies[0]);

		let learning = harvester.learning().lock().unwrap();
		let record = learning.successful().latest().unwrap();
		assert_eq!(
			record.recoveries,
			vec![
				RecoveryStrategyKind::Delay,
				RecoveryStrategyKind::ExponentialBackoff,
				RecoveryStrategyKind::RotateProxy,
			]
		);
		assert_eq!(record.metrics.attempts, 4);
		drop(learning);
		assert_eq!(harvester.get_metrics().pool.in_use, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn a_proxy_blocked_mid_unit_is_replaced_before_retrying() {
		let engine = Arc::new(ScriptedEngine::with_script([Step::Fail(
			NavigationErrorKind::Other,
			"requests arriving too fast",
		)]));
		let mut config = config();
		config.pool.min_samples = 1;
		let harvester = Harvester::builder()
			.with_config(config)
			.with_browser_engine(engine.clone())
			.with_health_probe(Arc::new(NoProbe))
			.with_proxies(["10.0.0.1:8000", "10.0.0.2:8000"].into_iter().map(|addr| {
				ProxyRecord::parse(&format!("http://{addr}"), ProxyType::Residential, "US").unwrap()
			}))
			.build()
			.unwrap();

		let result = harvester
			.collect(&target(&["https://market.example.com/a"]), &CollectOptions::default())
			.await
			.unwrap();

		// The behavioral fix keeps the identity; the pool blocked it on the first failure.
		assert_eq!(result.records.len(), 2);
		let proxies = lock(&engine.proxies).clone();
		assert_eq!(proxies.len(), 2);
		assert_ne!(proxies[0], proxies[1]);
		let learning = harvester.learning().lock().unwrap();
		let record = learning.successful().latest().unwrap();
		assert_eq!(record.recoveries, vec![RecoveryStrategyKind::EnhanceBehavior]);
		drop(learning);
		let metrics = harvester.get_metrics();
		assert_eq!(metrics.pool.in_use, 0);
		assert_eq!(metrics.pool.blocked, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn lists_units_that_exhaust_their_attempts() {
		let engine = Arc::new(ScriptedEngine::with_script([
			Step::Fail(NavigationErrorKind::Dns, "name not resolved"),
			Step::Fail(NavigationErrorKind::Dns, "name not resolved"),
			Step::Fail(NavigationErrorKind::Dns, "name not resolved"),
		]));
		let harvester = harvester(engine);

		let result = harvester
			.collect(&target(&["https://gone.example.com/"]), &CollectOptions::default())
			.await
			.unwrap();

		assert!(result.records.is_empty());
		assert_eq!(result.metadata.failures.len(), 1);
		let failure = &result.metadata.failures[0];
		assert_eq!(failure.attempts, 3);
		assert_eq!(failure.category, Some(ErrorCategory::Network));
		assert!(!failure.aborted);
		assert_eq!(harvester.get_metrics().learning.failed_records, 1);
		assert_eq!(harvester.get_metrics().pool.in_use, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn refuses_work_while_the_circuit_is_open() {
		let harvester = harvester(Arc::new(ScriptedEngine::default()));
		for _ in 0..harvester.config().recovery.circuit.failure_threshold {
			harvester.recovery().circuit().record_failure();
		}

		let err = harvester
			.collect(&target(&["https://market.example.com/a"]), &CollectOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, HarvestError::CircuitOpen { .. }));
	}

	#[tokio::test(start_paused = true)]
	async fn cancelled_units_still_report_to_learning() {
		let engine = Arc::new(ScriptedEngine::with_script([Step::Hang]));
		let harvester = harvester(engine);
		let token = CancellationToken::new();
		let canceller = token.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_secs(1)).await;
			canceller.cancel();
		});

		let err = harvester
			.collect(
				&target(&["https://market.example.com/a"]),
				&CollectOptions::default().cancel_with(token),
			)
			.await
			.unwrap_err();

		assert!(matches!(err, HarvestError::Aborted));
		let learning = harvester.learning().lock().unwrap();
		let record = learning.failed().latest().unwrap();
		assert!(record.aborted);
		assert_eq!(harvester.get_metrics().pool.in_use, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn applied_adaptations_shape_later_sessions() {
		let harvester = harvester(Arc::new(ScriptedEngine::default()));
		harvester.apply_adaptations(AdaptationBatch {
			generated_at: chrono::Utc::now(),
			triggers: Vec::new(),
			adaptations: vec![
				Adaptation::new(
					AdaptationType::Behavior,
					AdaptationAction::SwitchProfile,
					AdaptationValue::Profile(BehaviorProfile::Research),
					0.9,
					5,
				)
				.for_domain("market.example.com"),
				Adaptation::new(
					AdaptationType::Timing,
					AdaptationAction::IncreaseDelay,
					AdaptationValue::Multiplier(2.0),
					0.8,
					4,
				),
			],
		});

		harvester
			.collect(&target(&["https://market.example.com/a"]), &CollectOptions::default())
			.await
			.unwrap();

		let metrics = harvester.get_metrics();
		assert_eq!(metrics.learning.adaptations_applied, 2);
		assert_eq!(metrics.tuning.global.delay_multiplier, 2.0);
		let learning = harvester.learning().lock().unwrap();
		let record = learning.successful().latest().unwrap();
		assert_eq!(record.behavior_profile, BehaviorProfile::Research);
	}

	#[tokio::test(start_paused = true)]
	async fn start_and_shutdown_persist_learning() {
		let store = Arc::new(MemoryLearningStore::new(3));
		let harvester = Harvester::builder()
			.with_config(config())
			.with_browser_engine(Arc::new(ScriptedEngine::default()))
			.with_health_probe(Arc::new(NoProbe))
			.with_learning_store(store.clone())
			.with_proxies([ProxyRecord::parse("http://10.0.0.1:8000", ProxyType::Residential, "US").unwrap()])
			.build()
			.unwrap();

		harvester.start().await.unwrap();
		harvester.start().await.unwrap();
		harvester
			.collect(&target(&["https://market.example.com/a"]), &CollectOptions::default())
			.await
			.unwrap();
		harvester.shutdown().await.unwrap();

		assert_eq!(store.len(), 1);
		assert_eq!(harvester.get_metrics().learning.successful_records, 1);
	}
}

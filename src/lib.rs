//! # stealth-harvester
//!
//! An adaptive collection engine for pages that push back: rotating proxy
//! identities, fault classification with recovery and a circuit breaker,
//! online learning that tunes pacing and identity choices, and schema driven
//! extraction that reads pages the way a person would.
//!
//! ## Features
//!
//! - Identity pool with geography aware selection, sticky sessions and health checks
//! - Ordered fault classification mapped to recovery strategies
//! - Circuit breaker and detection cooldowns shared by every session
//! - Bounded interaction memory feeding timing, behavior, extraction, detection and performance models
//! - Extraction with typed fields, derived values and plausibility checks
//! - Learning snapshots persisted to redb
//!
//! ## Example
//!
//! ```no_run
//! use stealth_harvester::extraction::{ExtractionSchema, FieldKind, FieldRule};
//! use stealth_harvester::{CollectOptions, CollectTarget, Harvester, HarvesterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarvesterConfig::from_json_file("harvester.json")?;
//!     let harvester = Harvester::builder().with_config(config).build()?;
//!     harvester.start().await?;
//!
//!     let schema = ExtractionSchema::new()
//!         .with_record_selector(".listing")
//!         .field(FieldRule::new("title", FieldKind::Text).selector("h2").required())
//!         .field(FieldRule::new("price", FieldKind::Currency).selector(".price"));
//!     let target = CollectTarget::new(schema).url("https://market.example.com/listings");
//!     let result = harvester.collect(&target, &CollectOptions::default()).await?;
//!     println!("{} records, confidence {:.2}", result.records.len(), result.metadata.confidence);
//!
//!     harvester.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod harvester;

pub mod config;
pub mod external_deps;
pub mod extraction;
pub mod learning;
pub mod modules;
pub mod recovery;

pub use crate::harvester::{
    CollectMetadata,
    CollectOptions,
    CollectResult,
    CollectTarget,
    HarvestError,
    HarvestResult,
    Harvester,
    HarvesterBuilder,
    HarvesterMetrics,
    Tuning,
    TuningSnapshot,
    UnitFailure,
};

pub use crate::config::{ConfigError, HarvesterConfig, NavigationConfig, ProxySpec};

pub use crate::external_deps::{BrowserEngine, CaptchaProvider, HttpBrowserEngine, PageSnapshot};

pub use crate::extraction::{ExtractedRecord, ExtractionSchema, IntelligentExtractor};

pub use crate::learning::{
    Adaptation,
    AdaptationAction,
    AdaptationBatch,
    AdaptationType,
    AdaptationValue,
    InteractionRecord,
    LearningEngine,
    LearningStore,
};

pub use crate::modules::{BehaviorProfile, IdentityPool, PageType, ProxyRecord, ProxyType};

pub use crate::recovery::{CircuitBreaker, ErrorCategory, FaultClassifier, RecoveryEngine};

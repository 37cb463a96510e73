//! Cross-cutting services module
//!
//! Identity pool, pacing, session state, events and background scheduling
//! shared by recovery, learning and the orchestrator.

pub mod adaptive_timing;
pub mod clock;
pub mod events;
pub mod metrics;
pub mod proxy;
pub mod scheduler;
pub mod session;
pub mod spoofing;

// Re-export commonly used types
pub use adaptive_timing::{
    AdaptiveTimingStrategy,
    BehaviorProfile,
    DefaultAdaptiveTiming,
    DomainTimingSnapshot,
    TimingOutcome,
    TimingProfile,
    TimingRequest,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use events::{EventBus, HarvestEvent, spawn_event_logger};
pub use metrics::{DomainStats, GlobalStats, MetricsCollector, RequestMetrics};
pub use proxy::{
    HealthCheckConfig, HealthCheckTask, HealthProbe, IdentityPool, PoolError, PoolMetrics,
    ProxyConfig, ProxyLease, ProxyRecord, ProxyType, SelectionCriteria,
};
pub use scheduler::{ScheduledTask, Scheduler};
pub use session::{ActionKind, ActionRecord, Identity, PageType, SessionContext, SessionPatch};
pub use spoofing::{BrowserFingerprint, BrowserType, ConsistencyLevel, FingerprintGenerator};

//! Session context shared by recovery and learning.
//!
//! A [`SessionContext`] is built once per unit of work and never mutated in
//! place. Recovery strategies describe the changes they want as a
//! [`SessionPatch`] and the orchestrator derives the next context from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::extraction::ExtractionMode;
use crate::modules::adaptive_timing::BehaviorProfile;
use crate::modules::proxy::ProxyLease;
use crate::modules::spoofing::BrowserFingerprint;

/// Kind of page a unit of work targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Listing,
    Detail,
    Search,
    Landing,
    Unknown,
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageType::Listing => "listing",
            PageType::Detail => "detail",
            PageType::Search => "search",
            PageType::Landing => "landing",
            PageType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A proxy lease paired with the browser fingerprint presented through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub lease: ProxyLease,
    pub fingerprint: BrowserFingerprint,
}

impl Identity {
    pub fn proxy_id(&self) -> &str {
        &self.lease.record.id
    }

    pub fn country(&self) -> &str {
        &self.lease.record.geo.country
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Wait,
    Scroll,
    Read,
    MouseMove,
    Extract,
    SolveCaptcha,
}

/// One step the session performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub target: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(with = "crate::config::duration_ms")]
    pub duration: Duration,
}

impl ActionRecord {
    pub fn new(kind: ActionKind, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            target: None,
            at,
            duration: Duration::ZERO,
        }
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Immutable per-session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub domain: String,
    pub url: String,
    pub page_type: PageType,
    pub identity: Identity,
    pub behavior_profile: BehaviorProfile,
    pub started_at: DateTime<Utc>,
    pub actions: Vec<ActionRecord>,
    /// Replacement selectors learned for this domain, keyed by the original.
    pub selector_overrides: BTreeMap<String, String>,
    pub extraction_mode: ExtractionMode,
    #[serde(with = "crate::config::duration_ms")]
    pub extra_wait: Duration,
    pub delay_multiplier: f64,
    pub interaction_noise: bool,
    pub captcha_token: Option<String>,
    pub restart_requested: bool,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        url: impl Into<String>,
        page_type: PageType,
        identity: Identity,
        behavior_profile: BehaviorProfile,
        started_at: DateTime<Utc>,
    ) -> Self {
        let url = url.into();
        Self {
            session_id: session_id.into(),
            domain: domain_of(&url),
            url,
            page_type,
            identity,
            behavior_profile,
            started_at,
            actions: Vec::new(),
            selector_overrides: BTreeMap::new(),
            extraction_mode: ExtractionMode::Standard,
            extra_wait: Duration::ZERO,
            delay_multiplier: 1.0,
            interaction_noise: false,
            captcha_token: None,
            restart_requested: false,
        }
    }

    /// Context after applying a recovery patch.
    pub fn with_patch(&self, patch: &SessionPatch) -> Self {
        let mut next = self.clone();
        if let Some(identity) = &patch.identity {
            next.identity = identity.clone();
        }
        if let Some(profile) = patch.behavior_profile {
            next.behavior_profile = profile;
        }
        for (original, replacement) in &patch.selector_overrides {
            next.selector_overrides
                .insert(original.clone(), replacement.clone());
        }
        if let Some(mode) = patch.extraction_mode {
            next.extraction_mode = mode;
        }
        next.extra_wait += patch.extra_wait;
        if let Some(multiplier) = patch.delay_multiplier {
            next.delay_multiplier = next.delay_multiplier.max(multiplier);
        }
        next.interaction_noise |= patch.interaction_noise;
        if patch.captcha_token.is_some() {
            next.captcha_token = patch.captcha_token.clone();
        }
        next.restart_requested = patch.restart_session;
        next
    }

    /// Context with one more recorded action.
    pub fn with_action(&self, action: ActionRecord) -> Self {
        let mut next = self.clone();
        next.actions.push(action);
        next
    }

    pub fn action_kinds(&self) -> Vec<ActionKind> {
        self.actions.iter().map(|action| action.kind).collect()
    }
}

/// Changes a recovery strategy asks the orchestrator to make.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub identity: Option<Identity>,
    pub behavior_profile: Option<BehaviorProfile>,
    pub selector_overrides: BTreeMap<String, String>,
    pub extraction_mode: Option<ExtractionMode>,
    #[serde(with = "crate::config::duration_ms")]
    pub extra_wait: Duration,
    pub delay_multiplier: Option<f64>,
    pub interaction_noise: bool,
    pub captcha_token: Option<String>,
    pub restart_session: bool,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        *self == SessionPatch::default()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.lease.record.id == other.lease.record.id && self.fingerprint == other.fingerprint
    }
}

/// Host part of a URL, or the raw input when it does not parse.
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::modules::proxy::{Geography, ProxyProtocol, ProxyRecord, ProxyType};
    use crate::modules::spoofing::FingerprintGenerator;

    pub fn identity(proxy_id: &str, country: &str) -> Identity {
        let record = ProxyRecord::new(
            proxy_id,
            ProxyType::Residential,
            ProxyProtocol::Http,
            "127.0.0.1",
            8080,
            Geography::country(country),
        );
        let agent = crate::modules::proxy::AgentConfig {
            proxy_url: record.proxy_url(),
            protocol: record.protocol,
            credentials: None,
            sticky_session: None,
        };
        let fingerprint = FingerprintGenerator::default().fingerprint_for(proxy_id, ProxyType::Residential);
        Identity {
            lease: ProxyLease { record, agent },
            fingerprint,
        }
    }

    pub fn context(url: &str) -> SessionContext {
        SessionContext::new(
            "session-1",
            url,
            PageType::Listing,
            identity("p1", "US"),
            BehaviorProfile::Casual,
            Utc::now(),
        )
    }
}

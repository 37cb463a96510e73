//! Browser automation collaborator.
//!
//! The engine is only reached through [`BrowserEngine`]; any automation
//! product that can navigate and hand back a [`PageSnapshot`] fits.

mod dom;
mod http_engine;

pub use dom::{element_path, snapshot_from_html};
pub use http_engine::HttpBrowserEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::modules::proxy::AgentConfig;
use crate::modules::spoofing::BrowserFingerprint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A rendered element with non-empty text or an interactive role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleElement {
    /// Position in document order.
    pub index: usize,
    /// CSS path that selects exactly this element.
    pub path: String,
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub bounds: BoundingBox,
    pub interactive: bool,
    /// Foreground/background contrast estimate in [0, 1].
    pub contrast: f64,
    /// Nearest enclosing landmark such as `main`, `aside#filters` or `table`.
    pub landmark: Option<String>,
}

impl VisibleElement {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Page state captured after navigation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub status: u16,
    pub title: Option<String>,
    pub html: String,
    pub elements: Vec<VisibleElement>,
    pub viewport: (f64, f64),
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

impl PageSnapshot {
    pub fn text_len(&self) -> usize {
        self.elements.iter().map(|element| element.text.len()).sum()
    }

    /// Leading slice of the markup, for classification.
    pub fn excerpt(&self, max_len: usize) -> &str {
        if self.html.len() <= max_len {
            return &self.html;
        }
        let mut end = max_len;
        while !self.html.is_char_boundary(end) {
            end -= 1;
        }
        &self.html[..end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    Load,
    DomContentLoaded,
    NetworkIdle,
    Selector(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigateOptions {
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
    pub wait: WaitCondition,
    /// Extra settle time after the wait condition is met.
    #[serde(with = "crate::config::duration_ms")]
    pub settle: Duration,
    /// Solved CAPTCHA token to present with the request.
    pub captcha_token: Option<String>,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            wait: WaitCondition::Load,
            settle: Duration::ZERO,
            captcha_token: None,
        }
    }
}

/// Opaque handle to an engine session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrowserSession {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationErrorKind {
    Timeout,
    ConnectionRefused,
    Dns,
    Tls,
    Proxy,
    HttpStatus,
    EmptyResponse,
    Encoding,
    EngineCrash,
    Other,
}

impl NavigationErrorKind {
    /// Stable code matched by the fault classifier.
    pub fn code(self) -> &'static str {
        match self {
            NavigationErrorKind::Timeout => "ETIMEDOUT",
            NavigationErrorKind::ConnectionRefused => "ECONNREFUSED",
            NavigationErrorKind::Dns => "ENOTFOUND",
            NavigationErrorKind::Tls => "ERR_SSL_PROTOCOL_ERROR",
            NavigationErrorKind::Proxy => "ERR_PROXY_CONNECTION_FAILED",
            NavigationErrorKind::HttpStatus => "HTTP_STATUS",
            NavigationErrorKind::EmptyResponse => "ERR_EMPTY_RESPONSE",
            NavigationErrorKind::Encoding => "ERR_ENCODING",
            NavigationErrorKind::EngineCrash => "TARGET_CRASHED",
            NavigationErrorKind::Other => "UNKNOWN",
        }
    }
}

impl fmt::Display for NavigationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct NavigationError {
    pub kind: NavigationErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub page_excerpt: Option<String>,
}

impl NavigationError {
    pub fn new(kind: NavigationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            page_excerpt: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.page_excerpt = Some(excerpt.into());
        self
    }
}

/// Narrow contract the orchestrator needs from an automation engine.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn create_session(
        &self,
        agent: &AgentConfig,
        fingerprint: &BrowserFingerprint,
    ) -> Result<BrowserSession, NavigationError>;

    async fn navigate(
        &self,
        session: &BrowserSession,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<PageSnapshot, NavigationError>;

    async fn snapshot(&self, session: &BrowserSession) -> Result<PageSnapshot, NavigationError>;

    async fn close(&self, session: &BrowserSession);
}

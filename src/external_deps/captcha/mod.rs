//! Captcha provider integrations.
//!
//! Providers sit behind [`CaptchaProvider`]; [`BoundedCaptchaSolver`] wraps one
//! with a per-attempt timeout and an attempt budget that is independent of
//! navigation retries.

mod bounded;
mod twocaptcha;

pub use bounded::BoundedCaptchaSolver;
pub use twocaptcha::TwoCaptchaProvider;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    /// Budget for a single solve attempt.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// API key for the bundled 2Captcha provider.
    pub api_key: Option<String>,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            max_attempts: 2,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    ReCaptcha,
    HCaptcha,
    Turnstile,
    Image,
}

impl fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptchaKind::ReCaptcha => "recaptcha",
            CaptchaKind::HCaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
            CaptchaKind::Image => "image",
        };
        f.write_str(name)
    }
}

/// Challenge handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaTask {
    pub kind: CaptchaKind,
    pub site_key: Option<String>,
    /// Image source: a URL or a `data:` URI.
    pub image: Option<String>,
    pub page_url: Url,
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid captcha regex {pattern}: {err}"))
}

static SITE_KEY: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-sitekey\s*=\s*["']([^"']+)["']"#));
static RECAPTCHA_RENDER: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"recaptcha/api\.js\?[^"']*render=([A-Za-z0-9_\-]{20,})"#));
static CAPTCHA_IMAGE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"<img[^>]*(?:captcha)[^>]*\ssrc\s*=\s*["']([^"']+)["']|<img[^>]*\ssrc\s*=\s*["']([^"']*captcha[^"']*)["']"#)
});

impl CaptchaTask {
    pub fn new(kind: CaptchaKind, page_url: Url) -> Self {
        Self {
            kind,
            site_key: None,
            image: None,
            page_url,
        }
    }

    pub fn with_site_key(mut self, site_key: impl Into<String>) -> Self {
        self.site_key = Some(site_key.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Derive the challenge from page markup, if any is embedded.
    pub fn from_markup(html: &str, page_url: Url) -> Option<Self> {
        let lower = html.to_ascii_lowercase();
        let site_key = SITE_KEY
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|key| key.as_str().to_string());

        let kind = if lower.contains("cf-turnstile") || lower.contains("challenges.cloudflare.com/turnstile") {
            Some(CaptchaKind::Turnstile)
        } else if lower.contains("h-captcha") || lower.contains("hcaptcha.com") {
            Some(CaptchaKind::HCaptcha)
        } else if lower.contains("g-recaptcha") || lower.contains("recaptcha/api.js") {
            Some(CaptchaKind::ReCaptcha)
        } else {
            None
        };

        if let Some(kind) = kind {
            let site_key = site_key.or_else(|| {
                RECAPTCHA_RENDER
                    .captures(html)
                    .and_then(|caps| caps.get(1))
                    .map(|key| key.as_str().to_string())
            });
            return site_key.map(|key| CaptchaTask::new(kind, page_url).with_site_key(key));
        }

        let captures = CAPTCHA_IMAGE.captures(html)?;
        let src = captures.get(1).or_else(|| captures.get(2))?.as_str();
        let image = match page_url.join(src) {
            Ok(resolved) if !src.starts_with("data:") => resolved.to_string(),
            _ => src.to_string(),
        };
        Some(CaptchaTask::new(CaptchaKind::Image, page_url).with_image(image))
    }
}

/// Resolved captcha token and optional metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    pub token: String,
    pub metadata: HashMap<String, String>,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha unsolved after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },
    #[error("unsupported captcha task: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://market.example.com/listings").unwrap()
    }

    #[test]
    fn derives_widget_tasks_from_markup() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LcAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"></div>"#;
        let task = CaptchaTask::from_markup(html, page()).unwrap();
        assert_eq!(task.kind, CaptchaKind::ReCaptcha);
        assert_eq!(task.site_key.as_deref(), Some("6LcAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));

        let html = r#"<div class="cf-turnstile" data-sitekey='0x4AAAAAAA'></div>"#;
        assert_eq!(CaptchaTask::from_markup(html, page()).unwrap().kind, CaptchaKind::Turnstile);

        let html = r#"<div class="h-captcha" data-sitekey="10000000-ffff"></div>"#;
        assert_eq!(CaptchaTask::from_markup(html, page()).unwrap().kind, CaptchaKind::HCaptcha);
    }

    #[test]
    fn derives_image_tasks_with_absolute_urls() {
        let html = r#"<form><img id="captcha" src="/captcha/image.png"><input name="code"></form>"#;
        let task = CaptchaTask::from_markup(html, page()).unwrap();
        assert_eq!(task.kind, CaptchaKind::Image);
        assert_eq!(
            task.image.as_deref(),
            Some("https://market.example.com/captcha/image.png")
        );
        assert!(CaptchaTask::from_markup("<p>plain page</p>", page()).is_none());
    }
}

use async_trait::async_trait;
use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    BrowserEngine, BrowserSession, NavigateOptions, NavigationError, NavigationErrorKind,
    PageSnapshot, WaitCondition, snapshot_from_html,
};
use crate::modules::proxy::AgentConfig;
use crate::modules::spoofing::BrowserFingerprint;

const EXCERPT_LEN: usize = 4096;

#[derive(Debug)]
struct HttpSession {
    client: reqwest::Client,
    last: Option<PageSnapshot>,
}

/// Engine that fetches pages over HTTP through the leased proxy.
///
/// No script runs; pages are snapshotted from the returned markup.
#[derive(Debug, Default)]
pub struct HttpBrowserEngine {
    sessions: Mutex<HashMap<String, HttpSession>>,
    counter: AtomicU64,
}

impl HttpBrowserEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, HttpSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, session: &BrowserSession) -> Result<reqwest::Client, NavigationError> {
        self.sessions()
            .get(&session.id)
            .map(|state| state.client.clone())
            .ok_or_else(|| {
                NavigationError::new(
                    NavigationErrorKind::EngineCrash,
                    format!("session {} is closed", session.id),
                )
            })
    }
}

fn fingerprint_headers(fingerprint: &BrowserFingerprint) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&fingerprint.user_agent) {
        headers.insert(USER_AGENT, value);
    }
    if let Ok(value) = HeaderValue::from_str(&fingerprint.accept_language) {
        headers.insert(ACCEPT_LANGUAGE, value);
    }
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers
}

fn map_transport_error(err: reqwest::Error) -> NavigationError {
    let message = err.to_string();
    let lower = format!("{err:?}").to_ascii_lowercase();
    let kind = if err.is_timeout() {
        NavigationErrorKind::Timeout
    } else if lower.contains("dns") || lower.contains("resolve") {
        NavigationErrorKind::Dns
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        NavigationErrorKind::Tls
    } else if lower.contains("proxy") {
        NavigationErrorKind::Proxy
    } else if err.is_connect() {
        NavigationErrorKind::ConnectionRefused
    } else if err.is_decode() {
        NavigationErrorKind::Encoding
    } else {
        NavigationErrorKind::Other
    };
    NavigationError::new(kind, message)
}

fn selector_present(body: &str, selector: &str) -> bool {
    match scraper::Selector::parse(selector) {
        Ok(parsed) => scraper::Html::parse_document(body).select(&parsed).next().is_some(),
        Err(_) => true,
    }
}

#[async_trait]
impl BrowserEngine for HttpBrowserEngine {
    async fn create_session(
        &self,
        agent: &AgentConfig,
        fingerprint: &BrowserFingerprint,
    ) -> Result<BrowserSession, NavigationError> {
        let proxy = reqwest::Proxy::all(&agent.proxy_url)
            .map_err(|err| NavigationError::new(NavigationErrorKind::Proxy, err.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .default_headers(fingerprint_headers(fingerprint))
            .build()
            .map_err(|err| NavigationError::new(NavigationErrorKind::EngineCrash, err.to_string()))?;

        let id = format!("http-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        self.sessions()
            .insert(id.clone(), HttpSession { client, last: None });
        Ok(BrowserSession { id })
    }

    async fn navigate(
        &self,
        session: &BrowserSession,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<PageSnapshot, NavigationError> {
        let client = self.client(session)?;
        let mut request = client.get(url).timeout(options.timeout);
        if let Some(token) = &options.captcha_token {
            request = request.header("x-captcha-token", token.as_str());
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|err| {
            NavigationError::new(NavigationErrorKind::Encoding, err.to_string())
        })?;

        if !status.is_success() {
            let excerpt: String = body.chars().take(EXCERPT_LEN).collect();
            return Err(NavigationError::new(
                NavigationErrorKind::HttpStatus,
                format!("{} returned status {}", final_url, status.as_u16()),
            )
            .with_status(status.as_u16())
            .with_excerpt(excerpt));
        }
        if body.trim().is_empty() {
            return Err(NavigationError::new(
                NavigationErrorKind::EmptyResponse,
                format!("{final_url} returned an empty response"),
            )
            .with_status(status.as_u16()));
        }

        if !options.settle.is_zero() {
            tokio::time::sleep(options.settle).await;
        }

        let snapshot = snapshot_from_html(&final_url, status.as_u16(), &body);
        if let WaitCondition::Selector(selector) = &options.wait
            && !selector_present(&body, selector)
        {
            return Err(NavigationError::new(
                NavigationErrorKind::Other,
                format!("waiting for selector {selector} failed: selector not found"),
            )
            .with_status(status.as_u16())
            .with_excerpt(snapshot.excerpt(EXCERPT_LEN).to_string()));
        }

        if let Some(state) = self.sessions().get_mut(&session.id) {
            state.last = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    async fn snapshot(&self, session: &BrowserSession) -> Result<PageSnapshot, NavigationError> {
        self.sessions()
            .get(&session.id)
            .and_then(|state| state.last.clone())
            .ok_or_else(|| {
                NavigationError::new(
                    NavigationErrorKind::Other,
                    format!("session {} has not loaded a page", session.id),
                )
            })
    }

    async fn close(&self, session: &BrowserSession) {
        self.sessions().remove(&session.id);
    }
}

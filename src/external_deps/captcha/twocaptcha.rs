use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use std::time::Instant;

use super::{CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution, CaptchaTask};

const DEFAULT_ENDPOINT: &str = "https://2captcha.com";

/// Adapter for the 2Captcha `in.php` / `res.php` API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    api_key: String,
    endpoint: String,
    config: CaptchaConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: u8,
    request: String,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Point the provider at a compatible self-hosted endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    async fn image_body(&self, image: &str) -> Result<String, CaptchaError> {
        if let Some((_, data)) = image.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
            return Ok(data.to_string());
        }
        let bytes = self
            .client
            .get(image)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| CaptchaError::Provider(format!("image download failed: {err}")))?
            .bytes()
            .await
            .map_err(|err| CaptchaError::Provider(format!("image download failed: {err}")))?;
        Ok(STANDARD.encode(&bytes))
    }

    async fn submit(&self, task: &CaptchaTask) -> Result<String, CaptchaError> {
        let mut form: Vec<(&str, String)> = vec![
            ("key", self.api_key.clone()),
            ("json", "1".into()),
            ("pageurl", task.page_url.to_string()),
        ];
        let site_key = || {
            task.site_key
                .clone()
                .ok_or_else(|| CaptchaError::Unsupported(format!("{} task without site key", task.kind)))
        };
        match task.kind {
            CaptchaKind::ReCaptcha => {
                form.push(("method", "userrecaptcha".into()));
                form.push(("googlekey", site_key()?));
            }
            CaptchaKind::HCaptcha => {
                form.push(("method", "hcaptcha".into()));
                form.push(("sitekey", site_key()?));
            }
            CaptchaKind::Turnstile => {
                form.push(("method", "turnstile".into()));
                form.push(("sitekey", site_key()?));
            }
            CaptchaKind::Image => {
                let image = task
                    .image
                    .as_deref()
                    .ok_or_else(|| CaptchaError::Unsupported("image task without image".into()))?;
                form.push(("method", "base64".into()));
                form.push(("body", self.image_body(image).await?));
            }
        }

        let response: ApiResponse = self
            .client
            .post(format!("{}/in.php", self.endpoint))
            .form(&form)
            .send()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?
            .json()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;

        if response.status == 1 {
            Ok(response.request)
        } else {
            Err(CaptchaError::Provider(response.request))
        }
    }

    async fn poll(&self, id: &str) -> CaptchaResult {
        let started = Instant::now();
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let response: ApiResponse = self
                .client
                .get(format!("{}/res.php", self.endpoint))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", id),
                    ("json", "1"),
                ])
                .send()
                .await
                .map_err(|err| CaptchaError::Provider(err.to_string()))?
                .json()
                .await
                .map_err(|err| CaptchaError::Provider(err.to_string()))?;

            match (response.status, response.request.as_str()) {
                (1, token) => {
                    return Ok(CaptchaSolution::new(token).insert_metadata("task_id", id));
                }
                (_, "CAPCHA_NOT_READY") => {
                    if started.elapsed() >= self.config.timeout {
                        return Err(CaptchaError::Timeout(self.config.timeout));
                    }
                }
                (_, error) => return Err(CaptchaError::Provider(error.to_string())),
            }
        }
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration("missing 2captcha api key".into()));
        }
        let id = self.submit(task).await?;
        log::debug!("2captcha accepted {} task {id}", task.kind);
        self.poll(&id).await
    }
}

use std::sync::Arc;
use std::time::Duration;

use super::{CaptchaError, CaptchaProvider, CaptchaResult, CaptchaTask};

/// Provider wrapper enforcing a per-attempt timeout and a maximum attempt count.
#[derive(Clone)]
pub struct BoundedCaptchaSolver {
    provider: Arc<dyn CaptchaProvider>,
    timeout: Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for BoundedCaptchaSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCaptchaSolver")
            .field("provider", &self.provider.name())
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl BoundedCaptchaSolver {
    pub fn new(provider: Arc<dyn CaptchaProvider>, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            provider,
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        let mut last = CaptchaError::Provider("not attempted".into());
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.timeout, self.provider.solve(task)).await {
                Ok(Ok(solution)) => {
                    log::info!(
                        "{} solved {} captcha on attempt {attempt}",
                        self.provider.name(),
                        task.kind
                    );
                    return Ok(solution);
                }
                Ok(Err(err @ (CaptchaError::Configuration(_) | CaptchaError::Unsupported(_)))) => {
                    return Err(err);
                }
                Ok(Err(err)) => last = err,
                Err(_) => last = CaptchaError::Timeout(self.timeout),
            }
            log::debug!(
                "{} captcha attempt {attempt}/{} failed: {last}",
                self.provider.name(),
                self.max_attempts
            );
        }
        Err(CaptchaError::AttemptsExhausted {
            attempts: self.max_attempts,
            last: last.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::captcha::{CaptchaKind, CaptchaSolution};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
        hang: bool,
    }

    #[async_trait]
    impl CaptchaProvider for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if call >= self.succeed_on {
                Ok(CaptchaSolution::new("token"))
            } else {
                Err(CaptchaError::Provider("ERROR_CAPTCHA_UNSOLVABLE".into()))
            }
        }
    }

    fn task() -> CaptchaTask {
        CaptchaTask::new(CaptchaKind::ReCaptcha, Url::parse("https://example.com").unwrap())
            .with_site_key("key")
    }

    #[tokio::test]
    async fn retries_until_success() {
        let provider = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 2, hang: false });
        let solver = BoundedCaptchaSolver::new(provider.clone(), Duration::from_secs(5), 3);
        assert_eq!(solver.solve(&task()).await.unwrap().token, "token");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeouts() {
        let provider = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 1, hang: true });
        let solver = BoundedCaptchaSolver::new(provider.clone(), Duration::from_secs(10), 2);
        let err = solver.solve(&task()).await.unwrap_err();
        assert!(matches!(err, CaptchaError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}

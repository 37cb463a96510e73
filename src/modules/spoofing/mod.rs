//! Browser fingerprint generation for collector identities.
//!
//! An identity is a proxy plus a fingerprint. Fingerprints are kept stable per
//! proxy so a returning exit IP presents the same browser, and mobile proxies
//! only ever carry mobile browser templates.

use chrono::{DateTime, Utc};
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::modules::proxy::ProxyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserType {
    Chrome,
    Firefox,
    Safari,
    Edge,
    MobileChrome,
    MobileSafari,
}

impl BrowserType {
    fn is_mobile(self) -> bool {
        matches!(self, BrowserType::MobileChrome | BrowserType::MobileSafari)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserFingerprint {
    pub browser: BrowserType,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub screen_resolution: (u16, u16),
    pub timezone: String,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub canvas_fingerprint: String,
    pub audio_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Fresh fingerprint on every request.
    None,
    /// One fingerprint per proxy identity.
    Identity,
    /// One fingerprint for the whole collector.
    Global,
}

/// Generates fingerprints with configurable consistency.
#[derive(Debug)]
pub struct FingerprintGenerator {
    desktop_browsers: Vec<BrowserType>,
    consistency: ConsistencyLevel,
    cache: HashMap<String, BrowserFingerprint>,
    global: Option<BrowserFingerprint>,
}

impl FingerprintGenerator {
    pub fn new(desktop_browsers: Vec<BrowserType>) -> Self {
        let desktop_browsers = if desktop_browsers.is_empty() {
            vec![BrowserType::Chrome]
        } else {
            desktop_browsers
        };
        Self {
            desktop_browsers,
            consistency: ConsistencyLevel::Identity,
            cache: HashMap::new(),
            global: None,
        }
    }

    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = level;
        self
    }

    /// Fingerprint for the identity backed by `proxy_id`.
    pub fn fingerprint_for(&mut self, proxy_id: &str, proxy_type: ProxyType) -> BrowserFingerprint {
        match self.consistency {
            ConsistencyLevel::None => self.random_fingerprint(proxy_type),
            ConsistencyLevel::Global => {
                if let Some(existing) = &self.global {
                    return existing.clone();
                }
                let fingerprint = self.random_fingerprint(proxy_type);
                self.global = Some(fingerprint.clone());
                fingerprint
            }
            ConsistencyLevel::Identity => {
                if let Some(existing) = self.cache.get(proxy_id) {
                    return existing.clone();
                }
                let fingerprint = self.random_fingerprint(proxy_type);
                self.cache.insert(proxy_id.to_string(), fingerprint.clone());
                fingerprint
            }
        }
    }

    /// Drop the cached fingerprint so the next request gets a fresh one.
    pub fn invalidate(&mut self, proxy_id: &str) {
        self.cache.remove(proxy_id);
        if self.consistency == ConsistencyLevel::Global {
            self.global = None;
        }
    }

    fn random_fingerprint(&self, proxy_type: ProxyType) -> BrowserFingerprint {
        let mut rng = rand::thread_rng();
        let browser = if proxy_type == ProxyType::Mobile {
            *[BrowserType::MobileChrome, BrowserType::MobileSafari]
                .choose(&mut rng)
                .unwrap_or(&BrowserType::MobileChrome)
        } else {
            let desktop: Vec<BrowserType> = self
                .desktop_browsers
                .iter()
                .copied()
                .filter(|browser| !browser.is_mobile())
                .collect();
            desktop.choose(&mut rng).copied().unwrap_or(BrowserType::Chrome)
        };

        let template = template_for_browser(browser);
        let pick = |values: &[&str], fallback: &str, rng: &mut rand::rngs::ThreadRng| {
            values.choose(rng).copied().unwrap_or(fallback).to_string()
        };

        let screen_resolution = template
            .screen_resolutions
            .choose(&mut rng)
            .copied()
            .unwrap_or((1920, 1080));
        let accept_language = pick(template.accept_languages, "en-US,en;q=0.9", &mut rng);
        let timezone = pick(template.timezones, "UTC", &mut rng);
        let webgl_vendor = pick(template.webgl_vendors, "Google Inc.", &mut rng);
        let webgl_renderer = pick(template.webgl_renderers, "ANGLE (Intel(R) UHD Graphics 630)", &mut rng);
        let canvas_seed: u64 = rng.r#gen();
        let audio_seed: u64 = rng.r#gen();

        BrowserFingerprint {
            browser,
            user_agent: template.user_agent.to_string(),
            accept_language,
            platform: template.platform.to_string(),
            screen_resolution,
            timezone,
            webgl_vendor,
            webgl_renderer,
            canvas_fingerprint: format!("canvas-{canvas_seed:016x}"),
            audio_fingerprint: format!("audio-{audio_seed:016x}"),
            created_at: Utc::now(),
        }
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new(vec![BrowserType::Chrome, BrowserType::Firefox, BrowserType::Edge])
    }
}

struct FingerprintTemplate {
    user_agent: &'static str,
    platform: &'static str,
    accept_languages: &'static [&'static str],
    screen_resolutions: &'static [(u16, u16)],
    timezones: &'static [&'static str],
    webgl_vendors: &'static [&'static str],
    webgl_renderers: &'static [&'static str],
}

fn template_for_browser(browser: BrowserType) -> FingerprintTemplate {
    match browser {
        BrowserType::Chrome | BrowserType::Edge => FingerprintTemplate {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            platform: "Win32",
            accept_languages: &["en-US,en;q=0.9", "en-GB,en;q=0.8"],
            screen_resolutions: &[(1920, 1080), (2560, 1440), (1366, 768)],
            timezones: &["America/New_York", "Europe/Berlin", "Asia/Tokyo"],
            webgl_vendors: &["Google Inc.", "Microsoft"],
            webgl_renderers: &["ANGLE (NVIDIA GeForce RTX 3080)", "ANGLE (AMD Radeon RX 6800)"],
        },
        BrowserType::Firefox => FingerprintTemplate {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
            platform: "Win64",
            accept_languages: &["en-US,en;q=0.8", "fr-FR,fr;q=0.7"],
            screen_resolutions: &[(1920, 1080), (1680, 1050)],
            timezones: &["America/Los_Angeles", "Europe/London"],
            webgl_vendors: &["Mozilla", "Google Inc."],
            webgl_renderers: &["ANGLE (NVIDIA GeForce GTX 1050 Ti)", "ANGLE (Intel(R) UHD Graphics 630)"],
        },
        BrowserType::Safari => FingerprintTemplate {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
            platform: "MacIntel",
            accept_languages: &["en-US,en;q=0.9", "en-AU,en;q=0.8"],
            screen_resolutions: &[(2560, 1600), (2880, 1800)],
            timezones: &["America/Los_Angeles", "Australia/Sydney"],
            webgl_vendors: &["Apple"],
            webgl_renderers: &["Apple GPU", "Metal Renderer"],
        },
        BrowserType::MobileChrome => FingerprintTemplate {
            user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 8 Pro) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
            platform: "Linux armv8l",
            accept_languages: &["en-US,en;q=0.8", "es-ES,es;q=0.7"],
            screen_resolutions: &[(1080, 2400), (1344, 2992)],
            timezones: &["America/New_York", "Europe/Madrid"],
            webgl_vendors: &["Qualcomm", "ARM"],
            webgl_renderers: &["Adreno (TM) 740", "Mali-G715"],
        },
        BrowserType::MobileSafari => FingerprintTemplate {
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
            platform: "iPhone",
            accept_languages: &["en-US,en;q=0.9", "ja-JP,ja;q=0.8"],
            screen_resolutions: &[(1170, 2532), (1179, 2556)],
            timezones: &["America/Chicago", "Asia/Tokyo"],
            webgl_vendors: &["Apple"],
            webgl_renderers: &["Apple A17 GPU", "Apple A16 GPU"],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_stable_per_identity() {
        let mut generator = FingerprintGenerator::default();
        let fp1 = generator.fingerprint_for("proxy-a", ProxyType::Residential);
        let fp2 = generator.fingerprint_for("proxy-a", ProxyType::Residential);
        let fp3 = generator.fingerprint_for("proxy-b", ProxyType::Residential);
        assert_eq!(fp1, fp2);
        assert_ne!(fp1.canvas_fingerprint, fp3.canvas_fingerprint);

        generator.invalidate("proxy-a");
        let fp4 = generator.fingerprint_for("proxy-a", ProxyType::Residential);
        assert_ne!(fp1.canvas_fingerprint, fp4.canvas_fingerprint);
    }

    #[test]
    fn mobile_proxies_get_mobile_browsers() {
        let mut generator = FingerprintGenerator::default().with_consistency(ConsistencyLevel::None);
        for _ in 0..10 {
            let fp = generator.fingerprint_for("m", ProxyType::Mobile);
            assert!(fp.browser.is_mobile());
            let fp = generator.fingerprint_for("d", ProxyType::Datacenter);
            assert!(!fp.browser.is_mobile());
        }
    }
}

//! Integrations that rely on third-party services.
//!
//! Adapters for the browser automation engine and captcha providers. The core
//! only talks to them through the traits defined here.

pub mod browser;
pub mod captcha;

pub use browser::{BrowserEngine, HttpBrowserEngine, NavigationError, PageSnapshot};
pub use captcha::{BoundedCaptchaSolver, CaptchaProvider, TwoCaptchaProvider};

//! Pattern-table fault classification.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use super::{ErrorClassification, ErrorType, Fault};
use crate::external_deps::browser::PageSnapshot;

/// Signature set for one fault type, matched against the fault's own text.
#[derive(Debug, Clone)]
struct FaultPattern {
    id: String,
    error_type: ErrorType,
    patterns: Vec<Regex>,
}

impl FaultPattern {
    fn new(id: impl Into<String>, error_type: ErrorType, raw_patterns: &[&str]) -> Self {
        Self {
            id: id.into(),
            error_type,
            patterns: raw_patterns.iter().map(|pattern| build_regex(pattern)).collect(),
        }
    }

    fn first_match(&self, haystack: &str) -> Option<String> {
        first_match(&self.patterns, haystack)
    }
}

fn first_match(patterns: &[Regex], haystack: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|regex| regex.find(haystack))
        .map(|found| found.as_str().to_string())
}

/// Ordered table: the first matching entry wins, so categories are listed
/// detection, network, parsing, resource, behavioral.
static KNOWN_PATTERNS: Lazy<Vec<FaultPattern>> = Lazy::new(|| {
    vec![
        FaultPattern::new(
            "detection_captcha",
            ErrorType::Captcha,
            &[
                r"g-recaptcha|h-captcha|cf-turnstile",
                r"\bcaptcha\b",
                r"verify (that )?you are (a )?human|are you a (human|robot)|i'?m not a robot",
            ],
        ),
        FaultPattern::new(
            "detection_rate_limit",
            ErrorType::RateLimit,
            &[
                r"rate.?limit(ed)?",
                r"too many requests",
                r"status 429\b",
                r"slow down|request limit (reached|exceeded)",
            ],
        ),
        FaultPattern::new(
            "detection_ban",
            ErrorType::Ban,
            &[
                r"access (denied|forbidden)",
                r"status 403\b",
                r"you have been (blocked|banned)|your (ip|access) (has been|is) (blocked|banned)",
                r"\bbanned\b",
            ],
        ),
        FaultPattern::new(
            "detection_behavioral",
            ErrorType::BehavioralDetection,
            &[
                r"unusual (traffic|activity)",
                r"automated (queries|access|traffic|requests)",
                r"bot (detected|activity)|suspicious activity",
                r"headless (browser|chrome) detected",
            ],
        ),
        FaultPattern::new(
            "detection_honeypot",
            ErrorType::Honeypot,
            &[r"honeypot", r"trap link", r"hidden field (filled|triggered)"],
        ),
        FaultPattern::new(
            "network_timeout",
            ErrorType::Timeout,
            &[r"ETIMEDOUT", r"timed? ?out", r"deadline (has )?(elapsed|exceeded)"],
        ),
        FaultPattern::new(
            "network_refused",
            ErrorType::ConnectionRefused,
            &[r"ECONNREFUSED|ECONNRESET", r"connection (refused|reset|closed)"],
        ),
        FaultPattern::new(
            "network_dns",
            ErrorType::DnsFailure,
            &[r"ENOTFOUND|EAI_AGAIN|ERR_NAME_NOT_RESOLVED", r"\bdns\b", r"name (not|could not be) resolved"],
        ),
        FaultPattern::new(
            "network_tls",
            ErrorType::TlsError,
            &[r"ERR_SSL|ERR_CERT", r"\b(tls|ssl)\b", r"certificate"],
        ),
        FaultPattern::new(
            "network_proxy",
            ErrorType::ProxyError,
            &[r"ERR_PROXY|ERR_TUNNEL", r"proxy (error|connection|authentication)", r"status 407\b"],
        ),
        FaultPattern::new(
            "parsing_selector",
            ErrorType::SelectorNotFound,
            &[
                r"selector.{0,80}not found",
                r"no (element|node)s? (found )?(for|matching) selector",
                r"waiting for selector",
            ],
        ),
        FaultPattern::new(
            "parsing_structure",
            ErrorType::StructureChanged,
            &[r"unexpected (structure|layout|format|markup)", r"(structure|layout) (has )?changed"],
        ),
        FaultPattern::new(
            "parsing_empty",
            ErrorType::EmptyResponse,
            &[r"ERR_EMPTY_RESPONSE", r"empty (response|page|body|document)", r"no content"],
        ),
        FaultPattern::new(
            "parsing_encoding",
            ErrorType::EncodingError,
            &[r"ERR_ENCODING", r"invalid utf-?8", r"(decode|decoding|encoding) (error|failed)"],
        ),
        FaultPattern::new(
            "resource_memory",
            ErrorType::MemoryExhausted,
            &[r"ENOMEM", r"out of memory", r"heap (limit|out of memory)|memory (exhausted|limit)"],
        ),
        FaultPattern::new(
            "resource_cpu",
            ErrorType::CpuExhausted,
            &[r"cpu (exhausted|limit|overload)", r"load too high"],
        ),
        FaultPattern::new(
            "resource_disk",
            ErrorType::DiskExhausted,
            &[r"ENOSPC", r"no space left", r"disk (full|quota)"],
        ),
        FaultPattern::new(
            "resource_crash",
            ErrorType::EngineCrash,
            &[
                r"TARGET_CRASHED",
                r"(page|browser|target) (crashed|closed|disconnected)",
                r"session .{0,40}(is )?closed",
            ],
        ),
        FaultPattern::new(
            "behavioral_too_fast",
            ErrorType::TooFast,
            &[r"too fast", r"requests? too quickly"],
        ),
        FaultPattern::new(
            "behavioral_consistent",
            ErrorType::TooConsistent,
            &[r"too consistent", r"regular (request )?interval", r"robotic timing"],
        ),
        FaultPattern::new(
            "behavioral_navigation",
            ErrorType::SuspiciousNavigation,
            &[r"suspicious navigation", r"direct (page )?access", r"missing referr?er"],
        ),
        FaultPattern::new(
            "behavioral_interactions",
            ErrorType::MissingInteractions,
            &[r"no (mouse|scroll|pointer) (movement|events?|activity)", r"missing interactions"],
        ),
    ]
});

/// Statuses anti-bot walls are served with. 429 is a wall on its own.
const CHALLENGE_STATUSES: [u16; 3] = [403, 429, 503];

/// Element that hosts a challenge widget.
static CHALLENGE_CONTAINER: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r#"<[a-z][a-z0-9]*\s[^>]*\b(?:class|id)\s*=\s*["'][^"']*\b(g-recaptcha|h-captcha|cf-turnstile|cf-challenge|challenge-form|px-captcha)\b"#,
    )
});

static TITLE_TAG: Lazy<Regex> = Lazy::new(|| build_regex(r"<title[^>]*>([^<]{0,200})</title>"));

/// Titles made up of a challenge phrase, optionally followed by a site suffix.
static CHALLENGE_TITLES: Lazy<Vec<(ErrorType, Regex)>> = Lazy::new(|| {
    let mainly = |phrases: &str| build_regex(&format!(r"\A\W*(?:{phrases})\W*(?:[|:\-]\s*[^|:]{{0,60}})?\z"));
    vec![
        (ErrorType::RateLimit, mainly(r"too many requests|rate limit(?:ed| exceeded)?")),
        (
            ErrorType::Ban,
            mainly(r"access denied|access to this page has been denied|you have been (?:blocked|banned)|request blocked|(?:403 )?forbidden"),
        ),
        (
            ErrorType::Captcha,
            mainly(r"captcha|are you a (?:human|robot)|verify (?:that )?you are (?:a )?human|human verification|i'?m not a robot"),
        ),
        (
            ErrorType::BehavioralDetection,
            mainly(r"just a moment|attention required|security check|checking your browser|pardon our interruption|one more step"),
        ),
    ]
});

/// Sentences block pages use. Only trusted alongside a challenge status or an existing fault.
static BLOCK_PHRASES: Lazy<Vec<(ErrorType, Vec<Regex>)>> = Lazy::new(|| {
    let table: [(ErrorType, &[&str]); 4] = [
        (
            ErrorType::RateLimit,
            &[r"too many requests", r"request limit (?:reached|exceeded)", r"you are being rate limited"],
        ),
        (
            ErrorType::Ban,
            &[
                r"you have been (?:blocked|banned)",
                r"your (?:ip|access|request) (?:address )?(?:has been|is|was) (?:blocked|banned|denied)",
                r"access (?:denied|forbidden)",
            ],
        ),
        (
            ErrorType::Captcha,
            &[
                r"verify (?:that )?you are (?:a )?human",
                r"are you a (?:human|robot)",
                r"i'?m not a robot",
                r"complete the security check",
            ],
        ),
        (
            ErrorType::BehavioralDetection,
            &[
                r"unusual (?:traffic|activity) from your",
                r"automated (?:queries|access|traffic|requests)",
                r"headless (?:browser|chrome) detected",
                r"checking your browser before",
            ],
        ),
    ];
    table
        .into_iter()
        .map(|(error_type, raw)| (error_type, raw.iter().map(|pattern| build_regex(pattern)).collect()))
        .collect()
});

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid fault classification regex `{}`: {}", pattern, err))
}

fn challenge_container(markup: &str) -> Option<String> {
    CHALLENGE_CONTAINER
        .captures(markup)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
}

fn block_phrase(markup: &str) -> Option<(ErrorType, String)> {
    BLOCK_PHRASES
        .iter()
        .find_map(|(error_type, patterns)| first_match(patterns, markup).map(|matched| (*error_type, matched)))
}

fn challenge_title(title: &str) -> Option<(ErrorType, String)> {
    let title = title.trim();
    CHALLENGE_TITLES
        .iter()
        .find(|(_, regex)| regex.is_match(title))
        .map(|(error_type, _)| (*error_type, title.to_string()))
}

/// Evidence that a page is an anti-bot wall rather than content.
///
/// A page qualifies when its title is mostly a challenge phrase, or when it
/// was served with a challenge status and carries a challenge widget or a
/// blocking sentence. A widget wins over the other signals since it can be
/// solved.
fn challenge_wall(status: Option<u16>, title: Option<&str>, markup: Option<&str>) -> Option<(ErrorType, String)> {
    let container = markup.and_then(challenge_container);
    let prefer_captcha = |(error_type, evidence): (ErrorType, String)| match &container {
        Some(widget) => (ErrorType::Captcha, format!("{evidence} ({widget})")),
        None => (error_type, evidence),
    };

    if let Some(found) = title.and_then(challenge_title) {
        return Some(prefer_captcha(found));
    }
    let status = status.filter(|status| CHALLENGE_STATUSES.contains(status))?;
    if let Some(widget) = &container {
        return Some((ErrorType::Captcha, format!("status {status} with {widget}")));
    }
    if let Some(found) = markup.and_then(block_phrase) {
        return Some(found);
    }
    (status == 429).then(|| (ErrorType::RateLimit, "status 429".to_string()))
}

/// Maps faults onto the error taxonomy.
#[derive(Debug, Clone)]
pub struct FaultClassifier {
    patterns: Vec<FaultPattern>,
}

impl FaultClassifier {
    pub fn new() -> Self {
        Self {
            patterns: KNOWN_PATTERNS.clone(),
        }
    }

    /// Register an extra signature, checked before the built-in table.
    pub fn add_pattern(&mut self, error_type: ErrorType, raw_patterns: &[&str]) {
        let pattern = FaultPattern::new(
            format!("custom_{}_{}", error_type, self.patterns.len()),
            error_type,
            raw_patterns,
        );
        self.patterns.insert(0, pattern);
    }

    fn classified(fault: &Fault, id: &str, error_type: ErrorType, matched: Option<String>) -> ErrorClassification {
        log::debug!(
            "fault '{}' matched {} ({}/{})",
            fault,
            id,
            error_type.category(),
            error_type
        );
        ErrorClassification {
            category: error_type.category(),
            error_type,
            matched_pattern: matched,
            strategies: error_type.strategies(),
        }
    }

    /// Wall markers on the page first, then the fault text, then weaker
    /// markup evidence for faults the text alone does not explain.
    pub fn classify(&self, fault: &Fault) -> ErrorClassification {
        let markup = fault.markup();
        let title = fault
            .page
            .as_ref()
            .and_then(|page| page.title.clone())
            .or_else(|| {
                markup
                    .and_then(|markup| TITLE_TAG.captures(markup))
                    .and_then(|captures| captures.get(1))
                    .map(|found| found.as_str().to_string())
            });
        if let Some((error_type, evidence)) = challenge_wall(fault.status, title.as_deref(), markup) {
            return Self::classified(fault, "challenge_wall", error_type, Some(evidence));
        }

        let mut text = fault.message.clone();
        if let Some(code) = &fault.code {
            text.push(' ');
            text.push_str(code);
        }
        if let Some(status) = fault.status {
            text.push_str(&format!(" status {status}"));
        }
        for pattern in &self.patterns {
            if let Some(matched) = pattern.first_match(&text) {
                return Self::classified(fault, &pattern.id, pattern.error_type, Some(matched));
            }
        }

        if let Some(markup) = markup {
            if let Some(widget) = challenge_container(markup) {
                return Self::classified(fault, "challenge_widget", ErrorType::Captcha, Some(widget));
            }
            if let Some((error_type, matched)) = block_phrase(markup) {
                return Self::classified(fault, "block_phrase", error_type, Some(matched));
            }
        }

        log::debug!("fault '{}' is unclassified", fault);
        ErrorClassification {
            category: ErrorType::Unknown.category(),
            error_type: ErrorType::Unknown,
            matched_pattern: None,
            strategies: ErrorType::Unknown.strategies(),
        }
    }

    /// Turn a page that loaded but is really an anti-bot wall into a fault.
    pub fn detect_soft_block(&self, page: &Arc<PageSnapshot>) -> Option<Fault> {
        let (error_type, evidence) = challenge_wall(
            Some(page.status),
            page.title.as_deref(),
            Some(page.excerpt(16 * 1024)),
        )?;
        Some(
            Fault::new(format!("soft block on {}: {error_type} wall ({evidence})", page.url))
                .with_status(page.status)
                .with_page(Arc::clone(page)),
        )
    }
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::browser::{NavigationError, NavigationErrorKind, snapshot_from_html};
    use crate::recovery::{ErrorCategory, RecoveryStrategyKind};

    #[test]
    fn classifies_by_category_order() {
        let classifier = FaultClassifier::new();
        let cases = [
            ("net::ERR_CONNECTION_REFUSED connection refused", ErrorType::ConnectionRefused),
            ("Navigation timeout of 30000 ms exceeded", ErrorType::Timeout),
            ("waiting for selector `.price` failed: selector not found", ErrorType::SelectorNotFound),
            ("Too Many Requests", ErrorType::RateLimit),
            ("Protocol error: Target closed", ErrorType::EngineCrash),
            ("JavaScript heap out of memory", ErrorType::MemoryExhausted),
            ("requests arriving too fast", ErrorType::TooFast),
        ];
        for (message, expected) in cases {
            let classification = classifier.classify(&Fault::new(message));
            assert_eq!(classification.error_type, expected, "{message}");
            assert_eq!(classification.category, expected.category());
        }
    }

    #[test]
    fn captcha_markup_is_detection() {
        let classifier = FaultClassifier::new();
        let fault = Fault::new("navigation returned challenge page")
            .with_excerpt(r#"<div class="g-recaptcha" data-sitekey="abc"></div>"#);
        let classification = classifier.classify(&fault);
        assert_eq!(classification.category, ErrorCategory::Detection);
        assert_eq!(classification.error_type, ErrorType::Captcha);
        assert_eq!(classification.strategies[0], RecoveryStrategyKind::SolveCaptcha);
        let captcha_pos = classification
            .strategies
            .iter()
            .position(|s| *s == RecoveryStrategyKind::SolveCaptcha);
        let rotate_pos = classification
            .strategies
            .iter()
            .position(|s| *s == RecoveryStrategyKind::RotateIdentity);
        assert!(captcha_pos < rotate_pos);
    }

    #[test]
    fn status_codes_from_navigation_errors() {
        let classifier = FaultClassifier::new();
        let err = NavigationError::new(NavigationErrorKind::HttpStatus, "https://x.test returned status 429")
            .with_status(429);
        assert_eq!(classifier.classify(&Fault::from(err)).error_type, ErrorType::RateLimit);

        let unknown = classifier.classify(&Fault::new("something odd happened"));
        assert_eq!(unknown.category, ErrorCategory::Unknown);
        assert!(!unknown.strategies.is_empty());
    }

    #[test]
    fn soft_blocks_are_detected_from_page_content() {
        let classifier = FaultClassifier::new();
        let page = Arc::new(snapshot_from_html(
            "https://x.test/list",
            200,
            "<html><head><title>Access denied</title></head><body><p>Your IP has been blocked</p></body></html>",
        ));
        let fault = classifier.detect_soft_block(&page).unwrap();
        assert_eq!(classifier.classify(&fault).error_type, ErrorType::Ban);

        let clean = Arc::new(snapshot_from_html(
            "https://x.test/list",
            200,
            "<html><body><div class='listing'>Widget shop</div></body></html>",
        ));
        assert!(classifier.detect_soft_block(&clean).is_none());
    }

    #[test]
    fn custom_patterns_take_precedence() {
        let mut classifier = FaultClassifier::new();
        classifier.add_pattern(ErrorType::Honeypot, &[r"forbidden link clicked"]);
        let classification = classifier.classify(&Fault::new("forbidden link clicked"));
        assert_eq!(classification.error_type, ErrorType::Honeypot);
    }

    fn page(status: u16, html: &str) -> Arc<PageSnapshot> {
        Arc::new(snapshot_from_html("https://books.example.com/catalog", status, html))
    }

    #[test]
    fn ordinary_pages_mentioning_blocks_are_not_walls() {
        let classifier = FaultClassifier::new();
        let contact_form = page(
            200,
            r#"<html><head><title>Listings | Books</title>
               <script src="https://www.google.com/recaptcha/api.js" async defer></script></head>
               <body><div class="listing"><h2>Widget shop</h2></div>
               <form><div class="g-recaptcha" data-sitekey="6Lc-contact"></div><p>Contact us, no captcha bots please</p></form>
               </body></html>"#,
        );
        assert!(classifier.detect_soft_block(&contact_form).is_none());

        let banned_books = page(
            200,
            "<html><head><title>Banned books store</title></head><body><p>Books once banned, rate limits on loans apply</p></body></html>",
        );
        assert!(classifier.detect_soft_block(&banned_books).is_none());

        let maintenance = page(503, "<html><head><title>Back soon</title></head><body><p>Down for maintenance</p></body></html>");
        assert!(classifier.detect_soft_block(&maintenance).is_none());
    }

    #[test]
    fn challenge_status_with_a_widget_is_a_captcha_wall() {
        let classifier = FaultClassifier::new();
        let wall = page(
            403,
            r#"<html><head><title>books.example.com</title></head><body><div id="challenge-form"><div class="cf-turnstile" data-sitekey="0x4AAA"></div></div></body></html>"#,
        );
        let fault = classifier.detect_soft_block(&wall).unwrap();
        let classification = classifier.classify(&fault);
        assert_eq!(classification.error_type, ErrorType::Captcha);
        assert_eq!(classification.strategies[0], RecoveryStrategyKind::SolveCaptcha);

        let throttled = page(429, "<html><body><p>Please come back later</p></body></html>");
        let fault = classifier.detect_soft_block(&throttled).unwrap();
        assert_eq!(classifier.classify(&fault).error_type, ErrorType::RateLimit);

        let moment = page(200, "<html><head><title>Just a moment...</title></head><body></body></html>");
        let fault = classifier.detect_soft_block(&moment).unwrap();
        assert_eq!(classifier.classify(&fault).error_type, ErrorType::BehavioralDetection);
    }

    #[test]
    fn fault_text_wins_over_widgets_on_content_pages() {
        let classifier = FaultClassifier::new();
        let fault = Fault::new("selector '.price' not found on https://books.example.com/catalog")
            .with_selector(".price")
            .with_status(200)
            .with_page(page(
                200,
                r#"<html><head><title>Catalog</title></head><body><form><div class="g-recaptcha" data-sitekey="k"></div></form></body></html>"#,
            ));
        assert_eq!(classifier.classify(&fault).error_type, ErrorType::SelectorNotFound);
    }
}


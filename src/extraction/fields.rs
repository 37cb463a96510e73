//! Field rules and typed value parsing.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::Selector;
use serde::{Deserialize, Serialize};
use url::Url;

use super::ExtractionError;

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid value regex `{pattern}`: {err}"))
}

static AMOUNT: Lazy<Regex> = Lazy::new(|| build_regex(r"(-?\d[\d,]*(?:\.\d+)?|-?\.\d+)\s*([kmb])?(?:\b|$)"));
static MONTHLY: Lazy<Regex> =
    Lazy::new(|| build_regex(r"/\s*mo(?:nth)?\b|\bper\s+month\b|\bmonthly\b|\bp/m\b|\ba\s+month\b"));
static ANNUAL: Lazy<Regex> = Lazy::new(|| {
    build_regex(r"/\s*(?:yr|year|annum)\b|\bper\s+(?:year|annum)\b|\bannual(?:ly)?\b|\byearly\b|\bp\.?a\.?(?:\s|$)")
});

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|_| ExtractionError::InvalidSelector {
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Integer,
    Currency,
    Percentage,
    Url,
}

/// Billing period attached to a currency amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyPeriod {
    #[default]
    OneOff,
    Monthly,
    Annual,
}

impl CurrencyPeriod {
    pub fn annual_factor(self) -> f64 {
        match self {
            CurrencyPeriod::Monthly => 12.0,
            CurrencyPeriod::OneOff | CurrencyPeriod::Annual => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Currency { amount: f64, period: CurrencyPeriod },
    Percentage(f64),
    Url(String),
}

impl FieldValue {
    /// Numeric value as written; currency amounts keep their period.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) | FieldValue::Percentage(value) => Some(*value),
            FieldValue::Integer(value) => Some(*value as f64),
            FieldValue::Currency { amount, .. } => Some(*amount),
            FieldValue::Text(_) | FieldValue::Url(_) => None,
        }
    }

    /// Numeric value with recurring currency amounts scaled to a year.
    pub fn annualized(&self) -> Option<f64> {
        match self {
            FieldValue::Currency { amount, period } => Some(amount * period.annual_factor()),
            other => other.as_f64(),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Currency { .. } => FieldKind::Currency,
            FieldValue::Percentage(_) => FieldKind::Percentage,
            FieldValue::Url(_) => FieldKind::Url,
        }
    }
}

fn first_amount(raw: &str) -> Option<f64> {
    let captures = AMOUNT.captures(raw)?;
    let digits: String = captures[1].chars().filter(|c| *c != ',').collect();
    let value: f64 = digits.parse().ok()?;
    let scale = match captures.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(suffix) if suffix == "k" => 1e3,
        Some(suffix) if suffix == "m" => 1e6,
        Some(suffix) if suffix == "b" => 1e9,
        _ => 1.0,
    };
    Some(value * scale)
}

fn currency_period(raw: &str) -> CurrencyPeriod {
    if MONTHLY.is_match(raw) {
        CurrencyPeriod::Monthly
    } else if ANNUAL.is_match(raw) {
        CurrencyPeriod::Annual
    } else {
        CurrencyPeriod::OneOff
    }
}

/// Parse raw text into a typed value. `base` resolves relative URLs.
pub fn parse_value(kind: FieldKind, raw: &str, base: Option<&Url>) -> Option<FieldValue> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match kind {
        FieldKind::Text => {
            let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            Some(FieldValue::Text(text))
        }
        FieldKind::Number => first_amount(raw).map(FieldValue::Number),
        FieldKind::Integer => {
            let value = first_amount(raw)?;
            (value.fract().abs() < f64::EPSILON).then_some(FieldValue::Integer(value as i64))
        }
        FieldKind::Currency => first_amount(raw).map(|amount| FieldValue::Currency {
            amount,
            period: currency_period(raw),
        }),
        FieldKind::Percentage => first_amount(raw).map(FieldValue::Percentage),
        FieldKind::Url => {
            let parsed = match base {
                Some(base) => base.join(raw).ok(),
                None => Url::parse(raw).ok(),
            }?;
            matches!(parsed.scheme(), "http" | "https").then(|| FieldValue::Url(parsed.to_string()))
        }
    }
}

/// Constraints a value must meet to be kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Validation {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    /// Regex the raw text must match.
    pub pattern: Option<String>,
}

impl Validation {
    pub(crate) fn accepts(&self, value: &FieldValue, raw: &str, pattern: Option<&Regex>) -> bool {
        if let Some(number) = value.as_f64() {
            if self.min.is_some_and(|min| number < min) || self.max.is_some_and(|max| number > max) {
                return false;
            }
            if !number.is_finite() {
                return false;
            }
        }
        let len = raw.trim().chars().count();
        if self.min_len.is_some_and(|min| len < min) || self.max_len.is_some_and(|max| len > max) {
            return false;
        }
        pattern.is_none_or(|pattern| pattern.is_match(raw))
    }
}

/// How to find, type and validate one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub selector: Option<String>,
    /// Regex over the record text; group 1 is the value when present.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Label words that precede the value in prose.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub required: bool,
}

fn default_importance() -> f64 {
    1.0
}

impl FieldRule {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            selector: None,
            pattern: None,
            keywords: Vec::new(),
            validation: Validation::default(),
            importance: default_importance(),
            required: false,
        }
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn validation(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = importance.max(0.0);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub(crate) fn compile(&self) -> Result<CompiledRule, ExtractionError> {
        if !self.importance.is_finite() || self.importance < 0.0 {
            return Err(ExtractionError::InvalidImportance {
                field: self.name.clone(),
                importance: self.importance,
            });
        }
        let compile = |pattern: &String| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ExtractionError::InvalidPattern {
                    field: self.name.clone(),
                    source,
                })
        };
        if let Some(selector) = &self.selector {
            parse_selector(selector)?;
        }
        Ok(CompiledRule {
            pattern: self.pattern.as_ref().map(compile).transpose()?,
            validation: self.validation.pattern.as_ref().map(compile).transpose()?,
        })
    }
}

/// Regexes of a [`FieldRule`], compiled once per extraction.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub pattern: Option<Regex>,
    pub validation: Option<Regex>,
}

impl CompiledRule {
    /// Value text matched by the field pattern in `text`.
    pub fn capture<'t>(&self, text: &'t str) -> Option<&'t str> {
        let captures = self.pattern.as_ref()?.captures(text)?;
        captures.get(1).or_else(|| captures.get(0)).map(|m| m.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_currency_periods() {
        assert_eq!(
            parse_value(FieldKind::Currency, "$5,000/mo", None),
            Some(FieldValue::Currency {
                amount: 5_000.0,
                period: CurrencyPeriod::Monthly
            })
        );
        assert_eq!(
            parse_value(FieldKind::Currency, "$60k per year", None),
            Some(FieldValue::Currency {
                amount: 60_000.0,
                period: CurrencyPeriod::Annual
            })
        );
        assert_eq!(
            parse_value(FieldKind::Currency, "$120,000", None),
            Some(FieldValue::Currency {
                amount: 120_000.0,
                period: CurrencyPeriod::OneOff
            })
        );
        assert_eq!(
            parse_value(FieldKind::Currency, "$1.2M", None).and_then(|v| v.annualized()),
            Some(1_200_000.0)
        );
        assert_eq!(parse_value(FieldKind::Currency, "contact us", None), None);
    }

    #[test]
    fn parses_other_kinds() {
        let base = Url::parse("https://market.example.com/listings/").unwrap();
        assert_eq!(
            parse_value(FieldKind::Url, "/listing/42", Some(&base)),
            Some(FieldValue::Url("https://market.example.com/listing/42".into()))
        );
        assert_eq!(parse_value(FieldKind::Url, "javascript:void(0)", Some(&base)), None);
        assert_eq!(parse_value(FieldKind::Integer, "1,024 visitors", None), Some(FieldValue::Integer(1_024)));
        assert_eq!(parse_value(FieldKind::Integer, "2.5", None), None);
        assert_eq!(parse_value(FieldKind::Percentage, "35% margin", None), Some(FieldValue::Percentage(35.0)));
        assert_eq!(
            parse_value(FieldKind::Text, "  Widget \n shop ", None),
            Some(FieldValue::Text("Widget shop".into()))
        );
    }

    #[test]
    fn importance_must_be_a_finite_weight() {
        let unbounded = FieldRule::new("price", FieldKind::Currency).importance(f64::INFINITY);
        assert!(matches!(
            unbounded.compile(),
            Err(ExtractionError::InvalidImportance { ref field, .. }) if field == "price"
        ));

        let mut undefined = FieldRule::new("title", FieldKind::Text);
        undefined.importance = f64::NAN;
        let schema = crate::extraction::ExtractionSchema::new().field(undefined);
        assert!(matches!(schema.validate(), Err(ExtractionError::InvalidImportance { .. })));

        let ignored = FieldRule::new("notes", FieldKind::Text).importance(-3.0);
        assert_eq!(ignored.importance, 0.0);
        assert!(ignored.compile().is_ok());
    }

    #[test]
    fn validation_bounds_values() {
        let validation = Validation {
            min: Some(1.0),
            max: Some(100.0),
            ..Validation::default()
        };
        assert!(validation.accepts(&FieldValue::Number(50.0), "50", None));
        assert!(!validation.accepts(&FieldValue::Number(500.0), "500", None));
        let short = Validation {
            min_len: Some(3),
            ..Validation::default()
        };
        assert!(!short.accepts(&FieldValue::Text("ab".into()), "ab", None));
    }
}

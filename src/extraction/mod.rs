//! Human-paced, schema-driven extraction from page snapshots.
//!
//! The extractor reads a [`PageSnapshot`](crate::external_deps::browser::PageSnapshot)
//! the way a person would: it sizes up the layout, picks a reading pattern,
//! walks visible elements in chunks at reading speed, and pulls typed fields
//! out of each record scope before cross-checking them.

mod extractor;
mod fields;
mod relationships;
mod visual;

pub use extractor::{
    ExtractOptions, ExtractedRecord, ExtractionMetrics, ExtractionOutcome, IntelligentExtractor,
    Provenance,
};
pub use fields::{CurrencyPeriod, FieldKind, FieldRule, FieldValue, Validation, parse_value};
pub use relationships::{DerivedField, Relationship, RelationshipCheck};
pub use visual::{HeatGrid, ReadingPlan, VisualContext, reading_delay};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid selector `{selector}`")]
    InvalidSelector { selector: String },
    #[error("invalid pattern for field {field}: {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("field {field} has invalid importance {importance}")]
    InvalidImportance { field: String, importance: f64 },
    #[error("schema has no fields")]
    EmptySchema,
    #[error("extraction cancelled")]
    Cancelled,
}

/// Order in which field strategies are tried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Selector first, regex as fallback.
    #[default]
    Standard,
    /// Regex over the scope text first, selector as fallback.
    PatternFirst,
    /// Keyword proximity first, then regex.
    Semantic,
}

impl ExtractionMode {
    /// The next, looser mode, if any.
    pub fn next(self) -> Option<ExtractionMode> {
        match self {
            ExtractionMode::Standard => Some(ExtractionMode::PatternFirst),
            ExtractionMode::PatternFirst => Some(ExtractionMode::Semantic),
            ExtractionMode::Semantic => None,
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionMode::Standard => "standard",
            ExtractionMode::PatternFirst => "pattern_first",
            ExtractionMode::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

/// Simulated visual scan path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPattern {
    FPattern,
    ZPattern,
    LayerCake,
    SpotReading,
}

impl fmt::Display for ScanPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanPattern::FPattern => "f_pattern",
            ScanPattern::ZPattern => "z_pattern",
            ScanPattern::LayerCake => "layer_cake",
            ScanPattern::SpotReading => "spot_reading",
        };
        f.write_str(name)
    }
}

/// Declarative description of the records to pull from a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSchema {
    /// Selector of one record container; without it every reading chunk is a
    /// candidate record.
    pub record_selector: Option<String>,
    pub fields: Vec<FieldRule>,
    pub derived: Vec<DerivedField>,
    pub relationships: Vec<Relationship>,
}

impl ExtractionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_selector(mut self, selector: impl Into<String>) -> Self {
        self.record_selector = Some(selector.into());
        self
    }

    pub fn field(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    pub fn derive(mut self, derived: DerivedField) -> Self {
        self.derived.push(derived);
        self
    }

    pub fn relate(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Check selectors, importances and compile every field pattern.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        if self.fields.is_empty() {
            return Err(ExtractionError::EmptySchema);
        }
        if let Some(selector) = &self.record_selector {
            fields::parse_selector(selector)?;
        }
        for rule in &self.fields {
            rule.compile()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub words_per_minute: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub min_chunk_delay: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_chunk_delay: Duration,
    /// Relative jitter applied to each chunk delay.
    pub delay_jitter: f64,
    /// Visible elements per reading chunk.
    pub chunk_size: usize,
    /// Sleep between chunks; disable for offline extraction.
    pub simulate_reading: bool,
    pub heat_grid: (usize, usize),
    /// Interactive share above which a grid layout reads as spot-reading.
    pub dense_interactive_ratio: f64,
    /// Share of text-bearing elements below which a page reads as a Z-pattern.
    pub low_text_density: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            words_per_minute: 250.0,
            min_chunk_delay: Duration::from_millis(500),
            max_chunk_delay: Duration::from_millis(5_000),
            delay_jitter: 0.2,
            chunk_size: 6,
            simulate_reading: true,
            heat_grid: (8, 8),
            dense_interactive_ratio: 0.4,
            low_text_density: 0.2,
        }
    }
}

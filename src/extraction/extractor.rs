use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::fields::{CompiledRule, parse_selector};
use super::{
    ExtractionConfig, ExtractionError, ExtractionMode, ExtractionSchema, FieldKind, FieldRule, FieldValue,
    ReadingPlan, RelationshipCheck, ScanPattern, VisualContext, parse_value,
};
use crate::external_deps::browser::{PageSnapshot, VisibleElement, element_path};

/// Where a record came from on the page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    /// Index of the first visible element of the record.
    pub source_index: usize,
    /// Reading chunk that element was read in.
    pub chunk_index: usize,
    pub container: Option<String>,
    pub scan_pattern: ScanPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRecord {
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Importance-weighted field coverage in [0, 1].
    #[serde(rename = "_quality")]
    pub quality: f64,
    #[serde(rename = "_provenance")]
    pub provenance: Provenance,
}

impl ExtractedRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(FieldValue::as_f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    pub records: Vec<ExtractedRecord>,
    /// Batch confidence in [0, 1].
    pub confidence: f64,
    pub pattern_used: ScanPattern,
    pub elements_processed: usize,
    /// Candidate records dropped for missing required fields or failed relationships.
    pub discarded: usize,
    /// Schema selectors that matched nothing on the page.
    pub missing_selectors: Vec<String>,
    pub context: VisualContext,
    #[serde(with = "crate::config::duration_ms")]
    pub reading_time: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub mode: ExtractionMode,
    /// Original selector to replacement, as found by selector recovery.
    pub selector_overrides: BTreeMap<String, String>,
    /// Force a scan pattern instead of deriving one from the layout.
    pub scan_pattern: Option<ScanPattern>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionMetrics {
    pub pages: u64,
    pub elements_processed: u64,
    pub records_kept: u64,
    pub records_discarded: u64,
    pub relationship_failures: u64,
    pub validation_rejections: u64,
    pub patterns: BTreeMap<ScanPattern, u64>,
}

#[derive(Clone, Copy)]
enum Source {
    Selector,
    Pattern,
    Keywords,
}

impl ExtractionMode {
    fn sources(self) -> [Source; 3] {
        match self {
            ExtractionMode::Standard => [Source::Selector, Source::Pattern, Source::Keywords],
            ExtractionMode::PatternFirst => [Source::Pattern, Source::Selector, Source::Keywords],
            ExtractionMode::Semantic => [Source::Keywords, Source::Pattern, Source::Selector],
        }
    }
}

/// Elements read together as one candidate record.
struct Scope<'s, 'd> {
    elements: Vec<&'s VisibleElement>,
    container: Option<(ElementRef<'d>, String)>,
}

impl Scope<'_, '_> {
    fn text(&self) -> String {
        self.elements
            .iter()
            .map(|element| element.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn paths(&self) -> BTreeSet<&str> {
        self.elements.iter().map(|element| element.path.as_str()).collect()
    }
}

/// Raw value of a matched element: link targets for URL fields, text otherwise.
fn element_value(element: ElementRef<'_>, kind: FieldKind) -> String {
    if kind == FieldKind::Url
        && let Some(target) = element.value().attr("href").or_else(|| element.value().attr("src"))
    {
        return target.to_string();
    }
    element.text().collect::<Vec<_>>().join(" ")
}

fn keyword_candidates(scope: &Scope<'_, '_>, keywords: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    for (position, element) in scope.elements.iter().enumerate() {
        let lower = element.text.to_lowercase();
        for keyword in keywords {
            let keyword = keyword.to_lowercase();
            let Some(at) = lower.find(&keyword) else {
                continue;
            };
            // Lowercasing can shift byte offsets for non-ASCII text.
            let rest = element.text.get(at + keyword.len()..).unwrap_or("");
            let rest = rest.trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());
            if !rest.is_empty() {
                candidates.push(rest.to_string());
            }
            if let Some(next) = scope.elements.get(position + 1) {
                candidates.push(next.text.clone());
            }
        }
    }
    candidates
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    Some(values[values.len() / 2])
}

/// Share of numeric values within an order of magnitude of the field median,
/// averaged over fields.
fn batch_consistency(records: &[ExtractedRecord], rules: &[FieldRule]) -> f64 {
    let mut scores = Vec::new();
    for rule in rules {
        let present: Vec<&FieldValue> = records.iter().filter_map(|record| record.get(&rule.name)).collect();
        if present.is_empty() {
            continue;
        }
        let mut numbers: Vec<f64> = present.iter().filter_map(|value| value.annualized()).collect();
        let Some(middle) = median(&mut numbers) else {
            scores.push(1.0);
            continue;
        };
        let middle = middle.abs();
        let consistent = numbers
            .iter()
            .filter(|value| {
                let value = value.abs();
                if middle <= f64::EPSILON {
                    value <= f64::EPSILON
                } else {
                    value >= middle / 10.0 && value <= middle * 10.0
                }
            })
            .count();
        scores.push(consistent as f64 / present.len() as f64);
    }
    if scores.is_empty() {
        1.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Paces through a page and pulls schema records out of it.
#[derive(Debug, Default)]
pub struct IntelligentExtractor {
    config: ExtractionConfig,
    metrics: Mutex<ExtractionMetrics>,
}

impl IntelligentExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(ExtractionMetrics::default()),
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn analyze(&self, snapshot: &PageSnapshot) -> VisualContext {
        VisualContext::analyze(snapshot)
    }

    pub fn plan(&self, snapshot: &PageSnapshot, scan_pattern: Option<ScanPattern>) -> ReadingPlan {
        let context = self.analyze(snapshot);
        let pattern = scan_pattern.unwrap_or_else(|| context.scan_pattern(&self.config));
        ReadingPlan::build(snapshot, context, pattern, &self.config, &mut rand::thread_rng())
    }

    /// Read the page at human pace, then extract.
    pub async fn extract(
        &self,
        snapshot: &PageSnapshot,
        schema: &ExtractionSchema,
        options: &ExtractOptions,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        schema.validate()?;
        let plan = self.plan(snapshot, options.scan_pattern);
        if self.config.simulate_reading {
            for delay in &plan.delays {
                match &options.cancel {
                    Some(cancel) => tokio::select! {
                        _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
                        _ = tokio::time::sleep(*delay) => {}
                    },
                    None => tokio::time::sleep(*delay).await,
                }
            }
        }
        self.extract_with_plan(snapshot, schema, &plan, options)
    }

    /// Extract without pacing.
    pub fn extract_now(
        &self,
        snapshot: &PageSnapshot,
        schema: &ExtractionSchema,
        options: &ExtractOptions,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        schema.validate()?;
        let plan = self.plan(snapshot, options.scan_pattern);
        self.extract_with_plan(snapshot, schema, &plan, options)
    }

    pub fn metrics(&self) -> ExtractionMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn extract_with_plan(
        &self,
        snapshot: &PageSnapshot,
        schema: &ExtractionSchema,
        plan: &ReadingPlan,
        options: &ExtractOptions,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        let rules = schema
            .fields
            .iter()
            .map(|rule| Ok((rule, rule.compile()?)))
            .collect::<Result<Vec<(&FieldRule, CompiledRule)>, ExtractionError>>()?;
        let resolve = |selector: &str| -> Result<Selector, ExtractionError> {
            let effective = options
                .selector_overrides
                .get(selector)
                .map_or(selector, String::as_str);
            parse_selector(effective)
        };

        let document = Html::parse_document(&snapshot.html);
        let base = Url::parse(&snapshot.url).ok();
        let chunk_of = plan.chunk_of();
        let mut missing_selectors = Vec::new();

        let mut selectors: BTreeMap<&str, Selector> = BTreeMap::new();
        for (rule, _) in &rules {
            if let Some(selector) = rule.selector.as_deref() {
                let parsed = resolve(selector)?;
                if rule.required && document.select(&parsed).next().is_none() {
                    missing_selectors.push(selector.to_string());
                }
                selectors.insert(selector, parsed);
            }
        }

        let mut scopes: Vec<Scope<'_, '_>> = Vec::new();
        let mut containers_found = false;
        if let Some(record_selector) = schema.record_selector.as_deref() {
            let parsed = resolve(record_selector)?;
            for container in document.select(&parsed) {
                containers_found = true;
                let path = element_path(container);
                let prefix = format!("{path} > ");
                let elements: Vec<&VisibleElement> = snapshot
                    .elements
                    .iter()
                    .filter(|element| element.path == path || element.path.starts_with(&prefix))
                    .collect();
                if !elements.is_empty() {
                    scopes.push(Scope {
                        elements,
                        container: Some((container, path)),
                    });
                }
            }
            if !containers_found {
                missing_selectors.push(record_selector.to_string());
            }
        }
        // Loose mode reads chunk by chunk when the container selector is gone.
        let chunked = schema.record_selector.is_none()
            || (!containers_found && options.mode == ExtractionMode::Semantic);
        if chunked {
            scopes.extend(plan.chunks.iter().map(|chunk| Scope {
                elements: chunk
                    .iter()
                    .filter_map(|index| snapshot.elements.get(*index))
                    .collect(),
                container: None,
            }));
        }

        let total_importance: f64 = rules.iter().map(|(rule, _)| rule.importance.max(0.0)).sum();
        let mut records = Vec::new();
        let mut discarded = 0_usize;
        let mut validation_rejections = 0_u64;
        let mut relationship_failures = 0_u64;
        let (mut passed, mut failed) = (0_usize, 0_usize);

        for scope in &scopes {
            let text = scope.text();
            let paths = scope.paths();
            let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();

            for (rule, compiled) in &rules {
                let mut accepted = None;
                for source in options.mode.sources() {
                    let candidates: Vec<String> = match source {
                        Source::Selector => {
                            let Some(selector) = rule.selector.as_deref().and_then(|s| selectors.get(s)) else {
                                continue;
                            };
                            match &scope.container {
                                Some((container, _)) => container
                                    .select(selector)
                                    .map(|element| element_value(element, rule.kind))
                                    .collect(),
                                None => document
                                    .select(selector)
                                    .filter(|element| paths.contains(element_path(*element).as_str()))
                                    .map(|element| element_value(element, rule.kind))
                                    .collect(),
                            }
                        }
                        Source::Pattern => compiled.capture(&text).map(str::to_string).into_iter().collect(),
                        Source::Keywords => keyword_candidates(scope, &rule.keywords),
                    };
                    for raw in candidates {
                        let Some(value) = parse_value(rule.kind, &raw, base.as_ref()) else {
                            continue;
                        };
                        if rule.validation.accepts(&value, &raw, compiled.validation.as_ref()) {
                            accepted = Some(value);
                            break;
                        }
                        validation_rejections += 1;
                    }
                    if accepted.is_some() {
                        break;
                    }
                }
                if let Some(value) = accepted {
                    fields.insert(rule.name.clone(), value);
                }
            }

            if fields.is_empty() {
                continue;
            }
            if rules
                .iter()
                .any(|(rule, _)| rule.required && !fields.contains_key(&rule.name))
            {
                discarded += 1;
                continue;
            }

            let quality = if total_importance > f64::EPSILON {
                rules
                    .iter()
                    .filter(|(rule, _)| fields.contains_key(&rule.name))
                    .map(|(rule, _)| rule.importance.max(0.0))
                    .sum::<f64>()
                    / total_importance
            } else {
                fields.len() as f64 / rules.len().max(1) as f64
            };

            for derived in &schema.derived {
                if let Some(value) = derived.compute(&fields) {
                    fields.insert(derived.name().to_string(), value);
                }
            }

            let mut rejected = false;
            for relationship in &schema.relationships {
                match relationship.check(&fields) {
                    RelationshipCheck::Passed => passed += 1,
                    RelationshipCheck::Failed => {
                        failed += 1;
                        rejected = true;
                    }
                    RelationshipCheck::NotApplicable => {}
                }
            }
            if rejected {
                relationship_failures += 1;
                discarded += 1;
                continue;
            }

            let source_index = scope
                .elements
                .iter()
                .map(|element| element.index)
                .min()
                .unwrap_or_default();
            records.push(ExtractedRecord {
                fields,
                quality: quality.clamp(0.0, 1.0),
                provenance: Provenance {
                    source_index,
                    chunk_index: chunk_of.get(&source_index).copied().unwrap_or_default(),
                    container: scope.container.as_ref().map(|(_, path)| path.clone()),
                    scan_pattern: plan.pattern,
                },
            });
        }
        records.sort_by_key(|record| record.provenance.source_index);

        let confidence = if records.is_empty() {
            0.0
        } else {
            let coverage = records.iter().map(|record| record.quality).sum::<f64>() / records.len() as f64;
            let consistency = batch_consistency(&records, &schema.fields);
            let adherence = if passed + failed == 0 {
                1.0
            } else {
                passed as f64 / (passed + failed) as f64
            };
            (0.4 * coverage + 0.3 * consistency + 0.3 * adherence).clamp(0.0, 1.0)
        };

        let elements_processed = plan.chunks.iter().map(Vec::len).sum();
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics.pages += 1;
            metrics.elements_processed += elements_processed as u64;
            metrics.records_kept += records.len() as u64;
            metrics.records_discarded += discarded as u64;
            metrics.relationship_failures += relationship_failures;
            metrics.validation_rejections += validation_rejections;
            *metrics.patterns.entry(plan.pattern).or_default() += 1;
        }
        log::debug!(
            "Extracted {} records ({} discarded) from {} with {} at confidence {:.2}",
            records.len(),
            discarded,
            snapshot.url,
            plan.pattern,
            confidence
        );

        Ok(ExtractionOutcome {
            records,
            confidence,
            pattern_used: plan.pattern,
            elements_processed,
            discarded,
            missing_selectors,
            context: plan.context.clone(),
            reading_time: plan.total_delay(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{DerivedField, Relationship, Validation};
    use crate::external_deps::browser::snapshot_from_html;

    fn listing_schema() -> ExtractionSchema {
        ExtractionSchema::new()
            .field(
                FieldRule::new("price", FieldKind::Currency)
                    .selector(".price")
                    .pattern(r"price\s*[=:]\s*(\S+)")
                    .keywords(["asking price"])
                    .importance(2.0)
                    .required(),
            )
            .field(
                FieldRule::new("revenue", FieldKind::Currency)
                    .selector(".revenue")
                    .pattern(r"revenue\s*[=:]\s*(\S+)")
                    .keywords(["revenue"])
                    .importance(2.0),
            )
            .field(
                FieldRule::new("title", FieldKind::Text)
                    .selector("h2")
                    .validation(Validation {
                        min_len: Some(3),
                        ..Validation::default()
                    }),
            )
            .derive(DerivedField::ratio("multiple", "price", "revenue"))
            .relate(Relationship::within("multiple", 0.5, 10.0))
    }

    #[test]
    fn derives_multiple_from_monthly_revenue() {
        let snapshot = snapshot_from_html(
            "https://market.example.com/listings",
            200,
            "<main><div><p>price=$120,000</p><p>revenue=$5,000/mo</p></div></main>",
        );
        let extractor = IntelligentExtractor::default();
        let outcome = extractor
            .extract_now(&snapshot, &listing_schema(), &ExtractOptions::default())
            .unwrap();

        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        let multiple = record.number("multiple").unwrap();
        assert!((multiple - 2.0).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&record.quality));
        assert!((0.0..=1.0).contains(&outcome.confidence));
        assert_eq!(outcome.discarded, 0);
    }

    const LISTINGS: &str = r#"
        <main>
          <div class="listing"><h2>Widget shop</h2><span class="price">$120,000</span><span class="revenue">$5,000/mo</span></div>
          <div class="listing"><h2>Gadget store</h2><span class="price">$90,000</span><span class="revenue">$2,500/mo</span></div>
          <div class="listing"><h2>Overpriced</h2><span class="price">$900,000</span><span class="revenue">$100/mo</span></div>
          <div class="listing"><h2>No price</h2><span class="revenue">$1,000/mo</span></div>
        </main>"#;

    #[test]
    fn keeps_plausible_listings_in_document_order() {
        let snapshot = snapshot_from_html("https://market.example.com/listings", 200, LISTINGS);
        let schema = listing_schema().with_record_selector(".listing");
        let extractor = IntelligentExtractor::default();
        let outcome = extractor
            .extract_now(&snapshot, &schema, &ExtractOptions::default())
            .unwrap();

        let titles: Vec<&FieldValue> = outcome.records.iter().filter_map(|r| r.get("title")).collect();
        assert_eq!(
            titles,
            vec![
                &FieldValue::Text("Widget shop".into()),
                &FieldValue::Text("Gadget store".into())
            ]
        );
        assert_eq!(outcome.discarded, 2);
        assert!(outcome.records.iter().all(|record| record.quality == 1.0));
        assert!(outcome.records[0].provenance.container.is_some());

        let metrics = extractor.metrics();
        assert_eq!(metrics.records_kept, 2);
        assert_eq!(metrics.relationship_failures, 1);
        assert_eq!(metrics.pages, 1);
    }

    #[test]
    fn reports_missing_selectors_and_honours_overrides() {
        let snapshot = snapshot_from_html("https://market.example.com/listings", 200, LISTINGS);
        let schema = ExtractionSchema::new()
            .with_record_selector(".listing")
            .field(FieldRule::new("price", FieldKind::Currency).selector(".old-price").required());
        let extractor = IntelligentExtractor::default();

        let outcome = extractor
            .extract_now(&snapshot, &schema, &ExtractOptions::default())
            .unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.missing_selectors, vec![".old-price".to_string()]);
        assert_eq!(outcome.confidence, 0.0);

        let options = ExtractOptions {
            selector_overrides: BTreeMap::from([(".old-price".to_string(), ".price".to_string())]),
            ..ExtractOptions::default()
        };
        let outcome = extractor.extract_now(&snapshot, &schema, &options).unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert!(outcome.missing_selectors.is_empty());
    }

    #[test]
    fn semantic_mode_reads_labelled_prose() {
        let snapshot = snapshot_from_html(
            "https://market.example.com/listing/7",
            200,
            "<article><p>Asking price: $48,000</p><p>Monthly revenue</p><p>$2,000/mo</p></article>",
        );
        let schema = listing_schema().with_record_selector(".gone");
        let options = ExtractOptions {
            mode: ExtractionMode::Semantic,
            ..ExtractOptions::default()
        };
        let outcome = IntelligentExtractor::default()
            .extract_now(&snapshot, &schema, &options)
            .unwrap();

        assert!(outcome.missing_selectors.contains(&".gone".to_string()));
        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.number("price"), Some(48_000.0));
        assert!((record.number("multiple").unwrap() - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_extraction_can_be_cancelled() {
        let snapshot = snapshot_from_html("https://market.example.com/listings", 200, LISTINGS);
        let schema = listing_schema().with_record_selector(".listing");
        let extractor = IntelligentExtractor::default();

        let outcome = extractor
            .extract(&snapshot, &schema, &ExtractOptions::default())
            .await
            .unwrap();
        assert!(outcome.reading_time >= Duration::from_millis(500));
        assert_eq!(outcome.records.len(), 2);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = ExtractOptions {
            cancel: Some(cancel),
            ..ExtractOptions::default()
        };
        assert!(matches!(
            extractor.extract(&snapshot, &schema, &options).await,
            Err(ExtractionError::Cancelled)
        ));
    }
}

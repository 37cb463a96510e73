//! Replacement search for selectors that stopped matching.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::external_deps::browser::{PageSnapshot, VisibleElement};

static TOKEN_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap_or_else(|err| panic!("invalid token regex: {err}")));

const HTML_TAGS: &[&str] = &[
    "div", "span", "p", "a", "li", "ul", "ol", "td", "tr", "th", "table", "tbody", "section",
    "article", "main", "aside", "header", "footer", "nav", "strong", "em", "small", "label", "h1",
    "h2", "h3", "h4", "h5", "h6", "html", "body", "form", "button", "input",
];
const NOISE_TOKENS: &[&str] = &["nth", "of", "type", "child", "first", "last", "not"];
const SEMANTIC_ATTRIBUTES: &[&str] = &["itemprop", "data-field", "data-testid", "aria-label", "name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorMethod {
    TextContent,
    ClassSimilarity,
    Structural,
}

impl fmt::Display for SelectorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorMethod::TextContent => write!(f, "text_content"),
            SelectorMethod::ClassSimilarity => write!(f, "class_similarity"),
            SelectorMethod::Structural => write!(f, "structural"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorReplacement {
    pub selector: String,
    pub confidence: f64,
    pub method: SelectorMethod,
}

/// Parsed view of the selector that failed.
struct SelectorShape {
    keywords: Vec<String>,
    /// Tag of the last compound, if any.
    tag: Option<String>,
    /// Tokens of the outermost compound when the selector has ancestors.
    ancestor: Vec<String>,
}

impl SelectorShape {
    fn parse(selector: &str) -> Self {
        let compounds: Vec<&str> = selector
            .split(|c: char| c.is_whitespace() || c == '>' || c == '+' || c == '~')
            .filter(|part| !part.is_empty())
            .collect();

        let tag = compounds.last().and_then(|last| {
            let name: String = last
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase();
            HTML_TAGS.contains(&name.as_str()).then_some(name)
        });

        let ancestor = if compounds.len() > 1 {
            tokens(compounds[0])
        } else {
            Vec::new()
        };

        let keywords = compounds
            .last()
            .map(|last| {
                tokens(last)
                    .into_iter()
                    .filter(|token| !HTML_TAGS.contains(&token.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            keywords,
            tag,
            ancestor,
        }
    }
}

fn tokens(text: &str) -> Vec<String> {
    TOKEN_SPLIT
        .split(text)
        .map(str::to_ascii_lowercase)
        .filter(|token| {
            token.len() >= 3
                && !NOISE_TOKENS.contains(&token.as_str())
                && !token.chars().all(|c| c.is_ascii_digit())
        })
        .collect()
}

fn jaccard(lhs: &HashSet<String>, rhs: &HashSet<String>) -> f64 {
    let union = lhs.union(rhs).count();
    if union == 0 {
        return 0.0;
    }
    lhs.intersection(rhs).count() as f64 / union as f64
}

/// Selector addressing `element`, preferring ids and keyword-bearing classes.
fn selector_for(element: &VisibleElement, keywords: &[String]) -> String {
    if let Some(id) = &element.id {
        return format!("#{id}");
    }
    let class = element
        .classes
        .iter()
        .find(|class| {
            let lower = class.to_ascii_lowercase();
            keywords.iter().any(|keyword| lower.contains(keyword.as_str()))
        })
        .or_else(|| element.classes.first());
    match class {
        Some(class) => format!("{}.{}", element.tag, class),
        None => element.path.clone(),
    }
}

fn by_text_content(shape: &SelectorShape, page: &PageSnapshot) -> Option<SelectorReplacement> {
    if shape.keywords.is_empty() {
        return None;
    }
    page.elements
        .iter()
        .filter_map(|element| {
            let attribute_hit = SEMANTIC_ATTRIBUTES.iter().any(|name| {
                element.attributes.get(*name).is_some_and(|value| {
                    let value = value.to_ascii_lowercase();
                    shape.keywords.iter().any(|keyword| value == *keyword)
                })
            });
            let text = element.text.to_ascii_lowercase();
            let text_hit = shape
                .keywords
                .iter()
                .any(|keyword| text.contains(keyword.as_str()));
            let mut confidence = match (attribute_hit, text_hit) {
                (true, _) => 0.85,
                (false, true) => 0.7,
                (false, false) => return None,
            };
            if shape.tag.as_deref() == Some(element.tag.as_str()) {
                confidence += 0.05;
            }
            Some(SelectorReplacement {
                selector: selector_for(element, &shape.keywords),
                confidence,
                method: SelectorMethod::TextContent,
            })
        })
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

fn by_class_similarity(shape: &SelectorShape, page: &PageSnapshot) -> Option<SelectorReplacement> {
    let wanted: HashSet<String> = shape.keywords.iter().cloned().collect();
    if wanted.is_empty() {
        return None;
    }
    let mut best: Option<SelectorReplacement> = None;
    for element in &page.elements {
        for class in &element.classes {
            let class_tokens: HashSet<String> = tokens(class).into_iter().collect();
            let mut similarity = jaccard(&wanted, &class_tokens);
            let lower = class.to_ascii_lowercase();
            if wanted.iter().any(|keyword| lower.contains(keyword.as_str())) {
                similarity = similarity.max(0.6);
            }
            if similarity < 0.3 {
                continue;
            }
            let confidence = 0.8 * similarity;
            if best.as_ref().is_none_or(|current| confidence > current.confidence) {
                best = Some(SelectorReplacement {
                    selector: format!("{}.{}", element.tag, class),
                    confidence,
                    method: SelectorMethod::ClassSimilarity,
                });
            }
        }
    }
    best
}

fn by_structure(shape: &SelectorShape, page: &PageSnapshot) -> Option<SelectorReplacement> {
    let tag = shape.tag.as_deref()?;
    let in_context = |element: &&VisibleElement| {
        if shape.ancestor.is_empty() {
            return true;
        }
        let landmark = element.landmark.as_deref().unwrap_or_default().to_ascii_lowercase();
        let path = element.path.to_ascii_lowercase();
        shape
            .ancestor
            .iter()
            .any(|token| landmark.contains(token.as_str()) || path.contains(token.as_str()))
    };
    let candidates: Vec<&VisibleElement> = page
        .elements
        .iter()
        .filter(|element| element.tag == tag)
        .filter(in_context)
        .collect();
    let first = candidates.first()?;
    let confidence = if shape.ancestor.is_empty() { 0.3 } else { 0.45 };
    // A shared class across siblings is a better anchor than a positional path.
    let shared_class = first.classes.iter().find(|class| {
        candidates
            .iter()
            .filter(|candidate| candidate.classes.contains(class))
            .count()
            > 1
    });
    let selector = match shared_class {
        Some(class) => format!("{tag}.{class}"),
        None => first.path.clone(),
    };
    Some(SelectorReplacement {
        selector,
        confidence,
        method: SelectorMethod::Structural,
    })
}

/// Finds replacements for broken selectors and remembers them per domain.
#[derive(Debug, Default)]
pub struct SelectorRecovery {
    learned: Mutex<HashMap<String, BTreeMap<String, SelectorReplacement>>>,
}

impl SelectorRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best replacement for `selector` on `page`, reusing one already learned for the domain.
    pub fn recover(
        &self,
        domain: &str,
        selector: &str,
        page: &PageSnapshot,
    ) -> Option<SelectorReplacement> {
        if let Some(known) = self.replacement_for(domain, selector) {
            log::debug!("reusing learned selector {} for {selector} on {domain}", known.selector);
            return Some(known);
        }

        let shape = SelectorShape::parse(selector);
        let mut best: Option<SelectorReplacement> = None;
        for candidate in [
            by_text_content(&shape, page),
            by_class_similarity(&shape, page),
            by_structure(&shape, page),
        ]
        .into_iter()
        .flatten()
        {
            if candidate.selector == selector {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|current| candidate.confidence > current.confidence)
            {
                best = Some(candidate);
            }
        }

        let replacement = best?;
        log::info!(
            "selector {selector} on {domain} replaced by {} ({}, {:.2})",
            replacement.selector,
            replacement.method,
            replacement.confidence
        );
        self.learned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(domain.to_string())
            .or_default()
            .insert(selector.to_string(), replacement.clone());
        Some(replacement)
    }

    pub fn replacement_for(&self, domain: &str, selector: &str) -> Option<SelectorReplacement> {
        self.learned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .and_then(|learned| learned.get(selector))
            .cloned()
    }

    /// All learned overrides for a domain, original selector to replacement.
    pub fn overrides_for(&self, domain: &str) -> BTreeMap<String, String> {
        self.learned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .map(|learned| {
                learned
                    .iter()
                    .map(|(original, replacement)| (original.clone(), replacement.selector.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn forget(&self, domain: &str, selector: &str) {
        if let Some(learned) = self
            .learned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(domain)
        {
            learned.remove(selector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::browser::snapshot_from_html;

    const PAGE: &str = r#"
        <html><body><main>
          <div class="listing"><h2>Widget shop</h2><span class="listing-price">$120,000</span></div>
          <div class="listing"><h2>Gadget store</h2><span class="listing-price">$80,000</span></div>
        </main></body></html>"#;

    #[test]
    fn finds_renamed_class() {
        let page = snapshot_from_html("https://market.example.com", 200, PAGE);
        let recovery = SelectorRecovery::new();
        let found = recovery
            .recover("market.example.com", "span.price", &page)
            .unwrap();
        assert_eq!(found.selector, "span.listing-price");
        assert_eq!(found.method, SelectorMethod::ClassSimilarity);
        assert!(found.confidence > 0.4 && found.confidence <= 1.0);

        let overrides = recovery.overrides_for("market.example.com");
        assert_eq!(overrides["span.price"], "span.listing-price");
        assert!(recovery.overrides_for("other.example.com").is_empty());
    }

    #[test]
    fn prefers_semantic_attributes() {
        let html = r#"<html><body><div>
            <span itemprop="revenue">$5,000/mo</span><span class="misc">Revenue details</span>
        </div></body></html>"#;
        let page = snapshot_from_html("https://market.example.com", 200, html);
        let found = SelectorRecovery::new()
            .recover("market.example.com", ".revenue", &page)
            .unwrap();
        assert_eq!(found.method, SelectorMethod::TextContent);
        assert!(found.confidence >= 0.85);
    }

    #[test]
    fn structural_search_uses_the_ancestor() {
        let html = r#"<html><body><main>
            <table><tr><td>Widget shop</td><td>$10</td></tr></table>
        </main></body></html>"#;
        let page = snapshot_from_html("https://market.example.com", 200, html);
        let found = SelectorRecovery::new()
            .recover("market.example.com", "main td.cell-amount", &page)
            .unwrap();
        assert_eq!(found.method, SelectorMethod::Structural);
        assert!(found.selector.ends_with("td:nth-of-type(1)"));
    }

    #[test]
    fn nothing_to_match() {
        let page = snapshot_from_html("https://market.example.com", 200, "<html><body></body></html>");
        assert!(SelectorRecovery::new().recover("market.example.com", ".price", &page).is_none());
    }
}

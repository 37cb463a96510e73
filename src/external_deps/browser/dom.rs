//! Snapshot construction from raw markup.
//!
//! Layout is estimated from document order: block elements stack vertically,
//! nesting indents, and sidebars are laid out in a right-hand column.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;

use super::{BoundingBox, PageSnapshot, VisibleElement};

const VIEWPORT: (f64, f64) = (1366.0, 768.0);
const LINE_HEIGHT: f64 = 20.0;
const CHAR_WIDTH: f64 = 8.0;

const SKIPPED_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "svg", "iframe", "meta", "link",
];
const LANDMARK_TAGS: &[&str] = &[
    "header", "nav", "main", "aside", "footer", "article", "section", "table", "form",
];
const INTERACTIVE_TAGS: &[&str] = &["a", "button", "input", "select", "textarea", "label"];

static TITLE_SELECTOR: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("title").ok());

/// CSS path selecting exactly `element`, built from `:nth-of-type` steps.
pub fn element_path(element: ElementRef<'_>) -> String {
    let mut segments = Vec::new();
    let mut current = Some(element);
    while let Some(node) = current {
        let name = node.value().name();
        if name == "html" {
            segments.push("html".to_string());
            break;
        }
        let position = 1 + node
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|sibling| sibling.value().name() == name)
            .count();
        segments.push(format!("{name}:nth-of-type({position})"));
        current = node.parent().and_then(ElementRef::wrap);
    }
    segments.reverse();
    segments.join(" > ")
}

fn is_hidden(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if SKIPPED_TAGS.contains(&value.name()) || value.attr("hidden").is_some() {
        return true;
    }
    if value.attr("aria-hidden") == Some("true") {
        return true;
    }
    value.attr("style").is_some_and(|style| {
        let style: String = style.chars().filter(|c| !c.is_whitespace()).collect();
        let style = style.to_ascii_lowercase();
        style.contains("display:none") || style.contains("visibility:hidden")
    })
}

fn own_text(element: ElementRef<'_>) -> String {
    let mut text = String::new();
    for child in element.children() {
        if let Some(fragment) = child.value().as_text() {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(fragment);
        }
    }
    html_escape::decode_html_entities(&text).into_owned()
}

fn landmark_label(element: ElementRef<'_>) -> String {
    let value = element.value();
    if let Some(id) = value.id() {
        return format!("{}#{}", value.name(), id);
    }
    match value.classes().next() {
        Some(class) => format!("{}.{}", value.name(), class),
        None => value.name().to_string(),
    }
}

fn is_sidebar(label: &str) -> bool {
    label.starts_with("aside") || label.contains("sidebar")
}

fn landmark_of(element: ElementRef<'_>) -> Option<String> {
    std::iter::once(element)
        .chain(element.ancestors().filter_map(ElementRef::wrap))
        .find(|node| {
            let value = node.value();
            LANDMARK_TAGS.contains(&value.name()) || value.classes().any(|class| class.contains("sidebar"))
        })
        .map(landmark_label)
}

fn estimate_contrast(element: ElementRef<'_>) -> f64 {
    let value = element.value();
    let mut contrast: f64 = match value.name() {
        "h1" | "h2" | "h3" => 0.95,
        "button" => 0.9,
        "h4" | "h5" | "h6" | "strong" | "b" | "th" => 0.85,
        "a" => 0.7,
        "span" | "em" | "small" => 0.55,
        _ => 0.5,
    };
    let emphasised = ["price", "highlight", "badge", "btn", "cta", "title"];
    if value
        .classes()
        .any(|class| emphasised.iter().any(|marker| class.to_ascii_lowercase().contains(marker)))
    {
        contrast += 0.1;
    }
    if let Some(style) = value.attr("style") {
        let style = style.to_ascii_lowercase();
        if ["#ccc", "#999", "gray", "grey", "opacity"]
            .iter()
            .any(|faint| style.contains(faint))
        {
            contrast -= 0.3;
        }
    }
    contrast.clamp(0.0, 1.0)
}

fn is_interactive(element: ElementRef<'_>) -> bool {
    let value = element.value();
    INTERACTIVE_TAGS.contains(&value.name())
        || value.attr("onclick").is_some()
        || value.attr("role") == Some("button")
}

/// Build a snapshot from markup.
pub fn snapshot_from_html(url: &str, status: u16, html: &str) -> PageSnapshot {
    let document = Html::parse_document(html);
    let title = TITLE_SELECTOR.as_ref().and_then(|selector| {
        document
            .select(selector)
            .next()
            .map(|title| title.text().collect::<String>().trim().to_string())
            .filter(|title| !title.is_empty())
    });

    let (viewport_width, _) = VIEWPORT;
    let mut main_cursor = 0.0;
    let mut side_cursor = 0.0;
    let mut elements = Vec::new();

    for node in document.root_element().descendants() {
        let Some(element) = ElementRef::wrap(node) else {
            continue;
        };
        if is_hidden(element)
            || element
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(is_hidden)
        {
            continue;
        }

        let text = own_text(element);
        let interactive = is_interactive(element);
        if text.is_empty() && !interactive {
            continue;
        }

        let depth = element.ancestors().count() as f64;
        let landmark = landmark_of(element);
        let in_sidebar = landmark.as_deref().is_some_and(is_sidebar);

        let (x, width, cursor) = if in_sidebar {
            (viewport_width * 0.72, viewport_width * 0.26, &mut side_cursor)
        } else {
            let indent = (depth * 12.0).min(viewport_width * 0.3);
            let width = if landmark.as_deref().is_some_and(|label| label.starts_with("main")) {
                viewport_width * 0.7 - indent
            } else {
                viewport_width - indent - 12.0
            };
            (indent, width.max(120.0), &mut main_cursor)
        };

        let chars_per_line = (width / CHAR_WIDTH).max(1.0);
        let lines = (text.chars().count() as f64 / chars_per_line).ceil().max(1.0);
        let height = if text.is_empty() { 24.0 } else { lines * LINE_HEIGHT };
        let text_width = (text.chars().count() as f64 * CHAR_WIDTH).clamp(24.0, width);
        let bounds = BoundingBox::new(x, *cursor, text_width, height);
        *cursor += height + 4.0;

        let value = element.value();
        let attributes: BTreeMap<String, String> = value
            .attrs()
            .filter(|(name, _)| !matches!(*name, "style" | "class" | "id"))
            .map(|(name, attr)| (name.to_string(), attr.to_string()))
            .collect();

        elements.push(VisibleElement {
            index: elements.len(),
            path: element_path(element),
            tag: value.name().to_string(),
            id: value.id().map(str::to_string),
            classes: value.classes().map(str::to_string).collect(),
            text,
            attributes,
            bounds,
            interactive,
            contrast: estimate_contrast(element),
            landmark,
        });
    }

    PageSnapshot {
        url: url.to_string(),
        status,
        title,
        html: html.to_string(),
        elements,
        viewport: VIEWPORT,
        screenshot: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head><title>Listings</title><style>.x{}</style></head>
        <body>
          <nav><a href="/">Home</a></nav>
          <main>
            <div class="listing"><h2>Widget shop</h2><span class="price">$120,000</span></div>
            <div class="listing"><h2>Gadget store</h2><span class="price">$80,000</span></div>
            <p style="display: none">hidden text</p>
          </main>
          <aside class="filters"><label>Category</label></aside>
        </body></html>"#;

    #[test]
    fn collects_visible_elements_in_document_order() {
        let snapshot = snapshot_from_html("https://example.com", 200, PAGE);
        assert_eq!(snapshot.title.as_deref(), Some("Listings"));
        let texts: Vec<&str> = snapshot.elements.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Home", "Widget shop", "$120,000", "Gadget store", "$80,000", "Category"]
        );
        assert!(snapshot.elements[0].interactive);
        assert_eq!(snapshot.elements[1].landmark.as_deref(), Some("main"));
        assert!(snapshot.elements[5].bounds.x > snapshot.elements[1].bounds.x);
        assert!(snapshot.elements[1].contrast > snapshot.elements[5].contrast);
    }

    #[test]
    fn element_paths_select_the_element() {
        let snapshot = snapshot_from_html("https://example.com", 200, PAGE);
        let document = Html::parse_document(PAGE);
        let second_price = &snapshot.elements[4];
        let selector = Selector::parse(&second_price.path).unwrap();
        let matched: Vec<String> = document
            .select(&selector)
            .map(|el| el.text().collect())
            .collect();
        assert_eq!(matched, vec!["$80,000".to_string()]);
    }
}

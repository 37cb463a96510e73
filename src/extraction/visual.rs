//! Layout analysis, scan-pattern choice and reading pace.

use rand::Rng;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::{ExtractionConfig, ScanPattern};
use crate::external_deps::browser::{BoundingBox, PageSnapshot, VisibleElement};

const HIGH_CONTRAST: f64 = 0.8;
const GRID_REPEATS: usize = 4;

/// What a reader takes in at first glance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VisualContext {
    pub element_count: usize,
    pub interactive_density: f64,
    /// Share of elements carrying at least a short sentence.
    pub text_density: f64,
    pub has_table: bool,
    pub has_grid: bool,
    pub has_sidebar: bool,
    pub mean_contrast: f64,
    pub high_contrast: Vec<BoundingBox>,
    pub page_width: f64,
    pub page_height: f64,
}

fn strip_positions(path: &str) -> String {
    path.split(" > ")
        .map(|segment| segment.split(':').next().unwrap_or(segment))
        .collect::<Vec<_>>()
        .join(" > ")
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once(" > ").map_or("", |(parent, _)| parent)
}

/// Repeated sibling containers with the same structure.
fn detect_grid(elements: &[VisibleElement]) -> bool {
    let mut parents: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for element in elements {
        let parent = parent_path(&element.path);
        if parent.is_empty() {
            continue;
        }
        parents
            .entry(strip_positions(parent))
            .or_default()
            .insert(parent);
    }
    parents.values().any(|distinct| distinct.len() >= GRID_REPEATS)
}

impl VisualContext {
    pub fn analyze(snapshot: &PageSnapshot) -> Self {
        let elements = &snapshot.elements;
        let count = elements.len();
        let (viewport_width, viewport_height) = snapshot.viewport;
        if count == 0 {
            return Self {
                page_width: viewport_width,
                page_height: viewport_height,
                ..Self::default()
            };
        }

        let share = |matching: usize| matching as f64 / count as f64;
        let interactive = elements.iter().filter(|element| element.interactive).count();
        let texty = elements.iter().filter(|element| element.word_count() >= 4).count();
        let has_table = elements.iter().any(|element| {
            matches!(element.tag.as_str(), "td" | "th")
                || element
                    .landmark
                    .as_deref()
                    .is_some_and(|label| label.starts_with("table"))
        });
        let has_sidebar = elements.iter().any(|element| {
            element
                .landmark
                .as_deref()
                .is_some_and(|label| label.starts_with("aside") || label.contains("sidebar"))
        });
        let page_height = elements
            .iter()
            .map(|element| element.bounds.y + element.bounds.height)
            .fold(viewport_height, f64::max);

        Self {
            element_count: count,
            interactive_density: share(interactive),
            text_density: share(texty),
            has_table,
            has_grid: detect_grid(elements),
            has_sidebar,
            mean_contrast: elements.iter().map(|element| element.contrast).sum::<f64>() / count as f64,
            high_contrast: elements
                .iter()
                .filter(|element| element.contrast >= HIGH_CONTRAST)
                .map(|element| element.bounds)
                .collect(),
            page_width: viewport_width,
            page_height,
        }
    }

    /// Reading pattern a person would likely fall into on this layout.
    pub fn scan_pattern(&self, config: &ExtractionConfig) -> ScanPattern {
        if self.has_table {
            ScanPattern::LayerCake
        } else if self.has_grid && self.interactive_density >= config.dense_interactive_ratio {
            ScanPattern::SpotReading
        } else if self.has_sidebar {
            ScanPattern::FPattern
        } else if self.element_count > 0 && self.text_density < config.low_text_density {
            ScanPattern::ZPattern
        } else {
            ScanPattern::FPattern
        }
    }
}

/// Attention weights over the page, normalised to a maximum of 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatGrid {
    rows: usize,
    cols: usize,
    width: f64,
    height: f64,
    cells: Vec<f64>,
}

impl HeatGrid {
    /// Blend a top-left positional bias with the pull of high-contrast elements.
    pub fn build(context: &VisualContext, rows: usize, cols: usize) -> Self {
        let (rows, cols) = (rows.max(1), cols.max(1));
        let mut grid = Self {
            rows,
            cols,
            width: context.page_width.max(1.0),
            height: context.page_height.max(1.0),
            cells: vec![0.0; rows * cols],
        };

        let mut pull = vec![0.0_f64; rows * cols];
        for bounds in &context.high_contrast {
            let (x, y) = bounds.center();
            let cell = grid.cell_index(x, y);
            pull[cell] += 0.5;
        }

        for row in 0..rows {
            for col in 0..cols {
                let x = (col as f64 + 0.5) / cols as f64;
                let y = (row as f64 + 0.5) / rows as f64;
                let positional = (1.0 - 0.5 * x) * (1.0 - 0.6 * y);
                let index = row * cols + col;
                grid.cells[index] = 0.6 * positional + 0.4 * pull[index].min(1.0);
            }
        }

        let max = grid.cells.iter().copied().fold(0.0, f64::max);
        if max > f64::EPSILON {
            for cell in &mut grid.cells {
                *cell /= max;
            }
        }
        grid
    }

    fn cell_index(&self, x: f64, y: f64) -> usize {
        let col = ((x / self.width) * self.cols as f64).floor().clamp(0.0, (self.cols - 1) as f64) as usize;
        let row = ((y / self.height) * self.rows as f64).floor().clamp(0.0, (self.rows - 1) as f64) as usize;
        row * self.cols + col
    }

    pub fn weight_at(&self, x: f64, y: f64) -> f64 {
        self.cells[self.cell_index(x, y)]
    }

    /// `(row, col)` of the most attended cell.
    pub fn hottest(&self) -> (usize, usize) {
        let index = self
            .cells
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(&a.0)))
            .map_or(0, |(index, _)| index);
        (index / self.cols, index % self.cols)
    }
}

/// Reading delay for a chunk of `words`, with jitter, clamped to the
/// configured bounds.
pub fn reading_delay(words: usize, config: &ExtractionConfig, rng: &mut impl Rng) -> Duration {
    let base = words as f64 * 60.0 / config.words_per_minute.max(1.0);
    let jitter = config.delay_jitter.clamp(0.0, 0.9);
    let factor = if jitter > 0.0 {
        rng.gen_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };
    let min = config.min_chunk_delay.as_secs_f64();
    let max = config.max_chunk_delay.as_secs_f64().max(min);
    Duration::from_secs_f64((base * factor).clamp(min, max))
}

fn is_heading(element: &VisibleElement) -> bool {
    matches!(
        element.tag.as_str(),
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "th" | "strong" | "b"
    )
}

fn by_position(a: &VisibleElement, b: &VisibleElement) -> Ordering {
    a.bounds
        .y
        .total_cmp(&b.bounds.y)
        .then_with(|| a.bounds.x.total_cmp(&b.bounds.x))
        .then_with(|| a.index.cmp(&b.index))
}

/// Element indices in the order the pattern visits them.
fn scan_order(
    elements: &[VisibleElement],
    pattern: ScanPattern,
    context: &VisualContext,
    heat: &HeatGrid,
) -> Vec<usize> {
    let mut visible: Vec<&VisibleElement> = elements.iter().collect();
    let height = context.page_height.max(1.0);
    let width = context.page_width.max(1.0);

    match pattern {
        ScanPattern::FPattern => {
            // Two full sweeps across the top, then down the left edge.
            let band = height / 6.0;
            let group = |element: &VisibleElement| {
                if element.bounds.y < band * 2.0 {
                    0
                } else if element.bounds.x < width * 0.4 {
                    1
                } else {
                    2
                }
            };
            visible.sort_by(|a, b| group(a).cmp(&group(b)).then_with(|| by_position(a, b)));
        }
        ScanPattern::ZPattern => {
            let third = |element: &VisibleElement| ((element.bounds.y / height) * 3.0).floor() as i64;
            let row = |element: &VisibleElement| (element.bounds.y / 40.0).floor() as i64;
            visible.sort_by(|a, b| {
                third(a)
                    .cmp(&third(b))
                    .then_with(|| row(a).cmp(&row(b)))
                    .then_with(|| a.bounds.x.total_cmp(&b.bounds.x))
                    .then_with(|| a.index.cmp(&b.index))
            });
        }
        ScanPattern::LayerCake => {
            let mut sections: BTreeMap<&str, usize> = BTreeMap::new();
            for element in elements {
                let next = sections.len();
                sections
                    .entry(element.landmark.as_deref().unwrap_or(""))
                    .or_insert(next);
            }
            let section = |element: &VisibleElement| {
                sections
                    .get(element.landmark.as_deref().unwrap_or(""))
                    .copied()
                    .unwrap_or(usize::MAX)
            };
            visible.sort_by(|a, b| {
                section(a)
                    .cmp(&section(b))
                    .then_with(|| is_heading(b).cmp(&is_heading(a)))
                    .then_with(|| by_position(a, b))
            });
        }
        ScanPattern::SpotReading => {
            let salience = |element: &VisibleElement| {
                let (x, y) = element.bounds.center();
                heat.weight_at(x, y) * (0.5 + element.contrast)
            };
            visible.sort_by(|a, b| {
                salience(b)
                    .total_cmp(&salience(a))
                    .then_with(|| a.index.cmp(&b.index))
            });
        }
    }
    visible.into_iter().map(|element| element.index).collect()
}

/// Chunked visiting order with per-chunk reading delays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingPlan {
    pub pattern: ScanPattern,
    pub context: VisualContext,
    /// Element indices per chunk, in visiting order.
    pub chunks: Vec<Vec<usize>>,
    pub delays: Vec<Duration>,
}

impl ReadingPlan {
    pub fn build(
        snapshot: &PageSnapshot,
        context: VisualContext,
        pattern: ScanPattern,
        config: &ExtractionConfig,
        rng: &mut impl Rng,
    ) -> Self {
        let (rows, cols) = config.heat_grid;
        let heat = HeatGrid::build(&context, rows, cols);
        let order = scan_order(&snapshot.elements, pattern, &context, &heat);
        let chunks: Vec<Vec<usize>> = order
            .chunks(config.chunk_size.max(1))
            .map(<[usize]>::to_vec)
            .collect();
        let delays = chunks
            .iter()
            .map(|chunk| {
                let words = chunk
                    .iter()
                    .filter_map(|index| snapshot.elements.get(*index))
                    .map(VisibleElement::word_count)
                    .sum();
                reading_delay(words, config, rng)
            })
            .collect();
        Self {
            pattern,
            context,
            chunks,
            delays,
        }
    }

    /// Chunk each element index was read in.
    pub fn chunk_of(&self) -> BTreeMap<usize, usize> {
        self.chunks
            .iter()
            .enumerate()
            .flat_map(|(chunk, indices)| indices.iter().map(move |index| (*index, chunk)))
            .collect()
    }

    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::browser::snapshot_from_html;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn pattern_for(html: &str) -> ScanPattern {
        let snapshot = snapshot_from_html("https://example.com", 200, html);
        VisualContext::analyze(&snapshot).scan_pattern(&ExtractionConfig::default())
    }

    #[test]
    fn picks_patterns_from_layout() {
        let table = "<table><tr><th>Name</th><th>Price</th></tr><tr><td>Widget</td><td>$10</td></tr></table>";
        assert_eq!(pattern_for(table), ScanPattern::LayerCake);

        let grid = "<main>\
            <div class='card'><a href='/1'>One</a><button>Buy</button></div>\
            <div class='card'><a href='/2'>Two</a><button>Buy</button></div>\
            <div class='card'><a href='/3'>Three</a><button>Buy</button></div>\
            <div class='card'><a href='/4'>Four</a><button>Buy</button></div></main>";
        assert_eq!(pattern_for(grid), ScanPattern::SpotReading);

        let sidebar = "<main><p>A long paragraph of listing text goes here</p></main>\
            <aside class='filters'><label>Category</label></aside>";
        assert_eq!(pattern_for(sidebar), ScanPattern::FPattern);

        let sparse = "<header><h1>Shop</h1></header><nav><a href='/'>Home</a></nav><footer>Bye</footer>";
        assert_eq!(pattern_for(sparse), ScanPattern::ZPattern);
    }

    #[test]
    fn reading_delays_stay_in_bounds() {
        let config = ExtractionConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for words in [0, 1, 10, 50, 5_000] {
            let delay = reading_delay(words, &config, &mut rng);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(5_000));
        }
        // 10 words at 250 wpm is 2.4s before jitter.
        let delay = reading_delay(10, &config, &mut rng).as_secs_f64();
        assert!((1.92..=2.88).contains(&delay));
    }

    #[test]
    fn heat_grid_favours_top_left() {
        let context = VisualContext {
            page_width: 1000.0,
            page_height: 1000.0,
            ..VisualContext::default()
        };
        let grid = HeatGrid::build(&context, 4, 4);
        assert_eq!(grid.hottest(), (0, 0));
        assert!(grid.weight_at(10.0, 10.0) > grid.weight_at(990.0, 990.0));

        let pulled = VisualContext {
            high_contrast: vec![BoundingBox::new(900.0, 900.0, 50.0, 50.0)],
            ..context
        };
        let grid = HeatGrid::build(&pulled, 4, 4);
        assert!(grid.weight_at(925.0, 925.0) > grid.weight_at(600.0, 900.0));
    }

    #[test]
    fn plans_cover_every_element_once() {
        let html = "<main><h2>Listing</h2><p>price=$120,000</p><p>revenue=$5,000/mo</p></main>";
        let snapshot = snapshot_from_html("https://example.com", 200, html);
        let context = VisualContext::analyze(&snapshot);
        let config = ExtractionConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        for pattern in [
            ScanPattern::FPattern,
            ScanPattern::ZPattern,
            ScanPattern::LayerCake,
            ScanPattern::SpotReading,
        ] {
            let plan = ReadingPlan::build(&snapshot, context.clone(), pattern, &config, &mut rng);
            let mut seen: Vec<usize> = plan.chunks.concat();
            seen.sort_unstable();
            assert_eq!(seen, vec![0, 1, 2]);
            assert_eq!(plan.delays.len(), plan.chunks.len());
        }
    }
}

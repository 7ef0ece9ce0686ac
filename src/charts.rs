//! Dashboard payload construction.
//!
//! Turns a normalized table into chart descriptors: five fixed charts for
//! the questions the dashboard exists to answer, then one chart per
//! remaining column with its shape chosen by [`classify_column`].
//! Everything here is pure and deterministic apart from `generated_at`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;

use crate::config::SourceKind;
use crate::error::RefreshError;
use crate::table::{Cell, Table};

/// Label used for null cells in categorical counts.
pub const MISSING_LABEL: &str = "Missing";

/// Columns never charted (case-insensitive).
const DROPPED_COLUMNS: [&str; 3] = ["timestamp", "marca temporal", "id"];

/// Numeric columns above this many distinct values become histograms.
const HISTOGRAM_MIN_DISTINCT: usize = 10;

/// Categorical columns up to this many distinct values render horizontally.
const HORIZONTAL_MAX_DISTINCT: usize = 5;

// ============================================================================
// Payload types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DashboardPayload {
    Ready {
        charts: Vec<ChartDescriptor>,
        source: SourceKind,
        row_count: usize,
        generated_at: String,
    },
    Placeholder {
        message: String,
    },
}

impl DashboardPayload {
    pub fn placeholder(message: impl Into<String>) -> Self {
        DashboardPayload::Placeholder {
            message: message.into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, DashboardPayload::Placeholder { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartDescriptor {
    pub id: String,
    pub title: String,
    #[serde(flatten)]
    pub kind: ChartKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChartKind {
    Histogram {
        buckets: Vec<HistogramBucket>,
    },
    Bar {
        orientation: BarOrientation,
        bars: Vec<BarCount>,
    },
    /// Counts of `x` split by `color`.
    Grouped {
        x: String,
        color: String,
        groups: Vec<GroupedCount>,
    },
    /// The column is not present in the data.
    Empty {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BarOrientation {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub start: f64,
    pub end: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarCount {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupedCount {
    pub x: String,
    pub color: String,
    pub count: usize,
}

// ============================================================================
// Graph selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Histogram,
    HorizontalBar,
    VerticalBar,
}

/// Pick the chart shape for one column.
///
/// A column is numeric when it holds at least one number and no text.
/// Nulls and blank text are both missing and count as one distinct value.
pub fn classify_column(cells: &[&Cell]) -> GraphKind {
    let distinct = distinct_count(cells);
    if is_numeric(cells) && distinct > HISTOGRAM_MIN_DISTINCT {
        GraphKind::Histogram
    } else if distinct <= HORIZONTAL_MAX_DISTINCT {
        GraphKind::HorizontalBar
    } else {
        GraphKind::VerticalBar
    }
}

fn is_numeric(cells: &[&Cell]) -> bool {
    let mut any_number = false;
    for cell in cells {
        match cell {
            Cell::Number(_) => any_number = true,
            Cell::Text(s) if !s.trim().is_empty() => return false,
            Cell::Text(_) | Cell::Null => {}
        }
    }
    any_number
}

fn distinct_count(cells: &[&Cell]) -> usize {
    cells
        .iter()
        .map(|c| label(c))
        .collect::<HashSet<String>>()
        .len()
}

/// Blank sheet cells arrive as empty text; they are missing like nulls.
fn label(cell: &Cell) -> String {
    match cell.as_text() {
        Some(text) if !text.trim().is_empty() => text,
        _ => MISSING_LABEL.to_string(),
    }
}

/// Value counts. Horizontal bars sort ascending, vertical descending; equal
/// counts sort by label.
pub fn count_bars(cells: &[&Cell], orientation: BarOrientation) -> Vec<BarCount> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for cell in cells {
        *counts.entry(label(cell)).or_default() += 1;
    }
    let mut bars: Vec<BarCount> = counts
        .into_iter()
        .map(|(label, count)| BarCount { label, count })
        .collect();
    match orientation {
        BarOrientation::Horizontal => {
            bars.sort_by(|a, b| a.count.cmp(&b.count).then_with(|| a.label.cmp(&b.label)))
        }
        BarOrientation::Vertical => {
            bars.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)))
        }
    }
    bars
}

/// Equal-width buckets over the numeric cells, bucket count by Sturges' rule.
/// The last bucket includes its upper edge.
pub fn histogram(cells: &[&Cell]) -> Vec<HistogramBucket> {
    let values: Vec<f64> = cells
        .iter()
        .filter_map(|c| match c {
            Cell::Number(n) => Some(*n),
            _ => None,
        })
        .collect();
    if values.is_empty() {
        return Vec::new();
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min == max {
        return vec![HistogramBucket {
            start: min,
            end: max,
            count: values.len(),
        }];
    }

    let n_buckets = ((values.len() as f64).log2().ceil() as usize + 1).max(1);
    let width = (max - min) / n_buckets as f64;
    let mut counts = vec![0usize; n_buckets];
    for v in &values {
        let idx = (((v - min) / width) as usize).min(n_buckets - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBucket {
            start: min + width * i as f64,
            end: if i + 1 == n_buckets {
                max
            } else {
                min + width * (i + 1) as f64
            },
            count,
        })
        .collect()
}

fn grouped_counts(x_cells: &[&Cell], color_cells: &[&Cell]) -> Vec<GroupedCount> {
    let mut counts: BTreeMap<(String, String), usize> = BTreeMap::new();
    for (x, color) in x_cells.iter().zip(color_cells) {
        *counts.entry((label(x), label(color))).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|((x, color), count)| GroupedCount { x, color, count })
        .collect()
}

// ============================================================================
// Chart builders
// ============================================================================

fn empty_chart(id: &str, title: &str, missing: &str) -> ChartDescriptor {
    ChartDescriptor {
        id: id.to_string(),
        title: title.to_string(),
        kind: ChartKind::Empty {
            message: format!("No \"{}\" column in the data", missing),
        },
    }
}

fn bar_chart(table: &Table, column: &str, title: &str, orientation: BarOrientation) -> ChartDescriptor {
    match table.column(column) {
        Some(cells) => ChartDescriptor {
            id: column.to_string(),
            title: title.to_string(),
            kind: ChartKind::Bar {
                orientation,
                bars: count_bars(&cells, orientation),
            },
        },
        None => empty_chart(column, title, column),
    }
}

fn grouped_chart(table: &Table, x: &str, color: &str, title: &str) -> ChartDescriptor {
    let id = format!("{}_by_{}", x, color);
    let (x_cells, color_cells) = match (table.column(x), table.column(color)) {
        (Some(x_cells), Some(color_cells)) => (x_cells, color_cells),
        (None, _) => return empty_chart(&id, title, x),
        (_, None) => return empty_chart(&id, title, color),
    };
    ChartDescriptor {
        id,
        title: title.to_string(),
        kind: ChartKind::Grouped {
            x: x.to_string(),
            color: color.to_string(),
            groups: grouped_counts(&x_cells, &color_cells),
        },
    }
}

/// Policy-selected chart for a column; `Empty` when the column is absent.
pub fn optimal_chart(table: &Table, column: &str) -> ChartDescriptor {
    let title = title_case(column);
    let Some(cells) = table.column(column) else {
        return empty_chart(column, &title, column);
    };
    let kind = match classify_column(&cells) {
        GraphKind::Histogram => ChartKind::Histogram {
            buckets: histogram(&cells),
        },
        GraphKind::HorizontalBar => ChartKind::Bar {
            orientation: BarOrientation::Horizontal,
            bars: count_bars(&cells, BarOrientation::Horizontal),
        },
        GraphKind::VerticalBar => ChartKind::Bar {
            orientation: BarOrientation::Vertical,
            bars: count_bars(&cells, BarOrientation::Vertical),
        },
    };
    ChartDescriptor {
        id: column.to_string(),
        title,
        kind,
    }
}

/// `play_frequency` → `Play Frequency`.
pub fn title_case(column: &str) -> String {
    let mut out = String::with_capacity(column.len());
    let mut at_word_start = true;
    for ch in column.replace('_', " ").chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

const PRIORITY_COLUMNS: [&str; 5] = [
    "inclusive_interest",
    "identity",
    "player_gender",
    "orientation",
    "orientation_importance",
];

/// Build the full dashboard from a normalized table.
///
/// An empty table is a data-shape error: there is nothing to chart.
pub fn build_payload(table: &Table, source: SourceKind) -> Result<DashboardPayload, RefreshError> {
    if table.is_empty() {
        return Err(RefreshError::DataShape(format!("{} returned no rows", source)));
    }

    let data = table.retain_columns(|name| !DROPPED_COLUMNS.contains(&name.to_lowercase().as_str()));

    let mut charts = vec![
        bar_chart(
            &data,
            "inclusive_interest",
            "Interest Due to Inclusive Options",
            BarOrientation::Vertical,
        ),
        grouped_chart(
            &data,
            "identity",
            "player_gender",
            "Gender Identity vs. Player Gender Choice",
        ),
        bar_chart(&data, "player_gender", "Player Gender", BarOrientation::Vertical),
        grouped_chart(
            &data,
            "orientation",
            "orientation_importance",
            "Sexual Orientation vs. Importance",
        ),
        bar_chart(
            &data,
            "orientation_importance",
            "Orientation Importance",
            BarOrientation::Vertical,
        ),
    ];

    charts.extend(
        data.columns
            .iter()
            .filter(|c| !PRIORITY_COLUMNS.contains(&c.as_str()))
            .map(|c| optimal_chart(&data, c)),
    );

    Ok(DashboardPayload::Ready {
        charts,
        source,
        row_count: data.row_count(),
        generated_at: Utc::now().to_rfc3339(),
    })
}

//! Substitution table parsing.
//!
//! Parsing happens in two steps: [`extract_rows`] queries the HTML tree for
//! the substitution table and flattens it into [`Row`]s, and [`group_rows`]
//! assigns the rows to weekdays. Only the first step knows about the HTML
//! library.
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::model::{SubstitutionMap, Weekday};
use crate::source::Document;

static CONTENT_REGION: Lazy<Selector> =
    Lazy::new(|| Selector::parse("#wikitext div").expect("valid selector"));
static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").expect("valid selector"));
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("valid selector"));
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("valid selector"));

/// One table row reduced to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Whole row text with line breaks removed.
    pub text: String,
    /// Trimmed text of each `td`, in column order.
    pub cells: Vec<String>,
}

impl Row {
    /// The weekday this row introduces, if its first token is an abbreviation.
    pub fn weekday(&self) -> Option<Weekday> {
        self.text
            .split_whitespace()
            .next()
            .and_then(Weekday::parse_label)
    }

    /// Cells joined by single spaces.
    pub fn line(&self) -> String {
        self.cells.join(" ")
    }
}

/// Parse a fetched page into substitution lines per weekday.
///
/// A page whose content region holds no table yields an empty map.
pub fn parse(document: &Document) -> SubstitutionMap {
    match extract_rows(document) {
        Some(rows) => group_rows(rows),
        None => SubstitutionMap::new(),
    }
}

/// Rows of the first non-empty table inside the page's content region.
pub fn extract_rows(document: &Document) -> Option<Vec<Row>> {
    let html = Html::parse_document(document.html());
    let region = html.select(&CONTENT_REGION).next()?;
    let table = region
        .select(&TABLE)
        .find(|t| t.select(&ROW).next().is_some())?;
    Some(table.select(&ROW).map(row_from_element).collect())
}

fn row_from_element(tr: ElementRef<'_>) -> Row {
    Row {
        text: flatten_text(tr),
        cells: tr
            .select(&CELL)
            .map(|td| flatten_text(td).trim().to_string())
            .collect(),
    }
}

fn flatten_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().replace(['\r', '\n'], "")
}

/// Group rows under the most recent weekday header, keeping document order.
pub fn group_rows(rows: impl IntoIterator<Item = Row>) -> SubstitutionMap {
    let mut map = SubstitutionMap::new();
    let mut current: Option<Weekday> = None;

    for row in rows {
        if let Some(day) = row.weekday() {
            current = Some(day);
            continue;
        }
        if row.cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        match current {
            Some(day) => map.entry(day).or_default().push(row.line()),
            None => debug!(text = %row.text, "skipping row before first weekday header"),
        }
    }

    map
}

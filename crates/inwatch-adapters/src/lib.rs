//! Source table adapters: fetch an HTML page and lift one table into records.

use async_trait::async_trait;
use inwatch_core::{Dataset, Record};
use inwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inwatch-adapters";

/// Where to scrape from: a page URL plus a CSS selector for the table on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTarget {
    pub url: String,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// Rectangular table: every row has exactly `headers.len()` cells.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrapedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ScrapedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_dataset(self) -> Dataset {
        let headers = self.headers;
        self.rows
            .into_iter()
            .map(|row| Record::from_pairs(headers.iter().cloned().zip(row)))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetching source page: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid table selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("no element matches table selector `{selector}`")]
    SelectorNotFound { selector: String },
    #[error("table `{selector}` has no header cells")]
    MissingHeader { selector: String },
    #[error("table row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("table at {url} has no data rows")]
    Empty { url: String },
}

#[async_trait]
pub trait TableSource: Send + Sync {
    async fn fetch_table(
        &self,
        ctx: &AdapterContext,
        target: &TableTarget,
    ) -> Result<ScrapedTable, ScrapeError>;
}

fn parse_selector(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn cell_text(node: ElementRef<'_>) -> String {
    node.text().collect::<String>().trim().to_string()
}

/// Extracts the first table matching `selector` from an HTML document.
///
/// Headers are all `th` cells of the table; data rows are the `tr` elements that
/// contain `td` cells. Cell text is trimmed. A table without headers or with a row
/// whose width differs from the header is rejected.
pub fn extract_table(html: &str, selector: &str) -> Result<ScrapedTable, ScrapeError> {
    let table_sel = parse_selector(selector)?;
    let th_sel = parse_selector("th")?;
    let tr_sel = parse_selector("tr")?;
    let td_sel = parse_selector("td")?;

    let document = Html::parse_document(html);
    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| ScrapeError::SelectorNotFound {
            selector: selector.to_string(),
        })?;

    let headers: Vec<String> = table.select(&th_sel).map(cell_text).collect();
    if headers.is_empty() {
        return Err(ScrapeError::MissingHeader {
            selector: selector.to_string(),
        });
    }

    let mut rows = Vec::new();
    for tr in table.select(&tr_sel) {
        let cells: Vec<String> = tr.select(&td_sel).map(cell_text).collect();
        if cells.is_empty() {
            continue;
        }
        if cells.len() != headers.len() {
            return Err(ScrapeError::RaggedRow {
                row: rows.len() + 1,
                expected: headers.len(),
                found: cells.len(),
            });
        }
        rows.push(cells);
    }

    Ok(ScrapedTable { headers, rows })
}

/// Live HTML source: one GET per run, then [`extract_table`].
#[derive(Debug, Clone)]
pub struct HtmlTableSource {
    http: HttpFetcher,
}

impl HtmlTableSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TableSource for HtmlTableSource {
    async fn fetch_table(
        &self,
        ctx: &AdapterContext,
        target: &TableTarget,
    ) -> Result<ScrapedTable, ScrapeError> {
        let page = self.http.fetch_bytes(ctx.run_id, &target.url).await?;
        let html = String::from_utf8_lossy(&page.body);
        let table = extract_table(&html, &target.selector)?;
        if table.is_empty() {
            warn!(url = %page.final_url, selector = %target.selector, "table has no rows");
        } else {
            info!(
                url = %page.final_url,
                columns = table.headers.len(),
                rows = table.rows.len(),
                "scraped source table"
            );
        }
        Ok(table)
    }
}

//! Source locators (artifact discovery) and table extractors.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use psr_core::{CandidateArtifact, RawRow, Recency};
use psr_storage::{ArtifactStore, HttpFetcher, StoredArtifact};
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psr-adapters";

pub const DEFAULT_DOCUMENT_PATTERN: &str = r"(?i)Payment-Standards[^/]*\.pdf";
pub const DEFAULT_YEAR_WINDOW: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    Static,
    CatalogApi,
    PageScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
        }
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.started_at.date_naive()
    }
}

/// Discovery settings as written in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    Static {
        url: String,
        #[serde(default)]
        year: Option<i32>,
        #[serde(default = "default_year_window")]
        year_window: u32,
    },
    CatalogApi {
        api_base: String,
        dataset_id: String,
        #[serde(default = "default_catalog_format")]
        format: String,
    },
    PageScan {
        page_url: String,
        base_url: String,
        #[serde(default = "default_document_pattern")]
        document_pattern: String,
        #[serde(default = "default_year_window")]
        year_window: u32,
    },
}

fn default_catalog_format() -> String {
    "CSV".to_string()
}

fn default_document_pattern() -> String {
    DEFAULT_DOCUMENT_PATTERN.to_string()
}

fn default_year_window() -> u32 {
    DEFAULT_YEAR_WINDOW
}

/// Finds candidate artifacts. An empty result is a normal outcome; failures are logged, not raised.
#[async_trait]
pub trait SourceLocator: Send + Sync {
    fn strategy(&self) -> DiscoveryStrategy;

    async fn discover(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Vec<CandidateArtifact>;
}

/// Pick the candidate with the greatest recency; ties keep the first seen, unknown recency never wins.
pub fn select_latest(candidates: &[CandidateArtifact]) -> Option<&CandidateArtifact> {
    let mut best: Option<(&CandidateArtifact, i64)> = None;
    for candidate in candidates {
        let Some(recency) = candidate.recency else {
            continue;
        };
        let value = recency.value();
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((candidate, value)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

pub fn locator_for(config: &DiscoveryConfig) -> Result<Box<dyn SourceLocator>> {
    match config {
        DiscoveryConfig::Static {
            url,
            year,
            year_window,
        } => Ok(Box::new(StaticLocator {
            url: url.clone(),
            year: *year,
            year_window: *year_window,
        })),
        DiscoveryConfig::CatalogApi {
            api_base,
            dataset_id,
            format,
        } => Ok(Box::new(CatalogApiLocator {
            api_base: api_base.trim_end_matches('/').to_string(),
            dataset_id: dataset_id.clone(),
            format: format.clone(),
        })),
        DiscoveryConfig::PageScan {
            page_url,
            base_url,
            document_pattern,
            year_window,
        } => Ok(Box::new(PageScanLocator::new(
            page_url,
            base_url,
            document_pattern,
            *year_window,
        )?)),
    }
}

/// A single, fixed document URL.
#[derive(Debug, Clone)]
pub struct StaticLocator {
    pub url: String,
    pub year: Option<i32>,
    /// Only used when `year` is unset and the file name has to supply it.
    pub year_window: u32,
}

#[async_trait]
impl SourceLocator for StaticLocator {
    fn strategy(&self) -> DiscoveryStrategy {
        DiscoveryStrategy::Static
    }

    async fn discover(&self, _http: &HttpFetcher, ctx: &AdapterContext) -> Vec<CandidateArtifact> {
        let label = ArtifactStore::artifact_file_name(&self.url, "static-artifact");
        let year = self.year.or_else(|| {
            plausible_year(&label, ctx.reference_date().year(), self.year_window)
        });
        vec![CandidateArtifact {
            url: self.url.clone(),
            recency: year.map(Recency::Year),
            label,
        }]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageShowResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<PackageShowResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageShowResult {
    #[serde(default)]
    pub resources: Vec<CatalogResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogResource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

/// CKAN-style `package_show` dataset lookup.
#[derive(Debug, Clone)]
pub struct CatalogApiLocator {
    pub api_base: String,
    pub dataset_id: String,
    pub format: String,
}

impl CatalogApiLocator {
    pub fn package_show_url(&self) -> Result<Url> {
        let endpoint = format!("{}/action/package_show", self.api_base);
        Url::parse_with_params(&endpoint, &[("id", self.dataset_id.as_str())])
            .with_context(|| format!("building package_show url from {endpoint}"))
    }
}

#[async_trait]
impl SourceLocator for CatalogApiLocator {
    fn strategy(&self) -> DiscoveryStrategy {
        DiscoveryStrategy::CatalogApi
    }

    async fn discover(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Vec<CandidateArtifact> {
        let url = match self.package_show_url() {
            Ok(url) => url,
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "invalid catalog endpoint");
                return Vec::new();
            }
        };
        let response: PackageShowResponse = match http.fetch_json(url.as_str()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(run_id = %ctx.run_id, url = %url, error = %err, "catalog lookup failed");
                return Vec::new();
            }
        };
        let candidates = catalog_candidates(&response, &self.format);
        info!(
            run_id = %ctx.run_id,
            dataset = %self.dataset_id,
            candidates = candidates.len(),
            "catalog resources discovered"
        );
        candidates
    }
}

/// Resources of the expected format from a successful `package_show` payload.
pub fn catalog_candidates(response: &PackageShowResponse, format: &str) -> Vec<CandidateArtifact> {
    if !response.success {
        return Vec::new();
    }
    let Some(result) = &response.result else {
        return Vec::new();
    };
    result
        .resources
        .iter()
        .filter(|r| {
            r.format
                .as_deref()
                .is_some_and(|f| f.trim().eq_ignore_ascii_case(format))
        })
        .filter_map(|r| {
            let url = r.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
            let label = r
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .or_else(|| r.id.clone())
                .unwrap_or_else(|| ArtifactStore::artifact_file_name(url, "resource"));
            Some(CandidateArtifact {
                url: url.to_string(),
                recency: r
                    .created
                    .as_deref()
                    .and_then(parse_catalog_timestamp)
                    .map(Recency::Created),
                label,
            })
        })
        .collect()
}

/// CKAN emits naive ISO timestamps (`2024-03-01T12:00:00.123456`); treat them as UTC.
pub fn parse_catalog_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Scans an HTML page for document links.
#[derive(Debug, Clone)]
pub struct PageScanLocator {
    pub page_url: String,
    pub base_url: Url,
    pub document_pattern: Regex,
    pub year_window: u32,
}

impl PageScanLocator {
    pub fn new(page_url: &str, base_url: &str, document_pattern: &str, year_window: u32) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parsing base url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("base url {base_url} cannot resolve relative links"));
        }
        let document_pattern = Regex::new(document_pattern)
            .with_context(|| format!("compiling document pattern {document_pattern}"))?;
        Ok(Self {
            page_url: page_url.to_string(),
            base_url,
            document_pattern,
            year_window,
        })
    }
}

#[async_trait]
impl SourceLocator for PageScanLocator {
    fn strategy(&self) -> DiscoveryStrategy {
        DiscoveryStrategy::PageScan
    }

    async fn discover(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Vec<CandidateArtifact> {
        let html = match http.fetch_text(&self.page_url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(run_id = %ctx.run_id, url = %self.page_url, error = %err, "page scan fetch failed");
                return Vec::new();
            }
        };
        let candidates = scan_document_links(
            &html,
            &self.base_url,
            &self.document_pattern,
            ctx.reference_date().year(),
            self.year_window,
        );
        let undated = candidates.iter().filter(|c| c.recency.is_none()).count();
        info!(
            run_id = %ctx.run_id,
            url = %self.page_url,
            candidates = candidates.len(),
            undated,
            "document links discovered"
        );
        candidates
    }
}

/// Every `a[href]` matching `pattern`, resolved against `base`, deduplicated by URL.
pub fn scan_document_links(
    html: &str,
    base: &Url,
    pattern: &Regex,
    reference_year: i32,
    year_window: u32,
) -> Vec<CandidateArtifact> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut out: Vec<CandidateArtifact> = Vec::new();
    for href in document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| pattern.is_match(href))
    {
        let Ok(url) = base.join(href) else {
            warn!(href, "skipping unresolvable document link");
            continue;
        };
        let url = url.to_string();
        if out.iter().any(|c| c.url == url) {
            continue;
        }
        let label = ArtifactStore::artifact_file_name(&url, href);
        let recency = plausible_year(&label, reference_year, year_window).map(Recency::Year);
        out.push(CandidateArtifact { url, recency, label });
    }
    out
}

/// First run of exactly four digits in `name` within `reference_year ± window`.
///
/// Other four-digit runs (street numbers, building codes) are ignored.
pub fn plausible_year(name: &str, reference_year: i32, window: u32) -> Option<i32> {
    let window = window as i32;
    DIGIT_RUNS
        .as_ref()?
        .find_iter(name)
        .map(|run| run.as_str())
        .filter(|run| run.len() == 4)
        .filter_map(|run| run.parse::<i32>().ok())
        .find(|year| (year - reference_year).abs() <= window)
}

static DIGIT_RUNS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[0-9]+").ok());

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("reading artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing table from {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("extractor `{program}` failed for {path}: {message}")]
    Command {
        program: String,
        path: String,
        message: String,
    },
    #[error("no table rows found in {path}")]
    NoRows { path: String },
}

/// Extractor settings as written in `sources.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    #[default]
    Csv,
    /// An external layout tool invoked as `program args... <artifact path>`, printing CSV to stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_command_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_command_timeout_secs() -> u64 {
    120
}

/// Turns a stored artifact into raw table rows.
#[async_trait]
pub trait TableExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, artifact: &StoredArtifact) -> Result<Vec<RawRow>, ExtractionError>;
}

pub fn extractor_for(config: &ExtractorConfig) -> Box<dyn TableExtractor> {
    match config {
        ExtractorConfig::Csv => Box::new(CsvTableExtractor),
        ExtractorConfig::Command {
            program,
            args,
            timeout_secs,
        } => Box::new(CommandTableExtractor {
            program: program.clone(),
            args: args.clone(),
            timeout: Duration::from_secs((*timeout_secs).max(1)),
        }),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvTableExtractor;

#[async_trait]
impl TableExtractor for CsvTableExtractor {
    fn name(&self) -> &str {
        "csv"
    }

    async fn extract(&self, artifact: &StoredArtifact) -> Result<Vec<RawRow>, ExtractionError> {
        let path = artifact.absolute_path.display().to_string();
        let bytes = tokio::fs::read(&artifact.absolute_path)
            .await
            .map_err(|source| ExtractionError::Io {
                path: path.clone(),
                source,
            })?;
        parse_csv_rows(&bytes, &path)
    }
}

#[derive(Debug, Clone)]
pub struct CommandTableExtractor {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl TableExtractor for CommandTableExtractor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn extract(&self, artifact: &StoredArtifact) -> Result<Vec<RawRow>, ExtractionError> {
        let path = artifact.absolute_path.display().to_string();
        let command_error = |message: String| ExtractionError::Command {
            program: self.program.clone(),
            path: path.clone(),
            message,
        };

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&artifact.absolute_path)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| command_error(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| command_error(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(command_error(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        parse_csv_rows(&output.stdout, &path)
    }
}

/// Header-keyed rows from CSV bytes; blank lines are skipped.
pub fn parse_csv_rows(bytes: &[u8], path: &str) -> Result<Vec<RawRow>, ExtractionError> {
    let csv_error = |source: csv::Error| ExtractionError::Csv {
        path: path.to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers().map_err(csv_error)?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        let mut row = RawRow::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            row.push(header, cell);
        }
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(ExtractionError::NoRows {
            path: path.to_string(),
        });
    }
    Ok(rows)
}

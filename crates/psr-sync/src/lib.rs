//! Payment-standard sync pipeline: update gate, normalization, sinks and orchestration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use psr_adapters::{
    extractor_for, locator_for, select_latest, AdapterContext, DiscoveryConfig, ExtractionError,
    ExtractorConfig, SourceLocator, TableExtractor,
};
use psr_core::{CandidateArtifact, IngestionMarker, Provenance, RawRow, Recency, RentRecord, RENT_COLUMNS};
use psr_storage::{
    write_atomically, ArtifactStore, FetchError, HttpClientConfig, HttpFetcher, MarkerFile,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psr-sync";

pub const RENTS_TABLE: &str = "rents";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let registry: SourceRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut seen = BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {} in {}", source.source_id, path.display());
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// `{recency}` is replaced by the artifact's year or creation date.
    #[serde(default)]
    pub label_template: Option<String>,
    #[serde(default)]
    pub effective_date: EffectiveDateRule,
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub county: CountyConfig,
    /// Extra source column label -> canonical column name.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default = "default_destinations")]
    pub destinations: BTreeSet<Destination>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_destinations() -> BTreeSet<Destination> {
    [Destination::CsvFile, Destination::JsonFile, Destination::Table]
        .into_iter()
        .collect()
}

impl SourceConfig {
    pub fn label_for(&self, recency: Recency) -> String {
        match &self.label_template {
            Some(template) => template.replace("{recency}", &recency.to_string()),
            None => format!("{} {}", self.display_name, recency),
        }
    }

    pub fn file_stem(&self, recency: Recency) -> String {
        format!("{}_{}", self.source_id, recency)
    }
}

/// Month/day a year's payment standards take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EffectiveDateRule {
    #[serde(default = "default_effective_month")]
    pub month: u32,
    #[serde(default = "default_effective_day")]
    pub day: u32,
}

fn default_effective_month() -> u32 {
    7
}

fn default_effective_day() -> u32 {
    1
}

impl Default for EffectiveDateRule {
    fn default() -> Self {
        Self {
            month: default_effective_month(),
            day: default_effective_day(),
        }
    }
}

impl EffectiveDateRule {
    pub fn effective_date(&self, recency: Recency) -> NaiveDate {
        match recency {
            Recency::Year(year) => NaiveDate::from_ymd_opt(year, self.month, self.day)
                .or_else(|| NaiveDate::from_ymd_opt(year, 1, 1))
                .unwrap_or(NaiveDate::MIN),
            Recency::Created(ts) => ts.date_naive(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CountyConfig {
    #[serde(default)]
    pub default: Option<String>,
    /// Locality -> county.
    #[serde(default)]
    pub lookup: BTreeMap<String, String>,
}

pub const FALLBACK_COUNTY: &str = "Unknown";

impl CountyConfig {
    /// Exact locality first, then the part before `" - "` (`Boston - Allston` -> `Boston`).
    pub fn resolve(&self, locality: &str) -> String {
        let find = |name: &str| {
            self.lookup
                .iter()
                .find(|(k, _)| k.trim().eq_ignore_ascii_case(name.trim()))
                .map(|(_, v)| v.clone())
        };
        find(locality)
            .or_else(|| locality.split(" - ").next().and_then(find))
            .or_else(|| self.default.clone())
            .unwrap_or_else(|| FALLBACK_COUNTY.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub discovery_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub log_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/rents.db?mode=rwc".to_string()),
            data_dir: std::env::var("PSR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            workspace_root: std::env::var("PSR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("PSR_USER_AGENT").unwrap_or_else(|_| "psr-bot/0.1".to_string()),
            discovery_timeout_secs: env_secs("PSR_DISCOVERY_TIMEOUT_SECS", 30),
            fetch_timeout_secs: env_secs("PSR_FETCH_TIMEOUT_SECS", 60),
            log_file: std::env::var("PSR_LOG_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            scheduler_enabled: std::env::var("PSR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("PSR_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            file: self.log_file.clone(),
            default_filter: "info".to_string(),
        }
    }
}

/// Timeouts must be finite and non-zero.
fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub default_filter: String,
}

/// Keeps the log file open for the life of the process and syncs it on drop.
pub struct LogGuard {
    file: Option<Arc<std::fs::File>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.sync_all();
        }
    }
}

/// Install the process-wide subscriber: console always, plus an appending file sink when configured.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_filter))
    };

    let file = config.file.as_deref().map(open_log_file).transpose()?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file.clone().map(|file| file_layer(file, filter())))
        .with(console_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LogGuard { file })
}

fn open_log_file(path: &Path) -> Result<Arc<std::fs::File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    Ok(Arc::new(file))
}

/// Plain-text fmt layer writing to the shared log file.
fn file_layer(file: Arc<std::fs::File>, filter: EnvFilter) -> impl Layer<Registry> + Send + Sync + 'static {
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file)
        .with_filter(filter)
}

/// Ingest when nothing was ingested yet or the candidate is strictly newer.
pub fn should_ingest(marker: Option<&IngestionMarker>, candidate_recency: i64) -> bool {
    match marker {
        None => true,
        Some(marker) => candidate_recency > marker.last_recency,
    }
}

pub const CANONICAL_COLUMNS: [&str; 10] = [
    "locality",
    "postal_code",
    "county",
    RENT_COLUMNS[0],
    RENT_COLUMNS[1],
    RENT_COLUMNS[2],
    RENT_COLUMNS[3],
    RENT_COLUMNS[4],
    RENT_COLUMNS[5],
    RENT_COLUMNS[6],
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    pub records: Vec<RentRecord>,
    pub dropped: usize,
    pub degraded_fields: usize,
}

/// Maps source column labels onto `RentRecord` and stamps provenance.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    aliases: HashMap<String, &'static str>,
    county: CountyConfig,
}

impl SchemaNormalizer {
    pub fn new(overrides: &BTreeMap<String, String>, county: CountyConfig) -> Result<Self> {
        let mut aliases = default_aliases();
        for (label, canonical) in overrides {
            let Some(canonical) = CANONICAL_COLUMNS
                .iter()
                .find(|c| c.eq_ignore_ascii_case(canonical.trim()))
            else {
                bail!("column override {label:?} targets unknown column {canonical:?}");
            };
            aliases.insert(normalize_label(label), *canonical);
        }
        Ok(Self { aliases, county })
    }

    pub fn for_source(source: &SourceConfig) -> Result<Self> {
        Self::new(&source.columns, source.county.clone())
    }

    pub fn normalize(&self, rows: &[RawRow], provenance: &Provenance) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();

        for (index, row) in rows.iter().enumerate() {
            let mut locality: Option<String> = None;
            let mut postal_code: Option<String> = None;
            let mut county: Option<String> = None;
            let mut record = RentRecord {
                locality: String::new(),
                postal_code: String::new(),
                county: String::new(),
                studio_rent: None,
                one_br_rent: None,
                two_br_rent: None,
                three_br_rent: None,
                four_br_rent: None,
                five_br_rent: None,
                six_br_rent: None,
                source_id: provenance.source_id.clone(),
                source_label: provenance.source_label.clone(),
                effective_date: provenance.effective_date,
                ingested_at: provenance.ingested_at,
            };
            let mut degraded = 0usize;

            for (label, value) in row.iter() {
                let Some(canonical) = self.aliases.get(&normalize_label(label)) else {
                    continue;
                };
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                match *canonical {
                    "locality" => {
                        locality.get_or_insert_with(|| value.to_string());
                    }
                    "postal_code" => {
                        postal_code.get_or_insert_with(|| normalize_postal_code(value));
                    }
                    "county" => {
                        county.get_or_insert_with(|| value.to_string());
                    }
                    rent_column => {
                        let Some(slot) = record.rent_mut(rent_column) else {
                            continue;
                        };
                        match parse_rent(value) {
                            Some(rent) => {
                                slot.get_or_insert(rent);
                            }
                            None => {
                                debug!(row = index, column = rent_column, value, "unparseable rent cell");
                                degraded += 1;
                            }
                        }
                    }
                }
            }

            let Some(postal_code) = postal_code else {
                debug!(row = index, "dropping row without postal code");
                outcome.dropped += 1;
                continue;
            };
            if record.rents().iter().all(Option::is_none) {
                debug!(row = index, %postal_code, "dropping row without any rent");
                outcome.dropped += 1;
                continue;
            }

            record.locality = locality.unwrap_or_default();
            record.county = county.unwrap_or_else(|| self.county.resolve(&record.locality));
            record.postal_code = postal_code;
            outcome.degraded_fields += degraded;
            outcome.records.push(record);
        }

        outcome
    }
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn default_aliases() -> HashMap<String, &'static str> {
    let mut aliases = HashMap::new();
    let mut add = |labels: &[&str], canonical: &'static str| {
        for label in labels {
            aliases.insert(normalize_label(label), canonical);
        }
    };
    add(&["locality", "city", "town", "municipality", "community", "city/town"], "locality");
    add(
        &["postal_code", "zip", "zip_code", "zipcode", "zip code", "postal code", "postcode"],
        "postal_code",
    );
    add(&["county"], "county");
    add(
        &["studio_rent", "studio", "0_br", "0br", "0-br", "0 br", "0 bedroom", "efficiency"],
        RENT_COLUMNS[0],
    );

    let words = ["one", "two", "three", "four", "five", "six"];
    for (i, word) in words.iter().enumerate() {
        let n = i + 1;
        let canonical = RENT_COLUMNS[n];
        for label in [
            canonical.to_string(),
            format!("{n}br"),
            format!("{n}_br"),
            format!("{n}-br"),
            format!("{n} br"),
            format!("{n} bedroom"),
            format!("{n}_bedroom"),
            format!("{word}_br"),
            format!("{word} bedroom"),
        ] {
            aliases.insert(normalize_label(&label), canonical);
        }
    }
    aliases
}

/// Zero-pads numeric postal codes that lost their leading zero (`2108` -> `02108`).
fn normalize_postal_code(value: &str) -> String {
    if !value.is_empty() && value.len() < 5 && value.chars().all(|c| c.is_ascii_digit()) {
        format!("{value:0>5}")
    } else {
        value.to_string()
    }
}

/// Whole-dollar rent from cells like `3,450`, `$3450` or `3450.00`.
fn parse_rent(value: &str) -> Option<u32> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if let Ok(rent) = cleaned.parse::<u32>() {
        return Some(rent);
    }
    let amount = cleaned.parse::<f64>().ok()?;
    if amount.is_finite() && amount >= 0.0 && amount.fract() == 0.0 && amount <= f64::from(u32::MAX) {
        Some(amount as u32)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    CsvFile,
    JsonFile,
    Table,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Destination::CsvFile => "csv_file",
            Destination::JsonFile => "json_file",
            Destination::Table => "table",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{operation} on {table}: {source}")]
    Database {
        table: String,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("writing {path}: {message}")]
    File { path: String, message: String },
    #[error("no relational table configured")]
    NoTable,
}

/// The relational `rents` table. Replacement is keyed on the structured `source_id`.
#[async_trait]
pub trait RentTable: Send + Sync {
    fn describe(&self) -> String;

    async fn ensure_schema(&self) -> Result<(), SinkError>;

    /// Delete every row of `source_id`, then insert `records`, in one transaction.
    async fn replace_source(&self, source_id: &str, records: &[RentRecord]) -> Result<u64, SinkError>;

    async fn load_source(&self, source_id: &str) -> Result<Vec<RentRecord>, SinkError>;
}

const PG_SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS rents (
  id BIGSERIAL PRIMARY KEY,
  locality TEXT NOT NULL,
  postal_code TEXT NOT NULL,
  county TEXT NOT NULL,
  studio_rent BIGINT NULL,
  one_br_rent BIGINT NULL,
  two_br_rent BIGINT NULL,
  three_br_rent BIGINT NULL,
  four_br_rent BIGINT NULL,
  five_br_rent BIGINT NULL,
  six_br_rent BIGINT NULL,
  source_id TEXT NOT NULL,
  source TEXT NOT NULL,
  effective_date DATE NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS rents_source_id_idx ON rents(source_id, postal_code)",
];

const SQLITE_SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS rents (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  locality TEXT NOT NULL,
  postal_code TEXT NOT NULL,
  county TEXT NOT NULL,
  studio_rent INTEGER NULL,
  one_br_rent INTEGER NULL,
  two_br_rent INTEGER NULL,
  three_br_rent INTEGER NULL,
  four_br_rent INTEGER NULL,
  five_br_rent INTEGER NULL,
  six_br_rent INTEGER NULL,
  source_id TEXT NOT NULL,
  source TEXT NOT NULL,
  effective_date TEXT NOT NULL,
  updated_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS rents_source_id_idx ON rents(source_id, postal_code)",
];

const RENT_COLUMN_LIST: &str = "locality, postal_code, county, studio_rent, one_br_rent, two_br_rent, \
three_br_rent, four_br_rent, five_br_rent, six_br_rent, source_id, source, effective_date, updated_at";

macro_rules! bind_rent_record {
    ($query:expr, $record:expr) => {{
        let r = $record;
        $query
            .bind(&r.locality)
            .bind(&r.postal_code)
            .bind(&r.county)
            .bind(r.studio_rent.map(i64::from))
            .bind(r.one_br_rent.map(i64::from))
            .bind(r.two_br_rent.map(i64::from))
            .bind(r.three_br_rent.map(i64::from))
            .bind(r.four_br_rent.map(i64::from))
            .bind(r.five_br_rent.map(i64::from))
            .bind(r.six_br_rent.map(i64::from))
            .bind(&r.source_id)
            .bind(&r.source_label)
            .bind(r.effective_date)
            .bind(r.ingested_at)
    }};
}

macro_rules! rent_record_from_row {
    ($row:expr) => {{
        let row = $row;
        let rent = |column: &str| -> Result<Option<u32>, sqlx::Error> {
            Ok(row
                .try_get::<Option<i64>, _>(column)?
                .and_then(|v| u32::try_from(v).ok()))
        };
        Ok::<RentRecord, sqlx::Error>(RentRecord {
            locality: row.try_get("locality")?,
            postal_code: row.try_get("postal_code")?,
            county: row.try_get("county")?,
            studio_rent: rent("studio_rent")?,
            one_br_rent: rent("one_br_rent")?,
            two_br_rent: rent("two_br_rent")?,
            three_br_rent: rent("three_br_rent")?,
            four_br_rent: rent("four_br_rent")?,
            five_br_rent: rent("five_br_rent")?,
            six_br_rent: rent("six_br_rent")?,
            source_id: row.try_get("source_id")?,
            source_label: row.try_get("source")?,
            effective_date: row.try_get("effective_date")?,
            ingested_at: row.try_get("updated_at")?,
        })
    }};
}

#[derive(Clone)]
pub struct PgRentTable {
    pool: PgPool,
}

impl PgRentTable {
    /// The pool connects on first use, so runs that never reach the write stage never touch the database.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(database_url)
            .context("parsing postgres DATABASE_URL")?;
        Ok(Self { pool })
    }

    fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> SinkError {
        move |source| SinkError::Database {
            table: format!("postgres:{RENTS_TABLE}"),
            operation,
            source,
        }
    }
}

#[async_trait]
impl RentTable for PgRentTable {
    fn describe(&self) -> String {
        format!("postgres:{RENTS_TABLE}")
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        for statement in PG_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(Self::db_error("create schema"))?;
        }
        Ok(())
    }

    async fn replace_source(&self, source_id: &str, records: &[RentRecord]) -> Result<u64, SinkError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(Self::db_error("begin"))?;
        let deleted = sqlx::query("DELETE FROM rents WHERE source_id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(Self::db_error("delete"))?
            .rows_affected();

        let insert = format!(
            "INSERT INTO rents ({RENT_COLUMN_LIST}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        );
        for record in records {
            bind_rent_record!(sqlx::query(&insert), record)
                .execute(&mut *tx)
                .await
                .map_err(Self::db_error("insert"))?;
        }
        tx.commit().await.map_err(Self::db_error("commit"))?;
        debug!(source_id, deleted, inserted = records.len(), "postgres rents replaced");
        Ok(records.len() as u64)
    }

    async fn load_source(&self, source_id: &str) -> Result<Vec<RentRecord>, SinkError> {
        let rows = sqlx::query(&format!(
            "SELECT {RENT_COLUMN_LIST} FROM rents WHERE source_id = $1 ORDER BY id"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_error("select"))?;
        rows.iter()
            .map(|row| rent_record_from_row!(row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::db_error("decode"))
    }
}

#[derive(Clone)]
pub struct SqliteRentTable {
    pool: SqlitePool,
    label: String,
}

impl SqliteRentTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::connect_lazy(&format!("sqlite://{}?mode=rwc", path.display()))
    }

    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing sqlite url {database_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let filename = opts.get_filename().to_path_buf();
        if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating sqlite directory {}", parent.display()))?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(opts);
        Ok(Self {
            pool,
            label: format!("sqlite:{}#{RENTS_TABLE}", filename.display()),
        })
    }

    fn db_error(&self, operation: &'static str) -> impl FnOnce(sqlx::Error) -> SinkError {
        let table = self.label.clone();
        move |source| SinkError::Database {
            table,
            operation,
            source,
        }
    }
}

#[async_trait]
impl RentTable for SqliteRentTable {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        for statement in SQLITE_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(self.db_error("create schema"))?;
        }
        Ok(())
    }

    async fn replace_source(&self, source_id: &str, records: &[RentRecord]) -> Result<u64, SinkError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(self.db_error("begin"))?;
        let deleted = sqlx::query("DELETE FROM rents WHERE source_id = ?1")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(self.db_error("delete"))?
            .rows_affected();

        let insert = format!(
            "INSERT INTO rents ({RENT_COLUMN_LIST}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        );
        for record in records {
            bind_rent_record!(sqlx::query(&insert), record)
                .execute(&mut *tx)
                .await
                .map_err(self.db_error("insert"))?;
        }
        tx.commit().await.map_err(self.db_error("commit"))?;
        debug!(source_id, deleted, inserted = records.len(), "sqlite rents replaced");
        Ok(records.len() as u64)
    }

    async fn load_source(&self, source_id: &str) -> Result<Vec<RentRecord>, SinkError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(&format!(
            "SELECT {RENT_COLUMN_LIST} FROM rents WHERE source_id = ?1 ORDER BY id"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(self.db_error("select"))?;
        rows.iter()
            .map(|row| rent_record_from_row!(row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(self.db_error("decode"))
    }
}

/// `sqlite:` URLs open a local file, anything else is treated as Postgres.
pub fn connect_rent_table(database_url: &str) -> Result<Arc<dyn RentTable>> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteRentTable::connect_lazy(database_url)?))
    } else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        Ok(Arc::new(PgRentTable::connect_lazy(database_url)?))
    } else {
        bail!("unsupported DATABASE_URL scheme (expected sqlite: or postgres:)")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationStatus {
    Written { rows: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationOutcome {
    pub destination: Destination,
    pub location: String,
    pub status: DestinationStatus,
}

impl DestinationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, DestinationStatus::Written { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            DestinationStatus::Failed { error } => Some(error),
            DestinationStatus::Written { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkReport {
    pub outcomes: Vec<DestinationOutcome>,
}

impl SinkReport {
    pub fn outcome(&self, destination: Destination) -> Option<&DestinationOutcome> {
        self.outcomes.iter().find(|o| o.destination == destination)
    }

    /// The table write decides; flat files are backups. Without a table every requested file must succeed.
    pub fn succeeded(&self) -> bool {
        match self.outcome(Destination::Table) {
            Some(table) => table.is_ok(),
            None => !self.outcomes.is_empty() && self.outcomes.iter().all(DestinationOutcome::is_ok),
        }
    }

    pub fn first_failure(&self) -> Option<&DestinationOutcome> {
        self.outcome(Destination::Table)
            .filter(|o| !o.is_ok())
            .or_else(|| self.outcomes.iter().find(|o| !o.is_ok()))
    }
}

#[derive(Debug, Clone, Serialize)]
struct RentsDocument<'a> {
    source: &'a str,
    source_id: &'a str,
    effective_date: NaiveDate,
    updated_at: DateTime<Utc>,
    recency: Recency,
    rents: &'a [RentRecord],
}

pub struct SinkTarget<'a> {
    pub data_dir: &'a Path,
    pub file_stem: String,
    pub provenance: &'a Provenance,
    pub recency: Recency,
}

pub struct Sink {
    destinations: BTreeSet<Destination>,
    table: Option<Arc<dyn RentTable>>,
}

impl Sink {
    pub fn new(destinations: BTreeSet<Destination>, table: Option<Arc<dyn RentTable>>) -> Self {
        Self { destinations, table }
    }

    /// Write every destination independently; one failure never blocks the others.
    pub async fn write(&self, records: &[RentRecord], target: &SinkTarget<'_>) -> SinkReport {
        let mut report = SinkReport::default();
        for destination in &self.destinations {
            let (location, result) = match destination {
                Destination::CsvFile => {
                    let path = target.data_dir.join(format!("{}.csv", target.file_stem));
                    let result = write_csv(&path, records).await;
                    (path.display().to_string(), result)
                }
                Destination::JsonFile => {
                    let path = target.data_dir.join(format!("{}.json", target.file_stem));
                    let result = write_json(&path, records, target).await;
                    (path.display().to_string(), result)
                }
                Destination::Table => match &self.table {
                    Some(table) => (
                        table.describe(),
                        table
                            .replace_source(&target.provenance.source_id, records)
                            .await
                            .map(|n| n as usize),
                    ),
                    None => (RENTS_TABLE.to_string(), Err(SinkError::NoTable)),
                },
            };

            let status = match result {
                Ok(rows) => {
                    info!(destination = %destination, %location, rows, "sink destination written");
                    DestinationStatus::Written { rows }
                }
                Err(err) => {
                    warn!(destination = %destination, %location, error = %err, "sink destination failed");
                    DestinationStatus::Failed {
                        error: err.to_string(),
                    }
                }
            };
            report.outcomes.push(DestinationOutcome {
                destination: *destination,
                location,
                status,
            });
        }
        report
    }
}

/// Canonical-column CSV, replacing any previous file.
pub async fn write_csv(path: &Path, records: &[RentRecord]) -> Result<usize, SinkError> {
    let file_error = |message: String| SinkError::File {
        path: path.display().to_string(),
        message,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record).map_err(|e| file_error(e.to_string()))?;
    }
    if records.is_empty() {
        writer
            .write_record(csv_header())
            .map_err(|e| file_error(e.to_string()))?;
    }
    let bytes = writer.into_inner().map_err(|e| file_error(e.to_string()))?;
    write_atomically(path, &bytes)
        .await
        .map_err(|e| file_error(format!("{e:#}")))?;
    Ok(records.len())
}

fn csv_header() -> Vec<&'static str> {
    let mut header = vec!["locality", "postal_code", "county"];
    header.extend(RENT_COLUMNS);
    header.extend(["source_id", "source", "effective_date", "updated_at"]);
    header
}

async fn write_json(path: &Path, records: &[RentRecord], target: &SinkTarget<'_>) -> Result<usize, SinkError> {
    let file_error = |message: String| SinkError::File {
        path: path.display().to_string(),
        message,
    };
    let document = RentsDocument {
        source: &target.provenance.source_label,
        source_id: &target.provenance.source_id,
        effective_date: target.provenance.effective_date,
        updated_at: target.provenance.ingested_at,
        recency: target.recency,
        rents: records,
    };
    let bytes = serde_json::to_vec_pretty(&document).map_err(|e| file_error(e.to_string()))?;
    write_atomically(path, &bytes)
        .await
        .map_err(|e| file_error(format!("{e:#}")))?;
    Ok(records.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locate,
    GateCheck,
    Fetch,
    Extract,
    Normalize,
    Write,
    MarkDone,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Locate => "locate",
            Stage::GateCheck => "gate_check",
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Normalize => "normalize",
            Stage::Write => "write",
            Stage::MarkDone => "mark_done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no candidate artifacts found for {source_id}")]
    DiscoveryEmpty { source_id: String },
    #[error("{candidates} candidate(s) found for {source_id} but none has a determinable recency")]
    NoPlausibleRecency { source_id: String, candidates: usize },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("storing artifact from {url}: {message}")]
    Storage { url: String, message: String },
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("no usable rows after normalization ({dropped} dropped)")]
    Normalization { dropped: usize },
    #[error("relational write to {table} failed: {message}")]
    Persistence { table: String, message: String },
    #[error("ingestion marker {path}: {message}")]
    Marker { path: String, message: String },
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aborted at {}: {}", self.stage, self.error)
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<PipelineError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|e| StageFailure {
            stage,
            error: e.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Ingested {
        recency: Recency,
        artifact_url: String,
        records: usize,
        dropped: usize,
        degraded_fields: usize,
        marker_advanced: bool,
        /// False when the source writes flat files only.
        table_written: bool,
    },
    AlreadyCurrent {
        recency: Recency,
        last_recency: i64,
    },
    Aborted {
        stage: Stage,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub sink: Option<SinkReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Aborted { .. })
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// One-line console banner.
    pub fn status_line(&self) -> String {
        match &self.outcome {
            RunOutcome::Ingested {
                recency,
                records,
                dropped,
                table_written,
                ..
            } => format!(
                "psr sync ok: source={} ingested {} ({} records, {} dropped{})",
                self.source_id,
                recency,
                records,
                dropped,
                if *table_written { "" } else { ", flat files only" }
            ),
            RunOutcome::AlreadyCurrent { recency, .. } => format!(
                "psr sync ok: source={} already current at {}",
                self.source_id, recency
            ),
            RunOutcome::Aborted { stage, error } => format!(
                "psr sync FAILED: source={} aborted at {}: {}",
                self.source_id, stage, error
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateCheck {
    pub latest: CandidateArtifact,
    pub recency: Recency,
    pub marker: Option<IngestionMarker>,
    pub update_available: bool,
}

/// Completed gate check, either proceeding to fetch or stopping as already current.
enum GateDecision {
    Proceed(UpdateCheck),
    Current(UpdateCheck),
}

pub struct Pipeline {
    source: SourceConfig,
    locator: Box<dyn SourceLocator>,
    extractor: Box<dyn TableExtractor>,
    normalizer: SchemaNormalizer,
    http: HttpFetcher,
    artifacts: ArtifactStore,
    marker: MarkerFile,
    sink: Sink,
    data_dir: PathBuf,
    fetch_timeout: Duration,
}

impl Pipeline {
    pub fn new(source: SourceConfig, config: &SyncConfig, table: Option<Arc<dyn RentTable>>) -> Result<Self> {
        let locator = locator_for(&source.discovery)
            .with_context(|| format!("configuring discovery for {}", source.source_id))?;
        let extractor = extractor_for(&source.extractor);
        let normalizer = SchemaNormalizer::for_source(&source)
            .with_context(|| format!("configuring columns for {}", source.source_id))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.discovery_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let sink = Sink::new(source.destinations.clone(), table);
        Ok(Self {
            locator,
            extractor,
            normalizer,
            http,
            artifacts: ArtifactStore::new(config.data_dir.clone()),
            marker: MarkerFile::for_source(&config.data_dir, &source.source_id),
            sink,
            data_dir: config.data_dir.clone(),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            source,
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn TableExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn marker(&self) -> &MarkerFile {
        &self.marker
    }

    pub async fn run_once(&self) -> RunReport {
        self.run_at(Utc::now()).await
    }

    /// Run every stage in order. Stage failures become an `Aborted` outcome, never an error.
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> RunReport {
        let ctx = AdapterContext::new(started_at);
        let span = info_span!("pipeline", run_id = %ctx.run_id, source_id = %self.source.source_id);
        async {
            info!(strategy = ?self.locator.strategy(), "pipeline started");
            let mut sink_report = None;
            let outcome = match self.execute(&ctx, &mut sink_report).await {
                Ok(outcome) => outcome,
                Err(failure) => {
                    error!(stage = %failure.stage, error = %failure.error, "pipeline aborted");
                    RunOutcome::Aborted {
                        stage: failure.stage,
                        error: failure.error.to_string(),
                    }
                }
            };
            let report = RunReport {
                run_id: ctx.run_id,
                source_id: self.source.source_id.clone(),
                started_at,
                finished_at: Utc::now(),
                outcome,
                sink: sink_report,
            };
            info!(succeeded = report.succeeded(), "pipeline finished");
            report
        }
        .instrument(span)
        .await
    }

    /// Locate and gate only: nothing is fetched or written.
    pub async fn check_at(&self, started_at: DateTime<Utc>) -> Result<UpdateCheck, StageFailure> {
        let ctx = AdapterContext::new(started_at);
        match self.locate_and_gate(&ctx).await? {
            GateDecision::Proceed(check) | GateDecision::Current(check) => Ok(check),
        }
    }

    async fn locate_and_gate(&self, ctx: &AdapterContext) -> Result<GateDecision, StageFailure> {
        let candidates = self.locator.discover(&self.http, ctx).await;
        if candidates.is_empty() {
            return Err(StageFailure {
                stage: Stage::Locate,
                error: PipelineError::DiscoveryEmpty {
                    source_id: self.source.source_id.clone(),
                },
            });
        }
        let selected = select_latest(&candidates).and_then(|c| c.recency.map(|r| (c.clone(), r)));
        let Some((latest, recency)) = selected else {
            return Err(StageFailure {
                stage: Stage::Locate,
                error: PipelineError::NoPlausibleRecency {
                    source_id: self.source.source_id.clone(),
                    candidates: candidates.len(),
                },
            });
        };
        info!(stage = %Stage::Locate, candidates = candidates.len(), url = %latest.url, %recency, "latest artifact selected");

        let marker = self.marker.read().await.map_err(|e| StageFailure {
            stage: Stage::GateCheck,
            error: PipelineError::Marker {
                path: self.marker.path().display().to_string(),
                message: format!("{e:#}"),
            },
        })?;
        let update_available = should_ingest(marker.as_ref(), recency.value());
        info!(
            stage = %Stage::GateCheck,
            candidate = recency.value(),
            last = ?marker.map(|m| m.last_recency),
            update_available,
            "update gate evaluated"
        );
        let check = UpdateCheck {
            latest,
            recency,
            marker,
            update_available,
        };
        Ok(if update_available {
            GateDecision::Proceed(check)
        } else {
            GateDecision::Current(check)
        })
    }

    async fn execute(
        &self,
        ctx: &AdapterContext,
        sink_report: &mut Option<SinkReport>,
    ) -> Result<RunOutcome, StageFailure> {
        let check = match self.locate_and_gate(ctx).await? {
            GateDecision::Proceed(check) => check,
            GateDecision::Current(check) => {
                return Ok(RunOutcome::AlreadyCurrent {
                    recency: check.recency,
                    last_recency: check.marker.map(|m| m.last_recency).unwrap_or_default(),
                });
            }
        };
        let UpdateCheck { latest, recency, .. } = check;

        let response = self
            .http
            .fetch_bytes_with_timeout(&latest.url, self.fetch_timeout)
            .await
            .at(Stage::Fetch)?;
        let file_name = ArtifactStore::artifact_file_name(&latest.url, &latest.label);
        let stored = self
            .artifacts
            .store_named(&file_name, &response.body)
            .await
            .map_err(|e| StageFailure {
                stage: Stage::Fetch,
                error: PipelineError::Storage {
                    url: latest.url.clone(),
                    message: format!("{e:#}"),
                },
            })?;
        info!(
            stage = %Stage::Fetch,
            path = %stored.absolute_path.display(),
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            replaced = stored.replaced,
            "artifact stored"
        );

        let rows = self.extractor.extract(&stored).await.at(Stage::Extract)?;
        info!(stage = %Stage::Extract, extractor = self.extractor.name(), rows = rows.len(), "rows extracted");

        let provenance = Provenance {
            source_id: self.source.source_id.clone(),
            source_label: self.source.label_for(recency),
            effective_date: self.source.effective_date.effective_date(recency),
            ingested_at: ctx.started_at,
        };
        let normalized = self.normalizer.normalize(&rows, &provenance);
        info!(
            stage = %Stage::Normalize,
            records = normalized.records.len(),
            dropped = normalized.dropped,
            degraded_fields = normalized.degraded_fields,
            "rows normalized"
        );
        if normalized.records.is_empty() {
            return Err(StageFailure {
                stage: Stage::Normalize,
                error: PipelineError::Normalization {
                    dropped: normalized.dropped,
                },
            });
        }

        let target = SinkTarget {
            data_dir: &self.data_dir,
            file_stem: self.source.file_stem(recency),
            provenance: &provenance,
            recency,
        };
        let report = self.sink.write(&normalized.records, &target).await;
        let succeeded = report.succeeded();
        let table_written = report.outcome(Destination::Table).is_some_and(DestinationOutcome::is_ok);
        let failure = report
            .first_failure()
            .map(|o| (o.location.clone(), o.error().unwrap_or_default().to_string()));
        *sink_report = Some(report);
        if !succeeded {
            let (table, message) = failure.unwrap_or_else(|| (RENTS_TABLE.to_string(), "no destinations".to_string()));
            return Err(StageFailure {
                stage: Stage::Write,
                error: PipelineError::Persistence { table, message },
            });
        }

        if !table_written {
            warn!(
                stage = %Stage::MarkDone,
                source_id = %self.source.source_id,
                "advancing marker without a relational write; no table destination configured"
            );
        }
        let marker_advanced = self.marker.advance(recency.value()).await.map_err(|e| StageFailure {
            stage: Stage::MarkDone,
            error: PipelineError::Marker {
                path: self.marker.path().display().to_string(),
                message: format!("{e:#}"),
            },
        })?;

        Ok(RunOutcome::Ingested {
            recency,
            artifact_url: latest.url,
            records: normalized.records.len(),
            dropped: normalized.dropped,
            degraded_fields: normalized.degraded_fields,
            marker_advanced,
            table_written,
        })
    }
}

/// Runs configured sources one after another; a process-local lock keeps runs from overlapping.
pub struct SyncRunner {
    config: SyncConfig,
    registry: SourceRegistry,
    table: Option<Arc<dyn RentTable>>,
    running: Mutex<()>,
}

impl SyncRunner {
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::from_path(config.sources_path())?;
        let needs_table = registry
            .sources
            .iter()
            .any(|s| s.destinations.contains(&Destination::Table));
        let table = if needs_table {
            Some(connect_rent_table(&config.database_url)?)
        } else {
            None
        };
        Ok(Self::new(config, registry, table))
    }

    pub fn new(config: SyncConfig, registry: SourceRegistry, table: Option<Arc<dyn RentTable>>) -> Self {
        Self {
            config,
            registry,
            table,
            running: Mutex::new(()),
        }
    }

    pub fn selected(&self, only: Option<&str>) -> Result<Vec<&SourceConfig>> {
        match only {
            Some(id) => {
                let source = self
                    .registry
                    .sources
                    .iter()
                    .find(|s| s.source_id == id)
                    .with_context(|| format!("unknown source {id}"))?;
                Ok(vec![source])
            }
            None => Ok(self.registry.enabled().collect()),
        }
    }

    fn pipeline_for(&self, source: &SourceConfig) -> Result<Pipeline> {
        let table = match &self.table {
            Some(table) => Some(Arc::clone(table)),
            None if source.destinations.contains(&Destination::Table) => {
                Some(connect_rent_table(&self.config.database_url)?)
            }
            None => None,
        };
        Pipeline::new(source.clone(), &self.config, table)
    }

    pub async fn run(&self, only: Option<&str>) -> Result<Vec<RunReport>> {
        let _running = self.running.lock().await;
        self.run_locked(only).await
    }

    async fn run_locked(&self, only: Option<&str>) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for source in self.selected(only)? {
            let pipeline = self.pipeline_for(source)?;
            reports.push(pipeline.run_once().await);
        }
        Ok(reports)
    }

    pub async fn check(&self, only: Option<&str>) -> Result<Vec<(String, Result<UpdateCheck, StageFailure>)>> {
        let mut checks = Vec::new();
        for source in self.selected(only)? {
            let pipeline = self.pipeline_for(source)?;
            checks.push((source.source_id.clone(), pipeline.check_at(Utc::now()).await));
        }
        Ok(checks)
    }

    pub async fn migrate(&self) -> Result<String> {
        let table = match &self.table {
            Some(table) => Arc::clone(table),
            None => connect_rent_table(&self.config.database_url)?,
        };
        table.ensure_schema().await?;
        Ok(table.describe())
    }

    /// Scheduled trigger: skipped with a warning while another run holds the lock.
    pub async fn run_scheduled(&self) {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous sync still running; skipping scheduled trigger");
            return;
        };
        match self.run_locked(None).await {
            Ok(reports) => {
                for report in reports {
                    info!(source_id = %report.source_id, status = %report.status_line(), "scheduled sync finished");
                }
            }
            Err(err) => error!(error = %format!("{err:#}"), "scheduled sync could not start"),
        }
    }
}

pub async fn maybe_build_scheduler(runner: Arc<SyncRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = runner.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            runner.run_scheduled().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

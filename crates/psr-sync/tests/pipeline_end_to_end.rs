// End-to-end pipeline runs against an in-process HTTP server standing in for the housing authority site.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use psr_adapters::{DiscoveryConfig, ExtractionError, ExtractorConfig, TableExtractor};
use psr_core::{RawRow, Recency, RentRecord};
use psr_storage::StoredArtifact;
use psr_sync::{
    CountyConfig, Destination, EffectiveDateRule, Pipeline, RentTable, RunOutcome, SinkError, SourceConfig,
    SqliteRentTable, Stage, SyncConfig, SyncRunner,
};
use tempfile::tempdir;

const PAGE: &str = r#"<html><body>
<a href="/docs/2024-Payment-Standards.pdf">2024 Payment Standards</a>
<a href="/docs/2025-Payment-Standards.pdf">2025 Payment Standards</a>
<a href="/docs/Owner-Packet.pdf">Owner packet</a>
</body></html>"#;

const SLOW_PAGE: &str = r#"<a href="/slow/2025-Payment-Standards.pdf">2025</a>"#;

const GARBLED_PAGE: &str = r#"<a href="/garbled/2025-Payment-Standards.pdf">2025</a>"#;

const UNDATED_PAGE: &str = r#"<a href="/docs/Payment-Standards-Current.pdf">current</a>"#;

const RENTS_2025: &str = "\
city,zip,0_br,1br,2br,3br,4br,5br,6br
Abington,2351,2078,2232,2650,3204,3531,4060,4590
Boston - Allston,02134,2426,2607,3100,3749,4129,4748,5367
Boston - Beacon Hill,02108,3266,3450,N/A,4950,5450,6250,7000
Nowhere,,1000,1000,1000,1000,1000,1000,1000
";

const RENTS_2024: &str = "\
city,zip,0_br,1br,2br,3br,4br,5br,6br
Abington,02351,1900,2100,2500,3000,3300,3800,4300
";

async fn serve() -> SocketAddr {
    let router = Router::new()
        .route("/payment-standards", get(|| async { Html(PAGE) }))
        .route("/slow-standards", get(|| async { Html(SLOW_PAGE) }))
        .route("/garbled-standards", get(|| async { Html(GARBLED_PAGE) }))
        .route("/undated-standards", get(|| async { Html(UNDATED_PAGE) }))
        .route("/docs/2025-Payment-Standards.pdf", get(|| async { RENTS_2025 }))
        .route("/docs/2024-Payment-Standards.pdf", get(|| async { RENTS_2024 }))
        .route(
            "/slow/2025-Payment-Standards.pdf",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                RENTS_2025
            }),
        )
        .route("/garbled/2025-Payment-Standards.pdf", get(|| async { "%PDF-1.4\n" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn config(data_dir: &Path, fetch_timeout_secs: u64) -> SyncConfig {
    SyncConfig {
        database_url: format!("sqlite://{}?mode=rwc", data_dir.join("rents.db").display()),
        data_dir: data_dir.to_path_buf(),
        workspace_root: data_dir.to_path_buf(),
        user_agent: "psr-test/0.1".into(),
        discovery_timeout_secs: 5,
        fetch_timeout_secs,
        log_file: None,
        scheduler_enabled: false,
        sync_cron: "0 0 6 * * *".into(),
    }
}

fn source(addr: SocketAddr, page: &str) -> SourceConfig {
    SourceConfig {
        source_id: "bha-payment-standards".into(),
        display_name: "BHA Payment Standards".into(),
        enabled: true,
        label_template: Some("BHA {recency} Payment Standards".into()),
        effective_date: EffectiveDateRule::default(),
        discovery: DiscoveryConfig::PageScan {
            page_url: format!("http://{addr}/{page}"),
            base_url: format!("http://{addr}"),
            document_pattern: psr_adapters::DEFAULT_DOCUMENT_PATTERN.into(),
            year_window: 2,
        },
        extractor: ExtractorConfig::Csv,
        county: CountyConfig {
            default: Some("Suffolk".into()),
            lookup: [("Abington".to_string(), "Plymouth".to_string())].into_iter().collect(),
        },
        columns: Default::default(),
        destinations: [Destination::CsvFile, Destination::JsonFile, Destination::Table]
            .into_iter()
            .collect(),
        notes: None,
    }
}

fn run_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 1, 6, 0, 0).single().unwrap()
}

async fn write_marker(data_dir: &Path, value: i64) {
    let markers = data_dir.join("markers");
    tokio::fs::create_dir_all(&markers).await.unwrap();
    tokio::fs::write(markers.join("bha-payment-standards.txt"), value.to_string())
        .await
        .unwrap();
}

async fn read_marker(data_dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(data_dir.join("markers/bha-payment-standards.txt"))
        .await
        .ok()
}

#[tokio::test]
async fn ingests_newest_year_when_no_marker_exists() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let table = Arc::new(SqliteRentTable::open(dir.path().join("rents.db")).unwrap());
    let pipeline = Pipeline::new(
        source(addr, "payment-standards"),
        &config(dir.path(), 10),
        Some(table.clone() as Arc<dyn RentTable>),
    )
    .unwrap();

    let report = pipeline.run_at(run_time()).await;

    assert_eq!(report.exit_code(), 0, "{}", report.status_line());
    let RunOutcome::Ingested {
        recency,
        artifact_url,
        records,
        dropped,
        degraded_fields,
        marker_advanced,
        table_written,
    } = &report.outcome
    else {
        panic!("expected ingestion, got {:?}", report.outcome);
    };
    assert_eq!(*recency, Recency::Year(2025));
    assert!(artifact_url.ends_with("/docs/2025-Payment-Standards.pdf"));
    assert_eq!(*records, 3);
    assert_eq!(*dropped, 1);
    assert_eq!(*degraded_fields, 1);
    assert!(marker_advanced);
    assert!(table_written);
    assert_eq!(read_marker(dir.path()).await.as_deref(), Some("2025"));

    assert!(dir.path().join("2025-Payment-Standards.pdf").exists());
    assert!(dir.path().join("bha-payment-standards_2025.csv").exists());
    assert!(dir.path().join("bha-payment-standards_2025.json").exists());

    let stored = table.load_source("bha-payment-standards").await.unwrap();
    assert_eq!(stored.len(), 3);
    let abington = &stored[0];
    assert_eq!(abington.postal_code, "02351");
    assert_eq!(abington.county, "Plymouth");
    assert_eq!(abington.source_label, "BHA 2025 Payment Standards");
    assert_eq!(abington.effective_date.to_string(), "2025-07-01");
    assert_eq!(abington.ingested_at, run_time());
    assert_eq!(stored[2].two_br_rent, None);
    assert_eq!(stored[2].three_br_rent, Some(4950));
}

#[tokio::test]
async fn current_marker_skips_every_write() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    write_marker(dir.path(), 2025).await;
    let table = Arc::new(SqliteRentTable::open(dir.path().join("rents.db")).unwrap());
    let pipeline = Pipeline::new(
        source(addr, "payment-standards"),
        &config(dir.path(), 10),
        Some(table.clone() as Arc<dyn RentTable>),
    )
    .unwrap();

    let report = pipeline.run_at(run_time()).await;

    assert_eq!(report.exit_code(), 0);
    assert!(matches!(
        report.outcome,
        RunOutcome::AlreadyCurrent { recency: Recency::Year(2025), last_recency: 2025 }
    ));
    assert!(report.sink.is_none());
    assert!(!dir.path().join("2025-Payment-Standards.pdf").exists());
    assert!(!dir.path().join("bha-payment-standards_2025.csv").exists());
    assert!(table.load_source("bha-payment-standards").await.unwrap().is_empty());
    assert_eq!(read_marker(dir.path()).await.as_deref(), Some("2025"));
}

#[tokio::test]
async fn rerun_after_manual_marker_reset_replaces_rows() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let table = Arc::new(SqliteRentTable::open(dir.path().join("rents.db")).unwrap());
    let pipeline = Pipeline::new(
        source(addr, "payment-standards"),
        &config(dir.path(), 10),
        Some(table.clone() as Arc<dyn RentTable>),
    )
    .unwrap();

    assert_eq!(pipeline.run_at(run_time()).await.exit_code(), 0);
    let first = table.load_source("bha-payment-standards").await.unwrap();

    tokio::fs::remove_file(pipeline.marker().path()).await.unwrap();
    assert_eq!(pipeline.run_at(run_time()).await.exit_code(), 0);
    let second = table.load_source("bha-payment-standards").await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn fetch_timeout_aborts_without_touching_marker() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    write_marker(dir.path(), 2024).await;
    let table = Arc::new(SqliteRentTable::open(dir.path().join("rents.db")).unwrap());
    let pipeline = Pipeline::new(
        source(addr, "slow-standards"),
        &config(dir.path(), 1),
        Some(table.clone() as Arc<dyn RentTable>),
    )
    .unwrap();

    let report = pipeline.run_at(run_time()).await;

    assert_eq!(report.exit_code(), 1);
    let RunOutcome::Aborted { stage, error } = &report.outcome else {
        panic!("expected abort, got {:?}", report.outcome);
    };
    assert_eq!(*stage, Stage::Fetch);
    assert!(error.contains("timed out"), "{error}");
    assert!(report.status_line().starts_with("psr sync FAILED"));
    assert_eq!(read_marker(dir.path()).await.as_deref(), Some("2024"));
    assert!(table.load_source("bha-payment-standards").await.unwrap().is_empty());
}

#[tokio::test]
async fn unreadable_artifact_aborts_at_extract() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(source(addr, "garbled-standards"), &config(dir.path(), 10), None).unwrap();

    let report = pipeline.run_at(run_time()).await;

    assert!(matches!(report.outcome, RunOutcome::Aborted { stage: Stage::Extract, .. }));
    assert_eq!(read_marker(dir.path()).await, None);
}

#[tokio::test]
async fn undated_links_abort_at_locate() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(source(addr, "undated-standards"), &config(dir.path(), 10), None).unwrap();

    let report = pipeline.run_at(run_time()).await;

    let RunOutcome::Aborted { stage, error } = &report.outcome else {
        panic!("expected abort, got {:?}", report.outcome);
    };
    assert_eq!(*stage, Stage::Locate);
    assert!(error.contains("none has a determinable recency"), "{error}");
}

#[tokio::test]
async fn missing_page_aborts_as_discovery_empty() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(source(addr, "no-such-page"), &config(dir.path(), 10), None).unwrap();

    let report = pipeline.run_at(run_time()).await;

    let RunOutcome::Aborted { stage, error } = &report.outcome else {
        panic!("expected abort, got {:?}", report.outcome);
    };
    assert_eq!(*stage, Stage::Locate);
    assert!(error.contains("no candidate artifacts"), "{error}");
}

struct UnreachableTable;

#[async_trait]
impl RentTable for UnreachableTable {
    fn describe(&self) -> String {
        "unreachable:rents".into()
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        Err(SinkError::NoTable)
    }

    async fn replace_source(&self, _source_id: &str, _records: &[RentRecord]) -> Result<u64, SinkError> {
        Err(SinkError::NoTable)
    }

    async fn load_source(&self, _source_id: &str) -> Result<Vec<RentRecord>, SinkError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn table_failure_keeps_flat_files_but_blocks_marker() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(
        source(addr, "payment-standards"),
        &config(dir.path(), 10),
        Some(Arc::new(UnreachableTable)),
    )
    .unwrap();

    let report = pipeline.run_at(run_time()).await;

    assert!(matches!(report.outcome, RunOutcome::Aborted { stage: Stage::Write, .. }));
    let sink = report.sink.as_ref().unwrap();
    assert!(sink.outcome(Destination::CsvFile).unwrap().is_ok());
    assert!(!sink.outcome(Destination::Table).unwrap().is_ok());
    assert!(dir.path().join("bha-payment-standards_2025.csv").exists());
    assert_eq!(read_marker(dir.path()).await, None);
}

/// Stands in for a PDF layout tool.
struct FixedRows(Vec<RawRow>);

#[async_trait]
impl TableExtractor for FixedRows {
    fn name(&self) -> &str {
        "fixed-rows"
    }

    async fn extract(&self, _artifact: &StoredArtifact) -> Result<Vec<RawRow>, ExtractionError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn injected_extractor_feeds_normalizer() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let mut source = source(addr, "payment-standards");
    source.destinations = [Destination::CsvFile].into_iter().collect();
    let rows = vec![RawRow::new()
        .with("Town", "Chelsea")
        .with("ZIP Code", "2150")
        .with("Studio", "$2,150")];
    let pipeline = Pipeline::new(source, &config(dir.path(), 10), None)
        .unwrap()
        .with_extractor(Box::new(FixedRows(rows)));

    let report = pipeline.run_at(run_time()).await;

    assert_eq!(report.exit_code(), 0, "{}", report.status_line());
    assert!(matches!(report.outcome, RunOutcome::Ingested { table_written: false, .. }));
    assert!(report.status_line().contains("flat files only"));
    let mut reader = csv::Reader::from_path(dir.path().join("bha-payment-standards_2025.csv")).unwrap();
    let records = reader
        .deserialize::<RentRecord>()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].postal_code, "02150");
    assert_eq!(records[0].studio_rent, Some(2150));
    assert_eq!(records[0].county, "Suffolk");
}

#[tokio::test]
async fn check_reports_update_without_fetching() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    write_marker(dir.path(), 2024).await;
    let pipeline = Pipeline::new(source(addr, "payment-standards"), &config(dir.path(), 10), None).unwrap();

    let check = pipeline.check_at(run_time()).await.unwrap();

    assert!(check.update_available);
    assert_eq!(check.recency, Recency::Year(2025));
    assert_eq!(check.marker.map(|m| m.last_recency), Some(2024));
    assert!(!dir.path().join("2025-Payment-Standards.pdf").exists());
}

async fn serve_catalog() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let package_show = std::fs::read_to_string(root.join("fixtures/boston-ckan/package_show.json"))
        .unwrap()
        .replace("https://data.boston.gov", &format!("http://{addr}"));

    let router = Router::new()
        .route(
            "/api/3/action/package_show",
            get(move || {
                let body = package_show.clone();
                async move { ([(header::CONTENT_TYPE, "application/json")], body) }
            }),
        )
        .route(
            "/dataset/income-restricted-housing/resource/a4f3c2d1-0002/download/irh-2024.csv",
            get(|| async { RENTS_2025 }),
        )
        .route(
            "/dataset/income-restricted-housing/resource/a4f3c2d1-0001/download/irh-2023.csv",
            get(|| async { RENTS_2024 }),
        );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn catalog_source(addr: SocketAddr) -> SourceConfig {
    SourceConfig {
        source_id: "boston-income-restricted".into(),
        display_name: "Boston Income Restricted Housing".into(),
        enabled: true,
        label_template: None,
        effective_date: EffectiveDateRule::default(),
        discovery: DiscoveryConfig::CatalogApi {
            api_base: format!("http://{addr}/api/3"),
            dataset_id: "income-restricted-housing".into(),
            format: "CSV".into(),
        },
        extractor: ExtractorConfig::Csv,
        county: CountyConfig::default(),
        columns: Default::default(),
        destinations: [Destination::CsvFile, Destination::Table].into_iter().collect(),
        notes: None,
    }
}

#[tokio::test]
async fn catalog_source_ingests_newest_resource_then_stays_current() {
    let addr = serve_catalog().await;
    let dir = tempdir().unwrap();
    let table = Arc::new(SqliteRentTable::open(dir.path().join("rents.db")).unwrap());
    let pipeline = Pipeline::new(
        catalog_source(addr),
        &config(dir.path(), 10),
        Some(table.clone() as Arc<dyn RentTable>),
    )
    .unwrap();
    let created = psr_adapters::parse_catalog_timestamp("2024-06-03T14:05:09.412000").unwrap();

    let first = pipeline.run_at(run_time()).await;

    assert_eq!(first.exit_code(), 0, "{}", first.status_line());
    let RunOutcome::Ingested { recency, artifact_url, .. } = &first.outcome else {
        panic!("expected ingestion, got {:?}", first.outcome);
    };
    assert_eq!(*recency, Recency::Created(created));
    assert!(artifact_url.ends_with("/irh-2024.csv"));
    assert_eq!(
        tokio::fs::read_to_string(pipeline.marker().path()).await.unwrap(),
        created.timestamp().to_string()
    );
    assert!(dir.path().join("irh-2024.csv").exists());
    assert!(dir.path().join("boston-income-restricted_2024-06-03.csv").exists());

    let stored = table.load_source("boston-income-restricted").await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].effective_date.to_string(), "2024-06-03");
    assert_eq!(stored[0].source_label, "Boston Income Restricted Housing 2024-06-03");
    assert_eq!(stored[0].county, "Unknown");

    let second = pipeline.run_at(run_time()).await;

    assert_eq!(second.exit_code(), 0);
    assert_eq!(
        second.status_line(),
        "psr sync ok: source=boston-income-restricted already current at 2024-06-03"
    );
    let RunOutcome::AlreadyCurrent { recency, last_recency } = second.outcome else {
        panic!("expected already current, got {:?}", second.outcome);
    };
    assert_eq!(recency, Recency::Created(created));
    assert_eq!(last_recency, created.timestamp());
    assert_eq!(table.load_source("boston-income-restricted").await.unwrap().len(), 3);
}

#[tokio::test]
async fn disabled_source_run_by_id_writes_the_table() {
    let addr = serve().await;
    let dir = tempdir().unwrap();
    let sources = format!(
        r#"
sources:
  - source_id: pinned
    display_name: Pinned
    enabled: false
    discovery:
      strategy: page_scan
      page_url: http://{addr}/payment-standards
      base_url: http://{addr}
    extractor:
      kind: csv
  - source_id: flat-only
    display_name: Flat only
    enabled: true
    discovery:
      strategy: page_scan
      page_url: http://{addr}/payment-standards
      base_url: http://{addr}
    destinations: [csv_file]
"#
    );
    tokio::fs::write(dir.path().join("sources.yaml"), sources).await.unwrap();
    let runner = SyncRunner::from_config(config(dir.path(), 10)).unwrap();

    let reports = runner.run(Some("pinned")).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].exit_code(), 0, "{}", reports[0].status_line());
    assert!(matches!(reports[0].outcome, RunOutcome::Ingested { table_written: true, .. }));
    let table = SqliteRentTable::open(dir.path().join("rents.db")).unwrap();
    assert_eq!(table.load_source("pinned").await.unwrap().len(), 3);
}

//! Core domain model and provenance types for PSR.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "psr-core";

/// Canonical rent columns, in bedroom order.
pub const RENT_COLUMNS: [&str; 7] = [
    "studio_rent",
    "one_br_rent",
    "two_br_rent",
    "three_br_rent",
    "four_br_rent",
    "five_br_rent",
    "six_br_rent",
];

/// Comparable freshness of a published artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recency {
    /// Publication year derived from a file name or configuration.
    Year(i32),
    /// Resource creation time reported by a catalog.
    Created(DateTime<Utc>),
}

impl Recency {
    /// Scalar used for ranking candidates and for the persisted marker.
    pub fn value(&self) -> i64 {
        match self {
            Recency::Year(year) => i64::from(*year),
            Recency::Created(ts) => ts.timestamp(),
        }
    }
}

impl fmt::Display for Recency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recency::Year(year) => write!(f, "{year}"),
            Recency::Created(ts) => write!(f, "{}", ts.format("%Y-%m-%d")),
        }
    }
}

/// A downloadable document discovered by a locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateArtifact {
    pub url: String,
    /// `None` when the recency could not be determined; such candidates never win selection.
    pub recency: Option<Recency>,
    pub label: String,
}

/// Last successfully ingested recency for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionMarker {
    pub last_recency: i64,
}

/// One extracted table row: column label to cell text, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub cells: Vec<(String, String)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.cells.push((column.into(), value.into()));
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }
}

/// Where and when a batch of records was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Structured replace key for the relational sink.
    pub source_id: String,
    /// Human-readable label, e.g. `BHA 2025 Payment Standards`.
    pub source_label: String,
    pub effective_date: NaiveDate,
    pub ingested_at: DateTime<Utc>,
}

/// Canonical persisted payment-standard row.
///
/// Field order is the canonical CSV column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentRecord {
    pub locality: String,
    pub postal_code: String,
    pub county: String,
    pub studio_rent: Option<u32>,
    pub one_br_rent: Option<u32>,
    pub two_br_rent: Option<u32>,
    pub three_br_rent: Option<u32>,
    pub four_br_rent: Option<u32>,
    pub five_br_rent: Option<u32>,
    pub six_br_rent: Option<u32>,
    pub source_id: String,
    #[serde(rename = "source")]
    pub source_label: String,
    pub effective_date: NaiveDate,
    #[serde(rename = "updated_at")]
    pub ingested_at: DateTime<Utc>,
}

impl RentRecord {
    pub fn rents(&self) -> [Option<u32>; 7] {
        [
            self.studio_rent,
            self.one_br_rent,
            self.two_br_rent,
            self.three_br_rent,
            self.four_br_rent,
            self.five_br_rent,
            self.six_br_rent,
        ]
    }

    pub fn rent_mut(&mut self, column: &str) -> Option<&mut Option<u32>> {
        match column {
            "studio_rent" => Some(&mut self.studio_rent),
            "one_br_rent" => Some(&mut self.one_br_rent),
            "two_br_rent" => Some(&mut self.two_br_rent),
            "three_br_rent" => Some(&mut self.three_br_rent),
            "four_br_rent" => Some(&mut self.four_br_rent),
            "five_br_rent" => Some(&mut self.five_br_rent),
            "six_br_rent" => Some(&mut self.six_br_rent),
            _ => None,
        }
    }

    /// Identity used when a source is re-ingested.
    pub fn identity(&self) -> (&str, &str) {
        (&self.postal_code, &self.source_id)
    }
}

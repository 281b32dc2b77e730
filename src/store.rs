//! Storage seams used by the transfer and enrichment engines.
//!
//! The engines only see these traits; `database` provides the Postgres
//! implementations and the integration tests provide in-memory ones.

use crate::error::StoreError;
use crate::schema::{SinkRow, SourceRow};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// Reads new rows from the transactional source.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Number of rows with key strictly greater than `after`.
    async fn count_after(&self, after: i64) -> Result<u64, StoreError>;

    /// Up to `limit` rows with key strictly greater than `after`, ascending by key.
    async fn fetch_after(&self, after: i64, limit: usize) -> Result<Vec<SourceRow>, StoreError>;
}

/// Append-only analytical sink.
#[async_trait]
pub trait SinkStore: Send + Sync {
    async fn ensure_table(&self) -> Result<(), StoreError>;

    /// Highest key already stored, `None` for an empty sink.
    async fn max_key(&self) -> Result<Option<i64>, StoreError>;

    async fn row_count(&self) -> Result<u64, StoreError>;

    /// Inserts all rows atomically: either every row lands or none does.
    async fn insert_batch(&self, rows: &[SinkRow]) -> Result<(), StoreError>;

    async fn insert_row(&self, row: &SinkRow) -> Result<(), StoreError>;
}

/// Identity of a store characteristic record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub retail_chain: String,
    pub address: String,
    pub sale_date: NaiveDate,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | {}", self.retail_chain, self.address, self.sale_date)
    }
}

/// A (chain, address, date) tuple selected for enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStore {
    pub key: NaturalKey,
    pub store_format: String,
}

/// Sales aggregated over every source row of a natural key.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SalesAggregate {
    pub quantity: f64,
    pub amount: f64,
    pub avg_sell_price: f64,
    pub avg_cost_price: f64,
}

/// Where the geography of a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoSource {
    Geocoder,
    Heuristic,
}

impl GeoSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeoSource::Geocoder => "geocoder",
            GeoSource::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreCharacteristic {
    pub key: NaturalKey,
    pub store_format: String,
    pub store_type: String,
    pub area_m2: f64,
    pub has_alcohol_department: bool,
    pub has_snacks: bool,
    pub sales: SalesAggregate,
    pub city: String,
    pub federal_subject: String,
    pub federal_district: String,
    pub lat: f64,
    pub lon: f64,
    pub geo_source: GeoSource,
    pub created_at: NaiveDateTime,
}

/// Enrichment table plus the source queries the enrichment needs.
#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    async fn ensure_table(&self) -> Result<(), StoreError>;

    /// Anti-join: tuples with positive sales that have no record yet.
    async fn select_pending(&self, limit: usize) -> Result<Vec<PendingStore>, StoreError>;

    async fn exists(&self, key: &NaturalKey) -> Result<bool, StoreError>;

    /// `Ok(None)` when the source has no rows for the key.
    async fn sales_aggregate(&self, key: &NaturalKey) -> Result<Option<SalesAggregate>, StoreError>;

    /// Measured floor area from the source, when available.
    async fn source_area(&self, key: &NaturalKey) -> Result<Option<f64>, StoreError>;

    /// Inserts unless a record with the same natural key exists. Returns true when inserted.
    async fn insert_if_absent(&self, record: &StoreCharacteristic) -> Result<bool, StoreError>;

    /// Recomputes sales for records still at zero. Returns the number of updated records.
    async fn refresh_sales(&self) -> Result<u64, StoreError>;
}

// src/database.rs
//
// Postgres implementations of the storage seams. Every store leases its
// connection from the shared `ConnectionManager` under its own worker id.

use crate::connection_manager::{ConnectionManager, Connector, DbRole, RetryPolicy, WorkerId};
use crate::error::StoreError;
use crate::normalization::{SinkValue, SourceValue};
use crate::schema::{SinkRow, SourceRow, KEY_COLUMN, SINK_COLUMNS};
use crate::settings::Settings;
use crate::store::{
    EnrichmentStore, NaturalKey, PendingStore, SalesAggregate, SinkStore, SourceStore,
    StoreCharacteristic,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{Column, Connection, PgConnection, Postgres, QueryBuilder, Row, TypeInfo};
use std::sync::Arc;
use std::time::Duration;

pub type PgConnectionManager = ConnectionManager<PgConnector>;

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub url: String,
    pub timeout: Duration,
}

/// Opens `PgConnection`s for the source and sink roles.
#[derive(Debug, Clone)]
pub struct PgConnector {
    source: ConnectParams,
    sink: ConnectParams,
}

impl PgConnector {
    pub fn new(source: ConnectParams, sink: ConnectParams) -> Self {
        Self { source, sink }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = Duration::from_secs(settings.connection.connect_timeout_secs);
        Self::new(
            ConnectParams {
                url: settings.source.url.clone(),
                timeout,
            },
            ConnectParams {
                url: settings.sink.url.clone(),
                timeout,
            },
        )
    }

    fn params(&self, role: DbRole) -> &ConnectParams {
        match role {
            DbRole::Source => &self.source,
            DbRole::Sink => &self.sink,
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = PgConnection;

    async fn connect(&self, role: DbRole) -> Result<PgConnection, StoreError> {
        let params = self.params(role);
        info!("🔍 Connecting to {} database: {}", role, mask_url(&params.url));
        match tokio::time::timeout(params.timeout, PgConnection::connect(&params.url)).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(StoreError::Timeout(params.timeout.as_secs())),
        }
    }

    async fn ping(&self, handle: &mut PgConnection) -> bool {
        sqlx::query("SELECT 1").execute(&mut *handle).await.is_ok()
    }
}

/// Builds the shared manager for both roles.
pub fn connection_manager(settings: &Settings) -> Arc<PgConnectionManager> {
    Arc::new(ConnectionManager::new(
        PgConnector::from_settings(settings),
        RetryPolicy::from(&settings.connection),
    ))
}

/// Hides the password part of a connection URL for logging.
pub fn mask_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.rfind('@') else {
        return url.to_string();
    };
    let creds = &rest[..at];
    match creds.find(':') {
        Some(colon) => format!(
            "{}://{}:***@{}",
            &url[..scheme_end],
            &creds[..colon],
            &rest[at + 1..]
        ),
        None => url.to_string(),
    }
}

/// `CREATE SCHEMA IF NOT EXISTS` for schema-qualified table names.
async fn ensure_schema(conn: &mut PgConnection, table: &str) -> Result<(), StoreError> {
    if let Some((schema, _)) = table.split_once('.') {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn unqualified(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub struct PgSource {
    manager: Arc<PgConnectionManager>,
    worker: WorkerId,
    table: String,
    key_column: String,
}

impl PgSource {
    pub fn new(manager: Arc<PgConnectionManager>, worker: WorkerId, table: &str, key_column: &str) -> Self {
        Self {
            manager,
            worker,
            table: table.to_string(),
            key_column: key_column.to_string(),
        }
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn count_after(&self, after: i64) -> Result<u64, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let count: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS count FROM {} WHERE {} > $1",
            self.table, self.key_column
        ))
        .bind(after)
        .fetch_one(&mut *conn)
        .await?
        .try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_after(&self, after: i64, limit: usize) -> Result<Vec<SourceRow>, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE {} > $1 ORDER BY {} ASC LIMIT $2",
            self.table, self.key_column, self.key_column
        ))
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;
        debug!("Fetched {} source rows after key {}", rows.len(), after);
        Ok(rows.iter().map(decode_row).collect())
    }
}

/// Undecodable cells (NUMERIC 'NaN', DATE 'infinity', out-of-range decimals) become
/// `Null` so the row still reaches the normalizer and the cursor can pass it.
fn decode_row(row: &PgRow) -> SourceRow {
    let mut out = SourceRow::default();
    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = recover_cell(column.name(), type_name, decode_cell(row, idx, type_name));
        out.push(column.name(), value);
    }
    out
}

fn recover_cell(column: &str, type_name: &str, decoded: Result<SourceValue, sqlx::Error>) -> SourceValue {
    match decoded {
        Ok(value) => value,
        Err(e) => {
            warn!("⚠️ Cannot decode {} column '{}', using its default: {}", type_name, column, e);
            SourceValue::Null
        }
    }
}

fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Result<SourceValue, sqlx::Error> {
    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(|v| SourceValue::Int(v.into())),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(|v| SourceValue::Int(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(SourceValue::Int),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(|v| SourceValue::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(SourceValue::Float),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(idx)?.map(SourceValue::Decimal),
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(SourceValue::Bool),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(idx)?.map(SourceValue::Date),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(SourceValue::DateTime),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|v| SourceValue::DateTime(v.naive_utc())),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(idx)?.map(SourceValue::Bytes),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => {
            row.try_get::<Option<String>, _>(idx)?.map(SourceValue::Text)
        }
        // Anything else is read as text when possible, otherwise left to the column default
        _ => row
            .try_get_unchecked::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(SourceValue::Text),
    };
    Ok(value.unwrap_or(SourceValue::Null))
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct PgSink {
    manager: Arc<PgConnectionManager>,
    worker: WorkerId,
    table: String,
}

impl PgSink {
    pub fn new(manager: Arc<PgConnectionManager>, worker: WorkerId, table: &str) -> Self {
        Self {
            manager,
            worker,
            table: table.to_string(),
        }
    }

    fn insert_prefix(&self) -> String {
        let columns: Vec<&str> = SINK_COLUMNS.iter().map(|c| c.name).collect();
        format!("INSERT INTO {} ({}) ", self.table, columns.join(", "))
    }

    fn build_insert<'a>(&self, rows: &'a [SinkRow]) -> QueryBuilder<'a, Postgres> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(self.insert_prefix());
        builder.push_values(rows, |mut b, row| {
            for value in &row.values {
                match value {
                    SinkValue::Int(v) => b.push_bind(*v),
                    SinkValue::Float(v) => b.push_bind(*v),
                    SinkValue::Text(v) => b.push_bind(v.as_str()),
                    SinkValue::Date(v) => b.push_bind(*v),
                    SinkValue::DateTime(v) => b.push_bind(*v),
                };
            }
        });
        builder
    }
}

#[async_trait]
impl SinkStore for PgSink {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Sink).await?;
        let mut tx = conn.begin().await?;
        ensure_schema(&mut tx, &self.table).await?;

        let columns: Vec<String> = SINK_COLUMNS
            .iter()
            .map(|c| {
                if c.name == KEY_COLUMN {
                    format!("{} {} PRIMARY KEY", c.name, c.kind.sql_type())
                } else {
                    format!("{} {} NOT NULL", c.name, c.kind.sql_type())
                }
            })
            .collect();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table,
            columns.join(",\n    ")
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_sale_date_id ON {} (sale_date, {})",
            unqualified(&self.table),
            self.table,
            KEY_COLUMN
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("✅ Sink table {} is ready", self.table);
        Ok(())
    }

    async fn max_key(&self) -> Result<Option<i64>, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Sink).await?;
        let max: Option<i64> = sqlx::query(&format!(
            "SELECT MAX({}) AS max_key FROM {}",
            KEY_COLUMN, self.table
        ))
        .fetch_one(&mut *conn)
        .await?
        .try_get("max_key")?;
        Ok(max)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Sink).await?;
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS count FROM {}", self.table))
            .fetch_one(&mut *conn)
            .await?
            .try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn insert_batch(&self, rows: &[SinkRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows_per_statement = (MAX_BIND_PARAMS / SINK_COLUMNS.len()).max(1);
        let mut conn = self.manager.acquire(self.worker, DbRole::Sink).await?;
        let mut tx = conn.begin().await?;
        for chunk in rows.chunks(rows_per_statement) {
            let mut builder = self.build_insert(chunk);
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_row(&self, row: &SinkRow) -> Result<(), StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Sink).await?;
        let mut builder = self.build_insert(std::slice::from_ref(row));
        builder.build().execute(&mut *conn).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Store characteristics table, living next to the source table it aggregates.
pub struct PgEnrichmentStore {
    manager: Arc<PgConnectionManager>,
    worker: WorkerId,
    table: String,
    source_table: String,
    area_column: Option<String>,
}

impl PgEnrichmentStore {
    pub fn new(
        manager: Arc<PgConnectionManager>,
        worker: WorkerId,
        table: &str,
        source_table: &str,
        area_column: Option<String>,
    ) -> Self {
        Self {
            manager,
            worker,
            table: table.to_string(),
            source_table: source_table.to_string(),
            area_column,
        }
    }
}

#[async_trait]
impl EnrichmentStore for PgEnrichmentStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let mut tx = conn.begin().await?;
        ensure_schema(&mut tx, &self.table).await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                retail_chain TEXT NOT NULL,
                address TEXT NOT NULL,
                sale_date DATE NOT NULL,
                store_format TEXT NOT NULL DEFAULT '',
                store_type TEXT NOT NULL DEFAULT '',
                area_m2 DOUBLE PRECISION NOT NULL DEFAULT 0,
                has_alcohol_department BOOLEAN NOT NULL DEFAULT TRUE,
                has_snacks BOOLEAN NOT NULL DEFAULT TRUE,
                sales_quantity DOUBLE PRECISION NOT NULL DEFAULT 0,
                sales_amount_rub DOUBLE PRECISION NOT NULL DEFAULT 0,
                avg_sell_price DOUBLE PRECISION NOT NULL DEFAULT 0,
                avg_cost_price DOUBLE PRECISION NOT NULL DEFAULT 0,
                city TEXT NOT NULL DEFAULT '',
                federal_subject TEXT NOT NULL DEFAULT '',
                federal_district TEXT NOT NULL DEFAULT '',
                lat DOUBLE PRECISION NOT NULL DEFAULT 0,
                lon DOUBLE PRECISION NOT NULL DEFAULT 0,
                geo_source TEXT NOT NULL DEFAULT 'heuristic',
                created_at TIMESTAMP NOT NULL DEFAULT NOW()
            )",
            self.table
        ))
        .execute(&mut *tx)
        .await?;

        // Natural key uniqueness makes insert_if_absent atomic across concurrent runs
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_{}_natural_key ON {} (retail_chain, address, sale_date)",
            unqualified(&self.table),
            self.table
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("✅ Enrichment table {} is ready", self.table);
        Ok(())
    }

    async fn select_pending(&self, limit: usize) -> Result<Vec<PendingStore>, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT
                s.sale_date::date AS sale_date,
                s.retail_chain,
                COALESCE(s.store_format, '') AS store_format,
                s.address
             FROM {src} s
             WHERE s.sales_quantity > 0
               AND s.retail_chain IS NOT NULL
               AND s.address IS NOT NULL AND s.address <> ''
               AND s.sale_date IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM {enr} e
                   WHERE e.retail_chain = s.retail_chain
                     AND e.address = s.address
                     AND e.sale_date = s.sale_date::date
               )
             ORDER BY sale_date, s.retail_chain, s.address
             LIMIT $1",
            src = self.source_table,
            enr = self.table
        ))
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            pending.push(PendingStore {
                key: NaturalKey {
                    retail_chain: row.try_get("retail_chain")?,
                    address: row.try_get("address")?,
                    sale_date: row.try_get("sale_date")?,
                },
                store_format: row.try_get("store_format")?,
            });
        }
        Ok(pending)
    }

    async fn exists(&self, key: &NaturalKey) -> Result<bool, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let exists: bool = sqlx::query(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE retail_chain = $1 AND address = $2 AND sale_date = $3) AS present",
            self.table
        ))
        .bind(&key.retail_chain)
        .bind(&key.address)
        .bind(key.sale_date)
        .fetch_one(&mut *conn)
        .await?
        .try_get("present")?;
        Ok(exists)
    }

    async fn sales_aggregate(&self, key: &NaturalKey) -> Result<Option<SalesAggregate>, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n,
                    COALESCE(SUM(sales_quantity), 0)::float8 AS quantity,
                    COALESCE(SUM(sales_amount_rub), 0)::float8 AS amount,
                    COALESCE(AVG(avg_sell_price), 0)::float8 AS avg_sell_price,
                    COALESCE(AVG(avg_cost_price), 0)::float8 AS avg_cost_price
             FROM {}
             WHERE retail_chain = $1 AND address = $2 AND sale_date::date = $3",
            self.source_table
        ))
        .bind(&key.retail_chain)
        .bind(&key.address)
        .bind(key.sale_date)
        .fetch_one(&mut *conn)
        .await?;

        let n: i64 = row.try_get("n")?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(SalesAggregate {
            quantity: row.try_get("quantity")?,
            amount: row.try_get("amount")?,
            avg_sell_price: row.try_get("avg_sell_price")?,
            avg_cost_price: row.try_get("avg_cost_price")?,
        }))
    }

    async fn source_area(&self, key: &NaturalKey) -> Result<Option<f64>, StoreError> {
        let Some(column) = &self.area_column else {
            return Ok(None);
        };
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let area: Option<f64> = sqlx::query(&format!(
            "SELECT MAX({})::float8 AS area FROM {}
             WHERE retail_chain = $1 AND address = $2 AND sale_date::date = $3",
            column, self.source_table
        ))
        .bind(&key.retail_chain)
        .bind(&key.address)
        .bind(key.sale_date)
        .fetch_one(&mut *conn)
        .await?
        .try_get("area")?;
        Ok(area.filter(|a| *a > 0.0))
    }

    async fn insert_if_absent(&self, record: &StoreCharacteristic) -> Result<bool, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let result = sqlx::query(&format!(
            "INSERT INTO {} (
                retail_chain, address, sale_date, store_format, store_type, area_m2,
                has_alcohol_department, has_snacks,
                sales_quantity, sales_amount_rub, avg_sell_price, avg_cost_price,
                city, federal_subject, federal_district, lat, lon, geo_source, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
             ON CONFLICT (retail_chain, address, sale_date) DO NOTHING",
            self.table
        ))
        .bind(&record.key.retail_chain)
        .bind(&record.key.address)
        .bind(record.key.sale_date)
        .bind(&record.store_format)
        .bind(&record.store_type)
        .bind(record.area_m2)
        .bind(record.has_alcohol_department)
        .bind(record.has_snacks)
        .bind(record.sales.quantity)
        .bind(record.sales.amount)
        .bind(record.sales.avg_sell_price)
        .bind(record.sales.avg_cost_price)
        .bind(&record.city)
        .bind(&record.federal_subject)
        .bind(&record.federal_district)
        .bind(record.lat)
        .bind(record.lon)
        .bind(record.geo_source.as_str())
        .bind(record.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh_sales(&self) -> Result<u64, StoreError> {
        let mut conn = self.manager.acquire(self.worker, DbRole::Source).await?;
        let result = sqlx::query(&format!(
            "UPDATE {enr} AS sc
             SET sales_quantity = agg.quantity,
                 sales_amount_rub = agg.amount,
                 avg_sell_price = agg.avg_sell_price,
                 avg_cost_price = agg.avg_cost_price
             FROM (
                 SELECT retail_chain, address, sale_date::date AS sale_date,
                        COALESCE(SUM(sales_quantity), 0)::float8 AS quantity,
                        COALESCE(SUM(sales_amount_rub), 0)::float8 AS amount,
                        COALESCE(AVG(avg_sell_price), 0)::float8 AS avg_sell_price,
                        COALESCE(AVG(avg_cost_price), 0)::float8 AS avg_cost_price
                 FROM {src}
                 GROUP BY retail_chain, address, sale_date::date
             ) AS agg
             WHERE sc.retail_chain = agg.retail_chain
               AND sc.address = agg.address
               AND sc.sale_date = agg.sale_date
               AND sc.sales_quantity = 0
               AND agg.quantity <> 0",
            enr = self.table,
            src = self.source_table
        ))
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

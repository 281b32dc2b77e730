//! Transfer engine and batch writer against in-memory stores.

use async_trait::async_trait;
use retail_sync::batch_writer::ResilientBatchWriter;
use retail_sync::error::{StoreError, SyncError};
use retail_sync::normalization::{Normalizer, SinkValue, SourceValue};
use retail_sync::schema::{SinkRow, SourceRow};
use retail_sync::store::{SinkStore, SourceStore};
use retail_sync::transfer::{TransferConfig, TransferEngine};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POISON_CHAIN: &str = "REJECTED BY SINK";

#[derive(Default)]
struct MemorySource {
    rows: Mutex<Vec<SourceRow>>,
}

impl MemorySource {
    fn with_rows(rows: Vec<SourceRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    fn push(&self, row: SourceRow) {
        self.rows.lock().unwrap().push(row);
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn count_after(&self, after: i64) -> Result<u64, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|r| r.key("id").unwrap() > after).count() as u64)
    }

    async fn fetch_after(&self, after: i64, limit: usize) -> Result<Vec<SourceRow>, StoreError> {
        let mut rows: Vec<SourceRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.key("id").unwrap() > after)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.key("id").unwrap());
        rows.truncate(limit);
        Ok(rows)
    }
}

/// Keyed like a primary key; rows of the poison chain are rejected.
#[derive(Default)]
struct MemorySink {
    rows: Mutex<BTreeMap<i64, SinkRow>>,
    bulk_calls: Mutex<usize>,
    unavailable: bool,
}

impl MemorySink {
    fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    fn keys(&self) -> Vec<i64> {
        self.rows.lock().unwrap().keys().copied().collect()
    }

    fn check(&self, row: &SinkRow, existing: &BTreeMap<i64, SinkRow>) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("sink is down".into()));
        }
        if existing.contains_key(&row.key) {
            return Err(StoreError::Backend(format!("duplicate key {}", row.key)));
        }
        if row.get("retail_chain") == Some(&SinkValue::Text(POISON_CHAIN.into())) {
            return Err(StoreError::Backend("value too long for type".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SinkStore for MemorySink {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn max_key(&self) -> Result<Option<i64>, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("sink is down".into()));
        }
        Ok(self.rows.lock().unwrap().keys().next_back().copied())
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().unwrap().len() as u64)
    }

    async fn insert_batch(&self, rows: &[SinkRow]) -> Result<(), StoreError> {
        *self.bulk_calls.lock().unwrap() += 1;
        let mut stored = self.rows.lock().unwrap();
        for row in rows {
            self.check(row, &stored)?;
        }
        for row in rows {
            stored.insert(row.key, row.clone());
        }
        Ok(())
    }

    async fn insert_row(&self, row: &SinkRow) -> Result<(), StoreError> {
        let mut stored = self.rows.lock().unwrap();
        self.check(row, &stored)?;
        stored.insert(row.key, row.clone());
        Ok(())
    }
}

fn row(id: i64, chain: &str) -> SourceRow {
    SourceRow::new(vec![
        ("id".into(), SourceValue::Int(id)),
        ("retail_chain".into(), SourceValue::Text(chain.into())),
        ("sale_date".into(), SourceValue::Text("2024-05-01".into())),
        ("address".into(), SourceValue::Text(format!("ул. Ленина, {}", id))),
        ("sales_quantity".into(), SourceValue::Text("1,5".into())),
        ("weight".into(), SourceValue::Null),
    ])
}

fn rows(ids: impl IntoIterator<Item = i64>) -> Vec<SourceRow> {
    ids.into_iter().map(|id| row(id, "Пятерочка")).collect()
}

fn config(dir: &Path, batch_size: usize) -> TransferConfig {
    TransferConfig {
        table: "analytics.sales".into(),
        key_column: "id".into(),
        batch_size,
        throttle_every_batches: 2,
        throttle: Duration::from_millis(1),
        error_log_dir: dir.to_path_buf(),
        show_progress: false,
        create_table: true,
    }
}

fn log_files(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[tokio::test]
async fn test_full_copy_then_idempotent_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::with_rows(rows([3, 1, 2, 5, 4])));
    let sink = Arc::new(MemorySink::default());
    let engine = TransferEngine::new(source.clone(), sink.clone(), config(dir.path(), 2));

    let first = engine.run().await.unwrap();
    assert_eq!(first.checkpoint, 0);
    assert_eq!(first.pending, 5);
    assert_eq!(first.batches, 3);
    assert_eq!(first.inserted, 5);
    assert_eq!(first.last_key, 5);
    assert_eq!(first.error_count(), 0);
    assert_eq!(first.final_row_count, Some(5));
    assert_eq!(sink.keys(), vec![1, 2, 3, 4, 5]);

    let second = engine.run().await.unwrap();
    assert_eq!(second.checkpoint, 5);
    assert_eq!(second.pending, 0);
    assert_eq!(second.batches, 0);
    assert_eq!(second.inserted, 0);
    assert_eq!(sink.keys(), vec![1, 2, 3, 4, 5]);

    // No errors: no log file left behind
    assert!(first.error_log.is_none());
    assert!(log_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_checkpoint_only_moves_forward() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::with_rows(rows(1..=4)));
    let sink = Arc::new(MemorySink::default());
    let engine = TransferEngine::new(source.clone(), sink.clone(), config(dir.path(), 10));

    let first = engine.run().await.unwrap();
    assert_eq!(first.last_key, 4);

    for id in 5..=7 {
        source.push(row(id, "Магнит"));
    }
    let second = engine.run().await.unwrap();
    assert_eq!(second.checkpoint, 4);
    assert_eq!(second.fetched, 3);
    assert_eq!(second.inserted, 3);
    assert!(second.last_key > first.last_key);
    assert_eq!(sink.keys(), (1..=7).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_rows_are_normalized_on_the_way() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::with_rows(rows([1])));
    let sink = Arc::new(MemorySink::default());
    TransferEngine::new(source, sink.clone(), config(dir.path(), 10))
        .run()
        .await
        .unwrap();

    let stored = sink.rows.lock().unwrap();
    let row = &stored[&1];
    assert_eq!(row.get("sales_quantity"), Some(&SinkValue::Float(1.5)));
    assert_eq!(row.get("weight"), Some(&SinkValue::Float(0.0)));
    assert_eq!(row.get("brand"), Some(&SinkValue::Text(String::new())));
    assert_eq!(row.get("sale_year"), Some(&SinkValue::Int(0)));
}

#[tokio::test]
async fn test_rejected_row_is_isolated_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let mut source_rows = rows(1..=5);
    source_rows[2] = row(3, POISON_CHAIN);
    let source = Arc::new(MemorySource::with_rows(source_rows));
    let sink = Arc::new(MemorySink::default());

    let stats = TransferEngine::new(source, sink.clone(), config(dir.path(), 10))
        .run()
        .await
        .unwrap();

    assert_eq!(stats.inserted, 4);
    assert_eq!(stats.insert_errors, 1);
    assert_eq!(stats.last_key, 5);
    assert_eq!(sink.keys(), vec![1, 2, 4, 5]);

    let log = stats.error_log.expect("error log kept when rows failed");
    let text = std::fs::read_to_string(&log).unwrap();
    assert!(text.starts_with("Transfer error log for table analytics.sales"));
    assert!(text.contains("batch #1 | row 3 |"));
    assert!(log
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("error_rows_analytics_sales_"));
}

#[tokio::test]
async fn test_conversion_failure_still_advances_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut source_rows = rows(1..=4);
    source_rows[1].push("sale_year", SourceValue::Text("two thousand".into()));
    let source = Arc::new(MemorySource::with_rows(source_rows));
    let sink = Arc::new(MemorySink::default());

    let stats = TransferEngine::new(source, sink.clone(), config(dir.path(), 2))
        .run()
        .await
        .unwrap();

    assert_eq!(stats.conversion_errors, 1);
    assert_eq!(stats.inserted, 3);
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.last_key, 4);
    assert_eq!(sink.keys(), vec![1, 3, 4]);
    assert!(stats.error_log.is_some());
}

#[tokio::test]
async fn test_unreachable_sink_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::with_rows(rows(1..=3)));
    let sink = Arc::new(MemorySink::unavailable());

    let err = TransferEngine::new(source, sink, config(dir.path(), 10))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_writer_falls_back_row_by_row() {
    let sink = Arc::new(MemorySink::default());
    let writer = ResilientBatchWriter::new(sink.clone());
    let normalizer = Normalizer::default();

    let mut batch: Vec<SinkRow> = rows(1..=4)
        .iter()
        .map(|r| SinkRow::from_source(r, &normalizer, "id").unwrap())
        .collect();
    batch[1].set("retail_chain", SinkValue::Text(POISON_CHAIN.into()));

    let result = writer.write(7, &batch).await.unwrap();
    assert_eq!(result.inserted_count, 3);
    assert_eq!(result.failed_rows.len(), 1);
    assert_eq!(result.failed_rows[0].key, 2);
    assert!(result.used_fallback);
    assert_eq!(*sink.bulk_calls.lock().unwrap(), 1);
    assert_eq!(sink.keys(), vec![1, 3, 4]);
}

#[tokio::test]
async fn test_writer_clean_batch_uses_one_bulk_insert() {
    let sink = Arc::new(MemorySink::default());
    let writer = ResilientBatchWriter::new(sink.clone());
    let normalizer = Normalizer::default();
    let batch: Vec<SinkRow> = rows(1..=3)
        .iter()
        .map(|r| SinkRow::from_source(r, &normalizer, "id").unwrap())
        .collect();

    let result = writer.write(1, &batch).await.unwrap();
    assert_eq!(result.inserted_count, 3);
    assert!(result.failed_rows.is_empty());
    assert!(!result.used_fallback);

    let empty = writer.write(2, &[]).await.unwrap();
    assert_eq!(empty.inserted_count, 0);
    assert_eq!(*sink.bulk_calls.lock().unwrap(), 1);
}

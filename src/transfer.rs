// src/transfer.rs
//
// Checkpointed incremental transfer:
//   checkpoint = max(key) in the sink
//   loop: fetch key > cursor (ascending, bounded) -> normalize -> write -> advance cursor
// The checkpoint is never stored anywhere else, so a restart resumes from the sink.

use crate::batch_writer::ResilientBatchWriter;
use crate::error::SyncError;
use crate::error_log::{ErrorLog, ErrorRecord};
use crate::metrics;
use crate::normalization::Normalizer;
use crate::progress;
use crate::schema::{SinkRow, SourceRow};
use crate::settings::Settings;
use crate::store::{SinkStore, SourceStore};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Sink table name, used for the error log file name and messages
    pub table: String,
    pub key_column: String,
    pub batch_size: usize,
    pub throttle_every_batches: u64,
    pub throttle: Duration,
    pub error_log_dir: PathBuf,
    pub show_progress: bool,
    pub create_table: bool,
}

impl TransferConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            table: settings.sink.table.clone(),
            key_column: settings.source.key_column.clone(),
            batch_size: settings.transfer.batch_size,
            throttle_every_batches: settings.transfer.throttle_every_batches,
            throttle: Duration::from_millis(settings.transfer.throttle_ms),
            error_log_dir: settings.transfer.error_log_dir.clone(),
            show_progress: settings.transfer.show_progress,
            create_table: settings.sink.create_table,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Sink high-water mark when the run started
    pub checkpoint: i64,
    /// Cursor when the run ended
    pub last_key: i64,
    pub pending: u64,
    pub batches: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub conversion_errors: u64,
    pub insert_errors: u64,
    pub final_row_count: Option<u64>,
    pub elapsed: Duration,
    /// Kept only when the run had errors
    pub error_log: Option<PathBuf>,
}

impl TransferStats {
    pub fn error_count(&self) -> u64 {
        self.conversion_errors + self.insert_errors
    }
}

pub struct TransferEngine<S: SourceStore + ?Sized, K: SinkStore + ?Sized> {
    source: Arc<S>,
    sink: Arc<K>,
    writer: ResilientBatchWriter<K>,
    normalizer: Normalizer,
    config: TransferConfig,
}

impl<S: SourceStore + ?Sized, K: SinkStore + ?Sized> TransferEngine<S, K> {
    pub fn new(source: Arc<S>, sink: Arc<K>, config: TransferConfig) -> Self {
        Self {
            writer: ResilientBatchWriter::new(sink.clone()),
            source,
            sink,
            normalizer: Normalizer::default(),
            config,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Runs until the source has no rows beyond the cursor.
    ///
    /// Row-level failures end up in the error log and the stats. Store failures
    /// (fetch, checkpoint, unreachable sink) abort the run.
    pub async fn run(&self) -> Result<TransferStats, SyncError> {
        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);

        if self.config.create_table {
            self.sink.ensure_table().await?;
        }

        let checkpoint = self.sink.max_key().await?.unwrap_or(0);
        info!("📍 Checkpoint for {}: {} = {}", self.config.table, self.config.key_column, checkpoint);

        let pending = self.source.count_after(checkpoint).await?;
        let mut stats = TransferStats {
            checkpoint,
            last_key: checkpoint,
            pending,
            ..TransferStats::default()
        };
        if pending == 0 {
            info!("✅ No new rows for {}", self.config.table);
            stats.elapsed = started.elapsed();
            return Ok(stats);
        }
        info!("Found {} new rows for {}", pending, self.config.table);

        let mut error_log = match ErrorLog::create(&self.config.error_log_dir, &self.config.table) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("⚠️ Cannot create error log in {}: {}", self.config.error_log_dir.display(), e);
                None
            }
        };
        let pb = progress::create_progress_bar(
            pending,
            &format!("Transferring into {}", self.config.table),
            self.config.show_progress,
        );

        let mut cursor = checkpoint;
        loop {
            let rows = self.source.fetch_after(cursor, batch_size).await?;
            if rows.is_empty() {
                debug!("No rows after key {}, transfer done", cursor);
                break;
            }

            stats.batches += 1;
            let batch_no = stats.batches;
            stats.fetched += rows.len() as u64;
            metrics::increment_rows_fetched(rows.len() as u64);

            let (sink_rows, batch_max) = self.convert_batch(&rows, batch_no, &mut error_log, &mut stats);

            let result = self.writer.write(batch_no, &sink_rows).await?;
            stats.inserted += result.inserted_count as u64;
            metrics::increment_rows_inserted(result.inserted_count as u64);
            for failed in &result.failed_rows {
                stats.insert_errors += 1;
                record(&mut error_log, ErrorRecord::new(Some(failed.key), batch_no, &failed.reason));
            }
            if result.used_fallback {
                info!(
                    "Batch #{}: {} of {} rows inserted one by one",
                    batch_no,
                    result.inserted_count,
                    sink_rows.len()
                );
            }

            pb.inc(rows.len() as u64);

            match batch_max {
                Some(max) if max > cursor => cursor = max,
                _ => {
                    warn!(
                        "⚠️ Batch #{} did not move the cursor past {}, stopping",
                        batch_no, cursor
                    );
                    break;
                }
            }
            stats.last_key = cursor;

            if self.config.throttle_every_batches > 0
                && batch_no % self.config.throttle_every_batches == 0
                && !self.config.throttle.is_zero()
            {
                tokio::time::sleep(self.config.throttle).await;
            }
        }
        pb.finish_and_clear();

        stats.error_log = error_log.and_then(ErrorLog::finish);
        stats.elapsed = started.elapsed();

        if stats.error_count() > 0 {
            match &stats.error_log {
                Some(path) => warn!("⚠️ {} rows failed, see {}", stats.error_count(), path.display()),
                None => warn!("⚠️ {} rows failed", stats.error_count()),
            }
        }

        match self.sink.row_count().await {
            Ok(count) => {
                info!("✅ {} now holds {} rows", self.config.table, count);
                stats.final_row_count = Some(count);
            }
            Err(e) => warn!("Cannot read final row count of {}: {}", self.config.table, e),
        }

        Ok(stats)
    }

    /// Converts a fetched batch. Returns the convertible rows and the largest key seen,
    /// including keys of rows that failed conversion.
    fn convert_batch(
        &self,
        rows: &[SourceRow],
        batch_no: u64,
        error_log: &mut Option<ErrorLog>,
        stats: &mut TransferStats,
    ) -> (Vec<SinkRow>, Option<i64>) {
        let mut converted = Vec::with_capacity(rows.len());
        let mut batch_max: Option<i64> = None;
        let mut failures = 0u64;

        for row in rows {
            let key = row.key(&self.config.key_column).ok();
            if let Some(k) = key {
                batch_max = Some(batch_max.map_or(k, |m| m.max(k)));
            }
            match SinkRow::from_source(row, &self.normalizer, &self.config.key_column) {
                Ok(sink_row) => converted.push(sink_row),
                Err(e) => {
                    failures += 1;
                    debug!("Batch #{}: row {:?} not converted: {}", batch_no, key, e);
                    record(error_log, ErrorRecord::new(key, batch_no, e.to_string()));
                }
            }
        }

        if failures > 0 {
            warn!("⚠️ Batch #{}: {} rows could not be converted", batch_no, failures);
            stats.conversion_errors += failures;
            metrics::increment_failed_rows("convert", failures);
        }
        (converted, batch_max)
    }
}

fn record(error_log: &mut Option<ErrorLog>, rec: ErrorRecord) {
    if let Some(log) = error_log.as_mut() {
        log.record(&rec);
    }
}

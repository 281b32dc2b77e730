// src/batch_writer.rs
//
// Bulk insert first; on failure, row-by-row so one bad row cannot sink the batch.

use crate::error::StoreError;
use crate::metrics;
use crate::schema::SinkRow;
use crate::store::SinkStore;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Instant;

/// A row the sink rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRow {
    pub key: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub inserted_count: usize,
    pub failed_rows: Vec<FailedRow>,
    /// True when the bulk insert failed and rows went in one by one
    pub used_fallback: bool,
}

pub struct ResilientBatchWriter<S: SinkStore + ?Sized> {
    sink: Arc<S>,
}

impl<S: SinkStore + ?Sized> ResilientBatchWriter<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }

    /// Writes one batch.
    ///
    /// Rejected rows are reported in [`WriteResult::failed_rows`], never raised.
    /// Only an unreachable sink is returned as an error.
    pub async fn write(&self, batch_no: u64, rows: &[SinkRow]) -> Result<WriteResult, StoreError> {
        if rows.is_empty() {
            return Ok(WriteResult::default());
        }

        let start = Instant::now();
        match self.sink.insert_batch(rows).await {
            Ok(()) => {
                metrics::record_batch_write(start.elapsed(), rows.len(), false);
                debug!("Batch {}: bulk insert of {} rows", batch_no, rows.len());
                return Ok(WriteResult {
                    inserted_count: rows.len(),
                    failed_rows: Vec::new(),
                    used_fallback: false,
                });
            }
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                warn!(
                    "⚠️ Batch {}: bulk insert of {} rows failed ({}), inserting row by row",
                    batch_no,
                    rows.len(),
                    e
                );
            }
        }

        let mut result = WriteResult {
            used_fallback: true,
            ..WriteResult::default()
        };
        for row in rows {
            match self.sink.insert_row(row).await {
                Ok(()) => result.inserted_count += 1,
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    error!("Batch {}: row {} rejected: {}", batch_no, row.key, e);
                    result.failed_rows.push(FailedRow {
                        key: row.key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        metrics::record_batch_write(start.elapsed(), rows.len(), true);
        metrics::increment_failed_rows("insert", result.failed_rows.len() as u64);
        Ok(result)
    }
}

// src/error_log.rs
//
// Per-run, append-only log of rows that could not be transferred.
// The file is removed again when the run ends without errors.

use chrono::{Local, NaiveDateTime};
use log::warn;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One failed row.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub row_key: Option<i64>,
    pub batch_no: u64,
    pub reason: String,
    pub at: NaiveDateTime,
}

impl ErrorRecord {
    pub fn new(row_key: Option<i64>, batch_no: u64, reason: impl Into<String>) -> Self {
        Self {
            row_key,
            batch_no,
            reason: reason.into(),
            at: Local::now().naive_local(),
        }
    }

    fn to_line(&self) -> String {
        let key = match self.row_key {
            Some(k) => k.to_string(),
            None => "?".to_string(),
        };
        format!(
            "[{}] batch #{} | row {} | {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.batch_no,
            key,
            self.reason.replace('\n', " ")
        )
    }
}

pub struct ErrorLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    count: u64,
}

impl ErrorLog {
    /// Creates `error_rows_<table>_<YYYYmmdd_HHMMSS>.log` in `dir` and writes the header.
    pub fn create(dir: &Path, table: &str) -> io::Result<Self> {
        let started = Local::now();
        fs::create_dir_all(dir)?;
        let file_name = format!(
            "error_rows_{}_{}.log",
            sanitize(table),
            started.format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(file_name);
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "Transfer error log for table {}", table)?;
        writeln!(writer, "Started at: {}", started.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(writer, "{}", "=".repeat(50))?;
        Ok(Self {
            path,
            writer: Some(writer),
            count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Appends one record. Write failures are logged and otherwise ignored.
    pub fn record(&mut self, record: &ErrorRecord) {
        self.count += 1;
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{}", record.to_line()) {
            warn!("Cannot write to error log {}: {}", self.path.display(), e);
            self.writer = None;
        }
    }

    /// Flushes the log. Returns its path when it holds errors; deletes it otherwise.
    pub fn finish(mut self) -> Option<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Cannot flush error log {}: {}", self.path.display(), e);
            }
        }
        if self.count == 0 {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Cannot remove empty error log {}: {}", self.path.display(), e);
            }
            return None;
        }
        Some(self.path.clone())
    }
}

fn sanitize(table: &str) -> String {
    table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::create(dir.path(), "analytics.sales").unwrap();
        let path = log.path().to_path_buf();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("error_rows_analytics_sales_"));
        assert!(name.ends_with(".log"));
        assert_eq!(log.finish(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_records_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ErrorLog::create(dir.path(), "sales").unwrap();
        log.record(&ErrorRecord::new(Some(42), 3, "Column 'sale_year' expects integer"));
        log.record(&ErrorRecord::new(None, 3, "multi\nline"));
        assert_eq!(log.count(), 2);

        let path = log.finish().expect("log with errors must be kept");
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Transfer error log for table sales");
        assert!(lines[1].starts_with("Started at: "));
        assert_eq!(lines[2], "=".repeat(50));
        assert!(lines[3].contains("batch #3 | row 42 | Column 'sale_year' expects integer"));
        assert!(lines[4].ends_with("row ? | multi line"));
    }
}

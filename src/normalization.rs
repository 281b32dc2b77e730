// src/normalization.rs
//
// Maps heterogeneous source cells onto the small set of sink-native value types,
// applying per-column defaults so that no sink cell is ever null.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Column holding the sale date.
pub const SALE_DATE_COLUMN: &str = "sale_date";

/// Columns stored as 64-bit floats in the sink.
pub const NUMERIC_COLUMNS: [&str; 14] = [
    "weight",
    "sales_quantity",
    "sales_amount_rub",
    "avg_cost_price",
    "avg_sell_price",
    "sales_amount_with_vat",
    "promo_sales_amount_with_vat",
    "writeoff_quantity",
    "writeoff_amount_rub",
    "margin_amount_rub",
    "loss_quantity",
    "loss_amount_rub",
    "sales_tons",
    "sales_weight_kg",
];

/// Text tokens treated as a missing value (compared after trimming, case-insensitive).
pub const NULL_SENTINELS: [&str; 5] = ["", "-", "nan", "null", "none"];

/// A cell as read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Null,
    Decimal(Decimal),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// A cell in the sink's native type system.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl SinkValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SinkValue::Int(_) => "integer",
            SinkValue::Float(_) => "float",
            SinkValue::Text(_) => "text",
            SinkValue::Date(_) => "date",
            SinkValue::DateTime(_) => "datetime",
        }
    }
}

impl std::fmt::Display for SinkValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkValue::Int(v) => write!(f, "{}", v),
            SinkValue::Float(v) => write!(f, "{}", v),
            SinkValue::Text(v) => write!(f, "{}", v),
            SinkValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            SinkValue::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// 1970-01-01, the default for the sale-date column.
pub fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Pure, total value normalizer.
///
/// The numeric-column set and the sale-date column decide which default a
/// missing value resolves to and how strings are parsed.
#[derive(Debug, Clone)]
pub struct Normalizer {
    numeric_columns: HashSet<String>,
    date_column: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(NUMERIC_COLUMNS.iter().copied(), SALE_DATE_COLUMN)
    }
}

impl Normalizer {
    pub fn new<'a>(numeric_columns: impl IntoIterator<Item = &'a str>, date_column: &str) -> Self {
        Self {
            numeric_columns: numeric_columns.into_iter().map(str::to_string).collect(),
            date_column: date_column.to_string(),
        }
    }

    pub fn is_numeric(&self, column: &str) -> bool {
        self.numeric_columns.contains(column)
    }

    pub fn is_date(&self, column: &str) -> bool {
        self.date_column == column
    }

    /// Default for a missing cell in `column`.
    pub fn default_for(&self, column: &str) -> SinkValue {
        if self.is_date(column) {
            SinkValue::Date(epoch_date())
        } else if self.is_numeric(column) {
            SinkValue::Float(0.0)
        } else {
            SinkValue::Text(String::new())
        }
    }

    /// Normalizes one cell. Never fails.
    pub fn normalize(&self, value: &SourceValue, column: &str) -> SinkValue {
        match value {
            SourceValue::Null => self.default_for(column),
            SourceValue::Decimal(d) => SinkValue::Float(d.to_f64().unwrap_or(0.0)),
            SourceValue::DateTime(dt) if self.is_date(column) => SinkValue::Date(dt.date()),
            SourceValue::DateTime(dt) => SinkValue::DateTime(*dt),
            SourceValue::Date(d) => SinkValue::Date(*d),
            SourceValue::Text(s) => self.normalize_text(s, column),
            SourceValue::Bool(b) => SinkValue::Int(i64::from(*b)),
            SourceValue::Int(i) => SinkValue::Int(*i),
            SourceValue::Float(f) => SinkValue::Float(*f),
            SourceValue::Bytes(raw) => match std::str::from_utf8(raw) {
                Ok(s) => SinkValue::Text(s.to_string()),
                Err(_) => SinkValue::Text(String::new()),
            },
        }
    }

    fn normalize_text(&self, raw: &str, column: &str) -> SinkValue {
        let text = raw.trim();
        if is_null_sentinel(text) {
            return self.default_for(column);
        }
        if self.is_date(column) {
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap_or_else(|_| epoch_date());
            return SinkValue::Date(date);
        }
        if self.is_numeric(column) {
            let parsed = text.replace(',', ".").parse::<f64>().unwrap_or(0.0);
            return SinkValue::Float(parsed);
        }
        SinkValue::Text(text.to_string())
    }
}

pub fn is_null_sentinel(text: &str) -> bool {
    NULL_SENTINELS
        .iter()
        .any(|sentinel| text.eq_ignore_ascii_case(sentinel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_null_defaults_per_column_class() {
        let n = Normalizer::default();
        assert_eq!(n.normalize(&SourceValue::Null, "sales_quantity"), SinkValue::Float(0.0));
        assert_eq!(n.normalize(&SourceValue::Null, "address"), SinkValue::Text(String::new()));
        assert_eq!(n.normalize(&SourceValue::Null, "sale_date"), SinkValue::Date(ymd(1970, 1, 1)));
    }

    #[test]
    fn test_numeric_strings() {
        let n = Normalizer::default();
        assert_eq!(n.normalize(&SourceValue::Text("1,5".into()), "weight"), SinkValue::Float(1.5));
        assert_eq!(n.normalize(&SourceValue::Text("nan".into()), "sales_quantity"), SinkValue::Float(0.0));
        assert_eq!(n.normalize(&SourceValue::Text(" 12.25 ".into()), "sales_amount_rub"), SinkValue::Float(12.25));
        assert_eq!(n.normalize(&SourceValue::Text("abc".into()), "loss_quantity"), SinkValue::Float(0.0));
    }

    #[test]
    fn test_sentinels_are_case_insensitive() {
        let n = Normalizer::default();
        for token in ["", "  ", "-", "NaN", "NULL", "None", "nOnE"] {
            assert_eq!(
                n.normalize(&SourceValue::Text(token.into()), "brand"),
                SinkValue::Text(String::new()),
                "token {:?}",
                token
            );
            assert_eq!(n.normalize(&SourceValue::Text(token.into()), "weight"), SinkValue::Float(0.0));
        }
    }

    #[test]
    fn test_sale_date_handling() {
        let n = Normalizer::default();
        let dt = ymd(2024, 3, 15).and_hms_opt(13, 45, 0).unwrap();
        assert_eq!(n.normalize(&SourceValue::DateTime(dt), "sale_date"), SinkValue::Date(ymd(2024, 3, 15)));
        assert_eq!(n.normalize(&SourceValue::DateTime(dt), "loaded_at"), SinkValue::DateTime(dt));
        assert_eq!(
            n.normalize(&SourceValue::Text("2024-02-29".into()), "sale_date"),
            SinkValue::Date(ymd(2024, 2, 29))
        );
        assert_eq!(
            n.normalize(&SourceValue::Text("29.02.2024".into()), "sale_date"),
            SinkValue::Date(epoch_date())
        );
    }

    #[test]
    fn test_scalar_passthrough() {
        let n = Normalizer::default();
        let dec = Decimal::from_str("1234.5").unwrap();
        assert_eq!(n.normalize(&SourceValue::Decimal(dec), "sales_amount_rub"), SinkValue::Float(1234.5));
        assert_eq!(n.normalize(&SourceValue::Bool(true), "flag"), SinkValue::Int(1));
        assert_eq!(n.normalize(&SourceValue::Bool(false), "flag"), SinkValue::Int(0));
        assert_eq!(n.normalize(&SourceValue::Int(42), "id"), SinkValue::Int(42));
        assert_eq!(n.normalize(&SourceValue::Float(2.5), "weight"), SinkValue::Float(2.5));
        assert_eq!(n.normalize(&SourceValue::Text("  Магнит ".into()), "retail_chain"), SinkValue::Text("Магнит".into()));
    }

    #[test]
    fn test_bytes_fallback() {
        let n = Normalizer::default();
        assert_eq!(
            n.normalize(&SourceValue::Bytes(b"raw".to_vec()), "barcode"),
            SinkValue::Text("raw".into())
        );
        assert_eq!(
            n.normalize(&SourceValue::Bytes(vec![0xff, 0xfe, 0x00]), "barcode"),
            SinkValue::Text(String::new())
        );
    }

    #[test]
    fn test_totality_over_every_input_kind() {
        let n = Normalizer::default();
        let inputs = vec![
            SourceValue::Null,
            SourceValue::Decimal(Decimal::new(-15, 1)),
            SourceValue::Date(ymd(2023, 1, 1)),
            SourceValue::DateTime(ymd(2023, 1, 1).and_hms_opt(0, 0, 0).unwrap()),
            SourceValue::Bool(true),
            SourceValue::Int(-7),
            SourceValue::Float(f64::MAX),
            SourceValue::Text("ÿ ∞ 🙂".into()),
            SourceValue::Bytes(vec![]),
        ];
        for column in ["sale_date", "sales_quantity", "address"] {
            for value in &inputs {
                // Must return without panicking for every combination.
                let _ = n.normalize(value, column);
            }
        }
        // Missing and sentinel values always land in the column's own type.
        for value in [SourceValue::Null, SourceValue::Text("none".into())] {
            assert_eq!(n.normalize(&value, "sale_date").type_name(), "date");
            assert_eq!(n.normalize(&value, "sales_quantity").type_name(), "float");
            assert_eq!(n.normalize(&value, "address").type_name(), "text");
        }
    }

    #[test]
    fn test_custom_column_sets() {
        let n = Normalizer::new(["price"], "day");
        assert_eq!(n.normalize(&SourceValue::Null, "price"), SinkValue::Float(0.0));
        assert_eq!(n.normalize(&SourceValue::Null, "weight"), SinkValue::Text(String::new()));
        assert_eq!(n.normalize(&SourceValue::Null, "day"), SinkValue::Date(epoch_date()));
    }
}

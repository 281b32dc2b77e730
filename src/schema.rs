// src/schema.rs
//
// Fixed sink schema and the conversion of source rows into sink rows.

use crate::error::RowError;
use crate::normalization::{Normalizer, SinkValue, SourceValue};
use rust_decimal::prelude::ToPrimitive;

/// Storage type of a sink column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Text,
    Date,
}

impl ColumnKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Int => "BIGINT",
            ColumnKind::Float => "DOUBLE PRECISION",
            ColumnKind::Text => "TEXT",
            ColumnKind::Date => "DATE",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ColumnKind::Int => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Text => "text",
            ColumnKind::Date => "date",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SinkColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> SinkColumn {
    SinkColumn { name, kind }
}

/// Incrementing key of the sink table.
pub const KEY_COLUMN: &str = "id";

/// Sink columns in storage order. The key is always first.
pub const SINK_COLUMNS: &[SinkColumn] = &[
    col("id", ColumnKind::Int),
    col("retail_chain", ColumnKind::Text),
    col("sale_year", ColumnKind::Int),
    col("sale_month", ColumnKind::Int),
    col("sale_date", ColumnKind::Date),
    col("branch", ColumnKind::Text),
    col("region", ColumnKind::Text),
    col("city", ColumnKind::Text),
    col("address", ColumnKind::Text),
    col("store_format", ColumnKind::Text),
    col("store_name", ColumnKind::Text),
    col("product_name", ColumnKind::Text),
    col("brand", ColumnKind::Text),
    col("flavor", ColumnKind::Text),
    col("weight", ColumnKind::Float),
    col("product_type", ColumnKind::Text),
    col("package_type", ColumnKind::Text),
    col("product_level_1", ColumnKind::Text),
    col("product_level_2", ColumnKind::Text),
    col("product_level_3", ColumnKind::Text),
    col("product_level_4", ColumnKind::Text),
    col("product_family_code", ColumnKind::Text),
    col("product_family_name", ColumnKind::Text),
    col("product_article", ColumnKind::Text),
    col("product_code", ColumnKind::Text),
    col("barcode", ColumnKind::Text),
    col("factory_code", ColumnKind::Text),
    col("factory_name", ColumnKind::Text),
    col("material", ColumnKind::Text),
    col("vendor", ColumnKind::Text),
    col("supplier", ColumnKind::Text),
    col("warehouse_supplier", ColumnKind::Text),
    col("sales_quantity", ColumnKind::Float),
    col("sales_amount_rub", ColumnKind::Float),
    col("avg_cost_price", ColumnKind::Float),
    col("avg_sell_price", ColumnKind::Float),
    col("sales_amount_with_vat", ColumnKind::Float),
    col("promo_sales_amount_with_vat", ColumnKind::Float),
    col("writeoff_quantity", ColumnKind::Float),
    col("writeoff_amount_rub", ColumnKind::Float),
    col("margin_amount_rub", ColumnKind::Float),
    col("loss_quantity", ColumnKind::Float),
    col("loss_amount_rub", ColumnKind::Float),
    col("sales_tons", ColumnKind::Float),
    col("sales_weight_kg", ColumnKind::Float),
];

pub fn column_names() -> impl Iterator<Item = &'static str> {
    SINK_COLUMNS.iter().map(|c| c.name)
}

/// One source row: ordered (column, value) cells as returned by the query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    cells: Vec<(String, SourceValue)>,
}

impl SourceRow {
    pub fn new(cells: Vec<(String, SourceValue)>) -> Self {
        Self { cells }
    }

    pub fn push(&mut self, column: impl Into<String>, value: SourceValue) {
        self.cells.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&SourceValue> {
        self.cells
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Reads the incrementing key.
    pub fn key(&self, column: &str) -> Result<i64, RowError> {
        let invalid = |value: String| RowError::InvalidKey {
            column: column.to_string(),
            value,
        };
        match self.get(column) {
            None | Some(SourceValue::Null) => Err(RowError::MissingKey(column.to_string())),
            Some(SourceValue::Int(v)) => Ok(*v),
            Some(SourceValue::Decimal(d)) if d.fract().is_zero() => {
                d.to_i64().ok_or_else(|| invalid(d.to_string()))
            }
            Some(SourceValue::Float(f)) if f.is_finite() && f.fract() == 0.0 => Ok(*f as i64),
            Some(SourceValue::Text(s)) => s.trim().parse::<i64>().map_err(|_| invalid(s.clone())),
            Some(other) => Err(invalid(format!("{:?}", other))),
        }
    }
}

/// A row ready for the sink: one value per entry of [`SINK_COLUMNS`].
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRow {
    pub key: i64,
    pub values: Vec<SinkValue>,
}

impl SinkRow {
    /// Normalizes every sink column by name and coerces it to the column type.
    /// Columns missing from the source get their normalization default.
    pub fn from_source(
        row: &SourceRow,
        normalizer: &Normalizer,
        key_column: &str,
    ) -> Result<Self, RowError> {
        let key = row.key(key_column)?;
        let mut values = Vec::with_capacity(SINK_COLUMNS.len());
        for column in SINK_COLUMNS {
            if column.name == KEY_COLUMN {
                values.push(SinkValue::Int(key));
                continue;
            }
            let raw = row.get(column.name).unwrap_or(&SourceValue::Null);
            let value = normalizer.normalize(raw, column.name);
            values.push(coerce(value, column)?);
        }
        Ok(Self { key, values })
    }

    pub fn get(&self, column: &str) -> Option<&SinkValue> {
        SINK_COLUMNS
            .iter()
            .position(|c| c.name == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Replaces the value of `column`. Returns false for unknown columns.
    pub fn set(&mut self, column: &str, value: SinkValue) -> bool {
        match SINK_COLUMNS.iter().position(|c| c.name == column) {
            Some(idx) if idx < self.values.len() => {
                self.values[idx] = value;
                true
            }
            _ => false,
        }
    }
}

/// Brings a normalized value into the storage type of `column`.
pub fn coerce(value: SinkValue, column: &SinkColumn) -> Result<SinkValue, RowError> {
    let mismatch = |v: &SinkValue| RowError::Coercion {
        column: column.name.to_string(),
        expected: column.kind.label(),
        value: v.to_string(),
    };
    match (column.kind, value) {
        (ColumnKind::Int, SinkValue::Int(i)) => Ok(SinkValue::Int(i)),
        (ColumnKind::Int, SinkValue::Float(f)) if f.is_finite() && f.fract() == 0.0 => {
            Ok(SinkValue::Int(f as i64))
        }
        (ColumnKind::Int, SinkValue::Text(s)) if s.is_empty() => Ok(SinkValue::Int(0)),
        (ColumnKind::Int, SinkValue::Text(s)) => match s.parse::<i64>() {
            Ok(i) => Ok(SinkValue::Int(i)),
            Err(_) => Err(mismatch(&SinkValue::Text(s))),
        },

        (ColumnKind::Float, SinkValue::Float(f)) => Ok(SinkValue::Float(f)),
        (ColumnKind::Float, SinkValue::Int(i)) => Ok(SinkValue::Float(i as f64)),
        (ColumnKind::Float, SinkValue::Text(s)) if s.is_empty() => Ok(SinkValue::Float(0.0)),
        (ColumnKind::Float, SinkValue::Text(s)) => match s.replace(',', ".").parse::<f64>() {
            Ok(f) => Ok(SinkValue::Float(f)),
            Err(_) => Err(mismatch(&SinkValue::Text(s))),
        },

        (ColumnKind::Text, SinkValue::Text(s)) => Ok(SinkValue::Text(s)),
        (ColumnKind::Text, other) => Ok(SinkValue::Text(other.to_string())),

        (ColumnKind::Date, SinkValue::Date(d)) => Ok(SinkValue::Date(d)),
        (ColumnKind::Date, SinkValue::DateTime(dt)) => Ok(SinkValue::Date(dt.date())),

        (_, other) => Err(mismatch(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::epoch_date;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn sample_row(id: SourceValue) -> SourceRow {
        SourceRow::new(vec![
            ("id".into(), id),
            ("retail_chain".into(), SourceValue::Text("Пятерочка".into())),
            ("sale_year".into(), SourceValue::Int(2024)),
            ("sale_month".into(), SourceValue::Text("3".into())),
            ("sale_date".into(), SourceValue::Text("2024-03-01".into())),
            ("weight".into(), SourceValue::Text("0,45".into())),
            ("sales_quantity".into(), SourceValue::Decimal(Decimal::new(125, 1))),
            ("barcode".into(), SourceValue::Int(4600000000017)),
        ])
    }

    #[test]
    fn test_sink_schema_layout() {
        assert_eq!(SINK_COLUMNS.len(), 45);
        assert_eq!(SINK_COLUMNS[0].name, KEY_COLUMN);
        let floats = SINK_COLUMNS.iter().filter(|c| c.kind == ColumnKind::Float).count();
        assert_eq!(floats, crate::normalization::NUMERIC_COLUMNS.len());
    }

    #[test]
    fn test_from_source_fills_every_column() {
        let row = SinkRow::from_source(&sample_row(SourceValue::Int(7)), &Normalizer::default(), "id").unwrap();
        assert_eq!(row.key, 7);
        assert_eq!(row.values.len(), SINK_COLUMNS.len());
        assert_eq!(row.get("sale_month"), Some(&SinkValue::Int(3)));
        assert_eq!(row.get("sale_date"), Some(&SinkValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())));
        assert_eq!(row.get("weight"), Some(&SinkValue::Float(0.45)));
        assert_eq!(row.get("sales_quantity"), Some(&SinkValue::Float(12.5)));
        assert_eq!(row.get("barcode"), Some(&SinkValue::Text("4600000000017".into())));
        // Absent in the source: defaults by column class.
        assert_eq!(row.get("address"), Some(&SinkValue::Text(String::new())));
        assert_eq!(row.get("loss_amount_rub"), Some(&SinkValue::Float(0.0)));
    }

    #[test]
    fn test_key_variants() {
        assert_eq!(sample_row(SourceValue::Decimal(Decimal::new(42, 0))).key("id"), Ok(42));
        assert_eq!(sample_row(SourceValue::Text(" 15 ".into())).key("id"), Ok(15));
        assert_eq!(
            sample_row(SourceValue::Null).key("id"),
            Err(RowError::MissingKey("id".into()))
        );
        assert!(matches!(
            sample_row(SourceValue::Text("x1".into())).key("id"),
            Err(RowError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_unconvertible_cell_is_a_row_error() {
        let mut source = SourceRow::new(vec![("id".into(), SourceValue::Int(1))]);
        source.push("sale_year", SourceValue::Text("двадцать".into()));
        let err = SinkRow::from_source(&source, &Normalizer::default(), "id").unwrap_err();
        assert!(matches!(err, RowError::Coercion { ref column, .. } if column == "sale_year"));
    }

    #[test]
    fn test_coerce_rules() {
        let date_col = SinkColumn { name: "sale_date", kind: ColumnKind::Date };
        let int_col = SinkColumn { name: "sale_year", kind: ColumnKind::Int };
        assert_eq!(coerce(SinkValue::Date(epoch_date()), &date_col), Ok(SinkValue::Date(epoch_date())));
        assert!(coerce(SinkValue::Int(3), &date_col).is_err());
        assert_eq!(coerce(SinkValue::Float(2024.0), &int_col), Ok(SinkValue::Int(2024)));
        assert!(coerce(SinkValue::Float(2024.5), &int_col).is_err());
        assert_eq!(coerce(SinkValue::Text(String::new()), &int_col), Ok(SinkValue::Int(0)));
    }

    #[test]
    fn test_set_replaces_value() {
        let mut row = SinkRow::from_source(&sample_row(SourceValue::Int(1)), &Normalizer::default(), "id").unwrap();
        assert!(row.set("brand", SinkValue::Text("X".into())));
        assert_eq!(row.get("brand"), Some(&SinkValue::Text("X".into())));
        assert!(!row.set("no_such_column", SinkValue::Int(0)));
    }
}

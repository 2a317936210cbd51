//! Transform pipeline
//!
//! Turns loosely-typed source records into typed rows for one destination table: record keys
//! are normalized, each planned column is coerced by its class, fallbacks fill absent values,
//! and the table's validator decides whether the row is forwarded or rejected.

pub mod coerce;
pub mod normalize;

use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::planner::ColumnPlan;
use crate::schema::{ColumnClass, ColumnDef, ColumnValue, Fallback, RowValidator, RowView, TableKind};
use crate::source::RawRecord;

pub use normalize::normalize_key;

/// Result of transforming one record
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    Row(Vec<ColumnValue>),
    Rejected { reason: String },
}

#[derive(Debug)]
struct Binding {
    source_key: Option<String>,
    def: &'static ColumnDef,
}

pub struct TransformPipeline {
    table: TableKind,
    bindings: Vec<Binding>,
    columns: Vec<&'static str>,
    validator: RowValidator,
    parent_index: Option<usize>,
    ordinals: HashMap<i64, u32>,
}

impl TransformPipeline {
    /// Bind a plan to the table's column catalogue.
    ///
    /// Columns with a fallback that the plan does not target are appended so they are still
    /// loaded.
    pub fn new(table: TableKind, plan: &ColumnPlan) -> Self {
        let mut bindings: Vec<Binding> = plan
            .items()
            .iter()
            .filter_map(|item| match table.column(&item.column) {
                Some(def) => Some(Binding {
                    source_key: Some(item.source_key.clone()),
                    def,
                }),
                None => {
                    warn!(table = %table, column = %item.column, "Planned column not in table, skipping");
                    None
                },
            })
            .collect();

        for def in table.columns() {
            if def.fallback != Fallback::None && !plan.targets(def.name) {
                bindings.push(Binding {
                    source_key: None,
                    def,
                });
            }
        }

        let columns: Vec<&'static str> = bindings.iter().map(|b| b.def.name).collect();
        let parent_index = table
            .parent_key()
            .and_then(|key| columns.iter().position(|c| *c == key));

        Self {
            table,
            bindings,
            columns,
            validator: table.validator(),
            parent_index,
            ordinals: HashMap::new(),
        }
    }

    pub fn table(&self) -> TableKind {
        self.table
    }

    /// Destination columns, in the order values are produced
    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn apply(&mut self, record: &RawRecord) -> Transformed {
        let fields: HashMap<String, &Value> = record
            .iter()
            .map(|(key, value)| (normalize_key(key), value))
            .collect();

        let raw: Vec<Option<&Value>> = self
            .bindings
            .iter()
            .map(|b| {
                b.source_key
                    .as_ref()
                    .and_then(|key| fields.get(key).copied())
                    .filter(|value| !is_blank(value))
            })
            .collect();

        let mut values: Vec<ColumnValue> = self
            .bindings
            .iter()
            .zip(&raw)
            .map(|(binding, raw)| convert(binding.def, *raw))
            .collect();

        let ordinal = self.next_parent_ordinal(&values);
        for ((binding, raw), value) in self.bindings.iter().zip(&raw).zip(values.iter_mut()) {
            if raw.is_some() {
                continue;
            }
            match binding.def.fallback {
                Fallback::Default(default) => *value = ColumnValue::Integer(default),
                Fallback::ParentOrdinal => {
                    if let Some(ordinal) = ordinal {
                        *value = ColumnValue::Integer(i64::from(ordinal));
                    }
                },
                Fallback::None => {},
            }
        }

        match (self.validator)(&RowView::new(&self.columns, &values)) {
            Ok(()) => Transformed::Row(values),
            Err(reason) => Transformed::Rejected { reason },
        }
    }

    fn next_parent_ordinal(&mut self, values: &[ColumnValue]) -> Option<u32> {
        let index = self.parent_index?;
        match values.get(index) {
            Some(ColumnValue::Integer(parent)) => {
                let counter = self.ordinals.entry(*parent).or_insert(0);
                *counter += 1;
                Some(*counter)
            },
            _ => None,
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn convert(def: &ColumnDef, raw: Option<&Value>) -> ColumnValue {
    let value = match def.class {
        ColumnClass::Status => {
            return ColumnValue::Integer(raw.map_or(1, coerce::status_from_value));
        },
        _ => match raw {
            Some(value) => value,
            None => return ColumnValue::Null,
        },
    };

    let converted = match def.class {
        ColumnClass::Integer => coerce::integer_from_value(value).map(ColumnValue::Integer),
        ColumnClass::Decimal => coerce::decimal_from_value(value).map(ColumnValue::Decimal),
        ColumnClass::Date => coerce::value_text(value)
            .and_then(|s| coerce::parse_date(&s))
            .map(ColumnValue::Date),
        ColumnClass::Text => coerce::value_text(value)
            .and_then(|s| coerce::clean_text(&s))
            .map(ColumnValue::Text),
        ColumnClass::Status => None,
    };
    converted.unwrap_or(ColumnValue::Null)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::planner::plan_columns;
    use crate::request::SourceMapping;
    use chrono::NaiveDate;
    use serde_json::json;

    fn record(value: serde_json::Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("test records are objects"),
        }
    }

    fn pipeline(table: TableKind, keys: &[&str]) -> TransformPipeline {
        let plan = plan_columns(keys, &table.column_names(), &SourceMapping::new());
        TransformPipeline::new(table, &plan)
    }

    #[test]
    fn test_orders_row_conversion() {
        let mut pipeline = pipeline(
            TableKind::Orders,
            &["Ordrenr", "Kundenr", "Dato", "Status", "Sum eksl. MVA", "Referanse"],
        );
        assert_eq!(
            pipeline.columns(),
            &["ordrenr", "kundenr", "ordredato", "status", "sum", "referanse", "firma_id"]
        );

        let row = pipeline.apply(&record(json!({
            "Ordrenr": "10 001",
            "Kundenr": 55,
            "Dato": "3.1.2026",
            "Status": "Lukket",
            "Sum eksl. MVA": "1.234,50",
            "Referanse": "  \"PO-77\" "
        })));

        assert_eq!(
            row,
            Transformed::Row(vec![
                ColumnValue::Integer(10001),
                ColumnValue::Integer(55),
                ColumnValue::Date(NaiveDate::from_ymd_opt(2026, 1, 3).unwrap()),
                ColumnValue::Integer(0),
                ColumnValue::Decimal(1234.5),
                ColumnValue::Text("PO-77".into()),
                ColumnValue::Integer(1),
            ])
        );
    }

    #[test]
    fn test_missing_required_column_rejects() {
        let mut pipeline = pipeline(TableKind::Orders, &["ordrenr", "kundenr"]);
        let outcome = pipeline.apply(&record(json!({ "ordrenr": "", "kundenr": "4" })));
        assert_eq!(
            outcome,
            Transformed::Rejected {
                reason: "missing ordrenr".into()
            }
        );
    }

    #[test]
    fn test_line_numbers_fall_back_to_ordinal_within_order() {
        let mut pipeline = pipeline(TableKind::OrderLines, &["ordrenr", "varekode"]);
        let mut line_numbers = Vec::new();
        for (order, sku) in [(1, "A"), (1, "B"), (2, "C"), (1, "D")] {
            match pipeline.apply(&record(json!({ "ordrenr": order, "varekode": sku }))) {
                Transformed::Row(values) => {
                    let index = pipeline.columns().iter().position(|c| *c == "linjenr").unwrap();
                    line_numbers.push(values[index].clone());
                },
                Transformed::Rejected { reason } => panic!("unexpected rejection: {reason}"),
            }
        }
        assert_eq!(
            line_numbers,
            vec![
                ColumnValue::Integer(1),
                ColumnValue::Integer(2),
                ColumnValue::Integer(1),
                ColumnValue::Integer(3),
            ]
        );
    }

    #[test]
    fn test_order_line_rejection_reasons() {
        let mut pipeline = pipeline(TableKind::OrderLines, &["ordrenr", "linjenr", "varekode"]);

        let missing_both = pipeline.apply(&record(json!({ "varekode": "A-1" })));
        assert_eq!(
            missing_both,
            Transformed::Rejected {
                reason: "missing linjenr".into()
            }
        );

        let missing_order = pipeline.apply(&record(json!({ "linjenr": 2, "varekode": "A-1" })));
        assert_eq!(
            missing_order,
            Transformed::Rejected {
                reason: "missing ordrenr".into()
            }
        );
    }

    #[test]
    fn test_explicit_line_number_wins_over_ordinal() {
        let mut pipeline = pipeline(TableKind::OrderLines, &["ordrenr", "linjenr"]);
        let row = pipeline.apply(&record(json!({ "ordrenr": 9, "linjenr": "40" })));
        assert_eq!(
            row,
            Transformed::Row(vec![
                ColumnValue::Integer(9),
                ColumnValue::Integer(40),
                ColumnValue::Integer(1),
            ])
        );
    }

    #[test]
    fn test_unparseable_company_is_null_not_default() {
        let mut pipeline = pipeline(TableKind::Warehouses, &["navn", "firma_id"]);
        let outcome = pipeline.apply(&record(json!({ "navn": "Hovedlager", "firma_id": "n/a" })));
        assert_eq!(
            outcome,
            Transformed::Rejected {
                reason: "missing firma_id".into()
            }
        );

        let row = pipeline.apply(&record(json!({ "navn": "Hovedlager" })));
        assert_eq!(
            row,
            Transformed::Row(vec![
                ColumnValue::Text("Hovedlager".into()),
                ColumnValue::Integer(1),
            ])
        );
    }
}

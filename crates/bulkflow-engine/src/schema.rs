//! Destination tables
//!
//! Each supported table is a [`TableKind`] variant. The variant carries its column catalogue
//! (with per-column coercion class and fallback), its required columns, the key used for
//! conflict handling and its row validator. The pipeline looks all of this up once per run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::IngestError;

/// How a raw field is coerced into a column value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Integer,
    Decimal,
    Date,
    Status,
    Text,
}

/// Value used when the source does not provide one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    None,
    /// 1-based ordinal of the record within its parent
    ParentOrdinal,
    Default(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub class: ColumnClass,
    pub fallback: Fallback,
}

const fn col(name: &'static str, class: ColumnClass) -> ColumnDef {
    ColumnDef {
        name,
        class,
        fallback: Fallback::None,
    }
}

const fn with_fallback(name: &'static str, class: ColumnClass, fallback: Fallback) -> ColumnDef {
    ColumnDef {
        name,
        class,
        fallback,
    }
}

const COMPANY_ID: ColumnDef = with_fallback("firma_id", ColumnClass::Integer, Fallback::Default(1));

const ORDER_COLUMNS: &[ColumnDef] = &[
    col("ordrenr", ColumnClass::Integer),
    col("kundenr", ColumnClass::Integer),
    COMPANY_ID,
    col("lager_id", ColumnClass::Integer),
    col("ordredato", ColumnClass::Date),
    col("leveringsdato", ColumnClass::Date),
    col("status", ColumnClass::Status),
    col("sum", ColumnClass::Decimal),
    col("mva", ColumnClass::Decimal),
    col("valuta", ColumnClass::Text),
    col("referanse", ColumnClass::Text),
    col("kommentar", ColumnClass::Text),
];

const ORDER_LINE_COLUMNS: &[ColumnDef] = &[
    col("ordrenr", ColumnClass::Integer),
    with_fallback("linjenr", ColumnClass::Integer, Fallback::ParentOrdinal),
    COMPANY_ID,
    col("varekode", ColumnClass::Text),
    col("beskrivelse", ColumnClass::Text),
    col("antall", ColumnClass::Decimal),
    col("enhetspris", ColumnClass::Decimal),
    col("rabatt", ColumnClass::Decimal),
    col("sum", ColumnClass::Decimal),
    col("mva", ColumnClass::Decimal),
];

const WAREHOUSE_COLUMNS: &[ColumnDef] = &[
    col("lager_id", ColumnClass::Integer),
    col("navn", ColumnClass::Text),
    COMPANY_ID,
    col("adresse", ColumnClass::Text),
    col("postnr", ColumnClass::Text),
    col("poststed", ColumnClass::Text),
    col("status", ColumnClass::Status),
];

const CUSTOMER_COLUMNS: &[ColumnDef] = &[
    col("kundenr", ColumnClass::Integer),
    col("navn", ColumnClass::Text),
    COMPANY_ID,
    col("orgnr", ColumnClass::Text),
    col("epost", ColumnClass::Text),
    col("telefon", ColumnClass::Text),
    col("adresse", ColumnClass::Text),
    col("status", ColumnClass::Status),
    col("opprettet", ColumnClass::Date),
];

const PRODUCT_COLUMNS: &[ColumnDef] = &[
    col("varekode", ColumnClass::Text),
    col("navn", ColumnClass::Text),
    COMPANY_ID,
    col("pris", ColumnClass::Decimal),
    col("kostpris", ColumnClass::Decimal),
    col("enhet", ColumnClass::Text),
    col("status", ColumnClass::Status),
];

/// A converted column value, ready for encoding
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Text(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

/// Read-only view of one converted row, used by the table validators
pub struct RowView<'a> {
    columns: &'a [&'static str],
    values: &'a [ColumnValue],
}

impl<'a> RowView<'a> {
    pub fn new(columns: &'a [&'static str], values: &'a [ColumnValue]) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn is_present(&self, column: &str) -> bool {
        self.get(column).is_some_and(|v| !v.is_null())
    }
}

/// Row validator: `Err` carries the rejection reason
pub type RowValidator = fn(&RowView<'_>) -> Result<(), String>;

fn require(row: &RowView<'_>, columns: &[&str]) -> Result<(), String> {
    match columns.iter().find(|c| !row.is_present(c)) {
        Some(missing) => Err(format!("missing {missing}")),
        None => Ok(()),
    }
}

fn validate_order(row: &RowView<'_>) -> Result<(), String> {
    require(row, &["ordrenr"])
}

fn validate_order_line(row: &RowView<'_>) -> Result<(), String> {
    // The line number only falls back when the order number is known, so a row missing
    // both reports the line number.
    require(row, &["linjenr", "ordrenr"])
}

fn validate_warehouse(row: &RowView<'_>) -> Result<(), String> {
    require(row, &["navn", "firma_id"])
}

fn validate_customer(row: &RowView<'_>) -> Result<(), String> {
    require(row, &["kundenr"])
}

fn validate_product(row: &RowView<'_>) -> Result<(), String> {
    require(row, &["varekode"])
}

/// Supported destination tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Orders,
    OrderLines,
    Warehouses,
    Customers,
    Products,
}

impl TableKind {
    pub const ALL: [TableKind; 5] = [
        TableKind::Orders,
        TableKind::OrderLines,
        TableKind::Warehouses,
        TableKind::Customers,
        TableKind::Products,
    ];

    /// Resolve a table name as given by a caller
    pub fn from_name(name: &str) -> Result<Self, IngestError> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "orders" | "ordrer" => Ok(TableKind::Orders),
            "order_lines" | "orderlines" | "ordrelinjer" => Ok(TableKind::OrderLines),
            "warehouses" | "lager" => Ok(TableKind::Warehouses),
            "customers" | "kunder" => Ok(TableKind::Customers),
            "products" | "varer" => Ok(TableKind::Products),
            _ => Err(IngestError::UnsupportedTable(name.to_string())),
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            TableKind::Orders => "orders",
            TableKind::OrderLines => "order_lines",
            TableKind::Warehouses => "warehouses",
            TableKind::Customers => "customers",
            TableKind::Products => "products",
        }
    }

    pub fn columns(&self) -> &'static [ColumnDef] {
        match self {
            TableKind::Orders => ORDER_COLUMNS,
            TableKind::OrderLines => ORDER_LINE_COLUMNS,
            TableKind::Warehouses => WAREHOUSE_COLUMNS,
            TableKind::Customers => CUSTOMER_COLUMNS,
            TableKind::Products => PRODUCT_COLUMNS,
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns().iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns().iter().map(|c| c.name).collect()
    }

    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Orders => &["ordrenr"],
            TableKind::OrderLines => &["linjenr", "ordrenr"],
            TableKind::Warehouses => &["navn", "firma_id"],
            TableKind::Customers => &["kundenr"],
            TableKind::Products => &["varekode"],
        }
    }

    /// Column whose value groups records for [`Fallback::ParentOrdinal`]
    pub fn parent_key(&self) -> Option<&'static str> {
        match self {
            TableKind::OrderLines => Some("ordrenr"),
            _ => None,
        }
    }

    /// Unique key of the final table
    pub fn conflict_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Orders => &["ordrenr"],
            TableKind::OrderLines => &["ordrenr", "linjenr"],
            TableKind::Warehouses => &["firma_id", "navn"],
            TableKind::Customers => &["kundenr"],
            TableKind::Products => &["varekode"],
        }
    }

    pub fn validator(&self) -> RowValidator {
        match self {
            TableKind::Orders => validate_order,
            TableKind::OrderLines => validate_order_line,
            TableKind::Warehouses => validate_warehouse,
            TableKind::Customers => validate_customer,
            TableKind::Products => validate_product,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

//! Synthetic order data for load testing the fast path
//!
//! Output is deterministic for a given set of options, and values are written the way ERP
//! exports write them (`D.M.YYYY` dates, decimal commas) so the full transform runs.
//! Order lines deliberately carry no line number; it falls back to the ordinal within the order.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{Checkpoint, RawRecord, RecordSource, SourceRecord};
use crate::error::{IngestError, Result};
use crate::request::{GeneratorOptions, SourceType};
use crate::schema::TableKind;

const STATUSES: [&str; 4] = ["ny", "aktiv", "aktiv", "lukket"];
const YIELD_EVERY: u64 = 1024;

fn unit_price_ore(order: u64, line: u32) -> u64 {
    // Prices between 10,00 and 999,99 kroner
    1_000
        + order
            .wrapping_mul(7_919)
            .wrapping_add(u64::from(line) * 104_729)
            % 99_000
}

fn quantity(order: u64, line: u32) -> u64 {
    1 + order.wrapping_add(u64::from(line)) % 9
}

fn kroner(ore: u64) -> String {
    format!("{},{:02}", ore / 100, ore % 100)
}

pub struct GeneratorSource {
    options: GeneratorOptions,
    table: TableKind,
    order: u64,
    line: u32,
    emitted: u64,
    total_records: u64,
    base_date: NaiveDate,
    cancel: CancellationToken,
}

impl GeneratorSource {
    /// Generator for `table`, which must be orders or order lines.
    ///
    /// Fails when the row count or the order numbers would overflow.
    pub fn new(
        options: &GeneratorOptions,
        table: TableKind,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let total_records = match table {
            TableKind::OrderLines => options.total_lines(),
            _ => Some(options.orders),
        };
        let Some(total_records) = total_records else {
            return Err(IngestError::Validation(format!(
                "generator.orders ({}) times generator.linesPerOrder ({}) is too large",
                options.orders, options.lines_per_order
            )));
        };
        if options.orders > 0 && options.last_order_number().is_none() {
            return Err(IngestError::Validation(format!(
                "generator order numbers starting at {} overflow after {} orders",
                options.start_order_number, options.orders
            )));
        }
        Ok(Self {
            options: options.clone(),
            table,
            order: 0,
            line: 0,
            emitted: 0,
            total_records,
            base_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap_or_default(),
            cancel,
        })
    }

    /// Rows this generator will produce in total
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    fn order_number(&self, order: u64) -> i64 {
        // In range: the last order number was checked in `new`
        i64::try_from(order)
            .ok()
            .and_then(|n| self.options.start_order_number.checked_add(n))
            .unwrap_or(i64::MAX)
    }

    fn order_record(&self, order: u64) -> RawRecord {
        let date = self
            .base_date
            .checked_add_days(Days::new(order % 365))
            .unwrap_or(self.base_date);
        let total: u64 = (1..=self.options.lines_per_order)
            .map(|line| unit_price_ore(order, line) * quantity(order, line))
            .sum();
        to_record(json!({
            "ordrenr": self.order_number(order),
            "kundenr": 10_000 + order.wrapping_mul(37) % 5_000,
            "firma_id": self.options.company_id,
            "lager_id": 1 + order % 3,
            "ordredato": date.format("%-d.%-m.%Y").to_string(),
            "status": STATUSES[(order % STATUSES.len() as u64) as usize],
            "sum": kroner(total),
            "valuta": "NOK",
        }))
    }

    fn line_record(&self, order: u64, line: u32) -> RawRecord {
        let price = unit_price_ore(order, line);
        let qty = quantity(order, line);
        to_record(json!({
            "ordrenr": self.order_number(order),
            "firma_id": self.options.company_id,
            "varekode": format!(
                "V-{:05}",
                order.wrapping_mul(31).wrapping_add(u64::from(line) * 17) % 10_000
            ),
            "beskrivelse": format!("Vare {line} på ordre {}", self.order_number(order)),
            "antall": qty,
            "enhetspris": kroner(price),
            "sum": kroner(price * qty),
        }))
    }

    fn next_raw(&mut self) -> Option<RawRecord> {
        if self.order >= self.options.orders {
            return None;
        }
        match self.table {
            TableKind::OrderLines => {
                if self.options.lines_per_order == 0 {
                    return None;
                }
                self.line += 1;
                let record = self.line_record(self.order, self.line);
                if self.line >= self.options.lines_per_order {
                    self.line = 0;
                    self.order += 1;
                }
                Some(record)
            },
            _ => {
                let record = self.order_record(self.order);
                self.order += 1;
                Some(record)
            },
        }
    }
}

fn to_record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        _ => RawRecord::new(),
    }
}

#[async_trait]
impl RecordSource for GeneratorSource {
    fn source_type(&self) -> SourceType {
        SourceType::Generator
    }

    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Aborted);
        }
        if self.emitted > 0 && self.emitted % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        let Some(record) = self.next_raw() else {
            return Ok(None);
        };
        self.emitted += 1;
        Ok(Some(SourceRecord {
            record,
            checkpoint: Checkpoint::Ordinal {
                records: self.emitted,
            },
        }))
    }
}

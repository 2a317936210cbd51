//! Column planning
//!
//! The plan decides once per run which source key feeds which destination column. Explicit
//! overrides are applied first, then every remaining source key is resolved through the alias
//! table or taken as-is. A column is never targeted twice and every planned column exists in
//! the destination table.

use serde::Serialize;
use std::collections::HashSet;

use crate::request::SourceMapping;
use crate::transform::normalize_key;

/// Known header spellings from ERP exports, keyed by normalized header
pub const HEADER_ALIASES: &[(&str, &str)] = &[
    ("ordre", "ordrenr"),
    ("ordrenummer", "ordrenr"),
    ("ordre nr", "ordrenr"),
    ("ordre nr.", "ordrenr"),
    ("order number", "ordrenr"),
    ("linje", "linjenr"),
    ("linjenummer", "linjenr"),
    ("line", "linjenr"),
    ("kunde", "kundenr"),
    ("kundenummer", "kundenr"),
    ("customer number", "kundenr"),
    ("vare", "varekode"),
    ("varenr", "varekode"),
    ("varenummer", "varekode"),
    ("artikkelnr", "varekode"),
    ("sku", "varekode"),
    ("sum eksl. mva", "sum"),
    ("sum eks. mva", "sum"),
    ("beløp", "sum"),
    ("total", "sum"),
    ("dato", "ordredato"),
    ("ordre dato", "ordredato"),
    ("order date", "ordredato"),
    ("lager", "lager_id"),
    ("lagernr", "lager_id"),
    ("firma", "firma_id"),
    ("firmaid", "firma_id"),
    ("company id", "firma_id"),
    ("pris eksl. mva", "enhetspris"),
    ("enhetspris eksl. mva", "enhetspris"),
    ("stk", "antall"),
    ("qty", "antall"),
    ("e-post", "epost"),
    ("email", "epost"),
    ("org.nr", "orgnr"),
    ("organisasjonsnummer", "orgnr"),
];

/// Resolve a normalized key through the alias table
pub fn alias_for(normalized_key: &str) -> Option<&'static str> {
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized_key)
        .map(|(_, column)| *column)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnPlanItem {
    /// Normalized source key
    pub source_key: String,
    pub column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnPlan {
    items: Vec<ColumnPlanItem>,
}

impl ColumnPlan {
    pub fn items(&self) -> &[ColumnPlanItem] {
        &self.items
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.column.as_str())
    }

    pub fn targets(&self, column: &str) -> bool {
        self.items.iter().any(|item| item.column == column)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Build the source-to-column plan.
///
/// `source_keys` are the headers or first-record keys as observed; they are normalized here.
/// Override entries naming a key the source does not have are skipped.
pub fn plan_columns<S: AsRef<str>>(
    source_keys: &[S],
    valid_columns: &[&str],
    overrides: &SourceMapping,
) -> ColumnPlan {
    let keys: Vec<String> = source_keys
        .iter()
        .map(|k| normalize_key(k.as_ref()))
        .collect();
    let valid: HashSet<&str> = valid_columns.iter().copied().collect();
    let mut used_columns: HashSet<String> = HashSet::new();
    let mut consumed_keys: HashSet<String> = HashSet::new();
    let mut items = Vec::new();

    for (source_key, column) in overrides.iter() {
        let key = normalize_key(source_key);
        let column = normalize_key(column);
        if !keys.contains(&key) || !valid.contains(column.as_str()) {
            continue;
        }
        if used_columns.insert(column.clone()) {
            consumed_keys.insert(key.clone());
            items.push(ColumnPlanItem {
                source_key: key,
                column,
            });
        }
    }

    for key in keys {
        if consumed_keys.contains(&key) {
            continue;
        }
        let column = alias_for(&key)
            .map(str::to_string)
            .unwrap_or_else(|| key.clone());
        if !valid.contains(column.as_str()) || used_columns.contains(&column) {
            continue;
        }
        used_columns.insert(column.clone());
        consumed_keys.insert(key.clone());
        items.push(ColumnPlanItem {
            source_key: key,
            column,
        });
    }

    ColumnPlan { items }
}

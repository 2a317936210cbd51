//! Locale-tolerant coercions for raw field values
//!
//! Inputs come from Norwegian ERP exports as often as from clean APIs, so numbers may use
//! `,` as decimal separator and `.` or spaces for grouping, and dates may be `D.M.YYYY`.

use chrono::NaiveDate;
use serde_json::Value;

use super::normalize::strip_quotes;

/// Textual form of a raw value, `None` for null
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Integer from a raw string: every non-digit is dropped, a leading minus is kept.
pub fn parse_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('-');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let magnitude: i64 = digits.parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub fn integer_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        other => value_text(other).and_then(|s| parse_integer(&s)),
    }
}

/// Decimal from a raw string.
///
/// With both `,` and `.` present the one occurring last is the decimal separator and the
/// other is grouping. A lone `,` is a decimal separator. A lone `.` is a decimal point, so
/// `"1.234"` is 1.234 and not one thousand two hundred thirty-four.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let normalized = match (compact.rfind(','), compact.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(_), None) => compact.replace(',', "."),
        _ => compact,
    };
    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

pub fn decimal_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        other => value_text(other).and_then(|s| parse_decimal(&s)),
    }
}

/// Date from `YYYY-MM-DD` or `D.M.YYYY`; anything else, or an impossible date, is `None`
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(date) = parse_iso_date(raw) {
        return Some(date);
    }
    let mut parts = raw.split('.');
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some()
        || !(1..=2).contains(&day.len())
        || !(1..=2).contains(&month.len())
        || year.len() != 4
    {
        return None;
    }
    NaiveDate::from_ymd_opt(number(year)?, number(month)?, number(day)?)
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let bytes = raw.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    NaiveDate::from_ymd_opt(
        number(&raw[0..4])?,
        number(&raw[5..7])?,
        number(&raw[8..10])?,
    )
}

fn number<T: std::str::FromStr>(digits: &str) -> Option<T> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

const ACTIVE_WORDS: &[&str] = &["active", "aktiv", "open", "åpen", "apen", "new", "ny"];
const INACTIVE_WORDS: &[&str] = &[
    "inactive",
    "inaktiv",
    "closed",
    "lukket",
    "cancelled",
    "canceled",
    "kansellert",
];

/// Status code: known words map to 1 or 0, otherwise an integer, otherwise 1
pub fn parse_status(raw: &str) -> i64 {
    let word = raw.trim().to_lowercase();
    if ACTIVE_WORDS.contains(&word.as_str()) {
        return 1;
    }
    if INACTIVE_WORDS.contains(&word.as_str()) {
        return 0;
    }
    parse_integer(&word).unwrap_or(1)
}

pub fn status_from_value(value: &Value) -> i64 {
    match value {
        Value::Bool(active) => i64::from(*active),
        other => value_text(other).map_or(1, |s| parse_status(&s)),
    }
}

/// Trimmed, unquoted text; empty becomes `None`
pub fn clean_text(raw: &str) -> Option<String> {
    let text = strip_quotes(raw.trim()).trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

//! Field-name and text normalization

/// Normalize a field name: trim, lowercase, collapse inner whitespace to single spaces.
///
/// A leading byte-order mark (common in spreadsheet exports) is dropped.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim_start_matches('\u{feff}');
    let mut out = String::with_capacity(key.len());
    for word in key.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

/// Remove one pair of matching surrounding quotes
pub fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

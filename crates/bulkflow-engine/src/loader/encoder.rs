//! PostgreSQL `COPY ... FROM STDIN` text format
//!
//! Fields are tab-separated and rows end with `\n`. Null is `\N`. Backslash, tab, newline and
//! carriage return inside text are written as `\\`, `\t`, `\n` and `\r`.

use std::io::Write;

use crate::schema::ColumnValue;

pub const NULL_MARKER: &[u8] = b"\\N";

fn escape_into(text: &str, out: &mut Vec<u8>) {
    for byte in text.bytes() {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            other => out.push(other),
        }
    }
}

/// Append one encoded row to `out`
pub fn encode_row(values: &[ColumnValue], out: &mut Vec<u8>) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        // Writing into a Vec cannot fail
        let _ = match value {
            ColumnValue::Null => out.write_all(NULL_MARKER),
            ColumnValue::Integer(n) => write!(out, "{n}"),
            ColumnValue::Decimal(f) => write!(out, "{f}"),
            ColumnValue::Date(d) => write!(out, "{}", d.format("%Y-%m-%d")),
            ColumnValue::Text(s) => {
                escape_into(s, out);
                Ok(())
            },
        };
    }
    out.push(b'\n');
}

/// Parse one encoded row (without its terminating newline) back into fields.
///
/// Used by the in-memory sink and tests; `None` stands for null.
pub fn decode_row(line: &str) -> Vec<Option<String>> {
    line.split('\t')
        .map(|field| {
            if field == "\\N" {
                return None;
            }
            let mut out = String::with_capacity(field.len());
            let mut chars = field.chars();
            while let Some(c) = chars.next() {
                if c != '\\' {
                    out.push(c);
                    continue;
                }
                match chars.next() {
                    Some('t') => out.push('\t'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                }
            }
            Some(out)
        })
        .collect()
}

/// Split an encoded chunk into decoded rows
pub fn decode_chunk(chunk: &[u8]) -> Vec<Vec<Option<String>>> {
    String::from_utf8_lossy(chunk)
        .split_terminator('\n')
        .map(decode_row)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_encode_row_bit_exact() {
        let mut out = Vec::new();
        encode_row(
            &[
                ColumnValue::Integer(-42),
                ColumnValue::Decimal(1234.5),
                ColumnValue::Date(NaiveDate::from_ymd_opt(2026, 1, 3).unwrap()),
                ColumnValue::Null,
                ColumnValue::Text("a\tb\nc\\d\re".into()),
            ],
            &mut out,
        );
        assert_eq!(
            out,
            b"-42\t1234.5\t2026-01-03\t\\N\ta\\tb\\nc\\\\d\\re\n".to_vec()
        );
    }

    #[test]
    fn test_decimal_rendering_is_shortest_round_trip() {
        let mut out = Vec::new();
        encode_row(&[ColumnValue::Decimal(0.1), ColumnValue::Decimal(100.0)], &mut out);
        assert_eq!(out, b"0.1\t100\n".to_vec());
    }

    #[test]
    fn test_text_that_looks_like_null_is_escaped() {
        let mut out = Vec::new();
        encode_row(&[ColumnValue::Text("\\N".into())], &mut out);
        assert_eq!(out, b"\\\\N\n".to_vec());
        assert_eq!(decode_chunk(&out), vec![vec![Some("\\N".to_string())]]);
    }

    #[test]
    fn test_decode_chunk() {
        let mut out = Vec::new();
        encode_row(&[ColumnValue::Integer(1), ColumnValue::Text("x\ty".into())], &mut out);
        encode_row(&[ColumnValue::Null, ColumnValue::Text(String::new())], &mut out);
        assert_eq!(
            decode_chunk(&out),
            vec![
                vec![Some("1".to_string()), Some("x\ty".to_string())],
                vec![None, Some(String::new())],
            ]
        );
    }
}

//! Minimal CSV tokenizer for the bench logs and the reference catalog
//!
//! Splits one line at a time without allocating. Fields are trimmed, a
//! leading UTF-8 BOM is dropped, empty fields are kept (`a,,b` is three
//! fields), and a field wrapped in double quotes may contain commas. A
//! doubled quote inside a quoted field is left as-is; none of the files
//! this crate reads use it.

const BOM: char = '\u{FEFF}';

/// Split `line` into fields.
///
/// ```
/// use flashbench::csv::split;
///
/// let fields: Vec<&str> = split("\u{FEFF} W25Q32 ,\"Winbond, Inc\",,32").collect();
/// assert_eq!(fields, ["W25Q32", "Winbond, Inc", "", "32"]);
/// ```
pub fn split(line: &str) -> Fields<'_> {
    let line = line.strip_prefix(BOM).unwrap_or(line);
    let line = line.trim_end_matches(['\r', '\n']);
    Fields { rest: Some(line) }
}

/// Split `line` into at most `N` fields; extra fields are dropped.
pub fn split_into<const N: usize>(line: &str) -> heapless::Vec<&str, N> {
    split(line).take(N).collect()
}

/// Whether `line` is a `#` comment (session markers included).
pub fn is_comment(line: &str) -> bool {
    line.trim_start_matches(BOM).trim_start().starts_with('#')
}

/// Whether `line` holds nothing but whitespace.
pub fn is_blank(line: &str) -> bool {
    line.trim_start_matches(BOM).trim().is_empty()
}

/// Iterator over the fields of one line.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    rest: Option<&'a str>,
}

impl<'a> Iterator for Fields<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest?.trim_start();
        if let Some(body) = rest.strip_prefix('"') {
            match closing_quote(body) {
                Some(end) => {
                    let field = body.get(..end).unwrap_or_default();
                    let after = body.get(end.saturating_add(1)..).unwrap_or_default();
                    self.rest = after
                        .find(',')
                        .map(|p| after.get(p.saturating_add(1)..).unwrap_or_default());
                    Some(field.trim())
                }
                None => {
                    // unterminated: the rest of the line is one field
                    self.rest = None;
                    Some(body.trim())
                }
            }
        } else {
            match rest.find(',') {
                Some(p) => {
                    self.rest = Some(rest.get(p.saturating_add(1)..).unwrap_or_default());
                    Some(rest.get(..p).unwrap_or_default().trim())
                }
                None => {
                    self.rest = None;
                    Some(rest.trim())
                }
            }
        }
    }
}

/// Byte index of the quote that closes a quoted field, skipping `""`.
fn closing_quote(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0usize;
    loop {
        match bytes.get(i)? {
            b'"' if bytes.get(i.saturating_add(1)) == Some(&b'"') => i = i.saturating_add(2),
            b'"' => return Some(i),
            _ => i = i.saturating_add(1),
        }
    }
}

/// Index of the first header field matching any of `aliases`
/// (case-insensitive). Earlier aliases win.
pub fn find_column(header: &[&str], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| header.iter().position(|h| h.eq_ignore_ascii_case(alias)))
}

/// Numeric field, `0.0` when empty or malformed.
pub fn number(field: &str) -> f64 {
    field.trim().parse().unwrap_or(0.0)
}

/// Unsigned field, `0` when empty or malformed. Accepts a decimal point
/// (`12000000.0`) by truncating.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped below
pub fn unsigned(field: &str) -> u32 {
    let field = field.trim();
    field.parse().unwrap_or_else(|_| {
        let v = number(field);
        if v.is_finite() && v > 0.0 {
            v.min(f64::from(u32::MAX)) as u32
        } else {
            0
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;

    fn fields(line: &str) -> Vec<&str> {
        split(line).collect()
    }

    #[test]
    fn trims_and_keeps_empty_fields() {
        assert_eq!(fields(" a , b ,, c \r\n"), ["a", "b", "", "c"]);
        assert_eq!(fields(""), [""]);
        assert_eq!(fields("a,"), ["a", ""]);
    }

    #[test]
    fn quoted_fields_hold_commas() {
        assert_eq!(
            fields(r#"W25Q64JV,"Winbond, Electronics" ,NOR,64"#),
            ["W25Q64JV", "Winbond, Electronics", "NOR", "64"]
        );
        assert_eq!(fields(r#""a""b",c"#), [r#"a""b"#, "c"]);
        assert_eq!(fields(r#"x,"open"#), ["x", "open"]);
    }

    #[test]
    fn bom_only_at_line_start() {
        assert_eq!(fields("\u{FEFF}spi_hz,hz"), ["spi_hz", "hz"]);
        assert!(is_comment("\u{FEFF}# SESSION_START 5"));
        assert!(is_blank("\u{FEFF}  \r\n"));
        assert!(!is_comment("run,op"));
    }

    #[test]
    fn column_aliases() {
        let header = ["timestamp_ms", "JEDEC_HEX", "Hz", "avg_erase_ms"];
        assert_eq!(find_column(&header, &["spi_hz", "hz"]), Some(2));
        assert_eq!(find_column(&header, &["jedec_hex", "jedec"]), Some(1));
        assert_eq!(find_column(&header, &["verify_errors"]), None);
    }

    #[test]
    fn numbers_default_to_zero() {
        assert_eq!(number("45.5"), 45.5);
        assert_eq!(number(""), 0.0);
        assert_eq!(number("n/a"), 0.0);
        assert_eq!(unsigned("12000000"), 12_000_000);
        assert_eq!(unsigned("12000000.0"), 12_000_000);
        assert_eq!(unsigned("-3"), 0);
    }

    #[test]
    fn split_into_caps_field_count() {
        let v = split_into::<3>("1,2,3,4,5");
        assert_eq!(v.as_slice(), &["1", "2", "3"]);
    }
}

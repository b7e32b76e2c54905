//! Raw values and rows as read from the legacy source database.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single column value from a source row.
///
/// Values keep the loosest shape the legacy schema allows; typed extraction
/// happens in the per-entity source records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Bytes(Vec<u8>),
}

static NULL: SourceValue = SourceValue::Null;

impl SourceValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }

    /// Interpret the value as an integer code.
    ///
    /// Legacy tables store codes as INT, TINYINT, CHAR or VARCHAR depending
    /// on the table, so numeric text is accepted too.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SourceValue::Int(v) => Some(*v),
            SourceValue::Bool(b) => Some(i64::from(*b)),
            SourceValue::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            SourceValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as trimmed text. Empty strings become `None`.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            SourceValue::Null => return None,
            SourceValue::Text(s) => s.trim().to_string(),
            SourceValue::Bytes(b) => String::from_utf8_lossy(b).trim().to_string(),
            other => other.to_string(),
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Interpret the value as a flag (`1`, `true`, `y`, `yes`, `aktif`).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SourceValue::Bool(b) => Some(*b),
            SourceValue::Int(v) => Some(*v != 0),
            SourceValue::Text(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "y" | "yes" | "aktif" | "active" => Some(true),
                "0" | "false" | "n" | "no" | "nonaktif" | "inactive" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Interpret the value as a calendar date.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            SourceValue::Date(d) => Some(*d),
            SourceValue::DateTime(dt) => Some(dt.date()),
            SourceValue::Text(s) => parse_date(s.trim()),
            _ => None,
        }
    }

    /// Interpret the value as a timestamp.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SourceValue::DateTime(dt) => Some(*dt),
            SourceValue::Date(d) => d.and_hms_opt(0, 0, 0),
            SourceValue::Text(s) => {
                let s = s.trim();
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok())
                    .or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
            }
            _ => None,
        }
    }
}

/// Parse the date layouts found in legacy data entry columns.
fn parse_date(s: &str) -> Option<NaiveDate> {
    // MySQL zero dates are placeholders, not dates
    if s.is_empty() || s.starts_with("0000-00-00") {
        return None;
    }
    ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceValue::Null => write!(f, "NULL"),
            SourceValue::Bool(b) => write!(f, "{}", b),
            SourceValue::Int(v) => write!(f, "{}", v),
            SourceValue::Float(v) => write!(f, "{}", v),
            SourceValue::Text(s) => write!(f, "{}", s),
            SourceValue::Date(d) => write!(f, "{}", d),
            SourceValue::DateTime(dt) => write!(f, "{}", dt),
            SourceValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for SourceValue {
    fn from(v: bool) -> Self {
        SourceValue::Bool(v)
    }
}

impl From<i64> for SourceValue {
    fn from(v: i64) -> Self {
        SourceValue::Int(v)
    }
}

impl From<i32> for SourceValue {
    fn from(v: i32) -> Self {
        SourceValue::Int(i64::from(v))
    }
}

impl From<f64> for SourceValue {
    fn from(v: f64) -> Self {
        SourceValue::Float(v)
    }
}

impl From<&str> for SourceValue {
    fn from(v: &str) -> Self {
        SourceValue::Text(v.to_string())
    }
}

impl From<String> for SourceValue {
    fn from(v: String) -> Self {
        SourceValue::Text(v)
    }
}

impl From<NaiveDate> for SourceValue {
    fn from(v: NaiveDate) -> Self {
        SourceValue::Date(v)
    }
}

impl From<NaiveDateTime> for SourceValue {
    fn from(v: NaiveDateTime) -> Self {
        SourceValue::DateTime(v)
    }
}

impl<T: Into<SourceValue>> From<Option<T>> for SourceValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SourceValue::Null)
    }
}

/// One row read from a source table: column name to raw value.
///
/// Column lookups are case-insensitive because legacy schemas mix
/// `NIK`, `nik` and `Nik` across tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    columns: BTreeMap<String, SourceValue>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for tests and in-memory sources.
    pub fn with(mut self, column: &str, value: impl Into<SourceValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<SourceValue>) {
        self.columns.insert(column.to_lowercase(), value.into());
    }

    /// Get a column value; missing columns read as NULL.
    pub fn get(&self, column: &str) -> &SourceValue {
        self.columns
            .get(&column.to_lowercase())
            .unwrap_or(&NULL)
    }

    /// Get the first non-NULL value among alternative column names.
    pub fn get_any(&self, columns: &[&str]) -> &SourceValue {
        columns
            .iter()
            .map(|c| self.get(c))
            .find(|v| !v.is_null())
            .unwrap_or(&NULL)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).as_text()
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).as_i64()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &SourceValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_text_reads_as_code() {
        assert_eq!(SourceValue::from(" 3 ").as_i64(), Some(3));
        assert_eq!(SourceValue::from("abc").as_i64(), None);
        assert_eq!(SourceValue::Null.as_i64(), None);
    }

    #[test]
    fn test_empty_text_is_none() {
        assert_eq!(SourceValue::from("   ").as_text(), None);
        assert_eq!(SourceValue::from(" Budi ").as_text(), Some("Budi".to_string()));
        assert_eq!(SourceValue::Int(42).as_text(), Some("42".to_string()));
    }

    #[test]
    fn test_zero_date_is_none() {
        assert_eq!(SourceValue::from("0000-00-00").as_date(), None);
        assert_eq!(
            SourceValue::from("17-08-1990").as_date(),
            NaiveDate::from_ymd_opt(1990, 8, 17)
        );
    }

    #[test]
    fn test_datetime_from_text() {
        let dt = SourceValue::from("2020-01-02 03:04:05").as_datetime().unwrap();
        assert_eq!(dt.to_string(), "2020-01-02 03:04:05");
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = SourceRow::new().with("NIK", "3201010101010001");
        assert_eq!(row.text("nik").as_deref(), Some("3201010101010001"));
        assert!(row.get("missing").is_null());
    }

    #[test]
    fn test_get_any_prefers_first_present() {
        let row = SourceRow::new().with("nama", "Siti").with("name", SourceValue::Null);
        assert_eq!(row.get_any(&["name", "nama"]).as_text().as_deref(), Some("Siti"));
    }
}

//! Column values.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Storage class of a column as reported by the engine.
///
/// The discriminants match the engine's fundamental datatype codes so the
/// binding layer can convert without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Integer = 1,
    Float = 2,
    Text = 3,
    Blob = 4,
    Null = 5,
}

impl ColumnType {
    /// Convert a native datatype code. Unknown codes read as `Null`.
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => ColumnType::Integer,
            2 => ColumnType::Float,
            3 => ColumnType::Text,
            4 => ColumnType::Blob,
            _ => ColumnType::Null,
        }
    }

    /// The native datatype code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// SQL name of the storage class.
    pub const fn name(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Null => "NULL",
        }
    }
}

/// A single column value.
///
/// The variant is the type tag; the binder dispatches on it and the
/// extractor constructs it from the engine's reported column type. Reading
/// through a mismatched accessor coerces the way the engine's own column
/// getters do.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// 64-bit signed integer
    Integer(i64),
    /// IEEE-754 double
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Byte sequence
    Blob(Vec<u8>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The storage class of this value.
    pub const fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Integer(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
            Value::Blob(_) => ColumnType::Blob,
        }
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        self.column_type().name()
    }

    /// Read as a 64-bit integer.
    ///
    /// Floats truncate toward zero, text and blobs parse their leading
    /// numeric prefix, and NULL reads as 0.
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Text(s) => parse_integer_prefix(s),
            Value::Blob(b) => parse_integer_prefix(&String::from_utf8_lossy(b)),
        }
    }

    /// Read as a 32-bit integer. Wraps on overflow.
    pub fn as_i32(&self) -> i32 {
        self.as_i64() as i32
    }

    /// Read as a 16-bit integer. Wraps on overflow.
    pub fn as_i16(&self) -> i16 {
        self.as_i64() as i16
    }

    /// Read as an 8-bit integer. Wraps on overflow.
    pub fn as_i8(&self) -> i8 {
        self.as_i64() as i8
    }

    /// Read as a boolean (`true` when the integer reading is positive).
    pub fn as_bool(&self) -> bool {
        self.as_i64() > 0
    }

    /// Read as a double.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Integer(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Text(s) => parse_float_prefix(s),
            Value::Blob(b) => parse_float_prefix(&String::from_utf8_lossy(b)),
        }
    }

    /// Read as a single-precision float.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_f32(&self) -> f32 {
        self.as_f64() as f32
    }

    /// Borrow the text of a `Text` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read as text. NULL reads as an empty string.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            Value::Null => Cow::Borrowed(""),
            Value::Integer(v) => Cow::Owned(v.to_string()),
            Value::Float(v) => Cow::Owned(format_float(*v)),
            Value::Text(s) => Cow::Borrowed(s),
            Value::Blob(b) => String::from_utf8_lossy(b),
        }
    }

    /// Read as bytes. NULL reads as an empty slice.
    pub fn to_blob(&self) -> Cow<'_, [u8]> {
        match self {
            Value::Null => Cow::Borrowed(&[]),
            Value::Blob(b) => Cow::Borrowed(b),
            Value::Text(s) => Cow::Borrowed(s.as_bytes()),
            Value::Integer(_) | Value::Float(_) => match self.to_text() {
                Cow::Owned(s) => Cow::Owned(s.into_bytes()),
                Cow::Borrowed(s) => Cow::Owned(s.as_bytes().to_vec()),
            },
        }
    }
}

/// Parse the leading integer of a string the way the engine's text to
/// integer conversion does: surrounding whitespace is ignored, a numeric
/// prefix is honored and anything unparseable reads as 0.
fn parse_integer_prefix(s: &str) -> i64 {
    let trimmed = s.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return v;
    }
    let float = parse_float_prefix(trimmed);
    if float.is_finite() { float as i64 } else { 0 }
}

fn parse_float_prefix(s: &str) -> f64 {
    let trimmed = s.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return v;
    }
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end];
        match c {
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    while end > 0 {
        if let Ok(v) = trimmed[..end].parse::<f64>() {
            return v;
        }
        end -= 1;
    }
    0.0
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{}", format_float(*v)),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Blob(b) => write!(f, "[BLOB: {} bytes]", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Build a parameter slice from heterogeneous values.
///
/// Usage: `params![1_i64, "text", 3.5, None::<i64>]`
#[macro_export]
macro_rules! params {
    ($($val:expr),* $(,)?) => {
        &[$($crate::Value::from($val)),*][..]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_codes() {
        for ty in [
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Text,
            ColumnType::Blob,
            ColumnType::Null,
        ] {
            assert_eq!(ColumnType::from_code(ty.code()), ty);
        }
        assert_eq!(ColumnType::from_code(42), ColumnType::Null);
    }

    #[test]
    fn test_float_reads_as_truncated_integer() {
        assert_eq!(Value::Float(3.99).as_i64(), 3);
        assert_eq!(Value::Float(-3.99).as_i64(), -3);
    }

    #[test]
    fn test_narrowing_wraps() {
        let v = Value::Integer(i64::from(i32::MAX) + 1);
        assert_eq!(v.as_i32(), i32::MIN);
        assert_eq!(Value::Integer(300).as_i8(), 44);
        assert_eq!(Value::Integer(65_537).as_i16(), 1);
    }

    #[test]
    fn test_text_coercion() {
        assert_eq!(Value::Text("  42 ".into()).as_i64(), 42);
        assert_eq!(Value::Text("12abc".into()).as_i64(), 12);
        assert_eq!(Value::Text("abc".into()).as_i64(), 0);
        assert!((Value::Text("2.5e1xyz".into()).as_f64() - 25.0).abs() < f64::EPSILON);
        assert_eq!(Value::Integer(7).to_text(), "7");
        assert_eq!(Value::Null.to_text(), "");
    }

    #[test]
    fn test_bool_reading() {
        assert!(Value::Integer(1).as_bool());
        assert!(!Value::Integer(0).as_bool());
        assert!(!Value::Integer(-1).as_bool());
        assert_eq!(Value::from(true), Value::Integer(1));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_params_macro() {
        let p = params![1_i64, "a", 2.5, vec![0_u8, 255]];
        assert_eq!(p.len(), 4);
        assert_eq!(p[1], Value::Text("a".into()));
        assert_eq!(p[3], Value::Blob(vec![0, 255]));
    }

    #[test]
    fn test_display_escapes_quotes() {
        assert_eq!(Value::Text("a'b".into()).to_string(), "'a''b'");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
    }
}

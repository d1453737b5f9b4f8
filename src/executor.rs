//! Driver-neutral values, rows and result cursors.

use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

use crate::driver;
use crate::error::{DbError, Result};

/// A nullable scalar passed to or read from a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text view of the value, if it has one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column values of one row. Inline for rows with up to 16 columns.
pub type RowValues = SmallVec<[Value; 16]>;

// ============================================================================
// Typed extraction
// ============================================================================

/// Conversion from a row value into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Err(DbError::TypeError("unexpected NULL for String".to_string())),
            Value::Bytes(b) => String::from_utf8(b.clone())
                .map_err(|e| DbError::TypeError(format!("invalid UTF-8: {}", e))),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Null => Err(DbError::TypeError("unexpected NULL for i64".to_string())),
            other => {
                let text = other
                    .as_str()
                    .ok_or_else(|| DbError::TypeError(format!("cannot read {:?} as i64", other)))?;
                text.trim()
                    .parse()
                    .map_err(|_| DbError::TypeError(format!("invalid integer: {:?}", text)))
            }
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Null => Err(DbError::TypeError("unexpected NULL for bool".to_string())),
            other => match other.as_str() {
                Some("t") | Some("true") => Ok(true),
                Some("f") | Some("false") => Ok(false),
                _ => Err(DbError::TypeError(format!("invalid boolean: {:?}", other))),
            },
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Addresses a column by position or by name.
pub trait ColumnIndex {
    fn position(&self, columns: &[String]) -> Option<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &[String]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }
}

impl ColumnIndex for &str {
    fn position(&self, columns: &[String]) -> Option<usize> {
        columns.iter().position(|c| c == self)
    }
}

/// One result row with named columns.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<[String]>,
    values: RowValues,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: RowValues) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value by position or column name.
    pub fn value<I: ColumnIndex>(&self, index: I) -> Option<&Value> {
        index
            .position(&self.columns)
            .and_then(|pos| self.values.get(pos))
    }

    /// Typed value by position or column name.
    pub fn get<T: FromValue, I: ColumnIndex + fmt::Debug>(&self, index: I) -> Result<T> {
        let value = index
            .position(&self.columns)
            .and_then(|pos| self.values.get(pos))
            .ok_or_else(|| DbError::TypeError(format!("no such column: {:?}", index)))?;
        T::from_value(value)
    }
}

/// Forward-only cursor over a query result.
pub struct Rows {
    columns: Arc<[String]>,
    inner: Box<dyn driver::Rows>,
}

impl Rows {
    pub fn new(inner: Box<dyn driver::Rows>) -> Self {
        let columns: Arc<[String]> = inner.columns().into();
        Self { columns, inner }
    }

    /// Column names in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.inner
            .next_row()
            .map(|values| Row::new(Arc::clone(&self.columns), values))
    }
}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows").field("columns", &self.columns).finish()
    }
}

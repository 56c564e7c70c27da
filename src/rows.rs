//! Result sets.
//!
//! A [`Rows`] value is a cheaply cloneable handle over one query's result:
//! column names plus rows of raw column data. In text mode every column is
//! a UTF-8 string; in binary mode the bytes are the server's binary
//! encoding and the caller interprets them.
//!
//! Handles share their backing storage, so two clones of the same result
//! compare pointer-equal via [`Rows::ptr_eq`]. The cache relies on this:
//! a hit hands back the very same result the first miss produced.

use std::sync::Arc;

/// One column's raw value: `None` is SQL NULL.
pub type RawValue = Option<Vec<u8>>;

#[derive(Debug)]
struct RowsInner {
    names: Vec<String>,
    rows: Vec<Vec<RawValue>>,
}

/// A shared, immutable result set.
#[derive(Debug, Clone)]
pub struct Rows {
    inner: Arc<RowsInner>,
}

impl Rows {
    /// Build a result set from column names and raw row data.
    pub fn from_raw(names: Vec<String>, rows: Vec<Vec<RawValue>>) -> Self {
        Self {
            inner: Arc::new(RowsInner { names, rows }),
        }
    }

    /// An empty result set (no columns, no rows).
    pub fn empty() -> Self {
        Self::from_raw(Vec::new(), Vec::new())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    /// Column names, in result order.
    pub fn columns(&self) -> &[String] {
        &self.inner.names
    }

    /// Whether two handles share the same backing result.
    pub fn ptr_eq(a: &Rows, b: &Rows) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Row at `idx`, if present.
    pub fn get(&self, idx: usize) -> Option<Row<'_>> {
        self.inner.rows.get(idx).map(|columns| Row {
            names: &self.inner.names,
            columns,
        })
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.inner.rows.iter().map(move |columns| Row {
            names: &self.inner.names,
            columns,
        })
    }
}

/// A borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    names: &'a [String],
    columns: &'a [RawValue],
}

impl<'a> Row<'a> {
    /// Number of columns in the row.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Raw bytes of a column. `None` if the column is NULL or out of range.
    pub fn get_bytes(&self, idx: usize) -> Option<&'a [u8]> {
        self.columns.get(idx)?.as_deref()
    }

    /// Whether a column is NULL (out-of-range counts as NULL).
    pub fn is_null(&self, idx: usize) -> bool {
        self.columns.get(idx).map(|v| v.is_none()).unwrap_or(true)
    }

    /// Column value as `&str` (text mode). `None` on NULL or invalid UTF-8.
    pub fn get_str(&self, idx: usize) -> Option<&'a str> {
        std::str::from_utf8(self.get_bytes(idx)?).ok()
    }

    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        self.get_str(idx)?.parse().ok()
    }

    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        self.get_str(idx)?.parse().ok()
    }

    /// Text-mode boolean (`t`/`f` as PostgreSQL sends them).
    pub fn get_bool(&self, idx: usize) -> Option<bool> {
        match self.get_str(idx)? {
            "t" | "true" | "1" => Some(true),
            "f" | "false" | "0" => Some(false),
            _ => None,
        }
    }

    /// Index of a named column.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Column value as `&str`, looked up by column name.
    pub fn get_str_by_name(&self, name: &str) -> Option<&'a str> {
        self.get_str(self.index_of(name)?)
    }
}

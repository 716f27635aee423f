//! Lazily-realized tables.
//!
//! A [`LazyTable`] stores raw cell values column-wise ordered, with an
//! optional loader per column. Reading a cell in a loader-backed column
//! realizes the value through the loader exactly once and caches it keyed by
//! (row, column); row iteration hands out lazy views that share the same
//! cache. Merging two tables performs a standard relational join in which the
//! key columns are forced to concrete values while every other column keeps
//! its laziness.

use crate::loader::Loader;
use crate::value::{Value, ValueKind};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// Suffix pair applied to colliding non-key column names during a merge.
pub const DEFAULT_SUFFIXES: (&str, &str) = ("_x", "_y");

/// Relational join variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Outer,
}

impl std::fmt::Display for JoinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Outer => "outer",
        };
        f.write_str(name)
    }
}

/// Errors from table operations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("join key '{column}' not found in {side} table")]
    MissingKey { side: &'static str, column: String },

    #[error("join key types differ: left is {left}, right is {right}")]
    KeyTypeMismatch { left: ValueKind, right: ValueKind },
}

/// Columnar table with deferred per-cell realization.
#[derive(Clone, Default)]
pub struct LazyTable {
    /// Ordered column names.
    columns: Vec<String>,
    /// Raw cell storage, row-major. Each row has `columns.len()` cells.
    rows: Vec<Vec<Value>>,
    /// Loaders attached to columns by name.
    loaders: IndexMap<String, Arc<dyn Loader>>,
    /// Realized values for loader-backed cells, keyed (row, column index).
    cache: RefCell<HashMap<(usize, usize), Value>>,
}

impl std::fmt::Debug for LazyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyTable")
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .field("loaders", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LazyTable {
    /// Create an empty (zero-row) table with the given schema.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    /// Create a table from raw rows. Every row must match the schema width.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self {
            columns,
            rows,
            ..Default::default()
        }
    }

    /// Attach a loader to a column (builder form).
    pub fn with_loader(mut self, column: impl Into<String>, loader: Arc<dyn Loader>) -> Self {
        self.set_loader(column, loader);
        self
    }

    /// Attach a loader to a column.
    pub fn set_loader(&mut self, column: impl Into<String>, loader: Arc<dyn Loader>) {
        self.loaders.insert(column.into(), loader);
    }

    /// Ordered column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The loader attached to a column, if any.
    pub fn loader(&self, column: &str) -> Option<Arc<dyn Loader>> {
        self.loaders.get(column).cloned()
    }

    /// The raw (unrealized) value of a cell.
    pub fn raw(&self, column: &str, row: usize) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row)?.get(col)
    }

    /// Read a cell, realizing it through the column's loader on first access.
    ///
    /// Repeated reads of the same cell return the cached realized value
    /// without invoking the loader again. `Null` cells (unmatched join rows)
    /// realize to `Null` without touching the loader.
    pub fn get(&self, column: &str, row: usize) -> Option<Value> {
        let col = self.column_index(column)?;
        self.get_at(row, col)
    }

    fn get_at(&self, row: usize, col: usize) -> Option<Value> {
        let raw = self.rows.get(row)?.get(col)?;
        let Some(loader) = self.loaders.get(&self.columns[col]) else {
            return Some(raw.clone());
        };
        if raw.is_null() {
            return Some(Value::Null);
        }
        if let Some(cached) = self.cache.borrow().get(&(row, col)) {
            return Some(cached.clone());
        }
        let realized = loader.load(raw);
        self.cache
            .borrow_mut()
            .insert((row, col), realized.clone());
        Some(realized)
    }

    /// A lazy view of one row.
    pub fn row(&self, index: usize) -> Option<LazyRow<'_>> {
        (index < self.rows.len()).then_some(LazyRow { table: self, index })
    }

    /// Iterate rows as lazy views. Restartable: a fresh iteration re-scans
    /// the row order but reuses the same realization cache.
    pub fn rows(&self) -> impl Iterator<Item = LazyRow<'_>> {
        (0..self.rows.len()).map(move |index| LazyRow { table: self, index })
    }

    /// Relational join with `other` on `left_key`/`right_key`.
    ///
    /// Key columns are forced through their loaders (comparison needs
    /// concrete values) and carry no loader into the result. Identical key
    /// names coalesce into one output column; every other column name present
    /// on both sides is renamed with the suffix pair, together with its
    /// loader. Duplicate keys produce the cross-product of matching rows;
    /// unmatched rows under `left`/`right`/`outer` get null-filled cells.
    pub fn merge(
        &self,
        other: &LazyTable,
        how: JoinType,
        left_key: &str,
        right_key: &str,
        suffixes: (&str, &str),
    ) -> Result<LazyTable, TableError> {
        let li = self
            .column_index(left_key)
            .ok_or_else(|| TableError::MissingKey {
                side: "left",
                column: left_key.to_string(),
            })?;
        let ri = other
            .column_index(right_key)
            .ok_or_else(|| TableError::MissingKey {
                side: "right",
                column: right_key.to_string(),
            })?;

        let left_keys: Vec<Value> = (0..self.len())
            .map(|r| self.get_at(r, li).unwrap_or(Value::Null))
            .collect();
        let right_keys: Vec<Value> = (0..other.len())
            .map(|r| other.get_at(r, ri).unwrap_or(Value::Null))
            .collect();

        let left_kind = left_keys.iter().find(|v| !v.is_null()).map(Value::kind);
        let right_kind = right_keys.iter().find(|v| !v.is_null()).map(Value::kind);
        if let (Some(left), Some(right)) = (left_kind, right_kind)
            && left != right
        {
            return Err(TableError::KeyTypeMismatch { left, right });
        }

        let coalesce = left_key == right_key;
        let (sx, sy) = suffixes;
        let collides = |name: &str| {
            self.has_column(name) && other.has_column(name) && !(coalesce && name == left_key)
        };

        let mut out_columns: Vec<String> = Vec::with_capacity(self.columns.len() + other.columns.len());
        for name in &self.columns {
            if collides(name) {
                out_columns.push(format!("{name}{sx}"));
            } else {
                out_columns.push(name.clone());
            }
        }
        // Right-side columns carried into the output, minus a coalesced key.
        let mut right_cols: Vec<usize> = Vec::new();
        for (j, name) in other.columns.iter().enumerate() {
            if coalesce && name == right_key {
                continue;
            }
            right_cols.push(j);
            if collides(name) {
                out_columns.push(format!("{name}{sy}"));
            } else {
                out_columns.push(name.clone());
            }
        }

        let mut out_loaders: IndexMap<String, Arc<dyn Loader>> = IndexMap::new();
        for (name, loader) in &self.loaders {
            if name == left_key {
                continue; // forced during the join
            }
            let out_name = if collides(name) {
                format!("{name}{sx}")
            } else {
                name.clone()
            };
            out_loaders.insert(out_name, loader.clone());
        }
        for (name, loader) in &other.loaders {
            if name == right_key {
                continue;
            }
            let out_name = if collides(name) {
                format!("{name}{sy}")
            } else {
                name.clone()
            };
            out_loaders.insert(out_name, loader.clone());
        }

        let mut out_rows: Vec<Vec<Value>> = Vec::new();
        let mut emit = |lrow: Option<usize>, rrow: Option<usize>| {
            let mut row = Vec::with_capacity(out_columns.len());
            for j in 0..self.columns.len() {
                let cell = match lrow {
                    Some(r) if j == li => left_keys[r].clone(),
                    Some(r) => self.rows[r][j].clone(),
                    // A coalesced key takes its value from the matching side.
                    None if coalesce && j == li => match rrow {
                        Some(rr) => right_keys[rr].clone(),
                        None => Value::Null,
                    },
                    None => Value::Null,
                };
                row.push(cell);
            }
            for &j in &right_cols {
                let cell = match rrow {
                    Some(rr) if j == ri => right_keys[rr].clone(),
                    Some(rr) => other.rows[rr][j].clone(),
                    None => Value::Null,
                };
                row.push(cell);
            }
            out_rows.push(row);
        };

        let mut right_index: HashMap<KeyAtom, Vec<usize>> = HashMap::new();
        for (rr, key) in right_keys.iter().enumerate() {
            if let Some(atom) = key_atom(key) {
                right_index.entry(atom).or_default().push(rr);
            }
        }

        let mut matched_right = vec![false; other.len()];
        for (r, key) in left_keys.iter().enumerate() {
            let matches = key_atom(key).and_then(|atom| right_index.get(&atom));
            match matches {
                Some(rrs) => {
                    for &rr in rrs {
                        matched_right[rr] = true;
                        emit(Some(r), Some(rr));
                    }
                }
                None => {
                    if matches!(how, JoinType::Left | JoinType::Outer) {
                        emit(Some(r), None);
                    }
                }
            }
        }
        if matches!(how, JoinType::Right | JoinType::Outer) {
            for (rr, matched) in matched_right.iter().enumerate() {
                if !matched {
                    emit(None, Some(rr));
                }
            }
        }

        let mut merged = LazyTable::from_rows(out_columns, out_rows);
        merged.loaders = out_loaders;
        Ok(merged)
    }

    /// Remove rows containing any `Null` raw cell (the `drop` missing-data
    /// policy). Loaders are preserved; returns the dropped-row count.
    pub fn drop_null_rows(&self) -> (LazyTable, usize) {
        let kept: Vec<Vec<Value>> = self
            .rows
            .iter()
            .filter(|row| !row.iter().any(Value::is_null))
            .cloned()
            .collect();
        let dropped = self.rows.len() - kept.len();
        let mut table = LazyTable::from_rows(self.columns.clone(), kept);
        table.loaders = self.loaders.clone();
        (table, dropped)
    }
}

/// Lazy view of one table row. Reads go through the table's cell cache.
#[derive(Clone, Copy)]
pub struct LazyRow<'a> {
    table: &'a LazyTable,
    index: usize,
}

impl<'a> LazyRow<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn columns(&self) -> &'a [String] {
        self.table.columns()
    }

    /// Read one field, realizing it if the column has a loader.
    pub fn get(&self, column: &str) -> Option<Value> {
        self.table.get(column, self.index)
    }

    /// Realize every field of this row into a map.
    pub fn to_map(&self) -> IndexMap<String, Value> {
        self.table
            .columns
            .iter()
            .enumerate()
            .map(|(col, name)| {
                (
                    name.clone(),
                    self.table.get_at(self.index, col).unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for LazyRow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRow").field("index", &self.index).finish()
    }
}

/// Hashable projection of a join-key value. `Null` keys never match.
#[derive(Hash, PartialEq, Eq)]
enum KeyAtom {
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Str(String),
}

fn key_atom(value: &Value) -> Option<KeyAtom> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(KeyAtom::Bool(*b)),
        Value::Int(n) => Some(KeyAtom::Int(*n)),
        Value::Float(n) => Some(KeyAtom::FloatBits(n.to_bits())),
        Value::Str(s) => Some(KeyAtom::Str(s.clone())),
    }
}

// ABOUTME: Offset ordering model - a position in a table derived from primary-key values
// ABOUTME: Provides the strict total order used for page splitting and checkpoints

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{ReconcileError, Result};
use crate::record::{Record, Value};

/// An immutable, totally-ordered position built from one or more primary-key columns.
///
/// Offsets from the same table compare lexicographically, column by column.
/// Comparing offsets with a different number of key columns, or with key values
/// of incompatible kinds, is a [`ReconcileError::SchemaMismatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Offset {
    /// Build an offset from key column names and their values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Result<Self> {
        if columns.is_empty() {
            return Err(ReconcileError::SchemaMismatch(
                "offset needs at least one primary-key column".to_string(),
            ));
        }
        if columns.len() != values.len() {
            return Err(ReconcileError::SchemaMismatch(format!(
                "offset has {} key columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Convenience constructor for single-column keys.
    pub fn single(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            columns: vec![column.into()],
            values: vec![value.into()],
        }
    }

    /// Extract the offset of `record` given its primary-key column names.
    pub fn from_record(record: &Record, key_columns: &[String]) -> Result<Self> {
        let values = key_columns
            .iter()
            .map(|name| {
                record.get(name).cloned().ok_or_else(|| {
                    ReconcileError::SchemaMismatch(format!(
                        "record has no primary-key column '{}'",
                        name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(key_columns.to_vec(), values)
    }

    /// Primary-key values, in key column order.
    pub fn primary_key(&self) -> &[Value] {
        &self.values
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.columns
    }

    /// Same key values under different column names (used when the slave names
    /// its key columns differently).
    pub fn relabel(&self, columns: &[String]) -> Result<Self> {
        Self::new(columns.to_vec(), self.values.clone())
    }

    /// Lexicographic comparison, short-circuiting at the first differing column.
    pub fn compare(&self, other: &Offset) -> Result<Ordering> {
        if self.values.len() != other.values.len() {
            return Err(ReconcileError::SchemaMismatch(format!(
                "cannot compare offset with {} key columns to offset with {}",
                self.values.len(),
                other.values.len()
            )));
        }

        for (idx, (left, right)) in self.values.iter().zip(&other.values).enumerate() {
            match left.compare(right) {
                Some(Ordering::Equal) => continue,
                Some(ordering) => return Ok(ordering),
                None => {
                    return Err(ReconcileError::SchemaMismatch(format!(
                        "key column {} ('{}') holds {} on one side and {} on the other",
                        idx,
                        self.columns[idx],
                        left.kind(),
                        right.kind()
                    )))
                }
            }
        }
        Ok(Ordering::Equal)
    }

    /// Canonical record identifier: the key values only, as compact JSON.
    ///
    /// Column names are left out so that master and slave rows join even when
    /// the slave names its key columns differently. Values are canonicalised
    /// first, so offsets that compare equal encode identically.
    pub fn encode(&self) -> String {
        let values: Vec<Value> = self.values.iter().map(Value::canonical).collect();
        serde_json::to_string(&values).unwrap_or_else(|_| {
            self.values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, (column, value)) in self.columns.iter().zip(&self.values).enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", column, value)?;
        }
        write!(f, ")")
    }
}

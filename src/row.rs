//! Row view over a result set packet
use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;

use crate::value::Value;

/// One row of a result set
///
/// Supports access by zero based ordinal or by column name. The row handed
/// out by a cursor is only valid until the cursor advances; `clone` detaches
/// an independent snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names, shared between all rows of one result set
    names: Arc<[String]>,
    /// Values in field order
    values: Vec<Value>,
}

impl Row {
    /// Construct a row over the captured field names
    pub(crate) fn new(names: Arc<[String]>, values: Vec<Value>) -> Row {
        Row { names, values }
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The column names in field order
    pub fn columns(&self) -> &[String] {
        &self.names
    }

    /// Value at the given ordinal, or None when out of range
    pub fn get(&self, ordinal: usize) -> Option<&Value> {
        self.values.get(ordinal)
    }

    /// Value of the named column, or None when no such column exists
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.values.get(idx)
    }

    /// Shallow snapshot of the row as a name to value mapping
    pub fn to_object(&self) -> BTreeMap<String, Value> {
        self.names
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    /// Snapshot of the values in field order
    pub fn to_array(&self) -> Vec<Value> {
        self.values.clone()
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, ordinal: usize) -> &Value {
        &self.values[ordinal]
    }
}

impl Index<&str> for Row {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        self.get_named(name)
            .unwrap_or_else(|| panic!("no column named {name:?}"))
    }
}

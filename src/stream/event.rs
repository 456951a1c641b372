//! Change events emitted by the database replication feed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Position of a transaction in the database's total commit order.
///
/// Strictly increasing per table; the basis for every staleness decision on
/// the client side.
pub type CommitOrder = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Primary-key value of a row, stringified for uniform map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row-level change. Delete events usually carry only `previous_row`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "operation")]
    pub op: Operation,
    pub row: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_row: Option<Value>,
    pub commit_order: CommitOrder,
}

impl ChangeEvent {
    /// Extract the row key from `row`, falling back to `previous_row` (the
    /// only image a delete carries). `None` when neither image has the key
    /// field.
    pub fn row_key(&self, key_field: &str) -> Option<RowKey> {
        value_key(&self.row, key_field)
            .or_else(|| self.previous_row.as_ref().and_then(|prev| value_key(prev, key_field)))
    }
}

fn value_key(row: &Value, key_field: &str) -> Option<RowKey> {
    match row.get(key_field)? {
        Value::String(s) => Some(RowKey::new(s.clone())),
        Value::Number(n) => Some(RowKey::new(n.to_string())),
        _ => None,
    }
}

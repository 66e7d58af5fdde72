//! BoardStore - persistent record storage for the boardflow orchestrator
//!
//! Collections of JSON-serialized records in a single SQLite database, with
//! secondary indexes for filtered queries, a cursor-style scan for replay,
//! and month-partitioned collections for append-only logs.
//!
//! Records are plain serde types implementing the [`Record`] trait. The
//! store never interprets record bodies beyond the declared indexed fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

mod error;
mod store;

pub mod cli;

pub use error::StoreError;
pub use store::{CollectionStats, Store};

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value that can participate in a secondary index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// Text form stored in the index table
    pub fn as_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    /// Integer form, when the value is numeric
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Comparison operator for filtered queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
}

/// A single query filter over an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Shorthand for the common equality case
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }
}

/// A record that can be persisted in a collection
pub trait Record: Serialize + for<'de> Deserialize<'de> {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last-modified timestamp (Unix milliseconds); drives cursor scans
    fn updated_at(&self) -> i64;

    /// Name of the collection this record type lives in
    fn collection_name() -> &'static str;

    /// Fields to maintain in the secondary index
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

/// Collection name for a time partition of `base`, e.g. `webhook_events_2026_08`
pub fn partitioned_collection(base: &str, at_ms: i64) -> String {
    use chrono::{Datelike, TimeZone, Utc};
    let dt = Utc.timestamp_millis_opt(at_ms).single().unwrap_or_else(Utc::now);
    format!("{}_{:04}_{:02}", base, dt.year(), dt.month())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_value_text_forms() {
        assert_eq!(IndexValue::String("x".into()).as_text(), "x");
        assert_eq!(IndexValue::Int(42).as_text(), "42");
        assert_eq!(IndexValue::Bool(true).as_text(), "true");
    }

    #[test]
    fn test_index_value_as_int() {
        assert_eq!(IndexValue::Int(7).as_int(), Some(7));
        assert_eq!(IndexValue::String("7".into()).as_int(), None);
    }

    #[test]
    fn test_partitioned_collection_name() {
        // 2026-08-01T00:00:00Z
        let ms = 1_785_542_400_000;
        assert_eq!(partitioned_collection("webhook_events", ms), "webhook_events_2026_08");
    }

    #[test]
    fn test_filter_eq_shorthand() {
        let f = Filter::eq("status", "pending");
        assert_eq!(f.field, "status");
        assert_eq!(f.op, FilterOp::Eq);
        assert_eq!(f.value, IndexValue::String("pending".into()));
    }
}

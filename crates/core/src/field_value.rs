use serde::{Deserialize, Serialize};

use crate::ids::RecordId;

/// Scalar values stored in map fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    RecordRef(RecordId),
    Bytes(Vec<u8>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::RecordRef(a), Self::RecordRef(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Stable textual rendering, used for content hashing.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Text(s) => format!("text:{s}"),
            FieldValue::Integer(n) => format!("int:{n}"),
            FieldValue::Float(f) => format!("float:{:016x}", f.to_bits()),
            FieldValue::Boolean(b) => format!("bool:{b}"),
            FieldValue::Timestamp(t) => format!("ts:{t}"),
            FieldValue::RecordRef(id) => format!("ref:{id}"),
            FieldValue::Bytes(bytes) => format!("bytes:{}", blake3::hash(bytes).to_hex()),
        }
    }
}

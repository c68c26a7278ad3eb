//! Transaction schema and permissive decoding
//!
//! Message values are JSON objects with eight known fields. Decoding never
//! fails: a field that is absent or has the wrong type becomes `None`, and a
//! value that is not a JSON object yields a record with every field `None`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Field names of the transaction payload, in schema order
pub const TRANSACTION_FIELDS: [&str; 8] = [
    "id",
    "timestamp",
    "customer_id",
    "transaction_type",
    "amount",
    "currency",
    "status",
    "metadata",
];

/// One decoded message value
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Option<String>,
    /// Raw event time as sent by the producer
    pub timestamp: Option<String>,
    pub customer_id: Option<String>,
    pub transaction_type: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    /// Opaque; nested JSON is kept as its serialized text
    pub metadata: Option<String>,
}

impl Transaction {
    /// Decode a message value against the transaction schema
    pub fn parse_permissive(value: Option<&[u8]>) -> Self {
        let Some(bytes) = value else {
            return Self::default();
        };
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Self::from_object(&map),
            _ => Self::default(),
        }
    }

    fn from_object(map: &Map<String, Value>) -> Self {
        Self {
            id: string_field(map, "id"),
            timestamp: string_field(map, "timestamp"),
            customer_id: string_field(map, "customer_id"),
            transaction_type: string_field(map, "transaction_type"),
            amount: double_field(map, "amount"),
            currency: string_field(map, "currency"),
            status: string_field(map, "status"),
            metadata: string_field(map, "metadata"),
        }
    }

    /// `timestamp` parsed as an instant, if it is in a recognised layout
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }
}

// Strings pass through; scalars and nested values keep their JSON text.
fn string_field(map: &Map<String, Value>, name: &str) -> Option<String> {
    match map.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn double_field(map: &Map<String, Value>, name: &str) -> Option<f64> {
    match map.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" | "+Infinity" | "INF" | "+INF" => Some(f64::INFINITY),
            "-Infinity" | "-INF" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

const NAIVE_LAYOUTS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse an event-time string.
///
/// Accepts RFC 3339, ISO-8601 date-times with or without a zone, and plain
/// dates. Values without a zone are read as UTC. Anything else is `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

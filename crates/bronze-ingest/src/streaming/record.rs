//! Stream records and their Arrow layout

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::schema::Transaction;

/// A message as delivered by the source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A decoded transaction plus lineage columns
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedTransaction {
    pub key: Option<String>,
    pub transaction: Transaction,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub kafka_timestamp: Option<DateTime<Utc>>,
    pub ingestion_timestamp: DateTime<Utc>,
    pub data_source: String,
    pub transaction_timestamp: Option<DateTime<Utc>>,
}

/// Audit projection of one ingested transaction
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: Option<String>,
    pub kafka_timestamp: Option<DateTime<Utc>>,
    pub ingestion_timestamp: DateTime<Utc>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub processed_timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_enriched(record: &EnrichedTransaction, processed_at: DateTime<Utc>) -> Self {
        Self {
            id: record.transaction.id.clone(),
            kafka_timestamp: record.kafka_timestamp,
            ingestion_timestamp: record.ingestion_timestamp,
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            processed_timestamp: processed_at,
        }
    }
}

/// Stamps lineage metadata onto decoded messages
#[derive(Debug, Clone)]
pub struct Enricher {
    data_source: String,
}

impl Enricher {
    /// `data_source` is the subscribed topic name
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
        }
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Decode and enrich one message; `ingested_at` is shared by the whole micro-batch
    pub fn enrich(&self, message: &SourceMessage, ingested_at: DateTime<Utc>) -> EnrichedTransaction {
        let transaction = Transaction::parse_permissive(message.payload.as_deref());
        let transaction_timestamp = transaction.parsed_timestamp();

        EnrichedTransaction {
            key: message
                .key
                .as_deref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            transaction,
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            kafka_timestamp: message.timestamp,
            ingestion_timestamp: ingested_at,
            data_source: self.data_source.clone(),
            transaction_timestamp,
        }
    }
}

// ============================================================================
// Arrow encoding
// ============================================================================

fn utc_micros() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn timestamps(values: impl Iterator<Item = Option<DateTime<Utc>>>) -> ArrayRef {
    let micros: Vec<Option<i64>> = values.map(|v| v.map(|dt| dt.timestamp_micros())).collect();
    Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(values.collect::<StringArray>())
}

/// Layout of transaction data files.
///
/// `transaction_type` is absent: it is encoded in the partition directory.
pub fn transaction_file_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, true),
        Field::new("id", DataType::Utf8, true),
        Field::new("timestamp", DataType::Utf8, true),
        Field::new("customer_id", DataType::Utf8, true),
        Field::new("amount", DataType::Float64, true),
        Field::new("currency", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, true),
        Field::new("metadata", DataType::Utf8, true),
        Field::new("topic", DataType::Utf8, false),
        Field::new("partition", DataType::Int32, false),
        Field::new("offset", DataType::Int64, false),
        Field::new("kafka_timestamp", utc_micros(), true),
        Field::new("ingestion_timestamp", utc_micros(), false),
        Field::new("data_source", DataType::Utf8, false),
        Field::new("transaction_timestamp", utc_micros(), true),
    ]))
}

pub fn transactions_to_batch(records: &[&EnrichedTransaction]) -> Result<RecordBatch> {
    let tx = |f: fn(&Transaction) -> Option<&str>| -> ArrayRef {
        strings(records.iter().map(|r| f(&r.transaction)))
    };

    let columns: Vec<ArrayRef> = vec![
        strings(records.iter().map(|r| r.key.as_deref())),
        tx(|t| t.id.as_deref()),
        tx(|t| t.timestamp.as_deref()),
        tx(|t| t.customer_id.as_deref()),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.transaction.amount).collect::<Vec<_>>(),
        )),
        tx(|t| t.currency.as_deref()),
        tx(|t| t.status.as_deref()),
        tx(|t| t.metadata.as_deref()),
        strings(records.iter().map(|r| Some(r.topic.as_str()))),
        Arc::new(Int32Array::from(
            records.iter().map(|r| r.partition).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(records.iter().map(|r| r.offset).collect::<Vec<_>>())),
        timestamps(records.iter().map(|r| r.kafka_timestamp)),
        timestamps(records.iter().map(|r| Some(r.ingestion_timestamp))),
        strings(records.iter().map(|r| Some(r.data_source.as_str()))),
        timestamps(records.iter().map(|r| r.transaction_timestamp)),
    ];

    RecordBatch::try_new(transaction_file_schema(), columns)
        .context("build transaction record batch")
}

pub fn audit_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, true),
        Field::new("kafka_timestamp", utc_micros(), true),
        Field::new("ingestion_timestamp", utc_micros(), false),
        Field::new("topic", DataType::Utf8, false),
        Field::new("partition", DataType::Int32, false),
        Field::new("offset", DataType::Int64, false),
        Field::new("processed_timestamp", utc_micros(), false),
    ]))
}

pub fn audit_to_batch(records: &[AuditRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        strings(records.iter().map(|r| r.id.as_deref())),
        timestamps(records.iter().map(|r| r.kafka_timestamp)),
        timestamps(records.iter().map(|r| Some(r.ingestion_timestamp))),
        strings(records.iter().map(|r| Some(r.topic.as_str()))),
        Arc::new(Int32Array::from(
            records.iter().map(|r| r.partition).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(records.iter().map(|r| r.offset).collect::<Vec<_>>())),
        timestamps(records.iter().map(|r| Some(r.processed_timestamp))),
    ];

    RecordBatch::try_new(audit_schema(), columns).context("build audit record batch")
}

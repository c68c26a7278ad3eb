//! Parquet sinks for micro-batches

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::checkpoint::CHECKPOINT_DIR;
use super::record::{audit_schema, audit_to_batch, transaction_file_schema, transactions_to_batch};
use super::record::{AuditRecord, EnrichedTransaction};
use crate::columnar::{encode_parquet, PARQUET_SUFFIX};
use crate::storage::Location;

/// Partition directory for records without a `transaction_type`
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

const PARTITION_COLUMN: &str = "transaction_type";

/// Destination of one streaming query
#[async_trait]
pub trait MicroBatchSink: Send + Sync {
    fn describe(&self) -> String;

    /// Write one micro-batch, returning the number of files written.
    ///
    /// Files are named after `batch_id`, so rewriting a batch replaces them.
    async fn add_batch(&self, batch_id: u64, records: &[EnrichedTransaction]) -> Result<usize>;

    /// Remove files of batches at or after `next_batch_id`, which were
    /// written but never committed.
    async fn discard_uncommitted(&self, next_batch_id: u64) -> Result<usize>;
}

/// Data file name for a batch
pub fn data_file_name(batch_id: u64) -> String {
    format!("part-{:05}{}", batch_id, PARQUET_SUFFIX)
}

/// Inverse of [`data_file_name`]
pub fn batch_id_of(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("part-")?
        .strip_suffix(PARQUET_SUFFIX)?
        .parse()
        .ok()
}

fn needs_escape(c: char) -> bool {
    c.is_control()
        || matches!(
            c,
            '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '[' | ']' | '^'
        )
}

/// Hive-style `column=value` directory, with unsafe characters %XX-escaped
pub fn partition_directory(value: Option<&str>) -> String {
    let value = match value {
        Some(v) if !v.is_empty() => v,
        _ => return format!("{}={}", PARTITION_COLUMN, DEFAULT_PARTITION),
    };

    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                escaped.push_str(&format!("%{:02X}", byte));
            }
        } else {
            escaped.push(c);
        }
    }
    format!("{}={}", PARTITION_COLUMN, escaped)
}

async fn discard_from(output: &Location, next_batch_id: u64) -> Result<usize> {
    let checkpoints = format!("{}/", output.key(CHECKPOINT_DIR));
    let mut removed = 0;
    for object in output.list().await? {
        if object.key.starts_with(&checkpoints) {
            continue;
        }
        if batch_id_of(object.file_name()).is_some_and(|id| id >= next_batch_id) {
            output.store().delete(&object.key).await?;
            debug!(key = %object.key, "Discarded uncommitted file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Transactions partitioned by `transaction_type`
#[derive(Debug, Clone)]
pub struct PartitionedTransactionSink {
    output: Location,
}

impl PartitionedTransactionSink {
    pub fn new(output: Location) -> Self {
        Self { output }
    }
}

#[async_trait]
impl MicroBatchSink for PartitionedTransactionSink {
    fn describe(&self) -> String {
        self.output.uri()
    }

    async fn add_batch(&self, batch_id: u64, records: &[EnrichedTransaction]) -> Result<usize> {
        let mut partitions: BTreeMap<String, Vec<&EnrichedTransaction>> = BTreeMap::new();
        for record in records {
            partitions
                .entry(partition_directory(record.transaction.transaction_type.as_deref()))
                .or_default()
                .push(record);
        }

        let file_name = data_file_name(batch_id);
        for (directory, rows) in &partitions {
            let batch = transactions_to_batch(rows)?;
            let data = encode_parquet(transaction_file_schema(), &[batch])?;
            self.output
                .put(&format!("{}/{}", directory, file_name), data)
                .await?;
            debug!(batch_id, partition = %directory, rows = rows.len(), "Wrote partition file");
        }
        Ok(partitions.len())
    }

    async fn discard_uncommitted(&self, next_batch_id: u64) -> Result<usize> {
        let removed = discard_from(&self.output, next_batch_id).await?;
        if removed > 0 {
            info!(sink = %self.describe(), removed, next_batch_id, "Removed files of uncommitted batch");
        }
        Ok(removed)
    }
}

/// Audit projection, one unpartitioned file per batch
#[derive(Debug, Clone)]
pub struct AuditSink {
    output: Location,
}

impl AuditSink {
    pub fn new(output: Location) -> Self {
        Self { output }
    }
}

#[async_trait]
impl MicroBatchSink for AuditSink {
    fn describe(&self) -> String {
        self.output.uri()
    }

    async fn add_batch(&self, batch_id: u64, records: &[EnrichedTransaction]) -> Result<usize> {
        let processed_at = Utc::now();
        let audit: Vec<AuditRecord> = records
            .iter()
            .map(|r| AuditRecord::from_enriched(r, processed_at))
            .collect();

        let batch = audit_to_batch(&audit)?;
        let data = encode_parquet(audit_schema(), &[batch])?;
        self.output.put(&data_file_name(batch_id), data).await?;
        Ok(1)
    }

    async fn discard_uncommitted(&self, next_batch_id: u64) -> Result<usize> {
        let removed = discard_from(&self.output, next_batch_id).await?;
        if removed > 0 {
            info!(sink = %self.describe(), removed, next_batch_id, "Removed files of uncommitted batch");
        }
        Ok(removed)
    }
}

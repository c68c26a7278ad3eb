//! Shared helpers for the pipeline integration tests
//!
//! [`TopicLog`] stands in for a Kafka topic and [`VecSource`] for a consumer
//! of it. A source resumes checkpointed partitions at the stored offset and
//! starts every other partition at its latest offset, or at its earliest
//! one after [`VecSource::from_earliest`]. Once caught up it either
//! ends, waits for new messages, or fails.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use arrow::array::{Array, Int32Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bronze_ingest::columnar::decode_parquet;
use bronze_ingest::storage::{LocalStore, Location, ObjectStore};
use bronze_ingest::streaming::{MessageSource, PartitionOffsets, SourceMessage};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOPIC: &str = "transactions";

/// What a [`VecSource`] does once it has read everything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLast {
    End,
    Block,
    Fail,
}

/// In-memory topic shared by producers and any number of sources
#[derive(Clone, Default)]
pub struct TopicLog {
    partitions: Arc<Mutex<BTreeMap<i32, BTreeMap<i64, SourceMessage>>>>,
}

impl TopicLog {
    pub fn new(partitions: &[i32]) -> Self {
        let log = Self::default();
        {
            let mut inner = log.partitions.lock().unwrap();
            for partition in partitions {
                inner.entry(*partition).or_default();
            }
        }
        log
    }

    fn insert(&self, message: SourceMessage) {
        self.partitions
            .lock()
            .unwrap()
            .entry(message.partition)
            .or_default()
            .insert(message.offset, message);
    }

    /// Append a message at the partition's end, returning its offset
    pub fn produce(&self, partition: i32, payload: &str) -> i64 {
        let offset = self.end_offsets().get(&partition).copied().unwrap_or(0);
        self.insert(message(partition, offset, Some(payload)));
        offset
    }

    pub fn end_offsets(&self) -> PartitionOffsets {
        self.partitions
            .lock()
            .unwrap()
            .iter()
            .map(|(p, log)| (*p, log.keys().next_back().map_or(0, |last| last + 1)))
            .collect()
    }

    fn earliest_offsets(&self) -> PartitionOffsets {
        self.partitions
            .lock()
            .unwrap()
            .iter()
            .map(|(p, log)| (*p, log.keys().next().copied().unwrap_or(0)))
            .collect()
    }

    /// First message at or after `positions`, lowest partition first
    fn next_after(&self, positions: &PartitionOffsets) -> Option<SourceMessage> {
        let inner = self.partitions.lock().unwrap();
        positions.iter().find_map(|(partition, next)| {
            inner
                .get(partition)
                .and_then(|log| log.range(*next..).next())
                .map(|(_, m)| m.clone())
        })
    }

    /// A consumer that starts unknown partitions at their latest offset
    pub fn consumer(&self, after_last: AfterLast) -> VecSource {
        VecSource {
            log: self.clone(),
            positions: PartitionOffsets::new(),
            from_earliest: false,
            after_last,
            seeks: Arc::default(),
        }
    }
}

pub struct VecSource {
    log: TopicLog,
    positions: PartitionOffsets,
    from_earliest: bool,
    after_last: AfterLast,
    seeks: Arc<Mutex<Vec<PartitionOffsets>>>,
}

impl VecSource {
    /// Source over a private topic holding `messages`, read from the earliest offset
    pub fn new(messages: Vec<SourceMessage>, after_last: AfterLast) -> Self {
        let log = TopicLog::default();
        for message in messages {
            log.insert(message);
        }
        log.consumer(after_last).from_earliest()
    }

    /// Start unknown partitions at their earliest offset instead
    pub fn from_earliest(mut self) -> Self {
        self.from_earliest = true;
        self
    }

    /// Offsets passed to every `seek`, shared with the test
    pub fn seeks(&self) -> Arc<Mutex<Vec<PartitionOffsets>>> {
        self.seeks.clone()
    }

    pub fn boxed(self) -> Box<dyn MessageSource> {
        Box::new(self)
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn end_offsets(&mut self) -> Result<PartitionOffsets> {
        Ok(self.log.end_offsets())
    }

    async fn seek(&mut self, offsets: &PartitionOffsets) -> Result<PartitionOffsets> {
        self.seeks.lock().unwrap().push(offsets.clone());
        let mut positions = if self.from_earliest {
            self.log.earliest_offsets()
        } else {
            self.log.end_offsets()
        };
        for (partition, next) in positions.iter_mut() {
            if let Some(stored) = offsets.get(partition) {
                *next = *stored;
            }
        }
        self.positions = positions.clone();
        Ok(positions)
    }

    async fn next_message(&mut self) -> Result<Option<SourceMessage>> {
        loop {
            if let Some(message) = self.log.next_after(&self.positions) {
                self.positions.insert(message.partition, message.offset + 1);
                return Ok(Some(message));
            }
            match self.after_last {
                AfterLast::End => return Ok(None),
                AfterLast::Block => tokio::time::sleep(Duration::from_millis(10)).await,
                AfterLast::Fail => return Err(anyhow::anyhow!("broker connection lost")),
            }
        }
    }
}

pub fn message(partition: i32, offset: i64, payload: Option<&str>) -> SourceMessage {
    SourceMessage {
        key: Some(format!("key-{}", offset).into_bytes()),
        payload: payload.map(|p| p.as_bytes().to_vec()),
        topic: TOPIC.to_string(),
        partition,
        offset,
        timestamp: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
    }
}

pub fn transaction(id: &str, transaction_type: &str, amount: f64) -> String {
    serde_json::json!({
        "id": id,
        "timestamp": "2024-05-01T11:59:30Z",
        "customer_id": "cust-1",
        "transaction_type": transaction_type,
        "amount": amount,
        "currency": "EUR",
        "status": "approved",
        "metadata": "{}"
    })
    .to_string()
}

pub fn local_location(root: &Path, prefix: &str) -> Location {
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(root));
    Location::new(store, prefix)
}

/// Decode every Parquet file below `location`, with the key it came from
pub async fn read_parquet_files(location: &Location) -> Vec<(String, RecordBatch)> {
    let mut out = Vec::new();
    for object in location.list().await.unwrap() {
        if !object.key.ends_with(".parquet") {
            continue;
        }
        let data = location.store().get(&object.key).await.unwrap();
        let (_, batches) = decode_parquet(data).unwrap();
        for batch in batches {
            out.push((object.key.clone(), batch));
        }
    }
    out
}

pub fn strings(batch: &RecordBatch, column: &str) -> Vec<Option<String>> {
    let array = batch
        .column_by_name(column)
        .unwrap_or_else(|| panic!("missing column {}", column))
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
        .collect()
}

/// `(id, partition, offset)` of every row
pub fn row_positions(batch: &RecordBatch) -> Vec<(Option<String>, i32, i64)> {
    let ids = strings(batch, "id");
    let partitions = batch
        .column_by_name("partition")
        .unwrap()
        .as_any()
        .downcast_ref::<Int32Array>()
        .unwrap();
    let offsets = batch
        .column_by_name("offset")
        .unwrap()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    ids.into_iter()
        .enumerate()
        .map(|(i, id)| (id, partitions.value(i), offsets.value(i)))
        .collect()
}

pub fn exists(root: &Path, relative: &str) -> bool {
    root.join(relative).exists()
}

//! Micro-batch loop of one streaming flow

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::checkpoint::{CheckpointLog, CommitEntry};
use super::record::{Enricher, EnrichedTransaction, SourceMessage};
use super::sink::MicroBatchSink;
use super::source::{MessageSource, PartitionOffsets};
use crate::config::DEFAULT_TRIGGER_INTERVAL_SECS;

/// Totals reported when a query stops
#[derive(Debug, Clone, PartialEq)]
pub struct QueryProgress {
    pub name: String,
    pub query_id: Uuid,
    pub batches: u64,
    pub records: usize,
    pub last_batch_id: Option<u64>,
    pub offsets: PartitionOffsets,
}

/// Source, sink and checkpoint log of one flow
pub struct StreamingQuery {
    name: String,
    source: Box<dyn MessageSource>,
    sink: Box<dyn MicroBatchSink>,
    checkpoint: CheckpointLog,
    enricher: Enricher,
    trigger: Duration,
    initial: PartitionOffsets,
}

impl StreamingQuery {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn MessageSource>,
        sink: Box<dyn MicroBatchSink>,
        checkpoint: CheckpointLog,
        enricher: Enricher,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            sink,
            checkpoint,
            enricher,
            trigger: Duration::from_secs(DEFAULT_TRIGGER_INTERVAL_SECS),
            initial: PartitionOffsets::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: Duration) -> Self {
        self.trigger = trigger;
        self
    }

    /// Start offsets for partitions the checkpoint log has no position for
    pub fn with_initial_offsets(mut self, offsets: PartitionOffsets) -> Self {
        self.initial = offsets;
        self
    }

    pub fn trigger(&self) -> Duration {
        self.trigger
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until `cancel` fires or the source is exhausted.
    ///
    /// The start offset of every assigned partition is persisted before the
    /// first batch, so a restart resumes idle partitions too. Buffered messages are flushed on every trigger tick and when the
    /// source ends. Cancellation drops the open batch uncommitted; it is
    /// re-read from the source on the next start.
    #[instrument(skip_all, fields(query = %self.name))]
    pub async fn run(self, cancel: CancellationToken) -> Result<QueryProgress> {
        let StreamingQuery {
            name,
            mut source,
            sink,
            checkpoint,
            enricher,
            trigger,
            initial,
        } = self;
        let writer = BatchWriter {
            sink: sink.as_ref(),
            checkpoint: &checkpoint,
            enricher: &enricher,
        };

        let metadata = checkpoint.open_query().await?;
        let (latest, persisted) = checkpoint.resume_offsets().await?;

        let mut next_batch_id = latest.as_ref().map_or(0, |c| c.batch_id + 1);
        let mut offsets = initial;
        offsets.extend(persisted.iter().map(|(p, o)| (*p, *o)));

        sink.discard_uncommitted(next_batch_id)
            .await
            .context("discard uncommitted files")?;
        let assigned = source.seek(&offsets).await?;
        offsets.extend(assigned);
        if offsets != persisted {
            checkpoint
                .record_start_offsets(&offsets)
                .await
                .context("persist start offsets")?;
        }

        info!(
            query_id = %metadata.id,
            sink = %sink.describe(),
            checkpoint = %checkpoint.uri(),
            next_batch_id,
            trigger_secs = trigger.as_secs_f64(),
            "Streaming query started"
        );

        let mut progress = QueryProgress {
            name,
            query_id: metadata.id,
            batches: 0,
            records: 0,
            last_batch_id: None,
            offsets: offsets.clone(),
        };

        let mut ticker = interval_at(Instant::now() + trigger, trigger);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Vec<SourceMessage> = Vec::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(dropped = pending.len(), "Cancelled, open batch left uncommitted");
                    break;
                }
                _ = ticker.tick() => {
                    if pending.is_empty() {
                        continue;
                    }
                    let messages = std::mem::take(&mut pending);
                    writer.flush(next_batch_id, messages, &mut offsets, &mut progress).await?;
                    next_batch_id += 1;
                }
                message = source.next_message() => {
                    match message? {
                        Some(message) => pending.push(message),
                        None => {
                            if !pending.is_empty() {
                                let messages = std::mem::take(&mut pending);
                                writer.flush(next_batch_id, messages, &mut offsets, &mut progress).await?;
                            }
                            debug!("Source exhausted");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            batches = progress.batches,
            records = progress.records,
            "Streaming query stopped"
        );
        Ok(progress)
    }
}

/// Borrowed write side of a query, kept apart from the source
struct BatchWriter<'a> {
    sink: &'a dyn MicroBatchSink,
    checkpoint: &'a CheckpointLog,
    enricher: &'a Enricher,
}

impl BatchWriter<'_> {
    async fn flush(
        &self,
        batch_id: u64,
        messages: Vec<SourceMessage>,
        offsets: &mut PartitionOffsets,
        progress: &mut QueryProgress,
    ) -> Result<()> {
        let ingested_at = Utc::now();
        let records: Vec<EnrichedTransaction> = messages
            .iter()
            .map(|m| self.enricher.enrich(m, ingested_at))
            .collect();

        let files = self
            .sink
            .add_batch(batch_id, &records)
            .await
            .with_context(|| format!("write batch {}", batch_id))?;

        for message in &messages {
            let next = offsets.entry(message.partition).or_insert(0);
            *next = (*next).max(message.offset + 1);
        }

        self.checkpoint
            .commit(&CommitEntry {
                batch_id,
                offsets: offsets.clone(),
                records: records.len(),
                committed_at: Utc::now(),
            })
            .await
            .with_context(|| format!("commit batch {}", batch_id))?;

        progress.batches += 1;
        progress.records += records.len();
        progress.last_batch_id = Some(batch_id);
        progress.offsets = offsets.clone();

        info!(
            batch_id,
            records = records.len(),
            files,
            offsets = ?offsets,
            "Batch committed"
        );
        Ok(())
    }
}

//! Durable progress log of a streaming query
//!
//! Layout below the query's output location:
//!
//! ```text
//! _checkpoints/metadata            {"id": "<uuid>", "created_at": ...}
//! _checkpoints/start_offsets       {"0": 40, "1": 17}
//! _checkpoints/commits/<batch_id>  {"batch_id": 3, "offsets": {"0": 42, "1": 17}, ...}
//! ```
//!
//! `start_offsets` holds the position every partition was assigned at
//! before it had a commit, so partitions without traffic still resume where
//! they started. A commit entry is written only after the batch's data files
//! are durable. The entry with the highest batch id is the resume point.

use anyhow::{Context, Result};
use bronze_common::BronzeError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::source::PartitionOffsets;
use crate::storage::Location;

/// Directory name reserved for the log below an output location
pub const CHECKPOINT_DIR: &str = "_checkpoints";

/// Commit entries kept after pruning
pub const RETAINED_COMMITS: usize = 100;

const START_OFFSETS: &str = "start_offsets";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub batch_id: u64,
    /// Next offset to read, per partition
    pub offsets: PartitionOffsets,
    pub records: usize,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointLog {
    root: Location,
}

impl CheckpointLog {
    /// Log for the query writing to `output`
    pub fn new(output: &Location) -> Self {
        Self {
            root: output.child(CHECKPOINT_DIR),
        }
    }

    pub fn uri(&self) -> String {
        self.root.uri()
    }

    fn commits(&self) -> Location {
        self.root.child("commits")
    }

    fn corrupt(&self, relative: &str, reason: impl ToString) -> BronzeError {
        BronzeError::Checkpoint {
            path: self.root.store().describe(&self.root.key(relative)),
            reason: reason.to_string(),
        }
    }

    /// Read the query metadata, creating it on first start
    pub async fn open_query(&self) -> Result<QueryMetadata> {
        match self.root.get("metadata").await {
            Ok(data) => {
                let metadata: QueryMetadata = serde_json::from_slice(&data)
                    .map_err(|e| self.corrupt("metadata", e))?;
                debug!(query_id = %metadata.id, checkpoint = %self.uri(), "Opened existing query");
                Ok(metadata)
            },
            Err(e) if is_not_found(&e) => {
                let metadata = QueryMetadata {
                    id: Uuid::new_v4(),
                    created_at: Utc::now(),
                };
                let data = serde_json::to_vec(&metadata).map_err(BronzeError::from)?;
                self.root
                    .put("metadata", Bytes::from(data))
                    .await
                    .context("write checkpoint metadata")?;
                info!(query_id = %metadata.id, checkpoint = %self.uri(), "Started new query");
                Ok(metadata)
            },
            Err(e) => Err(e),
        }
    }

    /// Start positions recorded by [`record_start_offsets`](Self::record_start_offsets)
    pub async fn start_offsets(&self) -> Result<PartitionOffsets> {
        match self.root.get(START_OFFSETS).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| anyhow::Error::from(self.corrupt(START_OFFSETS, e))),
            Err(e) if is_not_found(&e) => Ok(PartitionOffsets::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn record_start_offsets(&self, offsets: &PartitionOffsets) -> Result<()> {
        let data = serde_json::to_vec(offsets).map_err(BronzeError::from)?;
        self.root
            .put(START_OFFSETS, Bytes::from(data))
            .await
            .context("write start offsets")?;
        debug!(offsets = ?offsets, checkpoint = %self.uri(), "Recorded start offsets");
        Ok(())
    }

    /// Where to resume: start offsets overlaid with the latest commit
    pub async fn resume_offsets(&self) -> Result<(Option<CommitEntry>, PartitionOffsets)> {
        let mut offsets = self.start_offsets().await?;
        let latest = self.latest().await?;
        if let Some(commit) = &latest {
            offsets.extend(commit.offsets.iter().map(|(p, o)| (*p, *o)));
        }
        Ok((latest, offsets))
    }

    async fn batch_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for object in self.commits().list().await? {
            let name = object.file_name();
            let id = name
                .parse::<u64>()
                .map_err(|_| self.corrupt(&format!("commits/{}", name), "non-numeric batch id"))?;
            ids.push(id);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Most recent commit, if any batch has completed
    pub async fn latest(&self) -> Result<Option<CommitEntry>> {
        let Some(batch_id) = self.batch_ids().await?.last().copied() else {
            return Ok(None);
        };
        let relative = batch_id.to_string();
        let data = self
            .commits()
            .get(&relative)
            .await
            .with_context(|| format!("read commit {}", batch_id))?;
        let entry: CommitEntry = serde_json::from_slice(&data)
            .map_err(|e| self.corrupt(&format!("commits/{}", relative), e))?;
        if entry.batch_id != batch_id {
            return Err(self
                .corrupt(&format!("commits/{}", relative), "batch id does not match file name")
                .into());
        }
        Ok(Some(entry))
    }

    /// Record a completed batch and prune old entries
    pub async fn commit(&self, entry: &CommitEntry) -> Result<()> {
        let data = serde_json::to_vec(entry).map_err(BronzeError::from)?;
        self.commits()
            .put(&entry.batch_id.to_string(), Bytes::from(data))
            .await
            .with_context(|| format!("write commit {}", entry.batch_id))?;
        self.prune().await
    }

    async fn prune(&self) -> Result<()> {
        let ids = self.batch_ids().await?;
        if ids.len() <= RETAINED_COMMITS {
            return Ok(());
        }
        let commits = self.commits();
        let stale = &ids[..ids.len() - RETAINED_COMMITS];
        for id in stale {
            commits.store().delete(&commits.key(&id.to_string())).await?;
        }
        debug!(removed = stale.len(), checkpoint = %self.uri(), "Pruned commit log");
        Ok(())
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<BronzeError>(), Some(BronzeError::NotFound(_)))
}

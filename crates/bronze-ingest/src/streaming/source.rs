use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use super::record::SourceMessage;

/// Next offset to read, per partition
pub type PartitionOffsets = BTreeMap<i32, i64>;

/// A partitioned, offset-addressed message stream
#[async_trait]
pub trait MessageSource: Send {
    /// Current end of every partition of the topic
    async fn end_offsets(&mut self) -> Result<PartitionOffsets>;

    /// Position the source before the first read.
    ///
    /// Partitions present in `offsets` resume at the stored offset; every
    /// other partition starts at its current end. Returns the concrete
    /// start offset of every assigned partition.
    async fn seek(&mut self, offsets: &PartitionOffsets) -> Result<PartitionOffsets>;

    /// Wait for the next message.
    ///
    /// Must be cancel-safe: dropping the future loses no message. `None`
    /// means the source is exhausted and will not yield again.
    async fn next_message(&mut self) -> Result<Option<SourceMessage>>;
}

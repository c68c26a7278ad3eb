//! Batch conversion: files under a storage prefix to Parquet
//!
//! Every matching source file becomes its own output directory
//! `<target>/<stem>_<run timestamp>/` holding one Parquet file and a
//! `_SUCCESS` marker. Files are converted one at a time in listing order and
//! the first failure aborts the run.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub mod enrich;
pub mod format;
pub mod reader;

pub use enrich::{add_provenance, INGESTION_TIMESTAMP_COLUMN, SOURCE_FILE_COLUMN};
pub use format::FileFormat;
pub use reader::read_file;

use crate::columnar::{encode_parquet, PARQUET_SUFFIX};
use crate::config::BatchJobConfig;
use crate::storage::{Location, ObjectInfo, ObjectStore, StorageResolver};

/// Layout of the run timestamp, shared by directory names and the
/// `ingestion_timestamp` column
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const SUCCESS_MARKER: &str = "_SUCCESS";

pub fn run_timestamp(at: DateTime<Utc>) -> String {
    at.format(RUN_TIMESTAMP_FORMAT).to_string()
}

/// Last key segment up to its first `.`
pub fn file_stem(key: &str) -> &str {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.split('.').next().unwrap_or(name)
}

pub fn output_dir_name(key: &str, run_timestamp: &str) -> String {
    format!("{}_{}", file_stem(key), run_timestamp)
}

fn output_file_name() -> String {
    format!("part-00000{}", PARQUET_SUFFIX)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedFile {
    pub source_key: String,
    pub output: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionReport {
    pub run_timestamp: String,
    /// Objects under the prefix, before the format filter
    pub listed: usize,
    pub files: Vec<ConvertedFile>,
}

impl ConversionReport {
    pub fn rows(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// Converts every file of one format below a source prefix
#[derive(Debug, Clone)]
pub struct BatchConverter {
    source: Arc<dyn ObjectStore>,
    source_prefix: String,
    target: Location,
    format: FileFormat,
}

impl BatchConverter {
    /// `source_prefix` is matched as a raw key prefix, like an S3 listing
    pub fn new(
        source: Arc<dyn ObjectStore>,
        source_prefix: impl Into<String>,
        target: Location,
        format: FileFormat,
    ) -> Self {
        Self {
            source,
            source_prefix: source_prefix.into(),
            target,
            format,
        }
    }

    /// Matching objects, in listing order
    pub async fn discover(&self) -> Result<(usize, Vec<ObjectInfo>)> {
        let objects = self
            .source
            .list(&self.source_prefix)
            .await
            .with_context(|| format!("list {}", self.source.describe(&self.source_prefix)))?;
        let listed = objects.len();
        let matching: Vec<ObjectInfo> = objects
            .into_iter()
            .filter(|o| self.format.matches(&o.key))
            .collect();
        debug!(listed, matching = matching.len(), format = %self.format, "Discovered source files");
        Ok((listed, matching))
    }

    pub async fn run(&self) -> Result<ConversionReport> {
        self.run_at(Utc::now()).await
    }

    /// Convert every matching file, stamping the run started at `started_at`
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> Result<ConversionReport> {
        let run_timestamp = run_timestamp(started_at);
        let (listed, objects) = self.discover().await?;

        info!(
            source = %self.source.describe(&self.source_prefix),
            target = %self.target.uri(),
            format = %self.format,
            files = objects.len(),
            run_timestamp = %run_timestamp,
            "Starting conversion"
        );

        let mut files = Vec::with_capacity(objects.len());
        for object in &objects {
            let converted = self
                .convert_file(&object.key, &run_timestamp)
                .await
                .with_context(|| format!("convert {}", self.source.describe(&object.key)))?;
            files.push(converted);
        }

        let report = ConversionReport {
            run_timestamp,
            listed,
            files,
        };
        info!(files = report.files.len(), rows = report.rows(), "Conversion finished");
        Ok(report)
    }

    #[instrument(skip(self), fields(format = %self.format))]
    pub async fn convert_file(&self, key: &str, run_timestamp: &str) -> Result<ConvertedFile> {
        let data = self.source.get(key).await?;
        let (schema, batches) = read_file(self.format, data)?;
        let (schema, batches) = add_provenance(&schema, &batches, key, run_timestamp)?;
        let rows = batches.iter().map(|b| b.num_rows()).sum();
        let encoded = encode_parquet(schema, &batches)?;

        let output = self.target.child(&output_dir_name(key, run_timestamp));
        let replaced = output.delete_all().await?;
        output.put(&output_file_name(), encoded).await?;
        output.put(SUCCESS_MARKER, Bytes::new()).await?;

        info!(output = %output.uri(), rows, replaced, "Converted file");
        Ok(ConvertedFile {
            source_key: key.to_string(),
            output: output.uri(),
            rows,
        })
    }
}

/// Run the batch conversion job once
pub async fn run_job(config: BatchJobConfig, resolver: &StorageResolver) -> Result<ConversionReport> {
    let source = resolver.resolve(&config.source).await;
    let target = resolver.resolve(&config.target_path).await;

    info!(job = %config.job_name, "Starting batch conversion job");
    let converter = BatchConverter::new(
        source.store().clone(),
        source.key(&config.source_prefix),
        target,
        config.file_format,
    );
    converter.run().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_timestamp_layout() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 3, 9).unwrap();
        assert_eq!(run_timestamp(at), "20240501_080309");
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("landing/2024/orders.csv"), "orders");
        assert_eq!(file_stem("landing/orders.2024.csv"), "orders");
        assert_eq!(file_stem("orders.csv"), "orders");
        assert_eq!(file_stem("landing/.hidden.csv"), "");
    }

    #[test]
    fn test_output_dir_name() {
        assert_eq!(
            output_dir_name("landing/orders.csv", "20240501_080309"),
            "orders_20240501_080309"
        );
    }
}

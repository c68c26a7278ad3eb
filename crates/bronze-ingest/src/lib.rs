//! Bronze Ingest Library
//!
//! Jobs that land raw data in the bronze tier of the lake.
//!
//! # Jobs
//!
//! - **Streaming** ([`streaming`]): Kafka transactions to Parquet partitioned
//!   by `transaction_type`, with an optional audit trail
//! - **Batch** ([`batch`]): CSV, JSON or Parquet files under a prefix, each
//!   converted to its own Parquet directory
//!
//! # Example
//!
//! ```no_run
//! use bronze_ingest::batch::{BatchConverter, FileFormat};
//! use bronze_ingest::storage::{LocalStore, Location};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let target = Location::new(Arc::new(LocalStore::new("./data/bronze")), "files");
//!     let converter = BatchConverter::new(
//!         Arc::new(LocalStore::new("./data/landing")),
//!         "incoming/",
//!         target,
//!         FileFormat::Csv,
//!     );
//!     let report = converter.run().await?;
//!     println!("converted {} files", report.files.len());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batch;
pub mod columnar;
pub mod config;
pub mod storage;
pub mod streaming;

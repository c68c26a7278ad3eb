//! Parquet encoding shared by both jobs
//!
//! Files are written whole into memory and handed to the object store in a
//! single `put`, which keeps S3 and local writes atomic per file.

use anyhow::{Context, Result};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

/// Suffix used for every data file we produce
pub const PARQUET_SUFFIX: &str = ".snappy.parquet";

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Encode `batches` (all sharing `schema`) as one snappy-compressed Parquet file.
///
/// An empty slice still produces a valid file carrying the schema.
pub fn encode_parquet(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Bytes> {
    let mut buffer = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(writer_properties()))
            .context("create ArrowWriter")?;
        for batch in batches {
            writer.write(batch).context("write batch to parquet")?;
        }
        writer.close().context("close ArrowWriter")?;
    }
    Ok(Bytes::from(buffer))
}

/// Decode a whole Parquet file held in memory
pub fn decode_parquet(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(data).context("open ParquetRecordBatchReader")?;
    let schema = builder.schema().clone();
    let reader = builder.build().context("build ParquetRecordBatchReader")?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read parquet batches")?;
    Ok((schema, batches))
}

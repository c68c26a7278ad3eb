//! Decoding of source files into Arrow batches

use anyhow::{Context, Result};
use arrow::csv::reader::Format;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;

use super::format::FileFormat;
use crate::columnar::decode_parquet;

/// Decode a whole source file, inferring the schema for text formats
pub fn read_file(format: FileFormat, data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    match format {
        FileFormat::Csv => read_csv(data),
        FileFormat::Json => read_json(data),
        FileFormat::Parquet => decode_parquet(data),
    }
}

fn csv_format() -> Format {
    Format::default().with_header(true)
}

fn read_csv(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let (schema, _) = csv_format()
        .infer_schema(Cursor::new(data.clone()), None)
        .context("infer CSV schema")?;
    let schema = Arc::new(schema);

    let reader = arrow::csv::ReaderBuilder::new(schema.clone())
        .with_format(csv_format())
        .build(Cursor::new(data))
        .context("open CSV reader")?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read CSV rows")?;
    Ok((schema, batches))
}

/// JSON lines: one object per line
fn read_json(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let (schema, _) = arrow::json::reader::infer_json_schema(Cursor::new(data.clone()), None)
        .context("infer JSON schema")?;
    let schema = Arc::new(schema);

    let reader = arrow::json::ReaderBuilder::new(schema.clone())
        .build(Cursor::new(data))
        .context("open JSON reader")?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read JSON rows")?;
    Ok((schema, batches))
}

//! Provenance columns stamped onto converted files

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

pub const SOURCE_FILE_COLUMN: &str = "source_file";
pub const INGESTION_TIMESTAMP_COLUMN: &str = "ingestion_timestamp";

/// Append `source_file` and `ingestion_timestamp` to every batch.
///
/// Source columns with either name are replaced.
pub fn add_provenance(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    source_file: &str,
    ingestion_timestamp: &str,
) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let kept: Vec<usize> = schema
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name() != SOURCE_FILE_COLUMN && f.name() != INGESTION_TIMESTAMP_COLUMN)
        .map(|(i, _)| i)
        .collect();

    let mut fields: Vec<Field> = kept.iter().map(|&i| schema.field(i).clone()).collect();
    fields.push(Field::new(SOURCE_FILE_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(INGESTION_TIMESTAMP_COLUMN, DataType::Utf8, false));
    let enriched_schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));

    let batches = batches
        .iter()
        .map(|batch| {
            let rows = batch.num_rows();
            let mut columns: Vec<ArrayRef> = kept.iter().map(|&i| batch.column(i).clone()).collect();
            columns.push(Arc::new(StringArray::from(vec![source_file; rows])));
            columns.push(Arc::new(StringArray::from(vec![ingestion_timestamp; rows])));
            RecordBatch::try_new(enriched_schema.clone(), columns)
                .context("append provenance columns")
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((enriched_schema, batches))
}

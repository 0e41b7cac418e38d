//! Columnar file support: JSON rows in and out of parquet.
//!
//! Rows must be JSON objects; the schema is inferred from the rows being
//! written. Writes flush a row group every [`FLUSH_ROWS`] rows.

use anyhow::{bail, Context, Result};
use arrow::datatypes::Schema;
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::{LineDelimitedWriter, ReaderBuilder};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Row-group flush threshold for columnar writers.
pub const FLUSH_ROWS: usize = 10_000;

/// Read every row of a parquet file as a JSON object.
pub fn read_rows(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("read parquet metadata of {}", path.display()))?
        .build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut buf = Vec::new();
        {
            let mut w = LineDelimitedWriter::new(&mut buf);
            w.write_batches(&[&batch])?;
            w.finish()?;
        }
        for line in String::from_utf8_lossy(&buf).lines() {
            if line.is_empty() {
                continue;
            }
            out.push(serde_json::from_str(line).with_context(|| {
                format!("decode parquet row from {}", path.display())
            })?);
        }
    }
    Ok(out)
}

/// Write `rows` as one parquet file into `w`, inferring the schema from the
/// rows themselves. An empty slice produces a valid file with no row groups.
pub fn write_rows<W: Write + Send>(w: W, rows: &[Value]) -> Result<()> {
    for row in rows {
        if !row.is_object() {
            bail!("columnar output requires object rows, got {row}");
        }
    }
    let schema = if rows.is_empty() {
        Arc::new(Schema::empty())
    } else {
        Arc::new(
            infer_json_schema_from_iterator(rows.iter().cloned().map(Ok))
                .context("infer columnar schema")?,
        )
    };

    let mut writer =
        ArrowWriter::try_new(w, schema.clone(), None).context("open columnar writer")?;
    for chunk in rows.chunks(FLUSH_ROWS) {
        let mut decoder = ReaderBuilder::new(schema.clone()).build_decoder()?;
        decoder.serialize(chunk)?;
        if let Some(batch) = decoder.flush()? {
            writer.write(&batch)?;
        }
    }
    writer.close().context("close columnar writer")?;
    Ok(())
}

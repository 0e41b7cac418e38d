//! Source splitting and per-partition readers.
//!
//! Splitting decides how a source becomes partitions (byte ranges for text
//! files, item ranges for in-memory data, one partition per listed object);
//! opening turns one partition's metadata back into an element iterator on a
//! worker. Listing and stat failures surface here, which fails partition
//! realization and therefore the job.

use crate::graph::DatasetId;
use crate::io::glob::{expand_glob, list_dir};
use crate::io::lines::{byte_ranges, split_lines, RangeLines};
use crate::ops::SourceKind;
use crate::partition::PartitionMeta;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use serde_json::{json, Value};
use std::fs::File;
use std::path::{Path, PathBuf};

pub type SourceIter = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Split a source into its partition set.
pub fn split(kind: &SourceKind, dataset: DatasetId) -> Result<Vec<PartitionMeta>> {
    match kind {
        SourceKind::Items { data, partitions } => {
            let n = (*partitions).max(1);
            Ok((0..n)
                .map(|i| {
                    let lo = i * data.len() / n;
                    let hi = (i + 1) * data.len() / n;
                    let mut meta = PartitionMeta::root(dataset, i);
                    meta.item_range = Some((lo, hi));
                    meta
                })
                .collect())
        }
        SourceKind::Range {
            start,
            end,
            step,
            partitions,
        } => {
            if *step == 0 {
                bail!("range step must be non-zero");
            }
            let total = range_len(*start, *end, *step);
            let n = (*partitions).max(1);
            Ok((0..n)
                .map(|i| {
                    let lo = i * total / n;
                    let hi = (i + 1) * total / n;
                    let mut meta = PartitionMeta::root(dataset, i);
                    meta.item_range = Some((lo, hi));
                    meta
                })
                .collect())
        }
        SourceKind::TextFile { path, partitions } => {
            let len = std::fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            Ok(byte_ranges(len, (*partitions).max(1))
                .into_iter()
                .enumerate()
                .map(|(i, range)| {
                    let mut meta = PartitionMeta::root(dataset, i);
                    meta.path = Some(path.clone());
                    meta.byte_range = Some(range);
                    meta
                })
                .collect())
        }
        SourceKind::GzipFile { path } | SourceKind::ParquetFile { path } => {
            std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
            let mut meta = PartitionMeta::root(dataset, 0);
            meta.path = Some(path.clone());
            Ok(vec![meta])
        }
        SourceKind::Files { pattern, max_files } => {
            let listed = list_pattern(pattern)?;
            Ok(capped(listed, *max_files)
                .into_iter()
                .enumerate()
                .map(|(i, path)| {
                    let mut meta = PartitionMeta::root(dataset, i);
                    meta.path = Some(path);
                    meta
                })
                .collect())
        }
        SourceKind::Objects {
            store,
            bucket,
            prefix,
            max_files,
        } => {
            let entries = store
                .list(bucket, prefix)
                .with_context(|| format!("list objects under {bucket}/{prefix}"))?;
            Ok(capped(entries, *max_files)
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    let mut meta = PartitionMeta::root(dataset, i);
                    meta.path = Some(PathBuf::from(entry.key));
                    meta.preferred_host = entry.host;
                    meta
                })
                .collect())
        }
    }
}

/// Open one partition of a source as an element iterator.
pub fn open(kind: &SourceKind, meta: &PartitionMeta) -> Result<SourceIter> {
    match kind {
        SourceKind::Items { data, .. } => {
            let (lo, hi) = meta.item_range.unwrap_or((0, data.len()));
            let slice: Vec<Value> = data[lo..hi].to_vec();
            Ok(Box::new(slice.into_iter().map(Ok)))
        }
        SourceKind::Range { start, step, .. } => {
            let (lo, hi) = meta.item_range.unwrap_or((0, 0));
            let (start, step) = (*start, *step);
            Ok(Box::new(
                (lo..hi).map(move |i| Ok(json!(start + i as i64 * step))),
            ))
        }
        SourceKind::TextFile { path, .. } => {
            let (lo, hi) = meta
                .byte_range
                .context("text partition is missing its byte range")?;
            let lines = RangeLines::open(path, lo, hi)?;
            Ok(Box::new(lines.map(|l| l.map(Value::String))))
        }
        SourceKind::GzipFile { path } => {
            let file =
                File::open(path).with_context(|| format!("open {}", path.display()))?;
            let lines = split_lines(Box::new(GzDecoder::new(file)));
            Ok(Box::new(lines.map(|l| l.map(Value::String))))
        }
        SourceKind::ParquetFile { path } => {
            let rows = crate::io::parquet::read_rows(path)?;
            Ok(Box::new(rows.into_iter().map(Ok)))
        }
        SourceKind::Files { .. } => {
            let path = meta
                .path
                .as_ref()
                .context("file partition is missing its path")?;
            let len = std::fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            let lines = RangeLines::open(path, 0, len)?;
            Ok(Box::new(lines.map(|l| l.map(Value::String))))
        }
        SourceKind::Objects { store, bucket, .. } => {
            let key = meta
                .path
                .as_ref()
                .context("object partition is missing its key")?
                .to_string_lossy()
                .into_owned();
            let bytes = store
                .get(bucket, &key)
                .with_context(|| format!("fetch object {bucket}/{key}"))?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let lines: Vec<Value> = text.lines().map(|l| Value::String(l.to_string())).collect();
            Ok(Box::new(lines.into_iter().map(Ok)))
        }
    }
}

fn range_len(start: i64, end: i64, step: i64) -> usize {
    if step > 0 && end > start {
        ((end - start + step - 1) / step) as usize
    } else if step < 0 && end < start {
        ((start - end + (-step) - 1) / (-step)) as usize
    } else {
        0
    }
}

fn list_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let as_path = Path::new(pattern);
    if as_path.is_dir() {
        list_dir(as_path)
    } else {
        expand_glob(pattern)
    }
}

fn capped<T>(mut items: Vec<T>, max: Option<usize>) -> Vec<T> {
    if let Some(max) = max {
        items.truncate(max);
    }
    items
}

//! The operator catalog: every dataset node carries one of these variants.
//!
//! Narrow operators expose a pure batch transform and fuse into the
//! per-partition pipeline; wide operators own a shuffle-write step on the map
//! side and a read-and-aggregate step on the reduce side. Operator payloads
//! hold the user function by reference plus a serializable `args` value for
//! its free variables — payloads never capture ambient environment, so they
//! can cross the worker boundary as-is.

use crate::partitioner::Partitioner;
use crate::runtime::ObjectStore;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// `(element, args) -> element`
pub type MapFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;
/// `(element, args) -> elements`
pub type FlatMapFn = Arc<dyn Fn(&Value, &Value) -> Vec<Value> + Send + Sync>;
/// `(element, args) -> keep?`
pub type FilterFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
/// `(accumulator, element, args) -> accumulator`
pub type ReduceFn = Arc<dyn Fn(Value, &Value, &Value) -> Value + Send + Sync>;
/// `(accumulator, accumulator, args) -> accumulator`
pub type CombineFn = Arc<dyn Fn(Value, Value, &Value) -> Value + Send + Sync>;
/// `(element, args) -> ()`, used by `for_each`.
pub type EachFn = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Data-producing leaves of the graph.
#[derive(Clone)]
pub enum SourceKind {
    /// Index-driven in-memory source (`parallelize`).
    Items {
        data: Arc<Vec<Value>>,
        partitions: usize,
    },
    /// Numeric range source.
    Range {
        start: i64,
        end: i64,
        step: i64,
        partitions: usize,
    },
    /// Local text file split into newline-aligned byte ranges.
    TextFile { path: PathBuf, partitions: usize },
    /// Single-partition gzip-compressed text file.
    GzipFile { path: PathBuf },
    /// Single-partition columnar file.
    ParquetFile { path: PathBuf },
    /// One partition per file in a directory or glob match.
    Files {
        pattern: String,
        max_files: Option<usize>,
    },
    /// One partition per listed object behind the object-store port.
    Objects {
        store: Arc<dyn ObjectStore>,
        bucket: String,
        prefix: String,
        max_files: Option<usize>,
    },
}

#[derive(Clone)]
pub enum OpKind {
    Source(SourceKind),

    // narrow
    Map { f: MapFn, args: Value },
    FlatMap { f: FlatMapFn, args: Value },
    MapValues { f: MapFn, args: Value },
    FlatMapValues { f: FlatMapFn, args: Value },
    Filter { f: FilterFn, args: Value },
    Sample {
        with_replacement: bool,
        fraction: f64,
        seed: u32,
    },
    Union,

    // wide
    AggregateByKey {
        reducer: ReduceFn,
        combiner: CombineFn,
        init: Value,
        args: Value,
        width: Option<usize>,
        /// Two-parent grouping with side-tagged map records.
        cogroup: bool,
    },
    SortBy {
        key: MapFn,
        args: Value,
        ascending: bool,
        width: Option<usize>,
    },
    PartitionBy { partitioner: Partitioner },
    Cartesian,
}

impl OpKind {
    pub fn is_source(&self) -> bool {
        matches!(self, OpKind::Source(_))
    }

    pub fn is_wide(&self) -> bool {
        matches!(
            self,
            OpKind::AggregateByKey { .. }
                | OpKind::SortBy { .. }
                | OpKind::PartitionBy { .. }
                | OpKind::Cartesian
        )
    }

    pub fn is_narrow(&self) -> bool {
        !self.is_source() && !self.is_wide()
    }

    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Source(SourceKind::Items { .. }) => "items",
            OpKind::Source(SourceKind::Range { .. }) => "range",
            OpKind::Source(SourceKind::TextFile { .. }) => "text-file",
            OpKind::Source(SourceKind::GzipFile { .. }) => "gzip-file",
            OpKind::Source(SourceKind::ParquetFile { .. }) => "parquet-file",
            OpKind::Source(SourceKind::Files { .. }) => "files",
            OpKind::Source(SourceKind::Objects { .. }) => "objects",
            OpKind::Map { .. } => "map",
            OpKind::FlatMap { .. } => "flat-map",
            OpKind::MapValues { .. } => "map-values",
            OpKind::FlatMapValues { .. } => "flat-map-values",
            OpKind::Filter { .. } => "filter",
            OpKind::Sample { .. } => "sample",
            OpKind::Union => "union",
            OpKind::AggregateByKey { cogroup: false, .. } => "aggregate-by-key",
            OpKind::AggregateByKey { cogroup: true, .. } => "co-group",
            OpKind::SortBy { .. } => "sort-by",
            OpKind::PartitionBy { .. } => "partition-by",
            OpKind::Cartesian => "cartesian",
        }
    }
}

/// Split a keyed element `[key, value]` into its halves.
pub fn split_pair(v: &Value) -> anyhow::Result<(&Value, &Value)> {
    match v.as_array() {
        Some(pair) if pair.len() == 2 => Ok((&pair[0], &pair[1])),
        _ => anyhow::bail!("expected a [key, value] pair, got {v}"),
    }
}

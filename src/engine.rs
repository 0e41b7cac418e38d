//! The engine: shared dataset graph, runtime port, and source constructors.

use crate::dataset::Dataset;
use crate::graph::Graph;
use crate::ops::{OpKind, SourceKind};
use crate::runtime::{EngineConfig, FnRegistry, LocalRuntime, ObjectStore, Runtime};
use anyhow::{bail, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Entry point for building and running dataset graphs.
///
/// An engine owns the graph, the function registry, and a handle to the
/// runtime that executes tasks. Clones share all of it, so datasets can be
/// built from any clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) graph: Graph,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) registry: FnRegistry,
    job_seq: Arc<AtomicU64>,
}

impl Engine {
    /// Run against an externally supplied runtime.
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            graph: Graph::default(),
            runtime,
            registry: FnRegistry::with_builtins(),
            job_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spin up an in-process runtime and run against it.
    pub fn local(config: EngineConfig) -> Result<Self> {
        let runtime: Arc<dyn Runtime> = LocalRuntime::spawn(&config)?;
        Ok(Self::new(runtime))
    }

    pub fn registry(&self) -> &FnRegistry {
        &self.registry
    }

    pub(crate) fn next_job(&self) -> u64 {
        self.job_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn add_source(&self, kind: SourceKind) -> Dataset {
        Dataset::wrap(self, self.graph.insert(vec![], OpKind::Source(kind)))
    }

    /// Distribute an in-memory collection over `partitions` slices,
    /// preserving element order across the partition sequence.
    pub fn parallelize(&self, data: Vec<Value>, partitions: usize) -> Result<Dataset> {
        if partitions == 0 {
            bail!("parallelize needs at least one partition");
        }
        Ok(self.add_source(SourceKind::Items {
            data: Arc::new(data),
            partitions,
        }))
    }

    /// Numeric range `[start, end)` with the given stride.
    pub fn range(&self, start: i64, end: i64, step: i64, partitions: usize) -> Result<Dataset> {
        if step == 0 {
            bail!("range step must be non-zero");
        }
        if partitions == 0 {
            bail!("range needs at least one partition");
        }
        Ok(self.add_source(SourceKind::Range {
            start,
            end,
            step,
            partitions,
        }))
    }

    /// A local text file split into `partitions` newline-aligned byte ranges,
    /// one line per element.
    pub fn text_file(&self, path: impl AsRef<Path>, partitions: usize) -> Result<Dataset> {
        if partitions == 0 {
            bail!("text_file needs at least one partition");
        }
        Ok(self.add_source(SourceKind::TextFile {
            path: path.as_ref().to_path_buf(),
            partitions,
        }))
    }

    /// A gzip-compressed text file as a single partition of lines.
    pub fn gzip_file(&self, path: impl AsRef<Path>) -> Dataset {
        self.add_source(SourceKind::GzipFile {
            path: path.as_ref().to_path_buf(),
        })
    }

    /// A columnar file as a single partition of object rows.
    pub fn parquet_file(&self, path: impl AsRef<Path>) -> Dataset {
        self.add_source(SourceKind::ParquetFile {
            path: path.as_ref().to_path_buf(),
        })
    }

    /// One partition per file under a directory or glob pattern, each
    /// partition yielding its file's lines.
    pub fn files(&self, pattern: &str, max_files: Option<usize>) -> Dataset {
        self.add_source(SourceKind::Files {
            pattern: pattern.to_string(),
            max_files,
        })
    }

    /// One partition per object listed under `scheme://bucket/prefix`
    /// through the given object store.
    pub fn objects(
        &self,
        store: Arc<dyn ObjectStore>,
        uri: &str,
        max_files: Option<usize>,
    ) -> Result<Dataset> {
        let Some((_, bucket, prefix)) = crate::runtime::parse_object_uri(uri) else {
            bail!("not an object-store uri: {uri}");
        };
        Ok(self.add_source(SourceKind::Objects {
            store,
            bucket,
            prefix,
            max_files,
        }))
    }
}

//! Shuffle I/O: map-side spill files and reduce-side read-and-aggregate.
//!
//! Each map task writes one newline-delimited JSON file per non-empty output
//! partition under `{scratch}/shuffle/{uuid}`, buffered and flushed at
//! [`FLUSH_BYTES`]. The `{host, path, size}` descriptor of every file is
//! handed back to the driver, which registers it with the wide dataset.
//! Reduce tasks stream the files registered for their own partition id, in
//! upstream-partition order, through the byte-stream port.

use crate::canon;
use crate::ops::{split_pair, OpKind};
use crate::partitioner::Partitioner;
use crate::pipeline::Sink;
use crate::runtime::StreamPort;
use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

/// Spill buffer flush threshold.
pub const FLUSH_BYTES: usize = 64 * 1024;

/// Location of one shuffle file: which worker wrote it, where, how big.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub host: String,
    pub path: PathBuf,
    pub size: u64,
}

/// One buffered spill file, created lazily on first record.
struct SpillFile {
    path: PathBuf,
    file: Option<File>,
    buf: Vec<u8>,
    written: u64,
    host: String,
}

impl SpillFile {
    fn new(dir: &PathBuf, host: &str) -> Self {
        Self {
            path: dir.join(Uuid::new_v4().to_string()),
            file: None,
            buf: Vec::new(),
            written: 0,
            host: host.to_string(),
        }
    }

    fn push_record(&mut self, record: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.buf, record)?;
        self.buf.push(b'\n');
        if self.buf.len() >= FLUSH_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .with_context(|| format!("create spill file {}", self.path.display()))?,
            );
        }
        let file = self.file.as_mut().unwrap();
        file.write_all(&self.buf)
            .with_context(|| format!("write spill file {}", self.path.display()))?;
        self.written += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    fn close(mut self) -> Result<Option<FileDescriptor>> {
        self.flush()?;
        match self.file.take() {
            None => Ok(None),
            Some(file) => {
                file.sync_data().ok();
                Ok(Some(FileDescriptor {
                    host: self.host,
                    path: self.path,
                    size: self.written,
                }))
            }
        }
    }
}

enum MapSide {
    /// Keyed aggregation: `out-pid -> canonical key -> (raw key, acc)`.
    /// BTreeMap keeps record order deterministic for downstream combiners.
    Aggregate {
        buckets: Vec<BTreeMap<String, (Value, Value)>>,
        cogroup_side: Option<usize>,
    },
    /// Raw records routed to per-partition files (sort / partition_by).
    Buckets { files: Vec<SpillFile> },
    /// Everything into one file (cartesian).
    Single { file: SpillFile },
}

/// Map-side sink for one wide operator.
pub struct ShuffleWriter {
    op: OpKind,
    partitioner: Option<Partitioner>,
    side: MapSide,
    dir: PathBuf,
    host: String,
}

impl ShuffleWriter {
    pub fn new(
        op: OpKind,
        side: Option<usize>,
        out_partitions: usize,
        partitioner: Option<Partitioner>,
        scratch: &PathBuf,
        host: &str,
    ) -> Result<Self> {
        let dir = scratch.join("shuffle");
        create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let map_side = match &op {
            OpKind::AggregateByKey { cogroup, .. } => MapSide::Aggregate {
                buckets: (0..out_partitions).map(|_| BTreeMap::new()).collect(),
                cogroup_side: if *cogroup { Some(side.unwrap_or(0)) } else { None },
            },
            OpKind::SortBy { .. } | OpKind::PartitionBy { .. } => MapSide::Buckets {
                files: (0..out_partitions).map(|_| SpillFile::new(&dir, host)).collect(),
            },
            OpKind::Cartesian => MapSide::Single {
                file: SpillFile::new(&dir, host),
            },
            other => bail!("not a shuffle operator: {}", other.label()),
        };
        Ok(Self {
            op,
            partitioner,
            side: map_side,
            dir,
            host: host.to_string(),
        })
    }

}

fn route(partitioner: &Option<Partitioner>, key: &Value) -> Result<usize> {
    match partitioner {
        Some(p) => Ok(p.index_of(key)),
        None => bail!("shuffle writer has no partitioner"),
    }
}

impl Sink for ShuffleWriter {
    fn push(&mut self, elem: Value) -> Result<()> {
        match (&mut self.side, &self.op) {
            (
                MapSide::Aggregate { buckets, .. },
                OpKind::AggregateByKey {
                    reducer, init, args, ..
                },
            ) => {
                let (key, value) = split_pair(&elem)?;
                let pid = route(&self.partitioner, key)?;
                let slot = buckets[pid]
                    .entry(canon::encode(key))
                    .or_insert_with(|| (key.clone(), init.clone()));
                let acc = std::mem::replace(&mut slot.1, Value::Null);
                slot.1 = reducer(acc, value, args);
            }
            (MapSide::Buckets { files }, OpKind::SortBy { key, args, .. }) => {
                let k = key(&elem, args);
                let pid = route(&self.partitioner, &k)?;
                files[pid].push_record(&elem)?;
            }
            (MapSide::Buckets { files }, OpKind::PartitionBy { .. }) => {
                let (key, _) = split_pair(&elem)?;
                let pid = route(&self.partitioner, key)?;
                files[pid].push_record(&elem)?;
            }
            (MapSide::Single { file }, OpKind::Cartesian) => {
                file.push_record(&elem)?;
            }
            _ => bail!("shuffle writer state does not match its operator"),
        }
        Ok(())
    }

    /// Spill buffered state and return one descriptor slot per output
    /// partition (a single slot for cartesian); empty buckets yield `None`.
    fn finish(self: Box<Self>) -> Result<Value> {
        let writer = *self;
        let descriptors: Vec<Option<FileDescriptor>> = match writer.side {
            MapSide::Aggregate {
                buckets,
                cogroup_side,
            } => {
                let mut out = Vec::with_capacity(buckets.len());
                for bucket in buckets {
                    let mut file = SpillFile::new(&writer.dir, &writer.host);
                    for (_, (key, acc)) in bucket {
                        let record = match cogroup_side {
                            None => json!([key, acc]),
                            Some(0) => json!([key, [acc, []]]),
                            Some(_) => json!([key, [[], acc]]),
                        };
                        file.push_record(&record)?;
                    }
                    out.push(file.close()?);
                }
                out
            }
            MapSide::Buckets { files } => files
                .into_iter()
                .map(SpillFile::close)
                .collect::<Result<_>>()?,
            MapSide::Single { file } => vec![file.close()?],
        };
        debug!(
            "shuffle spill: {} of {} output slots written",
            descriptors.iter().filter(|d| d.is_some()).count(),
            descriptors.len()
        );
        Ok(serde_json::to_value(descriptors)?)
    }
}

/// What a reduce-side task reads: the wide operator, its own partition id,
/// and the upstream files registered for that partition (cartesian carries
/// the right-parent files separately).
#[derive(Clone)]
pub struct ShuffleRead {
    pub op: OpKind,
    pub pid: usize,
    pub files: Vec<FileDescriptor>,
    pub right_files: Vec<FileDescriptor>,
}

/// Stream the registered files in upstream order and apply the operator's
/// reduce-side step, producing the rows the downstream chain iterates.
pub fn read(read: &ShuffleRead, streams: &dyn StreamPort) -> Result<Vec<Value>> {
    match &read.op {
        OpKind::AggregateByKey { combiner, args, .. } => {
            let mut accs: BTreeMap<String, (Value, Value)> = BTreeMap::new();
            for desc in &read.files {
                for record in records_of(desc, streams)? {
                    let record = record?;
                    let (key, contributed) = split_pair(&record)?;
                    match accs.entry(canon::encode(key)) {
                        std::collections::btree_map::Entry::Vacant(slot) => {
                            slot.insert((key.clone(), contributed.clone()));
                        }
                        std::collections::btree_map::Entry::Occupied(mut slot) => {
                            let acc = std::mem::replace(&mut slot.get_mut().1, Value::Null);
                            slot.get_mut().1 = combiner(acc, contributed.clone(), args);
                        }
                    }
                }
            }
            Ok(accs
                .into_values()
                .map(|(key, acc)| json!([key, acc]))
                .collect())
        }
        OpKind::SortBy {
            key,
            args,
            ascending,
            ..
        } => {
            let mut rows: Vec<(Value, Value)> = Vec::new();
            for desc in &read.files {
                for record in records_of(desc, streams)? {
                    let record = record?;
                    rows.push((key(&record, args), record));
                }
            }
            rows.sort_by(|a, b| {
                let ord = canon::value_cmp(&a.0, &b.0);
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
            Ok(rows.into_iter().map(|(_, r)| r).collect())
        }
        OpKind::PartitionBy { .. } => {
            let mut rows = Vec::new();
            for desc in &read.files {
                for record in records_of(desc, streams)? {
                    rows.push(record?);
                }
            }
            Ok(rows)
        }
        OpKind::Cartesian => {
            let mut left = Vec::new();
            for desc in &read.files {
                for record in records_of(desc, streams)? {
                    left.push(record?);
                }
            }
            let mut right = Vec::new();
            for desc in &read.right_files {
                for record in records_of(desc, streams)? {
                    right.push(record?);
                }
            }
            let mut out = Vec::with_capacity(left.len() * right.len());
            for a in &left {
                for b in &right {
                    out.push(json!([a, b]));
                }
            }
            Ok(out)
        }
        other => bail!("not a shuffle operator: {}", other.label()),
    }
}

fn records_of(
    desc: &FileDescriptor,
    streams: &dyn StreamPort,
) -> Result<impl Iterator<Item = Result<Value>>> {
    let stream = streams
        .read_stream(desc)
        .with_context(|| format!("fetch shuffle file {}", desc.path.display()))?;
    Ok(crate::io::lines::split_lines(stream)
        .map(|line| line.and_then(|l| serde_json::from_str(&l).map_err(Into::into))))
}

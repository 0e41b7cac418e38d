//! Worker-side task execution.
//!
//! A worker drains its mailbox one task at a time: resolve the stage head
//! (source partition, shuffle read, or a live persisted buffer), fuse the
//! narrow chain over it, and feed the configured sink. Everything a task
//! needs travels inside the task record; workers never see the graph.

use crate::ops::ReduceFn;
use crate::partition::WorkerStore;
use crate::pipeline::{Executor, Sink, StepKind};
use crate::planner::{SinkSpec, Task, TaskHead};
use crate::runtime::{parse_object_uri, ObjectStore, StreamPort, TaskCallback};
use crate::shuffle::{FileDescriptor, ShuffleWriter};
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use uuid::Uuid;

pub(crate) struct WorkerState {
    pub id: usize,
    pub host: String,
    pub scratch: PathBuf,
    pub store: WorkerStore,
    pub streams: Arc<dyn StreamPort>,
    pub object_stores: HashMap<String, Arc<dyn ObjectStore>>,
}

pub(crate) fn worker_main(mut state: WorkerState, rx: mpsc::Receiver<(Task, TaskCallback)>) {
    for (task, done) in rx {
        // a panicking user function must not take the mailbox down with it;
        // the driver sees it as a failed task
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execute(&mut state, task)
        }))
        .unwrap_or_else(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            Err(anyhow::anyhow!("task panicked: {msg}"))
        });
        done(result);
    }
}

fn execute(state: &mut WorkerState, task: Task) -> Result<Value> {
    debug!(
        "worker {}: stage {} partition {} ({} chain step(s))",
        state.id,
        task.stage,
        task.pid,
        task.chain.len()
    );

    // Start from the topmost persisted buffer that is already materialized;
    // everything below it recomputes only on a miss.
    let mut start_at = 0usize;
    let mut head_rows: Option<Vec<Value>> = None;
    for (i, step) in task.chain.iter().enumerate().rev() {
        if let StepKind::Persist(ds) = &step.kind {
            if let Some(rows) = state.store.ready_rows((*ds, step.pid)) {
                head_rows = Some(rows.to_vec());
                start_at = i + 1;
                break;
            }
        }
    }

    let chain = task.chain[start_at..].to_vec();
    let mut executor = Executor::prepare(&chain, task.job, &mut state.store)?;
    let mut sink = make_sink(state, &task)?;

    match head_rows {
        Some(rows) => {
            for elem in rows {
                executor.feed(elem, &mut state.store, sink.as_mut())?;
            }
        }
        None => match &task.head {
            TaskHead::Source { kind, meta } => {
                for elem in crate::source::open(kind, meta)? {
                    executor.feed(elem?, &mut state.store, sink.as_mut())?;
                }
            }
            TaskHead::Shuffle(read) => {
                for elem in crate::shuffle::read(read, state.streams.as_ref())? {
                    executor.feed(elem, &mut state.store, sink.as_mut())?;
                }
            }
        },
    }

    executor.finish(&mut state.store);
    sink.finish()
}

fn make_sink(state: &WorkerState, task: &Task) -> Result<Box<dyn Sink>> {
    Ok(match &task.sink {
        SinkSpec::ShuffleWrite {
            op,
            out_partitions,
            partitioner,
            side,
        } => Box::new(ShuffleWriter::new(
            op.clone(),
            *side,
            *out_partitions,
            partitioner.clone(),
            &state.scratch,
            &state.host,
        )?),
        SinkSpec::Reduce {
            reducer,
            init,
            args,
        } => Box::new(AccSink {
            acc: init.clone(),
            reducer: reducer.clone(),
            args: args.clone(),
        }),
        SinkSpec::Save {
            dest,
            gzip,
            parquet,
        } => Box::new(SaveSink {
            rows: Vec::new(),
            dest: dest.clone(),
            gzip: *gzip,
            parquet: *parquet,
            pid: task.pid,
            stores: state.object_stores.clone(),
        }),
        SinkSpec::Spill { gzip } => Box::new(SpillSink {
            rows: Vec::new(),
            gzip: *gzip,
            dir: state.scratch.join("stream"),
            host: state.host.clone(),
        }),
    })
}

/// Folds pipeline output into the action's accumulator.
struct AccSink {
    acc: Value,
    reducer: ReduceFn,
    args: Value,
}

impl Sink for AccSink {
    fn push(&mut self, elem: Value) -> Result<()> {
        let acc = std::mem::replace(&mut self.acc, Value::Null);
        self.acc = (self.reducer)(acc, &elem, &self.args);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Value> {
        Ok(self.acc)
    }
}

/// Writes the partition to its own export file, locally or through an
/// object store.
struct SaveSink {
    rows: Vec<Value>,
    dest: String,
    gzip: bool,
    parquet: bool,
    pid: usize,
    stores: HashMap<String, Arc<dyn ObjectStore>>,
}

impl SaveSink {
    fn encode(&self) -> Result<Vec<u8>> {
        if self.parquet {
            let mut buf = Vec::new();
            crate::io::parquet::write_rows(&mut buf, &self.rows)?;
            return Ok(buf);
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            serde_json::to_writer(&mut lines, row)?;
            lines.push(b'\n');
        }
        if self.gzip {
            let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
            enc.write_all(&lines)?;
            Ok(enc.finish()?)
        } else {
            Ok(lines)
        }
    }

    fn file_name(&self) -> String {
        let ext = if self.parquet {
            "parquet"
        } else if self.gzip {
            "jsonl.gz"
        } else {
            "jsonl"
        };
        format!("part-{:05}.{ext}", self.pid)
    }
}

impl Sink for SaveSink {
    fn push(&mut self, elem: Value) -> Result<()> {
        self.rows.push(elem);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Value> {
        let bytes = self.encode()?;
        let name = self.file_name();
        let written = match parse_object_uri(&self.dest) {
            Some((scheme, bucket, prefix)) => {
                let store = self
                    .stores
                    .get(&scheme)
                    .with_context(|| format!("no object store bound for scheme '{scheme}'"))?;
                let key = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{name}", prefix.trim_end_matches('/'))
                };
                // the partition still completes on a failed upload; the
                // caller observes partial output
                if let Err(e) = store.put(&bucket, &key, &bytes) {
                    warn!("upload of {bucket}/{key} failed: {e:#}");
                }
                format!("{scheme}://{bucket}/{key}")
            }
            None => {
                let dir = PathBuf::from(
                    self.dest.strip_prefix("file://").unwrap_or(&self.dest),
                );
                create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
                let path = dir.join(&name);
                std::fs::write(&path, &bytes)
                    .with_context(|| format!("write {}", path.display()))?;
                path.display().to_string()
            }
        };
        Ok(json!({"path": written, "rows": self.rows.len()}))
    }
}

/// Spills the partition to worker scratch; the driver pipes the spill files
/// in partition order afterwards.
struct SpillSink {
    rows: Vec<Value>,
    gzip: bool,
    dir: PathBuf,
    host: String,
}

impl Sink for SpillSink {
    fn push(&mut self, elem: Value) -> Result<()> {
        self.rows.push(elem);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Value> {
        create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.dir.join(Uuid::new_v4().to_string());
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;

        let mut out: Box<dyn Write> = if self.gzip {
            Box::new(GzEncoder::new(file, Compression::fast()))
        } else {
            Box::new(file)
        };
        for row in &self.rows {
            serde_json::to_writer(&mut out, row)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        drop(out);

        let size = std::fs::metadata(&path)?.len();
        let desc = FileDescriptor {
            host: self.host,
            path,
            size,
        };
        Ok(json!({"file": serde_json::to_value(&desc)?, "rows": self.rows.len()}))
    }
}

//! Partition realization, stage cutting, and task records.
//!
//! A job walks the dataset graph once to realize partitions, then cuts it at
//! every wide (shuffle) dependency. Each wide node gets one map stage per
//! dependency whose tasks iterate the parent pipeline and spill into the
//! wide node's shuffle writer; the final result stage iterates the tail's
//! partitions into the action sink. Map-stage tasks are built just before
//! their stage dispatches, so shuffle reads always see the files registered
//! by the stages that ran before them.

use crate::dataset::Dataset;
use crate::engine::Engine;
use crate::graph::{DatasetId, ShuffleMeta};
use crate::ops::{MapFn, OpKind, ReduceFn, SourceKind};
use crate::partition::PartitionMeta;
use crate::partitioner::{Partitioner, RangePartitioner};
use crate::pipeline::{ChainStep, StepKind};
use crate::shuffle::ShuffleRead;
use anyhow::{bail, Context, Result};
use log::debug;
use serde_json::Value;
use std::sync::Arc;

/// Seed for the range partitioner's sampling sub-job.
const RANGE_INIT_SEED: u32 = 0x5eed;

/// One unit of work: a stage head, the fused narrow chain above it, and the
/// sink its output feeds.
#[derive(Clone)]
pub struct Task {
    pub job: u64,
    pub stage: u64,
    pub pid: usize,
    pub head: TaskHead,
    pub chain: Vec<ChainStep>,
    pub sink: SinkSpec,
    pub preferred_host: Option<String>,
}

#[derive(Clone)]
pub enum TaskHead {
    Source { kind: SourceKind, meta: PartitionMeta },
    Shuffle(ShuffleRead),
}

#[derive(Clone)]
pub enum SinkSpec {
    /// Map side of a wide operator.
    ShuffleWrite {
        op: OpKind,
        out_partitions: usize,
        partitioner: Option<Partitioner>,
        /// Dependency slot, distinguishing co-group / cartesian sides.
        side: Option<usize>,
    },
    /// Fold elements into the action's accumulator.
    Reduce {
        reducer: ReduceFn,
        init: Value,
        args: Value,
    },
    /// Write the partition to its own export file.
    Save {
        dest: String,
        gzip: bool,
        parquet: bool,
    },
    /// Spill the partition to worker scratch for later piping.
    Spill { gzip: bool },
}

/// Realize the partition set of `id`, memoized on the node.
pub fn partitions_of(engine: &Engine, id: DatasetId) -> Result<Arc<Vec<PartitionMeta>>> {
    if let Some(parts) = engine.graph.partitions(id) {
        return Ok(parts);
    }
    let op = engine.graph.op(id);
    let parents = engine.graph.parents(id);
    let metas: Vec<PartitionMeta> = match &op {
        OpKind::Source(kind) => crate::source::split(kind, id)?,
        OpKind::Union => {
            let mut out = Vec::new();
            for (slot, parent) in parents.iter().enumerate() {
                let parent_parts = partitions_of(engine, *parent)?;
                for j in 0..parent_parts.len() {
                    let mut meta = PartitionMeta::narrow(id, out.len(), slot, j);
                    meta.preferred_host = parent_parts[j].preferred_host.clone();
                    out.push(meta);
                }
            }
            out
        }
        op if op.is_narrow() => {
            let parent_parts = partitions_of(engine, parents[0])?;
            (0..parent_parts.len())
                .map(|i| {
                    let mut meta = PartitionMeta::narrow(id, i, 0, i);
                    meta.preferred_host = parent_parts[i].preferred_host.clone();
                    meta
                })
                .collect()
        }
        op => {
            let width = wide_width(engine, id, op, &parents)?;
            (0..width).map(|i| PartitionMeta::root(id, i)).collect()
        }
    };
    let metas = Arc::new(metas);
    engine.graph.set_partitions(id, Arc::clone(&metas));
    Ok(metas)
}

fn wide_width(engine: &Engine, _id: DatasetId, op: &OpKind, parents: &[DatasetId]) -> Result<usize> {
    Ok(match op {
        OpKind::AggregateByKey { width, .. } => match width {
            Some(w) => *w,
            None => {
                let mut widest = 0;
                for parent in parents {
                    widest = widest.max(partitions_of(engine, *parent)?.len());
                }
                widest.max(1)
            }
        },
        OpKind::SortBy { width, .. } => match width {
            Some(w) => *w,
            None => partitions_of(engine, parents[0])?.len().max(1),
        },
        OpKind::PartitionBy { partitioner } => partitioner.partitions(),
        OpKind::Cartesian => {
            let left = partitions_of(engine, parents[0])?.len();
            let right = partitions_of(engine, parents[1])?.len();
            left * right
        }
        other => bail!("{} has no shuffle width", other.label()),
    })
}

/// Resolve the partitioner of a keyed dataset, memoized on the node. Range
/// partitioners run their sampling sub-job here, which recurses into the
/// ordinary driver.
pub fn partitioner_of(engine: &Engine, id: DatasetId) -> Result<Option<Partitioner>> {
    if let Some(p) = engine.graph.partitioner(id) {
        return Ok(Some(p));
    }
    let op = engine.graph.op(id);
    let parents = engine.graph.parents(id);
    let resolved = match &op {
        OpKind::AggregateByKey { .. } => {
            Some(Partitioner::hash(partitions_of(engine, id)?.len()))
        }
        OpKind::PartitionBy { partitioner } => Some(partitioner.clone()),
        OpKind::SortBy {
            key,
            args,
            ascending,
            ..
        } => Some(range_init(
            engine,
            parents[0],
            key,
            args,
            partitions_of(engine, id)?.len(),
            *ascending,
        )?),
        // key-preserving narrow transforms keep their parent's routing
        OpKind::MapValues { .. }
        | OpKind::FlatMapValues { .. }
        | OpKind::Filter { .. }
        | OpKind::Sample { .. } => partitioner_of(engine, parents[0])?,
        _ => None,
    };
    if let Some(p) = &resolved {
        engine.graph.set_partitioner(id, p.clone());
    }
    Ok(resolved)
}

fn range_init(
    engine: &Engine,
    parent: DatasetId,
    key: &MapFn,
    args: &Value,
    width: usize,
    ascending: bool,
) -> Result<Partitioner> {
    debug!("initializing range partitioner over d{} ({width} bounds)", parent.raw());
    let sample = Dataset::wrap(engine, parent)
        .sample(false, 0.5, RANGE_INIT_SEED)
        .collect()
        .context("range partitioner sampling job")?;
    let keys: Vec<Value> = sample.iter().map(|row| key(row, args)).collect();
    Ok(Partitioner::Range(RangePartitioner::from_sample(
        keys, width, ascending,
    )))
}

/// Wide datasets reachable from `tail` that still need their map stages run
/// for this job, in ascending (topological) order. Realizes every reachable
/// partition set as a side effect.
pub fn schedule(engine: &Engine, tail: DatasetId, job: u64) -> Result<Vec<DatasetId>> {
    partitions_of(engine, tail)?;
    Ok(engine
        .graph
        .reachable(tail)
        .into_iter()
        .filter(|id| {
            engine.graph.op(*id).is_wide()
                && engine.graph.shuffle(*id).map_or(true, |s| s.job != job)
        })
        .collect())
}

/// Total number of upstream map tasks feeding `wide`, across dependencies.
pub fn upstream_total(engine: &Engine, wide: DatasetId) -> Result<usize> {
    let mut total = 0;
    for parent in engine.graph.parents(wide) {
        total += partitions_of(engine, parent)?.len();
    }
    Ok(total)
}

/// Offset of dependency `slot` into the upstream task numbering.
pub fn upstream_offset(engine: &Engine, wide: DatasetId, slot: usize) -> Result<usize> {
    let mut offset = 0;
    for parent in engine.graph.parents(wide).into_iter().take(slot) {
        offset += partitions_of(engine, parent)?.len();
    }
    Ok(offset)
}

/// Install the (empty) shuffle-output table for `wide` before its map stages
/// run: `files[out_pid][upstream_task]` for keyed shuffles, one slot per
/// upstream partition for cartesian.
pub fn reset_shuffle(engine: &Engine, wide: DatasetId, job: u64) -> Result<()> {
    let op = engine.graph.op(wide);
    let upstream = upstream_total(engine, wide)?;
    let rows = match op {
        OpKind::Cartesian => upstream,
        _ => partitions_of(engine, wide)?.len(),
    };
    let cols = match op {
        OpKind::Cartesian => 1,
        _ => upstream,
    };
    engine.graph.set_shuffle(
        wide,
        ShuffleMeta {
            job,
            files: vec![vec![None; cols]; rows],
        },
    );
    Ok(())
}

/// Build the map-stage tasks for one dependency of `wide`.
pub fn map_stage_tasks(
    engine: &Engine,
    wide: DatasetId,
    dep_slot: usize,
    job: u64,
    stage: u64,
) -> Result<Vec<Task>> {
    let op = engine.graph.op(wide);
    let dep = engine.graph.parents(wide)[dep_slot];
    let out_partitions = match op {
        OpKind::Cartesian => 1,
        _ => partitions_of(engine, wide)?.len(),
    };
    let partitioner = partitioner_of(engine, wide)?;
    let side = match op {
        OpKind::AggregateByKey { cogroup: true, .. } | OpKind::Cartesian => Some(dep_slot),
        _ => None,
    };
    let dep_parts = partitions_of(engine, dep)?;
    let mut tasks = Vec::with_capacity(dep_parts.len());
    for pid in 0..dep_parts.len() {
        let (head, chain, preferred_host) = build_chain(engine, dep, pid)?;
        tasks.push(Task {
            job,
            stage,
            pid,
            head,
            chain,
            sink: SinkSpec::ShuffleWrite {
                op: op.clone(),
                out_partitions,
                partitioner: partitioner.clone(),
                side,
            },
            preferred_host,
        });
    }
    Ok(tasks)
}

/// Build the result-stage tasks over the tail's partitions.
pub fn result_tasks(
    engine: &Engine,
    tail: DatasetId,
    job: u64,
    stage: u64,
    sink: &SinkSpec,
) -> Result<Vec<Task>> {
    let parts = partitions_of(engine, tail)?;
    let mut tasks = Vec::with_capacity(parts.len());
    for pid in 0..parts.len() {
        let (head, chain, preferred_host) = build_chain(engine, tail, pid)?;
        tasks.push(Task {
            job,
            stage,
            pid,
            head,
            chain,
            sink: sink.clone(),
            preferred_host,
        });
    }
    Ok(tasks)
}

/// Walk from `(ds, pid)` down through narrow parents to the stage head,
/// collecting the fused chain. Union contributes no step but remaps the
/// partition index; persistent nodes contribute a persistence step.
fn build_chain(
    engine: &Engine,
    ds: DatasetId,
    pid: usize,
) -> Result<(TaskHead, Vec<ChainStep>, Option<String>)> {
    let mut steps_rev: Vec<ChainStep> = Vec::new();
    let mut cur = ds;
    let mut cur_pid = pid;
    loop {
        let op = engine.graph.op(cur);
        if engine.graph.is_persistent(cur) {
            steps_rev.push(ChainStep {
                pid: cur_pid,
                kind: StepKind::Persist(cur),
            });
        }
        match op {
            OpKind::Source(kind) => {
                let parts = partitions_of(engine, cur)?;
                let meta = parts[cur_pid].clone();
                let preferred = meta.preferred_host.clone();
                steps_rev.reverse();
                return Ok((TaskHead::Source { kind, meta }, steps_rev, preferred));
            }
            OpKind::Union => {
                let parts = partitions_of(engine, cur)?;
                let meta = &parts[cur_pid];
                let parent = engine.graph.parents(cur)[meta.parent_slot];
                cur_pid = meta
                    .parent_index
                    .context("union partition is missing its parent index")?;
                cur = parent;
            }
            op if op.is_wide() => {
                let read = shuffle_read_for(engine, cur, &op, cur_pid)?;
                steps_rev.reverse();
                return Ok((TaskHead::Shuffle(read), steps_rev, None));
            }
            op => {
                steps_rev.push(ChainStep {
                    pid: cur_pid,
                    kind: StepKind::Narrow(op),
                });
                let parts = partitions_of(engine, cur)?;
                cur_pid = parts[cur_pid]
                    .parent_index
                    .context("narrow partition is missing its parent index")?;
                cur = engine.graph.parents(cur)[0];
            }
        }
    }
}

fn shuffle_read_for(
    engine: &Engine,
    wide: DatasetId,
    op: &OpKind,
    pid: usize,
) -> Result<ShuffleRead> {
    let meta = engine
        .graph
        .shuffle(wide)
        .with_context(|| format!("shuffle output of d{} is not available yet", wide.raw()))?;
    match op {
        OpKind::Cartesian => {
            let parents = engine.graph.parents(wide);
            let left_width = partitions_of(engine, parents[0])?.len();
            let right_width = partitions_of(engine, parents[1])?.len().max(1);
            let p1 = pid / right_width;
            let p2 = pid % right_width;
            let files = meta.files[p1].iter().flatten().cloned().collect();
            let right_files = meta.files[left_width + p2].iter().flatten().cloned().collect();
            Ok(ShuffleRead {
                op: op.clone(),
                pid,
                files,
                right_files,
            })
        }
        _ => Ok(ShuffleRead {
            op: op.clone(),
            pid,
            files: meta.files[pid].iter().flatten().cloned().collect(),
            right_files: Vec::new(),
        }),
    }
}

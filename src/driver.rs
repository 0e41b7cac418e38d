//! The action driver: stage-by-stage task dispatch and partial combination.
//!
//! The driver runs on one execution context and issues tasks asynchronously
//! through the runtime port, keeping a window of outstanding tasks bounded by
//! `max_busy`. Completions arrive in any order; partial results are slotted
//! by partition id and the final combine folds them in ascending partition
//! order, so non-commutative combiners stay correct. Bounded actions set
//! `max`, which stops further dispatch as soon as enough elements arrived.

use crate::engine::Engine;
use crate::graph::DatasetId;
use crate::ops::CombineFn;
use crate::planner::{self, SinkSpec, Task};
use crate::shuffle::FileDescriptor;
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde_json::Value;
use std::sync::mpsc;

/// Per-job knobs set by the bounded actions.
#[derive(Clone, Debug, Default)]
pub struct JobOptions {
    /// Stop dispatching once this many elements are collected.
    pub max: Option<usize>,
    /// Outstanding-task window; defaults to the worker count.
    pub max_busy: Option<usize>,
    /// Issue tasks in descending partition order.
    pub lifo: bool,
}

/// How many times a failed task is re-dispatched before the job fails.
const TASK_RETRIES: u8 = 1;

/// Execute the full job for `tail`: map stages for every wide dataset in
/// topological order, then the result stage, then the ordered combine.
pub fn run_job(
    engine: &Engine,
    tail: DatasetId,
    sink: SinkSpec,
    combiner: CombineFn,
    init: Value,
    combine_args: Value,
    opt: &JobOptions,
) -> Result<Value> {
    let job = engine.next_job();
    let window = opt
        .max_busy
        .unwrap_or_else(|| engine.runtime.workers().len())
        .max(1);
    let wides = planner::schedule(engine, tail, job)?;
    debug!(
        "job {job}: {} shuffle stage(s) before the result stage, window {window}",
        wides.len()
    );

    let mut stage: u64 = 0;
    for wide in wides {
        planner::reset_shuffle(engine, wide, job)?;
        let deps = engine.graph.parents(wide);
        for slot in 0..deps.len() {
            let tasks = planner::map_stage_tasks(engine, wide, slot, job, stage)?;
            let results = dispatch(engine, tasks, window, false, None)
                .with_context(|| format!("shuffle write for d{} failed", wide.raw()))?;
            register_map_outputs(engine, wide, slot, results)?;
            stage += 1;
        }
    }

    let tasks = planner::result_tasks(engine, tail, job, stage, &sink)?;
    let partials = dispatch(engine, tasks, window, opt.lifo, opt.max)?;

    let mut result = init;
    for partial in partials.into_iter().flatten() {
        result = combiner(result, partial, &combine_args);
    }
    Ok(result)
}

/// Record the descriptors a finished map stage produced into the wide node's
/// shuffle table, keyed `[out_pid][upstream_task]` (cartesian: one file per
/// upstream partition).
fn register_map_outputs(
    engine: &Engine,
    wide: DatasetId,
    dep_slot: usize,
    results: Vec<Option<Value>>,
) -> Result<()> {
    let offset = planner::upstream_offset(engine, wide, dep_slot)?;
    let cartesian = matches!(engine.graph.op(wide), crate::ops::OpKind::Cartesian);
    for (pid, result) in results.into_iter().enumerate() {
        let result = result.ok_or_else(|| anyhow!("map task {pid} produced no result"))?;
        let descriptors: Vec<Option<FileDescriptor>> =
            serde_json::from_value(result).context("decode shuffle descriptors")?;
        engine.graph.with_node_mut(wide, |node| {
            let table = &mut node
                .shuffle
                .as_mut()
                .expect("shuffle table was reset before map stages")
                .files;
            if cartesian {
                table[offset + pid][0] = descriptors.into_iter().next().flatten();
            } else {
                for (out_pid, desc) in descriptors.into_iter().enumerate() {
                    table[out_pid][offset + pid] = desc;
                }
            }
        });
    }
    Ok(())
}

/// Issue `tasks` through the runtime with a bounded window, collecting
/// per-partition results. Completion order is non-deterministic; slots are
/// indexed by partition id. A failed task is retried up to [`TASK_RETRIES`]
/// times, then fails the job. In-flight tasks run to completion after the
/// short-circuit fires, and their results are still recorded.
fn dispatch(
    engine: &Engine,
    tasks: Vec<Task>,
    window: usize,
    lifo: bool,
    max: Option<usize>,
) -> Result<Vec<Option<Value>>> {
    let total = tasks.len();
    let mut tmp: Vec<Option<Value>> = vec![None; total];
    if total == 0 {
        return Ok(tmp);
    }

    let mut order: Vec<usize> = (0..total).collect();
    if lifo {
        order.reverse();
    }

    let (tx, rx) = mpsc::channel::<(usize, Result<Value>)>();
    let mut issue = |idx: usize| {
        let done_tx = tx.clone();
        let task = tasks[idx].clone();
        engine.runtime.run_task(
            task,
            Box::new(move |result| {
                // the driver may already have failed the job; a closed
                // channel only means nobody is listening anymore
                let _ = done_tx.send((idx, result));
            }),
        );
    };

    let mut attempts = vec![0u8; total];
    let mut next = 0usize;
    let mut inflight = 0usize;
    let mut collected = 0usize;
    let mut stopped = false;

    while next < order.len() && inflight < window {
        issue(order[next]);
        next += 1;
        inflight += 1;
    }

    while inflight > 0 {
        let (idx, outcome) = rx.recv().context("worker channel closed")?;
        match outcome {
            Ok(value) => {
                inflight -= 1;
                if max.is_some() {
                    if let Some(items) = value.as_array() {
                        collected += items.len();
                    }
                }
                tmp[idx] = Some(value);
                if let Some(limit) = max {
                    if collected >= limit && !stopped {
                        debug!("short-circuit: {collected} element(s) collected, stopping dispatch");
                        stopped = true;
                    }
                }
                while !stopped && next < order.len() && inflight < window {
                    issue(order[next]);
                    next += 1;
                    inflight += 1;
                }
            }
            Err(e) => {
                attempts[idx] += 1;
                if attempts[idx] > TASK_RETRIES {
                    return Err(e.context(format!("task for partition {idx} failed")));
                }
                warn!("task for partition {idx} failed (attempt {}), retrying: {e:#}", attempts[idx]);
                issue(idx);
            }
        }
    }
    Ok(tmp)
}

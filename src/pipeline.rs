//! Fused per-partition execution of narrow transform chains.
//!
//! A stage's narrow operators run as one loop: every element emitted by the
//! stage head is pushed through each step as a single-element batch, with no
//! materialization between steps. `flat_map` may widen the batch, `filter`
//! may empty it, and a persistence step appends a copy of its input to the
//! worker-local partition buffer before passing it on.

use crate::graph::DatasetId;
use crate::ops::OpKind;
use crate::partition::WorkerStore;
use crate::rng::{Poisson, Xorshift};
use anyhow::{bail, Result};
use serde_json::Value;

/// One element of a task's narrow chain, ordered head to tail. Each step
/// remembers the partition index of the dataset it came from, since union
/// remaps indices along the walk.
#[derive(Clone)]
pub struct ChainStep {
    pub pid: usize,
    pub kind: StepKind,
}

#[derive(Clone)]
pub enum StepKind {
    Narrow(OpKind),
    Persist(DatasetId),
}

/// Where pipeline output goes: a shuffle writer on the map side, an action
/// accumulator or file writer on the result side.
pub trait Sink {
    fn push(&mut self, elem: Value) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<Value>;
}

enum RunStep {
    Map { f: crate::ops::MapFn, args: Value },
    FlatMap { f: crate::ops::FlatMapFn, args: Value },
    MapValues { f: crate::ops::MapFn, args: Value },
    FlatMapValues { f: crate::ops::FlatMapFn, args: Value },
    Filter { f: crate::ops::FilterFn, args: Value },
    Bernoulli { fraction: f64, rng: Xorshift },
    Poisson { sampler: Poisson, rng: Xorshift },
    Persist { key: (DatasetId, usize), active: bool },
}

/// A prepared chain, ready to fuse elements from head to sink.
pub struct Executor {
    steps: Vec<RunStep>,
}

impl Executor {
    /// Instantiate run state for `chain`: per-step RNGs seeded by the step's
    /// own partition index, and persistence buffers registered with the
    /// worker store (inactive when the buffer is already full or evicted).
    pub fn prepare(chain: &[ChainStep], job: u64, store: &mut WorkerStore) -> Result<Self> {
        let mut steps = Vec::with_capacity(chain.len());
        for step in chain {
            steps.push(match &step.kind {
                StepKind::Persist(dataset) => {
                    let key = (*dataset, step.pid);
                    RunStep::Persist {
                        key,
                        active: store.prepare(key, job),
                    }
                }
                StepKind::Narrow(op) => match op {
                    OpKind::Map { f, args } => RunStep::Map {
                        f: f.clone(),
                        args: args.clone(),
                    },
                    OpKind::FlatMap { f, args } => RunStep::FlatMap {
                        f: f.clone(),
                        args: args.clone(),
                    },
                    OpKind::MapValues { f, args } => RunStep::MapValues {
                        f: f.clone(),
                        args: args.clone(),
                    },
                    OpKind::FlatMapValues { f, args } => RunStep::FlatMapValues {
                        f: f.clone(),
                        args: args.clone(),
                    },
                    OpKind::Filter { f, args } => RunStep::Filter {
                        f: f.clone(),
                        args: args.clone(),
                    },
                    OpKind::Sample {
                        with_replacement,
                        fraction,
                        seed,
                    } => {
                        let rng = Xorshift::new(seed.wrapping_add(step.pid as u32));
                        if *with_replacement {
                            RunStep::Poisson {
                                sampler: Poisson::new(*fraction),
                                rng,
                            }
                        } else {
                            RunStep::Bernoulli {
                                fraction: *fraction,
                                rng,
                            }
                        }
                    }
                    other => bail!("operator {} cannot run in a narrow chain", other.label()),
                },
            });
        }
        Ok(Self { steps })
    }

    /// Push one head element through the whole chain into `sink`.
    pub fn feed(&mut self, elem: Value, store: &mut WorkerStore, sink: &mut dyn Sink) -> Result<()> {
        let mut batch = vec![elem];
        for step in &mut self.steps {
            batch = step.transform(batch, store)?;
            if batch.is_empty() {
                return Ok(());
            }
        }
        for out in batch {
            sink.push(out)?;
        }
        Ok(())
    }

    /// Seal any partition buffers this chain was filling.
    pub fn finish(&mut self, store: &mut WorkerStore) {
        for step in &self.steps {
            if let RunStep::Persist { key, active: true } = step {
                store.finish(*key);
            }
        }
    }
}

impl RunStep {
    fn transform(&mut self, batch: Vec<Value>, store: &mut WorkerStore) -> Result<Vec<Value>> {
        Ok(match self {
            RunStep::Map { f, args } => batch.iter().map(|v| f(v, args)).collect(),
            RunStep::FlatMap { f, args } => batch.iter().flat_map(|v| f(v, args)).collect(),
            RunStep::MapValues { f, args } => {
                let mut out = Vec::with_capacity(batch.len());
                for v in &batch {
                    let (key, value) = crate::ops::split_pair(v)?;
                    out.push(Value::Array(vec![key.clone(), f(value, args)]));
                }
                out
            }
            RunStep::FlatMapValues { f, args } => {
                let mut out = Vec::new();
                for v in &batch {
                    let (key, value) = crate::ops::split_pair(v)?;
                    for produced in f(value, args) {
                        out.push(Value::Array(vec![key.clone(), produced]));
                    }
                }
                out
            }
            RunStep::Filter { f, args } => batch.into_iter().filter(|v| f(v, args)).collect(),
            RunStep::Bernoulli { fraction, rng } => batch
                .into_iter()
                .filter(|_| rng.next_f64() < *fraction)
                .collect(),
            RunStep::Poisson { sampler, rng } => {
                let mut out = Vec::new();
                for v in batch {
                    let copies = sampler.sample(rng);
                    for _ in 0..copies {
                        out.push(v.clone());
                    }
                }
                out
            }
            RunStep::Persist { key, active } => {
                if *active {
                    for v in &batch {
                        store.append(*key, v);
                    }
                }
                batch
            }
        })
    }
}

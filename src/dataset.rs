//! The user-facing dataset handle and its transform builders.
//!
//! A [`Dataset`] is a cheap handle onto one node of the engine's graph.
//! Transform methods insert new nodes and return new handles; nothing
//! executes until an action (see `actions`) triggers a job. User functions
//! are passed by reference together with a serializable `args` value that
//! carries their free variables; variants suffixed `_named` resolve the
//! function from the engine's registry instead.

use crate::engine::Engine;
use crate::graph::DatasetId;
use crate::ops::{CombineFn, OpKind, ReduceFn};
use crate::partitioner::Partitioner;
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

/// A lazy, partitioned collection of JSON values. Keyed datasets hold
/// `[key, value]` pairs.
#[derive(Clone)]
pub struct Dataset {
    pub(crate) engine: Engine,
    pub(crate) id: DatasetId,
}

impl Dataset {
    pub(crate) fn wrap(engine: &Engine, id: DatasetId) -> Self {
        Self {
            engine: engine.clone(),
            id,
        }
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    fn add(&self, parents: Vec<DatasetId>, op: OpKind) -> Dataset {
        Dataset::wrap(&self.engine, self.engine.graph.insert(parents, op))
    }

    fn add1(&self, op: OpKind) -> Dataset {
        self.add(vec![self.id], op)
    }

    // ---- narrow transforms ----

    pub fn map(
        &self,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        args: Value,
    ) -> Dataset {
        self.add1(OpKind::Map {
            f: Arc::new(f),
            args,
        })
    }

    pub fn map_named(&self, name: &str, args: Value) -> Result<Dataset> {
        Ok(self.add1(OpKind::Map {
            f: self.engine.registry.map_fn(name)?,
            args,
        }))
    }

    pub fn flat_map(
        &self,
        f: impl Fn(&Value, &Value) -> Vec<Value> + Send + Sync + 'static,
        args: Value,
    ) -> Dataset {
        self.add1(OpKind::FlatMap {
            f: Arc::new(f),
            args,
        })
    }

    pub fn flat_map_named(&self, name: &str, args: Value) -> Result<Dataset> {
        Ok(self.add1(OpKind::FlatMap {
            f: self.engine.registry.flat_map_fn(name)?,
            args,
        }))
    }

    pub fn map_values(
        &self,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        args: Value,
    ) -> Dataset {
        self.add1(OpKind::MapValues {
            f: Arc::new(f),
            args,
        })
    }

    pub fn flat_map_values(
        &self,
        f: impl Fn(&Value, &Value) -> Vec<Value> + Send + Sync + 'static,
        args: Value,
    ) -> Dataset {
        self.add1(OpKind::FlatMapValues {
            f: Arc::new(f),
            args,
        })
    }

    pub fn filter(
        &self,
        f: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
        args: Value,
    ) -> Dataset {
        self.add1(OpKind::Filter {
            f: Arc::new(f),
            args,
        })
    }

    pub fn filter_named(&self, name: &str, args: Value) -> Result<Dataset> {
        Ok(self.add1(OpKind::Filter {
            f: self.engine.registry.filter_fn(name)?,
            args,
        }))
    }

    /// Bernoulli sampling without replacement, Poisson with. Deterministic
    /// for a given seed.
    pub fn sample(&self, with_replacement: bool, fraction: f64, seed: u32) -> Dataset {
        self.add1(OpKind::Sample {
            with_replacement,
            fraction,
            seed,
        })
    }

    /// Concatenation: the result has the partitions of `self` followed by
    /// the partitions of `other`.
    pub fn union(&self, other: &Dataset) -> Dataset {
        self.add(vec![self.id, other.id], OpKind::Union)
    }

    /// Keys of a keyed dataset.
    pub fn keys(&self) -> Dataset {
        let f = builtin(&self.engine, "pair-key", |r| r.map_fn("pair-key"));
        self.add1(OpKind::Map {
            f,
            args: Value::Null,
        })
    }

    /// Values of a keyed dataset.
    pub fn values(&self) -> Dataset {
        let f = builtin(&self.engine, "pair-value", |r| r.map_fn("pair-value"));
        self.add1(OpKind::Map {
            f,
            args: Value::Null,
        })
    }

    // ---- wide transforms ----

    /// The general keyed shuffle: `reducer` folds values into a per-key
    /// accumulator on the map side (deep-cloned from `init` per key), and
    /// `combiner` merges accumulators across map outputs on the reduce side.
    pub fn aggregate_by_key(
        &self,
        reducer: impl Fn(Value, &Value, &Value) -> Value + Send + Sync + 'static,
        combiner: impl Fn(Value, Value, &Value) -> Value + Send + Sync + 'static,
        init: Value,
        args: Value,
        partitions: Option<usize>,
    ) -> Dataset {
        self.add1(OpKind::AggregateByKey {
            reducer: Arc::new(reducer),
            combiner: Arc::new(combiner),
            init,
            args,
            width: partitions,
            cogroup: false,
        })
    }

    /// `reduce_by_key` applies one function both as the map-side reducer and
    /// the reduce-side combiner, the usual shape for associative folds.
    pub fn reduce_by_key(
        &self,
        f: impl Fn(Value, &Value, &Value) -> Value + Send + Sync + 'static,
        init: Value,
        partitions: Option<usize>,
    ) -> Dataset {
        let reducer: ReduceFn = Arc::new(f);
        let folded = Arc::clone(&reducer);
        let combiner: CombineFn = Arc::new(move |acc, other, args| folded(acc, &other, args));
        self.add1(OpKind::AggregateByKey {
            reducer,
            combiner,
            init,
            args: Value::Null,
            width: partitions,
            cogroup: false,
        })
    }

    /// Group values per key into a list.
    pub fn group_by_key(&self, partitions: Option<usize>) -> Dataset {
        let reducer = builtin(&self.engine, "push", |r| r.reduce_fn("push"));
        let combiner = builtin(&self.engine, "concat", |r| r.combine_fn("concat"));
        self.add1(OpKind::AggregateByKey {
            reducer,
            combiner,
            init: json!([]),
            args: Value::Null,
            width: partitions,
            cogroup: false,
        })
    }

    /// Group two keyed datasets into `[key, [leftValues, rightValues]]`.
    pub fn co_group(&self, other: &Dataset, partitions: Option<usize>) -> Dataset {
        let reducer = builtin(&self.engine, "push", |r| r.reduce_fn("push"));
        let combiner = builtin(&self.engine, "merge-pair", |r| r.combine_fn("merge-pair"));
        self.add(
            vec![self.id, other.id],
            OpKind::AggregateByKey {
                reducer,
                combiner,
                init: json!([]),
                args: Value::Null,
                width: partitions,
                cogroup: true,
            },
        )
    }

    /// Global sort by a key extractor, backed by a range partitioner whose
    /// bounds come from a sampling sub-job.
    pub fn sort_by(
        &self,
        key: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        args: Value,
        ascending: bool,
        partitions: Option<usize>,
    ) -> Dataset {
        self.add1(OpKind::SortBy {
            key: Arc::new(key),
            args,
            ascending,
            width: partitions,
        })
    }

    /// Sort a keyed dataset by its keys.
    pub fn sort_by_key(&self, ascending: bool, partitions: Option<usize>) -> Dataset {
        let key = builtin(&self.engine, "pair-key", |r| r.map_fn("pair-key"));
        self.add1(OpKind::SortBy {
            key,
            args: Value::Null,
            ascending,
            width: partitions,
        })
    }

    /// Repartition a keyed dataset by an explicit partitioner, keeping
    /// records intact.
    pub fn partition_by(&self, partitioner: Partitioner) -> Dataset {
        self.add1(OpKind::PartitionBy { partitioner })
    }

    /// Every pairing `[a, b]` of this dataset with `other`.
    pub fn cartesian(&self, other: &Dataset) -> Dataset {
        self.add(vec![self.id, other.id], OpKind::Cartesian)
    }

    /// Distinct elements, by canonical equality.
    pub fn distinct(&self, partitions: Option<usize>) -> Dataset {
        let keep = builtin(&self.engine, "keep-first", |r| r.reduce_fn("keep-first"));
        let first = builtin(&self.engine, "first", |r| r.combine_fn("first"));
        let keyed = self.map(|v, _| json!([v, v]), Value::Null);
        let reduced = keyed.add1(OpKind::AggregateByKey {
            reducer: keep,
            combiner: first,
            init: Value::Null,
            args: Value::Null,
            width: partitions,
            cogroup: false,
        });
        reduced.values()
    }

    /// Mark this dataset's partitions for in-memory retention on the workers
    /// that compute them, subject to eviction under memory pressure.
    pub fn persist(&self) -> Dataset {
        self.engine.graph.set_persistent(self.id);
        self.clone()
    }
}

/// Fetch one of the engine's pre-registered functions. The registry is
/// seeded with every name used here, so a miss is an internal invariant
/// violation, not a user error.
fn builtin<F>(
    engine: &Engine,
    name: &str,
    get: impl FnOnce(&crate::runtime::FnRegistry) -> Result<F>,
) -> F {
    get(&engine.registry).unwrap_or_else(|_| panic!("builtin function '{name}' is registered"))
}

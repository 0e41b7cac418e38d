//! Terminal operations: everything that triggers a job.
//!
//! Every action pairs a per-partition reducer (folded on the worker) with a
//! driver-side combiner applied to partial results in partition order. The
//! bounded actions (`take`, `top`, `first`) narrow the dispatch window to one
//! task and short-circuit once enough elements arrived.

use crate::dataset::Dataset;
use crate::driver::{run_job, JobOptions};
use crate::ops::{CombineFn, EachFn, ReduceFn};
use crate::planner::SinkSpec;
use crate::shuffle::FileDescriptor;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;

/// Export knobs for [`Dataset::save`].
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    /// Gzip each partition file (fastest compression level).
    pub gzip: bool,
    /// Write columnar files instead of newline-delimited JSON.
    pub parquet: bool,
}

/// Knobs for [`Dataset::stream_to`].
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    /// Gzip each partition's spill; the piped output is a multi-member
    /// gzip stream.
    pub gzip: bool,
    /// Flush the destination writer once every partition is piped.
    pub end: bool,
}

/// What [`Dataset::save`] wrote.
#[derive(Clone, Debug)]
pub struct SaveReport {
    pub files: Vec<String>,
    pub rows: u64,
}

impl Dataset {
    fn run(
        &self,
        sink: SinkSpec,
        combiner: CombineFn,
        init: Value,
        combine_args: Value,
        opt: JobOptions,
    ) -> Result<Value> {
        run_job(
            &self.engine,
            self.id,
            sink,
            combiner,
            init,
            combine_args,
            &opt,
        )
    }

    fn reduce_sink(reducer: ReduceFn, init: Value, args: Value) -> SinkSpec {
        SinkSpec::Reduce {
            reducer,
            init,
            args,
        }
    }

    /// Number of elements, summed over per-partition counts.
    pub fn count(&self) -> Result<u64> {
        let reducer: ReduceFn =
            Arc::new(|acc, _, _| json!(acc.as_u64().unwrap_or(0) + 1));
        let combiner: CombineFn =
            Arc::new(|acc, partial, _| {
                json!(acc.as_u64().unwrap_or(0) + partial.as_u64().unwrap_or(0))
            });
        let out = self.run(
            Self::reduce_sink(reducer, json!(0), Value::Null),
            combiner,
            json!(0),
            Value::Null,
            JobOptions::default(),
        )?;
        Ok(out.as_u64().unwrap_or(0))
    }

    /// Every element, concatenated in partition-then-index order.
    pub fn collect(&self) -> Result<Vec<Value>> {
        let reducer = self.engine.registry.reduce_fn("push")?;
        let combiner = self.engine.registry.combine_fn("concat")?;
        let out = self.run(
            Self::reduce_sink(reducer, json!([]), Value::Null),
            combiner,
            json!([]),
            Value::Null,
            JobOptions::default(),
        )?;
        Ok(match out {
            Value::Array(items) => items,
            _ => Vec::new(),
        })
    }

    /// Fold every element with `f`, then fold the per-partition results with
    /// the same function.
    pub fn reduce(
        &self,
        f: impl Fn(Value, &Value, &Value) -> Value + Send + Sync + 'static,
        init: Value,
    ) -> Result<Value> {
        let reducer: ReduceFn = Arc::new(f);
        let folded = Arc::clone(&reducer);
        let combiner: CombineFn = Arc::new(move |acc, partial, args| folded(acc, &partial, args));
        self.run(
            Self::reduce_sink(reducer, init.clone(), Value::Null),
            combiner,
            init,
            Value::Null,
            JobOptions::default(),
        )
    }

    /// The general action: an explicit per-partition reducer, a driver-side
    /// combiner, and job options.
    pub fn aggregate(
        &self,
        reducer: impl Fn(Value, &Value, &Value) -> Value + Send + Sync + 'static,
        combiner: impl Fn(Value, Value, &Value) -> Value + Send + Sync + 'static,
        init: Value,
        args: Value,
        opt: JobOptions,
    ) -> Result<Value> {
        self.run(
            Self::reduce_sink(Arc::new(reducer), init.clone(), args.clone()),
            Arc::new(combiner),
            init,
            args,
            opt,
        )
    }

    /// First `n` elements in partition order. Dispatches one task at a time
    /// and stops as soon as `n` elements are collected.
    pub fn take(&self, n: usize) -> Result<Vec<Value>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let reducer = self.engine.registry.reduce_fn("push")?;
        let combiner: CombineFn = Arc::new(|mut acc, partial, args| {
            let limit = args.get("max").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
            if let (Some(list), Value::Array(more)) = (acc.as_array_mut(), partial) {
                list.extend(more);
                list.truncate(limit);
            }
            acc
        });
        let out = self.run(
            Self::reduce_sink(reducer, json!([]), Value::Null),
            combiner,
            json!([]),
            json!({ "max": n }),
            JobOptions {
                max: Some(n),
                max_busy: Some(1),
                lifo: false,
            },
        )?;
        Ok(match out {
            Value::Array(items) => items,
            _ => Vec::new(),
        })
    }

    /// Last `n` elements in reverse partition order (largest index first).
    /// Dispatches from the tail partition, one task at a time.
    pub fn top(&self, n: usize) -> Result<Vec<Value>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let reducer: ReduceFn = Arc::new(|mut acc, v, args| {
            let keep = args.get("n").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
            if let Some(list) = acc.as_array_mut() {
                list.push(v.clone());
                if list.len() > keep {
                    list.remove(0);
                }
            }
            acc
        });
        let combiner: CombineFn = Arc::new(|mut acc, partial, args| {
            let keep = args.get("n").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
            if let (Some(list), Value::Array(more)) = (acc.as_array_mut(), partial) {
                list.extend(more);
                let excess = list.len().saturating_sub(keep);
                list.drain(..excess);
            }
            acc
        });
        let out = self.run(
            Self::reduce_sink(reducer, json!([]), json!({ "n": n })),
            combiner,
            json!([]),
            json!({ "n": n }),
            JobOptions {
                max: Some(n),
                max_busy: Some(1),
                lifo: true,
            },
        )?;
        Ok(match out {
            Value::Array(mut items) => {
                items.reverse();
                items
            }
            _ => Vec::new(),
        })
    }

    /// The first element, if any.
    pub fn first(&self) -> Result<Option<Value>> {
        Ok(self.take(1)?.into_iter().next())
    }

    /// Run `f` over every element for its side effects; nothing accumulates.
    pub fn for_each(
        &self,
        f: impl Fn(&Value, &Value) + Send + Sync + 'static,
        args: Value,
    ) -> Result<()> {
        let each: EachFn = Arc::new(f);
        let reducer: ReduceFn = Arc::new(move |acc, v, a| {
            each(v, a);
            acc
        });
        let combiner: CombineFn = Arc::new(|acc, _, _| acc);
        self.run(
            Self::reduce_sink(reducer, Value::Null, args),
            combiner,
            Value::Null,
            Value::Null,
            JobOptions::default(),
        )?;
        Ok(())
    }

    /// Write one file per partition under `dest` (a local directory, a
    /// `file://` path, or an object-store URI).
    pub fn save(&self, dest: &str, opts: &SaveOptions) -> Result<SaveReport> {
        let combiner = self.engine.registry.reduce_fn("push")?;
        let combiner: CombineFn = Arc::new(move |acc, partial, args| combiner(acc, &partial, args));
        let out = self.run(
            SinkSpec::Save {
                dest: dest.to_string(),
                gzip: opts.gzip,
                parquet: opts.parquet,
            },
            combiner,
            json!([]),
            Value::Null,
            JobOptions::default(),
        )?;
        let mut report = SaveReport {
            files: Vec::new(),
            rows: 0,
        };
        for entry in out.as_array().into_iter().flatten() {
            if let Some(path) = entry.get("path").and_then(Value::as_str) {
                report.files.push(path.to_string());
            }
            report.rows += entry.get("rows").and_then(Value::as_u64).unwrap_or(0);
        }
        Ok(report)
    }

    /// Spill each partition on its worker, then pipe the spills into `out`
    /// in partition order. Returns the number of rows piped.
    pub fn stream_to<W: Write>(&self, out: &mut W, opts: &StreamOptions) -> Result<u64> {
        let combiner = self.engine.registry.reduce_fn("push")?;
        let combiner: CombineFn = Arc::new(move |acc, partial, args| combiner(acc, &partial, args));
        let partials = self.run(
            SinkSpec::Spill { gzip: opts.gzip },
            combiner,
            json!([]),
            Value::Null,
            JobOptions::default(),
        )?;

        let mut rows = 0u64;
        for entry in partials.as_array().into_iter().flatten() {
            let desc: FileDescriptor = serde_json::from_value(
                entry.get("file").cloned().context("spill result without a file")?,
            )?;
            let mut stream = self.engine.runtime.read_stream(&desc)?;
            std::io::copy(&mut stream, out)
                .with_context(|| format!("pipe spill {}", desc.path.display()))?;
            rows += entry.get("rows").and_then(Value::as_u64).unwrap_or(0);
        }
        if opts.end {
            out.flush()?;
        }
        Ok(rows)
    }
}

//! Runtime ports and the local in-process implementation.
//!
//! The engine core talks to its surroundings through three small surfaces: a
//! task dispatch port, a byte-stream port for shuffle files, and an
//! object-store port for bucket sources and cloud export. [`LocalRuntime`]
//! implements them with one OS thread per worker, each draining a serial
//! mailbox, so a worker executes one task at a time while workers run in
//! parallel — the same shape a remote deployment would have.

use crate::ops::{CombineFn, FilterFn, FlatMapFn, MapFn, ReduceFn};
use crate::partition::WorkerStore;
use crate::planner::Task;
use crate::shuffle::FileDescriptor;
use crate::worker::{worker_main, WorkerState};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tempfile::TempDir;

/// Identity of one worker.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub id: usize,
    pub host: String,
}

/// Byte streams for shuffle files, wherever they live.
pub trait StreamPort: Send + Sync {
    fn read_stream(&self, desc: &FileDescriptor) -> Result<Box<dyn Read + Send>>;
}

pub type TaskCallback = Box<dyn FnOnce(Result<Value>) + Send>;

/// The dispatch surface the action driver runs against.
pub trait Runtime: StreamPort {
    fn workers(&self) -> Vec<WorkerInfo>;
    fn run_task(&self, task: Task, done: TaskCallback);
}

/// Listing entry from an object store.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub host: Option<String>,
}

/// Object storage port used by bucket sources and cloud `save`.
pub trait ObjectStore: Send + Sync {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>>;
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;
}

/// In-memory object store for tests and examples.
#[derive(Default)]
pub struct MemObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ObjectStore for MemObjectStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let objects = self.objects.lock().unwrap();
        let mut entries: Vec<ObjectEntry> = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), data)| ObjectEntry {
                key: k.clone(),
                size: data.len() as u64,
                host: None,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no object {bucket}/{key}"))
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }
}

/// Split `scheme://bucket/key-prefix` into its parts. Plain paths and
/// `file://` destinations return `None` and stay on the local filesystem.
pub fn parse_object_uri(uri: &str) -> Option<(String, String, String)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme == "file" {
        return None;
    }
    let (bucket, key) = match rest.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (rest, ""),
    };
    Some((scheme.to_string(), bucket.to_string(), key.to_string()))
}

/// Named, pre-shipped user functions resolvable by stable keys.
///
/// Operator payloads carry functions by reference; the registry is how a
/// deployment ships them ahead of time and how the built-in operators
/// (`group_by_key`, `distinct`, co-grouping) name theirs.
#[derive(Clone)]
pub struct FnRegistry {
    inner: Arc<Mutex<HashMap<String, NamedFn>>>,
}

#[derive(Clone)]
pub enum NamedFn {
    Map(MapFn),
    FlatMap(FlatMapFn),
    Filter(FilterFn),
    Reduce(ReduceFn),
    Combine(CombineFn),
}

impl FnRegistry {
    /// A registry pre-loaded with the engine's built-ins.
    pub fn with_builtins() -> Self {
        let reg = Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        };
        reg.register_map("identity", |v, _| v.clone());
        reg.register_map("pair-key", |v, _| {
            v.get(0).cloned().unwrap_or(Value::Null)
        });
        reg.register_map("pair-value", |v, _| {
            v.get(1).cloned().unwrap_or(Value::Null)
        });
        reg.register_reduce("push", |mut acc, v, _| {
            if let Some(list) = acc.as_array_mut() {
                list.push(v.clone());
            }
            acc
        });
        reg.register_reduce("keep-first", |acc, v, _| {
            if acc.is_null() {
                v.clone()
            } else {
                acc
            }
        });
        reg.register_combine("concat", |mut acc, other, _| {
            if let (Some(list), Value::Array(more)) = (acc.as_array_mut(), other) {
                list.extend(more);
            }
            acc
        });
        reg.register_combine("first", |acc, other, _| {
            if acc.is_null() {
                other
            } else {
                acc
            }
        });
        // merges the side-tagged halves of two co-group accumulators
        reg.register_combine("merge-pair", |acc, other, _| {
            let mut left = acc;
            if let (Some(pair), Value::Array(mut incoming)) = (left.as_array_mut(), other) {
                if pair.len() == 2 && incoming.len() == 2 {
                    if let (Some(l), Value::Array(li)) =
                        (pair[0].as_array_mut(), incoming[0].take())
                    {
                        l.extend(li);
                    }
                    if let (Some(r), Value::Array(ri)) =
                        (pair[1].as_array_mut(), incoming[1].take())
                    {
                        r.extend(ri);
                    }
                }
            }
            left
        });
        reg
    }

    pub fn register_map(&self, name: &str, f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static) {
        self.insert(name, NamedFn::Map(Arc::new(f)));
    }

    pub fn register_flat_map(
        &self,
        name: &str,
        f: impl Fn(&Value, &Value) -> Vec<Value> + Send + Sync + 'static,
    ) {
        self.insert(name, NamedFn::FlatMap(Arc::new(f)));
    }

    pub fn register_filter(
        &self,
        name: &str,
        f: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) {
        self.insert(name, NamedFn::Filter(Arc::new(f)));
    }

    pub fn register_reduce(
        &self,
        name: &str,
        f: impl Fn(Value, &Value, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.insert(name, NamedFn::Reduce(Arc::new(f)));
    }

    pub fn register_combine(
        &self,
        name: &str,
        f: impl Fn(Value, Value, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.insert(name, NamedFn::Combine(Arc::new(f)));
    }

    fn insert(&self, name: &str, f: NamedFn) {
        self.inner.lock().unwrap().insert(name.to_string(), f);
    }

    fn lookup(&self, name: &str) -> Result<NamedFn> {
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no registered function named '{name}'"))
    }

    pub fn map_fn(&self, name: &str) -> Result<MapFn> {
        match self.lookup(name)? {
            NamedFn::Map(f) => Ok(f),
            _ => bail!("'{name}' is registered, but not as a map function"),
        }
    }

    pub fn flat_map_fn(&self, name: &str) -> Result<FlatMapFn> {
        match self.lookup(name)? {
            NamedFn::FlatMap(f) => Ok(f),
            _ => bail!("'{name}' is registered, but not as a flat-map function"),
        }
    }

    pub fn filter_fn(&self, name: &str) -> Result<FilterFn> {
        match self.lookup(name)? {
            NamedFn::Filter(f) => Ok(f),
            _ => bail!("'{name}' is registered, but not as a filter function"),
        }
    }

    pub fn reduce_fn(&self, name: &str) -> Result<ReduceFn> {
        match self.lookup(name)? {
            NamedFn::Reduce(f) => Ok(f),
            _ => bail!("'{name}' is registered, but not as a reduce function"),
        }
    }

    pub fn combine_fn(&self, name: &str) -> Result<CombineFn> {
        match self.lookup(name)? {
            NamedFn::Combine(f) => Ok(f),
            _ => bail!("'{name}' is registered, but not as a combine function"),
        }
    }
}

/// Engine-wide configuration.
pub struct EngineConfig {
    /// Number of workers in the local runtime.
    pub workers: usize,
    /// Per-worker storage-memory ceiling for persisted partitions, in bytes.
    pub storage_ceiling: usize,
    /// Scratch root; a temporary directory is created (and cleaned on drop)
    /// when unset.
    pub scratch: Option<PathBuf>,
    /// Object stores by URI scheme (e.g. `"s3"`, `"az"`).
    pub object_stores: Vec<(String, Arc<dyn ObjectStore>)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(2),
            storage_ceiling: 512 << 20,
            scratch: None,
            object_stores: Vec::new(),
        }
    }
}

/// Reads shuffle files straight off the local filesystem; every worker of a
/// local runtime shares one filesystem, so the descriptor's host is ignored.
struct LocalStreams;

impl StreamPort for LocalStreams {
    fn read_stream(&self, desc: &FileDescriptor) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&desc.path)
            .with_context(|| format!("open shuffle file {}", desc.path.display()))?;
        Ok(Box::new(file))
    }
}

type WorkerMsg = (Task, TaskCallback);

/// In-process runtime: one thread per worker, serial task mailboxes.
pub struct LocalRuntime {
    infos: Vec<WorkerInfo>,
    senders: Mutex<Vec<mpsc::Sender<WorkerMsg>>>,
    _scratch_guard: Option<TempDir>,
}

impl LocalRuntime {
    pub fn spawn(config: &EngineConfig) -> Result<Arc<Self>> {
        let workers = config.workers.max(1);
        let (scratch_root, guard) = match &config.scratch {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create scratch root {}", dir.display()))?;
                (dir.clone(), None)
            }
            None => {
                let tmp = TempDir::new().context("create scratch root")?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        let streams: Arc<dyn StreamPort> = Arc::new(LocalStreams);
        let stores: HashMap<String, Arc<dyn ObjectStore>> = config
            .object_stores
            .iter()
            .map(|(scheme, store)| (scheme.clone(), Arc::clone(store)))
            .collect();

        let mut infos = Vec::with_capacity(workers);
        let mut senders = Vec::with_capacity(workers);
        for id in 0..workers {
            let host = format!("worker-{id}");
            let scratch = scratch_root.join(&host);
            std::fs::create_dir_all(&scratch)
                .with_context(|| format!("create {}", scratch.display()))?;
            let state = WorkerState {
                id,
                host: host.clone(),
                scratch,
                store: WorkerStore::new(config.storage_ceiling),
                streams: Arc::clone(&streams),
                object_stores: stores.clone(),
            };
            let (tx, rx) = mpsc::channel::<WorkerMsg>();
            thread::Builder::new()
                .name(format!("gridiron-{host}"))
                .spawn(move || worker_main(state, rx))
                .context("spawn worker thread")?;
            infos.push(WorkerInfo { id, host });
            senders.push(tx);
        }
        debug!("local runtime up with {workers} workers at {}", scratch_root.display());
        Ok(Arc::new(Self {
            infos,
            senders: Mutex::new(senders),
            _scratch_guard: guard,
        }))
    }

    fn pick_worker(&self, task: &Task) -> usize {
        if let Some(host) = &task.preferred_host {
            if let Some(info) = self.infos.iter().find(|w| &w.host == host) {
                return info.id;
            }
        }
        // stable placement keeps persisted partitions on the worker that
        // filled them
        task.pid % self.infos.len()
    }
}

impl StreamPort for LocalRuntime {
    fn read_stream(&self, desc: &FileDescriptor) -> Result<Box<dyn Read + Send>> {
        LocalStreams.read_stream(desc)
    }
}

impl Runtime for LocalRuntime {
    fn workers(&self) -> Vec<WorkerInfo> {
        self.infos.clone()
    }

    fn run_task(&self, task: Task, done: TaskCallback) {
        let target = self.pick_worker(&task);
        let sender = self.senders.lock().unwrap()[target].clone();
        if let Err(e) = sender.send((task, done)) {
            let (task, done) = e.0;
            done(Err(anyhow!(
                "worker {target} is gone; task for partition {} not dispatched",
                task.pid
            )));
        }
    }
}

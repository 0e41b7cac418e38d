pub mod actions;
pub mod canon;
pub mod dataset;
pub mod driver;
pub mod engine;
pub mod graph;
pub mod io;
pub mod ops;
pub mod partition;
pub mod partitioner;
pub mod pipeline;
pub mod planner;
pub mod rng;
pub mod runtime;
pub mod shuffle;
pub mod source;
pub mod testing;
mod worker;

pub use actions::{SaveOptions, SaveReport, StreamOptions};
pub use dataset::Dataset;
pub use driver::JobOptions;
pub use engine::Engine;
pub use graph::DatasetId;
pub use partitioner::{HashPartitioner, Partitioner, RangePartitioner};
pub use runtime::{
    EngineConfig, FnRegistry, MemObjectStore, ObjectStore, Runtime, WorkerInfo,
};
pub use serde_json::Value;

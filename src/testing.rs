//! Testing utilities: a small pre-configured engine and collection
//! assertions used throughout the integration tests.

use crate::canon;
use crate::engine::Engine;
use crate::runtime::EngineConfig;
use serde_json::{json, Value};

/// An engine with four local workers, a temporary scratch directory, and the
/// default storage ceiling. Panics on setup failure, which is fine in tests.
pub fn test_engine() -> Engine {
    engine_with(EngineConfig {
        workers: 4,
        ..EngineConfig::default()
    })
}

/// A test engine with a tiny storage ceiling, for exercising eviction.
pub fn tiny_memory_engine() -> Engine {
    engine_with(EngineConfig {
        workers: 2,
        storage_ceiling: 256,
        ..EngineConfig::default()
    })
}

fn engine_with(config: EngineConfig) -> Engine {
    Engine::local(config).expect("local engine")
}

/// Turn integers into engine values.
pub fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Value> {
    values.into_iter().map(|v| json!(v)).collect()
}

/// Turn `(key, value)` tuples into keyed engine elements.
pub fn pairs<K: Into<Value>, V: Into<Value>>(
    items: impl IntoIterator<Item = (K, V)>,
) -> Vec<Value> {
    items
        .into_iter()
        .map(|(k, v)| json!([k.into(), v.into()]))
        .collect()
}

/// Exact, order-sensitive comparison.
pub fn assert_collections_equal(actual: &[Value], expected: &[Value]) {
    assert_eq!(actual, expected, "collections differ");
}

/// Order-insensitive comparison by canonical encoding.
pub fn assert_collections_unordered_equal(actual: &[Value], expected: &[Value]) {
    let mut a: Vec<String> = actual.iter().map(canon::encode).collect();
    let mut e: Vec<String> = expected.iter().map(canon::encode).collect();
    a.sort();
    e.sort();
    assert_eq!(a, e, "collections differ as multisets");
}

/// Compare keyed outputs after sorting both sides by key.
pub fn assert_kv_collections_equal(actual: &[Value], expected: &[Value]) {
    let sort_key = |v: &Value| canon::encode(v.get(0).unwrap_or(&Value::Null));
    let mut a = actual.to_vec();
    let mut e = expected.to_vec();
    a.sort_by_key(sort_key);
    e.sort_by_key(sort_key);
    assert_eq!(a, e, "keyed collections differ");
}

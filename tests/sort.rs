use gridiron::testing::*;
use serde_json::{json, Value};

fn identity_key(v: &Value, _args: &Value) -> Value {
    v.clone()
}

#[test]
fn sort_by_orders_across_partitions() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(ints([3, 1, 4, 1, 5, 9, 2, 6]), 4)?
        .sort_by(identity_key, Value::Null, true, None)
        .collect()?;
    assert_collections_equal(&out, &ints([1, 1, 2, 3, 4, 5, 6, 9]));
    Ok(())
}

#[test]
fn sort_order_is_independent_of_partition_count() -> anyhow::Result<()> {
    let engine = test_engine();
    let data: Vec<Value> = (0..500).map(|i| json!((i * 7919) % 1000)).collect();
    for parts in [1usize, 2, 5, 13] {
        let out = engine
            .parallelize(data.clone(), 3)?
            .sort_by(identity_key, Value::Null, true, Some(parts))
            .collect()?;
        let nums: Vec<i64> = out.iter().map(|v| v.as_i64().unwrap()).collect();
        assert!(nums.windows(2).all(|w| w[0] <= w[1]), "{parts} partitions");
        assert_eq!(nums.len(), data.len());
    }
    Ok(())
}

#[test]
fn descending_sort_reverses_the_order() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(ints(0..100), 4)?
        .sort_by(identity_key, Value::Null, false, Some(3))
        .collect()?;
    let nums: Vec<i64> = out.iter().map(|v| v.as_i64().unwrap()).collect();
    assert!(nums.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(nums.len(), 100);
    Ok(())
}

#[test]
fn sort_by_key_orders_pairs() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(pairs([("c", 3), ("a", 1), ("b", 2)]), 2)?
        .sort_by_key(true, None)
        .collect()?;
    assert_collections_equal(&out, &pairs([("a", 1), ("b", 2), ("c", 3)]));
    Ok(())
}

#[test]
fn sort_by_an_extracted_field() -> anyhow::Result<()> {
    let engine = test_engine();
    let rows = vec![
        json!({"name": "carol", "age": 41}),
        json!({"name": "alice", "age": 29}),
        json!({"name": "bob", "age": 35}),
    ];
    let out = engine
        .parallelize(rows, 2)?
        .sort_by(|v, _| v["age"].clone(), Value::Null, true, None)
        .collect()?;
    let names: Vec<&str> = out.iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["alice", "bob", "carol"]);
    Ok(())
}

#[test]
fn range_partitions_are_roughly_balanced() -> anyhow::Result<()> {
    let engine = test_engine();
    let n = 4000i64;
    let parts = 4usize;
    let data: Vec<Value> = (0..n).map(|i| json!((i * 6007) % 9973)).collect();

    let dir = tempfile::TempDir::new()?;
    engine
        .parallelize(data, 8)?
        .sort_by(identity_key, Value::Null, true, Some(parts))
        .save(dir.path().to_str().unwrap(), &Default::default())?;

    let expected = n as f64 / parts as f64;
    for pid in 0..parts {
        let path = dir.path().join(format!("part-{pid:05}.jsonl"));
        let count = std::fs::read_to_string(&path)?.lines().count() as f64;
        assert!(
            (count - expected).abs() <= expected * 0.2,
            "partition {pid} holds {count} of ~{expected}"
        );
    }
    Ok(())
}

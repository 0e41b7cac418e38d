use gridiron::testing::*;
use gridiron::Partitioner;
use serde_json::{json, Value};

fn sum(acc: Value, v: &Value, _args: &Value) -> Value {
    json!(acc.as_i64().unwrap_or(0) + v.as_i64().unwrap_or(0))
}

#[test]
fn reduce_by_key_sums_per_key() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(pairs([("a", 1), ("b", 2), ("a", 3)]), 2)?
        .reduce_by_key(sum, json!(0), None)
        .collect()?;
    assert_kv_collections_equal(&out, &pairs([("a", 4), ("b", 2)]));
    Ok(())
}

#[test]
fn reduce_by_key_is_independent_of_partition_count() -> anyhow::Result<()> {
    let engine = test_engine();
    let data: Vec<Value> = (0..200).map(|i| json!([format!("k{}", i % 7), 1])).collect();
    let mut previous: Option<Vec<Value>> = None;
    for parts in [1usize, 2, 5, 16] {
        let out = engine
            .parallelize(data.clone(), parts)?
            .reduce_by_key(sum, json!(0), None)
            .collect()?;
        if let Some(prev) = &previous {
            assert_kv_collections_equal(&out, prev);
        }
        previous = Some(out);
    }
    Ok(())
}

#[test]
fn group_by_key_collects_values_into_lists() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(pairs([("a", 1), ("b", 2), ("a", 3), ("a", 5)]), 3)?
        .group_by_key(Some(2))
        .collect()?;

    let mut by_key = std::collections::HashMap::new();
    for entry in &out {
        let key = entry[0].as_str().unwrap().to_string();
        let mut values: Vec<i64> = entry[1]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        values.sort_unstable();
        by_key.insert(key, values);
    }
    assert_eq!(by_key["a"], vec![1, 3, 5]);
    assert_eq!(by_key["b"], vec![2]);
    Ok(())
}

#[test]
fn aggregate_by_key_uses_distinct_reducer_and_combiner() -> anyhow::Result<()> {
    let engine = test_engine();
    // per-key mean: map side accumulates {sum, n}, reduce side merges them
    let out = engine
        .parallelize(pairs([("a", 2), ("a", 4), ("b", 9)]), 3)?
        .aggregate_by_key(
            |acc, v, _| {
                json!({
                    "sum": acc["sum"].as_i64().unwrap() + v.as_i64().unwrap(),
                    "n": acc["n"].as_i64().unwrap() + 1,
                })
            },
            |acc, other, _| {
                json!({
                    "sum": acc["sum"].as_i64().unwrap() + other["sum"].as_i64().unwrap(),
                    "n": acc["n"].as_i64().unwrap() + other["n"].as_i64().unwrap(),
                })
            },
            json!({ "sum": 0, "n": 0 }),
            Value::Null,
            None,
        )
        .map_values(
            |acc, _| json!(acc["sum"].as_i64().unwrap() / acc["n"].as_i64().unwrap()),
            Value::Null,
        )
        .collect()?;
    assert_kv_collections_equal(&out, &pairs([("a", 3), ("b", 9)]));
    Ok(())
}

#[test]
fn co_group_tags_left_and_right_values() -> anyhow::Result<()> {
    let engine = test_engine();
    let left = engine.parallelize(pairs([("a", 1), ("b", 2)]), 2)?;
    let right = engine.parallelize(pairs([("a", 10), ("c", 30)]), 2)?;
    let out = left.co_group(&right, Some(2)).collect()?;

    assert_kv_collections_equal(
        &out,
        &[
            json!(["a", [[1], [10]]]),
            json!(["b", [[2], []]]),
            json!(["c", [[], [30]]]),
        ],
    );
    Ok(())
}

#[test]
fn partition_by_preserves_the_multiset_and_routes_by_key() -> anyhow::Result<()> {
    let engine = test_engine();
    let data: Vec<Value> = (0..60).map(|i| json!([i % 11, i])).collect();
    let partitioner = Partitioner::hash(3);
    let routed = engine
        .parallelize(data.clone(), 4)?
        .partition_by(partitioner.clone());

    assert_collections_unordered_equal(&routed.collect()?, &data);

    // every record must land in the partition its key hashes to
    let dir = tempfile::TempDir::new()?;
    routed.save(dir.path().to_str().unwrap(), &Default::default())?;
    for pid in 0..3 {
        let path = dir.path().join(format!("part-{pid:05}.jsonl"));
        for line in std::fs::read_to_string(&path)?.lines() {
            let record: Value = serde_json::from_str(line)?;
            assert_eq!(partitioner.index_of(&record[0]), pid);
        }
    }
    Ok(())
}

#[test]
fn cartesian_pairs_every_left_with_every_right() -> anyhow::Result<()> {
    let engine = test_engine();
    let left = engine.parallelize(pairs([("a", 1), ("b", 2)]), 1)?;
    let right = engine.parallelize(pairs([("x", 10)]), 1)?;
    let out = left.cartesian(&right).collect()?;
    assert_collections_equal(
        &out,
        &[
            json!([["a", 1], ["x", 10]]),
            json!([["b", 2], ["x", 10]]),
        ],
    );
    Ok(())
}

#[test]
fn cartesian_spans_multiple_partitions() -> anyhow::Result<()> {
    let engine = test_engine();
    let left = engine.parallelize(ints([1, 2, 3]), 2)?;
    let right = engine.parallelize(ints([10, 20]), 2)?;
    let out = left.cartesian(&right).collect()?;
    assert_eq!(out.len(), 6);

    let expected: Vec<Value> = [1, 2, 3]
        .iter()
        .flat_map(|a| [10, 20].iter().map(move |b| json!([a, b])))
        .collect();
    assert_collections_unordered_equal(&out, &expected);
    Ok(())
}

#[test]
fn map_values_after_a_shuffle_keeps_the_partitioner() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(pairs([("a", 1), ("a", 2), ("b", 5)]), 2)?
        .reduce_by_key(sum, json!(0), Some(3))
        .map_values(|v, _| json!(v.as_i64().unwrap() * 100), Value::Null)
        .collect()?;
    assert_kv_collections_equal(&out, &pairs([("a", 300), ("b", 500)]));
    Ok(())
}

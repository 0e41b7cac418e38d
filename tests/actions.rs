use gridiron::testing::*;
use gridiron::JobOptions;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn take_returns_the_first_n_in_partition_order() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints(0..100), 5)?;
    assert_collections_equal(&d.take(3)?, &ints([0, 1, 2]));
    // n larger than the dataset clamps to its length
    assert_eq!(d.take(1000)?.len(), 100);
    assert!(d.take(0)?.is_empty());
    Ok(())
}

#[test]
fn take_crossing_a_partition_boundary_stays_ordered() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints(0..20), 4)?;
    assert_collections_equal(&d.take(7)?, &ints(0..7));
    Ok(())
}

#[test]
fn top_returns_the_tail_in_reverse_order() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints(0..1000), 4)?;
    assert_collections_equal(&d.top(3)?, &ints([999, 998, 997]));
    Ok(())
}

#[test]
fn top_spanning_partitions() -> anyhow::Result<()> {
    let engine = test_engine();
    // 4 partitions of 5: top(7) needs the last two partitions
    let d = engine.parallelize(ints(0..20), 4)?;
    assert_collections_equal(&d.top(7)?, &ints([19, 18, 17, 16, 15, 14, 13]));
    Ok(())
}

#[test]
fn first_is_take_one() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints([42, 7, 9]), 2)?;
    assert_eq!(d.first()?, Some(json!(42)));

    let empty = engine.parallelize(vec![], 2)?;
    assert_eq!(empty.first()?, None);
    Ok(())
}

#[test]
fn reduce_combines_partials_in_partition_order() -> anyhow::Result<()> {
    let engine = test_engine();
    // string concatenation is not commutative, so out-of-order combination
    // would scramble the result
    let words: Vec<Value> = "the quick brown fox jumps over the lazy dog"
        .split(' ')
        .map(|w| json!(w))
        .collect();
    let out = engine.parallelize(words, 4)?.reduce(
        |acc, v, _| {
            let mut s = acc.as_str().unwrap_or("").to_string();
            s.push_str(v.as_str().unwrap());
            s.push(' ');
            json!(s)
        },
        json!(""),
    )?;
    assert_eq!(
        out.as_str().unwrap().trim_end(),
        "the quick brown fox jumps over the lazy dog"
    );
    Ok(())
}

#[test]
fn aggregate_with_explicit_combiner_and_options() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine.parallelize(ints(1..=10), 5)?.aggregate(
        |acc, v, _| json!(acc.as_i64().unwrap() + v.as_i64().unwrap()),
        |acc, partial, _| json!(acc.as_i64().unwrap() + partial.as_i64().unwrap()),
        json!(0),
        Value::Null,
        JobOptions {
            max_busy: Some(2),
            ..JobOptions::default()
        },
    )?;
    assert_eq!(out, json!(55));
    Ok(())
}

#[test]
fn for_each_visits_every_element() -> anyhow::Result<()> {
    let engine = test_engine();
    let visits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&visits);
    engine
        .parallelize(ints(0..250), 5)?
        .for_each(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        }, Value::Null)?;
    assert_eq!(visits.load(Ordering::Relaxed), 250);
    Ok(())
}

#[test]
fn count_sums_over_partitions() -> anyhow::Result<()> {
    let engine = test_engine();
    assert_eq!(engine.parallelize(ints(0..123), 7)?.count()?, 123);
    assert_eq!(engine.parallelize(vec![], 3)?.count()?, 0);
    Ok(())
}

#[test]
fn take_after_a_shuffle() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(pairs([("b", 2), ("a", 1), ("c", 3)]), 2)?
        .sort_by_key(true, Some(3))
        .take(2)?;
    assert_collections_equal(&out, &pairs([("a", 1), ("b", 2)]));
    Ok(())
}

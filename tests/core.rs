use gridiron::testing::*;
use serde_json::{json, Value};

#[test]
fn parallelize_map_collect_preserves_order() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = test_engine();
    let out = engine
        .parallelize(ints(1..=4), 2)?
        .map(|v, _| json!(v.as_i64().unwrap() * 2), Value::Null)
        .collect()?;
    assert_collections_equal(&out, &ints([2, 4, 6, 8]));
    Ok(())
}

#[test]
fn range_filter_count() -> anyhow::Result<()> {
    let engine = test_engine();
    let n = engine
        .range(0, 10, 1, 3)?
        .filter(|v, _| v.as_i64().unwrap() % 2 == 0, Value::Null)
        .count()?;
    assert_eq!(n, 5);
    Ok(())
}

#[test]
fn chained_maps_equal_composed_map() -> anyhow::Result<()> {
    let engine = test_engine();
    let data = ints(0..50);

    let chained = engine
        .parallelize(data.clone(), 4)?
        .map(|v, _| json!(v.as_i64().unwrap() + 3), Value::Null)
        .map(|v, _| json!(v.as_i64().unwrap() * 7), Value::Null)
        .collect()?;
    let composed = engine
        .parallelize(data, 4)?
        .map(|v, _| json!((v.as_i64().unwrap() + 3) * 7), Value::Null)
        .collect()?;
    assert_collections_equal(&chained, &composed);
    Ok(())
}

#[test]
fn filter_never_grows_a_dataset() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints(0..100), 5)?;
    let filtered = d.filter(|v, _| v.as_i64().unwrap() % 3 == 0, Value::Null);
    assert!(filtered.count()? <= d.count()?);
    Ok(())
}

#[test]
fn union_doubles_the_count_and_keeps_partition_order() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints([1, 2, 3]), 2)?;
    let u = d.union(&d);
    assert_eq!(u.count()?, 6);
    assert_collections_equal(&u.collect()?, &ints([1, 2, 3, 1, 2, 3]));
    Ok(())
}

#[test]
fn flat_map_and_args_carry_free_variables() -> anyhow::Result<()> {
    let engine = test_engine();
    let out = engine
        .parallelize(ints([1, 2]), 1)?
        .flat_map(
            |v, args| {
                let copies = args["copies"].as_u64().unwrap() as usize;
                std::iter::repeat(v.clone()).take(copies).collect()
            },
            json!({ "copies": 3 }),
        )
        .collect()?;
    assert_collections_equal(&out, &ints([1, 1, 1, 2, 2, 2]));
    Ok(())
}

#[test]
fn distinct_counts_unique_elements() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints([1, 2, 2, 3, 3, 3]), 3)?;
    assert_eq!(d.distinct(None).count()?, 3);

    // canonical equality keeps ints, floats, and strings apart
    let mixed = engine.parallelize(vec![json!(1), json!(1.0), json!("1"), json!(1)], 2)?;
    assert_eq!(mixed.distinct(None).count()?, 3);
    Ok(())
}

#[test]
fn keys_and_values_project_pairs() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(pairs([("a", 1), ("b", 2)]), 2)?;
    assert_collections_equal(&d.keys().collect()?, &[json!("a"), json!("b")]);
    assert_collections_equal(&d.values().collect()?, &ints([1, 2]));
    Ok(())
}

#[test]
fn bernoulli_sample_is_deterministic_per_seed() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints(0..2000), 4)?;
    let s = d.sample(false, 0.25, 77);
    let once = s.collect()?;
    let twice = s.collect()?;
    assert_collections_equal(&once, &twice);
    assert!(once.len() > 300 && once.len() < 700, "got {}", once.len());
    Ok(())
}

#[test]
fn poisson_sample_replicates_elements() -> anyhow::Result<()> {
    let engine = test_engine();
    let d = engine.parallelize(ints(0..2000), 4)?;
    let n = d.sample(true, 1.0, 5).count()? as f64;
    assert!((1400.0..2600.0).contains(&n), "got {n}");
    Ok(())
}

#[test]
fn named_functions_resolve_through_the_registry() -> anyhow::Result<()> {
    let engine = test_engine();
    engine
        .registry()
        .register_map("scale", |v, args| {
            json!(v.as_i64().unwrap() * args["by"].as_i64().unwrap())
        });
    let out = engine
        .parallelize(ints([1, 2, 3]), 2)?
        .map_named("scale", json!({ "by": 10 }))?
        .collect()?;
    assert_collections_equal(&out, &ints([10, 20, 30]));

    assert!(engine
        .parallelize(ints([1]), 1)?
        .map_named("nope", Value::Null)
        .is_err());
    Ok(())
}

#[test]
fn zero_partitions_is_a_synchronous_error() {
    let engine = test_engine();
    assert!(engine.parallelize(ints([1]), 0).is_err());
    assert!(engine.range(0, 5, 0, 2).is_err());
}

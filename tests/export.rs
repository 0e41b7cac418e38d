use flate2::read::{GzDecoder, MultiGzDecoder};
use gridiron::testing::*;
use gridiron::{Engine, EngineConfig, MemObjectStore, ObjectStore, SaveOptions, StreamOptions};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;

fn read_jsonl(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
    std::fs::read_to_string(path)?
        .lines()
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}

#[test]
fn save_writes_one_file_per_partition() -> anyhow::Result<()> {
    let engine = test_engine();
    let dir = tempfile::TempDir::new()?;
    let report = engine
        .parallelize(ints(0..10), 3)?
        .save(dir.path().to_str().unwrap(), &SaveOptions::default())?;

    assert_eq!(report.files.len(), 3);
    assert_eq!(report.rows, 10);

    let mut all = Vec::new();
    for pid in 0..3 {
        all.extend(read_jsonl(&dir.path().join(format!("part-{pid:05}.jsonl")))?);
    }
    assert_collections_equal(&all, &ints(0..10));
    Ok(())
}

#[test]
fn save_gzip_compresses_each_partition() -> anyhow::Result<()> {
    let engine = test_engine();
    let dir = tempfile::TempDir::new()?;
    engine.parallelize(ints(0..20), 2)?.save(
        dir.path().to_str().unwrap(),
        &SaveOptions {
            gzip: true,
            ..SaveOptions::default()
        },
    )?;

    let mut all = Vec::new();
    for pid in 0..2 {
        let bytes = std::fs::read(dir.path().join(format!("part-{pid:05}.jsonl.gz")))?;
        let mut text = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut text)?;
        for line in text.lines() {
            all.push(serde_json::from_str(line)?);
        }
    }
    assert_collections_equal(&all, &ints(0..20));
    Ok(())
}

#[test]
fn save_parquet_round_trips_object_rows() -> anyhow::Result<()> {
    let engine = test_engine();
    let dir = tempfile::TempDir::new()?;
    let rows: Vec<Value> = (0..30).map(|i| json!({"id": i, "name": format!("n{i}")})).collect();
    engine.parallelize(rows.clone(), 2)?.save(
        dir.path().to_str().unwrap(),
        &SaveOptions {
            parquet: true,
            ..SaveOptions::default()
        },
    )?;

    let mut all = Vec::new();
    for pid in 0..2 {
        all.extend(gridiron::io::parquet::read_rows(
            &dir.path().join(format!("part-{pid:05}.parquet")),
        )?);
    }
    assert_collections_equal(&all, &rows);
    Ok(())
}

#[test]
fn save_to_an_object_store_uri() -> anyhow::Result<()> {
    let store = MemObjectStore::new();
    let engine = Engine::local(EngineConfig {
        workers: 2,
        object_stores: vec![("s3".to_string(), store.clone() as Arc<dyn ObjectStore>)],
        ..EngineConfig::default()
    })?;

    let report = engine
        .parallelize(ints(0..6), 2)?
        .save("s3://results/run-1", &SaveOptions::default())?;
    assert_eq!(report.files.len(), 2);

    let mut all = Vec::new();
    for pid in 0..2 {
        let bytes = store.get("results", &format!("run-1/part-{pid:05}.jsonl"))?;
        for line in String::from_utf8(bytes)?.lines() {
            all.push(serde_json::from_str(line)?);
        }
    }
    assert_collections_equal(&all, &ints(0..6));
    Ok(())
}

#[test]
fn stream_pipes_partitions_in_order() -> anyhow::Result<()> {
    let engine = test_engine();
    let mut sink = Vec::new();
    let rows = engine
        .parallelize(ints(0..12), 3)?
        .stream_to(&mut sink, &StreamOptions::default())?;
    assert_eq!(rows, 12);

    let parsed: Vec<Value> = String::from_utf8(sink)?
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_collections_equal(&parsed, &ints(0..12));
    Ok(())
}

#[test]
fn gzip_stream_is_a_valid_multi_member_archive() -> anyhow::Result<()> {
    let engine = test_engine();
    let mut sink = Vec::new();
    engine.parallelize(ints(0..9), 3)?.stream_to(
        &mut sink,
        &StreamOptions {
            gzip: true,
            end: true,
        },
    )?;

    let mut text = String::new();
    MultiGzDecoder::new(&sink[..]).read_to_string(&mut text)?;
    let parsed: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_collections_equal(&parsed, &ints(0..9));
    Ok(())
}

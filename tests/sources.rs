use flate2::write::GzEncoder;
use flate2::Compression;
use gridiron::testing::*;
use gridiron::{Engine, EngineConfig, MemObjectStore, ObjectStore};
use serde_json::{json, Value};
use std::io::Write;

#[test]
fn text_file_partitions_are_disjoint_and_cover_every_line() -> anyhow::Result<()> {
    let engine = test_engine();
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("input.txt");
    let lines: Vec<String> = (0..200).map(|i| format!("row {i} of the input")).collect();
    std::fs::write(&path, format!("{}\n", lines.join("\n")))?;

    for parts in [1usize, 3, 8] {
        let out = engine.text_file(&path, parts)?.collect()?;
        let seen: Vec<String> = out
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(seen, lines, "{parts} partitions");
    }
    Ok(())
}

#[test]
fn gzip_file_is_a_single_partition_of_lines() -> anyhow::Result<()> {
    let engine = test_engine();
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("input.txt.gz");
    let mut enc = GzEncoder::new(std::fs::File::create(&path)?, Compression::fast());
    for i in 0..50 {
        writeln!(enc, "compressed line {i}")?;
    }
    enc.finish()?;

    let out = engine.gzip_file(&path).collect()?;
    assert_eq!(out.len(), 50);
    assert_eq!(out[0], json!("compressed line 0"));
    assert_eq!(out[49], json!("compressed line 49"));
    Ok(())
}

#[test]
fn files_source_globs_and_caps() -> anyhow::Result<()> {
    let engine = test_engine();
    let dir = tempfile::TempDir::new()?;
    for name in ["a.log", "b.log", "c.log", "skip.txt"] {
        std::fs::write(dir.path().join(name), format!("{name}-1\n{name}-2\n"))?;
    }

    let pattern = format!("{}/*.log", dir.path().display());
    assert_eq!(engine.files(&pattern, None).count()?, 6);
    // one partition per file, capped
    assert_eq!(engine.files(&pattern, Some(2)).count()?, 4);
    // a directory path lists everything inside
    assert_eq!(
        engine.files(dir.path().to_str().unwrap(), None).count()?,
        8
    );
    Ok(())
}

#[test]
fn missing_file_fails_the_job_with_context() {
    let engine = test_engine();
    let result = engine
        .text_file("/definitely/not/here.txt", 2)
        .and_then(|d| d.collect());
    assert!(result.is_err());
}

#[test]
fn objects_source_reads_one_partition_per_listed_object() -> anyhow::Result<()> {
    let engine = test_engine();
    let store = MemObjectStore::new();
    store.put("data", "logs/one", b"alpha\nbeta\n")?;
    store.put("data", "logs/two", b"gamma\n")?;
    store.put("data", "other/three", b"ignored\n")?;

    let d = engine.objects(store, "s3://data/logs/", None)?;
    let out = d.collect()?;
    assert_collections_equal(
        &out,
        &[json!("alpha"), json!("beta"), json!("gamma")],
    );
    Ok(())
}

#[test]
fn parquet_source_round_trips_rows() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("rows.parquet");
    let rows: Vec<Value> = (0..40).map(|i| json!({"id": i, "even": i % 2 == 0})).collect();
    gridiron::io::parquet::write_rows(std::fs::File::create(&path)?, &rows)?;

    let engine = test_engine();
    let out = engine.parquet_file(&path).collect()?;
    assert_collections_equal(&out, &rows);
    Ok(())
}

#[test]
fn single_worker_engine_still_runs_jobs() -> anyhow::Result<()> {
    let engine = Engine::local(EngineConfig {
        workers: 1,
        ..EngineConfig::default()
    })?;
    let out = engine
        .parallelize(ints(0..10), 4)?
        .map(|v, _| json!(v.as_i64().unwrap() * 3), Value::Null)
        .collect()?;
    assert_eq!(out.len(), 10);
    Ok(())
}

use anyhow::{Result, bail};
use chunkjoin::Prepared;
use chunkjoin::runner::failure_manifest_path;
use chunkjoin::{
    BroadcastSpec, BroadcastTable, Chunk, Column, OutputRecord, ReadOptions, Runner, Schema,
    StageConfig, StageError, StageSpec, StageState, Transform, classify,
};
use std::fs;
use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Emits `(index, name, reference row count)` for every row; fails on
/// configured row indices.
struct Echo {
    fail_on: Vec<u64>,
    panic_on: Vec<u64>,
}

impl Transform for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        input.require("name", None)?;
        Ok(Schema::new(vec![
            Column::numeric("index"),
            Column::text("name"),
            Column::numeric("reference_rows"),
        ]))
    }

    fn apply(&self, chunk: &Chunk, broadcast: Option<&BroadcastTable>) -> Result<Vec<OutputRecord>> {
        let name = chunk.column("name")?;
        let refs = broadcast.map_or(0, BroadcastTable::len);
        let mut out = Vec::new();
        for row in &chunk.rows {
            if self.fail_on.contains(&row.index) {
                bail!("cannot score row {}", row.index);
            }
            if self.panic_on.contains(&row.index) {
                panic!("row {} blew up", row.index);
            }
            out.push(OutputRecord::keyed(
                &[row.index],
                [row.values[name].clone(), refs.to_string()],
            ));
        }
        Ok(out)
    }
}

fn write_input(path: &Path, rows: u64) -> Result<()> {
    let mut text = String::from("idx,name\n");
    for i in 0..rows {
        text.push_str(&format!("{i},name{i}\n"));
    }
    fs::write(path, text)?;
    Ok(())
}

fn echo(fail_on: &[u64], panic_on: &[u64]) -> Arc<dyn Transform> {
    Arc::new(Echo {
        fail_on: fail_on.to_vec(),
        panic_on: panic_on.to_vec(),
    })
}

fn config() -> StageConfig {
    StageConfig::default()
        .with_chunk_size(10)
        .with_workers(3)
        .with_max_in_flight(2)
}

fn data_indices(path: &Path) -> Result<Vec<u64>> {
    let text = fs::read_to_string(path)?;
    let mut out: Vec<u64> = text
        .lines()
        .skip(1)
        .map(|l| l.split(',').next().unwrap_or_default().parse())
        .collect::<Result<_, _>>()?;
    out.sort_unstable();
    Ok(out)
}

#[test]
fn walks_through_every_state() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 25)?;

    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    let runner = Runner::new(config()).with_observer(move |s| seen.lock().unwrap().push(s));
    let report = runner.run(StageSpec::new("echo", &input, &output, echo(&[], &[])))?;

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            StageState::Init,
            StageState::Streaming,
            StageState::Draining,
            StageState::Done
        ]
    );
    assert_eq!(report.state, StageState::Done);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.rows_read, 25);
    assert_eq!(report.rows_written(), 25);
    assert!(report.summary.peak_in_flight <= 2);
    assert_eq!(data_indices(&output)?, (0..25).collect::<Vec<_>>());
    assert_eq!(
        fs::read_to_string(&output)?.lines().next(),
        Some("index,name,reference_rows")
    );
    Ok(())
}

#[test]
fn one_failing_chunk_does_not_stop_the_stage() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 50)?;

    let report = Runner::new(config()).run(StageSpec::new(
        "echo",
        &input,
        &output,
        echo(&[23], &[41]),
    ))?;

    assert_eq!(report.state, StageState::Done);
    assert_eq!(report.summary.completed, 3);
    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.rows_written(), 30);

    let expected: Vec<u64> = (0..20).chain(30..40).collect();
    assert_eq!(data_indices(&output)?, expected);

    let manifest = report.failure_manifest.clone().expect("manifest written");
    assert_eq!(manifest, failure_manifest_path(&output));
    let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(&manifest)?)?;
    let mut ranges: Vec<(u64, u64)> = v["failures"]
        .as_array()
        .expect("failures array")
        .iter()
        .map(|f| {
            (
                f["first_row"].as_u64().unwrap_or_default(),
                f["last_row"].as_u64().unwrap_or_default(),
            )
        })
        .collect();
    ranges.sort_unstable();
    assert_eq!(ranges, vec![(20, 29), (40, 49)]);
    Ok(())
}

#[test]
fn clean_rerun_removes_stale_manifest() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 15)?;

    let first = Runner::new(config()).run(StageSpec::new("echo", &input, &output, echo(&[3], &[])))?;
    assert!(first.failure_manifest.is_some());
    let second = Runner::new(config()).run(StageSpec::new("echo", &input, &output, echo(&[], &[])))?;
    assert!(second.is_clean());
    assert!(!failure_manifest_path(&output).exists());
    assert_eq!(data_indices(&output)?.len(), 15);
    Ok(())
}

#[test]
fn every_worker_sees_the_broadcast_table() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let reference = tmp.path().join("ref.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 40)?;
    fs::write(&reference, "idx,label\n0,a\n1,b\n2,c\n")?;

    let spec = StageSpec::new("echo", &input, &output, echo(&[], &[]))
        .with_broadcast(BroadcastSpec::new(&reference, ReadOptions::default()));
    let report = Runner::new(config().with_chunk_size(3)).run(spec)?;
    assert_eq!(report.rows_written(), 40);

    let text = fs::read_to_string(&output)?;
    assert!(text.lines().skip(1).all(|l| l.ends_with(",3")));
    Ok(())
}

#[test]
fn reader_error_mid_stream_fails_the_stage() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    fs::write(&input, "idx,name\n0,a\n1,b\n2,c,extra\n3,d\n")?;

    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    let runner = Runner::new(config().with_chunk_size(1))
        .with_observer(move |s| seen.lock().unwrap().push(s));
    let err = runner
        .run(StageSpec::new("echo", &input, &output, echo(&[], &[])))
        .unwrap_err();

    assert_eq!(classify(&err).map(StageError::kind), Some("schema"));
    assert_eq!(states.lock().unwrap().last(), Some(&StageState::Failed));
    // rows appended before the bad row are truncated away
    assert_eq!(fs::read_to_string(&output)?, "index,name,reference_rows\n");
    Ok(())
}

#[test]
fn failed_stage_keeps_its_error_when_metrics_cannot_be_saved() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    fs::write(&input, "idx,name\n0,a\n1,b,extra\n")?;

    // a directory cannot be written as a file
    let cfg = config()
        .with_chunk_size(1)
        .with_metrics_path(Some(tmp.path().to_path_buf()));
    let err = Runner::new(cfg)
        .run(StageSpec::new("echo", &input, &output, echo(&[], &[])))
        .unwrap_err();
    assert_eq!(classify(&err).map(StageError::kind), Some("schema"));
    Ok(())
}

#[test]
fn output_uses_the_input_delimiter() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    fs::write(&input, "idx;name\n0;a\n1;b\n")?;

    let spec = StageSpec::new("echo", &input, &output, echo(&[], &[]))
        .with_read(ReadOptions::default().with_delimiter(b';'));
    Runner::new(config()).run(spec)?;
    assert_eq!(
        fs::read_to_string(&output)?,
        "index;name;reference_rows\n0;a;0\n1;b;0\n"
    );
    Ok(())
}

/// Counts `prepare` calls and emits the prepared reference row count.
#[derive(Default)]
struct PrepareCounter {
    prepares: AtomicUsize,
}

impl Transform for PrepareCounter {
    fn name(&self) -> &str {
        "prepare-counter"
    }

    fn output_schema(&self, _input: &Schema) -> Result<Schema> {
        Ok(Schema::new(vec![
            Column::numeric("index"),
            Column::numeric("prepared_rows"),
        ]))
    }

    fn prepare(&self, broadcast: Option<&BroadcastTable>) -> Result<Option<Prepared>> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(broadcast.map_or(0, BroadcastTable::len))))
    }

    fn apply(&self, _chunk: &Chunk, _broadcast: Option<&BroadcastTable>) -> Result<Vec<OutputRecord>> {
        bail!("worker data was not passed to the transform")
    }

    fn apply_prepared(
        &self,
        chunk: &Chunk,
        _broadcast: Option<&BroadcastTable>,
        prepared: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<Vec<OutputRecord>> {
        let Some(rows) = prepared.and_then(|p| p.downcast_ref::<usize>()) else {
            bail!("missing worker data");
        };
        Ok(chunk
            .rows
            .iter()
            .map(|r| OutputRecord::keyed(&[r.index, *rows as u64], Vec::new()))
            .collect())
    }
}

#[test]
fn prepare_runs_once_per_worker_not_per_chunk() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let reference = tmp.path().join("ref.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 40)?;
    fs::write(&reference, "idx,label\n0,a\n1,b\n")?;

    let counter = Arc::new(PrepareCounter::default());
    let transform: Arc<dyn Transform> = counter.clone();
    let spec = StageSpec::new("count", &input, &output, transform)
        .with_broadcast(BroadcastSpec::new(&reference, ReadOptions::default()));
    let report = Runner::new(config().with_chunk_size(3)).run(spec)?;

    assert_eq!(report.chunks, 14);
    assert!(report.is_clean());
    assert_eq!(counter.prepares.load(Ordering::SeqCst), 3);
    let text = fs::read_to_string(&output)?;
    assert!(text.lines().skip(1).all(|l| l.ends_with(",2")));
    Ok(())
}

#[test]
fn bad_config_fails_before_init_completes() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 5)?;

    let err = Runner::new(config().with_max_in_flight(0))
        .run(StageSpec::new("echo", &input, &output, echo(&[], &[])))
        .unwrap_err();
    assert_eq!(classify(&err).map(StageError::kind), Some("config"));
    assert!(!output.exists());
    Ok(())
}

#[test]
fn missing_reference_file_fails_before_output_exists() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("in.csv");
    let output = tmp.path().join("out.csv");
    write_input(&input, 5)?;

    let spec = StageSpec::new("echo", &input, &output, echo(&[], &[]))
        .with_broadcast(BroadcastSpec::new(tmp.path().join("ref.csv"), ReadOptions::default()));
    let err = Runner::new(config()).run(spec).unwrap_err();
    assert_eq!(classify(&err).map(StageError::kind), Some("io"));
    assert!(!output.exists());
    Ok(())
}

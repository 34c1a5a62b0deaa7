use anyhow::Result;
use chunkjoin::{AppendSink, Column, OutputRecord, Schema, StageError, classify};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn schema() -> Schema {
    Schema::new(vec![
        Column::numeric("left_index"),
        Column::numeric("right_index"),
        Column::numeric("score"),
    ])
}

fn rec(l: u64, r: u64, s: f64) -> OutputRecord {
    OutputRecord::keyed(&[l, r], [s.to_string()])
}

#[test]
fn initialize_writes_exactly_one_header_line() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("nested/dir/out.csv");
    AppendSink::initialize(&out, &schema())?;
    assert_eq!(std::fs::read_to_string(&out)?, "left_index,right_index,score\n");
    Ok(())
}

#[test]
fn initialize_truncates_previous_output() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("out.csv");
    let sink = AppendSink::initialize(&out, &schema())?;
    sink.append(&[rec(0, 1, 0.5)])?;
    AppendSink::initialize(&out, &schema())?;
    assert_eq!(std::fs::read_to_string(&out)?.lines().count(), 1);
    Ok(())
}

#[test]
fn reset_leaves_only_the_header() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("out.csv");
    let sink = AppendSink::initialize(&out, &schema())?;
    sink.append(&[rec(0, 1, 0.5), rec(2, 3, 0.25)])?;
    sink.reset()?;
    assert_eq!(std::fs::read_to_string(&out)?, "left_index,right_index,score\n");

    sink.append(&[rec(4, 5, 1.0)])?;
    assert_eq!(std::fs::read_to_string(&out)?.lines().count(), 2);
    Ok(())
}

#[test]
fn custom_delimiter_applies_to_header_and_rows() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("out.csv");
    let sink = AppendSink::initialize_with_delimiter(&out, &schema(), b';')?;
    sink.append(&[rec(0, 1, 0.5)])?;
    assert_eq!(
        std::fs::read_to_string(&out)?,
        "left_index;right_index;score\n0;1;0.5\n"
    );
    Ok(())
}

#[test]
fn append_adds_rows_after_header() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("out.csv");
    let sink = AppendSink::initialize(&out, &schema())?;
    assert_eq!(sink.append(&[])?, 0);
    assert_eq!(sink.append(&[rec(0, 1, 0.5), rec(2, 1, 0.25)])?, 2);
    assert_eq!(sink.append(&[rec(3, 0, 1.0)])?, 1);

    let text = std::fs::read_to_string(&out)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec!["left_index,right_index,score", "0,1,0.5", "2,1,0.25", "3,0,1"]
    );
    Ok(())
}

#[test]
fn bad_records_fail_the_whole_block() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("out.csv");
    let sink = AppendSink::initialize(&out, &schema())?;

    let short = OutputRecord::new(vec!["1".into()]);
    let err = sink.append(&[rec(0, 0, 0.1), short]).unwrap_err();
    assert_eq!(classify(&err).map(StageError::kind), Some("schema"));

    let text_in_numeric = OutputRecord::new(vec!["1".into(), "2".into(), "high".into()]);
    assert!(sink.append(&[text_in_numeric]).is_err());

    assert_eq!(std::fs::read_to_string(&out)?.lines().count(), 1);
    Ok(())
}

#[test]
fn empty_schema_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let err = AppendSink::initialize(tmp.path().join("out.csv"), &Schema::default()).unwrap_err();
    assert_eq!(classify(&err).map(StageError::kind), Some("schema"));
    Ok(())
}

#[test]
fn concurrent_appends_never_interleave() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("out.csv");
    let sink = Arc::new(AppendSink::initialize(&out, &schema())?);

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let sink = Arc::clone(&sink);
            thread::spawn(move || -> Result<()> {
                for block in 0..20u64 {
                    let records: Vec<OutputRecord> =
                        (0..50).map(|i| rec(t, block * 50 + i, 0.5)).collect();
                    sink.append(&records)?;
                }
                Ok(())
            })
        })
        .collect();
    for h in handles {
        h.join().expect("writer thread")?;
    }

    let text = std::fs::read_to_string(&out)?;
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("left_index,right_index,score"));
    let body: Vec<&str> = lines.collect();
    assert_eq!(body.len(), 8 * 20 * 50);

    // every block of 50 lines comes from one writer, in order
    for block in body.chunks(50) {
        let writer = block[0].split(',').next();
        assert!(block.iter().all(|l| l.split(',').next() == writer));
        let rights: Vec<u64> = block
            .iter()
            .map(|l| l.split(',').nth(1).unwrap().parse().unwrap())
            .collect();
        assert!(rights.windows(2).all(|w| w[1] == w[0] + 1));
    }
    let unique: HashSet<&str> = body.iter().copied().collect();
    assert_eq!(unique.len(), body.len());
    Ok(())
}

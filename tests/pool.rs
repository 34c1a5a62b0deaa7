use anyhow::{Result, bail};
use chunkjoin::{StageError, TaskLabel, WorkerPool, classify};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn label(chunk: u64) -> TaskLabel {
    TaskLabel {
        chunk,
        first_row: chunk * 10,
        last_row: chunk * 10 + 9,
        rows: 10,
    }
}

#[test]
fn in_flight_never_exceeds_cap() -> Result<()> {
    let pool = WorkerPool::start(4, 3, |_| Ok(()))?;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for c in 0..40 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        pool.submit(label(c), move |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(1)
        });
        assert!(pool.in_flight() <= 3);
    }
    let summary = pool.shutdown();

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(summary.peak_in_flight <= 3);
    assert_eq!(summary.submitted, 40);
    assert_eq!(summary.completed, 40);
    assert_eq!(summary.rows_written, 40);
    Ok(())
}

#[test]
fn submit_blocks_until_capacity_frees() -> Result<()> {
    let pool = WorkerPool::start(2, 1, |_| Ok(()))?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    pool.submit(label(0), move |_| {
        thread::sleep(Duration::from_millis(50));
        o.lock().unwrap().push("task 0 done");
        Ok(0)
    });
    // cap of one: this returns only after task 0 finished
    let o = Arc::clone(&order);
    pool.submit(label(1), move |_| {
        o.lock().unwrap().push("task 1 done");
        Ok(0)
    });
    order.lock().unwrap().push("second submit returned");
    pool.wait_idle();

    let order = order.lock().unwrap().clone();
    assert_eq!(order[0], "task 0 done");
    assert_eq!(order.len(), 3);
    Ok(())
}

#[test]
fn failures_and_panics_are_isolated() -> Result<()> {
    let pool = WorkerPool::start(3, 4, |_| Ok(()))?;
    for c in 0..10u64 {
        pool.submit(label(c), move |_| match c {
            3 => bail!("bad chunk"),
            7 => panic!("chunk seven exploded"),
            _ => Ok(2),
        });
    }
    let summary = pool.shutdown();

    assert_eq!(summary.submitted, 10);
    assert_eq!(summary.completed, 8);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.rows_written, 16);

    let mut failed: Vec<_> = summary.failures.iter().map(|f| f.label.chunk).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec![3, 7]);
    let seven = summary.failures.iter().find(|f| f.label.chunk == 7).unwrap();
    assert!(seven.error.contains("chunk seven exploded"));
    assert_eq!(seven.label.first_row, 70);
    assert_eq!(seven.to_stage_error().kind(), "task");
    Ok(())
}

#[test]
fn io_failures_are_kept_as_fatal() -> Result<()> {
    let pool = WorkerPool::start(2, 2, |_| Ok(()))?;
    pool.submit(label(0), |_| {
        Err(StageError::io("out.csv", std::io::Error::other("disk full")).into())
    });
    pool.submit(label(1), |_| Ok(1));
    pool.wait_idle();

    assert!(pool.has_fatal());
    let fatal = pool.take_fatal().expect("fatal error");
    assert_eq!(classify(&fatal).map(StageError::kind), Some("io"));
    let summary = pool.shutdown();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    Ok(())
}

#[test]
fn each_worker_initializes_once_and_tasks_see_own_state() -> Result<()> {
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&inits);
    let pool = WorkerPool::start(4, 8, move |worker| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(worker)
    })?;
    assert_eq!(pool.workers(), 4);
    assert_eq!(inits.load(Ordering::SeqCst), 4);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for c in 0..32 {
        let seen = Arc::clone(&seen);
        pool.submit(label(c), move |state: &usize| {
            seen.lock().unwrap().push(*state);
            Ok(0)
        });
    }
    pool.shutdown();

    assert_eq!(inits.load(Ordering::SeqCst), 4);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 32);
    assert!(seen.iter().all(|&w| w < 4));
    Ok(())
}

#[test]
fn init_failure_and_zero_sizes_are_errors() {
    let err = WorkerPool::<()>::start(2, 2, |w| {
        if w == 1 {
            bail!("cannot load reference table")
        }
        Ok(())
    })
    .err()
    .expect("init should fail");
    assert!(format!("{err:#}").contains("cannot load reference table"));

    assert!(WorkerPool::start(0, 1, |_| Ok(())).is_err());
    assert!(WorkerPool::start(1, 0, |_| Ok(())).is_err());
}

//! Correctness tests.
//!
//! End-to-end scenarios driving the tiled store through its public
//! surface: build, flush, finish, reopen, and the three query kinds.

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

use st_history_types::codec::CodecError;
use st_history_types::{HistoryError, Quark, StateInterval, StateValue};
use st_tile_store::{TiledHistoryStore, IGNORE_PROVIDER_VERSION};

// ---

fn interval(start: i64, end: i64, quark: Quark, value: impl Into<StateValue>) -> StateInterval {
    StateInterval::new(start, end, quark, value.into())
}

#[test]
fn basic_roundtrip() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("basic.ht");

    let mut store = TiledHistoryStore::open_new_auto("basic", 0, 30, 1, &path)?;
    store.insert(interval(0, 10, 0, "A"))?;
    store.insert(interval(10, 20, 0, "B"))?;
    store.insert(interval(0, 5, 1, 42_i32))?;
    store.insert(interval(5, 30, 1, 99_i32))?;
    store.finished_building(30)?;

    let mut buffer = vec![None, None];
    store.point_query(7, &mut buffer)?;
    assert_eq!(buffer[0].as_ref().unwrap().value, "A".into());
    assert_eq!(buffer[1].as_ref().unwrap().value, 99_i32.into());

    buffer.fill(None);
    store.point_query(15, &mut buffer)?;
    assert_eq!(buffer[0].as_ref().unwrap().value, "B".into());
    assert_eq!(buffer[1].as_ref().unwrap().value, 99_i32.into());

    // At the very end of the trace: q1's last interval covers 30; q0 has no
    // interval covering 30, so it has no state there.
    buffer.fill(None);
    store.point_query(30, &mut buffer)?;
    assert!(buffer[0].is_none());
    assert_eq!(buffer[1].as_ref().unwrap().value, 99_i32.into());

    assert_eq!(
        store.singular_query(7, 0)?.unwrap().value,
        StateValue::from("A")
    );
    assert_eq!(store.singular_query(25, 0)?, None);

    // Queries outside the trace range are an error.
    assert!(matches!(
        store.singular_query(31, 0),
        Err(HistoryError::TimeOutOfRange { .. })
    ));

    store.sanity_check()?;
    store.dispose()?;
    Ok(())
}

#[test]
fn tile_rollover_and_reopen() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rollover.ht");

    // Tiny tiles: resolution 10 × 2 pixels = one tile per 20 time units.
    let mut store = TiledHistoryStore::open_new("rollover", &path, 1, 0, 2, &[10])?;
    for (i, t) in (0..=96).step_by(3).enumerate() {
        store.insert(interval(t, t + 2, 0, i as i32))?;
    }
    store.finished_building(100)?;

    assert!(
        store.stats().num_tiles_flushed >= 5,
        "expected at least 5 tiles, got {}",
        store.stats().num_tiles_flushed
    );

    // A second finish with the same end time is a no-op.
    let stats = store.stats();
    store.finished_building(100)?;
    assert_eq!(store.stats(), stats);

    store.sanity_check()?;

    // Reopening the file gives back the same answers.
    let reopened = TiledHistoryStore::open_existing("rollover", 1, &path)?;
    assert_eq!(reopened.start_time(), 0);
    assert_eq!(reopened.end_time(), 100);

    for t in [1, 25, 50, 77, 98] {
        similar_asserts::assert_eq!(
            reopened.singular_query(t, 0)?,
            store.singular_query(t, 0)?,
            "query at {t}"
        );
    }
    // t = 50 falls inside the run started at 48 (the 17th insertion).
    assert_eq!(
        reopened.singular_query(50, 0)?.unwrap().value,
        StateValue::Int32(16)
    );

    reopened.sanity_check()?;
    Ok(())
}

#[test]
fn multi_resolution_fallback() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fallback.ht");

    let mut store = TiledHistoryStore::open_new("fallback", &path, 1, 0, 10, &[100, 25])?;
    store.insert(interval(42, 43, 0, "X"))?;
    store.finished_building(100)?;

    // The short run survives at every level (nothing to coalesce it with),
    // and the point descent finds it.
    assert_eq!(
        store.singular_query(42, 0)?.unwrap().value,
        StateValue::from("X")
    );
    assert_eq!(store.singular_query(50, 0)?, None);

    let hits: Vec<_> = store.range_query(&[0], &[0, 50, 100]).collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].value, "X".into());

    Ok(())
}

#[test]
fn resolution_selection() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("selection.ht");

    // Levels: r0 = 100 (cut-off disabled), r1 = 25.
    let mut store = TiledHistoryStore::open_new("selection", &path, 1, 0, 10, &[100, 25])?;
    store.insert(interval(0, 10, 0, "on"))?;
    store.insert(interval(11, 20, 0, "off"))?;
    store.finished_building(1000)?;

    // Step 100: level 0 serves the walk. The coarsest level never coalesces,
    // so both short runs are there.
    let times: Vec<i64> = (0..=1000).step_by(100).collect();
    let coarse: Vec<_> = store.range_query(&[0], &times).collect();
    assert_eq!(coarse.len(), 2);

    // Step 50: the smallest level index with r <= 50 is level 1, where the
    // two sub-resolution runs were coalesced into one.
    let times: Vec<i64> = (0..=1000).step_by(50).collect();
    let fine: Vec<_> = store.range_query(&[0], &times).collect();
    assert_eq!(fine.len(), 1);
    assert_eq!(fine[0].start, 0);
    assert_eq!(fine[0].end, 20);
    assert_eq!(fine[0].value, "on".into());

    Ok(())
}

#[test]
fn corrupt_file_is_rejected() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("corrupt.ht");
    std::fs::write(&path, [0xAB_u8; 64])?;

    assert!(matches!(
        TiledHistoryStore::open_existing("corrupt", 1, &path),
        Err(HistoryError::Corrupt(CodecError::BadMagic))
    ));
    Ok(())
}

#[test]
fn provider_version_is_checked() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("versioned.ht");

    let mut store = TiledHistoryStore::open_new_auto("versioned", 0, 100, 7, &path)?;
    store.insert(interval(0, 100, 0, 1_i32))?;
    store.finished_building(100)?;
    drop(store);

    assert!(matches!(
        TiledHistoryStore::open_existing("versioned", 8, &path),
        Err(HistoryError::Corrupt(
            CodecError::ProviderVersionMismatch { expected: 8, got: 7 }
        ))
    ));

    // The sentinel opts out of the check.
    let reopened = TiledHistoryStore::open_existing("versioned", IGNORE_PROVIDER_VERSION, &path)?;
    assert_eq!(reopened.singular_query(50, 0)?.unwrap().value, 1_i32.into());
    Ok(())
}

#[test]
fn unfinished_history_is_deleted_on_dispose() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("unfinished.ht");

    let mut store = TiledHistoryStore::open_new_auto("unfinished", 0, 100, 1, &path)?;
    store.insert(interval(0, 50, 0, "gone"))?;
    store.dispose()?;

    assert!(!path.exists());
    assert!(matches!(
        store.singular_query(10, 0),
        Err(HistoryError::Disposed)
    ));
    Ok(())
}

#[test]
fn long_intervals_found_via_coarser_levels() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("descent.ht");

    // Level 1 tiles span 250 time units; an interval covering the whole
    // trace ends in the last tile, so a fine-level lookup early in the
    // trace must fall back to the coarsest level to see it.
    let mut store = TiledHistoryStore::open_new("descent", &path, 1, 0, 10, &[100, 25])?;
    store.insert(interval(0, 900, 0, "everywhere"))?;
    store.insert(interval(10, 20, 1, "blip"))?;
    store.finished_building(1000)?;

    for t in [0, 100, 400, 899] {
        assert_eq!(
            store.singular_query(t, 0)?.unwrap().value,
            StateValue::from("everywhere"),
            "query at {t}"
        );
    }
    assert_eq!(store.singular_query(901, 0)?, None);

    let mut buffer = vec![None, None];
    store.point_query(15, &mut buffer)?;
    assert_eq!(buffer[0].as_ref().unwrap().value, "everywhere".into());
    assert_eq!(buffer[1].as_ref().unwrap().value, "blip".into());

    Ok(())
}

// ---

fn init_logs() {
    static INIT: AtomicBool = AtomicBool::new(false);

    if INIT.compare_exchange(false, true, SeqCst, SeqCst).is_ok() {
        st_log::set_default_rust_log_env();
        tracing_subscriber::fmt::init(); // log to stdout
    }
}

//! End-to-end partial-history scenarios: checkpoint cadence, miss+replay,
//! tail queries, and equivalence with a full in-memory history.

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

use parking_lot::Mutex;

use st_history_types::{
    AttributeTree, HistoryBackend, HistoryError, HistoryResult, Quark, StateInterval,
    StateProvider, StateValue, TimeRange, TraceEvent, TraceSource,
};
use st_partial_history::{MemoryBackend, PartialHistoryStore, ShadowStateSystem};

// --- Test collaborators ---

/// A flat attribute tree over single-segment paths.
struct TestTree {
    names: Mutex<Vec<String>>,
}

impl TestTree {
    fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            names: Mutex::new(names.iter().map(|s| (*s).to_owned()).collect()),
        })
    }
}

impl AttributeTree for TestTree {
    fn number_of_attributes(&self) -> usize {
        self.names.lock().len()
    }

    fn quark_for_path(&self, path: &[&str]) -> Option<Quark> {
        let names = self.names.lock();
        names
            .iter()
            .position(|name| path.len() == 1 && path[0] == name)
            .map(|i| i as Quark)
    }

    fn quark_for_path_or_create(&self, path: &[&str]) -> Quark {
        if let Some(quark) = self.quark_for_path(path) {
            return quark;
        }
        let mut names = self.names.lock();
        names.push(path[0].to_owned());
        (names.len() - 1) as Quark
    }
}

/// One state change of the toggle attribute.
struct ToggleEvent {
    ts: i64,
    value: &'static str,
}

impl TraceEvent for ToggleEvent {
    fn timestamp(&self) -> i64 {
        self.ts
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Replays a fixed event list.
struct VecSource {
    events: Vec<(i64, &'static str)>,
}

impl TraceSource for VecSource {
    fn events_in(
        &self,
        range: TimeRange,
        f: &mut dyn FnMut(&dyn TraceEvent),
    ) -> HistoryResult<()> {
        for &(ts, value) in &self.events {
            if range.contains(ts) {
                f(&ToggleEvent { ts, value });
            }
        }
        Ok(())
    }
}

/// A source whose request always gets cancelled.
struct CancelledSource;

impl TraceSource for CancelledSource {
    fn events_in(
        &self,
        _range: TimeRange,
        _f: &mut dyn FnMut(&dyn TraceEvent),
    ) -> HistoryResult<()> {
        Err(HistoryError::Cancelled)
    }
}

/// Applies toggle events to the shadow, the same way it would have applied
/// them to the primary during the original build.
struct ToggleProvider {
    shadow: Arc<ShadowStateSystem>,
    quark: Quark,
}

impl StateProvider for ToggleProvider {
    fn start_time(&self) -> i64 {
        0
    }

    fn process_event(&mut self, event: &dyn TraceEvent) {
        let event = event
            .as_any()
            .downcast_ref::<ToggleEvent>()
            .expect("unexpected event type");
        self.shadow
            .modify_attribute(event.ts, self.quark, event.value.into());
    }
}

// ---

const EVENTS: &[(i64, &'static str)] = &[(3, "on"), (7, "off"), (13, "on"), (19, "off")];
const TRACE_END: i64 = 25;

/// The full interval list the events describe, starting "off" at t = 0.
fn full_intervals() -> Vec<StateInterval> {
    let mut out = Vec::new();
    let (mut prev_t, mut prev_v) = (0, "off");
    for &(ts, value) in EVENTS {
        out.push(StateInterval::new(prev_t, ts - 1, 0, prev_v.into()));
        (prev_t, prev_v) = (ts, value);
    }
    out.push(StateInterval::new(prev_t, TRACE_END, 0, prev_v.into()));
    out
}

/// Builds a partial history over `inner`, feeding it the build-time
/// intervals the provider would have produced.
fn build_partial(
    inner: Box<dyn HistoryBackend>,
    granularity: i64,
) -> HistoryResult<PartialHistoryStore> {
    let shadow = ShadowStateSystem::new();
    shadow.assign_upstream(TestTree::new(&["toggle"]));

    let provider = ToggleProvider {
        shadow: shadow.clone(),
        quark: 0,
    };
    let source = VecSource {
        events: EVENTS.to_vec(),
    };

    let mut store = PartialHistoryStore::new(
        inner,
        shadow,
        Box::new(provider),
        Box::new(source),
        granularity,
        0,
    );
    for interval in full_intervals() {
        store.insert(interval)?;
    }
    store.finished_building(TRACE_END)?;
    Ok(store)
}

/// The oracle: a full history fed the exact same intervals.
fn build_oracle() -> HistoryResult<MemoryBackend> {
    let mut oracle = MemoryBackend::new(0);
    for interval in full_intervals() {
        oracle.insert(interval)?;
    }
    oracle.finished_building(TRACE_END)?;
    Ok(oracle)
}

#[test]
fn miss_triggers_replay() -> anyhow::Result<()> {
    init_logs();

    let store = build_partial(Box::new(MemoryBackend::new(0)), 10)?;

    // t = 14 sits between checkpoints 10 and 20; the covering interval
    // (13..=18) crossed neither, so it only exists via replay.
    let found = store.singular_query(14, 0)?.unwrap();
    assert_eq!(found.value, StateValue::from("on"));
    assert_eq!((found.start, found.end), (13, 18));

    Ok(())
}

#[test]
fn tail_query_finds_final_state() -> anyhow::Result<()> {
    init_logs();

    let store = build_partial(Box::new(MemoryBackend::new(0)), 10)?;

    // The last checkpoint is written after the last interval; querying the
    // trace end must still resolve.
    let found = store.singular_query(TRACE_END, 0)?.unwrap();
    assert_eq!(found.value, StateValue::from("off"));
    assert_eq!(found.end, TRACE_END);

    Ok(())
}

#[test]
fn matches_full_history_everywhere() -> anyhow::Result<()> {
    init_logs();

    let store = build_partial(Box::new(MemoryBackend::new(0)), 10)?;
    let oracle = build_oracle()?;

    for t in 0..=TRACE_END {
        similar_asserts::assert_eq!(
            store.singular_query(t, 0)?,
            oracle.singular_query(t, 0)?,
            "query at {t}"
        );
    }
    Ok(())
}

#[test]
fn matches_full_history_over_tiled_inner() -> anyhow::Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("partial-inner.ht");
    let inner = st_tile_store::TiledHistoryStore::open_new_auto("inner", 0, TRACE_END, 1, &path)?;

    let store = build_partial(Box::new(inner), 10)?;
    let oracle = build_oracle()?;

    for t in 0..=TRACE_END {
        similar_asserts::assert_eq!(
            store.singular_query(t, 0)?,
            oracle.singular_query(t, 0)?,
            "query at {t}"
        );
    }
    Ok(())
}

#[test]
fn point_query_fills_whole_buffer() -> anyhow::Result<()> {
    init_logs();

    let store = build_partial(Box::new(MemoryBackend::new(0)), 10)?;

    // Slot 1 is the synthetic checkpoint attribute.
    let mut buffer = vec![None, None];
    store.point_query(14, &mut buffer)?;

    let toggle = buffer[0].as_ref().unwrap();
    assert_eq!(toggle.value, StateValue::from("on"));
    assert_eq!((toggle.start, toggle.end), (13, 18));

    let checkpoint = buffer[1].as_ref().unwrap();
    assert!(checkpoint.contains(14));

    Ok(())
}

#[test]
fn fine_range_query_replays_the_window() -> anyhow::Result<()> {
    init_logs();

    let store = build_partial(Box::new(MemoryBackend::new(0)), 10)?;

    let times: Vec<i64> = (0..=TRACE_END).collect();
    let mut hits: Vec<_> = store.range_query(&[0], &times).collect();
    hits.sort_by_key(|interval| interval.start);

    similar_asserts::assert_eq!(hits, full_intervals());
    Ok(())
}

#[test]
fn coarse_range_query_delegates_to_inner() -> anyhow::Result<()> {
    init_logs();

    let store = build_partial(Box::new(MemoryBackend::new(0)), 10)?;

    // Step 25 >= 2 × granularity: resampled onto the checkpoint grid and
    // answered from the inner store alone.
    let hits: Vec<_> = store.range_query(&[0], &[0, 25]).collect();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|interval| interval.value == "off".into()));
    Ok(())
}

#[test]
fn cancelled_replay_propagates_and_releases_the_lock() -> anyhow::Result<()> {
    init_logs();

    let shadow = ShadowStateSystem::new();
    shadow.assign_upstream(TestTree::new(&["toggle"]));
    let provider = ToggleProvider {
        shadow: shadow.clone(),
        quark: 0,
    };

    let mut store = PartialHistoryStore::new(
        Box::new(MemoryBackend::new(0)),
        shadow.clone(),
        Box::new(provider),
        Box::new(CancelledSource),
        10,
        0,
    );
    for interval in full_intervals() {
        store.insert(interval)?;
    }
    store.finished_building(TRACE_END)?;

    assert!(matches!(
        store.singular_query(14, 0),
        Err(HistoryError::Cancelled)
    ));

    // The query lock was released on the error path.
    drop(shadow.take_query_lock());
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

use std::sync::Arc;

use nohash_hasher::IntMap;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use st_history_types::{
    AttributeTree, HistoryError, HistoryResult, Quark, StateInterval, StateValue, TimeRange,
};

// ---

/// Path of the synthetic attribute that carries the checkpoint index.
///
/// This is the only attribute the shadow is allowed to create in the
/// upstream tree.
pub const CHECKPOINT_ATTRIBUTE: &str = "checkpoint";

/// An in-memory state-system facade used during partial-history replay.
///
/// The shadow exposes the read and "ongoing state" surface of a primary
/// state-system while forbidding any mutation of the attribute tree. It is
/// created before the primary exists (the two depend on each other), so the
/// upstream handle arrives later through a one-shot latch: readers that get
/// here first block in [`Self::attribute_tree`] until
/// [`Self::assign_upstream`] runs.
#[derive(Default)]
pub struct ShadowStateSystem {
    upstream: Mutex<Option<Arc<dyn AttributeTree>>>,
    upstream_ready: Condvar,

    /// Serialises replays: `replace_ongoing` → replay → read is only
    /// meaningful under this lock.
    query_lock: Mutex<()>,

    state: RwLock<ShadowState>,
}

#[derive(Default)]
struct ShadowState {
    /// The current interval per quark, indexed by quark.
    ongoing: Vec<Option<StateInterval>>,

    /// Intervals closed during the current replay window.
    window: IntMap<Quark, Vec<StateInterval>>,

    /// Upper bound of the current replay window; replay-created ongoing
    /// intervals end here.
    window_end: i64,
}

/// Held for the duration of one replay; dropping it releases the lock, so
/// every exit path (including errors) releases.
pub struct ShadowQueryGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ShadowStateSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Single-shot handshake: hands the shadow its upstream's attribute
    /// tree and releases every reader blocked on it.
    ///
    /// Panics if called twice.
    pub fn assign_upstream(&self, tree: Arc<dyn AttributeTree>) {
        let mut upstream = self.upstream.lock();
        assert!(
            upstream.is_none(),
            "the shadow's upstream can only be assigned once"
        );
        *upstream = Some(tree);
        self.upstream_ready.notify_all();
    }

    /// The upstream's attribute tree. Blocks until the upstream is
    /// assigned.
    pub fn attribute_tree(&self) -> Arc<dyn AttributeTree> {
        let mut upstream = self.upstream.lock();
        loop {
            if let Some(tree) = upstream.as_ref() {
                return tree.clone();
            }
            self.upstream_ready.wait(&mut upstream);
        }
    }

    pub fn number_of_attributes(&self) -> usize {
        self.attribute_tree().number_of_attributes()
    }

    pub fn has_quark(&self, path: &[&str]) -> bool {
        self.attribute_tree().has_quark(path)
    }

    /// Resolves `path` to a quark.
    ///
    /// Only the synthetic [`CHECKPOINT_ATTRIBUTE`] may be created through
    /// the shadow; any other missing path is
    /// [`HistoryError::AttributeTreeImmutable`].
    pub fn quark_for_path_or_create(&self, path: &[&str]) -> HistoryResult<Quark> {
        let tree = self.attribute_tree();
        if path.len() == 1 && path[0] == CHECKPOINT_ATTRIBUTE {
            Ok(tree.quark_for_path_or_create(path))
        } else {
            tree.quark_for_path(path)
                .ok_or(HistoryError::AttributeTreeImmutable)
        }
    }

    /// Direct attribute creation is always refused: the tree belongs to the
    /// primary.
    pub fn add_attribute(&self, _path: &[&str]) -> HistoryResult<Quark> {
        Err(HistoryError::AttributeTreeImmutable)
    }

    /// Takes the exclusive replay lock; exactly one replay runs at a time.
    pub fn take_query_lock(&self) -> ShadowQueryGuard<'_> {
        ShadowQueryGuard {
            _guard: self.query_lock.lock(),
        }
    }

    /// Atomically substitutes the current-state vector with a checkpoint
    /// snapshot and opens a fresh replay window reaching to `window_end`.
    /// The attribute tree is untouched.
    pub fn replace_ongoing(&self, snapshot: Vec<Option<StateInterval>>, window_end: i64) {
        let mut state = self.state.write();
        state.ongoing = snapshot;
        state.window.clear();
        state.window_end = window_end;
    }

    /// Applies one state change at `t`: the quark's previous interval (if
    /// any) is closed at `t - 1` and recorded, and a new ongoing interval
    /// starts at `t`.
    ///
    /// This is what the state provider calls while replaying events.
    pub fn modify_attribute(&self, t: i64, quark: Quark, value: StateValue) {
        let mut state = self.state.write();
        let idx = quark as usize;
        if state.ongoing.len() <= idx {
            state.ongoing.resize(idx + 1, None);
        }

        if let Some(prev) = state.ongoing[idx].take()
            && prev.start < t
        {
            let closed = StateInterval::new(prev.start, t - 1, quark, prev.value);
            state.window.entry(quark).or_default().push(closed);
        }
        // A same-timestamp change simply overwrites the pending interval.

        let end = state.window_end.max(t);
        state.ongoing[idx] = Some(StateInterval::new(t, end, quark, value));
    }

    /// Seals the replay window at `t`: no event will arrive past it, so
    /// every ongoing interval ends there. Used when a query sits at the
    /// trace tail.
    pub fn close_history(&self, t: i64) {
        let mut state = self.state.write();
        state.window_end = t;
        for slot in state.ongoing.iter_mut().flatten() {
            slot.end = slot.end.min(t).max(slot.start);
        }
    }

    /// The full state at `t`: for each quark, the interval covering `t`
    /// from the replay window or the ongoing vector, `None` where the quark
    /// holds no state.
    pub fn state_at(&self, t: i64) -> Vec<Option<StateInterval>> {
        let state = self.state.read();
        (0..state.ongoing.len() as Quark)
            .map(|quark| Self::lookup(&state, t, quark))
            .collect()
    }

    /// The interval covering `t` for one quark, if the shadow knows it.
    pub fn singular_state_at(&self, t: i64, quark: Quark) -> Option<StateInterval> {
        Self::lookup(&self.state.read(), t, quark)
    }

    fn lookup(state: &ShadowState, t: i64, quark: Quark) -> Option<StateInterval> {
        if let Some(Some(ongoing)) = state.ongoing.get(quark as usize)
            && ongoing.contains(t)
        {
            return Some(ongoing.clone());
        }
        state
            .window
            .get(&quark)?
            .iter()
            .find(|interval| interval.contains(t))
            .cloned()
    }

    /// Every interval of `quarks` intersecting `range`, out of the replay
    /// window and the ongoing vector.
    pub fn intervals_in(&self, quarks: &[Quark], range: TimeRange) -> Vec<StateInterval> {
        let state = self.state.read();
        let mut out = Vec::new();
        for &quark in quarks {
            if let Some(closed) = state.window.get(&quark) {
                out.extend(
                    closed
                        .iter()
                        .filter(|interval| interval.intersects(range))
                        .cloned(),
                );
            }
            if let Some(Some(ongoing)) = state.ongoing.get(quark as usize)
                && ongoing.intersects(range)
            {
                out.push(ongoing.clone());
            }
        }
        out
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTree {
        names: parking_lot::Mutex<Vec<String>>,
    }

    impl FixedTree {
        fn new(names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                names: parking_lot::Mutex::new(names.iter().map(|s| (*s).to_owned()).collect()),
            })
        }
    }

    impl AttributeTree for FixedTree {
        fn number_of_attributes(&self) -> usize {
            self.names.lock().len()
        }

        fn quark_for_path(&self, path: &[&str]) -> Option<Quark> {
            let names = self.names.lock();
            names
                .iter()
                .position(|n| path.len() == 1 && path[0] == n)
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

    #[test]
    fn latch_blocks_until_upstream_is_assigned() {
        let shadow = ShadowStateSystem::new();
        let (tx, rx) = std::sync::mpsc::channel();

        let reader = {
            let shadow = shadow.clone();
            std::thread::spawn(move || {
                tx.send(()).unwrap();
                shadow.attribute_tree().number_of_attributes()
            })
        };

        rx.recv().unwrap();
        // The reader is now (about to be) parked on the latch.
        std::thread::sleep(std::time::Duration::from_millis(20));
        shadow.assign_upstream(FixedTree::new(&["a", "b"]));

        assert_eq!(reader.join().unwrap(), 2);
    }

    #[test]
    fn tree_is_immutable_through_the_shadow() {
        let shadow = ShadowStateSystem::new();
        shadow.assign_upstream(FixedTree::new(&["cpu"]));

        assert_eq!(shadow.quark_for_path_or_create(&["cpu"]).unwrap(), 0);
        assert!(matches!(
            shadow.quark_for_path_or_create(&["memory"]),
            Err(HistoryError::AttributeTreeImmutable)
        ));
        assert!(matches!(
            shadow.add_attribute(&["memory"]),
            Err(HistoryError::AttributeTreeImmutable)
        ));

        // The one exception: the synthetic checkpoint attribute.
        let quark = shadow
            .quark_for_path_or_create(&[CHECKPOINT_ATTRIBUTE])
            .unwrap();
        assert_eq!(quark, 1);
        assert!(shadow.has_quark(&[CHECKPOINT_ATTRIBUTE]));
    }

    #[test]
    fn replay_window_bookkeeping() {
        let shadow = ShadowStateSystem::new();
        shadow.assign_upstream(FixedTree::new(&["q"]));

        let snapshot = vec![Some(StateInterval::new(0, 12, 0, "off".into()))];
        shadow.replace_ongoing(snapshot, 20);

        shadow.modify_attribute(13, 0, "on".into());
        shadow.modify_attribute(19, 0, "off".into());

        assert_eq!(shadow.singular_state_at(10, 0).unwrap().value, "off".into());
        assert_eq!(shadow.singular_state_at(14, 0).unwrap().value, "on".into());
        assert_eq!(shadow.singular_state_at(16, 0).unwrap().end, 18);
        assert_eq!(shadow.singular_state_at(19, 0).unwrap().value, "off".into());

        // A second replace wipes the window.
        shadow.replace_ongoing(vec![None], 30);
        assert_eq!(shadow.singular_state_at(14, 0), None);
    }

    #[test]
    fn close_history_seals_ongoing_intervals() {
        let shadow = ShadowStateSystem::new();
        shadow.assign_upstream(FixedTree::new(&["q"]));

        shadow.replace_ongoing(vec![None], 25);
        shadow.modify_attribute(19, 0, "tail".into());
        shadow.close_history(25);

        let interval = shadow.singular_state_at(25, 0).unwrap();
        assert_eq!(interval.start, 19);
        assert_eq!(interval.end, 25);
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use st_history_types::{
    HistoryBackend, HistoryError, HistoryResult, Quark, StateInterval, StateProvider, StateValue,
    TimeRange, TraceSource,
};
use st_log::{debug, error, trace};

use crate::shadow::{ShadowStateSystem, CHECKPOINT_ATTRIBUTE};

// ---

/// A checkpoint+replay front-end over any history back-end.
///
/// Only intervals crossing a checkpoint are forwarded to the inner store;
/// checkpoints themselves are synthesised on a fixed time cadence as
/// intervals of a synthetic attribute. Queries at arbitrary timestamps
/// restore the nearest earlier checkpoint snapshot from the inner store
/// and replay trace events through the shadow state-system up to the
/// requested time.
///
/// The replay is purely advisory: the inner store stays the authoritative
/// persisted history. Exactly one replay runs at a time (the shadow's query
/// lock).
pub struct PartialHistoryStore {
    inner: Box<dyn HistoryBackend>,
    shadow: Arc<ShadowStateSystem>,

    /// The provider that re-interprets replayed events into the shadow.
    provider: Mutex<Box<dyn StateProvider>>,

    /// Replays stored trace events on demand.
    source: Box<dyn TraceSource>,

    /// Time distance between two checkpoints.
    granularity: i64,

    start_time: i64,
    end_time: i64,

    /// Checkpoint timestamps written so far, in order. Matches the inner
    /// store's checkpoint-attribute history by construction.
    checkpoints: RwLock<BTreeSet<i64>>,

    /// The synthetic checkpoint attribute, created on the first insert.
    checkpoint_quark: Option<Quark>,

    /// Value carried by the next checkpoint interval.
    next_checkpoint_index: i32,

    finished: bool,
    disposed: bool,
}

impl PartialHistoryStore {
    pub fn new(
        inner: Box<dyn HistoryBackend>,
        shadow: Arc<ShadowStateSystem>,
        provider: Box<dyn StateProvider>,
        source: Box<dyn TraceSource>,
        granularity: i64,
        start_time: i64,
    ) -> Self {
        assert!(granularity > 0, "checkpoint granularity must be positive");
        Self {
            inner,
            shadow,
            provider: Mutex::new(provider),
            source,
            granularity,
            start_time,
            end_time: start_time,
            checkpoints: RwLock::new(BTreeSet::new()),
            checkpoint_quark: None,
            next_checkpoint_index: 0,
            finished: false,
            disposed: false,
        }
    }

    /// The shadow this store replays into.
    pub fn shadow(&self) -> &Arc<ShadowStateSystem> {
        &self.shadow
    }

    fn check_query_time(&self, t: i64) -> HistoryResult<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        if t < self.start_time || t > self.end_time {
            return Err(HistoryError::TimeOutOfRange {
                t,
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    fn last_checkpoint(&self) -> i64 {
        self.checkpoints
            .read()
            .iter()
            .next_back()
            .copied()
            .unwrap_or(self.start_time)
    }

    /// The nearest checkpoint at or before `t`.
    fn floor_checkpoint(&self, t: i64) -> i64 {
        self.checkpoints
            .read()
            .range(..=t)
            .next_back()
            .copied()
            .unwrap_or(self.start_time)
    }

    fn checkpoint_after(&self, cp: i64) -> Option<i64> {
        self.checkpoints.read().range(cp + 1..).next().copied()
    }

    // --- Write path ---

    pub fn insert(&mut self, interval: StateInterval) -> HistoryResult<()> {
        if self.disposed || self.finished {
            return Err(HistoryError::Disposed);
        }

        // Lazily create the synthetic checkpoint attribute; this blocks on
        // the shadow's upstream latch if the primary isn't wired up yet.
        let checkpoint_quark = if let Some(quark) = self.checkpoint_quark {
            quark
        } else {
            let quark = self
                .shadow
                .quark_for_path_or_create(&[CHECKPOINT_ATTRIBUTE])?;
            self.checkpoint_quark = Some(quark);
            self.checkpoints.write().insert(self.start_time);
            quark
        };

        // Checkpoint intervals are ours alone; accepting them back would
        // form cycles.
        if interval.quark == checkpoint_quark {
            return Ok(());
        }

        self.end_time = self.end_time.max(interval.end);

        // Synthesise checkpoints on the fixed cadence.
        while self.end_time >= self.last_checkpoint() + self.granularity {
            let last = self.last_checkpoint();
            let next = last + self.granularity;
            let index = self.next_checkpoint_index;
            self.next_checkpoint_index += 1;
            self.inner.insert(StateInterval::new(
                last,
                next - 1,
                checkpoint_quark,
                StateValue::Int32(index),
            ))?;
            self.checkpoints.write().insert(next);
            trace!(kind = "checkpoint", at = next, index, "checkpoint written");
        }

        // Only intervals crossing a checkpoint are persisted.
        if interval.start <= self.floor_checkpoint(interval.end) {
            self.inner.insert(interval)?;
        }
        Ok(())
    }

    pub fn finished_building(&mut self, end_time: i64) -> HistoryResult<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        if self.finished {
            return Ok(());
        }
        self.end_time = self.end_time.max(end_time);

        // One last checkpoint at the very end, after the last interval.
        if let Some(checkpoint_quark) = self.checkpoint_quark {
            let last = self.last_checkpoint();
            if self.end_time > last {
                let index = self.next_checkpoint_index;
                self.next_checkpoint_index += 1;
                self.inner.insert(StateInterval::new(
                    last,
                    self.end_time,
                    checkpoint_quark,
                    StateValue::Int32(index),
                ))?;
                self.checkpoints.write().insert(self.end_time);
            }
        }

        self.inner.finished_building(self.end_time)?;
        self.finished = true;

        debug!(
            kind = "finish",
            end_time = self.end_time,
            n_checkpoints = self.checkpoints.read().len(),
            "partial history finished building"
        );
        Ok(())
    }

    // --- Read path ---

    pub fn point_query(&self, t: i64, buffer: &mut [Option<StateInterval>]) -> HistoryResult<()> {
        self.check_query_time(t)?;

        let mut cp = self.floor_checkpoint(t);
        self.inner.point_query(cp, buffer)?;

        // At the trace tail the last checkpoint was written after the last
        // interval; retry one checkpoint earlier.
        if buffer.iter().any(Option::is_none) && t > self.start_time {
            let retry = self.floor_checkpoint(t - 1);
            if retry != cp {
                cp = retry;
                let mut earlier = vec![None; buffer.len()];
                self.inner.point_query(cp, &mut earlier)?;
                for (slot, candidate) in buffer.iter_mut().zip(earlier) {
                    if slot.is_none() {
                        *slot = candidate;
                    }
                }
            }
        }

        if Self::covers_all(buffer, t) {
            return Ok(());
        }

        // Some intervals that cover `t` are only visible from the *next*
        // checkpoint's snapshot (they start after `cp`); splice those in
        // before resorting to a replay.
        let cp_next = self.checkpoint_after(cp);
        if let Some(cp_next) = cp_next {
            let mut later = vec![None; buffer.len()];
            self.inner.point_query(cp_next, &mut later)?;
            for (slot, candidate) in buffer.iter_mut().zip(later) {
                let stale = slot.as_ref().is_none_or(|interval| interval.end < t);
                if stale
                    && let Some(candidate) = candidate
                    && candidate.start <= t
                {
                    // Starts at or before `t` and reaches `cp_next > t`, so
                    // it covers `t`.
                    *slot = Some(candidate);
                }
            }
        }

        if Self::covers_all(buffer, t) {
            return Ok(());
        }

        // Everything else takes a replay.
        let upper = cp_next.unwrap_or(self.end_time).min(self.end_time);
        let guard = self.replay_window(cp, upper, t, buffer.len())?;
        let state = self.shadow.state_at(t);
        drop(guard);

        for (slot, found) in buffer.iter_mut().zip(state) {
            if slot.as_ref().is_none_or(|interval| !interval.contains(t)) {
                // Either the replay resolved it, or the quark genuinely has
                // no state at `t`.
                *slot = found;
            }
        }
        Ok(())
    }

    pub fn singular_query(&self, t: i64, quark: Quark) -> HistoryResult<Option<StateInterval>> {
        self.check_query_time(t)?;

        let mut cp = self.floor_checkpoint(t);
        let mut result = self.inner.singular_query(cp, quark)?;

        if result.is_none() && t > self.start_time {
            let retry = self.floor_checkpoint(t - 1);
            if retry != cp {
                cp = retry;
                result = self.inner.singular_query(cp, quark)?;
            }
        }

        if let Some(interval) = &result
            && interval.end >= t
        {
            return Ok(result);
        }

        let cp_next = self.checkpoint_after(cp);
        if let Some(cp_next) = cp_next
            && let Some(candidate) = self.inner.singular_query(cp_next, quark)?
            && candidate.start <= t
        {
            return Ok(Some(candidate));
        }

        let upper = cp_next.unwrap_or(self.end_time).min(self.end_time);
        let _guard = self.replay_window(cp, upper, t, quark as usize + 1)?;
        Ok(self.shadow.singular_state_at(t, quark))
    }

    pub fn range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Box<dyn Iterator<Item = StateInterval> + Send + '_> {
        match self.try_range_query(quarks, times) {
            Ok(intervals) => Box::new(intervals.into_iter()),
            Err(err) => {
                error!(kind = "query", "partial range query failed: {err}");
                Box::new(std::iter::empty())
            }
        }
    }

    fn try_range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> HistoryResult<Vec<StateInterval>> {
        let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
            return Ok(vec![]);
        };
        self.check_query_time(first)?;
        self.check_query_time(last)?;

        let step = if times.len() >= 2 {
            times[1] - times[0]
        } else {
            0
        };

        // Coarse enough that checkpoints alone suffice: resample onto the
        // checkpoint grid and let the inner store answer. The rewritten
        // step is clamped to the granularity so it can never truncate to
        // zero.
        if step >= 2 * self.granularity {
            let step = ((step / self.granularity) * self.granularity).max(self.granularity);
            let rewritten: Vec<i64> = (first..=last).step_by(step as usize).collect();
            debug!(
                kind = "query",
                time_range = %TimeRange::new(first, last),
                step,
                "partial range query delegated to the inner store"
            );
            return Ok(self.inner.range_query(quarks, &rewritten).collect());
        }

        // Fine steps: replay the bracketed range and read the shadow.
        let cp = self.floor_checkpoint(first);
        let upper = last.min(self.end_time);
        let width = quarks
            .iter()
            .map(|&quark| quark as usize + 1)
            .max()
            .unwrap_or(0);
        let guard = self.replay_window(cp, upper, last, width)?;
        let intervals = self.shadow.intervals_in(quarks, TimeRange::new(first, last));
        drop(guard);
        Ok(intervals)
    }

    /// Restores the `cp` snapshot into the shadow and replays trace events
    /// over `(cp, upper]`, with the shadow's state sized for at least
    /// `min_width` quarks.
    ///
    /// Returns the held query lock: the caller reads the shadow and then
    /// drops the guard, so the `replace_ongoing → replay → read` sequence
    /// stays exclusive, and every exit path (including errors) releases
    /// the lock.
    fn replay_window(
        &self,
        cp: i64,
        upper: i64,
        t: i64,
        min_width: usize,
    ) -> HistoryResult<crate::shadow::ShadowQueryGuard<'_>> {
        let guard = self.shadow.take_query_lock();

        trace!(
            kind = "replay",
            checkpoint = cp,
            upper,
            time = t,
            "replaying events through the shadow"
        );

        let width = self.shadow.number_of_attributes().max(min_width);
        let mut snapshot = vec![None; width];
        self.inner.point_query(cp, &mut snapshot)?;
        self.shadow.replace_ongoing(snapshot, upper);

        if upper > cp {
            let range = TimeRange::new(cp + 1, upper);
            let mut provider = self.provider.lock();
            self.source
                .events_in(range, &mut |event| provider.process_event(event))?;
            provider.wait_for_empty_queue();
        }

        if t >= self.end_time {
            // At the trace tail no further event can extend anything.
            self.shadow.close_history(t);
        }

        Ok(guard)
    }

    // --- Lifecycle ---

    pub fn dispose(&mut self) -> HistoryResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.provider.get_mut().dispose();
        self.inner.dispose()
    }

    pub fn remove_files(&mut self) {
        self.inner.remove_files();
    }

    fn covers_all(buffer: &[Option<StateInterval>], t: i64) -> bool {
        buffer
            .iter()
            .all(|slot| slot.as_ref().is_some_and(|interval| interval.end >= t))
    }
}

// ---

impl HistoryBackend for PartialHistoryStore {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.end_time
    }

    fn insert(&mut self, interval: StateInterval) -> HistoryResult<()> {
        Self::insert(self, interval)
    }

    fn finished_building(&mut self, end_time: i64) -> HistoryResult<()> {
        Self::finished_building(self, end_time)
    }

    fn point_query(&self, t: i64, buffer: &mut [Option<StateInterval>]) -> HistoryResult<()> {
        Self::point_query(self, t, buffer)
    }

    fn singular_query(&self, t: i64, quark: Quark) -> HistoryResult<Option<StateInterval>> {
        Self::singular_query(self, t, quark)
    }

    fn range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Box<dyn Iterator<Item = StateInterval> + Send + '_> {
        Self::range_query(self, quarks, times)
    }

    fn dispose(&mut self) -> HistoryResult<()> {
        Self::dispose(self)
    }

    fn remove_files(&mut self) {
        Self::remove_files(self);
    }
}

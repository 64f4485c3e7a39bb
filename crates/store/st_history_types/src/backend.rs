use crate::{HistoryResult, Quark, StateInterval};

// ---

/// The storage contract implemented by every history back-end.
///
/// ## Concurrency
///
/// The write side is single-threaded: one producer (the state provider)
/// calls [`Self::insert`] in event order, with non-decreasing `end` times
/// per quark. The read side may be multi-threaded; callers that interleave
/// writes and reads wrap the back-end in a read-write lock.
///
/// ## Lifecycle
///
/// A back-end is created empty or opened over an existing file. It
/// transitions from building to finished on [`Self::finished_building`];
/// after [`Self::dispose`], every operation fails with
/// [`crate::HistoryError::Disposed`].
pub trait HistoryBackend: Send + Sync {
    /// The first timestamp covered by this history.
    fn start_time(&self) -> i64;

    /// The last timestamp covered so far (grows while building).
    fn end_time(&self) -> i64;

    /// Persists one interval.
    fn insert(&mut self, interval: StateInterval) -> HistoryResult<()>;

    /// Flushes everything still in memory and seals the history at
    /// `end_time`.
    ///
    /// A second call with the same `end_time` is a no-op.
    fn finished_building(&mut self, end_time: i64) -> HistoryResult<()>;

    /// Fills `buffer[quark]` with the interval covering `t` for every quark
    /// that holds state at `t`; quarks without state are left `None`.
    ///
    /// `buffer` is indexed by quark and sized by the caller (one slot per
    /// known attribute).
    fn point_query(&self, t: i64, buffer: &mut [Option<StateInterval>]) -> HistoryResult<()>;

    /// The interval covering `t` for a single quark, or `None` if the quark
    /// holds no state at `t`.
    fn singular_query(&self, t: i64, quark: Quark) -> HistoryResult<Option<StateInterval>>;

    /// A 2-D query: all intervals relevant to drawing `quarks` over the
    /// sample grid `times` (ascending, typically one sample per display
    /// pixel).
    ///
    /// Degrades to an empty iterator on internal error (which is logged).
    fn range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Box<dyn Iterator<Item = StateInterval> + Send + '_>;

    /// Releases every resource held by this back-end. No further calls are
    /// valid.
    ///
    /// If the history never finished building, its files are deleted.
    fn dispose(&mut self) -> HistoryResult<()>;

    /// Deletes the back-end's persistent files, if any.
    fn remove_files(&mut self);
}

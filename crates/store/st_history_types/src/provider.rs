//! The contracts of the collaborators supplied by the owning trace
//! framework: the attribute tree, trace events, the state provider that
//! interprets them, and the trace source that replays them.
//!
//! The history stores never parse events and never mutate the attribute
//! tree; they only drive these interfaces.

use crate::{HistoryResult, Quark, TimeRange};

// ---

/// The tree of named attributes, owned by the trace framework.
///
/// Attribute paths are slash-less path segments (`["threads", "1234",
/// "status"]`); each existing path maps to a stable [`Quark`].
pub trait AttributeTree: Send + Sync {
    /// The number of attributes currently in the tree. Quarks are dense:
    /// every quark in `0..number_of_attributes()` is valid.
    fn number_of_attributes(&self) -> usize;

    /// The quark for an existing path, or `None` if no such attribute
    /// exists. This never creates anything.
    fn quark_for_path(&self, path: &[&str]) -> Option<Quark>;

    /// The quark for `path`, creating the attribute (and any missing
    /// ancestors) if needed.
    fn quark_for_path_or_create(&self, path: &[&str]) -> Quark;

    /// Whether an attribute exists at `path`, without creating it.
    fn has_quark(&self, path: &[&str]) -> bool {
        self.quark_for_path(path).is_some()
    }
}

/// One event out of the trace. Opaque to the history stores: only the
/// timestamp is interpreted here, everything else is for the state provider.
pub trait TraceEvent {
    fn timestamp(&self) -> i64;

    /// Downcast hook for providers that know the concrete event type.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Interprets trace events into state changes.
///
/// During a partial-history replay the provider is pointed at the shadow
/// state-system and re-fed events; it must apply exactly the same state
/// changes it applied during the original build.
pub trait StateProvider: Send {
    /// The timestamp of the start of the trace this provider reads.
    fn start_time(&self) -> i64;

    /// Applies one event's state changes.
    fn process_event(&mut self, event: &dyn TraceEvent);

    /// Blocks until every queued event has been fully applied. Providers
    /// without an internal queue need not override this.
    fn wait_for_empty_queue(&mut self) {}

    fn dispose(&mut self) {}
}

/// Replays stored trace events on demand.
///
/// This is the seam to the framework's event-request machinery: one call
/// covers constructing a request for `range`, sending it, dispatching each
/// event to `f` in timestamp order, and waiting for completion.
pub trait TraceSource: Send + Sync {
    /// Streams every event with a timestamp in `range`, in order.
    ///
    /// Returns [`crate::HistoryError::Cancelled`] if the framework cancels
    /// the underlying request.
    fn events_in(
        &self,
        range: TimeRange,
        f: &mut dyn FnMut(&dyn TraceEvent),
    ) -> HistoryResult<()>;
}

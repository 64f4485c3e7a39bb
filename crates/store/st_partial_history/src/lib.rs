//! The statetrace partial history: checkpoint snapshots + event replay.
//!
//! * [`PartialHistoryStore`] wraps any [`st_history_types::HistoryBackend`]
//!   and persists only intervals that cross a checkpoint; everything else
//!   is reconstructed on demand.
//! * [`ShadowStateSystem`] is the in-memory facade the replay runs against:
//!   it shares the primary state-system's attribute tree and never mutates
//!   it.
//! * [`MemoryBackend`] is a plain in-memory back-end, useful as the partial
//!   store's inner store and as a reference in tests.

mod memory;
mod partial;
mod shadow;

pub use self::memory::MemoryBackend;
pub use self::partial::PartialHistoryStore;
pub use self::shadow::{ShadowQueryGuard, ShadowStateSystem, CHECKPOINT_ATTRIBUTE};

// Re-exports
#[doc(no_inline)]
pub use st_history_types::{
    AttributeTree, HistoryBackend, HistoryError, HistoryResult, Quark, StateInterval,
    StateProvider, StateValue, TimeRange, TraceEvent, TraceSource,
}; // for politeness sake

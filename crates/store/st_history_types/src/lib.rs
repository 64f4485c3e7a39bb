//! The core types of the statetrace state-history stores.
//!
//! * [`StateValue`] and [`StateInterval`] are the payload of every history:
//!   a value assigned to an attribute (identified by its [`Quark`]) for a
//!   contiguous, inclusive time range.
//! * [`codec`] defines the wire form of values and intervals inside history
//!   files.
//! * [`HistoryBackend`] is the storage contract implemented by every
//!   back-end (tiled, partial, in-memory).
//! * [`AttributeTree`], [`StateProvider`] and [`TraceSource`] are the
//!   collaborator contracts supplied by the owning trace framework.

pub mod codec;

mod backend;
mod error;
mod interval;
mod provider;
mod time;
mod value;

pub use self::backend::HistoryBackend;
pub use self::error::{HistoryError, HistoryResult};
pub use self::interval::{Quark, StateInterval};
pub use self::provider::{AttributeTree, StateProvider, TraceEvent, TraceSource};
pub use self::time::TimeRange;
pub use self::value::{MAX_VALUE_LEN, StateValue};

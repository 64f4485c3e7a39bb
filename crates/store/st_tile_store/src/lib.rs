//! The statetrace multi-resolution tiled history store.
//!
//! * See [`TiledHistoryStore`] for an overview of the core datastructures
//!   and the constructors.
//! * The write path lives in `store_write.rs`, the read path (point,
//!   singular and 2-D range queries) in `store_read.rs`.
//! * The on-disk layout (header, per-resolution tile directories, tile
//!   payloads) lives in `store_file.rs`.

mod store;
mod store_file;
mod store_read;
mod store_sanity;
mod store_stats;
mod store_write;
mod tile;

pub use self::store::{
    resolution_ladder, TileStoreConfig, TiledHistoryStore, IGNORE_PROVIDER_VERSION,
    MIN_RESOLUTION,
};
pub use self::store_sanity::{SanityError, SanityResult};
pub use self::store_stats::TileStoreStats;

// Re-exports
#[doc(no_inline)]
pub use st_history_types::{
    HistoryBackend, HistoryError, HistoryResult, Quark, StateInterval, StateValue, TimeRange,
}; // for politeness sake

use std::sync::atomic::Ordering;

use crate::store::TiledHistoryStore;

// ---

/// Running counters of one [`TiledHistoryStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileStoreStats {
    pub num_inserts: u64,
    pub num_queries: u64,
    pub num_tiles_flushed: u64,
    pub num_bytes_flushed: u64,
}

impl TiledHistoryStore {
    pub fn stats(&self) -> TileStoreStats {
        TileStoreStats {
            num_inserts: self.insert_id,
            num_queries: self.query_id.load(Ordering::Relaxed),
            num_tiles_flushed: self.num_tiles_flushed,
            num_bytes_flushed: self.num_bytes_flushed,
        }
    }
}

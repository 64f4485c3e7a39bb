use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;

use st_history_types::{
    HistoryBackend, HistoryError, HistoryResult, Quark, StateInterval,
};

use crate::store_file::TileFile;
use crate::tile::Tile;

/// `i64::div_ceil` equivalent for non-negative `a` and positive `b`
/// (`i64::div_ceil` is not yet stable).
pub(crate) fn div_ceil_i64(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

// --- Tiled history store ---

/// Pass as the expected provider version to [`TiledHistoryStore::open_existing`]
/// to skip the provider-version check.
pub const IGNORE_PROVIDER_VERSION: u32 = u32::MAX;

/// The finest resolution the automatic ladder derivation will go down to,
/// in time units.
pub const MIN_RESOLUTION: i64 = 10_000;

/// Each derived resolution level is this much finer than the previous one.
const RESOLUTION_FACTOR: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileStoreConfig {
    /// The pixel budget of a display: each tile spans `resolution * n_pixels`
    /// time units, so that one tile serves one full-width drawing request at
    /// its resolution.
    ///
    /// See [`Self::DEFAULT`] for defaults.
    pub n_pixels: u32,
}

impl Default for TileStoreConfig {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TileStoreConfig {
    pub const DEFAULT: Self = Self { n_pixels: 2_000 };
}

// ---

/// One resolution level: its tile directory and, while building, its open
/// tile.
pub(crate) struct ResolutionLevel {
    pub resolution: i64,

    /// File offset of each flushed tile; `0` = never flushed.
    ///
    /// Level `i` starts out with `ceil(r_0 / r_i)` slots (enough to cover
    /// the coarsest level's span) and grows if the trace runs longer than
    /// planned. While building, offsets are staging-relative; they are
    /// shifted to their final absolute values when the header is written.
    pub offsets: Vec<u64>,

    /// The tile currently accepting inserts, while building.
    pub open: Option<Tile>,
}

impl ResolutionLevel {
    /// The time span of one tile at this level.
    #[inline]
    pub fn tile_span(&self, n_pixels: u32) -> i64 {
        self.resolution * i64::from(n_pixels)
    }
}

/// A multi-resolution tiled history: one on-disk tile array per resolution
/// level, coarsest level first.
///
/// The write path distributes every interval to all levels; sub-resolution
/// runs are coalesced everywhere but at the coarsest level, which stays
/// authoritative for point queries. The read path picks the resolution
/// matching the requested sample step and falls back towards the coarsest
/// level for anything a fine level cut off.
pub struct TiledHistoryStore {
    /// The owning state-system's id, for logging only.
    pub(crate) ssid: String,

    pub(crate) config: TileStoreConfig,
    pub(crate) provider_version: u32,

    pub(crate) start_time: i64,

    /// Greatest interval end observed so far; sealed by
    /// `finished_building`.
    pub(crate) end_time: i64,

    /// Coarsest level first, strictly decreasing resolutions.
    pub(crate) levels: Vec<ResolutionLevel>,

    pub(crate) file: TileFile,

    /// Most recently read tile per level; read-mostly after finalisation.
    pub(crate) read_cache: RwLock<Vec<Option<Arc<Tile>>>>,

    /// Monotonically increasing ID for insertions.
    pub(crate) insert_id: u64,

    /// Monotonically increasing ID for queries.
    pub(crate) query_id: AtomicU64,

    pub(crate) num_tiles_flushed: u64,
    pub(crate) num_bytes_flushed: u64,

    pub(crate) finished: bool,
    pub(crate) disposed: bool,
}

impl TiledHistoryStore {
    /// Creates an empty history at `path` with an explicit resolution
    /// ladder (strictly decreasing, coarsest first).
    pub fn open_new(
        ssid: impl Into<String>,
        path: &Path,
        provider_version: u32,
        start_time: i64,
        n_pixels: u32,
        resolutions: &[i64],
    ) -> HistoryResult<Self> {
        assert!(n_pixels > 0);
        assert!(
            !resolutions.is_empty() && resolutions.iter().all(|&r| r > 0),
            "need at least one positive resolution"
        );
        assert!(
            resolutions.windows(2).all(|pair| pair[0] > pair[1]),
            "resolutions must be strictly decreasing, coarsest first"
        );

        let r0 = resolutions[0];
        let levels: Vec<ResolutionLevel> = resolutions
            .iter()
            .map(|&resolution| ResolutionLevel {
                resolution,
                offsets: vec![0; div_ceil_i64(r0, resolution) as usize],
                open: None,
            })
            .collect();

        let file = TileFile::create(path)?;

        let ssid = ssid.into();
        st_log::debug!(
            kind = "open",
            ssid = %ssid,
            path = ?path,
            n_resolutions = resolutions.len(),
            coarsest = r0,
            finest = *resolutions.last().unwrap(),
            "created new tiled history"
        );

        Ok(Self {
            ssid,
            config: TileStoreConfig { n_pixels },
            provider_version,
            start_time,
            end_time: start_time,
            read_cache: RwLock::new(vec![None; levels.len()]),
            levels,
            file,
            insert_id: 0,
            query_id: AtomicU64::new(0),
            num_tiles_flushed: 0,
            num_bytes_flushed: 0,
            finished: false,
            disposed: false,
        })
    }

    /// Creates an empty history, deriving the resolution ladder from the
    /// expected trace range and the default pixel budget.
    pub fn open_new_auto(
        ssid: impl Into<String>,
        start_time: i64,
        end_time: i64,
        provider_version: u32,
        path: &Path,
    ) -> HistoryResult<Self> {
        if end_time < start_time {
            return Err(HistoryError::TimeOutOfRange {
                t: end_time,
                start: start_time,
                end: i64::MAX,
            });
        }
        let n_pixels = TileStoreConfig::DEFAULT.n_pixels;
        let resolutions = resolution_ladder(start_time, end_time, n_pixels);
        Self::open_new(ssid, path, provider_version, start_time, n_pixels, &resolutions)
    }

    /// Opens an existing, finished history read-only.
    ///
    /// Fails with [`HistoryError::Corrupt`] on a bad magic/version, or when
    /// the file was written by a different provider version (pass
    /// [`IGNORE_PROVIDER_VERSION`] to opt out of that check).
    pub fn open_existing(
        ssid: impl Into<String>,
        provider_version: u32,
        path: &Path,
    ) -> HistoryResult<Self> {
        let file = TileFile::open(path)?;
        let header = file.read_header(provider_version)?;

        let levels: Vec<ResolutionLevel> = header
            .levels
            .into_iter()
            .map(|level| ResolutionLevel {
                resolution: level.resolution,
                offsets: level.offsets,
                open: None,
            })
            .collect();

        let ssid = ssid.into();
        st_log::debug!(
            kind = "open",
            ssid = %ssid,
            path = ?path,
            time_range = %st_history_types::TimeRange::new(header.start_time, header.end_time),
            n_resolutions = levels.len(),
            "opened existing tiled history"
        );

        Ok(Self {
            ssid,
            config: TileStoreConfig {
                n_pixels: header.n_pixels,
            },
            provider_version: header.provider_version,
            start_time: header.start_time,
            end_time: header.end_time,
            read_cache: RwLock::new(vec![None; levels.len()]),
            levels,
            file,
            insert_id: 0,
            query_id: AtomicU64::new(0),
            num_tiles_flushed: 0,
            num_bytes_flushed: 0,
            finished: true,
            disposed: false,
        })
    }

    #[inline]
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    #[inline]
    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    /// The resolutions of this store, coarsest first.
    pub fn resolutions(&self) -> impl ExactSizeIterator<Item = i64> + '_ {
        self.levels.iter().map(|level| level.resolution)
    }

    /// Releases the store. If the history never finished building, its file
    /// is deleted.
    pub fn dispose(&mut self) -> HistoryResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        for level in &mut self.levels {
            level.open = None;
        }
        if !self.finished {
            self.file.remove();
        }
        Ok(())
    }

    /// Deletes the backing file.
    pub fn remove_files(&mut self) {
        self.file.remove();
    }

    pub(crate) fn check_not_disposed(&self) -> HistoryResult<()> {
        if self.disposed {
            Err(HistoryError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Derives the default resolution ladder for a trace range: the coarsest
/// resolution fits the whole range into one `n_pixels`-wide tile, and each
/// subsequent level is [`RESOLUTION_FACTOR`] finer, stopping once
/// [`MIN_RESOLUTION`] is reached.
pub fn resolution_ladder(start_time: i64, end_time: i64, n_pixels: u32) -> Vec<i64> {
    debug_assert!(start_time <= end_time);
    let duration = end_time - start_time;

    let r0 = div_ceil_i64(duration, i64::from(n_pixels)) + 1;
    let mut ladder = vec![r0];
    let mut resolution = r0;
    while resolution > MIN_RESOLUTION {
        let next = (resolution as f64 * RESOLUTION_FACTOR) as i64;
        if next < 1 {
            break;
        }
        ladder.push(next);
        resolution = next;
    }
    ladder
}

// ---

impl HistoryBackend for TiledHistoryStore {
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

// ----------------------------------------------------------------------------

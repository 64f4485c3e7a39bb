use std::sync::atomic::Ordering;
use std::sync::Arc;

use itertools::Itertools as _;

use st_history_types::{HistoryError, HistoryResult, Quark, StateInterval, TimeRange};
use st_log::{debug, error, trace};

use crate::store::TiledHistoryStore;
use crate::tile::Tile;

// --- Read path ---

impl TiledHistoryStore {
    fn check_query_time(&self, t: i64) -> HistoryResult<()> {
        self.check_not_disposed()?;
        if t < self.start_time || t > self.end_time {
            return Err(HistoryError::TimeOutOfRange {
                t,
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    /// Reads the tile at `(level_idx, tile_idx)`: the open tile if it is
    /// the one being built there, the cached or on-disk tile if it was
    /// flushed, or an empty placeholder spanning the window otherwise.
    pub(crate) fn tile_at(&self, level_idx: usize, tile_idx: i64) -> HistoryResult<Arc<Tile>> {
        let level = &self.levels[level_idx];
        let span = level.tile_span(self.config.n_pixels);
        let tile_start = self.start_time + tile_idx * span;
        let tile_end = tile_start + span - 1;
        let ignore_cutoff = level_idx == 0;

        if let Some(open) = &level.open
            && open.start == tile_start
        {
            return Ok(Arc::new(open.clone()));
        }

        let offset = usize::try_from(tile_idx)
            .ok()
            .and_then(|idx| level.offsets.get(idx))
            .copied()
            .unwrap_or(0);
        if offset == 0 {
            // Never flushed: treat as empty.
            return Ok(Arc::new(Tile::new(
                level.resolution,
                tile_start,
                tile_end,
                ignore_cutoff,
            )));
        }

        if let Some(cached) = &self.read_cache.read()[level_idx]
            && cached.start == tile_start
        {
            return Ok(cached.clone());
        }

        let (tile_size, bytes) = self.file.read_tile(offset)?;
        let tile = Arc::new(Tile::deserialise(
            &mut bytes.as_slice(),
            tile_size,
            level.resolution,
            tile_start,
            tile_end,
            ignore_cutoff,
        )?);
        trace!(
            kind = "read",
            ssid = %self.ssid,
            level = level_idx,
            tile_start,
            offset,
            "tile read from disk"
        );
        self.read_cache.write()[level_idx] = Some(tile.clone());
        Ok(tile)
    }

    /// Fills `buffer[quark]` with the interval covering `t` for every quark
    /// that holds state at `t`.
    ///
    /// Starts at the finest resolution and, for quarks still unknown, reads
    /// the forward-adjacent tile (state can end in a later tile) before
    /// demoting to a coarser level. The coarsest level never cuts off short
    /// runs, so it is authoritative.
    pub fn point_query(&self, t: i64, buffer: &mut [Option<StateInterval>]) -> HistoryResult<()> {
        self.check_query_time(t)?;
        let query_id = self.query_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            kind = "query",
            id = query_id,
            ssid = %self.ssid,
            time = t,
            n_attributes = buffer.len(),
            "point query started..."
        );

        for level_idx in (0..self.levels.len()).rev() {
            let span = self.levels[level_idx].tile_span(self.config.n_pixels);
            let tile_idx = (t - self.start_time) / span;

            for idx in [tile_idx, tile_idx + 1] {
                let tile = self.tile_at(level_idx, idx)?;
                for interval in tile.point_query(t) {
                    if let Some(slot) = buffer.get_mut(interval.quark as usize)
                        && slot.is_none()
                    {
                        *slot = Some(interval.clone());
                    }
                }
                if buffer.iter().all(Option::is_some) {
                    return Ok(());
                }
            }
        }

        // Whatever is still unset has no state at `t`.
        Ok(())
    }

    /// The interval covering `t` for one quark, or `None` if the quark
    /// holds no state at `t`. Same descent as [`Self::point_query`],
    /// short-circuited to the first match.
    pub fn singular_query(&self, t: i64, quark: Quark) -> HistoryResult<Option<StateInterval>> {
        self.check_query_time(t)?;
        self.query_id.fetch_add(1, Ordering::Relaxed);

        for level_idx in (0..self.levels.len()).rev() {
            let span = self.levels[level_idx].tile_span(self.config.n_pixels);
            let tile_idx = (t - self.start_time) / span;

            for idx in [tile_idx, tile_idx + 1] {
                let tile = self.tile_at(level_idx, idx)?;
                if let Some(interval) = tile.interval_at(quark, t) {
                    return Ok(Some(interval.clone()));
                }
            }
        }

        Ok(None)
    }

    /// A 2-D query: every stored interval relevant to drawing `quarks` over
    /// the sample grid `times`.
    ///
    /// The smallest (coarsest-indexed) level whose resolution fits the
    /// sample step serves the walk; quarks whose state at `times.max` the
    /// walked tiles do not know are topped up with point queries at the
    /// end. Degrades to an empty iterator on internal error.
    pub fn range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Box<dyn Iterator<Item = StateInterval> + Send + '_> {
        match self.try_range_query(quarks, times) {
            Ok(iter) => iter,
            Err(err) => {
                error!(kind = "query", ssid = %self.ssid, "range query failed: {err}");
                Box::new(std::iter::empty())
            }
        }
    }

    fn try_range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> HistoryResult<Box<dyn Iterator<Item = StateInterval> + Send + '_>> {
        self.check_not_disposed()?;
        let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
            return Ok(Box::new(std::iter::empty()));
        };
        self.check_query_time(first)?;
        self.check_query_time(last)?;

        let query_id = self.query_id.fetch_add(1, Ordering::Relaxed) + 1;

        // Pick the smallest resolution index whose level is at least as
        // coarse as one sample step; everything finer would be wasted work.
        let step = if times.len() >= 2 {
            times[1] - times[0]
        } else {
            0
        };
        let level_idx = self
            .levels
            .iter()
            .position(|level| level.resolution <= step)
            .unwrap_or(self.levels.len() - 1);

        let span = self.levels[level_idx].tile_span(self.config.n_pixels);
        let first_tile = (first - self.start_time) / span;
        let last_tile = (last - self.start_time) / span;

        debug!(
            kind = "query",
            id = query_id,
            ssid = %self.ssid,
            time_range = %TimeRange::new(first, last),
            step,
            level = level_idx,
            resolution = self.levels[level_idx].resolution,
            n_quarks = quarks.len(),
            "range query started..."
        );

        Ok(Box::new(RangeQueryIter {
            store: self,
            quarks: quarks.to_vec(),
            range: TimeRange::new(first, last),
            level_idx,
            next_tile: first_tile,
            last_tile,
            buffered: Vec::new().into_iter(),
            topped_up: false,
        }))
    }

    /// Point-queries `times.max` for the quarks the walked tiles did not
    /// cover.
    fn range_top_up(
        &self,
        level_idx: usize,
        last_tile_idx: i64,
        quarks: &[Quark],
        t_max: i64,
    ) -> Vec<StateInterval> {
        let missing = match self.tile_at(level_idx, last_tile_idx) {
            Ok(tile) => tile.missing(quarks, t_max),
            Err(err) => {
                error!(kind = "query", ssid = %self.ssid, "range top-up failed: {err}");
                return vec![];
            }
        };

        missing
            .into_iter()
            .filter_map(|quark| match self.singular_query(t_max, quark) {
                Ok(found) => found,
                Err(err) => {
                    error!(kind = "query", ssid = %self.ssid, quark, "range top-up failed: {err}");
                    None
                }
            })
            .collect()
    }
}

// ---

/// Lazily walks the tiles covering a 2-D query, one tile's worth of
/// intervals at a time, then tops up whatever the walk missed.
struct RangeQueryIter<'a> {
    store: &'a TiledHistoryStore,
    quarks: Vec<Quark>,
    range: TimeRange,
    level_idx: usize,
    next_tile: i64,
    last_tile: i64,
    buffered: std::vec::IntoIter<StateInterval>,
    topped_up: bool,
}

impl Iterator for RangeQueryIter<'_> {
    type Item = StateInterval;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(interval) = self.buffered.next() {
                return Some(interval);
            }

            if self.next_tile <= self.last_tile {
                let idx = self.next_tile;
                self.next_tile += 1;
                match self.store.tile_at(self.level_idx, idx) {
                    Ok(tile) => {
                        self.buffered = tile
                            .range_query(&self.quarks, self.range)
                            .cloned()
                            .collect_vec()
                            .into_iter();
                    }
                    Err(err) => {
                        error!(
                            kind = "query",
                            ssid = %self.store.ssid,
                            tile_idx = idx,
                            "range query tile read failed: {err}"
                        );
                        return None;
                    }
                }
            } else if !self.topped_up {
                self.topped_up = true;
                self.buffered = self
                    .store
                    .range_top_up(self.level_idx, self.last_tile, &self.quarks, self.range.max)
                    .into_iter();
            } else {
                return None;
            }
        }
    }
}

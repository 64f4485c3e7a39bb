use st_history_types::{HistoryError, HistoryResult, StateInterval};
use st_log::{debug, error, trace};

use crate::store::TiledHistoryStore;
use crate::store_file::{FileHeader, LevelDirectory};
use crate::tile::{Tile, TileInsert};

// --- Write path ---

impl TiledHistoryStore {
    /// Persists one interval, distributing it to every resolution level.
    ///
    /// Full tiles are serialised and appended to the file as a side effect;
    /// I/O failures during those flushes are logged and do not abort the
    /// build.
    pub fn insert(&mut self, interval: StateInterval) -> HistoryResult<()> {
        self.check_not_disposed()?;
        if self.finished {
            return Err(HistoryError::Disposed);
        }
        if interval.end < interval.start {
            return Err(HistoryError::TimeOutOfRange {
                t: interval.end,
                start: interval.start,
                end: i64::MAX,
            });
        }

        self.insert_id += 1;
        trace!(
            kind = "insert",
            id = self.insert_id,
            ssid = %self.ssid,
            interval = %interval,
            "insertion started..."
        );

        self.end_time = self.end_time.max(interval.end);

        for level_idx in 0..self.levels.len() {
            self.insert_at_level(level_idx, &interval);
        }

        Ok(())
    }

    fn insert_at_level(&mut self, level_idx: usize, interval: &StateInterval) {
        loop {
            self.ensure_open_tile(level_idx, interval.start);
            let Some(tile) = self.levels[level_idx].open.as_mut() else {
                return;
            };
            match tile.insert(interval.clone()) {
                TileInsert::Stored | TileInsert::Discarded => return,
                // Flush the full tile and re-offer the interval to its
                // successor.
                TileInsert::Full => self.rotate_tile(level_idx),
            }
        }
    }

    fn ensure_open_tile(&mut self, level_idx: usize, at: i64) {
        let n_pixels = self.config.n_pixels;
        let start_time = self.start_time;
        let ignore_cutoff = level_idx == 0;

        let level = &mut self.levels[level_idx];
        if level.open.is_none() {
            let span = level.tile_span(n_pixels);
            // Aligned to the directory grid, so offsets stay addressable.
            let tile_idx = ((at - start_time) / span).max(0);
            let tile_start = start_time + tile_idx * span;
            level.open = Some(Tile::new(
                level.resolution,
                tile_start,
                tile_start + span - 1,
                ignore_cutoff,
            ));
        }
    }

    fn rotate_tile(&mut self, level_idx: usize) {
        let Some(full) = self.levels[level_idx].open.take() else {
            return;
        };
        let level = &self.levels[level_idx];
        let span = level.tile_span(self.config.n_pixels);
        let resolution = level.resolution;
        let successor_start = full.end + 1;

        self.flush_tile(level_idx, full);

        self.levels[level_idx].open = Some(Tile::new(
            resolution,
            successor_start,
            successor_start + span - 1,
            level_idx == 0,
        ));
    }

    /// Serialises and appends one tile. Best-effort: failures are logged
    /// and the build continues (the tile's directory slot stays 0, i.e.
    /// "empty").
    fn flush_tile(&mut self, level_idx: usize, tile: Tile) {
        if tile.is_empty() {
            return;
        }

        let span = self.levels[level_idx].tile_span(self.config.n_pixels);
        let tile_idx = (tile.start - self.start_time) / span;

        let mut bytes = Vec::with_capacity(tile.content_size() as usize);
        if let Err(err) = tile.serialise(&mut bytes) {
            error!(
                kind = "flush",
                ssid = %self.ssid,
                level = level_idx,
                tile_start = tile.start,
                "failed to serialise tile: {err}"
            );
            return;
        }

        let Ok(idx) = usize::try_from(tile_idx) else {
            error!(
                kind = "flush",
                ssid = %self.ssid,
                level = level_idx,
                tile_start = tile.start,
                "tile lies before the history start, dropping it"
            );
            return;
        };
        if idx >= self.levels[level_idx].offsets.len() {
            // The trace ran longer than planned for; grow the directory.
            self.levels[level_idx].offsets.resize(idx + 1, 0);
        }

        match self.file.append_tile(&bytes) {
            Ok(offset) => {
                self.levels[level_idx].offsets[idx] = offset;
                self.num_tiles_flushed += 1;
                self.num_bytes_flushed += bytes.len() as u64;
                trace!(
                    kind = "flush",
                    ssid = %self.ssid,
                    level = level_idx,
                    tile_start = tile.start,
                    offset,
                    bytes = bytes.len(),
                    "tile flushed"
                );
            }
            Err(err) => {
                error!(
                    kind = "flush",
                    ssid = %self.ssid,
                    level = level_idx,
                    tile_start = tile.start,
                    "failed to flush tile: {err}"
                );
            }
        }
    }

    /// Flushes all open tiles, seals the observed end time and writes the
    /// header. A second call is a no-op.
    pub fn finished_building(&mut self, end_time: i64) -> HistoryResult<()> {
        self.check_not_disposed()?;
        if self.finished {
            return Ok(());
        }

        self.end_time = self.end_time.max(end_time);

        for level_idx in 0..self.levels.len() {
            if let Some(tile) = self.levels[level_idx].open.take() {
                self.flush_tile(level_idx, tile);
            }
        }

        let header = FileHeader {
            provider_version: self.provider_version,
            n_pixels: self.config.n_pixels,
            start_time: self.start_time,
            end_time: self.end_time,
            levels: self
                .levels
                .iter()
                .map(|level| LevelDirectory {
                    resolution: level.resolution,
                    offsets: level.offsets.clone(),
                })
                .collect(),
        };
        let final_header = self.file.finish(&header)?;
        for (level, directory) in self.levels.iter_mut().zip(final_header.levels) {
            level.offsets = directory.offsets;
        }
        self.finished = true;

        debug!(
            kind = "finish",
            ssid = %self.ssid,
            end_time = self.end_time,
            num_inserts = self.insert_id,
            num_tiles_flushed = self.num_tiles_flushed,
            num_bytes_flushed = self.num_bytes_flushed,
            "history finished building"
        );

        Ok(())
    }
}

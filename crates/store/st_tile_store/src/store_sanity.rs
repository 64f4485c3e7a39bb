use st_history_types::Quark;

use crate::store::TiledHistoryStore;
use crate::tile::Tile;

// ---

#[derive(thiserror::Error, Debug)]
pub enum SanityError {
    #[error("Resolution ladder is not strictly decreasing: r[{level}] = {resolution} follows {previous}")]
    LadderNotDecreasing {
        level: usize,
        resolution: i64,
        previous: i64,
    },

    #[error("Directory of level {level} has {got} tiles, expected at least {expected}")]
    DirectoryLengthMismatch {
        level: usize,
        expected: usize,
        got: usize,
    },

    #[error("Tile [{tile_start}] quark {quark}: intervals out of order at position {position}")]
    IntervalsOutOfOrder {
        tile_start: i64,
        quark: Quark,
        position: usize,
    },

    #[error(
        "Tile [{tile_start}] quark {quark}: two consecutive sub-resolution runs at position {position}"
    )]
    UncoalescedRuns {
        tile_start: i64,
        quark: Quark,
        position: usize,
    },
}

pub type SanityResult<T> = ::std::result::Result<T, SanityError>;

// ---

impl TiledHistoryStore {
    /// Runs the sanity check suite over the ladder, the directories and
    /// every tile reachable from them.
    ///
    /// Returns an error if anything looks wrong. Beware: this reads every
    /// flushed tile.
    pub fn sanity_check(&self) -> SanityResult<()> {
        let r0 = self.levels[0].resolution;

        for (level_idx, level) in self.levels.iter().enumerate() {
            if level_idx > 0 {
                let previous = self.levels[level_idx - 1].resolution;
                if level.resolution >= previous {
                    return Err(SanityError::LadderNotDecreasing {
                        level: level_idx,
                        resolution: level.resolution,
                        previous,
                    });
                }
            }

            // Directories can only grow past their derived length, never
            // shrink below it.
            let expected = crate::store::div_ceil_i64(r0, level.resolution) as usize;
            if level.offsets.len() < expected {
                return Err(SanityError::DirectoryLengthMismatch {
                    level: level_idx,
                    expected,
                    got: level.offsets.len(),
                });
            }

            for tile_idx in 0..level.offsets.len() {
                if level.offsets[tile_idx] == 0 {
                    continue;
                }
                if let Ok(tile) = self.tile_at(level_idx, tile_idx as i64) {
                    tile.sanity_check()?;
                }
            }
            if let Some(open) = &level.open {
                open.sanity_check()?;
            }
        }

        Ok(())
    }
}

impl Tile {
    /// Checks the per-quark list invariants: sorted, non-overlapping, and
    /// no two consecutive sub-resolution runs (unless the cut-off is
    /// disabled or a null run broke the chain).
    pub(crate) fn sanity_check(&self) -> SanityResult<()> {
        for (quark, column) in self.columns() {
            for (position, pair) in column.windows(2).enumerate() {
                let (earlier, later) = (&pair[0], &pair[1]);

                if later.start < earlier.end {
                    return Err(SanityError::IntervalsOutOfOrder {
                        tile_start: self.start,
                        quark: *quark,
                        position,
                    });
                }

                if !self.ignore_resolution_cutoff
                    && earlier.end - earlier.start < self.resolution
                    && later.end - later.start < self.resolution
                    && !earlier.value.is_null()
                    && !later.value.is_null()
                {
                    return Err(SanityError::UncoalescedRuns {
                        tile_start: self.start,
                        quark: *quark,
                        position,
                    });
                }
            }
        }
        Ok(())
    }
}

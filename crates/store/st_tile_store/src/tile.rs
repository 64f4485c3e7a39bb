use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use itertools::Itertools as _;
use nohash_hasher::IntMap;
use smallvec::SmallVec;

use st_history_types::codec::{
    read_varint_u64, varint_len, write_varint_u64, CodecError, CodecResult,
};
use st_history_types::{Quark, StateInterval, TimeRange};

// ---

/// Size of the fixed part of a tile payload: `tileSize(u32) |
/// nAttributes(u32)`.
const PAYLOAD_BASE_SIZE: u32 = 8;

/// Size of the fixed part of a per-attribute block: `intervalCount(u32) |
/// quark(i32)` (the varint `firstStart` is accounted separately).
const ATTRIBUTE_BASE_SIZE: u32 = 8;

/// What happened to an interval offered to [`Tile::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TileInsert {
    /// The interval was stored (possibly coalesced into the previous run).
    Stored,

    /// The interval ends before this tile's window even starts.
    Discarded,

    /// The interval ends past this tile's window: the tile is now finished
    /// and the caller must flush it and retry on its successor.
    Full,
}

/// A bounded time window at one resolution, holding per-quark ordered
/// interval lists.
///
/// A tile accepts every interval whose `end` falls inside its window
/// `[start, end]`; the interval's `start` may lie before the window (long
/// runs are stored in the tile where they end). Within one quark's list,
/// intervals are sorted by `start` and disjoint: the producer delivers them
/// in non-decreasing end order, so no explicit sort is ever needed.
#[derive(Clone, Debug)]
pub(crate) struct Tile {
    pub resolution: i64,

    /// First timestamp of the window.
    pub start: i64,

    /// Last timestamp of the window (inclusive).
    pub end: i64,

    /// When set, sub-resolution runs are never coalesced. The coarsest
    /// level's tiles are built with this flag so that they remain
    /// authoritative for point queries.
    pub ignore_resolution_cutoff: bool,

    /// Set once an interval past the window was offered; the tile no longer
    /// accepts inserts.
    pub finished: bool,

    /// Total payload byte count, including the `tileSize` field itself.
    content_size: u32,

    columns: IntMap<Quark, Vec<StateInterval>>,
}

impl Tile {
    pub fn new(resolution: i64, start: i64, end: i64, ignore_resolution_cutoff: bool) -> Self {
        debug_assert!(resolution > 0);
        debug_assert!(start <= end);
        Self {
            resolution,
            start,
            end,
            ignore_resolution_cutoff,
            finished: false,
            content_size: PAYLOAD_BASE_SIZE,
            columns: Default::default(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Total payload byte count, including the `tileSize` field itself.
    #[inline]
    pub fn content_size(&self) -> u32 {
        self.content_size
    }

    /// The per-quark interval lists, in no particular quark order.
    pub fn columns(&self) -> impl Iterator<Item = (&Quark, &Vec<StateInterval>)> + '_ {
        self.columns.iter()
    }

    /// Offers one interval to this tile.
    ///
    /// Runs shorter than the resolution are absorbed into the previous run
    /// of the same quark when that run is also sub-resolution and neither
    /// run is null, unless [`Self::ignore_resolution_cutoff`] is set.
    pub fn insert(&mut self, interval: StateInterval) -> TileInsert {
        if interval.end < self.start {
            return TileInsert::Discarded;
        }
        if interval.end > self.end {
            self.finished = true;
            return TileInsert::Full;
        }

        let resolution = self.resolution;
        let column = self.columns.entry(interval.quark).or_default();

        let coalesce = !self.ignore_resolution_cutoff
            && interval.end - interval.start < resolution
            && !interval.value.is_null()
            && column
                .last()
                .is_some_and(|last| last.end - last.start < resolution && !last.value.is_null());

        if coalesce {
            // The earlier sub-resolution run absorbs this one.
            let n = column.len();
            let prev_end = if n >= 2 {
                column[n - 2].end
            } else {
                column[0].start
            };
            let old_size = column[n - 1].record_size(prev_end) as u32;
            column[n - 1].end = interval.end;
            let new_size = column[n - 1].record_size(prev_end) as u32;
            self.content_size = self.content_size - old_size + new_size;
            return TileInsert::Stored;
        }

        if column.is_empty() {
            self.content_size += ATTRIBUTE_BASE_SIZE + varint_len(interval.start as u64) as u32;
        }
        let prev_end = column.last().map_or(interval.start, |prev| prev.end);
        debug_assert!(prev_end <= interval.start, "inserts must arrive in order");
        self.content_size += interval.record_size(prev_end) as u32;
        column.push(interval);

        TileInsert::Stored
    }

    /// The interval covering `t` for one quark, if this tile holds it.
    pub fn interval_at(&self, quark: Quark, t: i64) -> Option<&StateInterval> {
        if t > self.end {
            return None;
        }
        // Lists are short by construction (at most ~n_pixels entries), so a
        // linear scan beats a binary search bookkeeping-wise.
        self.columns
            .get(&quark)?
            .iter()
            .find(|interval| interval.contains(t))
    }

    /// All intervals covering `t`, across every quark this tile knows.
    pub fn point_query(&self, t: i64) -> impl Iterator<Item = &StateInterval> + '_ {
        let in_window = t <= self.end;
        self.columns
            .values()
            .filter(move |_| in_window)
            .filter_map(move |column| column.iter().find(|interval| interval.contains(t)))
    }

    /// Lazily yields the intervals of the requested quarks that intersect
    /// `range`.
    pub fn range_query<'a>(
        &'a self,
        quarks: &'a [Quark],
        range: TimeRange,
    ) -> impl Iterator<Item = &'a StateInterval> + 'a {
        quarks
            .iter()
            .filter_map(move |quark| self.columns.get(quark))
            .flat_map(move |column| {
                column
                    .iter()
                    .filter(move |interval| interval.intersects(range))
            })
    }

    /// The quarks whose state at `t` this tile does not know: their list is
    /// empty or ends before `t`.
    pub fn missing(&self, quarks: &[Quark], t: i64) -> SmallVec<[Quark; 16]> {
        quarks
            .iter()
            .copied()
            .filter(|quark| {
                self.columns
                    .get(quark)
                    .and_then(|column| column.last())
                    .is_none_or(|last| last.end < t)
            })
            .collect()
    }

    // --- Serialisation ---
    //
    // Payload layout:
    //
    //   tileSize(u32) | nAttributes(u32) |
    //   repeated nAttributes times:
    //       intervalCount(u32) | quark(i32) | firstStart(varint) |
    //       intervalCount × (gap varint | type u8 | value | duration varint)

    pub fn serialise(&self, write: &mut impl Write) -> CodecResult<()> {
        write.write_u32::<LittleEndian>(self.content_size)?;
        write.write_u32::<LittleEndian>(self.columns.len() as u32)?;

        // Deterministic output, for reproducible files and round-trip tests.
        for quark in self.columns.keys().copied().sorted_unstable() {
            let column = &self.columns[&quark];
            write.write_u32::<LittleEndian>(column.len() as u32)?;
            write.write_i32::<LittleEndian>(quark)?;
            write_varint_u64(write, column[0].start as u64)?;

            let mut prev_end = column[0].start;
            for interval in column {
                interval.encode_record(prev_end, write)?;
                prev_end = interval.end;
            }
        }

        Ok(())
    }

    /// The inverse of [`Self::serialise`]; `read` is positioned after the
    /// `tileSize` field, whose value is passed as `tile_size`.
    pub fn deserialise(
        read: &mut impl Read,
        tile_size: u32,
        resolution: i64,
        start: i64,
        end: i64,
        ignore_resolution_cutoff: bool,
    ) -> CodecResult<Self> {
        let n_attributes = read.read_u32::<LittleEndian>()?;

        let mut columns = IntMap::<Quark, Vec<StateInterval>>::default();
        for _ in 0..n_attributes {
            let interval_count = read.read_u32::<LittleEndian>()?;
            let quark = read.read_i32::<LittleEndian>()?;
            let first_start = read_varint_u64(read)? as i64;

            let mut column = Vec::with_capacity(interval_count as usize);
            let mut prev_end = first_start;
            for _ in 0..interval_count {
                let interval = StateInterval::decode_record(prev_end, quark, read)?;
                prev_end = interval.end;
                column.push(interval);
            }
            if columns.insert(quark, column).is_some() {
                return Err(CodecError::TruncatedTile);
            }
        }

        Ok(Self {
            resolution,
            start,
            end,
            ignore_resolution_cutoff,
            finished: true,
            content_size: tile_size,
            columns,
        })
    }
}

// ----------------------------------------------------------------------------

use std::io::{Read, Write};

use crate::codec::{read_varint_u64, varint_len, write_varint_u64, CodecResult};
use crate::{StateValue, TimeRange};

// ---

/// Attributes are identified at runtime by a small integer, the quark.
///
/// Quarks are handed out by the owning framework's attribute tree
/// (see [`crate::AttributeTree`]); valid quarks are `>= 0`.
pub type Quark = i32;

/// A value assigned to one attribute for a contiguous time range.
///
/// Both ends are inclusive, and `end >= start`. Intervals are immutable once
/// stored, except that a tile may extend a not-yet-finalised run's `end`
/// while coalescing sub-resolution runs.
#[derive(Clone, Debug, PartialEq)]
pub struct StateInterval {
    pub start: i64,
    pub end: i64,
    pub quark: Quark,
    pub value: StateValue,
}

impl StateInterval {
    #[inline]
    pub fn new(start: i64, end: i64, quark: Quark, value: StateValue) -> Self {
        debug_assert!(start <= end, "interval must not end before it starts");
        debug_assert!(quark >= 0, "valid quarks are non-negative");
        Self {
            start,
            end,
            quark,
            value,
        }
    }

    #[inline]
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    #[inline]
    pub fn intersects(&self, range: TimeRange) -> bool {
        self.start <= range.max && range.min <= self.end
    }

    #[inline]
    pub fn duration(&self) -> u64 {
        (self.end - self.start) as u64
    }

    // --- Wire form ---
    //
    // Inside a tile, a quark's intervals are stored as a run of records:
    //
    //   gap: varint | type: u8 | value | duration: varint
    //
    // `gap` is the distance from the previous record's `end` (for the first
    // record, from the list's `first_start` field, i.e. zero). Storing the
    // gap explicitly keeps start reconstruction exact even when a list has
    // holes in it.

    /// Encodes this interval relative to the previous record's inclusive
    /// `end` (pass the interval's own `start` for the first record).
    pub fn encode_record(&self, prev_end: i64, write: &mut impl Write) -> CodecResult<()> {
        debug_assert!(prev_end <= self.start);
        write_varint_u64(write, (self.start - prev_end) as u64)?;
        self.value.encode(write)?;
        write_varint_u64(write, self.duration())?;
        Ok(())
    }

    /// Decodes one record; the inverse of [`Self::encode_record`].
    pub fn decode_record(prev_end: i64, quark: Quark, read: &mut impl Read) -> CodecResult<Self> {
        let gap = read_varint_u64(read)? as i64;
        let value = StateValue::decode(read)?;
        let duration = read_varint_u64(read)? as i64;
        let start = prev_end + gap;
        Ok(Self {
            start,
            end: start + duration,
            quark,
            value,
        })
    }

    /// The encoded size of this interval's record, in bytes.
    pub fn record_size(&self, prev_end: i64) -> usize {
        varint_len((self.start - prev_end) as u64)
            + self.value.encoded_size()
            + varint_len(self.duration())
    }
}

impl std::fmt::Display for StateInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}] q{} = {}",
            self.start, self.end, self.quark, self.value
        )
    }
}

// ----------------------------------------------------------------------------

use nohash_hasher::IntMap;

use st_history_types::{
    HistoryBackend, HistoryError, HistoryResult, Quark, StateInterval,
};

// ---

/// A plain in-memory history back-end: per-quark sorted interval lists,
/// nothing persisted.
///
/// Useful as the inner store of a partial history (the checkpoint subset is
/// small) and as the reference implementation in tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    start_time: i64,
    end_time: i64,
    columns: IntMap<Quark, Vec<StateInterval>>,
    finished: bool,
    disposed: bool,
}

impl MemoryBackend {
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            end_time: start_time,
            ..Default::default()
        }
    }

    fn check_query_time(&self, t: i64) -> HistoryResult<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        if t < self.start_time || t > self.end_time {
            return Err(HistoryError::TimeOutOfRange {
                t,
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    /// The interval covering `t` in one sorted column: the last interval
    /// starting at or before `t`, if it reaches `t`.
    fn lookup(column: &[StateInterval], t: i64) -> Option<&StateInterval> {
        let idx = column.partition_point(|interval| interval.start <= t);
        let candidate = &column[idx.checked_sub(1)?];
        candidate.contains(t).then_some(candidate)
    }
}

impl HistoryBackend for MemoryBackend {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.end_time
    }

    fn insert(&mut self, interval: StateInterval) -> HistoryResult<()> {
        if self.disposed || self.finished {
            return Err(HistoryError::Disposed);
        }
        if interval.end < interval.start {
            return Err(HistoryError::TimeOutOfRange {
                t: interval.end,
                start: interval.start,
                end: i64::MAX,
            });
        }
        self.end_time = self.end_time.max(interval.end);

        let column = self.columns.entry(interval.quark).or_default();
        debug_assert!(
            column.last().is_none_or(|prev| prev.start <= interval.start),
            "inserts must arrive in order"
        );
        column.push(interval);
        Ok(())
    }

    fn finished_building(&mut self, end_time: i64) -> HistoryResult<()> {
        if self.disposed {
            return Err(HistoryError::Disposed);
        }
        self.end_time = self.end_time.max(end_time);
        self.finished = true;
        Ok(())
    }

    fn point_query(&self, t: i64, buffer: &mut [Option<StateInterval>]) -> HistoryResult<()> {
        self.check_query_time(t)?;
        for (quark, column) in &self.columns {
            if let Some(slot) = buffer.get_mut(*quark as usize)
                && slot.is_none()
            {
                *slot = Self::lookup(column, t).cloned();
            }
        }
        Ok(())
    }

    fn singular_query(&self, t: i64, quark: Quark) -> HistoryResult<Option<StateInterval>> {
        self.check_query_time(t)?;
        Ok(self
            .columns
            .get(&quark)
            .and_then(|column| Self::lookup(column, t))
            .cloned())
    }

    fn range_query(
        &self,
        quarks: &[Quark],
        times: &[i64],
    ) -> Box<dyn Iterator<Item = StateInterval> + Send + '_> {
        // One lookup per sample, deduplicating runs that span several
        // samples.
        let mut out = Vec::new();
        for &quark in quarks {
            let Some(column) = self.columns.get(&quark) else {
                continue;
            };
            let mut last_start = None;
            for &t in times {
                if let Some(interval) = Self::lookup(column, t)
                    && last_start != Some(interval.start)
                {
                    last_start = Some(interval.start);
                    out.push(interval.clone());
                }
            }
        }
        Box::new(out.into_iter())
    }

    fn dispose(&mut self) -> HistoryResult<()> {
        self.disposed = true;
        self.columns.clear();
        Ok(())
    }

    fn remove_files(&mut self) {
        // Nothing on disk.
    }
}

// ----------------------------------------------------------------------------

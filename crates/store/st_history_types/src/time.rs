// ---

/// An inclusive range of timestamps: `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub const EVERYTHING: Self = Self {
        min: i64::MIN,
        max: i64::MAX,
    };

    #[inline]
    pub fn new(min: i64, max: i64) -> Self {
        debug_assert!(min <= max);
        Self { min, max }
    }

    /// A range covering a single timestamp.
    #[inline]
    pub fn point(t: i64) -> Self {
        Self { min: t, max: t }
    }

    #[inline]
    pub fn contains(&self, t: i64) -> bool {
        self.min <= t && t <= self.max
    }

    #[inline]
    pub fn intersects(&self, other: Self) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Number of timestamps covered (both ends included).
    #[inline]
    pub fn length(&self) -> u64 {
        self.max.abs_diff(self.min) + 1
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

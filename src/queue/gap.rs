use std::fmt::{Display, Formatter};

/// A contiguous range of missing sequence numbers, `start..start+count`. A count of 0 means
///  'no gap'.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub count: u32,
}

impl Gap {
    pub const NONE: Gap = Gap { start: 0, count: 0 };

    pub fn new(start: u64, count: u32) -> Gap {
        Gap { start, count }
    }

    /// The gap between `start` (incl) and `end` (excl), saturating at `u32::MAX` entries
    pub fn between(start: u64, end: u64) -> Gap {
        if end <= start {
            return Gap::NONE;
        }
        Gap {
            start,
            count: (end - start).try_into().unwrap_or(u32::MAX),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// exclusive upper bound
    pub fn end(&self) -> u64 {
        self.start + self.count as u64
    }

    pub fn contains(&self, seq_no: u64) -> bool {
        seq_no >= self.start && seq_no < self.end()
    }
}

impl Display for Gap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("-")
        }
        else {
            write!(f, "{}+{}", self.start, self.count)
        }
    }
}

/// reported by a receive queue when an insertion changed the current gap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GapChange {
    pub prev: Gap,
    pub now: Gap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(5, 5, Gap::NONE)]
    #[case::reversed(6, 5, Gap::NONE)]
    #[case::one(5, 6, Gap::new(5, 1))]
    #[case::ten(21, 31, Gap::new(21, 10))]
    #[case::saturating(0, u64::MAX, Gap::new(0, u32::MAX))]
    fn test_between(#[case] start: u64, #[case] end: u64, #[case] expected: Gap) {
        assert_eq!(Gap::between(start, end), expected);
    }

    #[rstest]
    #[case::before(20, false)]
    #[case::first(21, true)]
    #[case::last(30, true)]
    #[case::after(31, false)]
    fn test_contains(#[case] seq_no: u64, #[case] expected: bool) {
        assert_eq!(Gap::new(21, 10).contains(seq_no), expected);
    }
}

use std::fmt::{Display, Formatter};

/// Sequence numbers start at 1 and increase strictly per direction. `i64::MAX` is the
///  rollover limit and must never be assigned to an application message.
pub type SequenceNumber = i64;

/// An inclusive range of sequence numbers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SequenceRange {
    pub lower: SequenceNumber,
    pub upper: SequenceNumber,
}

impl SequenceRange {
    pub fn new(lower: SequenceNumber, upper: SequenceNumber) -> SequenceRange {
        assert!(lower <= upper, "range lower bound above upper bound");
        SequenceRange { lower, upper }
    }

    pub fn contains(&self, number: SequenceNumber) -> bool {
        self.lower <= number && number <= self.upper
    }
}

impl Display for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.lower, self.upper)
    }
}

/// An ordered collection of disjoint inclusive ranges representing which sequence numbers
///  have been seen.
///
/// Invariant: ranges are sorted, pairwise disjoint and never adjacent - merging a number
///  adjacent to an existing range always extends that range (coalescing with the next range
///  if the gap between them closes).
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct SequenceRangeCollection {
    ranges: Vec<SequenceRange>,
}

impl SequenceRangeCollection {
    pub fn new() -> SequenceRangeCollection {
        SequenceRangeCollection { ranges: Vec::new() }
    }

    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[SequenceRange] {
        &self.ranges
    }

    /// The highest number contained in any range, or 0 if the collection is empty.
    pub fn max(&self) -> SequenceNumber {
        self.ranges.last().map(|r| r.upper).unwrap_or(0)
    }

    pub fn contains(&self, number: SequenceNumber) -> bool {
        self.find(number).is_ok()
    }

    /// Index of the range containing `number`, or the insertion index for a new range.
    fn find(&self, number: SequenceNumber) -> Result<usize, usize> {
        self.ranges.binary_search_by(|r| {
            if r.upper < number {
                std::cmp::Ordering::Less
            }
            else if r.lower > number {
                std::cmp::Ordering::Greater
            }
            else {
                std::cmp::Ordering::Equal
            }
        })
    }

    /// Returns true iff merging `number` would grow the collection by a new disjoint range,
    ///  i.e. `number` is neither contained in nor adjacent to an existing range.
    pub fn would_add_range(&self, number: SequenceNumber) -> bool {
        match self.find(number) {
            Ok(_) => false,
            Err(idx) => {
                let extends_left = idx > 0 && self.ranges[idx - 1].upper == number - 1;
                let extends_right = idx < self.ranges.len() && self.ranges[idx].lower == number + 1;
                !extends_left && !extends_right
            }
        }
    }

    /// Merges `number` into the collection. Returns false if the number was already
    ///  contained (the duplicate-detection primitive), true if it was new.
    pub fn merge(&mut self, number: SequenceNumber) -> bool {
        let idx = match self.find(number) {
            Ok(_) => return false,
            Err(idx) => idx,
        };

        let extends_left = idx > 0 && self.ranges[idx - 1].upper == number - 1;
        let extends_right = idx < self.ranges.len() && self.ranges[idx].lower == number + 1;

        match (extends_left, extends_right) {
            (true, true) => {
                // closes the gap between two ranges: coalesce
                self.ranges[idx - 1].upper = self.ranges[idx].upper;
                self.ranges.remove(idx);
            }
            (true, false) => {
                self.ranges[idx - 1].upper = number;
            }
            (false, true) => {
                self.ranges[idx].lower = number;
            }
            (false, false) => {
                self.ranges.insert(idx, SequenceRange::new(number, number));
            }
        }
        true
    }
}

impl Display for SequenceRangeCollection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", range)?;
        }
        write!(f, "}}")
    }
}

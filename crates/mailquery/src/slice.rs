//! Slice bounds with sequence-slicing semantics: optional start and stop,
//! negative values counting from the end, and a non-zero step.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// `[start:stop:step]` bounds for [`QuerySet::slice`](crate::QuerySet::slice).
///
/// ```
/// use mailquery::Slice;
///
/// assert_eq!(Slice::from(1..3).indices(5), vec![1, 2]);
/// assert_eq!(Slice::from(-2..).indices(5), vec![3, 4]);
/// assert_eq!(Slice::from(..).with_step(-2).indices(5), vec![4, 2, 0]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: isize,
}

impl Slice {
    pub fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Self { start, stop, step }
    }

    pub fn with_step(mut self, step: isize) -> Self {
        self.step = step;
        self
    }

    /// Whether a bound counts from the end, which needs the total length.
    pub fn has_negative_bound(&self) -> bool {
        self.start.is_some_and(|s| s < 0) || self.stop.is_some_and(|s| s < 0)
    }

    /// The selected indices into a sequence of `len` elements.
    ///
    /// A zero step selects nothing.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        let step = self.step;
        if step == 0 {
            return Vec::new();
        }
        let len = len as isize;
        let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let clamp = |v: isize| {
            let v = if v < 0 { v + len } else { v };
            v.clamp(lower, upper)
        };
        let start = self
            .start
            .map(clamp)
            .unwrap_or(if step > 0 { lower } else { upper });
        let stop = self
            .stop
            .map(clamp)
            .unwrap_or(if step > 0 { upper } else { lower });

        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            i += step;
        }
        out
    }

    /// Offset and limit for a forward, unit-step slice with no negative
    /// bounds. `None` for any other slice.
    pub fn forward_window(&self) -> Option<(usize, Option<usize>)> {
        if self.step != 1 || self.has_negative_bound() {
            return None;
        }
        let start = self.start.unwrap_or(0) as usize;
        let limit = self.stop.map(|stop| (stop as usize).saturating_sub(start));
        Some((start, limit))
    }

    /// Resolves negative bounds against a known length, keeping the step.
    pub fn resolve(&self, len: usize) -> Slice {
        let fix = |v: isize| {
            if v < 0 {
                (v + len as isize).max(0)
            } else {
                v
            }
        };
        Slice {
            start: self.start.map(fix),
            stop: self.stop.map(fix),
            step: self.step,
        }
    }
}

impl From<Range<isize>> for Slice {
    fn from(r: Range<isize>) -> Self {
        Slice::new(Some(r.start), Some(r.end), 1)
    }
}

impl From<RangeFrom<isize>> for Slice {
    fn from(r: RangeFrom<isize>) -> Self {
        Slice::new(Some(r.start), None, 1)
    }
}

impl From<RangeTo<isize>> for Slice {
    fn from(r: RangeTo<isize>) -> Self {
        Slice::new(None, Some(r.end), 1)
    }
}

impl From<RangeFull> for Slice {
    fn from(_: RangeFull) -> Self {
        Slice::new(None, None, 1)
    }
}

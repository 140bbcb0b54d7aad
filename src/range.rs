// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Contiguous intervals of absolute queue ids.

use std::fmt::{self, Display};

use crate::QueueId;

/// A non-empty interval `[base, base + size)` in a queue id space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueRange {
    base: QueueId,
    size: u32,
}

impl QueueRange {
    /// Create a new range while checking for overflow.
    ///
    /// Returns `None` for a zero-length range, or when the last queue id of the range
    /// does not fit in a `QueueId`.
    pub fn new(base: QueueId, size: u32) -> Option<Self> {
        if size == 0 {
            return None;
        }

        // A range that ends at the very edge of the id space is still valid.
        base.checked_add(size - 1)?;

        Some(QueueRange { base, size })
    }

    /// Return the first queue id of the range.
    pub fn base(&self) -> QueueId {
        self.base
    }

    /// Return the number of queue ids in the range.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Return the last queue id that's still part of the range.
    pub fn last(&self) -> QueueId {
        self.base + (self.size - 1)
    }

    /// Check whether `qid` falls inside the range.
    pub fn contains(&self, qid: QueueId) -> bool {
        qid >= self.base && qid <= self.last()
    }

    /// Check whether `self` and `other` overlap as intervals.
    pub fn overlaps(&self, other: &QueueRange) -> bool {
        !(self.base > other.last() || self.last() < other.base)
    }

    /// Return the sub-range of `size` ids starting `offset` ids past `self.base()`, if it
    /// lies entirely within `self`.
    pub fn subrange(&self, offset: u32, size: u32) -> Option<QueueRange> {
        if size == 0 || offset.checked_add(size)? > self.size {
            return None;
        }
        Some(QueueRange {
            base: self.base + offset,
            size,
        })
    }

    /// Return the position of `other` relative to `self.base()`, if `other` is fully
    /// contained in `self`.
    pub fn offset_of(&self, other: &QueueRange) -> Option<u32> {
        if self.contains(other.base) && self.contains(other.last()) {
            Some(other.base - self.base)
        } else {
            None
        }
    }
}

impl Display for QueueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.base, self.last())
    }
}

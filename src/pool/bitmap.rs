// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Fixed-length occupancy bitmap backing a [`ResourcePool`](../struct.ResourcePool.html).
//!
//! Bit `n` describes the queue at offset `n` from the base of the pool window. A set bit
//! means the queue belongs to some function; a clear bit means it is free.

use std::collections::TryReserveError;

use super::AllocPolicy;

const WORD_BITS: u32 = u64::BITS;

/// A bitmap over `len` queue slots.
///
/// # Examples
///
/// ```
/// use qdma_resource::pool::bitmap::QueueBitmap;
/// use qdma_resource::pool::AllocPolicy;
///
/// let mut bitmap = QueueBitmap::new(8).unwrap();
/// bitmap.set_range(0, 5);
/// assert_eq!(bitmap.find_free_run(3, AllocPolicy::FirstMatch), Some(5));
/// assert_eq!(bitmap.find_free_run(4, AllocPolicy::FirstMatch), None);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueBitmap {
    words: Vec<u64>,
    len: u32,
}

impl QueueBitmap {
    /// Create a bitmap with `len` slots, all of them free.
    ///
    /// The backing storage is reserved up front so that an allocation failure is
    /// reported to the caller instead of aborting the process.
    pub fn new(len: u32) -> Result<Self, TryReserveError> {
        let nwords = (len as usize + (WORD_BITS as usize - 1)) / WORD_BITS as usize;
        let mut words = Vec::new();
        words.try_reserve_exact(nwords)?;
        words.resize(nwords, 0);
        Ok(QueueBitmap { words, len })
    }

    /// Return the number of slots tracked by the bitmap.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Return whether slot `idx` is allocated. Slots past the end read as free.
    pub fn is_set(&self, idx: u32) -> bool {
        if idx >= self.len {
            return false;
        }
        self.words[(idx / WORD_BITS) as usize] & (1 << (idx % WORD_BITS)) != 0
    }

    /// Mark `count` slots starting at `start` as allocated.
    pub fn set_range(&mut self, start: u32, count: u32) {
        self.update_range(start, count, true);
    }

    /// Mark `count` slots starting at `start` as free.
    pub fn clear_range(&mut self, start: u32, count: u32) {
        self.update_range(start, count, false);
    }

    fn update_range(&mut self, start: u32, count: u32, value: bool) {
        debug_assert!(start.checked_add(count).map_or(false, |end| end <= self.len));
        let end = start.saturating_add(count).min(self.len);
        for idx in start..end {
            let word = &mut self.words[(idx / WORD_BITS) as usize];
            let mask = 1u64 << (idx % WORD_BITS);
            if value {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }

    /// Return whether every slot in `[start, start + count)` is free.
    pub fn is_range_clear(&self, start: u32, count: u32) -> bool {
        match start.checked_add(count) {
            Some(end) if end <= self.len => (start..end).all(|idx| !self.is_set(idx)),
            _ => false,
        }
    }

    /// Return the number of allocated slots.
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }

    /// Return the number of free slots.
    pub fn count_clear(&self) -> u32 {
        self.len - self.count_set()
    }

    /// Iterate over the maximal runs of free slots, lowest offset first.
    pub fn free_runs(&self) -> FreeRuns<'_> {
        FreeRuns {
            bitmap: self,
            pos: 0,
        }
    }

    /// Find `count` contiguous free slots according to `policy`, returning the offset of
    /// the first one. Nothing is marked; the caller does that with `set_range`.
    pub fn find_free_run(&self, count: u32, policy: AllocPolicy) -> Option<u32> {
        if count == 0 || count > self.len {
            return None;
        }

        let mut candidates = self.free_runs().filter(|&(_, len)| len >= count);
        match policy {
            AllocPolicy::FirstMatch => candidates.next().map(|(start, _)| start),
            // `min_by_key` keeps the first of several equal runs, i.e. the lowest one.
            AllocPolicy::BestMatch => candidates
                .min_by_key(|&(_, len)| len)
                .map(|(start, _)| start),
        }
    }
}

/// Iterator over `(offset, length)` pairs of free runs in a [`QueueBitmap`].
pub struct FreeRuns<'a> {
    bitmap: &'a QueueBitmap,
    pos: u32,
}

impl<'a> FreeRuns<'a> {
    // Skip whole words when they are fully allocated.
    fn skip_allocated(&mut self) {
        while self.pos < self.bitmap.len {
            if self.pos % WORD_BITS == 0 {
                let word = self.bitmap.words[(self.pos / WORD_BITS) as usize];
                if word == u64::MAX {
                    self.pos = self.pos.saturating_add(WORD_BITS);
                    continue;
                }
            }
            if !self.bitmap.is_set(self.pos) {
                return;
            }
            self.pos += 1;
        }
    }
}

impl<'a> Iterator for FreeRuns<'a> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_allocated();
        if self.pos >= self.bitmap.len {
            return None;
        }

        let start = self.pos;
        while self.pos < self.bitmap.len && !self.bitmap.is_set(self.pos) {
            self.pos += 1;
        }
        Some((start, self.pos - start))
    }
}

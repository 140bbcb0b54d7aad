// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Provides the queue pool of a single physical device.
//!
//! A pool owns a window `[q_base, q_base + total_q)` of absolute queue ids and hands out
//! disjoint, contiguous slices of it to the PCI functions registered with it. The union of
//! the slices owned by the functions is always exactly the set of allocated bits in the
//! pool's bitmap.
//!
//! A function whose queues are active is frozen: its slice can't be moved or resized
//! until every active queue has been stopped.

pub mod bitmap;

use std::collections::HashMap;

use log::{debug, info, warn};
use thiserror::Error;

use crate::entry::{DeviceEntry, DeviceType, EntryInfo, QueueRangeCheck};
use crate::range::QueueRange;
use crate::{BusId, FuncId, QueueId};

use self::bitmap::QueueBitmap;

/// Errors encountered during pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A device entry already exists for the function.
    #[error("device entry for function {0} already exists")]
    EntryAlreadyExists(FuncId),
    /// No device entry exists for the function.
    #[error("device entry for function {0} does not exist")]
    EntryNotFound(FuncId),
    /// The backing bitmap could not be allocated.
    #[error("failed to allocate queue bitmap")]
    AllocFailure,
    /// No contiguous run of free queues is large enough.
    #[error("not enough contiguous queues for function {func} (requested {requested})")]
    NotEnoughSpace {
        /// Function that requested the queues.
        func: FuncId,
        /// Number of queues requested.
        requested: u32,
    },
    /// The function has active queues, so its range can't change.
    #[error("queue range of function {func} is frozen by {active} active queues")]
    Frozen {
        /// Function whose range is frozen.
        func: FuncId,
        /// Number of active queues.
        active: u32,
    },
    /// The active queue counter would leave `[0, qmax]`.
    #[error("active queue count of function {func} out of bounds ({active}/{qmax})")]
    CounterBounds {
        /// Function whose counter was updated.
        func: FuncId,
        /// Active queue count before the update.
        active: u32,
        /// Upper bound of the counter.
        qmax: u32,
    },
    /// The last queue id of the window doesn't fit in the queue id space.
    #[error("invalid queue window (base {q_base}, total {total_q})")]
    InvalidPool {
        /// Requested first queue id.
        q_base: QueueId,
        /// Requested number of queues.
        total_q: u32,
    },
}

impl Error {
    /// Return the OS error number that best describes this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::EntryAlreadyExists(_) => libc::EEXIST,
            Error::EntryNotFound(_) => libc::ENOENT,
            Error::AllocFailure => libc::ENOMEM,
            Error::NotEnoughSpace { .. } => libc::ENOSPC,
            Error::Frozen { .. } => libc::EBUSY,
            Error::CounterBounds { .. } => libc::ERANGE,
            Error::InvalidPool { .. } => libc::EINVAL,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::from_raw_os_error(e.errno())
    }
}

/// Wrapper over std::result::Result for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Policy used to pick a run of free queues when resizing a function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Use the lowest-addressed run that is large enough.
    FirstMatch,
    /// Use the smallest run that is large enough; ties go to the lowest address.
    BestMatch,
}

impl Default for AllocPolicy {
    fn default() -> Self {
        AllocPolicy::FirstMatch
    }
}

/// Configuration of a [`ResourcePool`].
///
/// # Example
///
/// ```
/// use qdma_resource::pool::{AllocPolicy, PoolConfig};
///
/// let config = PoolConfig::new(0, 2048).with_policy(AllocPolicy::BestMatch);
/// assert_eq!(config.total_q, 2048);
/// assert_eq!(PoolConfig::new(0, 8).policy, AllocPolicy::FirstMatch);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// First absolute queue id managed by the pool.
    pub q_base: QueueId,
    /// Number of queues managed by the pool.
    pub total_q: u32,
    /// Allocation policy used by resize requests.
    pub policy: AllocPolicy,
}

impl PoolConfig {
    /// Create a configuration for the window `[q_base, q_base + total_q)` with the
    /// default policy.
    pub fn new(q_base: QueueId, total_q: u32) -> Self {
        PoolConfig {
            q_base,
            total_q,
            policy: AllocPolicy::default(),
        }
    }

    /// Replace the allocation policy.
    pub fn with_policy(mut self, policy: AllocPolicy) -> Self {
        self.policy = policy;
        self
    }

    // An empty window is valid: it just can't hand out any queue.
    fn validate(&self) -> Result<()> {
        if self.total_q > 0 && self.q_base.checked_add(self.total_q - 1).is_none() {
            return Err(Error::InvalidPool {
                q_base: self.q_base,
                total_q: self.total_q,
            });
        }
        Ok(())
    }
}

/// Accounting summary of a pool.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    pub bus_id: BusId,
    pub q_base: QueueId,
    pub total_q: u32,
    pub policy: AllocPolicy,
    pub allocated: u32,
    pub free: u32,
    pub entries: usize,
    pub active_queues: u32,
}

/// The queue pool of one physical device and the entries of its functions.
#[derive(Debug)]
pub struct ResourcePool {
    bus_id: BusId,
    q_base: QueueId,
    policy: AllocPolicy,
    bitmap: QueueBitmap,
    entries: HashMap<FuncId, DeviceEntry>,
}

impl ResourcePool {
    /// Create an empty pool for the device on `bus_id`.
    pub fn new(bus_id: BusId, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let bitmap = QueueBitmap::new(config.total_q).map_err(|_| Error::AllocFailure)?;

        debug!(
            "bus {}: created queue pool of {} queues at {}",
            bus_id, config.total_q, config.q_base
        );
        Ok(ResourcePool {
            bus_id,
            q_base: config.q_base,
            policy: config.policy,
            bitmap,
            entries: HashMap::new(),
        })
    }

    /// Get the bus number of the device owning the pool.
    pub fn bus_id(&self) -> BusId {
        self.bus_id
    }

    /// Get the first absolute queue id of the pool.
    pub fn q_base(&self) -> QueueId {
        self.q_base
    }

    /// Get the number of queues in the pool.
    pub fn total_q(&self) -> u32 {
        self.bitmap.len()
    }

    /// Get the allocation policy.
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Get the number of queues assigned to functions.
    pub fn allocated(&self) -> u32 {
        self.bitmap.count_set()
    }

    /// Get the number of unassigned queues.
    pub fn free(&self) -> u32 {
        self.bitmap.count_clear()
    }

    /// Get the number of device entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool has no device entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a function with an empty queue range.
    pub fn create_entry(&mut self, func_id: FuncId, device_type: DeviceType) -> Result<()> {
        if self.entries.contains_key(&func_id) {
            return Err(Error::EntryAlreadyExists(func_id));
        }
        self.entries
            .insert(func_id, DeviceEntry::new(func_id, device_type));
        debug!(
            "bus {}: created {:?} function {}",
            self.bus_id, device_type, func_id
        );
        Ok(())
    }

    /// Remove a function and return its queues to the pool.
    ///
    /// Active queues don't prevent removal; stopping them is up to the caller.
    pub fn destroy_entry(&mut self, func_id: FuncId) -> Result<DeviceEntry> {
        let entry = self
            .entries
            .remove(&func_id)
            .ok_or(Error::EntryNotFound(func_id))?;
        if let Some(range) = entry.range() {
            self.release(&range);
        }
        debug!(
            "bus {}: destroyed function {} (qbase {}, qmax {}, active {})",
            self.bus_id,
            func_id,
            entry.qbase(),
            entry.qmax(),
            entry.active_queues()
        );
        Ok(entry)
    }

    /// Return the device entry of `func_id`.
    pub fn entry(&self, func_id: FuncId) -> Option<&DeviceEntry> {
        self.entries.get(&func_id)
    }

    /// Iterate over all device entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.entries.values()
    }

    /// Return `(qbase, qmax)` of `func_id`.
    pub fn entry_info(&self, func_id: FuncId) -> Result<(QueueId, u32)> {
        self.entry(func_id)
            .map(|e| (e.qbase(), e.qmax()))
            .ok_or(Error::EntryNotFound(func_id))
    }

    /// Return a snapshot of the entry of `func_id`.
    pub fn entry_snapshot(&self, func_id: FuncId) -> Result<EntryInfo> {
        self.entry(func_id)
            .map(DeviceEntry::info)
            .ok_or(Error::EntryNotFound(func_id))
    }

    /// Return snapshots of all entries, sorted by function id.
    pub fn list_entries(&self) -> Vec<EntryInfo> {
        let mut list: Vec<EntryInfo> = self.entries.values().map(DeviceEntry::info).collect();
        list.sort_by_key(|info| info.func_id);
        list
    }

    /// Change the number of queues owned by `func_id` to `qmax` and return the new qbase.
    ///
    /// The current range is released before searching, so the function may keep its place,
    /// move, or get a range overlapping its old one. On failure the old range is kept.
    /// Shrinking to 0 releases the range and returns 0.
    pub fn resize(&mut self, func_id: FuncId, qmax: u32) -> Result<QueueId> {
        let bus_id = self.bus_id;
        // `None` only for an empty pool, where nothing can be allocated or released.
        let window = QueueRange::new(self.q_base, self.total_q());
        let entry = self
            .entries
            .get_mut(&func_id)
            .ok_or(Error::EntryNotFound(func_id))?;

        if entry.is_frozen() {
            warn!(
                "bus {}: rejected resize of function {} to {}: {} queues active",
                bus_id,
                func_id,
                qmax,
                entry.active_queues()
            );
            return Err(Error::Frozen {
                func: func_id,
                active: entry.active_queues(),
            });
        }

        let old = entry.range();
        let old_offset = old.and_then(|range| window?.offset_of(&range));
        if let (Some(range), Some(offset)) = (old, old_offset) {
            self.bitmap.clear_range(offset, range.size());
        }

        if qmax == 0 {
            entry.set_range(None);
            debug!("bus {}: released queues of function {}", bus_id, func_id);
            return Ok(0);
        }

        let new = self.bitmap.find_free_run(qmax, self.policy).and_then(|offset| {
            window
                .and_then(|w| w.subrange(offset, qmax))
                .map(|range| (offset, range))
        });
        let (offset, range) = match new {
            Some(found) => found,
            None => {
                if let (Some(range), Some(offset)) = (old, old_offset) {
                    self.bitmap.set_range(offset, range.size());
                }
                return Err(Error::NotEnoughSpace {
                    func: func_id,
                    requested: qmax,
                });
            }
        };

        debug_assert!(self.bitmap.is_range_clear(offset, range.size()));
        self.bitmap.set_range(offset, range.size());
        entry.set_range(Some(range));

        match old {
            Some(prev) if prev.base() != range.base() => info!(
                "bus {}: function {} moved from {} to {}",
                bus_id, func_id, prev, range
            ),
            _ => debug!(
                "bus {}: function {} now owns {}",
                bus_id, func_id, range
            ),
        }
        Ok(range.base())
    }

    /// Account for one more active queue of `func_id`, returning the new count.
    pub fn increment_active(&mut self, func_id: FuncId) -> Result<u32> {
        let entry = self
            .entries
            .get_mut(&func_id)
            .ok_or(Error::EntryNotFound(func_id))?;
        let active = entry.active_queues();
        if active >= entry.qmax() {
            return Err(Error::CounterBounds {
                func: func_id,
                active,
                qmax: entry.qmax(),
            });
        }
        entry.set_active_queues(active + 1);
        Ok(active + 1)
    }

    /// Account for one less active queue of `func_id`, returning the new count.
    pub fn decrement_active(&mut self, func_id: FuncId) -> Result<u32> {
        let entry = self
            .entries
            .get_mut(&func_id)
            .ok_or(Error::EntryNotFound(func_id))?;
        let active = entry.active_queues();
        if active == 0 {
            return Err(Error::CounterBounds {
                func: func_id,
                active,
                qmax: entry.qmax(),
            });
        }
        entry.set_active_queues(active - 1);
        Ok(active - 1)
    }

    /// Check whether the hardware queue `hw_qid` belongs to `func_id`.
    pub fn is_queue_in_range(&self, func_id: FuncId, hw_qid: QueueId) -> QueueRangeCheck {
        match self.entry(func_id) {
            Some(entry) if entry.contains(hw_qid) => QueueRangeCheck::InRange,
            _ => QueueRangeCheck::OutOfRange,
        }
    }

    /// Return the number of active queues of `func_id`, or 0 if it's unknown.
    pub fn device_active_queues(&self, func_id: FuncId) -> u32 {
        self.entry(func_id).map_or(0, DeviceEntry::active_queues)
    }

    /// Return the number of active queues over all functions.
    pub fn total_active_queues(&self) -> u32 {
        self.entries.values().map(DeviceEntry::active_queues).sum()
    }

    /// Return an accounting summary of the pool.
    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            bus_id: self.bus_id,
            q_base: self.q_base(),
            total_q: self.total_q(),
            policy: self.policy,
            allocated: self.allocated(),
            free: self.free(),
            entries: self.entries.len(),
            active_queues: self.total_active_queues(),
        }
    }

    fn release(&mut self, range: &QueueRange) {
        let window = QueueRange::new(self.q_base, self.total_q());
        if let Some(offset) = window.and_then(|w| w.offset_of(range)) {
            self.bitmap.clear_range(offset, range.size());
        }
    }
}

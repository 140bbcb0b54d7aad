// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Structs to describe the queue resources owned by a single PCI function.

use crate::range::QueueRange;
use crate::{FuncId, QueueId};

/// Kind of PCI function owning a device entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// PCI physical function.
    Physical,
    /// PCI virtual function.
    Virtual,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Physical
    }
}

/// Resizability state of a device entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// No queue range assigned (`qmax == 0`).
    Unassigned,
    /// A queue range is assigned and none of its queues are active.
    Idle,
    /// At least one queue of the range is active; the range is frozen.
    Active,
}

/// Result of checking a hardware queue id against a function's range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueRangeCheck {
    /// The queue belongs to the function.
    InRange,
    /// The queue does not belong to the function, or the function is unknown.
    OutOfRange,
}

/// Queue range and usage of one function on a device.
#[derive(Clone, Debug)]
pub struct DeviceEntry {
    func_id: FuncId,
    device_type: DeviceType,
    range: Option<QueueRange>,
    active_queues: u32,
}

impl DeviceEntry {
    pub(crate) fn new(func_id: FuncId, device_type: DeviceType) -> Self {
        DeviceEntry {
            func_id,
            device_type,
            range: None,
            active_queues: 0,
        }
    }

    /// Get the function id.
    pub fn func_id(&self) -> FuncId {
        self.func_id
    }

    /// Get the function type.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Get the assigned queue range, if any.
    pub fn range(&self) -> Option<QueueRange> {
        self.range
    }

    /// Get the first queue id of the range, or 0 when unassigned.
    pub fn qbase(&self) -> QueueId {
        self.range.map_or(0, |r| r.base())
    }

    /// Get the number of queues in the range, or 0 when unassigned.
    pub fn qmax(&self) -> u32 {
        self.range.map_or(0, |r| r.size())
    }

    /// Get the number of active queues.
    pub fn active_queues(&self) -> u32 {
        self.active_queues
    }

    /// Whether the range is frozen by active queues.
    pub fn is_frozen(&self) -> bool {
        self.active_queues > 0
    }

    /// Get the resizability state.
    pub fn state(&self) -> EntryState {
        entry_state(self.qmax(), self.active_queues)
    }

    /// Check whether `hw_qid` falls in the range owned by this function.
    pub fn contains(&self, hw_qid: QueueId) -> bool {
        self.range.map_or(false, |r| r.contains(hw_qid))
    }

    /// Take a copy of the entry.
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            func_id: self.func_id,
            device_type: self.device_type,
            qbase: self.qbase(),
            qmax: self.qmax(),
            active_queues: self.active_queues,
        }
    }

    pub(crate) fn set_range(&mut self, range: Option<QueueRange>) {
        self.range = range;
    }

    pub(crate) fn set_active_queues(&mut self, count: u32) {
        debug_assert!(count <= self.qmax());
        self.active_queues = count;
    }
}

/// Snapshot of a [`DeviceEntry`] taken under the pool lock.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub func_id: FuncId,
    pub device_type: DeviceType,
    pub qbase: QueueId,
    pub qmax: u32,
    pub active_queues: u32,
}

impl EntryInfo {
    /// Get the resizability state at the time of the snapshot.
    pub fn state(&self) -> EntryState {
        entry_state(self.qmax, self.active_queues)
    }
}

fn entry_state(qmax: u32, active_queues: u32) -> EntryState {
    if active_queues > 0 {
        EntryState::Active
    } else if qmax > 0 {
        EntryState::Idle
    } else {
        EntryState::Unassigned
    }
}

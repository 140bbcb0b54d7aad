// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Typed command interface for the control plane.
//!
//! A management tool talks to the driver through some transport (netlink in practice) and
//! asks for device info, function lists or a new queue count. The transport layer decodes its
//! messages into [`Command`] values, hands them to a [`CommandHandler`] and encodes the
//! [`Response`] (or the error's `errno()`) back. No wire format lives here.
//!
//! # Example
//!
//! ```
//! use qdma_resource::command::{Command, CommandHandler, Response};
//! use qdma_resource::directory::ResourceDirectory;
//!
//! let directory = ResourceDirectory::new();
//! directory.create_pool(0x81, 0, 512).unwrap();
//! directory.create_entry(0x81, 1).unwrap();
//!
//! let set = Command::SetQmax { bus_id: 0x81, func_id: 1, qmax: 32 };
//! assert_eq!(
//!     directory.handle(&set).unwrap(),
//!     Response::SetQmax { qbase: 0, qmax: 32 }
//! );
//!
//! let info = directory
//!     .handle(&Command::DevInfo { bus_id: 0x81, func_id: 1 })
//!     .unwrap();
//! match info {
//!     Response::DevInfo(entry) => assert_eq!((entry.qbase, entry.qmax), (0, 32)),
//!     other => panic!("unexpected response {:?}", other),
//! }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use crate::directory::{ResourceDirectory, Result};
use crate::entry::{EntryInfo, QueueRangeCheck};
use crate::pool::PoolInfo;
use crate::{BusId, FuncId, QueueId};

/// Requests accepted by a [`CommandHandler`].
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Queue range and usage of one function.
    DevInfo { bus_id: BusId, func_id: FuncId },
    /// All functions of a device.
    DevList { bus_id: BusId },
    /// Change the number of queues of a function.
    SetQmax {
        bus_id: BusId,
        func_id: FuncId,
        qmax: u32,
    },
    /// Active queues of one function, or of the whole device when `func_id` is `None`.
    ActiveQueues {
        bus_id: BusId,
        func_id: Option<FuncId>,
    },
    /// Check a hardware queue id against a function's range.
    QueueCheck {
        bus_id: BusId,
        func_id: FuncId,
        hw_qid: QueueId,
    },
    /// Accounting summary of a device's pool.
    PoolInfo { bus_id: BusId },
}

/// Replies produced by a [`CommandHandler`], one variant per [`Command`].
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    DevInfo(EntryInfo),
    DevList(Vec<EntryInfo>),
    SetQmax { qbase: QueueId, qmax: u32 },
    ActiveQueues(u32),
    QueueCheck(QueueRangeCheck),
    PoolInfo(PoolInfo),
}

/// Represents an object that serves control plane commands.
///
/// Implementations must be callable from several threads at once.
pub trait CommandHandler {
    /// Execute `cmd` and return its reply.
    fn handle(&self, cmd: &Command) -> Result<Response>;
}

impl CommandHandler for ResourceDirectory {
    fn handle(&self, cmd: &Command) -> Result<Response> {
        match *cmd {
            Command::DevInfo { bus_id, func_id } => {
                self.entry_snapshot(bus_id, func_id).map(Response::DevInfo)
            }
            Command::DevList { bus_id } => self.list_entries(bus_id).map(Response::DevList),
            Command::SetQmax {
                bus_id,
                func_id,
                qmax,
            } => self
                .resize(bus_id, func_id, qmax)
                .map(|qbase| Response::SetQmax { qbase, qmax }),
            Command::ActiveQueues { bus_id, func_id } => {
                let count = match func_id {
                    Some(func_id) => self.device_active_queues(bus_id, func_id),
                    None => self.total_active_queues(bus_id),
                };
                Ok(Response::ActiveQueues(count))
            }
            Command::QueueCheck {
                bus_id,
                func_id,
                hw_qid,
            } => Ok(Response::QueueCheck(
                self.is_queue_in_range(bus_id, func_id, hw_qid),
            )),
            Command::PoolInfo { bus_id } => self.pool_info(bus_id).map(Response::PoolInfo),
        }
    }
}

// Blanket implementation for Arc<T>.

impl<T: CommandHandler + ?Sized> CommandHandler for Arc<T> {
    fn handle(&self, cmd: &Command) -> Result<Response> {
        self.deref().handle(cmd)
    }
}

// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![deny(missing_docs)]

//! This crate provides:
//! * a per-device pool of DMA queue ids, handing out contiguous queue ranges to the PCI
//! physical and virtual functions of the device
//! * a directory of such pools keyed by PCI bus number, safe to share between threads
//! * active queue accounting that freezes a function's range while its queues run
//! * a typed command interface for control plane requests (`command` feature)
//!
//! Queues are opaque integer slots here: programming them into hardware is up to the
//! caller.
//!
//! # Example
//!
//! Two functions share a device with 8 queues. Allocation is first-fit from the lowest
//! queue id.
//!```
//! use qdma_resource::directory::ResourceDirectory;
//! use qdma_resource::DeviceType;
//!
//! let directory = ResourceDirectory::new();
//! directory.create_pool(0x01, 0, 8).unwrap();
//! directory.create_entry(0x01, 0).unwrap();
//! directory
//!     .create_entry_with_type(0x01, 1, DeviceType::Virtual)
//!     .unwrap();
//!
//! assert_eq!(directory.resize(0x01, 0, 5).unwrap(), 0);
//! // Only 3 queues are left.
//! assert!(directory.resize(0x01, 1, 4).is_err());
//! assert_eq!(directory.resize(0x01, 1, 3).unwrap(), 5);
//!
//! // Once function 0 is gone, function 1 can grow into its queues.
//! directory.destroy_entry(0x01, 0).unwrap();
//! assert_eq!(directory.resize(0x01, 1, 6).unwrap(), 0);
//! ```

#[cfg(feature = "command")]
pub mod command;
pub mod directory;
pub mod entry;
pub mod pool;
pub mod range;

/// PCI bus number identifying a physical device.
pub type BusId = u32;
/// Function id, unique among the functions of one device.
pub type FuncId = u32;
/// Absolute hardware queue id.
pub type QueueId = u32;

pub use crate::directory::ResourceDirectory;
pub use crate::entry::{DeviceEntry, DeviceType, EntryInfo, EntryState, QueueRangeCheck};
pub use crate::pool::{AllocPolicy, PoolConfig, PoolInfo, ResourcePool};
pub use crate::range::QueueRange;

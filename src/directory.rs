// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! System level queue resource management.
//!
//! [`ResourceDirectory`] keeps one [`ResourcePool`] per physical device, keyed by the PCI bus
//! number of the device, and routes the per-function operations to the right pool.
//!
//! The device attach path creates the pool when it first sees a device and a device entry
//! on every function probe. The control plane then sizes the queue range of each function,
//! and the data path accounts for started and stopped queues.
//!
//! # Examples
//!
//! ```
//! use qdma_resource::directory::{Error, ResourceDirectory};
//! use qdma_resource::pool;
//! use qdma_resource::QueueRangeCheck;
//!
//! let directory = ResourceDirectory::new();
//! directory.create_pool(0x3b, 0, 2048).unwrap();
//! directory.create_entry(0x3b, 0).unwrap();
//!
//! // Give function 0 a slice of 64 queues.
//! let qbase = directory.resize(0x3b, 0, 64).unwrap();
//! assert_eq!(directory.get_entry_info(0x3b, 0).unwrap(), (qbase, 64));
//! assert_eq!(
//!     directory.is_queue_in_range(0x3b, 0, qbase + 63),
//!     QueueRangeCheck::InRange
//! );
//!
//! // A started queue freezes the range.
//! directory.increment_active(0x3b, 0).unwrap();
//! match directory.resize(0x3b, 0, 128) {
//!     Err(Error::Pool { source: pool::Error::Frozen { active, .. }, .. }) => assert_eq!(active, 1),
//!     other => panic!("unexpected result {:?}", other),
//! }
//!
//! directory.decrement_active(0x3b, 0).unwrap();
//! directory.destroy_entry(0x3b, 0).unwrap();
//! directory.destroy_pool(0x3b).unwrap();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};
use thiserror::Error;

use crate::entry::{DeviceType, EntryInfo, QueueRangeCheck};
use crate::pool::{self, PoolConfig, PoolInfo, ResourcePool};
use crate::{BusId, FuncId, QueueId};

/// Error type for [ResourceDirectory] usage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A pool already exists for the bus.
    #[error("queue pool for bus {0:#x} already exists")]
    PoolAlreadyExists(BusId),
    /// No pool exists for the bus.
    #[error("queue pool for bus {0:#x} does not exist")]
    PoolNotFound(BusId),
    /// Error during a pool operation.
    #[error("bus {bus:#x}: {source}")]
    Pool {
        /// Bus of the pool that failed the operation.
        bus: BusId,
        /// The pool error.
        #[source]
        source: pool::Error,
    },
}

impl Error {
    /// Return the OS error number that best describes this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::PoolAlreadyExists(_) => libc::EEXIST,
            Error::PoolNotFound(_) => libc::ENOENT,
            Error::Pool { source, .. } => source.errno(),
        }
    }

    /// Return the pool error, if the failure happened inside a pool.
    pub fn pool_error(&self) -> Option<&pool::Error> {
        match self {
            Error::Pool { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::from_raw_os_error(e.errno())
    }
}

impl From<Error> for vmm_sys_util::errno::Error {
    fn from(e: Error) -> Self {
        vmm_sys_util::errno::Error::new(e.errno())
    }
}

/// Wrapper over std::result::Result for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

type PoolHandle = Arc<Mutex<ResourcePool>>;

/// Registry of the queue pools of all physical devices.
///
/// The registry and each pool have their own lock. Operations on one pool are serialized,
/// reads included, while operations on pools of different buses run concurrently.
#[derive(Default)]
pub struct ResourceDirectory {
    pools: RwLock<HashMap<BusId, PoolHandle>>,
}

impl ResourceDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        ResourceDirectory::default()
    }

    /// Create the pool of the device on `bus_id` for queues `[q_base, q_base + total_q)`.
    pub fn create_pool(&self, bus_id: BusId, q_base: QueueId, total_q: u32) -> Result<()> {
        self.create_pool_with_config(bus_id, PoolConfig::new(q_base, total_q))
    }

    /// Create the pool of the device on `bus_id` from a full configuration.
    pub fn create_pool_with_config(&self, bus_id: BusId, config: PoolConfig) -> Result<()> {
        let mut pools = self.write_pools();
        if pools.contains_key(&bus_id) {
            return Err(Error::PoolAlreadyExists(bus_id));
        }
        let pool = ResourcePool::new(bus_id, config).map_err(|source| Error::Pool {
            bus: bus_id,
            source,
        })?;
        pools.insert(bus_id, Arc::new(Mutex::new(pool)));
        Ok(())
    }

    /// Destroy the pool of `bus_id`, discarding any entries left in it.
    pub fn destroy_pool(&self, bus_id: BusId) -> Result<()> {
        let pool = self
            .write_pools()
            .remove(&bus_id)
            .ok_or(Error::PoolNotFound(bus_id))?;

        let pool = lock_pool(&pool);
        if !pool.is_empty() {
            warn!(
                "bus {:#x}: destroying queue pool with {} entries and {} active queues",
                bus_id,
                pool.len(),
                pool.total_active_queues()
            );
        }
        debug!("bus {:#x}: destroyed queue pool", bus_id);
        Ok(())
    }

    /// Whether a pool exists for `bus_id`.
    pub fn contains_pool(&self, bus_id: BusId) -> bool {
        self.read_pools().contains_key(&bus_id)
    }

    /// Return the bus numbers of all pools, in ascending order.
    pub fn bus_ids(&self) -> Vec<BusId> {
        let mut ids: Vec<BusId> = self.read_pools().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Return the number of pools.
    pub fn len(&self) -> usize {
        self.read_pools().len()
    }

    /// Whether the directory holds no pools.
    pub fn is_empty(&self) -> bool {
        self.read_pools().is_empty()
    }

    /// Create the entry of physical function `func_id` on `bus_id`.
    pub fn create_entry(&self, bus_id: BusId, func_id: FuncId) -> Result<()> {
        self.create_entry_with_type(bus_id, func_id, DeviceType::default())
    }

    /// Create the entry of function `func_id` on `bus_id`.
    pub fn create_entry_with_type(
        &self,
        bus_id: BusId,
        func_id: FuncId,
        device_type: DeviceType,
    ) -> Result<()> {
        self.with_pool(bus_id, |pool| pool.create_entry(func_id, device_type))
    }

    /// Destroy the entry of `func_id` and return its queues to the pool.
    pub fn destroy_entry(&self, bus_id: BusId, func_id: FuncId) -> Result<()> {
        self.with_pool(bus_id, |pool| pool.destroy_entry(func_id).map(|_| ()))
    }

    /// Return `(qbase, qmax)` of function `func_id`.
    pub fn get_entry_info(&self, bus_id: BusId, func_id: FuncId) -> Result<(QueueId, u32)> {
        self.with_pool(bus_id, |pool| pool.entry_info(func_id))
    }

    /// Return a snapshot of the entry of function `func_id`.
    pub fn entry_snapshot(&self, bus_id: BusId, func_id: FuncId) -> Result<EntryInfo> {
        self.with_pool(bus_id, |pool| pool.entry_snapshot(func_id))
    }

    /// Return snapshots of all entries of `bus_id`, sorted by function id.
    pub fn list_entries(&self, bus_id: BusId) -> Result<Vec<EntryInfo>> {
        self.with_pool(bus_id, |pool| Ok(pool.list_entries()))
    }

    /// Return the accounting summary of the pool of `bus_id`.
    pub fn pool_info(&self, bus_id: BusId) -> Result<PoolInfo> {
        self.with_pool(bus_id, |pool| Ok(pool.info()))
    }

    /// Resize the queue range of `func_id` to `qmax` queues and return the new qbase.
    ///
    /// See [`ResourcePool::resize`].
    pub fn resize(&self, bus_id: BusId, func_id: FuncId, qmax: u32) -> Result<QueueId> {
        self.with_pool(bus_id, |pool| pool.resize(func_id, qmax))
    }

    /// Check whether the hardware queue `hw_qid` belongs to `func_id` on `bus_id`.
    ///
    /// Unknown buses and functions own no queues.
    pub fn is_queue_in_range(
        &self,
        bus_id: BusId,
        func_id: FuncId,
        hw_qid: QueueId,
    ) -> QueueRangeCheck {
        self.with_pool(bus_id, |pool| Ok(pool.is_queue_in_range(func_id, hw_qid)))
            .unwrap_or(QueueRangeCheck::OutOfRange)
    }

    /// Account for a started queue of `func_id`, returning the new active count.
    pub fn increment_active(&self, bus_id: BusId, func_id: FuncId) -> Result<u32> {
        self.with_pool(bus_id, |pool| pool.increment_active(func_id))
    }

    /// Account for a stopped queue of `func_id`, returning the new active count.
    pub fn decrement_active(&self, bus_id: BusId, func_id: FuncId) -> Result<u32> {
        self.with_pool(bus_id, |pool| pool.decrement_active(func_id))
    }

    /// Return the number of active queues on `bus_id`, or 0 for an unknown bus.
    pub fn total_active_queues(&self, bus_id: BusId) -> u32 {
        self.with_pool(bus_id, |pool| Ok(pool.total_active_queues()))
            .unwrap_or(0)
    }

    /// Return the number of active queues of `func_id`, or 0 if it's unknown.
    pub fn device_active_queues(&self, bus_id: BusId, func_id: FuncId) -> u32 {
        self.with_pool(bus_id, |pool| Ok(pool.device_active_queues(func_id)))
            .unwrap_or(0)
    }

    fn pool(&self, bus_id: BusId) -> Result<PoolHandle> {
        self.read_pools()
            .get(&bus_id)
            .cloned()
            .ok_or(Error::PoolNotFound(bus_id))
    }

    // The registry lock is released before the pool lock is taken.
    fn with_pool<T, F>(&self, bus_id: BusId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ResourcePool) -> pool::Result<T>,
    {
        let handle = self.pool(bus_id)?;
        let mut pool = lock_pool(&handle);
        f(&mut *pool).map_err(|source| Error::Pool {
            bus: bus_id,
            source,
        })
    }

    fn read_pools(&self) -> RwLockReadGuard<'_, HashMap<BusId, PoolHandle>> {
        self.pools.read().unwrap_or_else(|poisoned| {
            warn!("queue pool registry lock poisoned");
            poisoned.into_inner()
        })
    }

    fn write_pools(&self) -> RwLockWriteGuard<'_, HashMap<BusId, PoolHandle>> {
        self.pools.write().unwrap_or_else(|poisoned| {
            warn!("queue pool registry lock poisoned");
            poisoned.into_inner()
        })
    }
}

// Pool operations never leave a half-applied change behind, so the state behind a
// poisoned lock is still consistent.
fn lock_pool(pool: &Mutex<ResourcePool>) -> MutexGuard<'_, ResourcePool> {
    pool.lock().unwrap_or_else(|poisoned| {
        warn!("queue pool lock poisoned");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error as StdError;
    use std::thread;

    use matches::assert_matches;

    use crate::entry::EntryState;
    use crate::pool::AllocPolicy;

    const BUS: BusId = 0x3b;
    const OTHER_BUS: BusId = 0x5e;

    #[test]
    fn test_pool_lifecycle() {
        let dir = ResourceDirectory::new();
        assert!(dir.is_empty());

        assert!(dir.create_pool(BUS, 0, 8).is_ok());
        assert_eq!(dir.create_pool(BUS, 0, 8), Err(Error::PoolAlreadyExists(BUS)));
        assert!(dir.create_pool(OTHER_BUS, 0, 8).is_ok());
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.bus_ids(), vec![BUS, OTHER_BUS]);
        assert!(dir.contains_pool(BUS));

        assert!(dir.destroy_pool(BUS).is_ok());
        assert_eq!(dir.destroy_pool(BUS), Err(Error::PoolNotFound(BUS)));
        assert!(!dir.contains_pool(BUS));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_invalid_pool() {
        let dir = ResourceDirectory::new();
        assert_eq!(
            dir.create_pool(BUS, std::u32::MAX - 1, 3),
            Err(Error::Pool {
                bus: BUS,
                source: pool::Error::InvalidPool {
                    q_base: std::u32::MAX - 1,
                    total_q: 3
                }
            })
        );
        assert!(!dir.contains_pool(BUS));
    }

    #[test]
    fn test_empty_pool() {
        let dir = ResourceDirectory::new();
        dir.create_pool(0x10, 0, 0).unwrap();
        assert!(dir.contains_pool(0x10));

        dir.create_entry(0x10, 0).unwrap();
        let err = dir.resize(0x10, 0, 4).unwrap_err();
        assert_eq!(
            err.pool_error(),
            Some(&pool::Error::NotEnoughSpace {
                func: 0,
                requested: 4
            })
        );
        assert_eq!(err.errno(), libc::ENOSPC);
        assert_eq!(dir.resize(0x10, 0, 0), Ok(0));
        assert_eq!(dir.get_entry_info(0x10, 0), Ok((0, 0)));

        let info = dir.pool_info(0x10).unwrap();
        assert_eq!((info.total_q, info.allocated, info.free), (0, 0, 0));
        assert_eq!(info.entries, 1);
        dir.destroy_pool(0x10).unwrap();
    }

    #[test]
    fn test_missing_pool() {
        let dir = ResourceDirectory::new();

        assert_eq!(dir.create_entry(BUS, 0), Err(Error::PoolNotFound(BUS)));
        assert_eq!(dir.destroy_entry(BUS, 0), Err(Error::PoolNotFound(BUS)));
        assert_eq!(dir.get_entry_info(BUS, 0), Err(Error::PoolNotFound(BUS)));
        assert_eq!(dir.resize(BUS, 0, 1), Err(Error::PoolNotFound(BUS)));
        assert_eq!(dir.increment_active(BUS, 0), Err(Error::PoolNotFound(BUS)));
        assert_eq!(dir.decrement_active(BUS, 0), Err(Error::PoolNotFound(BUS)));
        assert_matches!(dir.pool_info(BUS), Err(Error::PoolNotFound(_)));
        assert_eq!(
            dir.is_queue_in_range(BUS, 0, 0),
            QueueRangeCheck::OutOfRange
        );
        assert_eq!(dir.total_active_queues(BUS), 0);
        assert_eq!(dir.device_active_queues(BUS, 0), 0);
    }

    #[test]
    fn test_entry_lifecycle() {
        let dir = ResourceDirectory::new();
        dir.create_pool(BUS, 0, 16).unwrap();

        assert!(dir.create_entry(BUS, 0).is_ok());
        assert!(dir
            .create_entry_with_type(BUS, 1, DeviceType::Virtual)
            .is_ok());
        assert_eq!(
            dir.create_entry(BUS, 1),
            Err(Error::Pool {
                bus: BUS,
                source: pool::Error::EntryAlreadyExists(1)
            })
        );

        let info = dir.entry_snapshot(BUS, 1).unwrap();
        assert_eq!(info.device_type, DeviceType::Virtual);
        assert_eq!(info.state(), EntryState::Unassigned);
        assert_eq!(dir.get_entry_info(BUS, 0), Ok((0, 0)));

        assert_eq!(dir.resize(BUS, 1, 4), Ok(0));
        assert!(dir.destroy_entry(BUS, 1).is_ok());
        assert_matches!(
            dir.destroy_entry(BUS, 1),
            Err(Error::Pool {
                source: pool::Error::EntryNotFound(1),
                ..
            })
        );
        assert_eq!(dir.pool_info(BUS).unwrap().allocated, 0);
    }

    #[test]
    fn test_worked_example() {
        let dir = ResourceDirectory::new();
        dir.create_pool(BUS, 0, 8).unwrap();
        dir.create_entry(BUS, 0xa).unwrap();
        dir.create_entry(BUS, 0xb).unwrap();

        assert_eq!(dir.resize(BUS, 0xa, 5), Ok(0));
        assert_matches!(
            dir.resize(BUS, 0xb, 4),
            Err(Error::Pool {
                source: pool::Error::NotEnoughSpace { requested: 4, .. },
                ..
            })
        );
        assert_eq!(dir.resize(BUS, 0xb, 3), Ok(5));
        dir.destroy_entry(BUS, 0xa).unwrap();
        assert_eq!(dir.resize(BUS, 0xb, 6), Ok(0));
        assert_eq!(dir.get_entry_info(BUS, 0xb), Ok((0, 6)));
    }

    #[test]
    fn test_queue_in_range() {
        let dir = ResourceDirectory::new();
        dir.create_pool(BUS, 128, 64).unwrap();
        dir.create_entry(BUS, 0).unwrap();
        dir.create_entry(BUS, 1).unwrap();
        assert_eq!(dir.resize(BUS, 0, 16), Ok(128));
        assert_eq!(dir.resize(BUS, 1, 16), Ok(144));

        for qid in 120..200 {
            let expected = if (128..144).contains(&qid) {
                QueueRangeCheck::InRange
            } else {
                QueueRangeCheck::OutOfRange
            };
            assert_eq!(dir.is_queue_in_range(BUS, 0, qid), expected, "qid {}", qid);
        }
        assert_eq!(dir.is_queue_in_range(BUS, 1, 130), QueueRangeCheck::OutOfRange);
        assert_eq!(dir.is_queue_in_range(BUS, 2, 130), QueueRangeCheck::OutOfRange);
        assert_eq!(
            dir.is_queue_in_range(OTHER_BUS, 0, 130),
            QueueRangeCheck::OutOfRange
        );
    }

    #[test]
    fn test_active_queues() {
        let dir = ResourceDirectory::new();
        dir.create_pool(BUS, 0, 16).unwrap();
        dir.create_entry(BUS, 0).unwrap();
        dir.create_entry(BUS, 1).unwrap();
        dir.resize(BUS, 0, 2).unwrap();
        dir.resize(BUS, 1, 4).unwrap();

        assert_eq!(dir.increment_active(BUS, 0), Ok(1));
        assert_eq!(dir.increment_active(BUS, 0), Ok(2));
        assert_matches!(
            dir.increment_active(BUS, 0),
            Err(Error::Pool {
                source: pool::Error::CounterBounds { .. },
                ..
            })
        );
        assert_eq!(dir.increment_active(BUS, 1), Ok(1));
        assert_eq!(dir.total_active_queues(BUS), 3);
        assert_eq!(dir.device_active_queues(BUS, 0), 2);
        assert_eq!(dir.device_active_queues(BUS, 7), 0);

        assert_matches!(
            dir.resize(BUS, 1, 1),
            Err(Error::Pool {
                source: pool::Error::Frozen { active: 1, .. },
                ..
            })
        );
        assert_eq!(dir.get_entry_info(BUS, 1), Ok((2, 4)));

        assert_eq!(dir.decrement_active(BUS, 1), Ok(0));
        assert_matches!(
            dir.decrement_active(BUS, 1),
            Err(Error::Pool {
                source: pool::Error::CounterBounds { .. },
                ..
            })
        );
        assert_eq!(dir.resize(BUS, 1, 1), Ok(2));
    }

    #[test]
    fn test_forced_destroy_and_recreate() {
        let dir = ResourceDirectory::new();
        dir.create_pool(BUS, 0, 8).unwrap();
        dir.create_entry(BUS, 0).unwrap();
        dir.resize(BUS, 0, 8).unwrap();
        dir.increment_active(BUS, 0).unwrap();

        assert!(dir.destroy_pool(BUS).is_ok());
        assert!(dir.create_pool(BUS, 0, 8).is_ok());

        let info = dir.pool_info(BUS).unwrap();
        assert_eq!(info.entries, 0);
        assert_eq!(info.allocated, 0);
        assert_eq!(info.free, 8);
        assert_eq!(dir.total_active_queues(BUS), 0);
        assert_matches!(
            dir.get_entry_info(BUS, 0),
            Err(Error::Pool {
                source: pool::Error::EntryNotFound(0),
                ..
            })
        );
    }

    #[test]
    fn test_pool_config() {
        let dir = ResourceDirectory::new();
        let config = PoolConfig::new(0, 32).with_policy(AllocPolicy::BestMatch);
        dir.create_pool_with_config(BUS, config).unwrap();

        let info = dir.pool_info(BUS).unwrap();
        assert_eq!(info.policy, AllocPolicy::BestMatch);
        assert_eq!(info.total_q, 32);
    }

    #[test]
    fn test_list_entries() {
        let dir = ResourceDirectory::new();
        dir.create_pool(BUS, 0, 32).unwrap();
        for func in (0..4).rev() {
            dir.create_entry(BUS, func).unwrap();
            dir.resize(BUS, func, func + 1).unwrap();
        }

        let list = dir.list_entries(BUS).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(
            list.iter().map(|info| info.qmax).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_matches!(dir.list_entries(OTHER_BUS), Err(Error::PoolNotFound(_)));
    }

    #[test]
    fn test_concurrent_access() {
        let dir = Arc::new(ResourceDirectory::new());
        dir.create_pool(BUS, 0, 256).unwrap();
        dir.create_pool(OTHER_BUS, 0, 256).unwrap();

        let handles: Vec<_> = (0..8u32)
            .map(|func| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let bus = if func % 2 == 0 { BUS } else { OTHER_BUS };
                    dir.create_entry(bus, func).unwrap();
                    for round in 0..50 {
                        let qmax = 1 + (func + round) % 16;
                        let qbase = dir.resize(bus, func, qmax).unwrap();
                        assert_eq!(dir.get_entry_info(bus, func), Ok((qbase, qmax)));
                        assert_eq!(
                            dir.is_queue_in_range(bus, func, qbase + qmax - 1),
                            QueueRangeCheck::InRange
                        );
                        dir.increment_active(bus, func).unwrap();
                        dir.decrement_active(bus, func).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for bus in &[BUS, OTHER_BUS] {
            let list = dir.list_entries(*bus).unwrap();
            let owned: u32 = list.iter().map(|info| info.qmax).sum();
            assert_eq!(dir.pool_info(*bus).unwrap().allocated, owned);
            assert_eq!(dir.total_active_queues(*bus), 0);
        }
    }

    #[test]
    fn test_error_code() {
        let err = Error::Pool {
            bus: BUS,
            source: pool::Error::EntryNotFound(3),
        };
        assert!(err.source().is_some());
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(err.pool_error(), Some(&pool::Error::EntryNotFound(3)));
        assert_eq!(
            format!("{}", err),
            "bus 0x3b: device entry for function 3 does not exist"
        );

        let err = Error::PoolAlreadyExists(BUS);
        assert!(err.source().is_none());
        assert_eq!(err.pool_error(), None);
        let errno: vmm_sys_util::errno::Error = err.into();
        assert_eq!(errno.errno(), libc::EEXIST);

        let err: std::io::Error = Error::PoolNotFound(BUS).into();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}

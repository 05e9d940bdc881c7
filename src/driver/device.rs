//! Per-device state

use super::file::{FileId, FilePrivate};
use crate::alloc::{AllocTracker, Allocation};
use crate::error::{DriverError, DriverResult};
use crate::idr::{Handle, HandleTable};
use serde::{Deserialize, Serialize};
use std::mem;

/// Memory pool an object was allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    /// Framebuffer heap
    Fb,
    /// General GPU memory heap
    Mem,
}

/// GPU-visible object registered in the device handle table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaliObject {
    /// Client that allocated the object
    pub owner: FileId,
    /// Pool the object lives in
    pub pool: Pool,
    /// Size in bytes
    pub size: u64,
}

/// Driver-private part of a DRM device
#[derive(Debug)]
pub struct DevicePrivate {
    chipset: u64,
    objects: HandleTable<MaliObject>,
    _alloc: Allocation,
}

impl DevicePrivate {
    /// Allocate the structure with an empty handle table
    pub fn new(alloc: &AllocTracker, chipset: u64) -> DriverResult<Self> {
        let _alloc = alloc.allocate("dev_priv", mem::size_of::<Self>())?;
        Ok(Self {
            chipset,
            objects: HandleTable::new(),
            _alloc,
        })
    }

    /// Chipset identifier passed to load
    pub fn chipset(&self) -> u64 {
        self.chipset
    }

    /// Object handle table
    pub fn objects(&self) -> &HandleTable<MaliObject> {
        &self.objects
    }

    /// Register an object owned by `file`
    pub fn insert_object(&mut self, file: &mut FilePrivate, pool: Pool, size: u64) -> DriverResult<Handle> {
        let handle = self.objects.alloc(MaliObject {
            owner: file.id(),
            pool,
            size,
        })?;
        file.track(handle);
        Ok(handle)
    }

    /// Unregister an object; only its owner may do so
    pub fn remove_object(&mut self, file: &mut FilePrivate, handle: Handle) -> DriverResult<MaliObject> {
        if !file.untrack(handle) {
            return Err(DriverError::InvalidArgument(format!(
                "handle {} not owned by {}",
                handle,
                file.id()
            )));
        }
        self.objects
            .remove(handle)
            .ok_or_else(|| DriverError::InvalidArgument(format!("stale handle {}", handle)))
    }

    /// Unregister every object `file` still owns
    pub fn reclaim(&mut self, file: &mut FilePrivate) -> Vec<MaliObject> {
        file.take_objects()
            .into_iter()
            .filter_map(|handle| self.objects.remove(handle))
            .collect()
    }
}

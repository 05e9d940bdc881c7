//! Per-client state

use crate::alloc::{AllocTracker, Allocation};
use crate::error::DriverResult;
use crate::idr::Handle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;

/// Identifier of an open file on a DRM device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Driver-private part of an open file
///
/// Holds the handles of the objects this client allocated, so they can be
/// reclaimed when it closes.
#[derive(Debug)]
pub struct FilePrivate {
    id: FileId,
    obj_list: Vec<Handle>,
    _alloc: Allocation,
}

impl FilePrivate {
    /// Allocate the structure for file `id`, with an empty object list
    pub fn new(alloc: &AllocTracker, id: FileId) -> DriverResult<Self> {
        let _alloc = alloc.allocate("file_priv", mem::size_of::<Self>())?;
        Ok(Self {
            id,
            obj_list: Vec::new(),
            _alloc,
        })
    }

    /// File this structure belongs to
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Handles of the objects owned by this client
    pub fn objects(&self) -> &[Handle] {
        &self.obj_list
    }

    /// Whether this client owns `handle`
    pub fn owns(&self, handle: Handle) -> bool {
        self.obj_list.contains(&handle)
    }

    pub(crate) fn track(&mut self, handle: Handle) {
        self.obj_list.push(handle);
    }

    pub(crate) fn untrack(&mut self, handle: Handle) -> bool {
        match self.obj_list.iter().position(|h| *h == handle) {
            Some(pos) => {
                self.obj_list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_objects(&mut self) -> Vec<Handle> {
        mem::take(&mut self.obj_list)
    }
}

/// An open file on a DRM device, as tracked by the DRM core
#[derive(Debug)]
pub struct DrmFile<F> {
    /// File identifier
    pub id: FileId,
    /// Whether this file is the DRM master
    pub is_master: bool,
    /// Whether this file passed authentication
    pub authenticated: bool,
    /// Whether the opener was privileged
    pub privileged: bool,
    /// Driver-private part
    pub private: F,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FailPolicy;

    #[test]
    fn test_new_file_has_empty_object_list() {
        let tracker = AllocTracker::new();
        let file = FilePrivate::new(&tracker, FileId(3)).unwrap();
        assert!(file.objects().is_empty());
        assert_eq!(file.id(), FileId(3));
        assert_eq!(tracker.live_tags(), vec!["file_priv"]);
        drop(file);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let tracker = AllocTracker::with_policy(FailPolicy::Always);
        let err = FilePrivate::new(&tracker, FileId(0)).unwrap_err();
        assert_eq!(err.to_errno(), -libc::ENOMEM);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_track_untrack() {
        let tracker = AllocTracker::new();
        let mut file = FilePrivate::new(&tracker, FileId(0)).unwrap();
        file.track(Handle::from_raw(1));
        file.track(Handle::from_raw(2));
        assert!(file.owns(Handle::from_raw(2)));
        assert!(file.untrack(Handle::from_raw(1)));
        assert!(!file.untrack(Handle::from_raw(1)));
        assert_eq!(file.take_objects(), vec![Handle::from_raw(2)]);
        assert!(file.objects().is_empty());
    }
}

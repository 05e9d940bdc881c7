//! Typed handle table
//!
//! Maps small integer handles to owned objects, the way the kernel `idr`
//! hands out handles for GPU-visible objects.
//!
//! Reuse policy: [`HandleTable::alloc`] always returns the lowest free handle
//! in the table's range. A removed handle therefore becomes the next one to be
//! handed out. Handle `0` is never used so user space can treat it as "none".

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Raw handle value, as passed to user space
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from a value received from user space
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle allocation table
#[derive(Debug, Clone)]
pub struct HandleTable<T> {
    entries: BTreeMap<u32, T>,
    // Handles below `next` that are not in `entries`.
    free: BTreeSet<u32>,
    next: u32,
    min: u32,
    max: u32,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    /// Empty table handing out handles in `1..=u32::MAX`
    pub fn new() -> Self {
        Self::with_range(1, u32::MAX)
    }

    /// Empty table handing out handles in `min..=max`
    ///
    /// A `min` of 0 is raised to 1.
    pub fn with_range(min: u32, max: u32) -> Self {
        let min = min.max(1);
        Self {
            entries: BTreeMap::new(),
            free: BTreeSet::new(),
            next: min,
            min,
            max,
        }
    }

    /// Store `value` under the lowest free handle
    pub fn alloc(&mut self, value: T) -> DriverResult<Handle> {
        let raw = match self.free.pop_first() {
            Some(raw) => raw,
            None => {
                if self.next > self.max || self.next < self.min {
                    return Err(DriverError::NoSpace {
                        min: self.min,
                        max: self.max,
                    });
                }
                let raw = self.next;
                // `next` wraps to 0 past u32::MAX, which the range check above rejects.
                self.next = self.next.wrapping_add(1);
                raw
            }
        };
        self.entries.insert(raw, value);
        Ok(Handle(raw))
    }

    /// Object stored under `handle`
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.entries.get(&handle.0)
    }

    /// Mutable access to the object stored under `handle`
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.entries.get_mut(&handle.0)
    }

    /// Remove and return the object stored under `handle`
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let value = self.entries.remove(&handle.0)?;
        if handle.0.wrapping_add(1) == self.next {
            // Shrink the high-water mark instead of growing the free set.
            self.next = handle.0;
            while let Some(&last) = self.free.last() {
                if last.wrapping_add(1) != self.next {
                    break;
                }
                self.free.pop_last();
                self.next = last;
            }
        } else {
            self.free.insert(handle.0);
        }
        Some(value)
    }

    /// Whether `handle` is currently allocated
    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    /// Number of allocated handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handle is allocated
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocated handles and their objects, in handle order
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.entries.iter().map(|(raw, value)| (Handle(*raw), value))
    }

    /// Remove every entry for which `keep` returns false
    pub fn retain(&mut self, mut keep: impl FnMut(Handle, &T) -> bool) -> Vec<T> {
        let doomed: Vec<Handle> = self
            .iter()
            .filter(|(handle, value)| !keep(*handle, *value))
            .map(|(handle, _)| handle)
            .collect();
        doomed
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handles_start_at_one() {
        let mut table = HandleTable::new();
        assert_eq!(table.alloc("a").unwrap().raw(), 1);
        assert_eq!(table.alloc("b").unwrap().raw(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lowest_free_handle_is_reused() {
        let mut table = HandleTable::new();
        let handles: Vec<Handle> = (0..5).map(|i| table.alloc(i).unwrap()).collect();

        assert_eq!(table.remove(handles[3]), Some(3));
        assert_eq!(table.remove(handles[1]), Some(1));

        assert_eq!(table.alloc(10).unwrap().raw(), 2);
        assert_eq!(table.alloc(11).unwrap().raw(), 4);
        assert_eq!(table.alloc(12).unwrap().raw(), 6);
    }

    #[test]
    fn test_removing_top_handles_shrinks_range() {
        let mut table = HandleTable::new();
        let a = table.alloc('a').unwrap();
        let b = table.alloc('b').unwrap();
        let c = table.alloc('c').unwrap();

        table.remove(b);
        table.remove(c);
        assert!(table.contains(a));
        assert_eq!(table.alloc('d').unwrap().raw(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut table = HandleTable::with_range(0, 2);
        table.alloc(()).unwrap();
        table.alloc(()).unwrap();
        let err = table.alloc(()).unwrap_err();
        assert_eq!(err.to_errno(), -libc::ENOSPC);
    }

    #[test]
    fn test_full_u32_range_does_not_wrap_to_zero() {
        let mut table = HandleTable::with_range(u32::MAX, u32::MAX);
        assert_eq!(table.alloc(1).unwrap().raw(), u32::MAX);
        assert!(table.alloc(2).is_err());
    }

    #[test]
    fn test_remove_unknown_handle() {
        let mut table: HandleTable<u8> = HandleTable::new();
        assert_eq!(table.remove(Handle::from_raw(7)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_retain() {
        let mut table = HandleTable::new();
        for i in 0..6 {
            table.alloc(i).unwrap();
        }
        let removed = table.retain(|_, v| v % 2 == 0);
        assert_eq!(removed, vec![1, 3, 5]);
        let left: Vec<u32> = table.iter().map(|(h, _)| h.raw()).collect();
        assert_eq!(left, vec![1, 3, 5]);
    }
}

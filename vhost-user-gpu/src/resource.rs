// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The table of live GPU resources.

use std::{collections::BTreeMap, io};

use log::{debug, warn};
use thiserror::Error as ThisError;

use crate::{
    mapping::BackingSpans,
    protocol::{GpuResponse, VIRTIO_GPU_MAX_SCANOUTS},
};

/// The scanout slots a resource is displayed on.
///
/// Slots are below `VIRTIO_GPU_MAX_SCANOUTS`, so a 16 bit mask holds them all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssociatedScanouts(u16);

const _: () = assert!(VIRTIO_GPU_MAX_SCANOUTS <= u16::BITS);

impl AssociatedScanouts {
    pub fn insert(&mut self, slot: u32) {
        debug_assert!(slot < VIRTIO_GPU_MAX_SCANOUTS);
        self.0 |= 1 << slot;
    }

    pub fn remove(&mut self, slot: u32) {
        self.0 &= !(1 << slot);
    }

    pub const fn contains(&self, slot: u32) -> bool {
        slot < VIRTIO_GPU_MAX_SCANOUTS && self.0 & (1 << slot) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        let mask = self.0;
        (0..VIRTIO_GPU_MAX_SCANOUTS).filter(move |slot| mask & (1 << slot) != 0)
    }
}

#[derive(Debug, ThisError)]
pub enum ResourceError {
    #[error("resource id 0 is reserved")]
    InvalidId,
    #[error("resource {0} already exists")]
    AlreadyExists(u32),
    #[error("resource {0} does not exist")]
    NotFound(u32),
    #[error("unsupported format {0}")]
    UnsupportedFormat(u32),
    #[error("out of host memory for a {0} byte resource")]
    OutOfMemory(u64),
    #[error("failed to allocate resource storage: {0}")]
    Allocation(io::Error),
}

impl From<ResourceError> for GpuResponse {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::InvalidId | ResourceError::AlreadyExists(_) | ResourceError::NotFound(_) => {
                Self::ErrInvalidResourceId
            }
            ResourceError::UnsupportedFormat(_) => Self::ErrInvalidParameter,
            ResourceError::OutOfMemory(_) | ResourceError::Allocation(_) => Self::ErrOutOfMemory,
        }
    }
}

/// A guest visible surface and its host side storage `S`.
#[derive(Debug)]
pub struct Resource<S> {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    /// Host memory charged against the table budget.
    pub hostmem: u64,
    pub backing: Option<BackingSpans>,
    pub scanouts: AssociatedScanouts,
    pub storage: S,
}

/// Live resources keyed by their guest assigned id.
#[derive(Debug)]
pub struct ResourceTable<S> {
    resources: BTreeMap<u32, Resource<S>>,
    hostmem_used: u64,
    max_hostmem: u64,
}

impl<S> ResourceTable<S> {
    pub const fn new(max_hostmem: u64) -> Self {
        Self {
            resources: BTreeMap::new(),
            hostmem_used: 0,
            max_hostmem,
        }
    }

    /// Checks that `id` can name a new resource.
    pub fn check_new_id(&self, id: u32) -> Result<(), ResourceError> {
        if id == 0 {
            return Err(ResourceError::InvalidId);
        }
        if self.resources.contains_key(&id) {
            return Err(ResourceError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Creates a resource whose storage is produced by `alloc`.
    ///
    /// `hostmem` is charged against the budget before `alloc` runs. Nothing is
    /// changed when any step fails.
    pub fn create<F>(
        &mut self,
        id: u32,
        width: u32,
        height: u32,
        format: u32,
        hostmem: u64,
        alloc: F,
    ) -> Result<&mut Resource<S>, ResourceError>
    where
        F: FnOnce() -> io::Result<S>,
    {
        self.check_new_id(id)?;
        let fits = self
            .hostmem_used
            .checked_add(hostmem)
            .is_some_and(|total| total < self.max_hostmem);
        if !fits {
            warn!(
                "Resource {id} needs {hostmem} bytes, {} of {} already in use",
                self.hostmem_used, self.max_hostmem
            );
            return Err(ResourceError::OutOfMemory(hostmem));
        }
        let storage = alloc().map_err(|e| {
            if e.kind() == io::ErrorKind::OutOfMemory {
                ResourceError::OutOfMemory(hostmem)
            } else {
                ResourceError::Allocation(e)
            }
        })?;

        self.hostmem_used += hostmem;
        debug!("Created resource {id} ({width}x{height}, format {format})");
        Ok(self.resources.entry(id).or_insert(Resource {
            id,
            width,
            height,
            format,
            hostmem,
            backing: None,
            scanouts: AssociatedScanouts::default(),
            storage,
        }))
    }

    pub fn get(&self, id: u32) -> Option<&Resource<S>> {
        self.resources.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Resource<S>> {
        self.resources.get_mut(&id)
    }

    pub fn lookup_mut(&mut self, id: u32) -> Result<&mut Resource<S>, ResourceError> {
        self.resources
            .get_mut(&id)
            .ok_or(ResourceError::NotFound(id))
    }

    /// Removes the entry and returns its memory to the budget. Scanouts and
    /// backing must have been dealt with by the caller.
    pub fn remove(&mut self, id: u32) -> Option<Resource<S>> {
        let resource = self.resources.remove(&id)?;
        self.hostmem_used -= resource.hostmem;
        debug!("Removed resource {id}");
        Some(resource)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.resources.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub const fn hostmem_used(&self) -> u64 {
        self.hostmem_used
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn create(table: &mut ResourceTable<Vec<u8>>, id: u32, hostmem: u64) -> Result<(), ResourceError> {
        table
            .create(id, 64, 64, 1, hostmem, || Ok(vec![0; hostmem as usize]))
            .map(|_| ())
    }

    #[test]
    fn test_associated_scanouts() {
        let mut scanouts = AssociatedScanouts::default();
        assert!(scanouts.is_empty());
        scanouts.insert(3);
        scanouts.insert(0);
        scanouts.insert(15);
        assert!(scanouts.contains(3));
        assert!(!scanouts.contains(1));
        assert!(!scanouts.contains(16));
        assert_eq!(scanouts.iter().collect::<Vec<_>>(), [0, 3, 15]);
        scanouts.remove(3);
        assert_eq!(scanouts.iter().collect::<Vec<_>>(), [0, 15]);
    }

    #[test]
    fn test_resource_id_lifecycle() {
        let mut table = ResourceTable::new(1 << 20);
        assert_matches!(create(&mut table, 0, 16), Err(ResourceError::InvalidId));
        create(&mut table, 7, 16384).unwrap();
        assert_matches!(create(&mut table, 7, 16384), Err(ResourceError::AlreadyExists(7)));
        assert_eq!(table.len(), 1);

        assert!(table.remove(7).is_some());
        assert!(table.is_empty());
        assert!(table.remove(7).is_none());
        assert_matches!(table.lookup_mut(7), Err(ResourceError::NotFound(7)));
    }

    #[test]
    fn test_hostmem_budget() {
        let mut table = ResourceTable::new(1000);
        create(&mut table, 1, 600).unwrap();
        assert_matches!(create(&mut table, 2, 400), Err(ResourceError::OutOfMemory(400)));
        create(&mut table, 2, 399).unwrap();
        assert_eq!(table.hostmem_used(), 999);

        table.remove(1);
        assert_eq!(table.hostmem_used(), 399);
        create(&mut table, 3, 600).unwrap();
    }

    #[test]
    fn test_failed_allocation_leaves_table_untouched() {
        let mut table: ResourceTable<Vec<u8>> = ResourceTable::new(1 << 20);
        let res = table.create(5, 1, 1, 1, 4, || Err(io::ErrorKind::OutOfMemory.into()));
        assert_matches!(res, Err(ResourceError::OutOfMemory(4)));
        assert!(table.get(5).is_none());
        assert_eq!(table.hostmem_used(), 0);
    }

    #[test]
    fn test_error_responses() {
        assert_matches!(
            GpuResponse::from(ResourceError::AlreadyExists(1)),
            GpuResponse::ErrInvalidResourceId
        );
        assert_matches!(
            GpuResponse::from(ResourceError::UnsupportedFormat(9)),
            GpuResponse::ErrInvalidParameter
        );
        assert_matches!(
            GpuResponse::from(ResourceError::OutOfMemory(1)),
            GpuResponse::ErrOutOfMemory
        );
    }
}

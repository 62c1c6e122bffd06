// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Display output slots and the resources bound to them.

use thiserror::Error as ThisError;

use crate::{
    gpu_types::Rect,
    protocol::GpuResponse,
    resource::ResourceTable,
};

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ScanoutError {
    #[error("scanout {0} does not exist")]
    InvalidScanoutId(u32),
    #[error("resource {0} does not exist")]
    InvalidResourceId(u32),
    #[error("rectangle {rect:?} is outside of the {width}x{height} resource")]
    InvalidParameter { rect: Rect, width: u32, height: u32 },
}

impl From<ScanoutError> for GpuResponse {
    fn from(e: ScanoutError) -> Self {
        match e {
            ScanoutError::InvalidScanoutId(_) => Self::ErrInvalidScanoutId,
            ScanoutError::InvalidResourceId(_) => Self::ErrInvalidResourceId,
            ScanoutError::InvalidParameter { .. } => Self::ErrInvalidParameter,
        }
    }
}

/// One display output. `resource_id == 0` means disabled, in which case the
/// rectangle is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Scanout {
    pub resource_id: u32,
    pub rect: Rect,
}

impl Scanout {
    pub const fn is_enabled(&self) -> bool {
        self.resource_id != 0
    }
}

#[derive(Debug)]
pub struct ScanoutTable {
    slots: Vec<Scanout>,
}

impl ScanoutTable {
    pub fn new(max_scanouts: u32) -> Self {
        Self {
            slots: vec![Scanout::default(); max_scanouts as usize],
        }
    }

    pub fn max_scanouts(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn get(&self, slot: u32) -> Option<&Scanout> {
        self.slots.get(slot as usize)
    }

    pub fn check_slot(&self, slot: u32) -> Result<(), ScanoutError> {
        if slot < self.max_scanouts() {
            Ok(())
        } else {
            Err(ScanoutError::InvalidScanoutId(slot))
        }
    }

    /// Shows `rect` of `resource_id` on `slot`.
    ///
    /// On error neither the slot nor any resource is changed.
    pub fn bind<S>(
        &mut self,
        slot: u32,
        resources: &mut ResourceTable<S>,
        resource_id: u32,
        rect: Rect,
    ) -> Result<(), ScanoutError> {
        self.check_slot(slot)?;
        let resource = resources
            .get(resource_id)
            .ok_or(ScanoutError::InvalidResourceId(resource_id))?;
        if !rect.within(resource.width, resource.height) {
            return Err(ScanoutError::InvalidParameter {
                rect,
                width: resource.width,
                height: resource.height,
            });
        }

        let previous = self.slots[slot as usize].resource_id;
        if let Some(old) = resources.get_mut(previous) {
            old.scanouts.remove(slot);
        }
        if let Some(new) = resources.get_mut(resource_id) {
            new.scanouts.insert(slot);
        }
        self.slots[slot as usize] = Scanout { resource_id, rect };
        Ok(())
    }

    /// Unbinds whatever `slot` shows. Out of range slots are ignored.
    pub fn disable<S>(&mut self, slot: u32, resources: &mut ResourceTable<S>) {
        let Some(scanout) = self.slots.get_mut(slot as usize) else {
            return;
        };
        if let Some(resource) = resources.get_mut(scanout.resource_id) {
            resource.scanouts.remove(slot);
        }
        *scanout = Scanout::default();
    }

    /// Slots currently showing `resource_id`, ascending.
    pub fn slots_showing(&self, resource_id: u32) -> impl Iterator<Item = (u32, &Scanout)> {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.is_enabled() && s.resource_id == resource_id)
            .map(|(i, s)| (i as u32, s))
    }

    pub fn reset(&mut self) {
        self.slots.fill(Scanout::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(ids: &[u32]) -> ResourceTable<()> {
        let mut table = ResourceTable::new(u64::MAX);
        for &id in ids {
            table.create(id, 64, 64, 1, 0, || Ok(())).unwrap();
        }
        table
    }

    #[test]
    fn test_bind_and_rebind() {
        let mut resources = table_with(&[7, 8]);
        let mut scanouts = ScanoutTable::new(2);

        scanouts
            .bind(0, &mut resources, 7, Rect::new(0, 0, 64, 64))
            .unwrap();
        assert!(resources.get(7).unwrap().scanouts.contains(0));

        scanouts
            .bind(0, &mut resources, 8, Rect::new(0, 0, 32, 32))
            .unwrap();
        assert!(resources.get(7).unwrap().scanouts.is_empty());
        assert!(resources.get(8).unwrap().scanouts.contains(0));
        assert_eq!(
            scanouts.get(0),
            Some(&Scanout {
                resource_id: 8,
                rect: Rect::new(0, 0, 32, 32)
            })
        );
    }

    #[test]
    fn test_bind_out_of_bounds_keeps_state() {
        let mut resources = table_with(&[7]);
        let mut scanouts = ScanoutTable::new(16);
        let good = Rect::new(0, 0, 64, 64);
        scanouts.bind(0, &mut resources, 7, good).unwrap();

        assert_eq!(
            scanouts.bind(0, &mut resources, 7, Rect::new(0, 0, 100, 64)),
            Err(ScanoutError::InvalidParameter {
                rect: Rect::new(0, 0, 100, 64),
                width: 64,
                height: 64
            })
        );
        assert_eq!(scanouts.get(0).unwrap().rect, good);
        assert!(resources.get(7).unwrap().scanouts.contains(0));
    }

    #[test]
    fn test_bind_errors() {
        let mut resources = table_with(&[7]);
        let mut scanouts = ScanoutTable::new(1);
        let rect = Rect::new(0, 0, 1, 1);
        assert_eq!(
            scanouts.bind(1, &mut resources, 7, rect),
            Err(ScanoutError::InvalidScanoutId(1))
        );
        assert_eq!(
            scanouts.bind(0, &mut resources, 9, rect),
            Err(ScanoutError::InvalidResourceId(9))
        );
    }

    #[test]
    fn test_disable_and_reset() {
        let mut resources = table_with(&[7]);
        let mut scanouts = ScanoutTable::new(4);
        let rect = Rect::new(0, 0, 64, 64);
        scanouts.bind(1, &mut resources, 7, rect).unwrap();
        scanouts.bind(3, &mut resources, 7, rect).unwrap();
        assert_eq!(
            scanouts.slots_showing(7).map(|(i, _)| i).collect::<Vec<_>>(),
            [1, 3]
        );

        scanouts.disable(1, &mut resources);
        assert!(!scanouts.get(1).unwrap().is_enabled());
        assert_eq!(scanouts.get(1).unwrap().rect, Rect::default());
        assert_eq!(
            resources.get(7).unwrap().scanouts.iter().collect::<Vec<_>>(),
            [3]
        );

        scanouts.reset();
        assert_eq!(scanouts.slots_showing(7).count(), 0);
    }
}

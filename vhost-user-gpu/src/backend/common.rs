// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Resource, scanout and display bookkeeping shared by all backends.

use std::os::fd::BorrowedFd;

use log::{debug, error, warn};

use crate::{
    display::{
        message::{CursorPos, CursorUpdate, DmabufScanoutMsg, ScanoutMsg, CURSOR_DATA_SIZE},
        FrontendLink,
    },
    gpu_types::Rect,
    image::Image,
    mapping::{self, GuestMapper},
    protocol::{
        virtio_gpu_mem_entry,
        GpuResponse::{ErrInvalidParameter, ErrInvalidResourceId, ErrUnspec, OkDisplayInfo, OkEdid, OkNoData},
        VirtioGpuResult,
    },
    resource::{Resource, ResourceError, ResourceTable},
    scanout::ScanoutTable,
};

/// A shareable view of a resource's pixels.
pub struct ExportedBuffer<'a> {
    pub fd: BorrowedFd<'a>,
    pub stride: u32,
    pub fourcc: u32,
}

/// Host storage of a resource as far as scanouts are concerned.
pub trait ScanoutStorage {
    /// The DMA-buf to hand to the display process, if the storage has one.
    fn export(&self) -> Option<ExportedBuffer<'_>> {
        None
    }
}

impl ScanoutStorage for () {}

impl ScanoutStorage for Image {
    fn export(&self) -> Option<ExportedBuffer<'_>> {
        self.dmabuf().map(|fd| ExportedBuffer {
            fd,
            stride: self.stride(),
            fourcc: self.format().drm_fourcc(),
        })
    }
}

/// Device state every backend keeps: resources with storage `S`, the
/// scanout slots and the display link.
pub struct DisplayState<S> {
    pub resources: ResourceTable<S>,
    pub scanouts: ScanoutTable,
    pub frontend: FrontendLink,
    pub mapper: Box<dyn GuestMapper>,
}

impl<S: ScanoutStorage> DisplayState<S> {
    pub fn new(max_outputs: u32, max_hostmem: u64, mapper: Box<dyn GuestMapper>) -> Self {
        Self {
            resources: ResourceTable::new(max_hostmem),
            scanouts: ScanoutTable::new(max_outputs),
            frontend: FrontendLink::default(),
            mapper,
        }
    }

    /// Asks the display process for its outputs. Without a display, or when
    /// it fails to answer, every output is reported disabled.
    pub fn display_info(&mut self) -> VirtioGpuResult {
        let max = self.scanouts.max_scanouts() as usize;
        let Some(info) = self.frontend.get_display_info() else {
            debug!("No display info available, reporting no outputs");
            return Ok(OkDisplayInfo(Vec::new()));
        };
        let display_info = info
            .pmodes
            .iter()
            .take(max)
            .map(|display| {
                (
                    display.r.width.into(),
                    display.r.height.into(),
                    u32::from(display.enabled) != 0,
                )
            })
            .collect::<Vec<_>>();
        debug!("Displays: {display_info:?}");
        Ok(OkDisplayInfo(display_info))
    }

    pub fn get_edid(&mut self, scanout_id: u32) -> VirtioGpuResult {
        if scanout_id >= self.scanouts.max_scanouts() {
            return Err(ErrInvalidParameter);
        }
        if !self.frontend.supports_edid() {
            debug!("Display does not provide EDID");
            return Err(ErrUnspec);
        }
        let edid = self.frontend.get_edid(scanout_id).ok_or(ErrUnspec)?;
        let size = (u32::from(edid.size) as usize).min(edid.edid.len());
        Ok(OkEdid {
            blob: Box::from(&edid.edid[..size]),
        })
    }

    /// Unbinds `slot` and tells the display, if there is one.
    pub fn disable_scanout(&mut self, slot: u32) {
        self.scanouts.disable(slot, &mut self.resources);
        self.frontend.set_scanout(&ScanoutMsg {
            scanout_id: slot.into(),
            width: 0.into(),
            height: 0.into(),
        });
    }

    pub fn set_scanout(&mut self, slot: u32, resource_id: u32, rect: Rect) -> VirtioGpuResult {
        self.scanouts.check_slot(slot)?;
        if resource_id == 0 {
            debug!("Disabling scanout {slot}");
            self.disable_scanout(slot);
            return Ok(OkNoData);
        }
        self.scanouts
            .bind(slot, &mut self.resources, resource_id, rect)?;

        let resource = self
            .resources
            .get(resource_id)
            .ok_or(ErrInvalidResourceId)?;
        let exported = self
            .frontend
            .supports_dmabuf()
            .then(|| resource.storage.export())
            .flatten();
        match exported {
            Some(buffer) => {
                let msg = DmabufScanoutMsg {
                    scanout_id: slot.into(),
                    x: rect.x.into(),
                    y: rect.y.into(),
                    width: rect.width.into(),
                    height: rect.height.into(),
                    fd_width: resource.width.into(),
                    fd_height: resource.height.into(),
                    fd_stride: buffer.stride.into(),
                    fd_flags: 0.into(),
                    fd_drm_fourcc: buffer.fourcc.into(),
                };
                self.frontend.set_dmabuf_scanout(&msg, buffer.fd);
            }
            None => self.frontend.set_scanout(&ScanoutMsg {
                scanout_id: slot.into(),
                width: rect.width.into(),
                height: rect.height.into(),
            }),
        }
        Ok(OkNoData)
    }

    /// Takes a resource out of the table: its scanouts are disabled in
    /// ascending order, then its backing is released. Dropping the returned
    /// value frees the storage.
    pub fn destroy(&mut self, resource_id: u32) -> Result<Resource<S>, ResourceError> {
        let scanouts = self
            .resources
            .get(resource_id)
            .ok_or(ResourceError::NotFound(resource_id))?
            .scanouts;
        for slot in scanouts.iter() {
            self.disable_scanout(slot);
        }
        let mut resource = self
            .resources
            .remove(resource_id)
            .ok_or(ResourceError::NotFound(resource_id))?;
        if let Some(backing) = resource.backing.take() {
            mapping::release(self.mapper.as_ref(), backing);
        }
        Ok(resource)
    }

    /// Destroys every resource and clears every scanout.
    pub fn reset(&mut self) {
        for id in self.resources.ids() {
            let _ = self.destroy(id);
        }
        self.scanouts.reset();
    }

    pub fn attach_backing(
        &mut self,
        resource_id: u32,
        nr_entries: u32,
        entries: &[virtio_gpu_mem_entry],
    ) -> VirtioGpuResult {
        let resource = self.resources.lookup_mut(resource_id)?;
        if resource.backing.is_some() {
            warn!("Resource {resource_id} already has backing attached");
            return Err(ErrUnspec);
        }
        let spans = mapping::build(self.mapper.as_ref(), nr_entries, entries).map_err(|e| {
            error!("Failed to attach backing to resource {resource_id}: {e}");
            ErrUnspec
        })?;
        resource.backing = Some(spans);
        Ok(OkNoData)
    }

    pub fn detach_backing(&mut self, resource_id: u32) -> VirtioGpuResult {
        let resource = self.resources.lookup_mut(resource_id)?;
        let backing = resource.backing.take().ok_or(ErrInvalidResourceId)?;
        mapping::release(self.mapper.as_ref(), backing);
        Ok(OkNoData)
    }

    pub fn update_cursor(
        &mut self,
        pos: CursorPos,
        hot_x: u32,
        hot_y: u32,
        data: &[u8; CURSOR_DATA_SIZE],
    ) {
        let update = CursorUpdate {
            pos,
            hot_x: hot_x.into(),
            hot_y: hot_y.into(),
        };
        self.frontend.cursor_update(&update, data);
    }

    pub fn move_cursor(&mut self, resource_id: u32, pos: CursorPos) {
        if resource_id == 0 {
            self.frontend.cursor_pos_hide(&pos);
        } else {
            self.frontend.cursor_pos(&pos);
        }
    }
}

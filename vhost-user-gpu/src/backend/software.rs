// Software backend
// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::os::fd::RawFd;

use log::{debug, trace, warn};
use rutabaga_gfx::RutabagaFence;
use vmm_sys_util::eventfd::EventFd;

use crate::{
    backend::common::{DisplayState, ScanoutStorage},
    buffer::BufferAllocator,
    display::{
        message::{CursorPos, UpdateMsg, CURSOR_DATA_SIZE, CURSOR_HEIGHT, CURSOR_WIDTH},
        GpuFrontend,
    },
    gpu_types::{Rect, ResourceCreate3d, Transfer3DDesc},
    image::{Image, PixelFormat},
    mapping::{self, GuestMapper},
    protocol::{
        virtio_gpu_mem_entry,
        GpuResponse::{ErrInvalidParameter, ErrInvalidResourceId, ErrUnspec, OkNoData},
        VirtioGpuResult,
    },
    renderer::Renderer,
    resource::ResourceError,
};

/// Renders 2D resources on the CPU.
///
/// Pixels live in host memory owned by the backend. The guest fills them
/// with transfers from its backing pages and the display process receives
/// them either as pixel updates or through a shared DMA-buf.
pub struct SoftwareGpu {
    state: DisplayState<Image>,
    allocator: Option<Box<dyn BufferAllocator>>,
}

impl SoftwareGpu {
    pub fn new(
        max_outputs: u32,
        max_hostmem: u64,
        mapper: Box<dyn GuestMapper>,
        allocator: Option<Box<dyn BufferAllocator>>,
    ) -> Self {
        trace!("SoftwareGpu created");
        Self {
            state: DisplayState::new(max_outputs, max_hostmem, mapper),
            allocator,
        }
    }

    fn cursor_image(&self, resource_id: u32) -> Box<[u8; CURSOR_DATA_SIZE]> {
        let mut data = Box::new([0; CURSOR_DATA_SIZE]);
        match self.state.resources.get(resource_id) {
            Some(resource)
                if resource.width == CURSOR_WIDTH
                    && resource.height == CURSOR_HEIGHT
                    && resource.storage.format().bpp() == 32 =>
            {
                let image = &resource.storage;
                let row_len = CURSOR_WIDTH as usize * 4;
                let stride = image.stride() as usize;
                for (row, dst) in data.chunks_exact_mut(row_len).enumerate() {
                    let start = row * stride;
                    dst.copy_from_slice(&image.data()[start..start + row_len]);
                }
            }
            _ => debug!("Cursor resource {resource_id} is not a 64x64 image, sending a blank cursor"),
        }
        data
    }
}

impl Renderer for SoftwareGpu {
    fn attach_frontend(&mut self, frontend: Box<dyn GpuFrontend>) {
        self.state.frontend.attach(frontend);
    }

    fn frontend_ack_fd(&self) -> Option<RawFd> {
        self.state.frontend.ack_fd()
    }

    fn process_frontend_ack(&mut self) -> bool {
        self.state.frontend.process_ack()
    }

    fn reset(&mut self) {
        self.state.reset();
    }

    fn force_ctx_0(&self) {}

    fn display_info(&mut self) -> VirtioGpuResult {
        self.state.display_info()
    }

    fn get_edid(&mut self, scanout_id: u32) -> VirtioGpuResult {
        self.state.get_edid(scanout_id)
    }

    fn resource_create_2d(
        &mut self,
        resource_id: u32,
        format: u32,
        width: u32,
        height: u32,
    ) -> VirtioGpuResult {
        self.state.resources.check_new_id(resource_id)?;
        let pixel_format =
            PixelFormat::from_virtio(format).ok_or(ResourceError::UnsupportedFormat(format))?;
        let hostmem = pixel_format.hostmem(width, height);

        let allocator = self.allocator.as_deref();
        self.state
            .resources
            .create(resource_id, width, height, format, hostmem, || {
                let Some(allocator) = allocator else {
                    return Image::new(pixel_format, width, height, None);
                };
                Image::new(pixel_format, width, height, Some(allocator)).or_else(|e| {
                    warn!("Failed to allocate a shared buffer for resource {resource_id}: {e}");
                    Image::new(pixel_format, width, height, None)
                })
            })?;
        Ok(OkNoData)
    }

    fn resource_create_3d(&mut self, _resource_id: u32, _req: ResourceCreate3d) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn unref_resource(&mut self, resource_id: u32) -> VirtioGpuResult {
        self.state.destroy(resource_id)?;
        Ok(OkNoData)
    }

    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, rect: Rect) -> VirtioGpuResult {
        self.state.set_scanout(scanout_id, resource_id, rect)
    }

    fn flush_resource(&mut self, resource_id: u32, rect: Rect) -> VirtioGpuResult {
        let resource = self
            .state
            .resources
            .get(resource_id)
            .ok_or(ErrInvalidResourceId)?;
        if !rect.within(resource.width, resource.height) {
            warn!(
                "Flush {rect:?} is outside of the {}x{} resource {resource_id}",
                resource.width, resource.height
            );
            return Err(ErrInvalidParameter);
        }

        let targets = self
            .state
            .scanouts
            .slots_showing(resource_id)
            .map(|(slot, scanout)| (slot, scanout.rect))
            .collect::<Vec<_>>();
        let shared = self.state.frontend.supports_dmabuf() && resource.storage.export().is_some();

        for (slot, scanout_rect) in targets {
            let damage = rect.intersect(&scanout_rect);
            if damage.is_empty() {
                continue;
            }
            let relative = damage.translate_back(scanout_rect.x, scanout_rect.y);
            let msg = UpdateMsg {
                scanout_id: slot.into(),
                x: relative.x.into(),
                y: relative.y.into(),
                width: relative.width.into(),
                height: relative.height.into(),
            };
            if shared {
                self.state.frontend.update_dmabuf_scanout(&msg);
            } else {
                let pixels = resource.storage.sub_image(&damage);
                self.state.frontend.update_scanout(&msg, &pixels);
            }
        }
        Ok(OkNoData)
    }

    fn transfer_to_host_2d(
        &mut self,
        resource_id: u32,
        rect: Rect,
        offset: u64,
    ) -> VirtioGpuResult {
        let resource = self
            .state
            .resources
            .get_mut(resource_id)
            .ok_or(ErrInvalidResourceId)?;
        let Some(backing) = resource.backing.as_ref() else {
            warn!("Transfer to resource {resource_id} without backing");
            return Err(ErrInvalidResourceId);
        };
        if !rect.within(resource.width, resource.height) {
            warn!(
                "Transfer {rect:?} is outside of the {}x{} resource {resource_id}",
                resource.width, resource.height
            );
            return Err(ErrInvalidParameter);
        }

        let image = &mut resource.storage;
        let bytes_pp = image.format().bytes_pp() as usize;
        let stride = image.stride() as usize;
        let offset = usize::try_from(offset).map_err(|_| ErrInvalidParameter)?;

        if offset != 0 || rect.x != 0 || rect.y != 0 || rect.width != image.width() {
            let row_len = rect.width as usize * bytes_pp;
            let x = rect.x as usize * bytes_pp;
            for row in 0..rect.height as usize {
                let src = offset.saturating_add(stride * row);
                let dst = (rect.y as usize + row) * stride + x;
                mapping::iov_to_buf(backing, src, &mut image.data_mut()[dst..dst + row_len]);
            }
        } else {
            let len = stride * image.height() as usize;
            mapping::iov_to_buf(backing, 0, &mut image.data_mut()[..len]);
        }
        Ok(OkNoData)
    }

    fn attach_backing(
        &mut self,
        resource_id: u32,
        nr_entries: u32,
        entries: Vec<virtio_gpu_mem_entry>,
    ) -> VirtioGpuResult {
        self.state.attach_backing(resource_id, nr_entries, &entries)
    }

    fn detach_backing(&mut self, resource_id: u32) -> VirtioGpuResult {
        self.state.detach_backing(resource_id)
    }

    fn update_cursor(&mut self, resource_id: u32, pos: CursorPos, hot_x: u32, hot_y: u32) {
        let data = self.cursor_image(resource_id);
        self.state.update_cursor(pos, hot_x, hot_y, &data);
    }

    fn move_cursor(&mut self, resource_id: u32, pos: CursorPos) {
        self.state.move_cursor(resource_id, pos);
    }

    fn get_capset_info(&self, _index: u32) -> VirtioGpuResult {
        Err(ErrInvalidParameter)
    }

    fn get_capset(&self, _capset_id: u32, _version: u32) -> VirtioGpuResult {
        Err(ErrInvalidParameter)
    }

    fn create_context(
        &mut self,
        _ctx_id: u32,
        _context_init: u32,
        _context_name: Option<&str>,
    ) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn destroy_context(&mut self, _ctx_id: u32) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn context_attach_resource(&mut self, _ctx_id: u32, _resource_id: u32) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn context_detach_resource(&mut self, _ctx_id: u32, _resource_id: u32) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn transfer_write(
        &mut self,
        _ctx_id: u32,
        _resource_id: u32,
        _req: Transfer3DDesc,
    ) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn transfer_read(
        &mut self,
        _ctx_id: u32,
        _resource_id: u32,
        _req: Transfer3DDesc,
    ) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn submit_command(
        &mut self,
        _ctx_id: u32,
        _commands: &mut [u8],
        _fence_ids: &[u64],
    ) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn resource_assign_uuid(&self, _resource_id: u32) -> VirtioGpuResult {
        Err(ErrUnspec)
    }

    fn create_fence(&mut self, _fence: RutabagaFence) -> VirtioGpuResult {
        Ok(OkNoData)
    }

    fn async_fences(&self) -> bool {
        false
    }

    fn get_event_poll_fd(&self) -> Option<EventFd> {
        None
    }

    fn event_poll(&self) {}
}

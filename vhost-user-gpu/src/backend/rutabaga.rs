// Copyright 2024 Red Hat Inc
// Copyright 2019 The ChromiumOS Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    io::IoSliceMut,
    os::fd::{FromRawFd, RawFd},
};

use log::{debug, error, trace, warn};
use rutabaga_gfx::{
    ResourceCreate3D, Rutabaga, RutabagaBuilder, RutabagaComponentType, RutabagaError,
    RutabagaFence, RutabagaFenceHandler, RutabagaIntoRawDescriptor, Transfer3D,
    RUTABAGA_PIPE_BIND_RENDER_TARGET, RUTABAGA_PIPE_TEXTURE_2D,
};
use thiserror::Error as ThisError;
use vmm_sys_util::eventfd::EventFd;

use crate::{
    backend::common::DisplayState,
    display::{
        message::{CursorPos, UpdateMsg, CURSOR_DATA_SIZE, CURSOR_HEIGHT, CURSOR_WIDTH},
        GpuFrontend,
    },
    fence::{FenceMailbox, VirtioGpuRing},
    gpu_types::{Rect, ResourceCreate3d, Transfer3DDesc},
    image::copy_rect,
    mapping::GuestMapper,
    protocol::{
        virtio_gpu_mem_entry,
        GpuResponse::{
            self, ErrInvalidParameter, ErrInvalidResourceId, ErrUnspec, OkCapset, OkCapsetInfo,
            OkNoData, OkResourcePlaneInfo, OkResourceUuid,
        },
        GpuResponsePlaneInfo, VirtioGpuResult, PLANE_INFO_MAX_COUNT,
    },
    renderer::Renderer,
    GpuConfig, GpuMode,
};

const READ_RESOURCE_BYTES_PER_PIXEL: u32 = 4;

#[derive(Debug, ThisError)]
pub enum RutabagaGpuError {
    #[error("{0} is not an accelerated mode")]
    NotAccelerated(GpuMode),
    #[error("Rutabaga initialization failed: {0}")]
    Build(RutabagaError),
}

/// The uuid a resource is exported under. Only the last four bytes carry
/// information, the resource id in big endian.
pub fn resource_uuid(resource_id: u32) -> [u8; 16] {
    let mut uuid = [0; 16];
    uuid[12..].copy_from_slice(&resource_id.to_be_bytes());
    uuid
}

/// Renders through virglrenderer or gfxstream.
///
/// Rutabaga owns the pixels. The backend only tracks the resource ids it
/// handed out, which scanouts show them, and the guest backing it mapped.
pub struct RutabagaGpu {
    rutabaga: Rutabaga,
    state: DisplayState<()>,
}

impl RutabagaGpu {
    fn create_fence_handler(mailbox: FenceMailbox) -> RutabagaFenceHandler {
        RutabagaFenceHandler::new(move |completed_fence: RutabagaFence| {
            trace!(
                "Fence signaled: id={}, ctx_id={}, ring_idx={}",
                completed_fence.fence_id,
                completed_fence.ctx_id,
                completed_fence.ring_idx
            );
            let ring = VirtioGpuRing::new(
                completed_fence.flags,
                completed_fence.ctx_id,
                completed_fence.ring_idx,
            );
            mailbox.post(ring, completed_fence.fence_id);
        })
    }

    fn configure_rutabaga_builder(gpu_config: &GpuConfig) -> Option<RutabagaBuilder> {
        let component = match gpu_config.gpu_mode() {
            #[cfg(feature = "backend-virgl")]
            GpuMode::VirglRenderer => RutabagaComponentType::VirglRenderer,
            #[cfg(feature = "backend-gfxstream")]
            GpuMode::Gfxstream => RutabagaComponentType::Gfxstream,
            GpuMode::Software => return None,
        };

        Some(
            RutabagaBuilder::new(component, gpu_config.capsets().bits())
                .set_use_egl(gpu_config.flags().use_egl)
                .set_use_glx(gpu_config.flags().use_glx)
                .set_use_gles(gpu_config.flags().use_gles)
                .set_use_surfaceless(gpu_config.flags().use_surfaceless)
                // Out of process, external blobs are the only kind that could work.
                .set_use_external_blob(true),
        )
    }

    pub fn new(
        gpu_config: &GpuConfig,
        mapper: Box<dyn GuestMapper>,
        mailbox: FenceMailbox,
    ) -> Result<Self, RutabagaGpuError> {
        let builder = Self::configure_rutabaga_builder(gpu_config)
            .ok_or(RutabagaGpuError::NotAccelerated(gpu_config.gpu_mode()))?;
        let rutabaga = builder
            .build(Self::create_fence_handler(mailbox), None)
            .map_err(RutabagaGpuError::Build)?;
        Ok(Self {
            rutabaga,
            state: DisplayState::new(gpu_config.max_outputs(), u64::MAX, mapper),
        })
    }

    fn result_from_query(&self, resource_id: u32) -> GpuResponse {
        let Ok(query) = self.rutabaga.query(resource_id) else {
            return OkNoData;
        };
        let plane_info = (0..PLANE_INFO_MAX_COUNT)
            .map(|plane| GpuResponsePlaneInfo {
                stride: query.strides[plane],
                offset: query.offsets[plane],
            })
            .collect();
        OkResourcePlaneInfo {
            format_modifier: query.modifier,
            plane_info,
        }
    }

    /// Reads the whole resource into `output` as packed 32 bit pixels.
    ///
    /// Gfxstream ignores the transfer box and always writes the complete
    /// resource, so partial reads are never attempted.
    fn read_2d_resource(&mut self, resource_id: u32, output: &mut [u8]) -> Result<(), RutabagaError> {
        let resource = self
            .state
            .resources
            .get(resource_id)
            .ok_or(RutabagaError::InvalidResourceId)?;
        let transfer = Transfer3D {
            x: 0,
            y: 0,
            z: 0,
            w: resource.width,
            h: resource.height,
            d: 1,
            level: 0,
            stride: resource.width * READ_RESOURCE_BYTES_PER_PIXEL,
            layer_stride: 0,
            offset: 0,
        };
        // ctx_id 0 is the renderer's own context.
        self.rutabaga
            .transfer_read(0, resource_id, transfer, Some(IoSliceMut::new(output)))
    }

    fn resource_size(&self, resource_id: u32) -> Option<(u32, u32, usize)> {
        let resource = self.state.resources.get(resource_id)?;
        let size = (resource.width as usize)
            .checked_mul(resource.height as usize)?
            .checked_mul(READ_RESOURCE_BYTES_PER_PIXEL as usize)?;
        Some((resource.width, resource.height, size))
    }

    fn create_resource(&mut self, resource_id: u32, create: ResourceCreate3D) -> VirtioGpuResult {
        self.state.resources.check_new_id(resource_id)?;
        self.rutabaga.resource_create_3d(resource_id, create)?;
        self.state.resources.create(
            resource_id,
            create.width,
            create.height,
            create.format,
            0,
            || Ok(()),
        )?;
        Ok(OkNoData)
    }
}

impl Renderer for RutabagaGpu {
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
        for id in self.state.resources.ids() {
            if let Err(e) = self.unref_resource(id) {
                warn!("Failed to destroy resource {id} on reset: {e:?}");
            }
        }
        self.state.reset();
    }

    fn force_ctx_0(&self) {
        self.rutabaga.force_ctx_0();
    }

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
        let create = ResourceCreate3D {
            target: RUTABAGA_PIPE_TEXTURE_2D,
            format,
            bind: RUTABAGA_PIPE_BIND_RENDER_TARGET,
            width,
            height,
            depth: 1,
            array_size: 1,
            last_level: 0,
            nr_samples: 0,
            flags: 0,
        };
        self.create_resource(resource_id, create)
    }

    fn resource_create_3d(&mut self, resource_id: u32, req: ResourceCreate3d) -> VirtioGpuResult {
        self.create_resource(resource_id, req.into())?;
        Ok(self.result_from_query(resource_id))
    }

    fn unref_resource(&mut self, resource_id: u32) -> VirtioGpuResult {
        self.state.destroy(resource_id)?;
        self.rutabaga.unref_resource(resource_id)?;
        Ok(OkNoData)
    }

    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, rect: Rect) -> VirtioGpuResult {
        self.state.set_scanout(scanout_id, resource_id, rect)
    }

    fn flush_resource(&mut self, resource_id: u32, rect: Rect) -> VirtioGpuResult {
        let (width, height, size) = self.resource_size(resource_id).ok_or(ErrInvalidResourceId)?;
        if !rect.within(width, height) {
            warn!("Flush {rect:?} is outside of the {width}x{height} resource {resource_id}");
            return Err(ErrInvalidParameter);
        }

        let targets = self
            .state
            .scanouts
            .slots_showing(resource_id)
            .map(|(slot, scanout)| (slot, scanout.rect))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Ok(OkNoData);
        }

        let mut data = vec![0; size];
        self.read_2d_resource(resource_id, &mut data).map_err(|e| {
            error!("Failed to read resource {resource_id} for flushing: {e}");
            ErrUnspec
        })?;

        let stride = (width * READ_RESOURCE_BYTES_PER_PIXEL) as usize;
        for (slot, scanout_rect) in targets {
            let damage = rect.intersect(&scanout_rect);
            if damage.is_empty() {
                continue;
            }
            let relative = damage.translate_back(scanout_rect.x, scanout_rect.y);
            let pixels = copy_rect(
                &data,
                stride,
                READ_RESOURCE_BYTES_PER_PIXEL as usize,
                &damage,
            );
            self.state.frontend.update_scanout(
                &UpdateMsg {
                    scanout_id: slot.into(),
                    x: relative.x.into(),
                    y: relative.y.into(),
                    width: relative.width.into(),
                    height: relative.height.into(),
                },
                &pixels,
            );
        }
        Ok(OkNoData)
    }

    fn transfer_to_host_2d(
        &mut self,
        resource_id: u32,
        rect: Rect,
        offset: u64,
    ) -> VirtioGpuResult {
        let (width, height, _) = self.resource_size(resource_id).ok_or(ErrInvalidResourceId)?;
        if !rect.within(width, height) {
            warn!("Transfer {rect:?} is outside of the {width}x{height} resource {resource_id}");
            return Err(ErrInvalidParameter);
        }
        let transfer = Transfer3DDesc::new_2d(rect.x, rect.y, rect.width, rect.height, offset);
        self.transfer_write(0, resource_id, transfer)
    }

    fn attach_backing(
        &mut self,
        resource_id: u32,
        nr_entries: u32,
        entries: Vec<virtio_gpu_mem_entry>,
    ) -> VirtioGpuResult {
        self.state.attach_backing(resource_id, nr_entries, &entries)?;
        let iovecs = self
            .state
            .resources
            .get(resource_id)
            .and_then(|r| r.backing.as_ref())
            .map(|backing| backing.to_rutabaga_iovecs())
            .unwrap_or_default();
        if let Err(e) = self.rutabaga.attach_backing(resource_id, iovecs) {
            let _ = self.state.detach_backing(resource_id);
            return Err(e.into());
        }
        Ok(OkNoData)
    }

    fn detach_backing(&mut self, resource_id: u32) -> VirtioGpuResult {
        self.state.detach_backing(resource_id)?;
        self.rutabaga.detach_backing(resource_id)?;
        Ok(OkNoData)
    }

    fn update_cursor(&mut self, resource_id: u32, pos: CursorPos, hot_x: u32, hot_y: u32) {
        let mut data = Box::new([0; CURSOR_DATA_SIZE]);
        match self.resource_size(resource_id) {
            Some((CURSOR_WIDTH, CURSOR_HEIGHT, _)) => {
                if let Err(e) = self.read_2d_resource(resource_id, &mut data[..]) {
                    error!("Failed to read cursor resource {resource_id}: {e}");
                }
            }
            _ => debug!("Cursor resource {resource_id} is not a 64x64 image, sending a blank cursor"),
        }
        self.state.update_cursor(pos, hot_x, hot_y, &data);
    }

    fn move_cursor(&mut self, resource_id: u32, pos: CursorPos) {
        self.state.move_cursor(resource_id, pos);
    }

    fn get_capset_info(&self, index: u32) -> VirtioGpuResult {
        let (capset_id, version, size) = self.rutabaga.get_capset_info(index)?;
        Ok(OkCapsetInfo {
            capset_id,
            version,
            size,
        })
    }

    fn get_capset(&self, capset_id: u32, version: u32) -> VirtioGpuResult {
        let capset = self.rutabaga.get_capset(capset_id, version)?;
        Ok(OkCapset(capset))
    }

    fn create_context(
        &mut self,
        ctx_id: u32,
        context_init: u32,
        context_name: Option<&str>,
    ) -> VirtioGpuResult {
        self.rutabaga
            .create_context(ctx_id, context_init, context_name)?;
        Ok(OkNoData)
    }

    fn destroy_context(&mut self, ctx_id: u32) -> VirtioGpuResult {
        self.rutabaga.destroy_context(ctx_id)?;
        Ok(OkNoData)
    }

    fn context_attach_resource(&mut self, ctx_id: u32, resource_id: u32) -> VirtioGpuResult {
        self.rutabaga.context_attach_resource(ctx_id, resource_id)?;
        Ok(OkNoData)
    }

    fn context_detach_resource(&mut self, ctx_id: u32, resource_id: u32) -> VirtioGpuResult {
        self.rutabaga.context_detach_resource(ctx_id, resource_id)?;
        Ok(OkNoData)
    }

    fn transfer_write(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        req: Transfer3DDesc,
    ) -> VirtioGpuResult {
        trace!("transfer_write ctx_id {ctx_id}, resource_id {resource_id}, {req:?}");
        self.rutabaga
            .transfer_write(ctx_id, resource_id, req.into())?;
        Ok(OkNoData)
    }

    fn transfer_read(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        req: Transfer3DDesc,
    ) -> VirtioGpuResult {
        trace!("transfer_read ctx_id {ctx_id}, resource_id {resource_id}, {req:?}");
        // Without a buffer rutabaga reads into the attached backing.
        self.rutabaga
            .transfer_read(ctx_id, resource_id, req.into(), None)?;
        Ok(OkNoData)
    }

    fn submit_command(
        &mut self,
        ctx_id: u32,
        commands: &mut [u8],
        fence_ids: &[u64],
    ) -> VirtioGpuResult {
        self.rutabaga.submit_command(ctx_id, commands, fence_ids)?;
        Ok(OkNoData)
    }

    fn resource_assign_uuid(&self, resource_id: u32) -> VirtioGpuResult {
        if self.state.resources.get(resource_id).is_none() {
            return Err(ErrInvalidResourceId);
        }
        Ok(OkResourceUuid {
            uuid: resource_uuid(resource_id),
        })
    }

    fn create_fence(&mut self, fence: RutabagaFence) -> VirtioGpuResult {
        self.rutabaga.create_fence(fence)?;
        Ok(OkNoData)
    }

    fn async_fences(&self) -> bool {
        true
    }

    fn get_event_poll_fd(&self) -> Option<EventFd> {
        self.rutabaga.poll_descriptor().map(|fd| {
            // SAFETY: Rutabaga hands over a valid descriptor.
            // into_raw_descriptor() makes sure SafeDescriptor::drop doesn't run.
            unsafe { EventFd::from_raw_fd(fd.into_raw_descriptor()) }
        })
    }

    fn event_poll(&self) {
        self.rutabaga.event_poll();
    }
}

// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::os::fd::RawFd;

use rutabaga_gfx::RutabagaFence;
use vmm_sys_util::eventfd::EventFd;

use crate::{
    display::{message::CursorPos, GpuFrontend},
    gpu_types::{Rect, ResourceCreate3d, Transfer3DDesc},
    protocol::{virtio_gpu_mem_entry, VirtioGpuResult},
};

/// The command handlers of one rendering backend.
///
/// A backend is picked once when the device starts; the control queue
/// dispatcher only ever talks to it through this trait.
#[cfg_attr(test, mockall::automock)]
// We need to specify some lifetimes explicitly, for mockall::automock attribute to compile
#[allow(clippy::needless_lifetimes)]
pub trait Renderer {
    /// Starts forwarding display state to `frontend`, replacing any previous
    /// display channel.
    fn attach_frontend(&mut self, frontend: Box<dyn GpuFrontend>);
    /// Set while the display process owes acknowledgements for DMA-buf
    /// updates. The control queue must not be processed in that state.
    fn frontend_ack_fd(&self) -> Option<RawFd>;
    /// Handles readiness of `frontend_ack_fd`. Returns `true` when nothing is
    /// owed any more.
    fn process_frontend_ack(&mut self) -> bool;
    /// Destroys every resource and disables every scanout.
    fn reset(&mut self);
    fn force_ctx_0(&self);

    fn display_info(&mut self) -> VirtioGpuResult;
    fn get_edid(&mut self, scanout_id: u32) -> VirtioGpuResult;
    fn resource_create_2d(
        &mut self,
        resource_id: u32,
        format: u32,
        width: u32,
        height: u32,
    ) -> VirtioGpuResult;
    fn resource_create_3d(&mut self, resource_id: u32, req: ResourceCreate3d) -> VirtioGpuResult;
    fn unref_resource(&mut self, resource_id: u32) -> VirtioGpuResult;
    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, rect: Rect) -> VirtioGpuResult;
    fn flush_resource(&mut self, resource_id: u32, rect: Rect) -> VirtioGpuResult;
    fn transfer_to_host_2d(&mut self, resource_id: u32, rect: Rect, offset: u64)
        -> VirtioGpuResult;
    fn attach_backing(
        &mut self,
        resource_id: u32,
        nr_entries: u32,
        entries: Vec<virtio_gpu_mem_entry>,
    ) -> VirtioGpuResult;
    fn detach_backing(&mut self, resource_id: u32) -> VirtioGpuResult;

    /// Cursor commands have no response, failures are only logged.
    fn update_cursor(&mut self, resource_id: u32, pos: CursorPos, hot_x: u32, hot_y: u32);
    fn move_cursor(&mut self, resource_id: u32, pos: CursorPos);

    fn get_capset_info(&self, index: u32) -> VirtioGpuResult;
    fn get_capset(&self, capset_id: u32, version: u32) -> VirtioGpuResult;
    fn create_context<'a>(
        &mut self,
        ctx_id: u32,
        context_init: u32,
        context_name: Option<&'a str>,
    ) -> VirtioGpuResult;
    fn destroy_context(&mut self, ctx_id: u32) -> VirtioGpuResult;
    fn context_attach_resource(&mut self, ctx_id: u32, resource_id: u32) -> VirtioGpuResult;
    fn context_detach_resource(&mut self, ctx_id: u32, resource_id: u32) -> VirtioGpuResult;
    fn transfer_write(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        req: Transfer3DDesc,
    ) -> VirtioGpuResult;
    fn transfer_read(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        req: Transfer3DDesc,
    ) -> VirtioGpuResult;
    fn submit_command(
        &mut self,
        ctx_id: u32,
        commands: &mut [u8],
        fence_ids: &[u64],
    ) -> VirtioGpuResult;
    fn resource_assign_uuid(&self, resource_id: u32) -> VirtioGpuResult;

    fn create_fence(&mut self, fence: RutabagaFence) -> VirtioGpuResult;
    /// Whether fenced commands complete asynchronously through the fence
    /// mailbox. Otherwise they are answered right away.
    fn async_fences(&self) -> bool;
    fn get_event_poll_fd(&self) -> Option<EventFd>;
    fn event_poll(&self);
}

// vhost-user gpu device
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cell::RefCell,
    io::{self, Result as IoResult},
    mem,
    os::fd::{AsRawFd, RawFd},
    sync::{self, Arc, Mutex},
};

use log::{debug, error, info, trace, warn};
use rutabaga_gfx::RutabagaFence;
use thiserror::Error as ThisError;
use vhost::vhost_user::{
    message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures},
    GpuBackend,
};
use vhost_user_backend::{VhostUserBackend, VringEpollHandler, VringRwLock, VringT};
use virtio_bindings::{
    bindings::{
        virtio_config::{VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_RING_RESET, VIRTIO_F_VERSION_1},
        virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC},
    },
    virtio_gpu::{VIRTIO_GPU_F_CONTEXT_INIT, VIRTIO_GPU_F_EDID, VIRTIO_GPU_F_VIRGL},
};
use virtio_queue::{QueueT, Reader, Writer};
use vm_memory::{ByteValued, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap, Le32};
use vmm_sys_util::{
    epoll::EventSet,
    eventfd::{EventFd, EFD_NONBLOCK},
};

#[cfg(any(feature = "backend-virgl", feature = "backend-gfxstream"))]
use crate::backend::rutabaga::{RutabagaGpu, RutabagaGpuError};
use crate::{
    backend::software::SoftwareGpu,
    buffer::{BufferAllocator, UdmabufAllocator},
    cursor,
    display::GpuFrontend,
    fence::{FenceMailbox, FenceQueue, PendingCommand, VirtioGpuRing},
    mapping::GuestMapper,
    protocol::{
        virtio_gpu_ctrl_hdr, GpuCommand, GpuCommandDecodeError, GpuResponse::ErrUnspec,
        GpuResponseEncodeError, VirtioGpuConfig, VirtioGpuResult, CONTROL_QUEUE, CURSOR_QUEUE,
        FENCE_EVENT, FRONTEND_EVENT, NUM_QUEUES, POLL_EVENT, QUEUE_SIZE,
        VIRTIO_GPU_EVENT_DISPLAY, VIRTIO_GPU_FLAG_FENCE,
    },
    renderer::Renderer,
    GpuConfig, GpuMode,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to handle event, didn't match EPOLLIN")]
    HandleEventNotEpollIn,
    #[error("Failed to handle unknown event")]
    HandleEventUnknown,
    #[error("Failed to send used queue notification: {0}")]
    NotificationFailed(io::Error),
    #[error("Failed to change queue notification state: {0}")]
    QueueNotification(virtio_queue::Error),
    #[error("Failed to create new EventFd")]
    EventFdFailed,
    #[error("Failed to create the fence mailbox: {0}")]
    FenceMailbox(io::Error),
    #[error("Guest memory is not available yet")]
    NoGuestMemory,
    #[error("Failed to open the udmabuf device: {0}")]
    Udmabuf(io::Error),
    #[cfg(any(feature = "backend-virgl", feature = "backend-gfxstream"))]
    #[error("Failed to create the accelerated renderer: {0}")]
    CreateRutabaga(RutabagaGpuError),
    #[error("Failed to create an iterator over a descriptor chain: {0}")]
    CreateIteratorDescChain(virtio_queue::Error),
    #[error("Failed to create descriptor chain Reader: {0}")]
    CreateReader(virtio_queue::Error),
    #[error("Failed to create descriptor chain Writer: {0}")]
    CreateWriter(virtio_queue::Error),
    #[error("Failed to encode gpu response: {0}")]
    GpuResponseEncode(GpuResponseEncodeError),
    #[error("Failed add used chain to queue: {0}")]
    QueueAddUsed(virtio_queue::Error),
    #[error("Config write of {len} bytes at offset {offset} is out of bounds")]
    ConfigWriteOutOfBounds { offset: u32, len: usize },
    #[error("Epoll handler not available: {0}")]
    EpollHandler(String),
    #[error("Failed register epoll listener: {0}")]
    RegisterEpollListener(io::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

/// Whether the control queue may be popped.
///
/// While the display process owes DMA-buf update acknowledgements the
/// dispatcher is suspended, and the socket the acknowledgements arrive on is
/// watched by the event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DispatchState {
    Running,
    Suspended { ack_fd: RawFd },
}

/// An epoll registration the event loop must apply once the backend state is
/// unlocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerChange {
    Register { fd: RawFd, event: u16 },
    Unregister { fd: RawFd, event: u16 },
}

struct VhostUserGpuBackendInner {
    virtio_cfg: VirtioGpuConfig,
    event_idx_enabled: bool,
    pending_frontend: Option<Box<dyn GpuFrontend + Send>>,
    pub exit_event: EventFd,
    mem: Option<GuestMemoryAtomic<GuestMemoryMmap>>,
    gpu_config: GpuConfig,
    dispatch: DispatchState,
    fences: FenceQueue,
    fence_mailbox: FenceMailbox,
    // kept open while registered with the epoll handler
    poll_event_fd: Option<EventFd>,
    listener_changes: Vec<ListenerChange>,
    reset_pending: bool,
}

pub struct VhostUserGpuBackend {
    inner: Mutex<VhostUserGpuBackendInner>,
    // this uses sync::Weak to avoid a reference cycle
    epoll_handler: Mutex<sync::Weak<VringEpollHandler<Arc<Self>>>>,
}

impl VhostUserGpuBackend {
    pub fn new(gpu_config: GpuConfig) -> Result<Arc<Self>> {
        info!(
            "GpuBackend using mode {} (capsets: '{}'), flags: {:?}, outputs: {}",
            gpu_config.gpu_mode(),
            gpu_config.capsets(),
            gpu_config.flags(),
            gpu_config.max_outputs()
        );

        let inner = VhostUserGpuBackendInner {
            virtio_cfg: VirtioGpuConfig {
                events_read: 0.into(),
                events_clear: 0.into(),
                num_scanouts: Le32::from(gpu_config.max_outputs()),
                num_capsets: Le32::from(gpu_config.capsets().num_capsets()),
            },
            event_idx_enabled: false,
            pending_frontend: None,
            exit_event: EventFd::new(EFD_NONBLOCK).map_err(|_| Error::EventFdFailed)?,
            mem: None,
            gpu_config,
            dispatch: DispatchState::Running,
            fences: FenceQueue::default(),
            fence_mailbox: FenceMailbox::new().map_err(Error::FenceMailbox)?,
            poll_event_fd: None,
            listener_changes: Vec::new(),
            reset_pending: false,
        };

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            epoll_handler: Mutex::new(sync::Weak::new()),
        }))
    }

    pub fn set_epoll_handler(&self, epoll_handlers: &[Arc<VringEpollHandler<Arc<Self>>>]) {
        // We only expect 1 thread to which we want to register all handlers
        assert_eq!(
            epoll_handlers.len(),
            1,
            "Expected exactly one epoll handler"
        );

        // Acquire the lock. Panics if poisoned because the state is invalid in that
        // case, and recovery would not make sense in this context.
        let mut handler = self.epoll_handler.lock().unwrap();
        *handler = Arc::downgrade(&epoll_handlers[0]);
    }

    /// Hands a display channel to the renderer and tells the driver a display
    /// is there. The renderer picks it up on the next event.
    pub fn set_frontend(&self, frontend: Box<dyn GpuFrontend + Send>) {
        self.inner.lock().unwrap().set_frontend(frontend);
    }

    fn update_listeners(&self, changes: Vec<ListenerChange>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let epoll_handler = match self.epoll_handler.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(epoll_handler) = epoll_handler.upgrade() else {
            return Err(Error::EpollHandler(
                "Failed to upgrade epoll handler".to_string(),
            ));
        };

        for change in changes {
            match change {
                ListenerChange::Register { fd, event } => {
                    epoll_handler
                        .register_listener(fd, EventSet::IN, u64::from(event))
                        .map_err(Error::RegisterEpollListener)?;
                    debug!("Registered event {event} on fd: {fd}");
                }
                ListenerChange::Unregister { fd, event } => {
                    // A display socket that went down is already gone from the epoll set.
                    if let Err(e) =
                        epoll_handler.unregister_listener(fd, EventSet::IN, u64::from(event))
                    {
                        debug!("Failed to unregister event {event} on fd {fd}: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Runs `process` until the driver stops adding requests to `vring`, or
/// until `process` reports that it cannot take any more.
fn drain_queue(
    event_idx_enabled: bool,
    vring: &VringRwLock,
    mut process: impl FnMut() -> Result<bool>,
) -> Result<()> {
    if event_idx_enabled {
        // vm-virtio's Queue implementation only checks avail_index
        // once, so to properly support EVENT_IDX we need to keep
        // calling process() until it stops finding new
        // requests on the queue.
        loop {
            vring
                .disable_notification()
                .map_err(Error::QueueNotification)?;
            let more = process()?;
            if !vring
                .enable_notification()
                .map_err(Error::QueueNotification)?
                || !more
            {
                break;
            }
        }
    } else {
        // Without EVENT_IDX, a single call is enough.
        process()?;
    }
    Ok(())
}

impl VhostUserGpuBackendInner {
    fn process_gpu_command(
        renderer: &mut dyn Renderer,
        hdr: &virtio_gpu_ctrl_hdr,
        cmd: GpuCommand,
    ) -> VirtioGpuResult {
        renderer.force_ctx_0();
        debug!("process_gpu_command: {cmd:?}");
        let ctx_id = hdr.ctx_id.into();
        match cmd {
            GpuCommand::GetDisplayInfo => renderer.display_info(),
            GpuCommand::GetEdid(req) => renderer.get_edid(req.scanout.into()),
            GpuCommand::ResourceCreate2d(req) => renderer.resource_create_2d(
                req.resource_id.into(),
                req.format.into(),
                req.width.into(),
                req.height.into(),
            ),
            GpuCommand::ResourceUnref(req) => renderer.unref_resource(req.resource_id.into()),
            GpuCommand::SetScanout(req) => {
                renderer.set_scanout(req.scanout_id.into(), req.resource_id.into(), req.r.into())
            }
            GpuCommand::ResourceFlush(req) => {
                renderer.flush_resource(req.resource_id.into(), req.r.into())
            }
            GpuCommand::TransferToHost2d(req) => renderer.transfer_to_host_2d(
                req.resource_id.into(),
                req.r.into(),
                req.offset.into(),
            ),
            GpuCommand::ResourceAttachBacking(req, entries) => renderer.attach_backing(
                req.resource_id.into(),
                req.nr_entries.into(),
                entries,
            ),
            GpuCommand::ResourceDetachBacking(req) => {
                renderer.detach_backing(req.resource_id.into())
            }
            GpuCommand::ResourceAssignUuid(req) => {
                renderer.resource_assign_uuid(req.resource_id.into())
            }
            GpuCommand::GetCapsetInfo(req) => renderer.get_capset_info(req.capset_index.into()),
            GpuCommand::GetCapset(req) => {
                renderer.get_capset(req.capset_id.into(), req.capset_version.into())
            }
            GpuCommand::CtxCreate(req) => {
                let context_name = req.get_debug_name();
                renderer.create_context(
                    ctx_id,
                    req.context_init.into(),
                    Some(context_name.as_str()),
                )
            }
            GpuCommand::CtxDestroy(_) => renderer.destroy_context(ctx_id),
            GpuCommand::CtxAttachResource(req) => {
                renderer.context_attach_resource(ctx_id, req.resource_id.into())
            }
            GpuCommand::CtxDetachResource(req) => {
                renderer.context_detach_resource(ctx_id, req.resource_id.into())
            }
            GpuCommand::ResourceCreate3d(req) => {
                renderer.resource_create_3d(req.resource_id.into(), req.into())
            }
            GpuCommand::TransferToHost3d(req) => {
                renderer.transfer_write(ctx_id, req.resource_id.into(), req.into())
            }
            GpuCommand::TransferFromHost3d(req) => {
                renderer.transfer_read(ctx_id, req.resource_id.into(), req.into())
            }
            GpuCommand::CmdSubmit3d {
                fence_ids,
                mut cmd_data,
            } => renderer.submit_command(ctx_id, &mut cmd_data, &fence_ids),
            GpuCommand::ResourceCreateBlob(_)
            | GpuCommand::SetScanoutBlob(_)
            | GpuCommand::ResourceMapBlob(_)
            | GpuCommand::ResourceUnmapBlob(_) => {
                debug!("Blob resources are not supported");
                Err(ErrUnspec)
            }
        }
    }

    fn process_queue_chain(
        &mut self,
        renderer: &mut dyn Renderer,
        vring: &VringRwLock,
        head_index: u16,
        reader: &mut Reader,
        writer: &mut Writer,
        signal_used_queue: &mut bool,
    ) -> Result<()> {
        let mut response = ErrUnspec;

        let hdr = GpuCommand::decode_header(reader);
        let decoded = match GpuCommand::decode_body(&hdr, reader) {
            Ok(gpu_cmd) => {
                let cmd_name = gpu_cmd.command_name();
                let response_result = Self::process_gpu_command(renderer, &hdr, gpu_cmd);
                // Unwrap the response from inside Result and log information
                response = match response_result {
                    Ok(response) => response,
                    Err(response) => {
                        debug!("GpuCommand {cmd_name} failed: {response:?}");
                        response
                    }
                };
                true
            }
            Err(GpuCommandDecodeError::InvalidType(type_)) => {
                debug!("Unsupported command type {type_:#x}");
                false
            }
            Err(e) => {
                warn!("Failed to decode GpuCommand: {e}");
                false
            }
        };

        if writer.available_bytes() == 0 {
            debug!("Command does not have descriptors for a response");
            vring.add_used(head_index, 0).map_err(Error::QueueAddUsed)?;
            *signal_used_queue = true;
            return Ok(());
        }

        let mut fence_id = 0;
        let mut ctx_id = 0;
        let mut flags = 0;
        let mut ring_idx = 0;
        let mut pending_ring = None;

        if decoded && u32::from(hdr.flags) & VIRTIO_GPU_FLAG_FENCE != 0 {
            flags = hdr.flags.into();
            fence_id = hdr.fence_id.into();
            ctx_id = hdr.ctx_id.into();
            ring_idx = hdr.ring_idx;

            let fence = RutabagaFence {
                flags,
                fence_id,
                ctx_id,
                ring_idx,
            };
            match renderer.create_fence(fence) {
                Ok(_) => {
                    let ring = VirtioGpuRing::from_hdr(&hdr);
                    if renderer.async_fences() && !self.fences.is_completed(ring, fence_id) {
                        pending_ring = Some(ring);
                    }
                }
                Err(fence_response) => {
                    warn!(
                        "Failed to create fence: fence_id: {fence_id} fence_response: \
                         {fence_response}"
                    );
                    response = fence_response;
                }
            }
        }

        // Prepare the response now, even if it is going to wait until
        // fence is complete.
        let response_len = response
            .encode(flags, fence_id, ctx_id, ring_idx, writer)
            .map_err(Error::GpuResponseEncode)?;

        if let Some(ring) = pending_ring {
            debug!("Command {head_index} waits for fence {fence_id} on {ring:?}");
            self.fences.enqueue(PendingCommand {
                ring,
                fence_id,
                desc_index: head_index,
                len: response_len,
            });
        } else {
            vring
                .add_used(head_index, response_len)
                .map_err(Error::QueueAddUsed)?;
            trace!("add_used {} bytes", response_len);
            *signal_used_queue = true;
        }
        Ok(())
    }

    /// Pops and handles control commands one at a time, stopping early when
    /// a command leaves display acknowledgements outstanding. Returns whether
    /// the dispatcher is still running.
    fn process_control_chains(
        &mut self,
        renderer: &mut dyn Renderer,
        vring: &VringRwLock,
    ) -> Result<bool> {
        let mem = self
            .mem
            .as_ref()
            .ok_or(Error::NoGuestMemory)?
            .memory()
            .into_inner();

        let mut signal_used_queue = false;
        while self.dispatch == DispatchState::Running {
            let Some(desc_chain) = vring
                .get_mut()
                .get_queue_mut()
                .pop_descriptor_chain(mem.clone())
            else {
                break;
            };

            let head_index = desc_chain.head_index();
            let mut reader = desc_chain
                .clone()
                .reader(&mem)
                .map_err(Error::CreateReader)?;
            let mut writer = desc_chain.writer(&mem).map_err(Error::CreateWriter)?;

            self.process_queue_chain(
                renderer,
                vring,
                head_index,
                &mut reader,
                &mut writer,
                &mut signal_used_queue,
            )?;

            if let Some(ack_fd) = renderer.frontend_ack_fd() {
                debug!("Waiting for the display to acknowledge an update");
                self.dispatch = DispatchState::Suspended { ack_fd };
                self.listener_changes.push(ListenerChange::Register {
                    fd: ack_fd,
                    event: FRONTEND_EVENT,
                });
            }
        }

        if signal_used_queue {
            debug!("Notifying used queue");
            vring
                .signal_used_queue()
                .map_err(Error::NotificationFailed)?;
        }
        debug!("Processing control queue finished");

        Ok(self.dispatch == DispatchState::Running)
    }

    fn process_control_queue(
        &mut self,
        renderer: &mut dyn Renderer,
        vring: &VringRwLock,
    ) -> Result<()> {
        if self.dispatch != DispatchState::Running {
            trace!("Control queue is suspended");
            return Ok(());
        }
        let event_idx_enabled = self.event_idx_enabled;
        drain_queue(event_idx_enabled, vring, || {
            self.process_control_chains(renderer, vring)
        })
    }

    /// Returns the commands whose fences the renderer signaled.
    fn process_fences(&mut self, vring: &VringRwLock) -> Result<()> {
        let mut signal_used_queue = false;
        for (ring, fence_id) in self.fence_mailbox.drain() {
            for cmd in self.fences.complete_up_to(ring, fence_id) {
                vring
                    .add_used(cmd.desc_index, cmd.len)
                    .map_err(Error::QueueAddUsed)?;
                signal_used_queue = true;
            }
        }

        if signal_used_queue {
            debug!("Notifying used queue after fence completion");
            vring
                .signal_used_queue()
                .map_err(Error::NotificationFailed)?;
        }
        Ok(())
    }

    fn resume_dispatch(&mut self) {
        if let DispatchState::Suspended { ack_fd } = self.dispatch {
            self.listener_changes.push(ListenerChange::Unregister {
                fd: ack_fd,
                event: FRONTEND_EVENT,
            });
        }
        self.dispatch = DispatchState::Running;
    }

    fn handle_event(
        &mut self,
        device_event: u16,
        renderer: &mut dyn Renderer,
        vrings: &[VringRwLock],
    ) -> Result<()> {
        if let Some(frontend) = self.pending_frontend.take() {
            renderer.attach_frontend(frontend);
        }
        if self.reset_pending {
            info!("Resetting device state");
            self.reset_pending = false;
            renderer.reset();
            self.fences.clear();
            self.resume_dispatch();
        }

        let control_vring = || {
            vrings
                .get(CONTROL_QUEUE as usize)
                .ok_or(Error::HandleEventUnknown)
        };

        match device_event {
            CONTROL_QUEUE => self.process_control_queue(renderer, control_vring()?)?,
            CURSOR_QUEUE => {
                let vring = vrings
                    .get(CURSOR_QUEUE as usize)
                    .ok_or(Error::HandleEventUnknown)?;
                let mem = self.mem.as_ref().ok_or(Error::NoGuestMemory)?;
                let max_outputs = self.gpu_config.max_outputs();
                drain_queue(self.event_idx_enabled, vring, || {
                    cursor::process_cursor_queue(renderer, vring, mem, max_outputs)?;
                    Ok(true)
                })?;
            }
            POLL_EVENT => {
                trace!("Handling POLL_EVENT");
                renderer.event_poll();
            }
            FENCE_EVENT => {
                trace!("Handling FENCE_EVENT");
                self.process_fences(control_vring()?)?;
            }
            FRONTEND_EVENT => {
                let DispatchState::Suspended { .. } = self.dispatch else {
                    debug!("Display acknowledgement while not waiting for one");
                    return Ok(());
                };
                if renderer.process_frontend_ack() {
                    debug!("Display caught up, resuming the control queue");
                    self.resume_dispatch();
                    self.process_control_queue(renderer, control_vring()?)?;
                }
            }
            _ => {
                warn!("unhandled device_event: {}", device_event);
                return Err(Error::HandleEventUnknown);
            }
        }

        Ok(())
    }

    #[cfg_attr(
        not(any(feature = "backend-virgl", feature = "backend-gfxstream")),
        allow(clippy::unnecessary_wraps)
    )]
    fn create_renderer(&self) -> Result<Box<dyn Renderer>> {
        let mapper: Box<dyn GuestMapper> =
            Box::new(self.mem.clone().ok_or(Error::NoGuestMemory)?);
        let config = &self.gpu_config;
        match config.gpu_mode() {
            GpuMode::Software => {
                let allocator = if config.udmabuf() {
                    let allocator = UdmabufAllocator::open().map_err(Error::Udmabuf)?;
                    Some(Box::new(allocator) as Box<dyn BufferAllocator>)
                } else {
                    None
                };
                Ok(Box::new(SoftwareGpu::new(
                    config.max_outputs(),
                    config.max_hostmem(),
                    mapper,
                    allocator,
                )))
            }
            #[cfg(any(feature = "backend-virgl", feature = "backend-gfxstream"))]
            _ => {
                let gpu = RutabagaGpu::new(config, mapper, self.fence_mailbox.clone())
                    .map_err(Error::CreateRutabaga)?;
                Ok(Box::new(gpu))
            }
        }
    }

    fn lazy_init_and_handle_event(
        &mut self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringRwLock],
        _thread_id: usize,
    ) -> IoResult<()> {
        // We use thread_local here because it is the easiest way to handle a
        // Renderer being !Send
        thread_local! {
            static RENDERER: RefCell<Option<Box<dyn Renderer>>> = const { RefCell::new(None) };
        }

        debug!("Handle event called");
        // A display that went away while we wait for its acknowledgement
        // reports a hangup, reading it is what brings the link down.
        let frontend_hangup = device_event == FRONTEND_EVENT
            && evset.intersects(EventSet::HANG_UP | EventSet::READ_HANG_UP | EventSet::ERROR);
        if evset != EventSet::IN && !frontend_hangup {
            return Err(Error::HandleEventNotEpollIn.into());
        };

        RENDERER.with_borrow_mut(|maybe_renderer| {
            let renderer = match maybe_renderer {
                Some(renderer) => renderer,
                None => {
                    let renderer = self.create_renderer().inspect_err(|e| {
                        error!("Failed to create the renderer: {e}");
                    })?;
                    if let Some(poll_event_fd) = renderer.get_event_poll_fd() {
                        self.listener_changes.push(ListenerChange::Register {
                            fd: poll_event_fd.as_raw_fd(),
                            event: POLL_EVENT,
                        });
                        self.poll_event_fd = Some(poll_event_fd);
                    }
                    self.listener_changes.push(ListenerChange::Register {
                        fd: self.fence_mailbox.as_raw_fd(),
                        event: FENCE_EVENT,
                    });
                    // A fresh renderer has nothing to reset.
                    self.reset_pending = false;
                    maybe_renderer.insert(renderer)
                }
            };

            self.handle_event(device_event, &mut **renderer, vrings)
        })?;

        Ok(())
    }

    fn set_frontend(&mut self, frontend: Box<dyn GpuFrontend + Send>) {
        self.pending_frontend = Some(frontend);
        let events_read = u32::from(self.virtio_cfg.events_read) | VIRTIO_GPU_EVENT_DISPLAY;
        self.virtio_cfg.events_read = events_read.into();
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        let offset = offset as usize;
        let size = size as usize;

        let buf = self.virtio_cfg.as_slice();

        if offset + size > buf.len() {
            return Vec::new();
        }

        buf[offset..offset + size].to_vec()
    }

    /// Only `events_clear` is writable. Writing it clears the matching bits of
    /// `events_read`.
    fn set_config(&mut self, offset: u32, buf: &[u8]) -> Result<()> {
        let mut cfg = self.virtio_cfg;
        let slice = cfg.as_mut_slice();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= slice.len())
            .ok_or(Error::ConfigWriteOutOfBounds {
                offset,
                len: buf.len(),
            })?;
        slice[start..end].copy_from_slice(buf);

        let events_clear = u32::from(cfg.events_clear);
        let events_read = u32::from(self.virtio_cfg.events_read) & !events_clear;
        debug!("Clearing config events {events_clear:#x}");
        self.virtio_cfg.events_read = events_read.into();
        self.virtio_cfg.events_clear = 0.into();
        Ok(())
    }
}

/// `VhostUserBackend` trait methods
impl VhostUserBackend for VhostUserGpuBackend {
    type Vring = VringRwLock;
    type Bitmap = ();

    fn num_queues(&self) -> usize {
        debug!("Num queues called");
        NUM_QUEUES
    }

    fn max_queue_size(&self) -> usize {
        debug!("Max queues called");
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        let mut features = (1 << VIRTIO_F_VERSION_1)
            | (1 << VIRTIO_F_RING_RESET)
            | (1 << VIRTIO_F_NOTIFY_ON_EMPTY)
            | (1 << VIRTIO_RING_F_INDIRECT_DESC)
            | (1 << VIRTIO_RING_F_EVENT_IDX)
            | (1 << VIRTIO_GPU_F_EDID)
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits();
        if self.inner.lock().unwrap().gpu_config.gpu_mode().is_accelerated() {
            features |= (1 << VIRTIO_GPU_F_VIRGL) | (1 << VIRTIO_GPU_F_CONTEXT_INIT);
        }
        features
    }

    fn acked_features(&self, features: u64) {
        debug!("Features acked: {features:#x}");
        // The driver (re)initialized the device, stale resources must go.
        self.inner.lock().unwrap().reset_pending = true;
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        debug!("Protocol features called");
        VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::MQ
    }

    fn set_event_idx(&self, enabled: bool) {
        self.inner.lock().unwrap().event_idx_enabled = enabled;
        debug!("Event idx set to: {}", enabled);
    }

    fn update_memory(&self, mem: GuestMemoryAtomic<GuestMemoryMmap>) -> IoResult<()> {
        debug!("Update memory called");
        self.inner.lock().unwrap().mem = Some(mem);
        Ok(())
    }

    fn set_gpu_socket(&self, backend: GpuBackend) -> IoResult<()> {
        info!("Display channel received from the frontend");
        self.set_frontend(Box::new(backend));
        Ok(())
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        self.inner.lock().unwrap().get_config(offset, size)
    }

    fn set_config(&self, offset: u32, buf: &[u8]) -> IoResult<()> {
        Ok(self.inner.lock().unwrap().set_config(offset, buf)?)
    }

    fn exit_event(&self, _thread_index: usize) -> Option<EventFd> {
        self.inner.lock().unwrap().exit_event.try_clone().ok()
    }

    fn handle_event(
        &self,
        device_event: u16,
        evset: EventSet,
        vrings: &[Self::Vring],
        thread_id: usize,
    ) -> IoResult<()> {
        let (result, changes) = {
            let mut inner = self.inner.lock().unwrap();
            let result = inner.lazy_init_and_handle_event(device_event, evset, vrings, thread_id);
            (result, mem::take(&mut inner.listener_changes))
        };

        self.update_listeners(changes)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::ErrorKind,
        mem::{size_of, size_of_val},
    };

    use assert_matches::assert_matches;
    use mockall::predicate;
    use rusty_fork::rusty_fork_test;
    use vhost_user_backend::VhostUserDaemon;
    use vm_memory::{Bytes, GuestAddress};

    use super::*;
    use crate::{
        display::{channel::fake_display, message::GpuProtocolFeatures},
        protocol::{
            virtio_gpu_ctx_create, virtio_gpu_ctx_destroy, virtio_gpu_get_capset_info,
            virtio_gpu_get_edid, virtio_gpu_resource_attach_backing,
            virtio_gpu_resource_create_2d, virtio_gpu_resource_create_blob,
            virtio_gpu_resource_flush, virtio_gpu_resource_unref, virtio_gpu_resp_display_info,
            virtio_gpu_set_scanout, virtio_gpu_transfer_host_3d,
            GpuResponse::{OkCapsetInfo, OkDisplayInfo, OkEdid, OkNoData},
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO, VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING,
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D, VIRTIO_GPU_CMD_RESOURCE_FLUSH,
            VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D, VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D,
            VIRTIO_GPU_FLAG_INFO_RING_IDX, VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM,
            VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM, VIRTIO_GPU_RESP_ERR_UNSPEC,
            VIRTIO_GPU_RESP_OK_DISPLAY_INFO, VIRTIO_GPU_RESP_OK_NODATA,
        },
        renderer::MockRenderer,
        testutils::{
            create_control_vring, create_cursor_vring, new_hdr, test_memory,
            TestingDescChainArgs,
        },
        GpuConfigBuilder,
    };

    const RESP_SIZE: u32 = size_of::<virtio_gpu_ctrl_hdr>() as u32;

    fn init() -> (Arc<VhostUserGpuBackend>, GuestMemoryAtomic<GuestMemoryMmap>) {
        let config = GpuConfigBuilder::default().build().unwrap();
        let backend = VhostUserGpuBackend::new(config).unwrap();
        let mem = test_memory();

        backend.update_memory(mem.clone()).unwrap();
        (backend, mem)
    }

    #[test]
    fn test_process_gpu_command() {
        let hdr = virtio_gpu_ctrl_hdr::default();

        let test_cmd = |cmd: GpuCommand, setup: fn(&mut MockRenderer)| {
            let mut mock_gpu = MockRenderer::new();
            mock_gpu.expect_force_ctx_0().return_once(|| ());
            setup(&mut mock_gpu);
            VhostUserGpuBackendInner::process_gpu_command(&mut mock_gpu, &hdr, cmd)
        };

        let cmd = GpuCommand::GetDisplayInfo;
        let result = test_cmd(cmd, |g| {
            g.expect_display_info()
                .return_once(|| Ok(OkDisplayInfo(vec![(1280, 720, true)])));
        });
        assert_matches!(result, Ok(OkDisplayInfo(_)));

        let cmd = GpuCommand::GetEdid(virtio_gpu_get_edid {
            scanout: 1.into(),
            padding: 0.into(),
        });
        let result = test_cmd(cmd, |g| {
            g.expect_get_edid()
                .with(predicate::eq(1))
                .return_once(|_| {
                    Ok(OkEdid {
                        blob: Box::new([0xff; 512]),
                    })
                });
        });
        assert_matches!(result, Ok(OkEdid { .. }));

        let cmd = GpuCommand::ResourceCreate2d(virtio_gpu_resource_create_2d {
            resource_id: 3.into(),
            format: VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM.into(),
            width: 64.into(),
            height: 32.into(),
        });
        let result = test_cmd(cmd, |g| {
            g.expect_resource_create_2d()
                .with(
                    predicate::eq(3),
                    predicate::eq(VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM),
                    predicate::eq(64),
                    predicate::eq(32),
                )
                .return_once(|_, _, _, _| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::ResourceUnref(virtio_gpu_resource_unref::default());
        let result = test_cmd(cmd, |g| {
            g.expect_unref_resource().return_once(|_| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::SetScanout(virtio_gpu_set_scanout::default());
        let result = test_cmd(cmd, |g| {
            g.expect_set_scanout().return_once(|_, _, _| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::ResourceFlush(virtio_gpu_resource_flush::default());
        let result = test_cmd(cmd, |g| {
            g.expect_flush_resource().return_once(|_, _| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::ResourceAttachBacking(
            virtio_gpu_resource_attach_backing {
                resource_id: 1.into(),
                nr_entries: 2.into(),
            },
            Vec::default(),
        );
        let result = test_cmd(cmd, |g| {
            g.expect_attach_backing()
                .withf(|id, nr_entries, entries| *id == 1 && *nr_entries == 2 && entries.is_empty())
                .return_once(|_, _, _| Err(ErrUnspec));
        });
        assert_matches!(result, Err(ErrUnspec));

        let cmd = GpuCommand::GetCapsetInfo(virtio_gpu_get_capset_info::default());
        let result = test_cmd(cmd, |g| {
            g.expect_get_capset_info().return_once(|_| {
                Ok(OkCapsetInfo {
                    capset_id: 1,
                    version: 2,
                    size: 32,
                })
            });
        });
        assert_matches!(
            result,
            Ok(OkCapsetInfo {
                capset_id: 1,
                version: 2,
                size: 32
            })
        );

        let cmd = GpuCommand::CtxCreate(virtio_gpu_ctx_create::default());
        let result = test_cmd(cmd, |g| {
            g.expect_create_context()
                .return_once(|_, _, _| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::CtxDestroy(virtio_gpu_ctx_destroy::default());
        let result = test_cmd(cmd, |g| {
            g.expect_destroy_context().return_once(|_| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::TransferFromHost3d(virtio_gpu_transfer_host_3d::default());
        let result = test_cmd(cmd, |g| {
            g.expect_transfer_read()
                .return_once(|_, _, _| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        let cmd = GpuCommand::CmdSubmit3d {
            cmd_data: vec![0xff; 512],
            fence_ids: vec![],
        };
        let result = test_cmd(cmd, |g| {
            g.expect_submit_command()
                .return_once(|_, _, _| Ok(OkNoData));
        });
        assert_matches!(result, Ok(OkNoData));

        // Blob commands never reach the renderer.
        let cmd = GpuCommand::ResourceCreateBlob(virtio_gpu_resource_create_blob::default());
        let result = test_cmd(cmd, |_| ());
        assert_matches!(result, Err(ErrUnspec));
    }

    #[test]
    fn test_handle_event_executes_gpu_commands() {
        let (backend, mem) = init();
        let mut backend_inner = backend.inner.lock().unwrap();

        let hdr = new_hdr(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D);
        let cmd = virtio_gpu_resource_create_2d {
            resource_id: 1.into(),
            format: VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM.into(),
            width: 1920.into(),
            height: 1080.into(),
        };
        let unknown_hdr = new_hdr(0xdead);

        let chain1 = TestingDescChainArgs {
            readable_desc_bufs: &[hdr.as_slice(), cmd.as_slice()],
            writable_desc_lengths: &[RESP_SIZE],
        };
        let chain2 = TestingDescChainArgs {
            readable_desc_bufs: &[hdr.as_slice(), cmd.as_slice()],
            writable_desc_lengths: &[RESP_SIZE],
        };
        let chain3 = TestingDescChainArgs {
            readable_desc_bufs: &[unknown_hdr.as_slice()],
            writable_desc_lengths: &[RESP_SIZE],
        };

        let (control_vring, outputs, control_signal_used_queue_evt) =
            create_control_vring(&mem, &[chain1, chain2, chain3]);
        let (cursor_vring, _, cursor_signal_used_queue_evt) = create_cursor_vring(&mem, &[]);

        let mut mock_gpu = MockRenderer::new();
        let seq = &mut mockall::Sequence::new();

        mock_gpu
            .expect_force_ctx_0()
            .return_const(())
            .once()
            .in_sequence(seq);
        mock_gpu
            .expect_resource_create_2d()
            .with(
                predicate::eq(1),
                predicate::eq(VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM),
                predicate::eq(1920),
                predicate::eq(1080),
            )
            .returning(|_, _, _, _| Ok(OkNoData))
            .once()
            .in_sequence(seq);
        mock_gpu
            .expect_force_ctx_0()
            .return_const(())
            .once()
            .in_sequence(seq);
        mock_gpu
            .expect_resource_create_2d()
            .returning(|_, _, _, _| Err(ErrUnspec))
            .once()
            .in_sequence(seq);
        mock_gpu.expect_frontend_ack_fd().return_const(None::<RawFd>);

        backend_inner
            .handle_event(0, &mut mock_gpu, &[control_vring, cursor_vring])
            .unwrap();

        control_signal_used_queue_evt
            .read()
            .expect("Expected device to signal used queue!");
        assert_eq!(
            cursor_signal_used_queue_evt.read().unwrap_err().kind(),
            ErrorKind::WouldBlock,
            "Unexpected signal_used_queue on cursor queue!"
        );

        let mem = mem.memory();
        let expected = [
            VIRTIO_GPU_RESP_OK_NODATA,
            VIRTIO_GPU_RESP_ERR_UNSPEC,
            VIRTIO_GPU_RESP_ERR_UNSPEC,
        ];
        for (output, expected) in outputs.iter().zip(expected) {
            let result_hdr: virtio_gpu_ctrl_hdr = mem.read_obj(output[0]).unwrap();
            assert_eq!(result_hdr, new_hdr(expected));
        }
    }

    #[test]
    fn test_attach_backing_with_too_many_entries() {
        let (backend, mem) = init();
        let mut backend_inner = backend.inner.lock().unwrap();

        let create_hdr = new_hdr(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D);
        let create = virtio_gpu_resource_create_2d {
            resource_id: 7.into(),
            format: VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM.into(),
            width: 64.into(),
            height: 64.into(),
        };
        let attach_hdr = new_hdr(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING);
        let attach = virtio_gpu_resource_attach_backing {
            resource_id: 7.into(),
            nr_entries: 16385.into(),
        };

        let (control_vring, outputs, _) = create_control_vring(
            &mem,
            &[
                TestingDescChainArgs {
                    readable_desc_bufs: &[create_hdr.as_slice(), create.as_slice()],
                    writable_desc_lengths: &[RESP_SIZE],
                },
                TestingDescChainArgs {
                    readable_desc_bufs: &[attach_hdr.as_slice(), attach.as_slice()],
                    writable_desc_lengths: &[RESP_SIZE],
                },
            ],
        );
        let (cursor_vring, _, _) = create_cursor_vring(&mem, &[]);

        let mut gpu = SoftwareGpu::new(16, 1 << 20, Box::new(mem.clone()), None);
        backend_inner
            .handle_event(0, &mut gpu, &[control_vring, cursor_vring])
            .unwrap();

        let mem = mem.memory();
        let created: virtio_gpu_ctrl_hdr = mem.read_obj(outputs[0][0]).unwrap();
        assert_eq!(created, new_hdr(VIRTIO_GPU_RESP_OK_NODATA));
        let attached: virtio_gpu_ctrl_hdr = mem.read_obj(outputs[1][0]).unwrap();
        assert_eq!(attached, new_hdr(VIRTIO_GPU_RESP_ERR_UNSPEC));
    }

    #[test]
    fn test_command_with_fence_ready_immediately() {
        const FENCE_ID: u64 = 123;

        let (backend, mem) = init();
        let mut backend_inner = backend.inner.lock().unwrap();

        let hdr = virtio_gpu_ctrl_hdr {
            type_: VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D.into(),
            flags: VIRTIO_GPU_FLAG_FENCE.into(),
            fence_id: FENCE_ID.into(),
            ctx_id: 0.into(),
            ring_idx: 0,
            padding: Default::default(),
        };

        let cmd = virtio_gpu_transfer_host_3d::default();

        let chain = TestingDescChainArgs {
            readable_desc_bufs: &[hdr.as_slice(), cmd.as_slice()],
            writable_desc_lengths: &[RESP_SIZE],
        };

        let (control_vring, outputs, control_signal_used_queue_evt) =
            create_control_vring(&mem, &[chain]);
        let (cursor_vring, _, _) = create_cursor_vring(&mem, &[]);

        let mut mock_gpu = MockRenderer::new();
        let seq = &mut mockall::Sequence::new();

        mock_gpu
            .expect_force_ctx_0()
            .return_const(())
            .once()
            .in_sequence(seq);
        mock_gpu
            .expect_transfer_write()
            .returning(|_, _, _| Ok(OkNoData))
            .once()
            .in_sequence(seq);
        mock_gpu
            .expect_create_fence()
            .withf(|fence| fence.fence_id == FENCE_ID)
            .returning(|_| Ok(OkNoData))
            .once()
            .in_sequence(seq);
        mock_gpu.expect_async_fences().return_const(false);
        mock_gpu.expect_frontend_ack_fd().return_const(None::<RawFd>);

        backend_inner
            .handle_event(0, &mut mock_gpu, &[control_vring, cursor_vring])
            .unwrap();

        let expected_hdr = virtio_gpu_ctrl_hdr {
            type_: VIRTIO_GPU_RESP_OK_NODATA.into(),
            flags: VIRTIO_GPU_FLAG_FENCE.into(),
            fence_id: FENCE_ID.into(),
            ctx_id: 0.into(),
            ring_idx: 0,
            padding: Default::default(),
        };

        control_signal_used_queue_evt
            .read()
            .expect("Expected device to call signal_used_queue!");
        assert!(backend_inner.fences.is_empty());

        let result_hdr1: virtio_gpu_ctrl_hdr = mem.memory().read_obj(outputs[0][0]).unwrap();
        assert_eq!(result_hdr1, expected_hdr);
    }

    #[test]
    fn test_command_with_fence_not_ready() {
        const FENCE_ID: u64 = 123;
        const CTX_ID: u32 = 1;
        const RING_IDX: u8 = 2;

        let (backend, mem) = init();
        let mut backend_inner = backend.inner.lock().unwrap();

        let hdr = virtio_gpu_ctrl_hdr {
            type_: VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D.into(),
            flags: (VIRTIO_GPU_FLAG_FENCE | VIRTIO_GPU_FLAG_INFO_RING_IDX).into(),
            fence_id: FENCE_ID.into(),
            ctx_id: CTX_ID.into(),
            ring_idx: RING_IDX,
            padding: Default::default(),
        };

        let cmd = virtio_gpu_transfer_host_3d::default();

        let chain = TestingDescChainArgs {
            readable_desc_bufs: &[hdr.as_slice(), cmd.as_slice()],
            writable_desc_lengths: &[RESP_SIZE],
        };

        let (control_vring, outputs, control_signal_used_queue_evt) =
            create_control_vring(&mem, &[chain]);
        let (cursor_vring, _, _) = create_cursor_vring(&mem, &[]);
        let vrings = [control_vring, cursor_vring];

        let mut mock_gpu = MockRenderer::new();
        mock_gpu.expect_force_ctx_0().return_const(());
        mock_gpu
            .expect_transfer_read()
            .with(
                predicate::eq(CTX_ID),
                predicate::always(),
                predicate::always(),
            )
            .returning(|_, _, _| Ok(OkNoData))
            .once();
        mock_gpu
            .expect_create_fence()
            .withf(|fence| fence.fence_id == FENCE_ID && fence.ring_idx == RING_IDX)
            .returning(|_| Ok(OkNoData))
            .once();
        mock_gpu.expect_async_fences().return_const(true);
        mock_gpu.expect_frontend_ack_fd().return_const(None::<RawFd>);

        backend_inner
            .handle_event(0, &mut mock_gpu, &vrings)
            .unwrap();

        assert_eq!(
            control_signal_used_queue_evt.read().unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
        let ring = VirtioGpuRing::ContextSpecific {
            ctx_id: CTX_ID,
            ring_idx: RING_IDX,
        };
        assert_eq!(backend_inner.fences.len(), 1);

        // A fence on another ring completes nothing.
        backend_inner.fence_mailbox.post(VirtioGpuRing::Global, FENCE_ID);
        backend_inner
            .handle_event(FENCE_EVENT, &mut mock_gpu, &vrings)
            .unwrap();
        assert_eq!(backend_inner.fences.len(), 1);

        backend_inner.fence_mailbox.post(ring, FENCE_ID);
        backend_inner
            .handle_event(FENCE_EVENT, &mut mock_gpu, &vrings)
            .unwrap();
        assert!(backend_inner.fences.is_empty());
        control_signal_used_queue_evt
            .read()
            .expect("Expected the fenced command to be returned");

        let result_hdr: virtio_gpu_ctrl_hdr = mem.memory().read_obj(outputs[0][0]).unwrap();
        assert_eq!(result_hdr.type_, Le32::from(VIRTIO_GPU_RESP_OK_NODATA));
        assert_eq!(result_hdr.fence_id, vm_memory::Le64::from(FENCE_ID));
        assert_eq!(result_hdr.ring_idx, RING_IDX);
        assert_eq!(
            vrings[0].get_ref().get_queue().next_used(),
            1,
            "the fenced command must be returned exactly once"
        );
    }

    #[test]
    fn test_suspend_until_display_acknowledges() {
        const ACK_FD: RawFd = 42;

        let (backend, mem) = init();
        let mut backend_inner = backend.inner.lock().unwrap();

        let hdr = new_hdr(VIRTIO_GPU_CMD_RESOURCE_FLUSH);
        let cmd = virtio_gpu_resource_flush {
            resource_id: 1.into(),
            ..Default::default()
        };
        let bufs = [hdr.as_slice(), cmd.as_slice()];
        let chain = || TestingDescChainArgs {
            readable_desc_bufs: &bufs,
            writable_desc_lengths: &[RESP_SIZE],
        };
        let (control_vring, _, control_signal_used_queue_evt) =
            create_control_vring(&mem, &[chain(), chain()]);
        let (cursor_vring, _, _) = create_cursor_vring(&mem, &[]);
        let vrings = [control_vring, cursor_vring];

        let mut mock_gpu = MockRenderer::new();
        mock_gpu.expect_force_ctx_0().return_const(());
        mock_gpu
            .expect_flush_resource()
            .returning(|_, _| Ok(OkNoData))
            .times(2);
        // Only the first flush leaves an acknowledgement outstanding.
        let mut flushes = 0;
        mock_gpu.expect_frontend_ack_fd().returning(move || {
            flushes += 1;
            (flushes == 1).then_some(ACK_FD)
        });
        let mut acks = 0;
        mock_gpu.expect_process_frontend_ack().returning(move || {
            acks += 1;
            acks == 2
        });

        backend_inner
            .handle_event(CONTROL_QUEUE, &mut mock_gpu, &vrings)
            .unwrap();
        control_signal_used_queue_evt.read().unwrap();
        assert_eq!(vrings[0].get_ref().get_queue().next_used(), 1);
        assert_eq!(
            backend_inner.dispatch,
            DispatchState::Suspended { ack_fd: ACK_FD }
        );
        assert_eq!(
            mem::take(&mut backend_inner.listener_changes),
            vec![ListenerChange::Register {
                fd: ACK_FD,
                event: FRONTEND_EVENT
            }]
        );

        // Kicks are ignored while suspended.
        backend_inner
            .handle_event(CONTROL_QUEUE, &mut mock_gpu, &vrings)
            .unwrap();
        assert_eq!(vrings[0].get_ref().get_queue().next_used(), 1);

        // The first readiness does not complete the acknowledgement yet.
        backend_inner
            .handle_event(FRONTEND_EVENT, &mut mock_gpu, &vrings)
            .unwrap();
        assert_eq!(vrings[0].get_ref().get_queue().next_used(), 1);

        backend_inner
            .handle_event(FRONTEND_EVENT, &mut mock_gpu, &vrings)
            .unwrap();
        assert_eq!(backend_inner.dispatch, DispatchState::Running);
        assert_eq!(vrings[0].get_ref().get_queue().next_used(), 2);
        assert_eq!(
            backend_inner.listener_changes,
            vec![ListenerChange::Unregister {
                fd: ACK_FD,
                event: FRONTEND_EVENT
            }]
        );
        control_signal_used_queue_evt.read().unwrap();
    }

    #[test]
    fn test_reset_after_features_acked() {
        let (backend, mem) = init();
        backend.acked_features(0);
        let mut backend_inner = backend.inner.lock().unwrap();
        backend_inner.dispatch = DispatchState::Suspended { ack_fd: 7 };

        let (control_vring, _, _) = create_control_vring(&mem, &[]);
        let (cursor_vring, _, _) = create_cursor_vring(&mem, &[]);

        let mut mock_gpu = MockRenderer::new();
        mock_gpu.expect_reset().return_const(()).once();

        backend_inner
            .handle_event(CURSOR_QUEUE, &mut mock_gpu, &[control_vring, cursor_vring])
            .unwrap();
        assert!(!backend_inner.reset_pending);
        assert_eq!(backend_inner.dispatch, DispatchState::Running);
        assert_eq!(
            backend_inner.listener_changes,
            vec![ListenerChange::Unregister {
                fd: 7,
                event: FRONTEND_EVENT
            }]
        );
    }

    #[test]
    fn test_display_info_after_channel_failure() {
        let (backend, mem) = init();
        // The display goes away right after the handshake.
        let (channel, display) = fake_display::spawn(GpuProtocolFeatures::empty(), |_| ());
        display.join().unwrap();
        backend.set_frontend(Box::new(channel));

        let config = backend.get_config(0, 4);
        assert_eq!(config, VIRTIO_GPU_EVENT_DISPLAY.to_le_bytes());

        let mut backend_inner = backend.inner.lock().unwrap();
        let hdr = new_hdr(VIRTIO_GPU_CMD_GET_DISPLAY_INFO);
        let (control_vring, outputs, _) = create_control_vring(
            &mem,
            &[TestingDescChainArgs {
                readable_desc_bufs: &[hdr.as_slice()],
                writable_desc_lengths: &[size_of::<virtio_gpu_resp_display_info>() as u32],
            }],
        );
        let (cursor_vring, _, _) = create_cursor_vring(&mem, &[]);

        let mut gpu = SoftwareGpu::new(16, 1 << 20, Box::new(mem.clone()), None);
        backend_inner
            .handle_event(0, &mut gpu, &[control_vring, cursor_vring])
            .unwrap();

        let info: virtio_gpu_resp_display_info = mem.memory().read_obj(outputs[0][0]).unwrap();
        assert_eq!(info.hdr.type_, Le32::from(VIRTIO_GPU_RESP_OK_DISPLAY_INFO));
        assert!(info
            .pmodes
            .iter()
            .all(|display| u32::from(display.enabled) == 0));
    }

    #[test]
    fn test_config_space() {
        let (backend, _) = init();
        let mut cfg = VirtioGpuConfig::default();

        let num_scanouts = backend.get_config(8, 4);
        assert_eq!(num_scanouts, 16u32.to_le_bytes());
        assert_eq!(
            backend.get_config(0, size_of_val(&cfg) as u32 + 1),
            Vec::<u8>::new()
        );

        backend.inner.lock().unwrap().virtio_cfg.events_read = 0b11.into();
        backend.set_config(4, &1u32.to_le_bytes()).unwrap();
        let cfg_bytes = backend.get_config(0, size_of_val(&cfg) as u32);
        cfg.as_mut_slice().copy_from_slice(&cfg_bytes);
        assert_eq!(u32::from(cfg.events_read), 0b10);
        assert_eq!(u32::from(cfg.events_clear), 0);

        assert_eq!(
            backend.set_config(14, &[0; 4]).unwrap_err().kind(),
            io::ErrorKind::Other
        );
    }

    rusty_fork_test! {
        #[test]
        fn test_verify_backend() {
            let gpu_config = GpuConfigBuilder::default().build().unwrap();
            let backend = VhostUserGpuBackend::new(gpu_config).unwrap();

            assert_eq!(backend.num_queues(), NUM_QUEUES);
            assert_eq!(backend.max_queue_size(), QUEUE_SIZE);
            assert_eq!(backend.features(), 0x0101_7100_0002);
            assert_eq!(
                backend.protocol_features(),
                VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::MQ
            );
            assert_eq!(backend.queues_per_thread(), vec![0xffff_ffff]);
            assert_eq!(backend.get_config(0, 0), Vec::<u8>::new());

            backend.set_event_idx(true);
            assert!(backend.inner.lock().unwrap().event_idx_enabled);

            assert!(backend.exit_event(0).is_some());

            let mem = GuestMemoryAtomic::new(
                GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
            );
            let daemon = VhostUserDaemon::new(
                "vhost-user-gpu-test".to_string(),
                backend.clone(),
                mem.clone(),
            )
            .unwrap();
            backend.set_epoll_handler(&daemon.get_epoll_handlers());
            backend.update_memory(mem.clone()).unwrap();

            let vring = VringRwLock::new(mem, 0x1000).unwrap();
            vring.set_queue_info(0x100, 0x200, 0x300).unwrap();
            vring.set_queue_ready(true);

            assert_eq!(
                backend
                    .handle_event(0, EventSet::OUT, &[vring.clone()], 0)
                    .unwrap_err()
                    .kind(),
                io::ErrorKind::Other
            );

            assert_eq!(
                backend
                    .handle_event(1, EventSet::IN, &[vring.clone()], 0)
                    .unwrap_err()
                    .kind(),
                io::ErrorKind::Other
            );

            // Hit the loop part
            backend.set_event_idx(true);
            backend
                .handle_event(0, EventSet::IN, &[vring.clone()], 0)
                .unwrap();

            // Hit the non-loop part
            backend.set_event_idx(false);
            backend.handle_event(0, EventSet::IN, &[vring], 0).unwrap();
        }
    }

    #[test]
    #[cfg(feature = "backend-virgl")]
    fn test_verify_accelerated_features() {
        let gpu_config = GpuConfigBuilder::default()
            .set_gpu_mode(GpuMode::VirglRenderer)
            .build()
            .unwrap();
        let backend = VhostUserGpuBackend::new(gpu_config).unwrap();
        assert_eq!(backend.features(), 0x0101_7100_0013);
        assert_eq!(backend.get_config(12, 4), 2u32.to_le_bytes());
    }
}

// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The side channel to the display process.
//!
//! Scanout, update and cursor state is forwarded to a separate process that
//! owns the actual display. The channel can either be set up by the
//! vhost-user frontend (`VHOST_USER_GPU_SET_SOCKET`), in which case the
//! `vhost` crate's [`GpuBackend`] speaks the protocol, or be connected directly
//! to a display socket through [`FrontendChannel`].

pub mod channel;
pub mod message;

use std::{
    io,
    os::fd::{BorrowedFd, RawFd},
};

use log::{debug, error};
use vhost::vhost_user::{
    gpu_message::{
        VhostUserGpuCursorPos, VhostUserGpuCursorUpdate, VhostUserGpuEdidRequest,
        VhostUserGpuScanout, VhostUserGpuUpdate,
    },
    GpuBackend,
};

pub use self::channel::FrontendChannel;
use self::message::{
    CursorPos, CursorUpdate, DmabufScanoutMsg, EdidRequest, ScanoutMsg, UpdateMsg,
    CURSOR_DATA_SIZE,
};
use crate::protocol::{
    virtio_gpu_display_one, virtio_gpu_resp_display_info, virtio_gpu_resp_edid,
    EDID_BLOB_MAX_SIZE,
};

/// A display process reachable over the side channel.
///
/// Every call either completes the exchange or fails; the caller treats any
/// failure as the channel being gone.
#[cfg_attr(test, mockall::automock)]
// We need to specify some lifetimes explicitly, for mockall::automock attribute to compile
#[allow(clippy::needless_lifetimes)]
pub trait GpuFrontend {
    fn get_display_info(&mut self) -> io::Result<virtio_gpu_resp_display_info>;
    fn get_edid(&mut self, req: &EdidRequest) -> io::Result<virtio_gpu_resp_edid>;
    fn set_scanout(&mut self, msg: &ScanoutMsg) -> io::Result<()>;
    fn update_scanout(&mut self, msg: &UpdateMsg, data: &[u8]) -> io::Result<()>;
    fn set_dmabuf_scanout<'a>(
        &mut self,
        msg: &DmabufScanoutMsg,
        fd: BorrowedFd<'a>,
    ) -> io::Result<()>;
    /// Announces new content of a DMA-buf scanout. The display process
    /// acknowledges it later, see `recv_dmabuf_update_ack`.
    fn update_dmabuf_scanout(&mut self, msg: &UpdateMsg) -> io::Result<()>;
    /// Reads one acknowledgement of a `update_dmabuf_scanout`.
    fn recv_dmabuf_update_ack(&mut self) -> io::Result<()>;
    fn cursor_pos(&mut self, pos: &CursorPos) -> io::Result<()>;
    fn cursor_pos_hide(&mut self, pos: &CursorPos) -> io::Result<()>;
    fn cursor_update(
        &mut self,
        update: &CursorUpdate,
        data: &[u8; CURSOR_DATA_SIZE],
    ) -> io::Result<()>;
    fn supports_edid(&self) -> bool;
    fn supports_dmabuf(&self) -> bool;
    /// The descriptor that becomes readable when an acknowledgement arrives.
    fn ack_fd(&self) -> Option<RawFd>;
}

fn backend_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// The channel handed over by the vhost-user frontend. DMA-buf scanouts are
/// not offered through it.
impl GpuFrontend for GpuBackend {
    fn get_display_info(&mut self) -> io::Result<virtio_gpu_resp_display_info> {
        let info = GpuBackend::get_display_info(self).map_err(backend_error)?;
        let mut resp = virtio_gpu_resp_display_info::default();
        for (one, mode) in resp.pmodes.iter_mut().zip(info.pmodes.iter()) {
            *one = virtio_gpu_display_one {
                enabled: mode.enabled.into(),
                ..Default::default()
            };
            one.r.width = mode.r.width.into();
            one.r.height = mode.r.height.into();
        }
        Ok(resp)
    }

    fn get_edid(&mut self, req: &EdidRequest) -> io::Result<virtio_gpu_resp_edid> {
        let edid = GpuBackend::get_edid(
            self,
            &VhostUserGpuEdidRequest {
                scanout_id: req.scanout_id.into(),
            },
        )
        .map_err(backend_error)?;
        let size = (edid.size as usize).min(EDID_BLOB_MAX_SIZE).min(edid.edid.len());
        let mut resp = virtio_gpu_resp_edid {
            hdr: Default::default(),
            size: (size as u32).into(),
            padding: 0.into(),
            edid: [0; EDID_BLOB_MAX_SIZE],
        };
        resp.edid[..size].copy_from_slice(&edid.edid[..size]);
        Ok(resp)
    }

    fn set_scanout(&mut self, msg: &ScanoutMsg) -> io::Result<()> {
        GpuBackend::set_scanout(
            self,
            &VhostUserGpuScanout {
                scanout_id: msg.scanout_id.into(),
                width: msg.width.into(),
                height: msg.height.into(),
            },
        )
        .map_err(backend_error)
    }

    fn update_scanout(&mut self, msg: &UpdateMsg, data: &[u8]) -> io::Result<()> {
        GpuBackend::update_scanout(
            self,
            &VhostUserGpuUpdate {
                scanout_id: msg.scanout_id.into(),
                x: msg.x.into(),
                y: msg.y.into(),
                width: msg.width.into(),
                height: msg.height.into(),
            },
            data,
        )
        .map_err(backend_error)
    }

    fn set_dmabuf_scanout<'a>(
        &mut self,
        _msg: &DmabufScanoutMsg,
        _fd: BorrowedFd<'a>,
    ) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn update_dmabuf_scanout(&mut self, _msg: &UpdateMsg) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn recv_dmabuf_update_ack(&mut self) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn cursor_pos(&mut self, pos: &CursorPos) -> io::Result<()> {
        GpuBackend::cursor_pos(self, &to_backend_pos(pos)).map_err(backend_error)
    }

    fn cursor_pos_hide(&mut self, pos: &CursorPos) -> io::Result<()> {
        GpuBackend::cursor_pos_hide(self, &to_backend_pos(pos)).map_err(backend_error)
    }

    fn cursor_update(
        &mut self,
        update: &CursorUpdate,
        data: &[u8; CURSOR_DATA_SIZE],
    ) -> io::Result<()> {
        let cursor_update = VhostUserGpuCursorUpdate {
            pos: to_backend_pos(&update.pos),
            hot_x: update.hot_x.into(),
            hot_y: update.hot_y.into(),
        };
        GpuBackend::cursor_update(self, &cursor_update, data).map_err(backend_error)
    }

    fn supports_edid(&self) -> bool {
        true
    }

    fn supports_dmabuf(&self) -> bool {
        false
    }

    fn ack_fd(&self) -> Option<RawFd> {
        None
    }
}

fn to_backend_pos(pos: &CursorPos) -> VhostUserGpuCursorPos {
    VhostUserGpuCursorPos {
        scanout_id: pos.scanout_id.into(),
        x: pos.x.into(),
        y: pos.y.into(),
    }
}

/// The display process as seen by a renderer: possibly absent, and dropped
/// for good after the first failure.
#[derive(Default)]
pub struct FrontendLink {
    frontend: Option<Box<dyn GpuFrontend>>,
    pending_acks: usize,
}

impl FrontendLink {
    pub fn attach(&mut self, frontend: Box<dyn GpuFrontend>) {
        debug!("Display channel attached");
        self.frontend = Some(frontend);
        self.pending_acks = 0;
    }

    pub fn is_connected(&self) -> bool {
        self.frontend.is_some()
    }

    pub fn supports_dmabuf(&self) -> bool {
        self.frontend.as_ref().is_some_and(|f| f.supports_dmabuf())
    }

    pub fn supports_edid(&self) -> bool {
        self.frontend.as_ref().is_some_and(|f| f.supports_edid())
    }

    /// Runs `op` against the frontend. Returns `None` when there is no
    /// frontend or the exchange failed; a failure disconnects the link.
    fn run<T>(
        &mut self,
        what: &str,
        op: impl FnOnce(&mut dyn GpuFrontend) -> io::Result<T>,
    ) -> Option<T> {
        let frontend = self.frontend.as_mut()?;
        match op(frontend.as_mut()) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Display channel failed on {what}, disconnecting: {e}");
                self.frontend = None;
                self.pending_acks = 0;
                None
            }
        }
    }

    pub fn get_display_info(&mut self) -> Option<virtio_gpu_resp_display_info> {
        self.run("get_display_info", |f| f.get_display_info())
    }

    pub fn get_edid(&mut self, scanout_id: u32) -> Option<virtio_gpu_resp_edid> {
        let req = EdidRequest {
            scanout_id: scanout_id.into(),
        };
        self.run("get_edid", |f| f.get_edid(&req))
    }

    pub fn set_scanout(&mut self, msg: &ScanoutMsg) {
        self.run("set_scanout", |f| f.set_scanout(msg));
    }

    pub fn update_scanout(&mut self, msg: &UpdateMsg, data: &[u8]) {
        self.run("update_scanout", |f| f.update_scanout(msg, data));
    }

    pub fn set_dmabuf_scanout(&mut self, msg: &DmabufScanoutMsg, fd: BorrowedFd<'_>) {
        self.run("set_dmabuf_scanout", |f| f.set_dmabuf_scanout(msg, fd));
    }

    /// Sends a DMA-buf update and records that an acknowledgement is owed.
    pub fn update_dmabuf_scanout(&mut self, msg: &UpdateMsg) {
        if self
            .run("update_dmabuf_scanout", |f| f.update_dmabuf_scanout(msg))
            .is_some()
        {
            self.pending_acks += 1;
        }
    }

    pub fn cursor_pos(&mut self, pos: &CursorPos) {
        self.run("cursor_pos", |f| f.cursor_pos(pos));
    }

    pub fn cursor_pos_hide(&mut self, pos: &CursorPos) {
        self.run("cursor_pos_hide", |f| f.cursor_pos_hide(pos));
    }

    pub fn cursor_update(&mut self, update: &CursorUpdate, data: &[u8; CURSOR_DATA_SIZE]) {
        self.run("cursor_update", |f| f.cursor_update(update, data));
    }

    pub const fn pending_acks(&self) -> usize {
        self.pending_acks
    }

    /// The descriptor to watch while acknowledgements are owed.
    pub fn ack_fd(&self) -> Option<RawFd> {
        if self.pending_acks == 0 {
            return None;
        }
        self.frontend.as_ref().and_then(|f| f.ack_fd())
    }

    /// Consumes one acknowledgement. Returns `true` once nothing is owed any
    /// more, which includes the link going down.
    pub fn process_ack(&mut self) -> bool {
        if self.pending_acks > 0
            && self
                .run("dmabuf_update_ack", |f| f.recv_dmabuf_update_ack())
                .is_some()
        {
            self.pending_acks -= 1;
        }
        self.pending_acks == 0
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use mockall::Sequence;

    use super::*;

    #[test]
    fn test_disconnected_link_is_silent() {
        let mut link = FrontendLink::default();
        assert!(!link.is_connected());
        assert!(link.get_display_info().is_none());
        link.set_scanout(&ScanoutMsg::default());
        link.update_dmabuf_scanout(&UpdateMsg::default());
        assert_eq!(link.pending_acks(), 0);
        assert!(link.process_ack());
    }

    #[test]
    fn test_failure_disconnects() {
        let mut frontend = MockGpuFrontend::new();
        frontend
            .expect_set_scanout()
            .times(1)
            .returning(|_| Err(io::ErrorKind::BrokenPipe.into()));
        let mut link = FrontendLink::default();
        link.attach(Box::new(frontend));

        link.set_scanout(&ScanoutMsg::default());
        assert!(!link.is_connected());
        // The mock would panic on a second call.
        link.set_scanout(&ScanoutMsg::default());
    }

    #[test]
    fn test_ack_accounting() {
        let mut seq = Sequence::new();
        let mut frontend = MockGpuFrontend::new();
        frontend
            .expect_update_dmabuf_scanout()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        frontend
            .expect_recv_dmabuf_update_ack()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        frontend.expect_ack_fd().return_const(Some(42));

        let mut link = FrontendLink::default();
        link.attach(Box::new(frontend));
        assert_eq!(link.ack_fd(), None);

        link.update_dmabuf_scanout(&UpdateMsg::default());
        link.update_dmabuf_scanout(&UpdateMsg::default());
        assert_eq!(link.pending_acks(), 2);
        assert_eq!(link.ack_fd(), Some(42));

        assert!(!link.process_ack());
        assert!(link.process_ack());
        assert_eq!(link.ack_fd(), None);
    }

    #[test]
    fn test_failed_ack_resumes() {
        let mut frontend = MockGpuFrontend::new();
        frontend
            .expect_update_dmabuf_scanout()
            .returning(|_| Ok(()));
        frontend
            .expect_recv_dmabuf_update_ack()
            .returning(|| Err(io::ErrorKind::UnexpectedEof.into()));

        let mut link = FrontendLink::default();
        link.attach(Box::new(frontend));
        link.update_dmabuf_scanout(&UpdateMsg::default());
        assert!(link.process_ack());
        assert!(!link.is_connected());
    }

    #[test]
    fn test_dmabuf_scanout_passes_fd() {
        let file = tempfile::tempfile().unwrap();
        let mut frontend = MockGpuFrontend::new();
        frontend
            .expect_set_dmabuf_scanout()
            .withf(|msg, _| u32::from(msg.scanout_id) == 3)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut link = FrontendLink::default();
        link.attach(Box::new(frontend));
        link.set_dmabuf_scanout(
            &DmabufScanoutMsg {
                scanout_id: 3.into(),
                ..Default::default()
            },
            file.as_fd(),
        );
        assert!(link.is_connected());
    }
}

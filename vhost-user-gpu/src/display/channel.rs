// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    io::{self, Read, Write},
    mem::size_of,
    os::{
        fd::{AsRawFd, BorrowedFd, RawFd},
        unix::net::UnixStream,
    },
    path::Path,
};

use log::{debug, info, trace};
use vm_memory::ByteValued;
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

use super::{
    message::{
        CursorPos, CursorUpdate, DmabufScanoutMsg, EdidRequest, GpuProtocolFeatures, GpuRequest,
        MessageHeader, ScanoutMsg, UpdateMsg, CURSOR_DATA_SIZE,
    },
    GpuFrontend,
};
use crate::protocol::{virtio_gpu_resp_display_info, virtio_gpu_resp_edid};

fn protocol_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// A connection to the display process that frames messages itself and can
/// hand over DMA-buf descriptors.
#[derive(Debug)]
pub struct FrontendChannel {
    stream: UnixStream,
    features: GpuProtocolFeatures,
}

impl FrontendChannel {
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        info!("Connected to display at {}", path.as_ref().display());
        Self::new(stream)
    }

    /// Takes over `stream` and agrees on the optional protocol features.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        let mut channel = Self {
            stream,
            features: GpuProtocolFeatures::empty(),
        };
        let offered = channel.sync_request::<u64>(GpuRequest::GetProtocolFeatures, &[])?;
        let features = GpuProtocolFeatures::from_bits_truncate(offered) & GpuProtocolFeatures::EDID;
        channel.send(
            GpuRequest::SetProtocolFeatures,
            &[features.bits().as_slice()],
            None,
        )?;
        debug!("Display protocol features: {features:?}");
        channel.features = features;
        Ok(channel)
    }

    pub const fn features(&self) -> GpuProtocolFeatures {
        self.features
    }

    fn send(
        &mut self,
        request: GpuRequest,
        payload: &[&[u8]],
        fd: Option<BorrowedFd<'_>>,
    ) -> io::Result<()> {
        let size = payload.iter().map(|p| p.len()).sum();
        let hdr = MessageHeader::new(request, size);
        let mut frame = Vec::with_capacity(size_of::<MessageHeader>() + size);
        frame.extend_from_slice(hdr.as_slice());
        for part in payload {
            frame.extend_from_slice(part);
        }
        trace!("Sending {request} ({size} bytes)");

        let mut sent = 0;
        if let Some(fd) = fd {
            sent = self
                .stream
                .send_with_fd(&frame[..], fd.as_raw_fd())
                .map_err(|e| io::Error::from_raw_os_error(e.errno()))?;
        }
        self.stream.write_all(&frame[sent..])
    }

    fn recv_header(&mut self) -> io::Result<MessageHeader> {
        let mut hdr = MessageHeader::default();
        self.stream.read_exact(hdr.as_mut_slice())?;
        Ok(hdr)
    }

    /// Reads the header of a reply to `request` carrying exactly `size` bytes.
    fn recv_reply_header(&mut self, request: GpuRequest, size: usize) -> io::Result<()> {
        let hdr = self.recv_header()?;
        let code = u32::from(hdr.request);
        if code != request as u32 {
            return Err(protocol_error(format!(
                "expected a reply to {request}, got request {code}"
            )));
        }
        if !hdr.is_reply() {
            return Err(protocol_error(format!("{request} reply lacks the reply flag")));
        }
        let len = u32::from(hdr.size) as usize;
        if len != size {
            return Err(protocol_error(format!(
                "{request} reply has {len} bytes, expected {size}"
            )));
        }
        Ok(())
    }

    fn sync_request<T: ByteValued + Default>(
        &mut self,
        request: GpuRequest,
        payload: &[&[u8]],
    ) -> io::Result<T> {
        self.send(request, payload, None)?;
        self.recv_reply_header(request, size_of::<T>())?;
        let mut reply = T::default();
        self.stream.read_exact(reply.as_mut_slice())?;
        Ok(reply)
    }
}

impl GpuFrontend for FrontendChannel {
    fn get_display_info(&mut self) -> io::Result<virtio_gpu_resp_display_info> {
        self.sync_request(GpuRequest::GetDisplayInfo, &[])
    }

    fn get_edid(&mut self, req: &EdidRequest) -> io::Result<virtio_gpu_resp_edid> {
        self.sync_request(GpuRequest::GetEdid, &[req.as_slice()])
    }

    fn set_scanout(&mut self, msg: &ScanoutMsg) -> io::Result<()> {
        self.send(GpuRequest::Scanout, &[msg.as_slice()], None)
    }

    fn update_scanout(&mut self, msg: &UpdateMsg, data: &[u8]) -> io::Result<()> {
        self.send(GpuRequest::Update, &[msg.as_slice(), data], None)
    }

    fn set_dmabuf_scanout<'a>(
        &mut self,
        msg: &DmabufScanoutMsg,
        fd: BorrowedFd<'a>,
    ) -> io::Result<()> {
        self.send(GpuRequest::DmabufScanout, &[msg.as_slice()], Some(fd))
    }

    fn update_dmabuf_scanout(&mut self, msg: &UpdateMsg) -> io::Result<()> {
        self.send(GpuRequest::DmabufUpdate, &[msg.as_slice()], None)
    }

    fn recv_dmabuf_update_ack(&mut self) -> io::Result<()> {
        self.recv_reply_header(GpuRequest::DmabufUpdate, 0)
    }

    fn cursor_pos(&mut self, pos: &CursorPos) -> io::Result<()> {
        self.send(GpuRequest::CursorPos, &[pos.as_slice()], None)
    }

    fn cursor_pos_hide(&mut self, pos: &CursorPos) -> io::Result<()> {
        self.send(GpuRequest::CursorPosHide, &[pos.as_slice()], None)
    }

    fn cursor_update(
        &mut self,
        update: &CursorUpdate,
        data: &[u8; CURSOR_DATA_SIZE],
    ) -> io::Result<()> {
        self.send(GpuRequest::CursorUpdate, &[update.as_slice(), data], None)
    }

    fn supports_edid(&self) -> bool {
        self.features.contains(GpuProtocolFeatures::EDID)
    }

    fn supports_dmabuf(&self) -> bool {
        true
    }

    fn ack_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

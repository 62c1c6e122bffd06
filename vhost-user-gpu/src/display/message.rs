// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Frames exchanged with the display process.
//!
//! A frame is a 12 byte little endian header followed by `size` bytes of a
//! request specific payload. All fields are little endian.

use std::fmt;

use bitflags::bitflags;
use vm_memory::{ByteValued, Le32};

/// Set on frames that answer a request.
pub const VHOST_USER_GPU_MSG_FLAG_REPLY: u32 = 0x4;

pub const CURSOR_WIDTH: u32 = 64;
pub const CURSOR_HEIGHT: u32 = 64;
/// Size of the cursor image carried by a cursor update, 64x64 at 32 bpp.
pub const CURSOR_DATA_SIZE: usize = (CURSOR_WIDTH * CURSOR_HEIGHT * 4) as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum GpuRequest {
    GetProtocolFeatures = 1,
    SetProtocolFeatures = 2,
    GetDisplayInfo = 3,
    CursorPos = 4,
    CursorPosHide = 5,
    CursorUpdate = 6,
    Scanout = 7,
    Update = 8,
    DmabufScanout = 9,
    DmabufUpdate = 10,
    GetEdid = 11,
    DmabufScanout2 = 12,
}

impl TryFrom<u32> for GpuRequest {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::GetProtocolFeatures,
            2 => Self::SetProtocolFeatures,
            3 => Self::GetDisplayInfo,
            4 => Self::CursorPos,
            5 => Self::CursorPosHide,
            6 => Self::CursorUpdate,
            7 => Self::Scanout,
            8 => Self::Update,
            9 => Self::DmabufScanout,
            10 => Self::DmabufUpdate,
            11 => Self::GetEdid,
            12 => Self::DmabufScanout2,
            other => return Err(other),
        })
    }
}

bitflags! {
    /// Optional parts of the display protocol.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GpuProtocolFeatures: u64 {
        const EDID = 1 << 0;
        const DMABUF2 = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MessageHeader {
    pub request: Le32,
    pub flags: Le32,
    pub size: Le32,
}

impl MessageHeader {
    pub fn new(request: GpuRequest, size: usize) -> Self {
        Self {
            request: (request as u32).into(),
            flags: 0.into(),
            size: (size as u32).into(),
        }
    }

    pub fn is_reply(&self) -> bool {
        u32::from(self.flags) & VHOST_USER_GPU_MSG_FLAG_REPLY != 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CursorPos {
    pub scanout_id: Le32,
    pub x: Le32,
    pub y: Le32,
}

/// Followed by `CURSOR_DATA_SIZE` bytes of image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CursorUpdate {
    pub pos: CursorPos,
    pub hot_x: Le32,
    pub hot_y: Le32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ScanoutMsg {
    pub scanout_id: Le32,
    pub width: Le32,
    pub height: Le32,
}

/// Also used as the DMABUF_UPDATE payload, then without trailing pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UpdateMsg {
    pub scanout_id: Le32,
    pub x: Le32,
    pub y: Le32,
    pub width: Le32,
    pub height: Le32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DmabufScanoutMsg {
    pub scanout_id: Le32,
    pub x: Le32,
    pub y: Le32,
    pub width: Le32,
    pub height: Le32,
    pub fd_width: Le32,
    pub fd_height: Le32,
    pub fd_stride: Le32,
    pub fd_flags: Le32,
    pub fd_drm_fourcc: Le32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct EdidRequest {
    pub scanout_id: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for MessageHeader {}
// SAFETY: See above.
unsafe impl ByteValued for CursorPos {}
// SAFETY: See above.
unsafe impl ByteValued for CursorUpdate {}
// SAFETY: See above.
unsafe impl ByteValued for ScanoutMsg {}
// SAFETY: See above.
unsafe impl ByteValued for UpdateMsg {}
// SAFETY: See above.
unsafe impl ByteValued for DmabufScanoutMsg {}
// SAFETY: See above.
unsafe impl ByteValued for EdidRequest {}

impl fmt::Display for GpuRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn test_wire_sizes() {
        assert_eq!(size_of::<MessageHeader>(), 12);
        assert_eq!(size_of::<CursorPos>(), 12);
        assert_eq!(size_of::<CursorUpdate>(), 20);
        assert_eq!(size_of::<ScanoutMsg>(), 12);
        assert_eq!(size_of::<UpdateMsg>(), 20);
        assert_eq!(size_of::<DmabufScanoutMsg>(), 40);
        assert_eq!(CURSOR_DATA_SIZE, 16384);
    }

    #[test]
    fn test_request_codes() {
        for code in 1..=12 {
            assert_eq!(GpuRequest::try_from(code).unwrap() as u32, code);
        }
        assert_eq!(GpuRequest::try_from(0), Err(0));
        assert_eq!(GpuRequest::try_from(13), Err(13));
    }

    #[test]
    fn test_header_reply_flag() {
        let mut hdr = MessageHeader::new(GpuRequest::GetDisplayInfo, 0);
        assert!(!hdr.is_reply());
        hdr.flags = VHOST_USER_GPU_MSG_FLAG_REPLY.into();
        assert!(hdr.is_reply());
    }

    #[test]
    fn test_fields_are_little_endian() {
        let msg = UpdateMsg {
            scanout_id: 1.into(),
            x: 0x0102.into(),
            y: 0.into(),
            width: 0x0a0b_0c0d.into(),
            height: 0.into(),
        };
        let bytes = msg.as_slice();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[2, 1, 0, 0]);
        assert_eq!(&bytes[12..16], &[0x0d, 0x0c, 0x0b, 0x0a]);

        let hdr = MessageHeader::new(GpuRequest::Update, 20);
        assert_eq!(&hdr.as_slice()[0..4], &[8, 0, 0, 0]);
        assert_eq!(&hdr.as_slice()[8..12], &[20, 0, 0, 0]);
    }
}

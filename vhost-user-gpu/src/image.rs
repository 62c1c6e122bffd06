// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Host side pixel storage of software resources.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd},
};

use crate::{
    buffer::{BufferAllocator, HostBuffer},
    gpu_types::Rect,
    protocol::{
        VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM, VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM,
        VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM, VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM,
        VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM, VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM,
        VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM, VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM,
    },
};

const fn fourcc(code: &[u8; 4]) -> u32 {
    code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// The pixel layouts a software resource can be created with.
///
/// virtio names formats by byte order in memory, DRM by bit order in a little
/// endian word, so the names appear reversed between the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    B8G8R8A8,
    B8G8R8X8,
    A8R8G8B8,
    X8R8G8B8,
    R8G8B8A8,
    X8B8G8R8,
    A8B8G8R8,
    R8G8B8X8,
}

impl PixelFormat {
    pub const fn from_virtio(format: u32) -> Option<Self> {
        Some(match format {
            VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM => Self::B8G8R8A8,
            VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM => Self::B8G8R8X8,
            VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM => Self::A8R8G8B8,
            VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM => Self::X8R8G8B8,
            VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM => Self::R8G8B8A8,
            VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM => Self::X8B8G8R8,
            VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM => Self::A8B8G8R8,
            VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM => Self::R8G8B8X8,
            _ => return None,
        })
    }

    pub const fn virtio_format(self) -> u32 {
        match self {
            Self::B8G8R8A8 => VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM,
            Self::B8G8R8X8 => VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM,
            Self::A8R8G8B8 => VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM,
            Self::X8R8G8B8 => VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM,
            Self::R8G8B8A8 => VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM,
            Self::X8B8G8R8 => VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM,
            Self::A8B8G8R8 => VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM,
            Self::R8G8B8X8 => VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM,
        }
    }

    /// Bits per pixel.
    pub const fn bpp(self) -> u32 {
        32
    }

    pub const fn bytes_pp(self) -> u32 {
        self.bpp() / 8
    }

    pub const fn drm_fourcc(self) -> u32 {
        match self {
            Self::B8G8R8A8 => fourcc(b"AR24"),
            Self::B8G8R8X8 => fourcc(b"XR24"),
            Self::A8R8G8B8 => fourcc(b"BA24"),
            Self::X8R8G8B8 => fourcc(b"BX24"),
            Self::R8G8B8A8 => fourcc(b"AB24"),
            Self::X8B8G8R8 => fourcc(b"RX24"),
            Self::A8B8G8R8 => fourcc(b"RA24"),
            Self::R8G8B8X8 => fourcc(b"XB24"),
        }
    }

    /// Row pitch in bytes, rounded up to a multiple of 4.
    pub const fn stride(self, width: u32) -> u64 {
        ((width as u64 * self.bpp() as u64 + 0x1f) >> 5) * 4
    }

    /// Host memory needed for a `width` x `height` image.
    pub const fn hostmem(self, width: u32, height: u32) -> u64 {
        height as u64 * self.stride(width)
    }
}

enum Storage {
    Heap(Vec<u8>),
    Buffer(HostBuffer),
}

/// A 2D image owned by a software resource.
pub struct Image {
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
    storage: Storage,
}

impl Image {
    /// Allocates a zeroed image, from `allocator` when one is given or from the
    /// heap otherwise.
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        allocator: Option<&dyn BufferAllocator>,
    ) -> io::Result<Self> {
        if let Some(allocator) = allocator {
            let buffer = allocator.alloc(width, height, format)?;
            return Ok(Self {
                format,
                width,
                height,
                stride: buffer.stride(),
                storage: Storage::Buffer(buffer),
            });
        }

        let stride = u32::try_from(format.stride(width))
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let size = usize::try_from(format.hostmem(width, height))
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        data.resize(size, 0);
        Ok(Self {
            format,
            width,
            height,
            stride,
            storage: Storage::Heap(data),
        })
    }

    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn stride(&self) -> u32 {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap(data) => data,
            Storage::Buffer(buffer) => buffer.as_slice(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Heap(data) => data,
            Storage::Buffer(buffer) => buffer.as_mut_slice(),
        }
    }

    /// The shareable handle of the image, if it lives in an exportable buffer.
    pub fn dmabuf(&self) -> Option<BorrowedFd<'_>> {
        match &self.storage {
            Storage::Heap(_) => None,
            Storage::Buffer(buffer) => buffer.dmabuf().map(AsFd::as_fd),
        }
    }

    /// Copies `rect` out of the image into tightly packed rows.
    ///
    /// `rect` must lie within the image.
    pub fn sub_image(&self, rect: &Rect) -> Vec<u8> {
        copy_rect(
            self.data(),
            self.stride as usize,
            self.format.bytes_pp() as usize,
            rect,
        )
    }
}

/// Copies `rect` out of a `stride` pitched pixel buffer into tightly packed
/// rows.
///
/// `rect` must lie within `data`: the last row has to end at or before
/// `data.len()`.
pub fn copy_rect(data: &[u8], stride: usize, bytes_pp: usize, rect: &Rect) -> Vec<u8> {
    let row_len = rect.width as usize * bytes_pp;
    debug_assert!(
        rect.height == 0
            || (rect.y as usize + rect.height as usize - 1) * stride
                + rect.x as usize * bytes_pp
                + row_len
                <= data.len(),
        "{rect:?} overruns a {} byte buffer with stride {stride}",
        data.len()
    );
    let mut out = Vec::with_capacity(row_len * rect.height as usize);
    for row in 0..rect.height as usize {
        let start = (rect.y as usize + row) * stride + rect.x as usize * bytes_pp;
        out.extend_from_slice(&data[start..start + row_len]);
    }
    out
}

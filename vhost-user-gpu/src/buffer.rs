// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Host buffers that can be shared with the display process as DMA-bufs.
//!
//! Buffers are carved out of a sealed memfd and mapped into the backend. The
//! udmabuf driver turns such a memfd into a DMA-buf file descriptor that the
//! display process can import without copying.

use std::{
    ffi::CStr,
    fs::{File, OpenOptions},
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::Path,
    slice,
};

use log::debug;
use vm_memory::{FileOffset, MmapRegion};
use vmm_sys_util::{ioctl::ioctl_with_ref, ioctl_iow_nr};

use crate::image::PixelFormat;

const UDMABUF_DEVICE: &str = "/dev/udmabuf";
const UDMABUF_FLAGS_CLOEXEC: u32 = 0x01;

#[repr(C)]
struct UdmabufCreate {
    memfd: u32,
    flags: u32,
    offset: u64,
    size: u64,
}

ioctl_iow_nr!(UDMABUF_CREATE, 'u' as u32, 0x42, UdmabufCreate);

/// Allocates host buffers for software resources.
pub trait BufferAllocator {
    fn alloc(&self, width: u32, height: u32, format: PixelFormat) -> io::Result<HostBuffer>;
}

/// A CPU mapped host buffer with an optional exported DMA-buf handle.
///
/// The mapping and both file descriptors are released on drop.
#[derive(Debug)]
pub struct HostBuffer {
    region: MmapRegion<()>,
    dmabuf: Option<OwnedFd>,
    stride: u32,
    fourcc: u32,
}

impl HostBuffer {
    /// Maps `size` bytes of a sealed memfd, shared with every other mapping
    /// of it.
    pub(crate) fn from_memfd(
        memfd: File,
        dmabuf: Option<OwnedFd>,
        size: usize,
        stride: u32,
        fourcc: u32,
    ) -> io::Result<Self> {
        let region =
            MmapRegion::from_file(FileOffset::new(memfd, 0), size).map_err(io::Error::other)?;
        Ok(Self {
            region,
            dmabuf,
            stride,
            fourcc,
        })
    }

    pub const fn stride(&self) -> u32 {
        self.stride
    }

    pub const fn fourcc(&self) -> u32 {
        self.fourcc
    }

    pub const fn dmabuf(&self) -> Option<&OwnedFd> {
        self.dmabuf.as_ref()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The region maps `size()` bytes for as long as `self` lives.
        unsafe { slice::from_raw_parts(self.region.as_ptr(), self.region.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: The region maps `size()` bytes for as long as `self` lives and
        // is only reachable through `self`.
        unsafe { slice::from_raw_parts_mut(self.region.as_ptr(), self.region.size()) }
    }
}

fn page_size() -> io::Result<usize> {
    // SAFETY: sysconf has no memory safety requirements.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).map_err(|_| io::Error::last_os_error())
}

/// Creates a memfd of at least `size` bytes, rounded to whole pages, and seals
/// it against shrinking. Returns the file and its final size.
pub(crate) fn create_sealed_memfd(name: &CStr, size: usize) -> io::Result<(File, usize)> {
    let page = page_size()?;
    let size = size
        .checked_next_multiple_of(page)
        .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

    // SAFETY: `name` is a valid nul terminated string and the result is checked.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_ALLOW_SEALING | libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and is owned by nobody else.
    let memfd = unsafe { File::from_raw_fd(fd) };

    memfd.set_len(size as u64)?;
    // SAFETY: Valid fd, the result is checked.
    if unsafe { libc::fcntl(memfd.as_raw_fd(), libc::F_ADD_SEALS, libc::F_SEAL_SHRINK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((memfd, size))
}

/// Allocates memfd backed buffers and exports them through `/dev/udmabuf`.
pub struct UdmabufAllocator {
    device: File,
}

impl UdmabufAllocator {
    pub fn open() -> io::Result<Self> {
        Self::open_path(Path::new(UDMABUF_DEVICE))
    }

    pub fn open_path(path: &Path) -> io::Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("Opened {} for buffer export", path.display());
        Ok(Self { device })
    }

    fn export(&self, memfd: &File, size: usize) -> io::Result<OwnedFd> {
        let create = UdmabufCreate {
            memfd: memfd.as_raw_fd() as u32,
            flags: UDMABUF_FLAGS_CLOEXEC,
            offset: 0,
            size: size as u64,
        };
        // SAFETY: Safe as the file is the udmabuf device and `create` outlives
        // the call.
        let ret = unsafe { ioctl_with_ref(&self.device, UDMABUF_CREATE(), &create) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: On success the ioctl returns a new DMA-buf fd we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(ret) })
    }
}

impl BufferAllocator for UdmabufAllocator {
    fn alloc(&self, width: u32, height: u32, format: PixelFormat) -> io::Result<HostBuffer> {
        let stride = u32::try_from(format.stride(width))
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let size = usize::try_from(format.hostmem(width, height))
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let (memfd, size) = create_sealed_memfd(c"vhost-user-gpu", size.max(1))?;
        let dmabuf = self.export(&memfd, size)?;
        HostBuffer::from_memfd(memfd, Some(dmabuf), size, stride, format.drm_fourcc())
    }
}

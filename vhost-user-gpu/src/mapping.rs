// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Translation of guest supplied memory entries into host spans.

use std::ptr::NonNull;

use log::{debug, error};
use rutabaga_gfx::RutabagaIovec;
use thiserror::Error as ThisError;
use vm_memory::{
    GuestAddress, GuestAddressSpace, GuestMemory, GuestMemoryAtomic, GuestMemoryMmap, GuestMemoryRegion, VolatileSlice,
};

use crate::protocol::virtio_gpu_mem_entry;

/// Largest number of entries a single attach request may carry.
pub const VIRTIO_GPU_MAX_IOVEC_ENTRIES: usize = 16384;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum MappingError {
    #[error("{0} entries exceed the limit of {VIRTIO_GPU_MAX_IOVEC_ENTRIES}")]
    TooManyEntries(u32),
    #[error("request announces {expected} entries but carries {actual}")]
    SizeMismatch { expected: u32, actual: usize },
    #[error("failed to map entry {index} at {addr:#x} ({len} bytes)")]
    TranslationFailure { index: usize, addr: u64, len: usize },
}

/// A host accessible view of one guest memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSpan {
    pub addr: GuestAddress,
    pub base: NonNull<u8>,
    pub len: usize,
}

impl HostSpan {
    /// # Safety
    ///
    /// The mapping the span was built from must still be alive.
    unsafe fn as_volatile_slice(&self) -> VolatileSlice<'_> {
        VolatileSlice::new(self.base.as_ptr(), self.len)
    }
}

/// Translates guest physical ranges to host memory.
#[cfg_attr(test, mockall::automock)]
pub trait GuestMapper {
    /// Maps `len` bytes at `addr`. The returned span may be shorter than
    /// requested if the range crosses the end of a region.
    fn map(&self, addr: GuestAddress, len: usize) -> Option<HostSpan>;
    /// Undoes a successful `map`.
    fn unmap(&self, span: &HostSpan);
}

impl GuestMapper for GuestMemoryAtomic<GuestMemoryMmap> {
    fn map(&self, addr: GuestAddress, len: usize) -> Option<HostSpan> {
        let mem = self.memory();
        let region = mem.find_region(addr)?;
        let offset = region.to_region_addr(addr)?;
        let avail = region.len().checked_sub(offset.0)?;
        let len = len.min(usize::try_from(avail).ok()?);
        let slice = region.as_volatile_slice().ok()?.subslice(offset.0 as usize, len).ok()?;
        let base = NonNull::new(slice.ptr_guard_mut().as_ptr())?;
        Some(HostSpan { addr, base, len })
    }

    fn unmap(&self, _span: &HostSpan) {
        // Guest memory stays mapped for the lifetime of the backend.
    }
}

/// The backing store of a resource, in guest order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BackingSpans {
    spans: Vec<HostSpan>,
}

impl BackingSpans {
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.spans.iter().map(|s| s.len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostSpan> {
        self.spans.iter()
    }

    pub fn to_rutabaga_iovecs(&self) -> Vec<RutabagaIovec> {
        self.spans
            .iter()
            .map(|s| RutabagaIovec {
                base: s.base.as_ptr().cast(),
                len: s.len,
            })
            .collect()
    }
}

/// Builds the spans for an attach request.
///
/// Either every entry is mapped or none is: on failure all spans built so far
/// are released again before returning.
pub fn build(
    mapper: &dyn GuestMapper,
    nr_entries: u32,
    entries: &[virtio_gpu_mem_entry],
) -> Result<BackingSpans, MappingError> {
    if nr_entries as usize > VIRTIO_GPU_MAX_IOVEC_ENTRIES {
        return Err(MappingError::TooManyEntries(nr_entries));
    }
    if entries.len() != nr_entries as usize {
        return Err(MappingError::SizeMismatch {
            expected: nr_entries,
            actual: entries.len(),
        });
    }

    let mut spans = BackingSpans {
        spans: Vec::with_capacity(entries.len()),
    };
    for (index, entry) in entries.iter().enumerate() {
        let addr = GuestAddress(entry.addr.into());
        let len = u32::from(entry.length) as usize;
        match mapper.map(addr, len) {
            Some(span) if span.len == len => spans.spans.push(span),
            mapped => {
                if let Some(short) = mapped {
                    mapper.unmap(&short);
                }
                error!(
                    "Failed to map guest memory entry {index}: {:#x}+{len:#x}",
                    addr.0
                );
                release(mapper, spans);
                return Err(MappingError::TranslationFailure {
                    index,
                    addr: addr.0,
                    len,
                });
            }
        }
    }
    debug!("Mapped {} guest memory entries", spans.len());
    Ok(spans)
}

/// Unmaps every span of `spans`.
pub fn release(mapper: &dyn GuestMapper, spans: BackingSpans) {
    for span in &spans.spans {
        mapper.unmap(span);
    }
}

/// Copies bytes from the spans, starting `offset` bytes into their
/// concatenation, into `dst`. Returns the number of bytes copied, which is
/// short when the spans end first.
pub fn iov_to_buf(spans: &BackingSpans, mut offset: usize, dst: &mut [u8]) -> usize {
    let mut copied = 0;
    for span in spans.iter() {
        if copied == dst.len() {
            break;
        }
        if offset >= span.len {
            offset -= span.len;
            continue;
        }
        // SAFETY: Spans stay valid while the backing is attached, and the
        // caller borrows it.
        let slice = unsafe { span.as_volatile_slice() };
        let Ok(src) = slice.offset(offset) else {
            break;
        };
        let n = src.copy_to(&mut dst[copied..]);
        copied += n;
        offset = 0;
    }
    copied
}

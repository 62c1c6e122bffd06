// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Control commands waiting for a renderer fence.

use std::{
    collections::BTreeMap,
    io,
    mem,
    os::fd::{AsRawFd, RawFd},
    sync::{Arc, Mutex},
};

use log::debug;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::protocol::{virtio_gpu_ctrl_hdr, VIRTIO_GPU_FLAG_INFO_RING_IDX};

/// The timeline a fence is ordered on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VirtioGpuRing {
    Global,
    ContextSpecific { ctx_id: u32, ring_idx: u8 },
}

impl VirtioGpuRing {
    pub fn new(flags: u32, ctx_id: u32, ring_idx: u8) -> Self {
        if flags & VIRTIO_GPU_FLAG_INFO_RING_IDX != 0 {
            Self::ContextSpecific { ctx_id, ring_idx }
        } else {
            Self::Global
        }
    }

    pub fn from_hdr(hdr: &virtio_gpu_ctrl_hdr) -> Self {
        Self::new(hdr.flags.into(), hdr.ctx_id.into(), hdr.ring_idx)
    }
}

/// A control command whose response has been written but not yet returned to
/// the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCommand {
    pub ring: VirtioGpuRing,
    pub fence_id: u64,
    pub desc_index: u16,
    pub len: u32,
}

/// Pending commands in submission order.
#[derive(Debug, Default)]
pub struct FenceQueue {
    pending: Vec<PendingCommand>,
    completed: BTreeMap<VirtioGpuRing, u64>,
}

impl FenceQueue {
    pub fn enqueue(&mut self, cmd: PendingCommand) {
        self.pending.push(cmd);
    }

    /// Whether `fence_id` on `ring` has been signaled already.
    pub fn is_completed(&self, ring: VirtioGpuRing, fence_id: u64) -> bool {
        self.completed
            .get(&ring)
            .is_some_and(|&last| fence_id <= last)
    }

    /// Removes and returns every command on `ring` whose fence is at most
    /// `fence_id`.
    ///
    /// Renderers may signal fences in any order, so the whole queue is
    /// scanned rather than just its head.
    pub fn complete_up_to(&mut self, ring: VirtioGpuRing, fence_id: u64) -> Vec<PendingCommand> {
        let (done, rest): (Vec<_>, Vec<_>) = mem::take(&mut self.pending)
            .into_iter()
            .partition(|cmd| cmd.ring == ring && cmd.fence_id <= fence_id);
        self.pending = rest;
        let last = self.completed.entry(ring).or_insert(0);
        *last = (*last).max(fence_id);
        debug!(
            "Fence {fence_id} on {ring:?} completed {} command(s)",
            done.len()
        );
        done
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }
}

/// Hands fence completions from renderer threads to the event loop.
///
/// Producers push and kick the eventfd; the event loop drains on readiness.
#[derive(Clone, Debug)]
pub struct FenceMailbox {
    signaled: Arc<Mutex<Vec<(VirtioGpuRing, u64)>>>,
    event: Arc<EventFd>,
}

impl FenceMailbox {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            signaled: Arc::default(),
            event: Arc::new(EventFd::new(EFD_NONBLOCK)?),
        })
    }

    pub fn post(&self, ring: VirtioGpuRing, fence_id: u64) {
        self.signaled.lock().unwrap().push((ring, fence_id));
        // An eventfd only fails to count when it would overflow, in which
        // case it is readable anyway.
        let _ = self.event.write(1);
    }

    pub fn drain(&self) -> Vec<(VirtioGpuRing, u64)> {
        let _ = self.event.read();
        mem::take(&mut *self.signaled.lock().unwrap())
    }
}

impl AsRawFd for FenceMailbox {
    fn as_raw_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }
}

// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Guest ring fixtures shared by the queue handling tests.

use std::{
    fs::File,
    iter::zip,
    mem,
    os::fd::{AsRawFd, FromRawFd},
};

use vhost_user_backend::{VringRwLock, VringT};
use virtio_bindings::virtio_ring::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use virtio_queue::{
    desc::{split::Descriptor as SplitDescriptor, RawDescriptor},
    mock::MockSplitQueue,
    Queue, QueueT,
};
use vm_memory::{
    Bytes, GuestAddress, GuestAddressSpace, GuestMemory, GuestMemoryAtomic, GuestMemoryMmap,
};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::protocol::virtio_gpu_ctrl_hdr;

pub const MEM_SIZE: usize = 2 * 1024 * 1024; // 2MiB

const CURSOR_QUEUE_ADDR: GuestAddress = GuestAddress(0x0);
const CURSOR_QUEUE_DATA_ADDR: GuestAddress = GuestAddress(0x1_000);
const CURSOR_QUEUE_SIZE: u16 = 16;
const CONTROL_QUEUE_ADDR: GuestAddress = GuestAddress(0x2_000);
const CONTROL_QUEUE_DATA_ADDR: GuestAddress = GuestAddress(0x10_000);
const CONTROL_QUEUE_SIZE: u16 = 1024;

/// Arguments to create a descriptor chain for testing
pub struct TestingDescChainArgs<'a> {
    /// Each readable buffer becomes a descriptor (no WRITE flag)
    pub readable_desc_bufs: &'a [&'a [u8]],
    /// Each length becomes a writable descriptor (WRITE flag set)
    pub writable_desc_lengths: &'a [u32],
}

pub fn test_memory() -> GuestMemoryAtomic<GuestMemoryMmap> {
    GuestMemoryAtomic::new(
        GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), MEM_SIZE)]).unwrap(),
    )
}

pub fn new_hdr(type_: u32) -> virtio_gpu_ctrl_hdr {
    virtio_gpu_ctrl_hdr {
        type_: type_.into(),
        ..Default::default()
    }
}

pub fn event_fd_into_file(event_fd: EventFd) -> File {
    // SAFETY: We ensure that the `event_fd` is properly handled such that its file
    // descriptor is not closed after `File` takes ownership of it.
    unsafe {
        let event_fd_raw = event_fd.as_raw_fd();
        mem::forget(event_fd);
        File::from_raw_fd(event_fd_raw)
    }
}

fn make_descriptors_into_a_chain(start_idx: u16, descriptors: &mut [SplitDescriptor]) {
    let last_idx = start_idx + descriptors.len() as u16 - 1;
    for (idx, desc) in zip(start_idx.., descriptors.iter_mut()) {
        if idx == last_idx {
            desc.set_flags(desc.flags() & !VRING_DESC_F_NEXT as u16);
        } else {
            desc.set_flags(desc.flags() | VRING_DESC_F_NEXT as u16);
            desc.set_next(idx + 1);
        };
    }
}

/// Creates a vring holding `chains`.
///
/// For every chain the guest addresses of its writable descriptors are
/// returned, so responses can be read back. The `EventFd` is the queue's call
/// notifier.
pub fn create_vring(
    mem: &GuestMemoryAtomic<GuestMemoryMmap>,
    chains: &[TestingDescChainArgs],
    queue_addr_start: GuestAddress,
    data_addr_start: GuestAddress,
    queue_size: u16,
) -> (VringRwLock, Vec<Vec<GuestAddress>>, EventFd) {
    let mem_handle = mem.memory();
    mem_handle
        .check_address(queue_addr_start)
        .expect("Invalid start address");

    let mut output_bufs = Vec::new();
    let vq = MockSplitQueue::create(&*mem_handle, queue_addr_start, queue_size);
    // Address of the buffer associated with the descriptor
    let mut next_addr = data_addr_start.0;
    let mut chain_index_start = 0;
    let mut descriptors = Vec::new();

    for chain in chains {
        for buf in chain.readable_desc_bufs {
            mem_handle
                .check_address(GuestAddress(next_addr))
                .expect("Readable descriptor's buffer address is not valid!");
            let desc = SplitDescriptor::new(
                next_addr,
                buf.len()
                    .try_into()
                    .expect("Buffer too large to fit into descriptor"),
                0,
                0,
            );
            mem_handle.write(buf, desc.addr()).unwrap();
            descriptors.push(desc);
            next_addr += buf.len() as u64;
        }
        let mut writable_descriptor_addresses = Vec::new();
        for desc_len in chain.writable_desc_lengths.iter().copied() {
            mem_handle
                .check_address(GuestAddress(next_addr))
                .expect("Writable descriptor's buffer address is not valid!");
            let desc = SplitDescriptor::new(next_addr, desc_len, VRING_DESC_F_WRITE as u16, 0);
            writable_descriptor_addresses.push(desc.addr());
            descriptors.push(desc);
            next_addr += u64::from(desc_len);
        }
        output_bufs.push(writable_descriptor_addresses);
        make_descriptors_into_a_chain(
            chain_index_start as u16,
            &mut descriptors[chain_index_start..],
        );
        chain_index_start = descriptors.len();
    }

    assert!(descriptors.len() < queue_size as usize);
    if !descriptors.is_empty() {
        let descs_raw = descriptors
            .into_iter()
            .map(RawDescriptor::from)
            .collect::<Vec<RawDescriptor>>();
        vq.build_multiple_desc_chains(&descs_raw)
            .expect("Failed to build descriptor chain");
    }

    let queue: Queue = vq.create_queue().unwrap();
    let vring = VringRwLock::new(mem.clone(), queue_size).unwrap();
    let signal_used_queue_evt = EventFd::new(EFD_NONBLOCK).unwrap();
    let signal_used_queue_evt_clone = signal_used_queue_evt.try_clone().unwrap();
    vring
        .set_queue_info(queue.desc_table(), queue.avail_ring(), queue.used_ring())
        .unwrap();
    vring.set_call(Some(event_fd_into_file(signal_used_queue_evt_clone)));

    vring.set_enabled(true);
    vring.set_queue_ready(true);

    (vring, output_bufs, signal_used_queue_evt)
}

pub fn create_control_vring(
    mem: &GuestMemoryAtomic<GuestMemoryMmap>,
    chains: &[TestingDescChainArgs],
) -> (VringRwLock, Vec<Vec<GuestAddress>>, EventFd) {
    create_vring(
        mem,
        chains,
        CONTROL_QUEUE_ADDR,
        CONTROL_QUEUE_DATA_ADDR,
        CONTROL_QUEUE_SIZE,
    )
}

pub fn create_cursor_vring(
    mem: &GuestMemoryAtomic<GuestMemoryMmap>,
    chains: &[TestingDescChainArgs],
) -> (VringRwLock, Vec<Vec<GuestAddress>>, EventFd) {
    create_vring(
        mem,
        chains,
        CURSOR_QUEUE_ADDR,
        CURSOR_QUEUE_DATA_ADDR,
        CURSOR_QUEUE_SIZE,
    )
}

// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The cursor queue.
//!
//! Cursor commands carry no response: every chain is returned empty, whether
//! or not its command made sense.

use log::{debug, trace, warn};
use vhost_user_backend::{VringRwLock, VringT};
use virtio_queue::QueueOwnedT;
use vm_memory::{GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap};

use crate::{
    device::{Error, Result},
    display::message::CursorPos,
    protocol::{
        virtio_gpu_ctrl_hdr, virtio_gpu_update_cursor, GpuCommand, VIRTIO_GPU_CMD_MOVE_CURSOR,
        VIRTIO_GPU_CMD_UPDATE_CURSOR,
    },
    renderer::Renderer,
};

fn handle_cursor_command(
    renderer: &mut dyn Renderer,
    hdr: &virtio_gpu_ctrl_hdr,
    req: &virtio_gpu_update_cursor,
    max_outputs: u32,
) {
    let scanout_id = u32::from(req.pos.scanout_id);
    if scanout_id >= max_outputs {
        debug!("Ignoring cursor command for scanout {scanout_id}");
        return;
    }
    let pos = CursorPos {
        scanout_id: req.pos.scanout_id,
        x: req.pos.x,
        y: req.pos.y,
    };

    let resource_id = req.resource_id.into();
    match u32::from(hdr.type_) {
        VIRTIO_GPU_CMD_UPDATE_CURSOR => {
            renderer.update_cursor(resource_id, pos, req.hot_x.into(), req.hot_y.into());
        }
        VIRTIO_GPU_CMD_MOVE_CURSOR => renderer.move_cursor(resource_id, pos),
        other => warn!("Unknown cursor command {other:#x}"),
    }
}

/// Handles every chain on the cursor queue.
pub fn process_cursor_queue(
    renderer: &mut dyn Renderer,
    vring: &VringRwLock,
    mem: &GuestMemoryAtomic<GuestMemoryMmap>,
    max_outputs: u32,
) -> Result<()> {
    let mem = mem.memory().into_inner();
    let desc_chains: Vec<_> = vring
        .get_mut()
        .get_queue_mut()
        .iter(mem.clone())
        .map_err(Error::CreateIteratorDescChain)?
        .collect();

    let mut signal_used_queue = false;
    for desc_chain in desc_chains {
        let head_index = desc_chain.head_index();
        let mut reader = desc_chain.reader(&mem).map_err(Error::CreateReader)?;
        let hdr = GpuCommand::decode_header(&mut reader);
        match reader.read_obj::<virtio_gpu_update_cursor>() {
            Ok(req) => handle_cursor_command(renderer, &hdr, &req, max_outputs),
            Err(e) => warn!("Malformed cursor command: {e}"),
        }
        vring.add_used(head_index, 0).map_err(Error::QueueAddUsed)?;
        signal_used_queue = true;
    }

    if signal_used_queue {
        trace!("Notifying cursor queue");
        vring
            .signal_used_queue()
            .map_err(Error::NotificationFailed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use mockall::predicate::{always, eq};
    use virtio_queue::QueueT;
    use vm_memory::ByteValued;

    use super::*;
    use crate::{
        protocol::virtio_gpu_cursor_pos,
        renderer::MockRenderer,
        testutils::{create_cursor_vring, new_hdr, test_memory, TestingDescChainArgs},
    };

    fn cursor_cmd(scanout_id: u32, resource_id: u32) -> virtio_gpu_update_cursor {
        virtio_gpu_update_cursor {
            pos: virtio_gpu_cursor_pos {
                scanout_id: scanout_id.into(),
                x: 10.into(),
                y: 20.into(),
                padding: 0.into(),
            },
            resource_id: resource_id.into(),
            hot_x: 1.into(),
            hot_y: 2.into(),
            padding: 0.into(),
        }
    }

    #[test]
    fn test_cursor_commands_are_forwarded() {
        let mem = test_memory();
        let update_hdr = new_hdr(VIRTIO_GPU_CMD_UPDATE_CURSOR);
        let move_hdr = new_hdr(VIRTIO_GPU_CMD_MOVE_CURSOR);
        let update = cursor_cmd(0, 5);
        let hide = cursor_cmd(1, 0);
        let (vring, _, signal_used_queue_evt) = create_cursor_vring(
            &mem,
            &[
                TestingDescChainArgs {
                    readable_desc_bufs: &[update_hdr.as_slice(), update.as_slice()],
                    writable_desc_lengths: &[],
                },
                TestingDescChainArgs {
                    readable_desc_bufs: &[move_hdr.as_slice(), hide.as_slice()],
                    writable_desc_lengths: &[],
                },
            ],
        );

        let mut renderer = MockRenderer::new();
        renderer
            .expect_update_cursor()
            .with(
                eq(5),
                eq(CursorPos {
                    scanout_id: 0.into(),
                    x: 10.into(),
                    y: 20.into(),
                }),
                eq(1),
                eq(2),
            )
            .times(1)
            .return_const(());
        renderer
            .expect_move_cursor()
            .with(eq(0), always())
            .times(1)
            .return_const(());

        process_cursor_queue(&mut renderer, &vring, &mem, 16).unwrap();
        signal_used_queue_evt.read().unwrap();
    }

    #[test]
    fn test_invalid_cursor_commands_are_returned() {
        let mem = test_memory();
        let update_hdr = new_hdr(VIRTIO_GPU_CMD_UPDATE_CURSOR);
        let out_of_range = cursor_cmd(2, 5);
        let (vring, _, signal_used_queue_evt) = create_cursor_vring(
            &mem,
            &[
                TestingDescChainArgs {
                    readable_desc_bufs: &[update_hdr.as_slice(), out_of_range.as_slice()],
                    writable_desc_lengths: &[],
                },
                // Truncated, the cursor payload is missing.
                TestingDescChainArgs {
                    readable_desc_bufs: &[update_hdr.as_slice()],
                    writable_desc_lengths: &[],
                },
            ],
        );

        // No expectations, any call to the renderer fails the test.
        let mut renderer = MockRenderer::new();
        process_cursor_queue(&mut renderer, &vring, &mem, 2).unwrap();

        signal_used_queue_evt.read().unwrap();
        assert_eq!(
            vring.get_ref().get_queue().next_used(),
            2,
            "both chains must be returned"
        );
        assert_eq!(
            signal_used_queue_evt.read().unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
    }
}

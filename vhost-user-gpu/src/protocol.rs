// Copyright 2024 Red Hat Inc
// Copyright 2019 The ChromiumOS Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! virtio-gpu control and cursor queue wire format.
//!
//! Every command starts with a [`virtio_gpu_ctrl_hdr`] followed by a fixed,
//! command specific payload. Responses mirror the header and optionally carry
//! a response specific payload.

#![allow(non_camel_case_types)]

use std::{
    cmp::min,
    ffi::CStr,
    fmt::{self, Display},
    io::{self, Read, Write},
    marker::PhantomData,
    mem::{size_of, size_of_val},
};

use log::{trace, warn};
use rutabaga_gfx::RutabagaError;
use thiserror::Error;
pub use virtio_bindings::virtio_gpu::{
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE as VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_CTX_CREATE as VIRTIO_GPU_CMD_CTX_CREATE,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_CTX_DESTROY as VIRTIO_GPU_CMD_CTX_DESTROY,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE as VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_GET_CAPSET as VIRTIO_GPU_CMD_GET_CAPSET,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_GET_CAPSET_INFO as VIRTIO_GPU_CMD_GET_CAPSET_INFO,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_GET_DISPLAY_INFO as VIRTIO_GPU_CMD_GET_DISPLAY_INFO,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_GET_EDID as VIRTIO_GPU_CMD_GET_EDID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_MOVE_CURSOR as VIRTIO_GPU_CMD_MOVE_CURSOR,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_ASSIGN_UUID as VIRTIO_GPU_CMD_RESOURCE_ASSIGN_UUID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING as VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_CREATE_2D as VIRTIO_GPU_CMD_RESOURCE_CREATE_2D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_CREATE_3D as VIRTIO_GPU_CMD_RESOURCE_CREATE_3D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_CREATE_BLOB as VIRTIO_GPU_CMD_RESOURCE_CREATE_BLOB,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING as VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_FLUSH as VIRTIO_GPU_CMD_RESOURCE_FLUSH,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_MAP_BLOB as VIRTIO_GPU_CMD_RESOURCE_MAP_BLOB,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_UNMAP_BLOB as VIRTIO_GPU_CMD_RESOURCE_UNMAP_BLOB,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_UNREF as VIRTIO_GPU_CMD_RESOURCE_UNREF,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_SET_SCANOUT as VIRTIO_GPU_CMD_SET_SCANOUT,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_SET_SCANOUT_BLOB as VIRTIO_GPU_CMD_SET_SCANOUT_BLOB,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_SUBMIT_3D as VIRTIO_GPU_CMD_SUBMIT_3D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D as VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D as VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D as VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_UPDATE_CURSOR as VIRTIO_GPU_CMD_UPDATE_CURSOR,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID as VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER as VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID as VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID as VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY as VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_UNSPEC as VIRTIO_GPU_RESP_ERR_UNSPEC,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_CAPSET as VIRTIO_GPU_RESP_OK_CAPSET,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_CAPSET_INFO as VIRTIO_GPU_RESP_OK_CAPSET_INFO,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_DISPLAY_INFO as VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_EDID as VIRTIO_GPU_RESP_OK_EDID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_NODATA as VIRTIO_GPU_RESP_OK_NODATA,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_RESOURCE_UUID as VIRTIO_GPU_RESP_OK_RESOURCE_UUID,
};
use virtio_queue::{Reader, Writer};
use vm_memory::{ByteValued, Le32, Le64};

use crate::mapping::VIRTIO_GPU_MAX_IOVEC_ENTRIES;

pub const QUEUE_SIZE: usize = 1024;
pub const NUM_QUEUES: usize = 2;

pub const CONTROL_QUEUE: u16 = 0;
pub const CURSOR_QUEUE: u16 = 1;
// vhost-user-backend reserves NUM_QUEUES for its exit event, device events
// start after it.
pub const POLL_EVENT: u16 = 3;
pub const FENCE_EVENT: u16 = 4;
pub const FRONTEND_EVENT: u16 = 5;

pub const VIRTIO_GPU_MAX_SCANOUTS: u32 = 16;

/// `CHROMIUM(b/277982577)` success responses
pub const VIRTIO_GPU_RESP_OK_RESOURCE_PLANE_INFO: u32 = 0x11FF;

pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1 << 0;
pub const VIRTIO_GPU_FLAG_INFO_RING_IDX: u32 = 1 << 1;

pub const VIRTIO_GPU_EVENT_DISPLAY: u32 = 1 << 0;

pub const VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM: u32 = 1;
pub const VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM: u32 = 2;
pub const VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM: u32 = 3;
pub const VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM: u32 = 4;
pub const VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM: u32 = 67;
pub const VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM: u32 = 68;
pub const VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM: u32 = 121;
pub const VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM: u32 = 134;

/// Marks a plain old data wire struct as safe to build from raw bytes.
macro_rules! byte_valued {
    ($($ty:ty),+ $(,)?) => {
        $(
            // SAFETY: The layout of the structure is fixed and can be initialized by
            // reading its content from byte array.
            unsafe impl ByteValued for $ty {}
        )+
    };
}

/// Virtio Gpu Configuration
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VirtioGpuConfig {
    /// Signals pending events to the driver
    pub events_read: Le32,
    /// Clears pending events in the device
    pub events_clear: Le32,
    /// Maximum number of scanouts supported by the device
    pub num_scanouts: Le32,
    /// Maximum number of capability sets supported by the device
    pub num_capsets: Le32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_ctrl_hdr {
    pub type_: Le32,
    pub flags: Le32,
    pub fence_id: Le64,
    pub ctx_id: Le32,
    pub ring_idx: u8,
    pub padding: [u8; 3],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_cursor_pos {
    pub scanout_id: Le32,
    pub x: Le32,
    pub y: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_UPDATE_CURSOR, VIRTIO_GPU_CMD_MOVE_CURSOR
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_update_cursor {
    /// update & move
    pub pos: virtio_gpu_cursor_pos,
    /// update only
    pub resource_id: Le32,
    /// update only
    pub hot_x: Le32,
    /// update only
    pub hot_y: Le32,
    pub padding: Le32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_rect {
    pub x: Le32,
    pub y: Le32,
    pub width: Le32,
    pub height: Le32,
}

// VIRTIO_GPU_CMD_GET_EDID
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_get_edid {
    pub scanout: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_RESOURCE_UNREF
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_unref {
    pub resource_id: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_RESOURCE_CREATE_2D
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_create_2d {
    pub resource_id: Le32,
    pub format: Le32,
    pub width: Le32,
    pub height: Le32,
}

// VIRTIO_GPU_CMD_SET_SCANOUT
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_set_scanout {
    pub r: virtio_gpu_rect,
    pub scanout_id: Le32,
    pub resource_id: Le32,
}

// VIRTIO_GPU_CMD_RESOURCE_FLUSH
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_flush {
    pub r: virtio_gpu_rect,
    pub resource_id: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_transfer_to_host_2d {
    pub r: virtio_gpu_rect,
    pub offset: Le64,
    pub resource_id: Le32,
    pub padding: Le32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_mem_entry {
    pub addr: Le64,
    pub length: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING, followed by `nr_entries` mem entries
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_attach_backing {
    pub resource_id: Le32,
    pub nr_entries: Le32,
}

// VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_detach_backing {
    pub resource_id: Le32,
    pub padding: Le32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_display_one {
    pub r: virtio_gpu_rect,
    pub enabled: Le32,
    pub flags: Le32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_display_info {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub pmodes: [virtio_gpu_display_one; VIRTIO_GPU_MAX_SCANOUTS as usize],
}

pub const EDID_BLOB_MAX_SIZE: usize = 1024;

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct virtio_gpu_resp_edid {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub size: Le32,
    pub padding: Le32,
    pub edid: [u8; EDID_BLOB_MAX_SIZE],
}

impl Default for virtio_gpu_resp_edid {
    fn default() -> Self {
        Self {
            hdr: Default::default(),
            size: 0.into(),
            padding: 0.into(),
            edid: [0; EDID_BLOB_MAX_SIZE],
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_box {
    pub x: Le32,
    pub y: Le32,
    pub z: Le32,
    pub w: Le32,
    pub h: Le32,
    pub d: Le32,
}

// VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D, VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_transfer_host_3d {
    pub box_: virtio_gpu_box,
    pub offset: Le64,
    pub resource_id: Le32,
    pub level: Le32,
    pub stride: Le32,
    pub layer_stride: Le32,
}

// VIRTIO_GPU_CMD_RESOURCE_CREATE_3D
pub const VIRTIO_GPU_RESOURCE_FLAG_Y_0_TOP: u32 = 1 << 0;
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_create_3d {
    pub resource_id: Le32,
    pub target: Le32,
    pub format: Le32,
    pub bind: Le32,
    pub width: Le32,
    pub height: Le32,
    pub depth: Le32,
    pub array_size: Le32,
    pub last_level: Le32,
    pub nr_samples: Le32,
    pub flags: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_CTX_CREATE
pub const VIRTIO_GPU_CONTEXT_INIT_CAPSET_ID_MASK: u32 = 0xff;
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_ctx_create {
    pub nlen: Le32,
    pub context_init: Le32,
    pub debug_name: [u8; 64],
}

impl Default for virtio_gpu_ctx_create {
    fn default() -> Self {
        Self {
            nlen: 0.into(),
            context_init: 0.into(),
            debug_name: [0; 64],
        }
    }
}

impl virtio_gpu_ctx_create {
    pub fn get_debug_name(&self) -> String {
        let len = min(64, u32::from(self.nlen) as usize);
        CStr::from_bytes_until_nul(&self.debug_name[..len]).map_or_else(
            |_| String::from_utf8_lossy(&self.debug_name[..len]).into_owned(),
            |c_str| c_str.to_string_lossy().into_owned(),
        )
    }
}

impl fmt::Debug for virtio_gpu_ctx_create {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("virtio_gpu_ctx_create")
            .field("debug_name", &self.get_debug_name())
            .field("context_init", &self.context_init)
            .finish_non_exhaustive()
    }
}

// VIRTIO_GPU_CMD_CTX_DESTROY
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_ctx_destroy {}

// VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE, VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_ctx_resource {
    pub resource_id: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_SUBMIT_3D, followed by `num_in_fences` u64 fence ids and
// `size` bytes of command stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_cmd_submit {
    pub size: Le32,
    pub num_in_fences: Le32,
}

// VIRTIO_GPU_CMD_GET_CAPSET_INFO
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_get_capset_info {
    pub capset_index: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_RESP_OK_CAPSET_INFO
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_capset_info {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub capset_id: Le32,
    pub capset_max_version: Le32,
    pub capset_max_size: Le32,
    pub padding: Le32,
}

// VIRTIO_GPU_CMD_GET_CAPSET
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_get_capset {
    pub capset_id: Le32,
    pub capset_version: Le32,
}

// VIRTIO_GPU_RESP_OK_CAPSET
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_capset {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub capset_data: PhantomData<[u8]>,
}

// VIRTIO_GPU_RESP_OK_RESOURCE_PLANE_INFO
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_resource_plane_info {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub count: Le32,
    pub padding: Le32,
    pub format_modifier: Le64,
    pub strides: [Le32; 4],
    pub offsets: [Le32; 4],
}

pub const PLANE_INFO_MAX_COUNT: usize = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_create_blob {
    pub resource_id: Le32,
    pub blob_mem: Le32,
    pub blob_flags: Le32,
    pub nr_entries: Le32,
    pub blob_id: Le64,
    pub size: Le64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_map_blob {
    pub resource_id: Le32,
    pub padding: Le32,
    pub offset: Le64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_unmap_blob {
    pub resource_id: Le32,
    pub padding: Le32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_assign_uuid {
    pub resource_id: Le32,
    pub padding: Le32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_resource_uuid {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub uuid: [u8; 16],
}

// VIRTIO_GPU_CMD_SET_SCANOUT_BLOB
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_set_scanout_blob {
    pub r: virtio_gpu_rect,
    pub scanout_id: Le32,
    pub resource_id: Le32,
    pub width: Le32,
    pub height: Le32,
    pub format: Le32,
    pub padding: Le32,
    pub strides: [Le32; 4],
    pub offsets: [Le32; 4],
}

byte_valued!(
    VirtioGpuConfig,
    virtio_gpu_ctrl_hdr,
    virtio_gpu_cursor_pos,
    virtio_gpu_update_cursor,
    virtio_gpu_rect,
    virtio_gpu_get_edid,
    virtio_gpu_resource_unref,
    virtio_gpu_resource_create_2d,
    virtio_gpu_set_scanout,
    virtio_gpu_resource_flush,
    virtio_gpu_transfer_to_host_2d,
    virtio_gpu_mem_entry,
    virtio_gpu_resource_attach_backing,
    virtio_gpu_resource_detach_backing,
    virtio_gpu_display_one,
    virtio_gpu_resp_display_info,
    virtio_gpu_resp_edid,
    virtio_gpu_box,
    virtio_gpu_transfer_host_3d,
    virtio_gpu_resource_create_3d,
    virtio_gpu_ctx_create,
    virtio_gpu_ctx_destroy,
    virtio_gpu_ctx_resource,
    virtio_gpu_cmd_submit,
    virtio_gpu_get_capset_info,
    virtio_gpu_resp_capset_info,
    virtio_gpu_get_capset,
    virtio_gpu_resp_capset,
    virtio_gpu_resp_resource_plane_info,
    virtio_gpu_resource_create_blob,
    virtio_gpu_resource_map_blob,
    virtio_gpu_resource_unmap_blob,
    virtio_gpu_resource_assign_uuid,
    virtio_gpu_resp_resource_uuid,
    virtio_gpu_set_scanout_blob,
);

/// A virtio gpu control queue command and its payload.
#[derive(Clone, PartialEq, Eq)]
pub enum GpuCommand {
    GetDisplayInfo,
    GetEdid(virtio_gpu_get_edid),
    ResourceCreate2d(virtio_gpu_resource_create_2d),
    ResourceUnref(virtio_gpu_resource_unref),
    SetScanout(virtio_gpu_set_scanout),
    SetScanoutBlob(virtio_gpu_set_scanout_blob),
    ResourceFlush(virtio_gpu_resource_flush),
    TransferToHost2d(virtio_gpu_transfer_to_host_2d),
    /// The entries actually present in the descriptor chain. Their count can
    /// be lower than `nr_entries` when the guest sent a truncated request, or
    /// zero when `nr_entries` is over the limit.
    ResourceAttachBacking(
        virtio_gpu_resource_attach_backing,
        Vec<virtio_gpu_mem_entry>,
    ),
    ResourceDetachBacking(virtio_gpu_resource_detach_backing),
    GetCapsetInfo(virtio_gpu_get_capset_info),
    GetCapset(virtio_gpu_get_capset),
    CtxCreate(virtio_gpu_ctx_create),
    CtxDestroy(virtio_gpu_ctx_destroy),
    CtxAttachResource(virtio_gpu_ctx_resource),
    CtxDetachResource(virtio_gpu_ctx_resource),
    ResourceCreate3d(virtio_gpu_resource_create_3d),
    TransferToHost3d(virtio_gpu_transfer_host_3d),
    TransferFromHost3d(virtio_gpu_transfer_host_3d),
    CmdSubmit3d {
        cmd_data: Vec<u8>,
        fence_ids: Vec<u64>,
    },
    ResourceCreateBlob(virtio_gpu_resource_create_blob),
    ResourceMapBlob(virtio_gpu_resource_map_blob),
    ResourceUnmapBlob(virtio_gpu_resource_unmap_blob),
    ResourceAssignUuid(virtio_gpu_resource_assign_uuid),
}

/// An error indicating something went wrong decoding a `GpuCommand`.
#[derive(Error, Debug)]
pub enum GpuCommandDecodeError {
    /// The type of the command was invalid.
    #[error("invalid command type ({0})")]
    InvalidType(u32),
    /// The payload was shorter than the command requires.
    #[error("failed to read {0} payload: {1}")]
    Payload(&'static str, io::Error),
}

impl fmt::Debug for GpuCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(self.command_name()).finish()
    }
}

/// Reads as much of a `T` as the chain holds. Returns the value and the number
/// of bytes that were actually filled in.
fn read_partial<T: ByteValued + Default>(reader: &mut Reader) -> (T, usize) {
    let mut obj = T::default();
    let mut filled = 0;
    {
        let buf = obj.as_mut_slice();
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
    }
    (obj, filled)
}

fn read_payload<T: ByteValued>(
    reader: &mut Reader,
    name: &'static str,
) -> Result<T, GpuCommandDecodeError> {
    reader
        .read_obj::<T>()
        .map_err(|e| GpuCommandDecodeError::Payload(name, e))
}

/// Reads the memory entries following an attach-backing style request. No
/// entry is read when `nr_entries` exceeds the mapping limit so that such a
/// request is rejected before touching guest memory.
fn read_mem_entries(reader: &mut Reader, nr_entries: u32) -> Vec<virtio_gpu_mem_entry> {
    let requested = nr_entries as usize;
    if requested > VIRTIO_GPU_MAX_IOVEC_ENTRIES {
        return Vec::new();
    }
    let present = reader.available_bytes() / size_of::<virtio_gpu_mem_entry>();
    let mut entries = Vec::with_capacity(min(requested, present));
    for _ in 0..min(requested, present) {
        match reader.read_obj::<virtio_gpu_mem_entry>() {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
    }
    entries
}

impl GpuCommand {
    pub const fn command_name(&self) -> &'static str {
        use GpuCommand::*;
        match self {
            GetDisplayInfo => "GetDisplayInfo",
            GetEdid(_) => "GetEdid",
            ResourceCreate2d(_) => "ResourceCreate2d",
            ResourceUnref(_) => "ResourceUnref",
            SetScanout(_) => "SetScanout",
            SetScanoutBlob(_) => "SetScanoutBlob",
            ResourceFlush(_) => "ResourceFlush",
            TransferToHost2d(_) => "TransferToHost2d",
            ResourceAttachBacking(..) => "ResourceAttachBacking",
            ResourceDetachBacking(_) => "ResourceDetachBacking",
            GetCapsetInfo(_) => "GetCapsetInfo",
            GetCapset(_) => "GetCapset",
            CtxCreate(_) => "CtxCreate",
            CtxDestroy(_) => "CtxDestroy",
            CtxAttachResource(_) => "CtxAttachResource",
            CtxDetachResource(_) => "CtxDetachResource",
            ResourceCreate3d(_) => "ResourceCreate3d",
            TransferToHost3d(_) => "TransferToHost3d",
            TransferFromHost3d(_) => "TransferFromHost3d",
            CmdSubmit3d { .. } => "CmdSubmit3d",
            ResourceCreateBlob(_) => "ResourceCreateBlob",
            ResourceMapBlob(_) => "ResourceMapBlob",
            ResourceUnmapBlob(_) => "ResourceUnmapBlob",
            ResourceAssignUuid(_) => "ResourceAssignUuid",
        }
    }

    /// Reads the control header at the start of a chain.
    ///
    /// A chain shorter than the header is not rejected: the missing bytes
    /// stay zero and decoding carries on with what was read.
    pub fn decode_header(reader: &mut Reader) -> virtio_gpu_ctrl_hdr {
        let (hdr, read) = read_partial::<virtio_gpu_ctrl_hdr>(reader);
        if read != size_of::<virtio_gpu_ctrl_hdr>() {
            warn!(
                "Command header size mismatch: got {read} bytes, expected {}",
                size_of::<virtio_gpu_ctrl_hdr>()
            );
        }
        hdr
    }

    /// Decodes the command body described by `hdr`.
    pub fn decode_body(
        hdr: &virtio_gpu_ctrl_hdr,
        reader: &mut Reader,
    ) -> Result<Self, GpuCommandDecodeError> {
        use self::GpuCommand::*;
        let type_: u32 = hdr.type_.into();
        trace!("Decoding GpuCommand 0x{type_:0x}");
        let cmd = match type_ {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => GetDisplayInfo,
            VIRTIO_GPU_CMD_GET_EDID => GetEdid(read_payload(reader, "get_edid")?),
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => {
                ResourceCreate2d(read_payload(reader, "resource_create_2d")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_UNREF => ResourceUnref(read_payload(reader, "resource_unref")?),
            VIRTIO_GPU_CMD_SET_SCANOUT => SetScanout(read_payload(reader, "set_scanout")?),
            VIRTIO_GPU_CMD_SET_SCANOUT_BLOB => {
                SetScanoutBlob(read_payload(reader, "set_scanout_blob")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_FLUSH => ResourceFlush(read_payload(reader, "resource_flush")?),
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => {
                TransferToHost2d(read_payload(reader, "transfer_to_host_2d")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => {
                let info: virtio_gpu_resource_attach_backing =
                    read_payload(reader, "resource_attach_backing")?;
                let entries = read_mem_entries(reader, info.nr_entries.into());
                ResourceAttachBacking(info, entries)
            }
            VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => {
                ResourceDetachBacking(read_payload(reader, "resource_detach_backing")?)
            }
            VIRTIO_GPU_CMD_GET_CAPSET_INFO => {
                GetCapsetInfo(read_payload(reader, "get_capset_info")?)
            }
            VIRTIO_GPU_CMD_GET_CAPSET => GetCapset(read_payload(reader, "get_capset")?),
            VIRTIO_GPU_CMD_CTX_CREATE => CtxCreate(read_payload(reader, "ctx_create")?),
            VIRTIO_GPU_CMD_CTX_DESTROY => CtxDestroy(read_payload(reader, "ctx_destroy")?),
            VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE => {
                CtxAttachResource(read_payload(reader, "ctx_attach_resource")?)
            }
            VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE => {
                CtxDetachResource(read_payload(reader, "ctx_detach_resource")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_CREATE_3D => {
                ResourceCreate3d(read_payload(reader, "resource_create_3d")?)
            }
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D => {
                TransferToHost3d(read_payload(reader, "transfer_to_host_3d")?)
            }
            VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D => {
                TransferFromHost3d(read_payload(reader, "transfer_from_host_3d")?)
            }
            VIRTIO_GPU_CMD_SUBMIT_3D => {
                let info: virtio_gpu_cmd_submit = read_payload(reader, "cmd_submit")?;
                let num_in_fences = u32::from(info.num_in_fences) as usize;
                if num_in_fences * size_of::<u64>() > reader.available_bytes() {
                    return Err(GpuCommandDecodeError::Payload(
                        "cmd_submit",
                        io::Error::from(io::ErrorKind::UnexpectedEof),
                    ));
                }
                let mut fence_ids = Vec::with_capacity(num_in_fences);
                for _ in 0..num_in_fences {
                    fence_ids.push(read_payload::<u64>(reader, "cmd_submit fence")?);
                }
                let mut cmd_data = vec![0; u32::from(info.size) as usize];
                reader
                    .read_exact(&mut cmd_data[..])
                    .map_err(|e| GpuCommandDecodeError::Payload("cmd_submit data", e))?;
                CmdSubmit3d {
                    cmd_data,
                    fence_ids,
                }
            }
            VIRTIO_GPU_CMD_RESOURCE_CREATE_BLOB => {
                ResourceCreateBlob(read_payload(reader, "resource_create_blob")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_MAP_BLOB => {
                ResourceMapBlob(read_payload(reader, "resource_map_blob")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_UNMAP_BLOB => {
                ResourceUnmapBlob(read_payload(reader, "resource_unmap_blob")?)
            }
            VIRTIO_GPU_CMD_RESOURCE_ASSIGN_UUID => {
                ResourceAssignUuid(read_payload(reader, "resource_assign_uuid")?)
            }
            _ => return Err(GpuCommandDecodeError::InvalidType(type_)),
        };

        Ok(cmd)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct GpuResponsePlaneInfo {
    pub stride: u32,
    pub offset: u32,
}

/// A response to a `GpuCommand`. These correspond to `VIRTIO_GPU_RESP_*`.
#[derive(Debug)]
pub enum GpuResponse {
    OkNoData,
    /// `(width, height, enabled)` per scanout.
    OkDisplayInfo(Vec<(u32, u32, bool)>),
    OkEdid {
        /// The EDID display data blob (as specified by VESA)
        blob: Box<[u8]>,
    },
    OkCapsetInfo {
        capset_id: u32,
        version: u32,
        size: u32,
    },
    OkCapset(Vec<u8>),
    OkResourcePlaneInfo {
        format_modifier: u64,
        plane_info: Vec<GpuResponsePlaneInfo>,
    },
    OkResourceUuid {
        uuid: [u8; 16],
    },
    ErrUnspec,
    ErrRutabaga(RutabagaError),
    ErrOutOfMemory,
    ErrInvalidScanoutId,
    ErrInvalidResourceId,
    ErrInvalidContextId,
    ErrInvalidParameter,
}

impl From<RutabagaError> for GpuResponse {
    fn from(e: RutabagaError) -> Self {
        Self::ErrRutabaga(e)
    }
}

impl Display for GpuResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ErrRutabaga(e) => write!(f, "renderer error: {e}"),
            other => write!(f, "response 0x{:x}", other.get_type()),
        }
    }
}

/// An error indicating something went wrong encoding a `GpuResponse`.
#[derive(Error, Debug)]
pub enum GpuResponseEncodeError {
    /// An I/O error occurred.
    #[error("an I/O error occurred: {0}")]
    IO(#[from] io::Error),
    /// Size conversion failed
    #[error("Size conversion failed")]
    SizeOverflow,
    /// More displays than are valid were in a `OkDisplayInfo`.
    #[error("{0} is more displays than are valid")]
    TooManyDisplays(usize),
    /// More planes than are valid were in a `OkResourcePlaneInfo`.
    #[error("{0} is more planes than are valid")]
    TooManyPlanes(usize),
    /// The EDID blob does not fit the response.
    #[error("EDID blob of {0} bytes is too large")]
    EdidTooLarge(usize),
}

pub type VirtioGpuResult = std::result::Result<GpuResponse, GpuResponse>;

impl GpuResponse {
    /// Encodes this `GpuResponse` into `writer` using the given header
    /// metadata. Returns the number of bytes written.
    pub fn encode(
        &self,
        flags: u32,
        fence_id: u64,
        ctx_id: u32,
        ring_idx: u8,
        writer: &mut Writer,
    ) -> Result<u32, GpuResponseEncodeError> {
        let hdr = virtio_gpu_ctrl_hdr {
            type_: self.get_type().into(),
            flags: flags.into(),
            fence_id: fence_id.into(),
            ctx_id: ctx_id.into(),
            ring_idx,
            padding: Default::default(),
        };
        let len = match *self {
            Self::OkDisplayInfo(ref info) => {
                if info.len() > VIRTIO_GPU_MAX_SCANOUTS as usize {
                    return Err(GpuResponseEncodeError::TooManyDisplays(info.len()));
                }
                let mut disp_info = virtio_gpu_resp_display_info {
                    hdr,
                    pmodes: Default::default(),
                };
                for (disp_mode, &(width, height, enabled)) in disp_info.pmodes.iter_mut().zip(info)
                {
                    disp_mode.r.width = width.into();
                    disp_mode.r.height = height.into();
                    disp_mode.enabled = u32::from(enabled).into();
                }
                writer.write_obj(disp_info)?;
                size_of_val(&disp_info)
            }
            Self::OkEdid { ref blob } => {
                if blob.len() > EDID_BLOB_MAX_SIZE {
                    return Err(GpuResponseEncodeError::EdidTooLarge(blob.len()));
                }
                let mut edid_info = virtio_gpu_resp_edid {
                    hdr,
                    size: (blob.len() as u32).into(),
                    padding: Le32::default(),
                    edid: [0; EDID_BLOB_MAX_SIZE],
                };
                edid_info.edid[..blob.len()].copy_from_slice(blob);
                writer.write_obj(edid_info)?;
                size_of_val(&edid_info)
            }
            Self::OkCapsetInfo {
                capset_id,
                version,
                size,
            } => {
                writer.write_obj(virtio_gpu_resp_capset_info {
                    hdr,
                    capset_id: capset_id.into(),
                    capset_max_version: version.into(),
                    capset_max_size: size.into(),
                    padding: 0u32.into(),
                })?;
                size_of::<virtio_gpu_resp_capset_info>()
            }
            Self::OkCapset(ref data) => {
                writer.write_obj(hdr)?;
                writer.write_all(data)?;
                size_of_val(&hdr) + data.len()
            }
            Self::OkResourcePlaneInfo {
                format_modifier,
                ref plane_info,
            } => {
                if plane_info.len() > PLANE_INFO_MAX_COUNT {
                    return Err(GpuResponseEncodeError::TooManyPlanes(plane_info.len()));
                }
                let mut strides = [Le32::default(); PLANE_INFO_MAX_COUNT];
                let mut offsets = [Le32::default(); PLANE_INFO_MAX_COUNT];
                for (plane_index, plane) in plane_info.iter().enumerate() {
                    strides[plane_index] = plane.stride.into();
                    offsets[plane_index] = plane.offset.into();
                }
                let resp = virtio_gpu_resp_resource_plane_info {
                    hdr,
                    count: (plane_info.len() as u32).into(),
                    padding: 0u32.into(),
                    format_modifier: format_modifier.into(),
                    strides,
                    offsets,
                };
                if writer.available_bytes() >= size_of_val(&resp) {
                    writer.write_obj(resp)?;
                    size_of_val(&resp)
                } else {
                    // Not enough room for the plane info, degrade to a plain
                    // VIRTIO_GPU_RESP_OK_NODATA.
                    writer.write_obj(virtio_gpu_ctrl_hdr {
                        type_: Le32::from(VIRTIO_GPU_RESP_OK_NODATA),
                        ..hdr
                    })?;
                    size_of_val(&hdr)
                }
            }
            Self::OkResourceUuid { uuid } => {
                let resp = virtio_gpu_resp_resource_uuid { hdr, uuid };
                writer.write_obj(resp)?;
                size_of_val(&resp)
            }
            _ => {
                writer.write_obj(hdr)?;
                size_of_val(&hdr)
            }
        };

        u32::try_from(len).map_err(|_| GpuResponseEncodeError::SizeOverflow)
    }

    /// Gets the `VIRTIO_GPU_*` enum value that corresponds to this variant.
    pub const fn get_type(&self) -> u32 {
        match self {
            Self::OkNoData => VIRTIO_GPU_RESP_OK_NODATA,
            Self::OkDisplayInfo(_) => VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
            Self::OkEdid { .. } => VIRTIO_GPU_RESP_OK_EDID,
            Self::OkCapsetInfo { .. } => VIRTIO_GPU_RESP_OK_CAPSET_INFO,
            Self::OkCapset(_) => VIRTIO_GPU_RESP_OK_CAPSET,
            Self::OkResourcePlaneInfo { .. } => VIRTIO_GPU_RESP_OK_RESOURCE_PLANE_INFO,
            Self::OkResourceUuid { .. } => VIRTIO_GPU_RESP_OK_RESOURCE_UUID,
            Self::ErrUnspec | Self::ErrRutabaga(_) => VIRTIO_GPU_RESP_ERR_UNSPEC,
            Self::ErrOutOfMemory => VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY,
            Self::ErrInvalidScanoutId => VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID,
            Self::ErrInvalidResourceId => VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
            Self::ErrInvalidContextId => VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID,
            Self::ErrInvalidParameter => VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER,
        }
    }
}

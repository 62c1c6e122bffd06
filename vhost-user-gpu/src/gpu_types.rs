// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Backend neutral geometry and transfer descriptors.

/// Generates an implementation of `From<Transfer3DDesc>` for any compatible
/// target struct.
macro_rules! impl_transfer3d_from_desc {
    ($target:path) => {
        impl From<Transfer3DDesc> for $target {
            fn from(desc: Transfer3DDesc) -> Self {
                Self {
                    x: desc.x,
                    y: desc.y,
                    z: desc.z,
                    w: desc.w,
                    h: desc.h,
                    d: desc.d,
                    level: desc.level,
                    stride: desc.stride,
                    layer_stride: desc.layer_stride,
                    offset: desc.offset,
                }
            }
        }
    };
}

use std::cmp::{max, min};

use rutabaga_gfx::Transfer3D;

use crate::protocol::{virtio_gpu_rect, virtio_gpu_resource_create_3d, virtio_gpu_transfer_host_3d};

/// An axis aligned rectangle in resource or scanout coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<virtio_gpu_rect> for Rect {
    fn from(r: virtio_gpu_rect) -> Self {
        Self {
            x: r.x.into(),
            y: r.y.into(),
            width: r.width.into(),
            height: r.height.into(),
        }
    }
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle lies inside a `width` x `height` surface.
    ///
    /// Every coordinate is checked on its own as well as through the far
    /// edges, a guest can pick values that wrap around when summed.
    pub fn within(&self, width: u32, height: u32) -> bool {
        self.x <= width
            && self.y <= height
            && self.width <= width
            && self.height <= height
            && u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The overlapping area of both rectangles, empty if they are disjoint.
    pub fn intersect(&self, other: &Self) -> Self {
        let x1 = max(self.x, other.x);
        let y1 = max(self.y, other.y);
        let x2 = min(
            u64::from(self.x) + u64::from(self.width),
            u64::from(other.x) + u64::from(other.width),
        );
        let y2 = min(
            u64::from(self.y) + u64::from(self.height),
            u64::from(other.y) + u64::from(other.height),
        );
        if u64::from(x1) >= x2 || u64::from(y1) >= y2 {
            return Self::new(x1, y1, 0, 0);
        }
        // Both far edges are bounded by a u32 origin plus a u32 extent, and the
        // difference to the near edge fits a u32 extent again.
        Self::new(x1, y1, (x2 - u64::from(x1)) as u32, (y2 - u64::from(y1)) as u32)
    }

    /// Moves the origin by `(-dx, -dy)`. `dx`/`dy` must not exceed `x`/`y`.
    pub const fn translate_back(&self, dx: u32, dy: u32) -> Self {
        Self::new(
            self.x.saturating_sub(dx),
            self.y.saturating_sub(dy),
            self.width,
            self.height,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer3DDesc {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
    pub level: u32,
    pub stride: u32,
    pub layer_stride: u32,
    pub offset: u64,
}

impl Transfer3DDesc {
    /// Constructs a 2 dimensional XY box in 3 dimensional space with unit depth
    /// and zero displacement on the Z axis.
    pub const fn new_2d(x: u32, y: u32, w: u32, h: u32, offset: u64) -> Self {
        Self {
            x,
            y,
            z: 0,
            w,
            h,
            d: 1,
            level: 0,
            stride: 0,
            layer_stride: 0,
            offset,
        }
    }
}

impl From<virtio_gpu_transfer_host_3d> for Transfer3DDesc {
    fn from(t: virtio_gpu_transfer_host_3d) -> Self {
        Self {
            x: t.box_.x.into(),
            y: t.box_.y.into(),
            z: t.box_.z.into(),
            w: t.box_.w.into(),
            h: t.box_.h.into(),
            d: t.box_.d.into(),
            level: t.level.into(),
            stride: t.stride.into(),
            layer_stride: t.layer_stride.into(),
            offset: t.offset.into(),
        }
    }
}

impl_transfer3d_from_desc!(Transfer3D);

/// Creation parameters of an accelerated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCreate3d {
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
}

impl From<virtio_gpu_resource_create_3d> for ResourceCreate3d {
    fn from(c: virtio_gpu_resource_create_3d) -> Self {
        Self {
            target: c.target.into(),
            format: c.format.into(),
            bind: c.bind.into(),
            width: c.width.into(),
            height: c.height.into(),
            depth: c.depth.into(),
            array_size: c.array_size.into(),
            last_level: c.last_level.into(),
            nr_samples: c.nr_samples.into(),
            flags: c.flags.into(),
        }
    }
}

impl From<ResourceCreate3d> for rutabaga_gfx::ResourceCreate3D {
    fn from(r: ResourceCreate3d) -> Self {
        Self {
            target: r.target,
            format: r.format,
            bind: r.bind,
            width: r.width,
            height: r.height,
            depth: r.depth,
            array_size: r.array_size,
            last_level: r.last_level,
            nr_samples: r.nr_samples,
            flags: r.flags,
        }
    }
}

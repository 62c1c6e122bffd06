// VIRTIO GPU Emulation via vhost-user
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{path::PathBuf, process::exit};

use clap::{ArgAction, Parser, ValueEnum};
use log::error;
use vhost_user_gpu::{
    start_backend, GpuCapset, GpuConfig, GpuConfigBuilder, GpuConfigError, GpuFlags, GpuMode,
};

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
// __Null is a placeholder to prevent a zero-variant enum when building with
// --no-default-features, not an implementation of the non-exhaustive pattern
#[allow(clippy::manual_non_exhaustive)]
pub enum CapsetName {
    /// [virglrenderer] OpenGL implementation, superseded by Virgl2
    #[cfg(feature = "backend-virgl")]
    Virgl = GpuCapset::VIRGL.bits(),

    /// [virglrenderer] OpenGL implementation
    #[cfg(feature = "backend-virgl")]
    Virgl2 = GpuCapset::VIRGL2.bits(),

    /// [gfxstream] Vulkan implementation
    #[cfg(feature = "backend-gfxstream")]
    GfxstreamVulkan = GpuCapset::GFXSTREAM_VULKAN.bits(),

    /// [gfxstream] OpenGL ES implementation
    #[cfg(feature = "backend-gfxstream")]
    GfxstreamGles = GpuCapset::GFXSTREAM_GLES.bits(),

    /// Placeholder variant to prevent zero-variant enum when no accelerated
    /// backend is built in. The software renderer doesn't use capsets, so
    /// this maps to GpuCapset::empty().
    #[doc(hidden)]
    __Null = 0,
}

impl From<CapsetName> for GpuCapset {
    fn from(capset_name: CapsetName) -> GpuCapset {
        if matches!(capset_name, CapsetName::__Null) {
            return GpuCapset::empty();
        }

        GpuCapset::from_bits(capset_name as u64)
            .expect("Internal error: CapsetName enum is incorrectly defined")
    }
}

pub fn capset_names_into_capset(capset_names: impl IntoIterator<Item = CapsetName>) -> GpuCapset {
    capset_names
        .into_iter()
        .map(CapsetName::into)
        .fold(GpuCapset::empty(), GpuCapset::union)
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct GpuArgs {
    /// vhost-user Unix domain socket.
    #[clap(short, long, value_name = "SOCKET")]
    pub socket_path: PathBuf,

    /// The mode specifies which renderer to use
    #[clap(short, long, value_enum, default_value_t = GpuMode::Software)]
    pub gpu_mode: GpuMode,

    /// Comma separated list of enabled capsets
    #[clap(short, long, value_delimiter = ',')]
    pub capset: Option<Vec<CapsetName>>,

    /// Number of outputs exposed to the guest
    #[clap(long, default_value_t = GpuConfig::DEFAULT_MAX_OUTPUTS)]
    pub max_outputs: u32,

    /// Upper bound, in bytes, on the host memory held by resources
    #[clap(long, default_value_t = GpuConfig::DEFAULT_MAX_HOSTMEM)]
    pub max_hostmem: u64,

    /// Back resources with udmabuf so scanouts can be shared as DMA-bufs
    /// (software mode only)
    #[clap(long, action = ArgAction::SetTrue, default_value_t = false)]
    pub udmabuf: bool,

    /// Unix domain socket of a display process to connect to. Without it the
    /// display channel is the one handed over by the vhost-user frontend.
    #[clap(long, value_name = "SOCKET")]
    pub display_socket: Option<PathBuf>,

    #[clap(flatten)]
    pub flags: GpuFlagsArgs,
}

#[derive(Parser, Debug)]
pub struct GpuFlagsArgs {
    /// Enable backend to use EGL
    #[clap(
            long,
            action = ArgAction::Set,
            default_value_t = GpuFlags::new_default().use_egl
    )]
    pub use_egl: bool,

    /// Enable backend to use GLX
    #[clap(
            long,
            action = ArgAction::Set,
            default_value_t = GpuFlags::new_default().use_glx
    )]
    pub use_glx: bool,

    /// Enable backend to use GLES
    #[clap(
            long,
            action = ArgAction::Set,
            default_value_t = GpuFlags::new_default().use_gles
    )]
    pub use_gles: bool,

    /// Enable surfaceless backend option
    #[clap(
            long,
            action = ArgAction::Set,
            default_value_t = GpuFlags::new_default().use_surfaceless
    )]
    pub use_surfaceless: bool,
}

impl From<GpuFlagsArgs> for GpuFlags {
    fn from(args: GpuFlagsArgs) -> Self {
        GpuFlags {
            use_egl: args.use_egl,
            use_glx: args.use_glx,
            use_gles: args.use_gles,
            use_surfaceless: args.use_surfaceless,
        }
    }
}

pub fn config_from_args(args: GpuArgs) -> Result<(PathBuf, GpuConfig), GpuConfigError> {
    let flags = GpuFlags::from(args.flags);
    let capset = args.capset.map(capset_names_into_capset);
    let mut builder = GpuConfigBuilder::default()
        .set_gpu_mode(args.gpu_mode)
        .set_flags(flags)
        .set_max_outputs(args.max_outputs)
        .set_max_hostmem(args.max_hostmem)
        .set_udmabuf(args.udmabuf);
    if let Some(capset) = capset {
        builder = builder.set_capset(capset);
    }
    if let Some(display_socket) = args.display_socket {
        builder = builder.set_display_socket(display_socket);
    }

    let config = builder.build()?;
    Ok((args.socket_path, config))
}

pub fn main() {
    env_logger::init();

    let args = GpuArgs::parse();

    let (socket_path, config) = match config_from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    if let Err(e) = start_backend(&socket_path, config) {
        error!("{e}");
        exit(1);
    }
}

// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

// Module for backends
pub mod backend;
pub mod buffer;
pub mod cursor;
pub mod device;
pub mod display;
pub mod fence;
pub mod gpu_types;
pub mod image;
pub mod mapping;
pub mod protocol;
// Module for the common renderer trait
pub mod renderer;
pub mod resource;
pub mod scanout;
#[cfg(test)]
pub(crate) mod testutils;

use std::{
    fmt::{Display, Formatter},
    io,
    path::{Path, PathBuf},
};

use bitflags::bitflags;
use clap::ValueEnum;
use log::info;
#[cfg(feature = "backend-gfxstream")]
use rutabaga_gfx::{RUTABAGA_CAPSET_GFXSTREAM_GLES, RUTABAGA_CAPSET_GFXSTREAM_VULKAN};
#[cfg(feature = "backend-virgl")]
use rutabaga_gfx::{RUTABAGA_CAPSET_VIRGL, RUTABAGA_CAPSET_VIRGL2};
use thiserror::Error as ThisError;
use vhost_user_backend::VhostUserDaemon;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};

use crate::{
    device::VhostUserGpuBackend, display::FrontendChannel, protocol::VIRTIO_GPU_MAX_SCANOUTS,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GpuMode {
    /// CPU rendering of 2D resources
    Software,
    #[value(name = "virglrenderer", alias("virgl-renderer"))]
    #[cfg(feature = "backend-virgl")]
    VirglRenderer,
    #[cfg(feature = "backend-gfxstream")]
    Gfxstream,
}

impl GpuMode {
    /// Whether the mode renders through rutabaga.
    pub const fn is_accelerated(self) -> bool {
        !matches!(self, Self::Software)
    }
}

impl Display for GpuMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software => write!(f, "software"),
            #[cfg(feature = "backend-virgl")]
            Self::VirglRenderer => write!(f, "virglrenderer"),
            #[cfg(feature = "backend-gfxstream")]
            Self::Gfxstream => write!(f, "gfxstream"),
        }
    }
}

bitflags! {
    /// A bitmask for representing supported gpu capability sets.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GpuCapset: u64 {
        #[cfg(feature = "backend-virgl")]
        const VIRGL = 1 << RUTABAGA_CAPSET_VIRGL as u64;
        #[cfg(feature = "backend-virgl")]
        const VIRGL2 = 1 << RUTABAGA_CAPSET_VIRGL2 as u64;
        #[cfg(feature = "backend-virgl")]
        const ALL_VIRGLRENDERER_CAPSETS = Self::VIRGL.bits() | Self::VIRGL2.bits();

        #[cfg(feature = "backend-gfxstream")]
        const GFXSTREAM_VULKAN = 1 << RUTABAGA_CAPSET_GFXSTREAM_VULKAN as u64;
        #[cfg(feature = "backend-gfxstream")]
        const GFXSTREAM_GLES = 1 << RUTABAGA_CAPSET_GFXSTREAM_GLES as u64;
        #[cfg(feature = "backend-gfxstream")]
        const ALL_GFXSTREAM_CAPSETS = Self::GFXSTREAM_VULKAN.bits() | Self::GFXSTREAM_GLES.bits();
    }
}

impl Display for GpuCapset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }

        let mut first = true;
        #[allow(unused_assignments)]
        for capset in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;

            match capset {
                #[cfg(feature = "backend-virgl")]
                Self::VIRGL => write!(f, "virgl")?,
                #[cfg(feature = "backend-virgl")]
                Self::VIRGL2 => write!(f, "virgl2")?,
                #[cfg(feature = "backend-gfxstream")]
                Self::GFXSTREAM_VULKAN => write!(f, "gfxstream-vulkan")?,
                #[cfg(feature = "backend-gfxstream")]
                Self::GFXSTREAM_GLES => write!(f, "gfxstream-gles")?,
                _ => write!(f, "{:#x}", capset.bits())?,
            }
        }

        Ok(())
    }
}

impl GpuCapset {
    /// Return the number of enabled capsets
    pub const fn num_capsets(self) -> u32 {
        self.bits().count_ones()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuFlags {
    pub use_egl: bool,
    pub use_glx: bool,
    pub use_gles: bool,
    pub use_surfaceless: bool,
}

impl GpuFlags {
    // `const` version of `default()`
    pub const fn new_default() -> Self {
        Self {
            use_egl: true,
            use_glx: false,
            use_gles: true,
            use_surfaceless: true,
        }
    }
}

impl Default for GpuFlags {
    fn default() -> Self {
        Self::new_default()
    }
}

#[derive(Debug, ThisError)]
pub enum GpuConfigError {
    #[error("The mode {0} does not support {1} capset")]
    CapsetUnsupportedByMode(GpuMode, GpuCapset),
    #[error("Requested gfxstream-gles capset, but gles is disabled")]
    GlesRequiredByGfxstream,
    #[error("The number of outputs must be between 1 and {VIRTIO_GPU_MAX_SCANOUTS}, got {0}")]
    InvalidMaxOutputs(u32),
    #[error("udmabuf allocation is only available in software mode, not {0}")]
    UdmabufUnsupportedByMode(GpuMode),
}

#[derive(Debug, Clone)]
/// This structure holds the configuration for the GPU backend
pub struct GpuConfig {
    gpu_mode: GpuMode,
    capset: GpuCapset,
    flags: GpuFlags,
    max_outputs: u32,
    max_hostmem: u64,
    udmabuf: bool,
    display_socket: Option<PathBuf>,
}

impl GpuConfig {
    #[cfg(feature = "backend-virgl")]
    pub const DEFAULT_VIRGLRENDER_CAPSET_MASK: GpuCapset = GpuCapset::ALL_VIRGLRENDERER_CAPSETS;

    #[cfg(feature = "backend-gfxstream")]
    pub const DEFAULT_GFXSTREAM_CAPSET_MASK: GpuCapset = GpuCapset::ALL_GFXSTREAM_CAPSETS;

    pub const DEFAULT_MAX_OUTPUTS: u32 = VIRTIO_GPU_MAX_SCANOUTS;
    pub const DEFAULT_MAX_HOSTMEM: u64 = 256 * 1024 * 1024;

    pub const fn get_default_capset_for_mode(gpu_mode: GpuMode) -> GpuCapset {
        match gpu_mode {
            GpuMode::Software => GpuCapset::empty(),
            #[cfg(feature = "backend-virgl")]
            GpuMode::VirglRenderer => Self::DEFAULT_VIRGLRENDER_CAPSET_MASK,
            #[cfg(feature = "backend-gfxstream")]
            GpuMode::Gfxstream => Self::DEFAULT_GFXSTREAM_CAPSET_MASK,
        }
    }

    fn validate_capset(gpu_mode: GpuMode, capset: GpuCapset) -> Result<(), GpuConfigError> {
        let supported_capset_mask = Self::get_default_capset_for_mode(gpu_mode);
        for capset in capset.iter() {
            if !supported_capset_mask.contains(capset) {
                return Err(GpuConfigError::CapsetUnsupportedByMode(gpu_mode, capset));
            }
        }

        Ok(())
    }

    pub const fn gpu_mode(&self) -> GpuMode {
        self.gpu_mode
    }

    pub const fn capsets(&self) -> GpuCapset {
        self.capset
    }

    pub const fn flags(&self) -> &GpuFlags {
        &self.flags
    }

    pub const fn max_outputs(&self) -> u32 {
        self.max_outputs
    }

    pub const fn max_hostmem(&self) -> u64 {
        self.max_hostmem
    }

    pub const fn udmabuf(&self) -> bool {
        self.udmabuf
    }

    pub fn display_socket(&self) -> Option<&Path> {
        self.display_socket.as_deref()
    }
}

/// Collects and validates the parameters fed into the gpu-backend server.
#[derive(Debug, Clone)]
pub struct GpuConfigBuilder {
    gpu_mode: GpuMode,
    capset: Option<GpuCapset>,
    flags: GpuFlags,
    max_outputs: u32,
    max_hostmem: u64,
    udmabuf: bool,
    display_socket: Option<PathBuf>,
}

impl Default for GpuConfigBuilder {
    fn default() -> Self {
        Self {
            gpu_mode: GpuMode::Software,
            capset: None,
            flags: GpuFlags::default(),
            max_outputs: GpuConfig::DEFAULT_MAX_OUTPUTS,
            max_hostmem: GpuConfig::DEFAULT_MAX_HOSTMEM,
            udmabuf: false,
            display_socket: None,
        }
    }
}

impl GpuConfigBuilder {
    pub const fn set_gpu_mode(mut self, gpu_mode: GpuMode) -> Self {
        self.gpu_mode = gpu_mode;
        self
    }

    /// Without an explicit capset the mode's default set is used.
    pub const fn set_capset(mut self, capset: GpuCapset) -> Self {
        self.capset = Some(capset);
        self
    }

    pub fn set_flags(mut self, flags: GpuFlags) -> Self {
        self.flags = flags;
        self
    }

    pub const fn set_max_outputs(mut self, max_outputs: u32) -> Self {
        self.max_outputs = max_outputs;
        self
    }

    pub const fn set_max_hostmem(mut self, max_hostmem: u64) -> Self {
        self.max_hostmem = max_hostmem;
        self
    }

    pub const fn set_udmabuf(mut self, udmabuf: bool) -> Self {
        self.udmabuf = udmabuf;
        self
    }

    pub fn set_display_socket<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.display_socket = Some(path.into());
        self
    }

    pub fn build(self) -> Result<GpuConfig, GpuConfigError> {
        let capset = self
            .capset
            .unwrap_or_else(|| GpuConfig::get_default_capset_for_mode(self.gpu_mode));
        GpuConfig::validate_capset(self.gpu_mode, capset)?;

        #[cfg(feature = "backend-gfxstream")]
        if capset.contains(GpuCapset::GFXSTREAM_GLES) && !self.flags.use_gles {
            return Err(GpuConfigError::GlesRequiredByGfxstream);
        }

        if !(1..=VIRTIO_GPU_MAX_SCANOUTS).contains(&self.max_outputs) {
            return Err(GpuConfigError::InvalidMaxOutputs(self.max_outputs));
        }
        if self.udmabuf && self.gpu_mode.is_accelerated() {
            return Err(GpuConfigError::UdmabufUnsupportedByMode(self.gpu_mode));
        }

        Ok(GpuConfig {
            gpu_mode: self.gpu_mode,
            capset,
            flags: self.flags,
            max_outputs: self.max_outputs,
            max_hostmem: self.max_hostmem,
            udmabuf: self.udmabuf,
            display_socket: self.display_socket,
        })
    }
}

#[derive(Debug, ThisError)]
pub enum StartError {
    #[error("Could not create backend: {0}")]
    CouldNotCreateBackend(device::Error),
    #[error("Could not connect to the display at {0}: {1}")]
    CouldNotConnectDisplay(PathBuf, io::Error),
    #[error("Could not create daemon: {0}")]
    CouldNotCreateDaemon(vhost_user_backend::Error),
    #[error("Fatal error: {0}")]
    ServeFailed(vhost_user_backend::Error),
}

pub fn start_backend(socket_path: &Path, config: GpuConfig) -> Result<(), StartError> {
    info!("Starting backend");
    let display_socket = config.display_socket().map(Path::to_path_buf);
    let backend = VhostUserGpuBackend::new(config).map_err(StartError::CouldNotCreateBackend)?;

    if let Some(path) = display_socket {
        let channel = FrontendChannel::connect(&path)
            .map_err(|e| StartError::CouldNotConnectDisplay(path, e))?;
        backend.set_frontend(Box::new(channel));
    }

    let mut daemon = VhostUserDaemon::new(
        "vhost-user-gpu-backend".to_string(),
        backend.clone(),
        GuestMemoryAtomic::new(GuestMemoryMmap::new()),
    )
    .map_err(StartError::CouldNotCreateDaemon)?;

    backend.set_epoll_handler(&daemon.get_epoll_handlers());

    daemon.serve(socket_path).map_err(StartError::ServeFailed)?;
    Ok(())
}

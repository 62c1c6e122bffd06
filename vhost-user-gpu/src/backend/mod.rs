// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod common;
#[cfg(any(feature = "backend-virgl", feature = "backend-gfxstream"))]
pub mod rutabaga;
pub mod software;

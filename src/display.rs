// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The display pipeline.
//!
//! Decoded frames enter through [`pipeline::DisplayPipeline::blit`], which
//! builds a hardware composition task (crop, scale, optional deinterlace),
//! executes it against the back page of the framebuffer, and enqueues the
//! resulting page flip. A dedicated thread consumes the flip queue in
//! submission order and pans the framebuffer at the vertical blank, so
//! frames never tear and are shown exactly in the order they were
//! submitted.

pub mod pipeline;
pub mod queue;
pub mod task;

use enumn::N;
use thiserror::Error;

use crate::device::DeviceError;

pub use crate::device::blit::FieldFlags;
pub use crate::device::blit::Motion;

/// Deinterlace algorithm requested by the player settings. The raw codes
/// match the settings values, so a stored setting converts via
/// [`DeintMethod::n`].
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeintMethod {
    #[default]
    Auto = 0,
    Weave = 1,
    AdvancedMotion = 2,
}

/// Where a composition task lands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlitTarget {
    /// Cycle through the framebuffer pages.
    Auto,
    /// A specific page.
    Page(usize),
    /// The off-screen capture buffer.
    Capture,
}

/// Error returned by display pipeline operations. Display errors never
/// propagate to the decode side; at worst a frame is not shown.
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display device is not configured")]
    NotConfigured,
    #[error("display device call failed")]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

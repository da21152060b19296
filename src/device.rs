// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the fixed-function hardware blocks this crate drives.
//!
//! Three blocks are involved: the video decode engine ([`decode`]), the
//! 2D/deinterlace blitter ([`blit`]) and the framebuffer device ([`fb`]).
//! The decode engine and the blitter are reached through vendor libraries
//! whose bindings live outside this crate, so they are modelled as traits;
//! [`fake`] provides scriptable in-memory implementations used by the test
//! suite. The framebuffer device is plain fbdev and is implemented here
//! directly.

pub mod blit;
pub mod decode;
pub mod fake;
pub mod fb;

use thiserror::Error;

use crate::device::decode::EventSet;

/// Error returned by hardware device calls.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device reported a failure code.
    #[error("device reported failure code {0}")]
    Failure(i32),
    /// The decode call was issued out of sequence. The engine still reports
    /// the events it observed; a resolution change carried here is
    /// recoverable.
    #[error("decode call out of sequence (events {events:?})")]
    WrongCallSequence { events: EventSet },
    /// The device could not satisfy an allocation request.
    #[error("out of device memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("device I/O error: {0}")]
    Io(#[from] nix::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One physically contiguous memory block obtained from the decode engine's
/// allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemBlock {
    pub phys_addr: u64,
    pub virt_addr: u64,
    pub size: usize,
}

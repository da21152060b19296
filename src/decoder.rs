// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware decode session and decoded-frame lifecycle.
//!
//! [`session::DecodeSession`] drives the decode engine one access unit at a
//! time. Decoded frames surface as reference-counted [`buffer::FrameHandle`]s
//! backed by the fixed pool of hardware buffers in [`pool`]; a frame's
//! hardware slot returns to the engine only once every holder has released
//! its reference.

pub mod buffer;
pub mod pool;
pub mod session;

use thiserror::Error;

use crate::decoder::buffer::FrameHandle;
use crate::device::DeviceError;

/// Error returned by decode session methods. Any of these ends
/// hardware-accelerated decoding for the stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream cannot be decoded by this engine: {0}")]
    Unsupported(String),
    #[error("frame pool allocation failed")]
    PoolAllocation(#[source] DeviceError),
    #[error("decode engine call failed")]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of one access-unit submission.
#[derive(Debug)]
pub enum DecodeStatus {
    /// Everything was consumed; feed the next access unit.
    NeedsData,
    /// A frame is ready for display.
    FrameReady(DecodedFrame),
    /// The engine required a flush; in-flight state was discarded and the
    /// caller should resynchronize its timestamps.
    Flushed,
}

/// A decoded picture handed to the caller.
///
/// Dropping this releases the caller's reference; cloning the embedded
/// handle takes a new one.
#[derive(Debug)]
pub struct DecodedFrame {
    pub handle: FrameHandle,
    /// Visible size, from the stream crop.
    pub width: u32,
    pub height: u32,
    /// Anamorphic display size derived from the stream aspect ratio.
    pub display_width: u32,
    pub display_height: u32,
    pub interlaced: bool,
    pub top_field_first: bool,
    /// The engine repeated a picture; the caller should treat this one as
    /// a duplicate.
    pub dropped: bool,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
}

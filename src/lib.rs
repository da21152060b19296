// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated video decode and display for embedded Linux SoCs.
//!
//! This crate drives a fixed-function video decode engine through a frame
//! pool of physically contiguous buffers, and feeds the decoded frames to a
//! display pipeline that scales, deinterlaces and page-flips them onto a
//! framebuffer device without tearing.
//!
//! The hardware itself is reached through the traits in [`device`]; the
//! [`decoder`] module owns the decode session and buffer lifecycle, while
//! [`display`] owns the composition queue and its flip thread.

pub mod decoder;
pub mod device;
pub mod display;
pub mod utils;

use std::str::FromStr;

/// Width and height of a frame or screen, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Pixel layout of a decoded frame as produced by the decode engine.
///
/// The tiled variants are the engine's internal layout and need a detile
/// pass through the 2D engine before they can be scanned out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
    NV12Tiled,
    NV12TiledField,
}

impl DecodedFormat {
    /// Whether this layout requires a detile pass before blitting.
    pub fn is_tiled(&self) -> bool {
        matches!(self, DecodedFormat::NV12Tiled | DecodedFormat::NV12TiledField)
    }
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

/// Axis-aligned rectangle in floating-point coordinates, used for the
/// scaling math of the display pipeline.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Axis-aligned rectangle in integer coordinates, used for hardware crops.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl IRect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware video decode engine.
//!
//! The engine is stateful: a session is opened for one elementary stream,
//! frame buffers are registered with it once the stream geometry is known,
//! and every decode call returns a set of event flags describing what the
//! hardware did with the input. Several flags can be raised by a single
//! call and the session logic depends on examining them in a fixed order.

use std::ops::BitOr;
use std::ops::BitOrAssign;

use enumn::N;

use crate::device::DeviceError;
use crate::device::MemBlock;
use crate::IRect;
use crate::Resolution;

/// Set of event flags reported by one decode call.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);
    /// Stream parameters are available for the first time.
    pub const INIT_DONE: EventSet = EventSet(1 << 0);
    /// Stream geometry changed mid-stream; the frame pool must be rebuilt.
    pub const RESOLUTION_CHANGED: EventSet = EventSet(1 << 1);
    /// One access unit was fully consumed.
    pub const FRAME_CONSUMED: EventSet = EventSet(1 << 2);
    /// A decoded frame is ready for display.
    pub const FRAME_READY: EventSet = EventSet(1 << 3);
    /// A frame was produced but is not meant for display (mosaic/skip
    /// variant); it must still be fetched and returned to the engine.
    pub const MOSAIC_READY: EventSet = EventSet(1 << 4);
    /// The next delivered picture repeats a previous one.
    pub const REPEAT: EventSet = EventSet(1 << 5);
    /// The engine ran out of registered frame buffers.
    pub const NO_BUFFERS: EventSet = EventSet(1 << 6);
    /// The engine skipped a frame.
    pub const SKIP: EventSet = EventSet(1 << 7);
    /// The engine requires a full flush before it can continue.
    pub const FLUSH_NEEDED: EventSet = EventSet(1 << 8);
    /// End of stream reached.
    pub const EOS: EventSet = EventSet(1 << 9);
    /// The engine accepted everything and wants more input.
    pub const NEEDS_INPUT: EventSet = EventSet(1 << 10);
    /// The input buffer of this call was consumed.
    pub const INPUT_USED: EventSet = EventSet(1 << 11);

    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for EventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventSet({:#x})", self.0)
    }
}

/// Field structure of a decoded picture, as reported by the engine.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldType {
    #[default]
    Progressive = 0,
    TopBottom = 1,
    BottomTop = 2,
    Top = 3,
    Bottom = 4,
}

impl FieldType {
    /// Whether the top field of this picture comes first in time.
    pub fn is_top_field_first(&self) -> bool {
        matches!(self, FieldType::TopBottom | FieldType::Top)
    }
}

/// Compressed formats the decode engine accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecFormat {
    Mpeg2,
    H263,
    H264,
    Vc1,
    Mpeg4,
    Avs,
    RealVideo,
    Vp8,
}

impl CodecFormat {
    /// Formats for which the out-of-band codec configuration bytes must be
    /// re-attached to every access unit.
    pub fn requires_codec_data(&self) -> bool {
        matches!(self, CodecFormat::Mpeg2 | CodecFormat::Vc1 | CodecFormat::Mpeg4)
    }

    /// Formats whose queued timestamps are unreliable when a picture is
    /// reported displayable; those get the submission timestamp directly.
    pub fn timestamps_unreliable(&self) -> bool {
        matches!(self, CodecFormat::Vp8)
    }
}

/// How the engine should treat non-reference frames.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SkipMode {
    #[default]
    None,
    NonReference,
}

/// Parameters of a decode session, fixed at open time.
#[derive(Clone, Debug)]
pub struct OpenParams {
    pub format: CodecFormat,
    /// Interleaved chroma (NV12) rather than planar (I420) output.
    pub chroma_interleave: bool,
    pub reorder_enable: bool,
    pub skip_mode: SkipMode,
    /// Frames the engine may buffer before producing output.
    pub buffer_delay: u32,
}

/// Memory the engine needs the caller to allocate before it can be opened.
#[derive(Debug, Clone, Copy)]
pub struct MemRequirement {
    pub size: usize,
    pub alignment: usize,
    /// Physically contiguous (device) memory rather than ordinary heap.
    pub contiguous: bool,
}

/// One satisfied [`MemRequirement`], handed to [`DecodeDevice::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemRegion {
    /// Physical address, 0 for heap allocations.
    pub phys_addr: u64,
    pub virt_addr: u64,
    pub size: usize,
}

/// Stream parameters as parsed by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    /// Minimum number of frame buffers the engine needs registered.
    pub min_frame_buffers: usize,
    /// Required alignment of every plane address, in bytes.
    pub address_alignment: usize,
    /// Region of the coded frame that carries visible pixels.
    pub crop: IRect,
    /// Pixel aspect ratio as a Q16 width/height factor.
    pub aspect_q16: u32,
}

impl StreamInfo {
    pub fn coded_resolution(&self) -> Resolution {
        Resolution { width: self.width, height: self.height }
    }
}

/// One hardware frame buffer registered with the engine: luma and chroma
/// planes plus the co-located motion vector plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameBufferDesc {
    pub y_stride: usize,
    pub c_stride: usize,
    pub y_phys: u64,
    pub cb_phys: u64,
    pub cr_phys: u64,
    pub mv_phys: u64,
    pub y_virt: u64,
    pub cb_virt: u64,
    pub cr_virt: u64,
    pub mv_virt: u64,
}

/// Accounting for one consumed access unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumedInfo {
    /// Luma plane address of the buffer the consumed unit will decode into,
    /// if the engine already knows it.
    pub luma_phys: Option<u64>,
    pub frame_len: usize,
    pub stuff_len: usize,
}

/// A frame the engine reports as displayable.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Luma plane address identifying the pool slot.
    pub luma_phys: u64,
    pub width: u32,
    pub height: u32,
    pub crop: IRect,
    pub aspect_q16: u32,
    pub field: FieldType,
}

/// The hardware video decode engine.
///
/// All calls are issued from the decode thread; implementations do not need
/// to be thread-safe beyond `Send`.
pub trait DecodeDevice: Send {
    /// Allocates a block from the engine's physically contiguous pool.
    fn alloc_contiguous(&mut self, size: usize) -> Result<MemBlock, DeviceError>;

    /// Returns a block to the engine's pool.
    fn free_contiguous(&mut self, block: &MemBlock) -> Result<(), DeviceError>;

    /// Memory the engine needs before [`open`](Self::open) can succeed.
    fn query_memory(&mut self) -> Result<Vec<MemRequirement>, DeviceError>;

    /// Opens a decode session.
    fn open(&mut self, params: &OpenParams, work_mem: &[MemRegion]) -> Result<(), DeviceError>;

    /// Closes the session, releasing the hardware handle.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Whether the engine reports per-access-unit consumption, which is what
    /// makes timestamp look-ahead possible.
    fn frame_size_reporting(&self) -> bool;

    /// Feeds one access unit (possibly empty, to drain) and returns the set
    /// of events the hardware raised.
    fn decode(&mut self, input: &[u8], codec_data: Option<&[u8]>)
        -> Result<EventSet, DeviceError>;

    /// Queries stream parameters; valid after `INIT_DONE` or
    /// `RESOLUTION_CHANGED`.
    fn initial_info(&mut self) -> Result<StreamInfo, DeviceError>;

    /// Registers the frame buffers decoding will target.
    fn register_frame_buffers(&mut self, buffers: &[FrameBufferDesc]) -> Result<(), DeviceError>;

    /// Accounting for the most recently consumed access unit; valid after
    /// `FRAME_CONSUMED`.
    fn consumed_frame_info(&mut self) -> Result<ConsumedInfo, DeviceError>;

    /// Fetches the displayable frame; valid after `FRAME_READY` or
    /// `MOSAIC_READY`.
    fn output_frame(&mut self) -> Result<FrameInfo, DeviceError>;

    /// Tells the engine the buffer holding `luma_phys` has been displayed
    /// and its slot may be decoded into again.
    fn frame_displayed(&mut self, luma_phys: u64) -> Result<(), DeviceError>;

    /// Discards all in-flight state of the session.
    fn flush(&mut self) -> Result<(), DeviceError>;
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scriptable in-memory devices whose only purpose is to let the decode
//! session and the display pipeline run so we can test them in isolation.

use std::collections::VecDeque;

use crate::device::blit::BlitDevice;
use crate::device::blit::DeintTask;
use crate::device::blit::ScratchBuffer;
use crate::device::blit::Surface2d;
use crate::device::blit::TaskCheck;
use crate::device::decode::ConsumedInfo;
use crate::device::decode::DecodeDevice;
use crate::device::decode::EventSet;
use crate::device::decode::FieldType;
use crate::device::decode::FrameBufferDesc;
use crate::device::decode::FrameInfo;
use crate::device::decode::MemRegion;
use crate::device::decode::MemRequirement;
use crate::device::decode::OpenParams;
use crate::device::decode::StreamInfo;
use crate::device::fb::DisplayDevice;
use crate::device::fb::NativeMode;
use crate::device::fb::ScreenConfig;
use crate::device::fb::ScreenMap;
use crate::device::DeviceError;
use crate::device::MemBlock;
use crate::IRect;

/// Calls recorded by [`FakeDecodeDevice`], in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeCall {
    Open,
    Close,
    Decode(usize),
    RegisterBuffers(usize),
    FrameDisplayed(u64),
    Flush,
}

/// Result of one scripted decode call.
#[derive(Debug, Clone, Copy)]
enum Step {
    Events(EventSet),
    WrongCall(EventSet),
    Fail(i32),
}

/// A `FRAME_READY`/`MOSAIC_READY` output resolved against the registered
/// buffers at fetch time, so scripts can name pool slots without knowing
/// their addresses.
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    slot: usize,
    width: u32,
    height: u32,
    crop: IRect,
    aspect_q16: u32,
    field_code: i32,
}

#[derive(Debug, Clone, Copy)]
struct PendingConsumed {
    slot: Option<usize>,
    frame_len: usize,
    stuff_len: usize,
}

/// Scriptable decode engine.
///
/// Tests queue decode-call outcomes with [`push_events`] and friends, then
/// inspect [`calls`] and the allocation counters afterwards.
///
/// [`push_events`]: FakeDecodeDevice::push_events
/// [`calls`]: FakeDecodeDevice::calls
pub struct FakeDecodeDevice {
    pub calls: Vec<DecodeCall>,
    pub registered: Vec<FrameBufferDesc>,
    pub live_allocs: usize,
    pub freed_blocks: Vec<MemBlock>,
    pub frame_reporting: bool,
    stream_info: StreamInfo,
    script: VecDeque<Step>,
    pending_consumed: VecDeque<PendingConsumed>,
    pending_output: VecDeque<PendingFrame>,
    next_phys: u64,
}

impl FakeDecodeDevice {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            registered: Vec::new(),
            live_allocs: 0,
            freed_blocks: Vec::new(),
            frame_reporting: true,
            stream_info: StreamInfo {
                width: 320,
                height: 240,
                interlaced: false,
                min_frame_buffers: 4,
                address_alignment: 1,
                crop: IRect::new(0, 0, 320, 240),
                aspect_q16: 1 << 16,
            },
            script: VecDeque::new(),
            pending_consumed: VecDeque::new(),
            pending_output: VecDeque::new(),
            next_phys: 0x1000_0000,
        }
    }

    pub fn set_stream_info(&mut self, info: StreamInfo) {
        self.stream_info = info;
    }

    /// Scripts the outcome of the next decode call.
    pub fn push_events(&mut self, events: EventSet) {
        self.script.push_back(Step::Events(events));
    }

    /// Scripts a decode call failing with a wrong-call-sequence error while
    /// still reporting `events`.
    pub fn push_wrong_call(&mut self, events: EventSet) {
        self.script.push_back(Step::WrongCall(events));
    }

    /// Scripts a decode call failing outright.
    pub fn push_failure(&mut self, code: i32) {
        self.script.push_back(Step::Fail(code));
    }

    /// Scripts the consumed-frame info for the next `FRAME_CONSUMED` event.
    pub fn push_consumed(&mut self, slot: Option<usize>, frame_len: usize, stuff_len: usize) {
        self.pending_consumed.push_back(PendingConsumed { slot, frame_len, stuff_len });
    }

    /// Scripts the output frame for the next `FRAME_READY`/`MOSAIC_READY`
    /// event, targeting pool slot `slot`. `field_code` is the raw field
    /// value the engine would report.
    pub fn push_output(&mut self, slot: usize, width: u32, height: u32, field_code: i32) {
        self.pending_output.push_back(PendingFrame {
            slot,
            width,
            height,
            crop: IRect::new(0, 0, width as i32, height as i32),
            aspect_q16: 1 << 16,
            field_code,
        });
    }

    /// Remaining scripted decode steps.
    pub fn steps_left(&self) -> usize {
        self.script.len()
    }

    /// Luma address of registered slot `slot`.
    pub fn slot_luma(&self, slot: usize) -> u64 {
        self.registered[slot].y_phys
    }
}

impl Default for FakeDecodeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeDevice for FakeDecodeDevice {
    fn alloc_contiguous(&mut self, size: usize) -> Result<MemBlock, DeviceError> {
        let phys = self.next_phys;
        self.next_phys += crate::utils::align_up(size, 4096) as u64;
        self.live_allocs += 1;
        Ok(MemBlock { phys_addr: phys, virt_addr: phys + 0x8000_0000_0000, size })
    }

    fn free_contiguous(&mut self, block: &MemBlock) -> Result<(), DeviceError> {
        self.live_allocs -= 1;
        self.freed_blocks.push(*block);
        Ok(())
    }

    fn query_memory(&mut self) -> Result<Vec<MemRequirement>, DeviceError> {
        Ok(vec![
            MemRequirement { size: 1 << 16, alignment: 8, contiguous: false },
            MemRequirement { size: 1 << 20, alignment: 4096, contiguous: true },
        ])
    }

    fn open(&mut self, _params: &OpenParams, work_mem: &[MemRegion]) -> Result<(), DeviceError> {
        assert_eq!(work_mem.len(), 2);
        self.calls.push(DecodeCall::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.calls.push(DecodeCall::Close);
        Ok(())
    }

    fn frame_size_reporting(&self) -> bool {
        self.frame_reporting
    }

    fn decode(
        &mut self,
        input: &[u8],
        _codec_data: Option<&[u8]>,
    ) -> Result<EventSet, DeviceError> {
        self.calls.push(DecodeCall::Decode(input.len()));
        match self.script.pop_front() {
            Some(Step::Events(events)) => Ok(events),
            Some(Step::WrongCall(events)) => Err(DeviceError::WrongCallSequence { events }),
            Some(Step::Fail(code)) => Err(DeviceError::Failure(code)),
            None => Ok(EventSet::NEEDS_INPUT | EventSet::INPUT_USED),
        }
    }

    fn initial_info(&mut self) -> Result<StreamInfo, DeviceError> {
        Ok(self.stream_info.clone())
    }

    fn register_frame_buffers(&mut self, buffers: &[FrameBufferDesc]) -> Result<(), DeviceError> {
        self.registered = buffers.to_vec();
        self.calls.push(DecodeCall::RegisterBuffers(buffers.len()));
        Ok(())
    }

    fn consumed_frame_info(&mut self) -> Result<ConsumedInfo, DeviceError> {
        let pending = self
            .pending_consumed
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted consumed-frame info"))?;
        Ok(ConsumedInfo {
            luma_phys: pending.slot.map(|slot| self.registered[slot].y_phys),
            frame_len: pending.frame_len,
            stuff_len: pending.stuff_len,
        })
    }

    fn output_frame(&mut self) -> Result<FrameInfo, DeviceError> {
        let pending = self
            .pending_output
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted output frame"))?;
        Ok(FrameInfo {
            luma_phys: self.registered[pending.slot].y_phys,
            width: pending.width,
            height: pending.height,
            crop: pending.crop,
            aspect_q16: pending.aspect_q16,
            field: FieldType::n(pending.field_code as i64).unwrap_or_default(),
        })
    }

    fn frame_displayed(&mut self, luma_phys: u64) -> Result<(), DeviceError> {
        self.calls.push(DecodeCall::FrameDisplayed(luma_phys));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.calls.push(DecodeCall::Flush);
        Ok(())
    }
}

/// Recording 2D/deinterlace engine.
pub struct FakeBlitDevice {
    pub deint_tasks: Vec<DeintTask>,
    pub blits: Vec<(Surface2d, Surface2d)>,
    pub finishes: usize,
    pub scratch_allocs: usize,
    pub scratch_frees: usize,
    /// Results the next check_task calls will return, oldest first; `Ok`
    /// once exhausted.
    pub check_results: VecDeque<TaskCheck>,
    next_phys: u64,
}

impl FakeBlitDevice {
    pub fn new() -> Self {
        Self {
            deint_tasks: Vec::new(),
            blits: Vec::new(),
            finishes: 0,
            scratch_allocs: 0,
            scratch_frees: 0,
            check_results: VecDeque::new(),
            next_phys: 0x4000_0000,
        }
    }
}

impl Default for FakeBlitDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BlitDevice for FakeBlitDevice {
    fn check_task(&mut self, _task: &DeintTask) -> Result<TaskCheck, DeviceError> {
        Ok(self.check_results.pop_front().unwrap_or(TaskCheck::Ok))
    }

    fn queue_task(&mut self, task: &DeintTask) -> Result<(), DeviceError> {
        self.deint_tasks.push(*task);
        Ok(())
    }

    fn blit(&mut self, src: &Surface2d, dst: &Surface2d) -> Result<(), DeviceError> {
        self.blits.push((*src, *dst));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.finishes += 1;
        Ok(())
    }

    fn alloc_scratch(&mut self, size: usize) -> Result<ScratchBuffer, DeviceError> {
        let phys = self.next_phys;
        self.next_phys += crate::utils::align_up(size, 4096) as u64;
        self.scratch_allocs += 1;
        Ok(ScratchBuffer { phys_addr: phys, size })
    }

    fn free_scratch(&mut self, _buffer: ScratchBuffer) -> Result<(), DeviceError> {
        self.scratch_frees += 1;
        Ok(())
    }
}

/// In-memory display device backed by a plain `Vec`.
pub struct FakeDisplayDevice {
    pub native: NativeMode,
    pub configures: Vec<ScreenConfig>,
    pub pans: Vec<u32>,
    pub vsyncs: usize,
    pub blanks: usize,
    pub unblanks: usize,
    /// When set, the next configure call fails.
    pub fail_configure: bool,
    memory: Vec<u8>,
    line_length: usize,
}

impl FakeDisplayDevice {
    pub fn new() -> Self {
        Self {
            native: NativeMode { width: 1280, height: 720, bits_per_pixel: 32 },
            configures: Vec::new(),
            pans: Vec::new(),
            vsyncs: 0,
            blanks: 0,
            unblanks: 0,
            fail_configure: false,
            memory: Vec::new(),
            line_length: 0,
        }
    }
}

impl Default for FakeDisplayDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayDevice for FakeDisplayDevice {
    fn native_mode(&mut self) -> Result<NativeMode, DeviceError> {
        Ok(self.native)
    }

    fn configure(&mut self, config: &ScreenConfig) -> Result<ScreenMap, DeviceError> {
        if self.fail_configure {
            return Err(DeviceError::Failure(-1));
        }
        self.configures.push(*config);
        self.line_length = (config.width * config.format.bits_per_pixel() / 8) as usize;
        let smem_len = self.line_length * ((config.height + 1) * config.pages) as usize;
        self.memory = vec![0xaa; smem_len];
        Ok(ScreenMap { line_length: self.line_length, smem_start: 0x2000_0000, smem_len })
    }

    fn blank(&mut self) -> Result<(), DeviceError> {
        self.blanks += 1;
        Ok(())
    }

    fn unblank(&mut self) -> Result<(), DeviceError> {
        self.unblanks += 1;
        Ok(())
    }

    fn pan(&mut self, yoffset: u32) -> Result<(), DeviceError> {
        self.pans.push(yoffset);
        Ok(())
    }

    fn wait_vsync(&mut self) -> Result<(), DeviceError> {
        self.vsyncs += 1;
        Ok(())
    }

    fn memory(&mut self) -> Option<&mut [u8]> {
        if self.memory.is_empty() {
            None
        } else {
            Some(self.memory.as_mut_slice())
        }
    }
}

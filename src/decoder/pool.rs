// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The fixed pool of hardware frame buffers registered with the decode
//! engine.
//!
//! The pool is sized from the engine's reported minimum plus a fixed
//! headroom that absorbs display latency: frames queued for rendering, the
//! page being flipped, and the deinterlacer's temporal reference. It is
//! built once per stream configuration and rebuilt from scratch whenever
//! the engine signals a resolution change.

use std::sync::Arc;

use crate::decoder::buffer::DecodeBuffer;
use crate::device::decode::DecodeDevice;
use crate::device::decode::FrameBufferDesc;
use crate::device::decode::StreamInfo;
use crate::device::DeviceError;
use crate::device::MemBlock;
use crate::utils::align_up;
use crate::DecodedFormat;

/// Luma stride/size granularity of the decode engine.
pub const MACROBLOCK_ALIGN: usize = 16;

/// Frames the renderer may hold on to at any time.
pub const RENDER_QUEUE_DEPTH: usize = 3;

/// Buffers allocated on top of the engine-reported minimum. One for the
/// frame in flight on the engine side, the render queue, plus two for the
/// deinterlacer chain.
pub const EXTRA_FRAME_BUFFERS: usize = 1 + RENDER_QUEUE_DEPTH + 2;

/// Tracks every contiguous block handed out by the engine's allocator so
/// teardown can release them in bulk, even when individual frees fail.
#[derive(Default)]
pub(crate) struct MemoryLedger {
    blocks: Vec<MemBlock>,
}

impl MemoryLedger {
    pub(crate) fn track(&mut self, block: MemBlock) {
        self.blocks.push(block);
    }

    /// Releases every tracked block. Failures are logged and skipped so one
    /// bad block cannot leak the rest.
    pub(crate) fn free_all<D: DecodeDevice>(&mut self, device: &mut D) {
        for block in self.blocks.drain(..) {
            if let Err(e) = device.free_contiguous(&block) {
                log::error!(
                    "failed to free {} bytes of contiguous memory at {:#x}: {}",
                    block.size,
                    block.phys_addr,
                    e
                );
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// Per-plane sizes of one frame buffer, all already aligned.
struct PlaneLayout {
    y_stride: usize,
    c_stride: usize,
    y_size: usize,
    u_size: usize,
    v_size: usize,
    mv_size: usize,
}

impl PlaneLayout {
    fn for_stream(info: &StreamInfo, format: DecodedFormat) -> Self {
        let y_stride = align_up(info.width as usize, MACROBLOCK_ALIGN);
        // Interlaced content is decoded field-wise, which doubles the luma
        // height granularity.
        let y_height_align = if info.interlaced { 2 * MACROBLOCK_ALIGN } else { MACROBLOCK_ALIGN };
        let y_size = y_stride * align_up(info.height as usize, y_height_align);

        let (c_stride, u_size, v_size, mv_size) = match format {
            DecodedFormat::I420 => (y_stride / 2, y_size / 4, y_size / 4, y_size / 4),
            _ => (y_stride, y_size / 2, 0, y_size / 4),
        };

        let align = info.address_alignment.max(1);
        Self {
            y_stride,
            c_stride,
            y_size: align_up(y_size, align),
            u_size: align_up(u_size, align),
            v_size: align_up(v_size, align),
            mv_size: align_up(mv_size, align),
        }
    }

    fn total(&self, align: usize) -> usize {
        self.y_size + self.u_size + self.v_size + self.mv_size + align
    }
}

/// The set of decode buffers plus the raw memory backing them.
pub struct FramePool {
    buffers: Vec<Arc<DecodeBuffer>>,
    descs: Vec<FrameBufferDesc>,
    ledger: MemoryLedger,
}

impl FramePool {
    /// Allocates `min_frame_buffers + EXTRA_FRAME_BUFFERS` slots laid out
    /// for `info`, with every plane address aligned as the engine requires.
    pub fn allocate<D: DecodeDevice>(
        device: &mut D,
        info: &StreamInfo,
        format: DecodedFormat,
    ) -> Result<Self, DeviceError> {
        let count = info.min_frame_buffers + EXTRA_FRAME_BUFFERS;
        let layout = PlaneLayout::for_stream(info, format);
        let align = info.address_alignment.max(1);

        let mut pool = Self {
            buffers: Vec::with_capacity(count),
            descs: Vec::with_capacity(count),
            ledger: MemoryLedger::default(),
        };

        for index in 0..count {
            let block = match device.alloc_contiguous(layout.total(align)) {
                Ok(block) => block,
                Err(e) => {
                    log::error!("frame buffer allocation failed at slot {}: {}", index, e);
                    pool.release_all(device);
                    return Err(e);
                }
            };
            pool.ledger.track(block);

            let phys = align_up(block.phys_addr as usize, align) as u64;
            let virt = align_up(block.virt_addr as usize, align) as u64;
            let (cb, cr, mv) = (
                layout.y_size as u64,
                (layout.y_size + layout.u_size) as u64,
                (layout.y_size + layout.u_size + layout.v_size) as u64,
            );
            pool.descs.push(FrameBufferDesc {
                y_stride: layout.y_stride,
                c_stride: layout.c_stride,
                y_phys: phys,
                cb_phys: phys + cb,
                cr_phys: if format == DecodedFormat::I420 { phys + cr } else { 0 },
                mv_phys: phys + mv,
                y_virt: virt,
                cb_virt: virt + cb,
                cr_virt: if format == DecodedFormat::I420 { virt + cr } else { 0 },
                mv_virt: virt + mv,
            });
            pool.buffers.push(DecodeBuffer::new(index));
        }

        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn descs(&self) -> &[FrameBufferDesc] {
        &self.descs
    }

    pub fn buffer(&self, index: usize) -> &Arc<DecodeBuffer> {
        &self.buffers[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DecodeBuffer>> {
        self.buffers.iter()
    }

    /// Resolves the slot decoding targeted from its luma plane address.
    pub fn find_by_luma(&self, luma_phys: u64) -> Option<usize> {
        self.descs.iter().position(|desc| desc.y_phys == luma_phys)
    }

    /// Invalidates every slot and returns all backing memory to the engine.
    /// Best effort: individual release failures are logged, never retried.
    pub fn release_all<D: DecodeDevice>(&mut self, device: &mut D) {
        for buffer in &self.buffers {
            if let Err(e) = buffer.release_hw_slot(device) {
                log::error!("failed to release slot {}: {}", buffer.index(), e);
            }
            buffer.release();
        }
        self.buffers.clear();
        self.descs.clear();
        self.ledger.free_all(device);
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode session state machine.
//!
//! A session feeds the engine one access unit per [`DecodeSession::decode`]
//! call and interprets the event flags the hardware raises in response.
//! Several flags can arrive together and their handling order matters: a
//! resolution change must rebuild the frame pool before the displayable
//! frame raised by the same call is fetched.
//!
//! Timestamps travel through a one-slot look-ahead. The engine may consume
//! an access unit before it reports which buffer the unit decodes into, so
//! a presentation timestamp that could not be attached during its own call
//! is parked and attached when the consumption report arrives.

use std::sync::Arc;

use crate::decoder::buffer::AttachedFrame;
use crate::decoder::buffer::DecodeBuffer;
use crate::decoder::buffer::FrameHandle;
use crate::decoder::pool::FramePool;
use crate::decoder::pool::MemoryLedger;
use crate::decoder::pool::MACROBLOCK_ALIGN;
use crate::decoder::pool::RENDER_QUEUE_DEPTH;
use crate::decoder::DecodeError;
use crate::decoder::DecodeStatus;
use crate::decoder::DecodedFrame;
use crate::device::decode::CodecFormat;
use crate::device::decode::DecodeDevice;
use crate::device::decode::EventSet;
use crate::device::decode::FieldType;
use crate::device::decode::FrameInfo;
use crate::device::decode::MemRegion;
use crate::device::decode::OpenParams;
use crate::device::decode::SkipMode;
use crate::device::decode::StreamInfo;
use crate::device::DeviceError;
use crate::utils::align_up;
use crate::DecodedFormat;

/// Iteration cap of the per-access-unit decode loop.
const MAX_DECODE_ITERATIONS: usize = 5;

/// Residual counts below this are accounting noise from stuffing bytes and
/// are clamped to zero rather than carried into the look-ahead.
const CONSUMED_RESIDUE_LIMIT: i64 = 50;

/// Widest stream the engine handles.
const MAX_CODED_WIDTH: u32 = 1920;

/// Stream description handed to [`DecodeSession::new`].
#[derive(Clone, Debug)]
pub struct CodecParams {
    pub format: CodecFormat,
    pub width: u32,
    pub height: u32,
    pub profile: Option<i32>,
    pub level: Option<i32>,
    /// Out-of-band codec configuration bytes from the container.
    pub codec_data: Option<Vec<u8>>,
    /// Layout the frame pool is built for.
    pub output_format: DecodedFormat,
    /// When false, decoded frames carry no timestamps at all.
    pub use_pts: bool,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            format: CodecFormat::H264,
            width: 0,
            height: 0,
            profile: None,
            level: None,
            codec_data: None,
            output_format: DecodedFormat::NV12,
            use_pts: true,
        }
    }
}

/// A decode session bound to one elementary stream.
///
/// The session owns the engine handle, the frame pool and the buffer
/// chain; disposing it (or dropping it) releases every hardware resource
/// unconditionally.
pub struct DecodeSession<D: DecodeDevice> {
    device: D,
    params: CodecParams,
    opened: bool,
    frame_reporting: bool,
    pool: Option<FramePool>,
    stream_info: Option<StreamInfo>,
    /// The previously displayed buffer, chained to each new frame for
    /// motion-compensated deinterlacing. Holds one reference.
    last: Option<Arc<DecodeBuffer>>,
    /// Input bytes sent to the engine but not yet reported consumed.
    bytes_outstanding: i64,
    /// Presentation timestamp waiting for its consumption report.
    pending_pts: Option<u64>,
    /// The next delivered picture duplicates a previous one.
    drop_next: bool,
    warned_progressive: bool,
    /// Heap work memory the engine borrows for the session's lifetime.
    work_mem: Vec<Box<[u8]>>,
    work_ledger: MemoryLedger,
}

impl<D: DecodeDevice> DecodeSession<D> {
    /// Validates that the engine can take this stream and prepares a
    /// session. The engine itself is opened lazily on the first decode
    /// call.
    pub fn new(device: D, params: CodecParams) -> Result<Self, DecodeError> {
        if params.width > MAX_CODED_WIDTH {
            return Err(DecodeError::Unsupported(format!(
                "video dimensions out of spec: {}x{}",
                params.width, params.height
            )));
        }
        if params.format == CodecFormat::H264 {
            // Hi10P, and one uncommon Main@3.0 signalling, overrun the
            // engine's reference memory.
            let profile = params.profile.unwrap_or(0);
            let level = params.level.unwrap_or(0);
            if profile == 110 || (profile == 578 && level == 30) {
                return Err(DecodeError::Unsupported(format!(
                    "AVC profile {} level {} not decodable",
                    profile, level
                )));
            }
        }
        Ok(Self {
            device,
            params,
            opened: false,
            frame_reporting: false,
            pool: None,
            stream_info: None,
            last: None,
            bytes_outstanding: 0,
            pending_pts: None,
            drop_next: false,
            warned_progressive: false,
            work_mem: Vec::new(),
            work_ledger: MemoryLedger::default(),
        })
    }

    /// How many decoded frames the caller may hold before the pool runs
    /// dry.
    pub fn allowed_references(&self) -> usize {
        RENDER_QUEUE_DEPTH
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    #[cfg(test)]
    pub(crate) fn outstanding_bytes(&self) -> i64 {
        self.bytes_outstanding
    }

    /// Submits one access unit and runs the decode loop.
    ///
    /// An empty `bitstream` drains frames the engine already holds. On any
    /// fatal error the session is disposed and decoding is over for this
    /// stream.
    pub fn decode(
        &mut self,
        bitstream: &[u8],
        dts: Option<u64>,
        pts: Option<u64>,
    ) -> Result<DecodeStatus, DecodeError> {
        if !self.opened {
            if let Err(e) = self.open_engine() {
                self.dispose();
                return Err(e);
            }
        }

        // Return every rendered slot before feeding new input; the engine
        // stalls on "not enough buffers" if slots linger.
        if let Some(pool) = &self.pool {
            for buffer in pool.iter() {
                if buffer.rendered() {
                    if let Err(e) = buffer.release_hw_slot(&mut self.device) {
                        log::error!("failed to clear displayed slot {}: {}", buffer.index(), e);
                    }
                }
            }
        }

        let mut ready: Option<DecodedFrame> = None;
        let mut flushed = false;

        if !bitstream.is_empty() || self.bytes_outstanding > 0 {
            let codec_data = if self.params.format.requires_codec_data() {
                self.params.codec_data.clone()
            } else {
                None
            };

            let mut input = bitstream;
            let mut retries = 0;
            loop {
                if self.frame_reporting {
                    self.bytes_outstanding += input.len() as i64;
                }

                let events = match self.device.decode(input, codec_data.as_deref()) {
                    Ok(events) => events,
                    Err(DeviceError::WrongCallSequence { events })
                        if events.contains(EventSet::RESOLUTION_CHANGED) =>
                    {
                        // The engine refuses further input until the pool is
                        // rebuilt; the resolution-change handling below does
                        // exactly that.
                        events
                    }
                    Err(e) => {
                        log::error!("decode call failed: {}", e);
                        self.dispose();
                        return Err(e.into());
                    }
                };

                if events.intersects(EventSet::INIT_DONE | EventSet::RESOLUTION_CHANGED) {
                    if let Err(e) = self.reinit_stream(events) {
                        self.dispose();
                        return Err(e);
                    }
                }

                if events.contains(EventSet::FRAME_CONSUMED) {
                    self.account_consumed(pts);
                }

                if events.contains(EventSet::FRAME_READY) {
                    match self.fetch_ready_frame(ready.is_some(), dts, pts) {
                        Ok(Some(frame)) => ready = Some(frame),
                        Ok(None) => {}
                        Err(e) => {
                            self.dispose();
                            return Err(e);
                        }
                    }
                } else if events.contains(EventSet::MOSAIC_READY) {
                    // Consumed for decoder state only; fetch and hand the
                    // slot straight back.
                    if let Err(e) = self.discard_output_frame() {
                        self.dispose();
                        return Err(e);
                    }
                } else if events.contains(EventSet::REPEAT) {
                    log::debug!("frame repeat requested");
                    self.drop_next = true;
                } else if events.contains(EventSet::NO_BUFFERS) {
                    log::error!("no frame buffer available");
                } else if events.contains(EventSet::SKIP) {
                    log::debug!("frame skipped");
                } else if events.contains(EventSet::FLUSH_NEEDED) {
                    log::info!("engine requires a flush");
                    self.reset();
                    flushed = true;
                } else if events.contains(EventSet::EOS) {
                    log::info!("end of stream reported");
                }

                if events
                    .intersects(EventSet::NEEDS_INPUT | EventSet::REPEAT | EventSet::FRAME_READY)
                {
                    break;
                }

                retries += 1;
                if retries >= MAX_DECODE_ITERATIONS {
                    log::error!("leaving decode loop after {} iterations", MAX_DECODE_ITERATIONS);
                    break;
                }

                if !events.contains(EventSet::INPUT_USED) {
                    log::error!("input not consumed by engine ({} bytes)", input.len());
                }

                // Everything after the first iteration is a drain call.
                input = &[];
            }
        }

        if self.bytes_outstanding > 0 {
            // The engine holds input it has not attributed to a buffer yet;
            // its timestamp belongs to a frame consumed on a later call.
            self.pending_pts = pts;
        }

        if flushed {
            Ok(DecodeStatus::Flushed)
        } else if let Some(frame) = ready {
            Ok(DecodeStatus::FrameReady(frame))
        } else {
            Ok(DecodeStatus::NeedsData)
        }
    }

    /// Queries stream parameters and (re)builds the frame pool.
    fn reinit_stream(&mut self, events: EventSet) -> Result<(), DecodeError> {
        let info = match self.device.initial_info() {
            Ok(info) => info,
            Err(e) => {
                log::error!("failed to query stream parameters: {}", e);
                return Err(e.into());
            }
        };
        log::debug!(
            "stream parameters: {:?} (interlaced: {}, min buffers: {}, align: {}, crop: {:?})",
            info.coded_resolution(),
            info.interlaced,
            info.min_frame_buffers,
            info.address_alignment,
            info.crop,
        );

        if events.contains(EventSet::RESOLUTION_CHANGED) {
            if let Some(last) = self.last.take() {
                last.release();
            }
            if let Some(mut pool) = self.pool.take() {
                pool.release_all(&mut self.device);
            }
        }

        let pool = FramePool::allocate(&mut self.device, &info, self.params.output_format)
            .map_err(DecodeError::PoolAllocation)?;
        if let Err(e) = self.device.register_frame_buffers(pool.descs()) {
            log::error!("failed to register frame buffers: {}", e);
            return Err(e.into());
        }
        self.pool = Some(pool);
        self.stream_info = Some(info);
        Ok(())
    }

    /// Books the consumption report of one access unit and attaches the
    /// looked-ahead presentation timestamp to the buffer it decodes into.
    fn account_consumed(&mut self, pts: Option<u64>) {
        let consumed = match self.device.consumed_frame_info() {
            Ok(consumed) => consumed,
            Err(e) => {
                log::error!("failed to query consumed frame info: {}", e);
                return;
            }
        };
        self.bytes_outstanding -= (consumed.frame_len + consumed.stuff_len) as i64;
        if let Some(luma) = consumed.luma_phys {
            if self.bytes_outstanding < CONSUMED_RESIDUE_LIMIT {
                self.bytes_outstanding = 0;
            }
            let slot = self.pool.as_ref().and_then(|pool| pool.find_by_luma(luma));
            match slot {
                Some(index) => {
                    let stamp = self.pending_pts.take().or(pts);
                    self.pool.as_ref().unwrap().buffer(index).set_pts(stamp);
                }
                None => log::error!("could not find consumed frame buffer {:#x}", luma),
            }
        }
    }

    /// Fetches the displayable frame, stamps and chains its buffer, and
    /// builds the caller-facing picture.
    fn fetch_ready_frame(
        &mut self,
        already_have_one: bool,
        dts: Option<u64>,
        pts: Option<u64>,
    ) -> Result<Option<DecodedFrame>, DecodeError> {
        let mut info = match self.device.output_frame() {
            Ok(info) => info,
            Err(e) => {
                log::error!("cannot fetch output frame: {}", e);
                return Err(e.into());
            }
        };

        if already_have_one {
            // One displayable frame per submission; hand the surplus slot
            // straight back rather than losing track of it.
            log::error!("second picture in the same decode call");
            if let Err(e) = self.device.frame_displayed(info.luma_phys) {
                log::error!("failed to discard surplus picture: {}", e);
            }
            return Ok(None);
        }

        // Some codecs lie about their frame size; align to the macroblock
        // grid the buffers were laid out for.
        info.width = align_up(info.width as usize, MACROBLOCK_ALIGN) as u32;
        info.height = align_up(info.height as usize, MACROBLOCK_ALIGN) as u32;

        let Some(index) = self.pool.as_ref().and_then(|pool| pool.find_by_luma(info.luma_phys))
        else {
            log::error!("could not find frame buffer {:#x}", info.luma_phys);
            return Ok(None);
        };
        let pool = self.pool.as_ref().unwrap();
        let buffer = Arc::clone(pool.buffer(index));

        if self.params.format.timestamps_unreliable() {
            // The queued timestamp is garbage for these codecs; use the
            // submission timestamp directly.
            buffer.set_pts(pts);
        }

        // One reference for the handle returned to the caller.
        buffer.acquire();
        buffer.set_dts(dts);
        buffer.attach_frame(attached_frame(&info, pool.descs()[index], self.params.output_format), self.last.as_ref());

        if !self.params.use_pts {
            buffer.set_pts(None);
            buffer.set_dts(None);
        }

        // The new frame becomes the deinterlacer's temporal reference.
        if let Some(previous) = self.last.take() {
            previous.release();
        }
        buffer.acquire();
        self.last = Some(Arc::clone(&buffer));

        Ok(Some(self.emit_frame(buffer, &info)))
    }

    fn emit_frame(&mut self, buffer: Arc<DecodeBuffer>, info: &FrameInfo) -> DecodedFrame {
        let interlaced = self.stream_info.as_ref().map(|i| i.interlaced).unwrap_or(false);
        let field = info.field;
        if interlaced && field == FieldType::Progressive && !self.warned_progressive {
            self.warned_progressive = true;
            log::warn!(
                "interlaced content reported by the engine, but full frames detected - \
                 deinterlacing should be turned off"
            );
        }

        let width = info.crop.width().max(0) as u32;
        let height = info.crop.height().max(0) as u32;
        let display_width = ((width as u64 * info.aspect_q16 as u64 + 32767) >> 16) as u32;
        let pts = buffer.pts();
        let dts = buffer.dts();

        DecodedFrame {
            handle: FrameHandle::from_acquired(buffer),
            width,
            height,
            display_width,
            display_height: height,
            interlaced,
            top_field_first: interlaced && field.is_top_field_first(),
            dropped: std::mem::take(&mut self.drop_next),
            pts,
            dts,
        }
    }

    fn discard_output_frame(&mut self) -> Result<(), DecodeError> {
        let info = match self.device.output_frame() {
            Ok(info) => info,
            Err(e) => {
                log::error!("cannot fetch output frame: {}", e);
                return Err(e.into());
            }
        };
        if let Err(e) = self.device.frame_displayed(info.luma_phys) {
            log::error!("failed to release discarded frame: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Flush: drops all pending buffer references and the timestamp
    /// look-ahead without leaving the streaming state.
    pub fn reset(&mut self) {
        log::debug!("resetting decode session");

        if let Some(last) = self.last.take() {
            last.release();
        }

        if let Some(pool) = &self.pool {
            for buffer in pool.iter() {
                if let Err(e) = buffer.release_hw_slot(&mut self.device) {
                    log::error!("failed to invalidate slot {}: {}", buffer.index(), e);
                }
            }
        }

        self.bytes_outstanding = 0;
        self.pending_pts = None;

        if self.opened {
            if let Err(e) = self.device.flush() {
                log::error!("engine flush failed: {}", e);
            }
        }
    }

    fn open_engine(&mut self) -> Result<(), DecodeError> {
        let requirements = self.device.query_memory().map_err(|e| {
            log::error!("engine memory query failed: {}", e);
            DecodeError::from(e)
        })?;

        let mut regions = Vec::with_capacity(requirements.len());
        for req in &requirements {
            let padded = req.size + req.alignment;
            if req.contiguous {
                let block = self.device.alloc_contiguous(padded).map_err(|e| {
                    log::error!("failed to allocate {} contiguous bytes: {}", padded, e);
                    DecodeError::from(e)
                })?;
                self.work_ledger.track(block);
                regions.push(MemRegion {
                    phys_addr: align_up(block.phys_addr as usize, req.alignment.max(1)) as u64,
                    virt_addr: align_up(block.virt_addr as usize, req.alignment.max(1)) as u64,
                    size: req.size,
                });
            } else {
                let mem = vec![0u8; padded].into_boxed_slice();
                let virt = align_up(mem.as_ptr() as usize, req.alignment.max(1)) as u64;
                self.work_mem.push(mem);
                regions.push(MemRegion { phys_addr: 0, virt_addr: virt, size: req.size });
            }
        }

        let open_params = OpenParams {
            format: self.params.format,
            chroma_interleave: self.params.output_format != DecodedFormat::I420,
            reorder_enable: true,
            skip_mode: SkipMode::None,
            buffer_delay: 0,
        };
        self.device.open(&open_params, &regions).map_err(|e| {
            log::error!("engine open failed: {}", e);
            DecodeError::from(e)
        })?;
        self.opened = true;
        self.frame_reporting = self.device.frame_size_reporting();
        Ok(())
    }

    /// Releases every hardware resource. Safe to call more than once;
    /// individual failures are logged, never retried.
    fn dispose(&mut self) {
        if let Some(last) = self.last.take() {
            last.release();
        }
        if let Some(mut pool) = self.pool.take() {
            pool.release_all(&mut self.device);
        }
        if self.opened {
            if let Err(e) = self.device.flush() {
                log::error!("engine flush failed on dispose: {}", e);
            }
            if let Err(e) = self.device.close() {
                log::error!("engine close failed: {}", e);
            }
            self.opened = false;
        }
        self.work_ledger.free_all(&mut self.device);
        self.work_mem.clear();
        self.bytes_outstanding = 0;
        self.pending_pts = None;
    }
}

impl<D: DecodeDevice> Drop for DecodeSession<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn attached_frame(
    info: &FrameInfo,
    planes: crate::device::decode::FrameBufferDesc,
    format: DecodedFormat,
) -> AttachedFrame {
    AttachedFrame {
        luma_phys: info.luma_phys,
        width: info.width,
        height: info.height,
        format,
        field: info.field,
        crop: info.crop,
        aspect_q16: info.aspect_q16,
        planes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::pool::EXTRA_FRAME_BUFFERS;
    use crate::device::fake::DecodeCall;
    use crate::device::fake::FakeDecodeDevice;
    use crate::IRect;

    fn info(width: u32, height: u32, min: usize) -> StreamInfo {
        StreamInfo {
            width,
            height,
            interlaced: false,
            min_frame_buffers: min,
            address_alignment: 1,
            crop: IRect::new(0, 0, width as i32, height as i32),
            aspect_q16: 1 << 16,
        }
    }

    fn session(dev: FakeDecodeDevice) -> DecodeSession<FakeDecodeDevice> {
        let _ = env_logger::builder().is_test(true).try_init();
        DecodeSession::new(
            dev,
            CodecParams { format: CodecFormat::H264, width: 320, height: 240, ..Default::default() },
        )
        .unwrap()
    }

    /// `#[cfg(test)]`-only mutable access for scripting mid-test.
    impl DecodeSession<FakeDecodeDevice> {
        fn fake(&mut self) -> &mut FakeDecodeDevice {
            &mut self.device
        }
    }

    #[test]
    fn rejects_streams_wider_than_engine_limit() {
        let err = DecodeSession::new(
            FakeDecodeDevice::new(),
            CodecParams { width: 4096, height: 2160, ..Default::default() },
        )
        .err()
        .unwrap();
        assert!(matches!(err, DecodeError::Unsupported(_)));
    }

    #[test]
    fn rejects_hi10p() {
        let err = DecodeSession::new(
            FakeDecodeDevice::new(),
            CodecParams {
                format: CodecFormat::H264,
                width: 1280,
                height: 720,
                profile: Some(110),
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, DecodeError::Unsupported(_)));
    }

    #[test]
    fn init_builds_pool_and_registers_buffers() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 4));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED | EventSet::NEEDS_INPUT);
        let mut session = session(dev);

        let status = session.decode(&[0u8; 64], None, Some(0)).unwrap();
        assert!(matches!(status, DecodeStatus::NeedsData));
        assert_eq!(session.device().registered.len(), 4 + EXTRA_FRAME_BUFFERS);
        assert_eq!(session.work_ledger.len(), 1);
    }

    #[test]
    fn resolution_change_and_frame_ready_in_one_call() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 4));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED | EventSet::NEEDS_INPUT);
        let mut session = session(dev);
        session.decode(&[0u8; 64], None, Some(0)).unwrap();
        let first_pool = 4 + EXTRA_FRAME_BUFFERS;

        // One submission that raises "resolution changed" and then, still
        // within the loop cap, a displayable frame.
        session.fake().set_stream_info(info(640, 480, 4));
        session.fake().push_events(EventSet::RESOLUTION_CHANGED | EventSet::INPUT_USED);
        session.fake().push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        session.fake().push_output(0, 636, 476, 0);

        let status = session.decode(&[0u8; 64], Some(1), Some(1)).unwrap();
        let DecodeStatus::FrameReady(frame) = status else {
            panic!("expected a ready frame");
        };

        // The pool was torn down and rebuilt exactly once.
        let registers: Vec<_> = session
            .device()
            .calls
            .iter()
            .filter(|c| matches!(c, DecodeCall::RegisterBuffers(_)))
            .collect();
        assert_eq!(registers.len(), 2);
        assert_eq!(session.device().freed_blocks.len(), first_pool);

        // Frame dimensions are aligned up to the macroblock grid.
        let attached = frame.handle.frame().unwrap();
        assert_eq!(attached.width, 640);
        assert_eq!(attached.height, 480);
    }

    #[test]
    fn rendered_slot_released_on_next_submission() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED);
        dev.push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        dev.push_output(0, 320, 240, 0);
        let mut session = session(dev);

        let DecodeStatus::FrameReady(frame1) = session.decode(&[0u8; 64], None, Some(10)).unwrap()
        else {
            panic!("expected frame 1");
        };
        let luma1 = session.device().slot_luma(0);

        session.fake().push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        session.fake().push_output(1, 320, 240, 0);
        let DecodeStatus::FrameReady(frame2) = session.decode(&[0u8; 64], None, Some(20)).unwrap()
        else {
            panic!("expected frame 2");
        };

        // The consumer is done with both; dropping frame 2 unchains frame 1,
        // whose count falls to 1: rendered.
        drop(frame1);
        drop(frame2);
        assert!(session.pool.as_ref().unwrap().buffer(0).rendered());

        // The next submission returns the slot to the engine before feeding
        // the new access unit.
        session.fake().push_events(EventSet::NEEDS_INPUT | EventSet::INPUT_USED);
        session.decode(&[0u8; 64], None, Some(30)).unwrap();

        let calls = &session.device().calls;
        let displayed = calls
            .iter()
            .position(|c| *c == DecodeCall::FrameDisplayed(luma1))
            .expect("slot was not released");
        let last_decode = calls
            .iter()
            .rposition(|c| matches!(c, DecodeCall::Decode(_)))
            .unwrap();
        assert!(displayed < last_decode);
    }

    #[test]
    fn timestamp_look_ahead_spans_submissions() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED | EventSet::NEEDS_INPUT);
        let mut session = session(dev);

        // Call 1: 100 bytes go in, nothing is attributed yet. Its pts must
        // be parked for the frame consumed later.
        session.decode(&[0u8; 100], None, Some(111)).unwrap();
        assert_eq!(session.outstanding_bytes(), 100);

        // Call 2: the engine reports those 100 bytes consumed into slot 0.
        // The parked timestamp is attached, not this call's.
        session
            .fake()
            .push_events(EventSet::FRAME_CONSUMED | EventSet::INPUT_USED | EventSet::NEEDS_INPUT);
        session.fake().push_consumed(Some(0), 100, 0);
        session.decode(&[0u8; 30], None, Some(222)).unwrap();

        assert_eq!(session.pool.as_ref().unwrap().buffer(0).pts(), Some(111));
        // 30 residual bytes sit under the stuffing threshold and are
        // clamped away.
        assert_eq!(session.outstanding_bytes(), 0);
    }

    #[test]
    fn decode_loop_never_exceeds_iteration_cap() {
        let mut dev = FakeDecodeDevice::new();
        for _ in 0..6 {
            dev.push_events(EventSet::INPUT_USED);
        }
        let mut session = session(dev);
        session.decode(&[0u8; 16], None, None).unwrap();
        // Five iterations ran; the sixth scripted step was never reached.
        assert_eq!(session.device().steps_left(), 1);
    }

    #[test]
    fn flush_event_resets_and_reports_flushed() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED | EventSet::NEEDS_INPUT);
        let mut session = session(dev);
        session.decode(&[0u8; 100], None, Some(5)).unwrap();
        assert_eq!(session.outstanding_bytes(), 100);

        session.fake().push_events(EventSet::FLUSH_NEEDED | EventSet::INPUT_USED);
        let status = session.decode(&[0u8; 40], None, Some(6)).unwrap();
        assert!(matches!(status, DecodeStatus::Flushed));
        assert_eq!(session.outstanding_bytes(), 0);
        assert!(session.device().calls.contains(&DecodeCall::Flush));
        assert!(session.pending_pts.is_none());
    }

    #[test]
    fn wrong_call_sequence_with_resolution_change_is_recoverable() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_wrong_call(EventSet::RESOLUTION_CHANGED);
        dev.push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        dev.push_output(0, 320, 240, 0);
        let mut session = session(dev);

        let status = session.decode(&[0u8; 64], None, Some(0)).unwrap();
        assert!(matches!(status, DecodeStatus::FrameReady(_)));
    }

    #[test]
    fn decode_failure_disposes_the_session() {
        let mut dev = FakeDecodeDevice::new();
        dev.push_failure(-22);
        let mut session = session(dev);

        assert!(session.decode(&[0u8; 64], None, None).is_err());
        assert!(session.device().calls.contains(&DecodeCall::Close));
        assert_eq!(session.device().live_allocs, 0);
    }

    #[test]
    fn unreliable_timestamps_use_submission_pts() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED);
        dev.push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        dev.push_output(0, 320, 240, 0);
        let mut session = DecodeSession::new(
            dev,
            CodecParams { format: CodecFormat::Vp8, width: 320, height: 240, ..Default::default() },
        )
        .unwrap();

        let DecodeStatus::FrameReady(frame) = session.decode(&[0u8; 64], None, Some(777)).unwrap()
        else {
            panic!("expected a frame");
        };
        assert_eq!(frame.pts, Some(777));
    }

    #[test]
    fn repeat_flags_next_picture_as_dropped() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED | EventSet::REPEAT);
        let mut session = session(dev);
        let status = session.decode(&[0u8; 64], None, None).unwrap();
        assert!(matches!(status, DecodeStatus::NeedsData));

        session.fake().push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        session.fake().push_output(0, 320, 240, 0);
        let DecodeStatus::FrameReady(frame) = session.decode(&[0u8; 64], None, None).unwrap()
        else {
            panic!("expected a frame");
        };
        assert!(frame.dropped);

        session.fake().push_events(EventSet::FRAME_READY | EventSet::INPUT_USED);
        session.fake().push_output(1, 320, 240, 0);
        let DecodeStatus::FrameReady(frame) = session.decode(&[0u8; 64], None, None).unwrap()
        else {
            panic!("expected a frame");
        };
        assert!(!frame.dropped);
    }

    #[test]
    fn mosaic_frame_is_fetched_and_discarded() {
        let mut dev = FakeDecodeDevice::new();
        dev.set_stream_info(info(320, 240, 2));
        dev.push_events(EventSet::INIT_DONE | EventSet::INPUT_USED);
        dev.push_events(
            EventSet::MOSAIC_READY | EventSet::INPUT_USED | EventSet::NEEDS_INPUT,
        );
        dev.push_output(0, 320, 240, 0);
        let mut session = session(dev);

        let status = session.decode(&[0u8; 64], None, None).unwrap();
        assert!(matches!(status, DecodeStatus::NeedsData));
        let luma = session.device().slot_luma(0);
        assert!(session.device().calls.contains(&DecodeCall::FrameDisplayed(luma)));
        assert!(!session.pool.as_ref().unwrap().buffer(0).is_attached());
    }
}

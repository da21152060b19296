// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The display pipeline: composition task execution and page flipping.
//!
//! [`DisplayPipeline::blit`] runs on the caller's thread. It reprograms
//! the output when the stream's deinterlace format or frame rate actually
//! changed, builds and executes the hardware composition (detile, then
//! deinterlace+scale or plain 2D blit), and enqueues the finished page for
//! flipping. The dedicated flip thread consumes that queue in submission
//! order and pans the framebuffer at the vertical blank.
//!
//! A task failing anywhere in this pipeline costs exactly one displayed
//! frame; decode never sees display errors.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::decoder::buffer::AttachedFrame;
use crate::decoder::buffer::FrameHandle;
use crate::device::blit::BlitDevice;
use crate::device::blit::BlitRect;
use crate::device::blit::DeintInput;
use crate::device::blit::DeintOutput;
use crate::device::blit::DeintParams;
use crate::device::blit::DeintTask;
use crate::device::blit::FieldFlags;
use crate::device::blit::Motion;
use crate::device::blit::ScratchBuffer;
use crate::device::blit::Surface2d;
use crate::device::blit::SurfaceFormat;
use crate::device::blit::TaskCheck;
use crate::device::fb::DisplayDevice;
use crate::device::fb::ScreenConfig;
use crate::device::fb::ScreenFormat;
use crate::display::queue::TaskQueue;
use crate::display::task::composition_rects;
use crate::display::task::deint_params;
use crate::display::task::stride_offset_parity;
use crate::display::BlitTarget;
use crate::display::DeintMethod;
use crate::utils::align_up;
use crate::DecodedFormat;
use crate::IRect;
use crate::Rect;

/// Framebuffer pages cycled by the flip thread.
pub const FB_PAGES: usize = 3;

/// Streams at or above this rate on a full-HD panel overwhelm the RGB
/// path's memory bandwidth and force the packed 16-bit output.
const HIGH_RATE_FPS: f64 = 49.0;

/// Tuning knobs of the pipeline, fixed at construction.
#[derive(Clone, Debug)]
pub struct DisplayOptions {
    pub deint_method: DeintMethod,
    /// Block page flips on the vertical blank.
    pub vsync: bool,
    /// Use the plain 2D blitter for progressive RGB output instead of the
    /// deinterlace engine.
    pub prefer_2d: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self { deint_method: DeintMethod::Auto, vsync: true, prefer_2d: true }
    }
}

/// State shared with the flip thread: the device itself plus the few
/// values panning needs. Everything else belongs to the submit side.
struct Link<F> {
    dev: F,
    yres: u32,
    configured: bool,
    current_page: usize,
}

/// One page flip waiting for the flip thread.
///
/// The frame handles ride along so the decode buffers stay referenced
/// until their content has actually reached the screen; dropping the flip
/// after panning is what lets the decode session recycle them.
struct QueuedFlip {
    #[allow(dead_code)]
    current: FrameHandle,
    previous: Option<FrameHandle>,
    page: usize,
    deint: DeintParams,
}

/// Geometry and format of the configured output.
struct ScreenState {
    width: i32,
    height: i32,
    page_size: usize,
    phys_base: u64,
    format: ScreenFormat,
    field_fmt: FieldFlags,
    fps: f64,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            page_size: 0,
            phys_base: 0,
            format: ScreenFormat::Rgba32,
            field_fmt: FieldFlags::NONE,
            fps: 0.0,
        }
    }
}

/// The display pipeline. Owns the blitter, the framebuffer device and the
/// flip thread.
pub struct DisplayPipeline<B, F>
where
    B: BlitDevice,
    F: DisplayDevice + 'static,
{
    blitter: B,
    link: Arc<Mutex<Link<F>>>,
    queue: Arc<TaskQueue<QueuedFlip>>,
    vsync: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    opts: DisplayOptions,
    screen: ScreenState,
    page_crops: [IRect; FB_PAGES],
    next_page: usize,
    src_rect: Rect,
    dst_rect: Rect,
    /// Linear buffer detile passes render into.
    scratch: Option<ScratchBuffer>,
    /// Off-screen buffer screen captures render into.
    capture: Option<ScratchBuffer>,
    capture_done: bool,
}

impl<B, F> DisplayPipeline<B, F>
where
    B: BlitDevice,
    F: DisplayDevice + 'static,
{
    pub fn new(blitter: B, device: F, opts: DisplayOptions) -> Self {
        let mut pipeline = Self {
            blitter,
            link: Arc::new(Mutex::new(Link {
                dev: device,
                yres: 0,
                configured: false,
                current_page: 0,
            })),
            queue: Arc::new(TaskQueue::new(FB_PAGES)),
            vsync: Arc::new(AtomicBool::new(opts.vsync)),
            worker: None,
            opts,
            screen: ScreenState::default(),
            page_crops: [IRect::default(); FB_PAGES],
            next_page: 0,
            src_rect: Rect::default(),
            dst_rect: Rect::default(),
            scratch: None,
            capture: None,
            capture_done: true,
        };
        pipeline.spawn_worker();
        pipeline
    }

    fn spawn_worker(&mut self) {
        let queue = Arc::clone(&self.queue);
        let link = Arc::clone(&self.link);
        let vsync = Arc::clone(&self.vsync);
        self.worker = Some(thread::spawn(move || flip_loop(queue, link, vsync)));
    }

    /// Source and destination rectangles used when a blit does not carry
    /// its own destination.
    pub fn set_blit_rects(&mut self, src: Rect, dst: Rect) {
        self.src_rect = src;
        self.dst_rect = dst;
    }

    pub fn set_vsync(&mut self, enable: bool) {
        self.vsync.store(enable, Ordering::Relaxed);
    }

    /// Composites `current` (optionally deinterlaced against `previous`)
    /// into the target page and schedules its flip.
    ///
    /// Returns whether the task was accepted. A rejected task drops this
    /// frame from display only; decoding is unaffected.
    pub fn blit(
        &mut self,
        previous: Option<&FrameHandle>,
        current: &FrameHandle,
        field_fmt: FieldFlags,
        fps: f64,
        target: BlitTarget,
        dest: Option<Rect>,
    ) -> bool {
        let capture = target == BlitTarget::Capture;
        let page = match target {
            BlitTarget::Auto => {
                let page = self.next_page;
                self.next_page = (self.next_page + 1) % FB_PAGES;
                page
            }
            BlitTarget::Page(page) if page < FB_PAGES => page,
            BlitTarget::Page(_) => return false,
            BlitTarget::Capture => {
                self.capture_done = false;
                0
            }
        };

        self.set_field_data(field_fmt, fps);
        if !capture && !self.link.lock().unwrap().configured {
            return false;
        }

        let Some(frame) = current.frame() else {
            log::warn!("blit of a buffer with no decoded content");
            return false;
        };
        let prev_frame = previous.and_then(|p| p.frame());

        let dst = dest.unwrap_or(self.dst_rect);
        let rects =
            composition_rects(self.src_rect, dst, self.screen.width, self.screen.height, capture);
        let deint = if capture {
            DeintParams::default()
        } else {
            deint_params(self.screen.field_fmt, prev_frame.is_some(), self.opts.deint_method)
        };

        if !self.do_task(&frame, prev_frame.as_ref(), rects.input, rects.output, deint, page, capture)
        {
            return false;
        }

        if capture {
            // Nothing to flip; the result lives in the capture buffer.
            return true;
        }

        self.queue.push(QueuedFlip {
            current: current.clone(),
            previous: previous.cloned(),
            page,
            deint,
        })
    }

    /// Executes one composition. Returns false if the task was discarded.
    #[allow(clippy::too_many_arguments)]
    fn do_task(
        &mut self,
        frame: &AttachedFrame,
        prev: Option<&AttachedFrame>,
        input_crop: BlitRect,
        output_crop: BlitRect,
        deint: DeintParams,
        page: usize,
        capture: bool,
    ) -> bool {
        if input_crop.width <= 0
            || input_crop.height <= 0
            || output_crop.width <= 0
            || output_crop.height <= 0
        {
            // Degenerate crop; nothing sensible to show.
            return false;
        }

        let mut task = DeintTask {
            input: DeintInput {
                width: frame.width,
                height: frame.height,
                format: surface_format(frame.format),
                phys_addr: frame.luma_phys,
                phys_addr_n: 0,
                crop: input_crop,
                deinterlace: deint,
            },
            output: DeintOutput {
                width: 0,
                height: 0,
                format: SurfaceFormat::Rgba8888,
                phys_addr: 0,
                crop: output_crop,
            },
        };

        let swap_colors;
        if capture {
            let size = (output_crop.width * output_crop.height * 4) as usize;
            if !self.ensure_capture_buffer(size) {
                return false;
            }
            task.output.width = output_crop.width as u32;
            task.output.height = output_crop.height as u32;
            task.output.phys_addr = self.capture.as_ref().unwrap().phys_addr;
            swap_colors = true;
        } else {
            task.output.width = self.screen.width as u32;
            task.output.height = self.screen.height as u32;
            task.output.format = match self.screen.format {
                ScreenFormat::Rgba32 => SurfaceFormat::Rgba8888,
                ScreenFormat::Yuyv16 => SurfaceFormat::Yuyv,
            };
            task.output.phys_addr = self.screen.phys_base + (page * self.screen.page_size) as u64;
            swap_colors = false;

            let crop_rect = IRect::new(
                output_crop.x,
                output_crop.y,
                output_crop.x + output_crop.width,
                output_crop.y + output_crop.height,
            );
            if self.page_crops[page] != crop_rect {
                self.page_crops[page] = crop_rect;
                self.clear_page(page);
            }
        }

        if !self.detile_pass(&mut task, frame, prev) {
            return false;
        }

        let use_deint_engine =
            !capture && (self.screen.format == ScreenFormat::Yuyv16 || !self.opts.prefer_2d);
        if use_deint_engine {
            self.run_deint_task(task)
        } else {
            self.run_2d_task(&task, frame, swap_colors)
        }
    }

    /// Converts a tiled frame into the linear scratch buffer and retargets
    /// the task's input there. Also wires the previous frame in as the
    /// second temporal input for the lower motion classes.
    fn detile_pass(
        &mut self,
        task: &mut DeintTask,
        frame: &AttachedFrame,
        prev: Option<&AttachedFrame>,
    ) -> bool {
        if !frame.format.is_tiled() {
            if task.input.deinterlace.enabled && task.input.deinterlace.motion != Motion::High {
                if let Some(prev) = prev {
                    task.input.phys_addr_n = task.input.phys_addr;
                    task.input.phys_addr = prev.luma_phys;
                }
            }
            return true;
        }

        let mut detile = DeintTask {
            input: DeintInput {
                width: frame.width,
                height: frame.height,
                format: surface_format(frame.format),
                phys_addr: 0,
                phys_addr_n: 0,
                crop: BlitRect::default(),
                deinterlace: DeintParams::default(),
            },
            output: DeintOutput {
                width: frame.width,
                height: frame.height,
                format: SurfaceFormat::Nv12,
                phys_addr: 0,
                crop: BlitRect::default(),
            },
        };

        // Field-tiled content is deinterlaced during the detile itself, so
        // the main task must not deinterlace a second time.
        if prev.is_some() && frame.format == DecodedFormat::NV12TiledField {
            detile.input.deinterlace = task.input.deinterlace;
            task.input.deinterlace = DeintParams::default();
            detile.input.phys_addr_n = frame.luma_phys;
        }

        let size = (frame.width * frame.height * 2) as usize;
        if !self.ensure_scratch_buffer(size) {
            return false;
        }

        detile.input.phys_addr = if detile.input.phys_addr_n != 0 {
            prev.unwrap().luma_phys
        } else {
            frame.luma_phys
        };
        detile.output.format = if self.screen.format == ScreenFormat::Yuyv16 && self.capture_done {
            SurfaceFormat::Yuyv
        } else {
            SurfaceFormat::Nv12
        };
        detile.output.phys_addr = self.scratch.as_ref().unwrap().phys_addr;

        match self.blitter.check_task(&detile) {
            Ok(TaskCheck::Ok) => {}
            Ok(check) => {
                log::error!("detile pass rejected: {:?}", check);
                return false;
            }
            Err(e) => {
                log::error!("detile pass check failed: {}", e);
                return false;
            }
        }
        if let Err(e) = self.blitter.queue_task(&detile) {
            log::error!("detile pass failed: {}", e);
            return false;
        }

        task.input.phys_addr = detile.output.phys_addr;
        task.input.format = detile.output.format;
        if task.input.deinterlace.enabled && task.input.deinterlace.motion != Motion::High {
            if let Some(prev) = prev {
                task.input.phys_addr_n = task.input.phys_addr;
                task.input.phys_addr = prev.luma_phys;
            }
        }
        true
    }

    /// Runs `task` on the deinterlace engine, shrinking the crops until the
    /// split logic accepts them.
    fn run_deint_task(&mut self, mut task: DeintTask) -> bool {
        loop {
            match self.blitter.check_task(&task) {
                Ok(TaskCheck::Ok) => break,
                Ok(TaskCheck::InputWidthOver) => task.input.crop.width -= 8,
                Ok(TaskCheck::InputHeightOver) => task.input.crop.height -= 8,
                Ok(TaskCheck::OutputWidthOver) => task.output.crop.width -= 8,
                Ok(TaskCheck::OutputHeightOver) => task.output.crop.height -= 8,
                Ok(TaskCheck::Reconfigured) => {
                    // The engine handle went away under a concurrent
                    // reconfiguration; the frame is already obsolete.
                    return true;
                }
                Ok(TaskCheck::Unsupported(code)) => {
                    log::warn!("unhandled task check error: {}", code);
                    return false;
                }
                Err(e) => {
                    log::error!("task check failed: {}", e);
                    return false;
                }
            }
        }
        if let Err(e) = self.blitter.queue_task(&task) {
            log::error!("deinterlace task failed: {}", e);
            return false;
        }
        true
    }

    /// Runs the plain 2D path: scale and convert straight into the target,
    /// swapping bytes when the destination is the capture buffer.
    fn run_2d_task(&mut self, task: &DeintTask, frame: &AttachedFrame, swap_colors: bool) -> bool {
        let width = frame.width as i32;
        let height = frame.height as i32;
        let mut planes = [0u64; 3];
        planes[0] = task.input.phys_addr;
        match task.input.format {
            SurfaceFormat::I420 => {
                planes[1] = planes[0] + align_up((width * height) as usize, 64) as u64;
                planes[2] = planes[1] + align_up((width * height) as usize / 2, 64) as u64;
            }
            _ => {
                planes[1] = planes[0] + align_up((width * height) as usize, 64) as u64;
            }
        }
        let src = Surface2d {
            format: task.input.format,
            planes,
            left: task.input.crop.x,
            top: task.input.crop.y,
            right: task.input.crop.x + task.input.crop.width,
            bottom: task.input.crop.y + task.input.crop.height,
            stride: width,
            width,
            height,
        };
        let dst = Surface2d {
            format: if swap_colors { SurfaceFormat::Bgra8888 } else { SurfaceFormat::Rgba8888 },
            planes: [task.output.phys_addr, 0, 0],
            left: task.output.crop.x,
            top: task.output.crop.y,
            right: task.output.crop.x + task.output.crop.width,
            bottom: task.output.crop.y + task.output.crop.height,
            stride: task.output.width as i32,
            width: task.output.width as i32,
            height: task.output.height as i32,
        };

        if let Err(e) = self.blitter.blit(&src, &dst) {
            log::error!("2D blit failed: {}", e);
            return false;
        }
        if let Err(e) = self.blitter.finish() {
            log::error!("2D blit completion failed: {}", e);
            return false;
        }
        if let Some(capture) = &self.capture {
            if task.output.phys_addr == capture.phys_addr {
                self.capture_done = true;
            }
        }
        true
    }

    /// Reprograms the output when the deinterlace format, its rate, or the
    /// frame rate actually changed. Reconfiguration blanks the display and
    /// remaps the framebuffer, so it must not run per frame.
    fn set_field_data(&mut self, field_fmt: FieldFlags, fps: f64) {
        if self.worker.is_none() {
            return;
        }

        let was_deinterlacing = self.screen.field_fmt.deinterlacing();
        let was_double_rate = self.screen.field_fmt.double_rate();
        self.screen.field_fmt = field_fmt;

        let changed = field_fmt.deinterlacing() != was_deinterlacing
            || field_fmt.double_rate() != was_double_rate
            || fps != self.screen.fps;
        {
            let mut link = self.link.lock().unwrap();
            if changed {
                link.configured = false;
            }
            if link.configured {
                return;
            }
        }

        self.screen.fps = fps;
        log::debug!(
            "output parameters changed - deinterlace {}{}, fps: {:.3}",
            if field_fmt.deinterlacing() { "active" } else { "not active" },
            if field_fmt.double_rate() { " double-rate" } else { "" },
            fps
        );
        self.adapt_screen(false);
    }

    /// Programs the output mode and remaps the framebuffer. With
    /// `allocate` set, reserves the full-HD footprint regardless of the
    /// current mode so later mode changes never grow the mapping.
    fn adapt_screen(&mut self, allocate: bool) -> bool {
        let native = {
            let mut link = self.link.lock().unwrap();
            match link.dev.native_mode() {
                Ok(native) => native,
                Err(e) => {
                    log::warn!("failed to query native display mode: {}", e);
                    drop(link);
                    self.restart();
                    return false;
                }
            }
        };

        let (width, height) =
            if allocate { (1920, 1080) } else { (native.width, native.height) };
        let format = if !allocate
            && (native.bits_per_pixel == 16
                || self.screen.field_fmt.deinterlacing()
                || (height >= 1080 && self.screen.fps >= HIGH_RATE_FPS))
        {
            ScreenFormat::Yuyv16
        } else {
            ScreenFormat::Rgba32
        };
        let config =
            ScreenConfig { width, height, format, pages: FB_PAGES as u32 };

        log::info!("changing framebuffer parameters: {}x{} {:?}", width, height, format);

        let map = {
            let mut link = self.link.lock().unwrap();
            if let Err(e) = link.dev.blank() {
                log::warn!("failed to blank display: {}", e);
            }
            match link.dev.configure(&config) {
                Ok(map) => {
                    link.yres = height;
                    link.current_page = 0;
                    map
                }
                Err(e) => {
                    log::warn!("failed to program display mode: {}", e);
                    drop(link);
                    self.restart();
                    return false;
                }
            }
        };

        self.screen.width = width as i32;
        self.screen.height = height as i32;
        self.screen.page_size = map.line_length * (height as usize + 1);
        self.screen.phys_base = map.smem_start;
        self.screen.format = format;
        self.page_crops = [IRect::default(); FB_PAGES];
        for page in 0..FB_PAGES {
            self.clear_page(page);
        }

        let mut link = self.link.lock().unwrap();
        if let Err(e) = link.dev.unblank() {
            log::warn!("failed to unblank display: {}", e);
        }
        link.configured = true;
        true
    }

    /// Clears one page to black in the configured pixel format.
    fn clear_page(&mut self, page: usize) {
        let mut link = self.link.lock().unwrap();
        let page_size = self.screen.page_size;
        let Some(memory) = link.dev.memory() else {
            return;
        };
        let offset = page * page_size;
        if offset + page_size > memory.len() {
            return;
        }
        let page_mem = &mut memory[offset..offset + page_size];
        match self.screen.format {
            ScreenFormat::Rgba32 => page_mem.fill(0),
            ScreenFormat::Yuyv16 => {
                let black = 128u16 << 8 | 16;
                for pixel in page_mem.chunks_exact_mut(2) {
                    LittleEndian::write_u16(pixel, black);
                }
            }
        }
    }

    fn ensure_scratch_buffer(&mut self, size: usize) -> bool {
        if let Some(scratch) = &self.scratch {
            if scratch.size == size {
                return true;
            }
            let scratch = self.scratch.take().unwrap();
            if let Err(e) = self.blitter.free_scratch(scratch) {
                log::error!("failed to free detile buffer: {}", e);
            }
        }
        match self.blitter.alloc_scratch(size) {
            Ok(scratch) => {
                self.scratch = Some(scratch);
                true
            }
            Err(e) => {
                log::error!("cannot allocate detile buffer: {}", e);
                false
            }
        }
    }

    fn ensure_capture_buffer(&mut self, size: usize) -> bool {
        if let Some(capture) = &self.capture {
            if capture.size == size {
                return true;
            }
            let capture = self.capture.take().unwrap();
            if let Err(e) = self.blitter.free_scratch(capture) {
                log::error!("failed to free capture buffer: {}", e);
            }
        }
        match self.blitter.alloc_scratch(size) {
            Ok(capture) => {
                self.capture = Some(capture);
                true
            }
            Err(e) => {
                log::error!("cannot allocate capture buffer: {}", e);
                false
            }
        }
    }

    /// Copies the currently displayed page into `out` as BGRA.
    ///
    /// RGBA pages are byte-swapped; packed-YUV pages go through the
    /// fixed-point conversion matrix.
    pub fn capture_display(
        &mut self,
        out: &mut [u8],
        width: usize,
        height: usize,
    ) -> Result<(), crate::display::DisplayError> {
        let page_size = self.screen.page_size;
        let fb_width = self.screen.width as usize;
        let fb_height = self.screen.height as usize;
        let format = self.screen.format;

        // Holding the link also stalls the flip thread, so the front page
        // cannot change mid-copy.
        let mut link = self.link.lock().unwrap();
        let page = link.current_page;
        let Some(memory) = link.dev.memory() else {
            return Err(crate::display::DisplayError::NotConfigured);
        };
        let offset = page * page_size;
        if offset + page_size > memory.len() {
            log::warn!("invalid page to capture");
            return Err(crate::display::DisplayError::NotConfigured);
        }
        let display = &memory[offset..offset + page_size];

        match format {
            ScreenFormat::Rgba32 => {
                let bytes = (width * height * 4).min(out.len()).min(display.len());
                out[..bytes].copy_from_slice(&display[..bytes]);
                for pixel in out[..bytes].chunks_exact_mut(4) {
                    pixel.swap(0, 2);
                }
            }
            ScreenFormat::Yuyv16 => {
                // Fixed-point BT.601 expansion, two pixels per macropixel.
                let cy = 1 << 16;
                let cr1 = (1.40200 * (1 << 16) as f64) as i32;
                let cr2 = (-0.71414 * (1 << 16) as f64) as i32;
                let cb2 = (-0.34414 * (1 << 16) as f64) as i32;
                let cb3 = (1.77200 * (1 << 16) as f64) as i32;

                let pairs = (width / 2).min(fb_width / 2);
                let rows = height.min(fb_height);
                let in_stride = fb_width * 2;
                let out_stride = width * 4;

                for y in 0..rows {
                    let line = &display[y * in_stride..];
                    let out_line = &mut out[y * out_stride..];
                    for x in 0..pairs {
                        let y0 = line[x * 4] as i32 - 16;
                        let u = line[x * 4 + 1] as i32 - 128;
                        let y1 = line[x * 4 + 2] as i32 - 16;
                        let v = line[x * 4 + 3] as i32 - 128;

                        for (i, luma) in [(0usize, y0), (1, y1)] {
                            let r = (cy * luma + cr1 * v) >> 16;
                            let g = (cy * luma + cb2 * u + cr2 * v) >> 16;
                            let b = (cy * luma + cb3 * u) >> 16;
                            let px = &mut out_line[x * 8 + i * 4..x * 8 + i * 4 + 4];
                            px[0] = b.clamp(0, 255) as u8;
                            px[1] = g.clamp(0, 255) as u8;
                            px[2] = r.clamp(0, 255) as u8;
                            px[3] = 255;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops the flip thread, blanks the display and joins. Pending flips
    /// are discarded; an in-flight blit completes first by construction,
    /// since blits run synchronously on the submit side.
    pub fn stop(&mut self) {
        self.queue.stop();
        {
            let mut link = self.link.lock().unwrap();
            if let Err(e) = link.dev.blank() {
                log::debug!("failed to blank display on stop: {}", e);
            }
            link.configured = false;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Tears the flip thread down and brings it back up; the next blit
    /// reconfigures the device from scratch.
    fn restart(&mut self) {
        log::info!("restarting display pipeline");
        self.queue.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.link.lock().unwrap().configured = false;
        self.queue.restart();
        self.spawn_worker();
    }
}

impl<B, F> Drop for DisplayPipeline<B, F>
where
    B: BlitDevice,
    F: DisplayDevice + 'static,
{
    fn drop(&mut self) {
        self.stop();
        if let Some(scratch) = self.scratch.take() {
            let _ = self.blitter.free_scratch(scratch);
        }
        if let Some(capture) = self.capture.take() {
            let _ = self.blitter.free_scratch(capture);
        }
    }
}

/// The flip thread: pops finished compositions and pans the framebuffer.
fn flip_loop<F: DisplayDevice>(
    queue: Arc<TaskQueue<QueuedFlip>>,
    link: Arc<Mutex<Link<F>>>,
    vsync: Arc<AtomicBool>,
) {
    log::info!("display flip thread started");
    while let Some(flip) = queue.pop() {
        let shift = stride_offset_parity(&flip.deint);
        {
            let mut link = link.lock().unwrap();
            if !link.configured {
                continue;
            }
            link.current_page = flip.page;
            let yoffset = (link.yres + 1) * flip.page as u32 + u32::from(!shift);
            if let Err(e) = link.dev.pan(yoffset) {
                log::warn!("panning failed: {}", e);
                continue;
            }
            if vsync.load(Ordering::Relaxed) {
                if let Err(e) = link.dev.wait_vsync() {
                    log::warn!("vsync wait failed: {}", e);
                }
            }
        }
        // The buffers this flip referenced are released here, after their
        // content reached the screen.
        drop(flip.previous);
    }
    log::info!("display flip thread terminated");
}

fn surface_format(format: DecodedFormat) -> SurfaceFormat {
    match format {
        DecodedFormat::NV12 => SurfaceFormat::Nv12,
        DecodedFormat::I420 => SurfaceFormat::I420,
        DecodedFormat::NV12Tiled => SurfaceFormat::Nv12Tiled,
        DecodedFormat::NV12TiledField => SurfaceFormat::Nv12TiledField,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::decoder::buffer::DecodeBuffer;
    use crate::device::decode::FieldType;
    use crate::device::decode::FrameBufferDesc;
    use crate::device::fake::FakeBlitDevice;
    use crate::device::fake::FakeDisplayDevice;

    fn frame_handle(luma: u64, width: u32, height: u32, format: DecodedFormat) -> FrameHandle {
        let buffer = DecodeBuffer::new(0);
        buffer.attach_frame(
            AttachedFrame {
                luma_phys: luma,
                width,
                height,
                format,
                field: FieldType::Progressive,
                crop: IRect::new(0, 0, width as i32, height as i32),
                aspect_q16: 1 << 16,
                planes: FrameBufferDesc { y_phys: luma, ..Default::default() },
            },
            None,
        );
        // The handle takes over the initial reference.
        FrameHandle::from_acquired(buffer)
    }

    fn pipeline(
        opts: DisplayOptions,
    ) -> DisplayPipeline<FakeBlitDevice, FakeDisplayDevice> {
        let mut pipeline =
            DisplayPipeline::new(FakeBlitDevice::new(), FakeDisplayDevice::new(), opts);
        pipeline.set_blit_rects(
            Rect::new(0.0, 0.0, 640.0, 480.0),
            Rect::new(0.0, 0.0, 1280.0, 720.0),
        );
        pipeline
    }

    fn wait_for(mut pred: impl FnMut() -> bool) {
        for _ in 0..500 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for the flip thread");
    }

    #[test]
    fn flips_follow_submission_order() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame1 = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);
        let frame2 = frame_handle(0x20_0000, 640, 480, DecodedFormat::NV12);

        assert!(pipeline.blit(None, &frame1, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));
        assert!(pipeline.blit(None, &frame2, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));

        wait_for(|| pipeline.link.lock().unwrap().dev.pans.len() == 2);
        let link = pipeline.link.lock().unwrap();
        // Progressive tasks take the parity default, so the pan offset is
        // the bare page offset: (yres + 1) * page.
        assert_eq!(link.dev.pans, vec![0, 721]);
        assert_eq!(link.dev.vsyncs, 2);
    }

    #[test]
    fn reconfiguration_only_on_real_changes() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);

        for _ in 0..3 {
            pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None);
        }
        assert_eq!(pipeline.link.lock().unwrap().dev.configures.len(), 1);

        // Enabling deinterlacing is a real change and forces the packed
        // 16-bit output.
        pipeline.blit(None, &frame, FieldFlags::TOP, 25.0, BlitTarget::Auto, None);
        {
            let link = pipeline.link.lock().unwrap();
            assert_eq!(link.dev.configures.len(), 2);
            assert_eq!(link.dev.configures[1].format, ScreenFormat::Yuyv16);
        }

        // A frame-rate change reprograms again.
        pipeline.blit(None, &frame, FieldFlags::TOP, 50.0, BlitTarget::Auto, None);
        assert_eq!(pipeline.link.lock().unwrap().dev.configures.len(), 3);
    }

    #[test]
    fn pages_are_cleared_when_the_crop_changes() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);

        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Page(0), None));
        let page_size = pipeline.screen.page_size;
        {
            let mut link = pipeline.link.lock().unwrap();
            let memory = link.dev.memory().unwrap();
            let zeros = vec![0u8; page_size];
            assert_eq!(
                crc32fast::hash(&memory[..page_size]),
                crc32fast::hash(&zeros),
                "page 0 was not cleared"
            );
            // Scribble on the page; an unnecessary clear would erase this.
            memory[0] = 0x55;
        }

        // Same crop again: the page is not cleared a second time.
        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Page(0), None));
        assert_eq!(pipeline.link.lock().unwrap().dev.memory().unwrap()[0], 0x55);

        // A different destination rectangle invalidates the cached crop
        // and forces a clear.
        assert!(pipeline.blit(
            None,
            &frame,
            FieldFlags::NONE,
            25.0,
            BlitTarget::Page(0),
            Some(Rect::new(0.0, 0.0, 640.0, 360.0))
        ));
        assert_eq!(pipeline.link.lock().unwrap().dev.memory().unwrap()[0], 0);
    }

    #[test]
    fn deinterlacing_uses_previous_frame_for_medium_motion() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame1 = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);
        let frame2 = frame_handle(0x20_0000, 640, 480, DecodedFormat::NV12);

        assert!(pipeline.blit(None, &frame1, FieldFlags::TOP, 25.0, BlitTarget::Auto, None));
        assert!(pipeline.blit(
            Some(&frame1),
            &frame2,
            FieldFlags::TOP,
            25.0,
            BlitTarget::Auto,
            None
        ));

        let tasks = &pipeline.blitter.deint_tasks;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].input.deinterlace.motion, Motion::High);
        assert_eq!(tasks[0].input.phys_addr_n, 0);

        // Medium motion feeds the previous frame as the first input and
        // the current one as the second temporal plane.
        assert_eq!(tasks[1].input.deinterlace.motion, Motion::Medium);
        assert_eq!(tasks[1].input.phys_addr, 0x10_0000);
        assert_eq!(tasks[1].input.phys_addr_n, 0x20_0000);
    }

    #[test]
    fn tiled_input_goes_through_a_detile_pass() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12Tiled);

        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));

        assert_eq!(pipeline.blitter.scratch_allocs, 1);
        let detile = &pipeline.blitter.deint_tasks[0];
        assert_eq!(detile.input.format, SurfaceFormat::Nv12Tiled);
        assert_eq!(detile.input.phys_addr, 0x10_0000);
        assert_eq!(detile.output.format, SurfaceFormat::Nv12);
        let scratch_addr = detile.output.phys_addr;

        // The main 2D blit reads the detiled copy, not the tiled original.
        let (src, _dst) = &pipeline.blitter.blits[0];
        assert_eq!(src.planes[0], scratch_addr);
    }

    #[test]
    fn oversized_task_is_shrunk_until_accepted() {
        let mut pipeline = pipeline(DisplayOptions {
            prefer_2d: false,
            ..Default::default()
        });
        pipeline.blitter.check_results.push_back(TaskCheck::InputWidthOver);
        pipeline.blitter.check_results.push_back(TaskCheck::Ok);

        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);
        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));

        let task = &pipeline.blitter.deint_tasks[0];
        assert_eq!(task.input.crop.width, 640 - 8);
    }

    #[test]
    fn capture_renders_byte_swapped_and_does_not_flip() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);

        // Configure the screen with a normal blit first.
        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));
        wait_for(|| pipeline.link.lock().unwrap().dev.pans.len() == 1);

        assert!(pipeline.blit(
            None,
            &frame,
            FieldFlags::NONE,
            25.0,
            BlitTarget::Capture,
            Some(Rect::new(0.0, 0.0, 320.0, 240.0))
        ));
        assert!(pipeline.capture_done);

        let (_src, dst) = pipeline.blitter.blits.last().unwrap();
        assert_eq!(dst.format, SurfaceFormat::Bgra8888);
        assert_eq!(dst.width, 320);
        assert_eq!(dst.height, 240);

        // No page flip was queued for the capture.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pipeline.link.lock().unwrap().dev.pans.len(), 1);
    }

    #[test]
    fn degenerate_crop_drops_the_task() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);
        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));
        let blits = pipeline.blitter.blits.len();

        assert!(!pipeline.blit(
            None,
            &frame,
            FieldFlags::NONE,
            25.0,
            BlitTarget::Page(0),
            Some(Rect::new(100.0, 100.0, 100.0, 100.0))
        ));
        assert_eq!(pipeline.blitter.blits.len(), blits);
    }

    #[test]
    fn failed_reconfiguration_restarts_the_pipeline() {
        let mut pipeline = pipeline(DisplayOptions::default());
        pipeline.link.lock().unwrap().dev.fail_configure = true;
        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);

        assert!(!pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));
        assert!(pipeline.worker.is_some());

        // The device recovers; the pipeline reconfigures on the next blit.
        pipeline.link.lock().unwrap().dev.fail_configure = false;
        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));
        wait_for(|| !pipeline.link.lock().unwrap().dev.pans.is_empty());
    }

    #[test]
    fn capture_display_swaps_rgba_bytes() {
        let mut pipeline = pipeline(DisplayOptions::default());
        let mut out = vec![0u8; 4];
        assert!(pipeline.capture_display(&mut out, 1, 1).is_err());

        let frame = frame_handle(0x10_0000, 640, 480, DecodedFormat::NV12);
        assert!(pipeline.blit(None, &frame, FieldFlags::NONE, 25.0, BlitTarget::Auto, None));
        wait_for(|| pipeline.link.lock().unwrap().dev.pans.len() == 1);

        {
            let mut link = pipeline.link.lock().unwrap();
            let memory = link.dev.memory().unwrap();
            memory[0..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        pipeline.capture_display(&mut out, 1, 1).unwrap();
        // RGBA in the framebuffer, BGRA out.
        assert_eq!(out, vec![3, 2, 1, 4]);
    }

    #[test]
    fn stop_blanks_and_joins() {
        let mut pipeline = pipeline(DisplayOptions::default());
        pipeline.stop();
        assert!(pipeline.worker.is_none());
        assert!(pipeline.link.lock().unwrap().dev.blanks >= 1);
    }
}

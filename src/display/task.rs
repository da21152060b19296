// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Composition task construction: rectangle clamping and alignment, motion
//! classification, and the page-flip parity rules.

use crate::device::blit::BlitRect;
use crate::device::blit::DeintParams;
use crate::device::blit::FieldFlags;
use crate::device::blit::Motion;
use crate::display::DeintMethod;
use crate::IRect;
use crate::Rect;

/// Blit rectangle edges must sit on this grid.
pub const BLIT_ALIGN: i32 = 8;

/// Crops of one composition, fully clamped and aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionRects {
    pub input: BlitRect,
    pub output: BlitRect,
}

/// Projects the parts of `dst` that fall outside the visible framebuffer
/// back onto `src`: the destination is clamped and the source shrinks
/// proportionally, never the other way around. The blitter rejects
/// out-of-bounds output rectangles outright.
pub(crate) fn clamp_to_screen(src: &mut Rect, dst: &mut Rect, fb_width: f32, fb_height: f32) {
    let src_width = src.width();
    let src_height = src.height();
    let dst_width = dst.width();
    let dst_height = dst.height();

    if dst.x1 < 0.0 {
        src.x1 -= dst.x1 * src_width / dst_width;
        dst.x1 = 0.0;
    }
    if dst.x2 > fb_width {
        src.x2 -= (dst.x2 - fb_width) * src_width / dst_width;
        dst.x2 = fb_width;
    }
    if dst.y1 < 0.0 {
        src.y1 -= dst.y1 * src_height / dst_height;
        dst.y1 = 0.0;
    }
    if dst.y2 > fb_height {
        src.y2 -= (dst.y2 - fb_height) * src_height / dst_height;
        dst.y2 = fb_height;
    }
}

fn round_up(value: i32, align: i32) -> i32 {
    (value + align - 1) / align * align
}

fn round_down(value: i32, align: i32) -> i32 {
    value / align * align
}

/// Rounds rectangle starts up and ends down to the blit grid, so the
/// aligned rectangle never grows past the clamped one.
pub(crate) fn blit_align(rect: &Rect) -> IRect {
    IRect {
        x1: round_up(rect.x1 as i32, BLIT_ALIGN),
        y1: round_up(rect.y1 as i32, BLIT_ALIGN),
        x2: round_down(rect.x2 as i32, BLIT_ALIGN),
        y2: round_down(rect.y2 as i32, BLIT_ALIGN),
    }
}

fn to_blit_rect(rect: IRect) -> BlitRect {
    BlitRect { x: rect.x1, y: rect.y1, width: rect.width(), height: rect.height() }
}

/// Computes the input/output crops of one composition.
///
/// When `capture_size` is set the output is an off-screen buffer of that
/// size and the destination becomes the full buffer.
pub(crate) fn composition_rects(
    src: Rect,
    dst: Rect,
    fb_width: i32,
    fb_height: i32,
    capture_size: bool,
) -> CompositionRects {
    let mut src = src;
    let mut dst = dst;
    clamp_to_screen(&mut src, &mut dst, fb_width as f32, fb_height as f32);

    let src_aligned = blit_align(&src);
    let dst_aligned = blit_align(&dst);

    let output = if capture_size {
        BlitRect { x: 0, y: 0, width: dst_aligned.width(), height: dst_aligned.height() }
    } else {
        to_blit_rect(dst_aligned)
    };

    CompositionRects { input: to_blit_rect(src_aligned), output }
}

/// Chooses the deinterlace motion class. Weave needs a previous frame and
/// runs low motion; the adaptive methods run medium motion when a previous
/// frame is chained; everything else falls back to high motion, which uses
/// a single temporal input.
pub fn select_motion(has_previous: bool, method: DeintMethod) -> Motion {
    if has_previous && method == DeintMethod::Weave {
        Motion::Low
    } else if has_previous
        && (method == DeintMethod::AdvancedMotion || method == DeintMethod::Auto)
    {
        Motion::Medium
    } else {
        Motion::High
    }
}

/// Builds the deinterlace parameters for one pass, or disabled parameters
/// for progressive content.
pub(crate) fn deint_params(
    field_fmt: FieldFlags,
    has_previous: bool,
    method: DeintMethod,
) -> DeintParams {
    if field_fmt.deinterlacing() {
        DeintParams {
            enabled: true,
            motion: select_motion(has_previous, method),
            field_fmt,
        }
    } else {
        DeintParams::default()
    }
}

// Mask/value pairs of the historical parity table. They are compared
// literally; the medium-motion pair cannot match, so medium motion never
// shifts the pan offset.
fn mask1() -> FieldFlags {
    FieldFlags::RATE_FRAME1 | FieldFlags::TOP
}

fn mask2() -> FieldFlags {
    FieldFlags::RATE_FRAME1 | FieldFlags::BOTTOM
}

/// Whether the pan offset of this task's page flip is shifted by one line,
/// compensating the deinterlacer's stride offset per motion class.
pub(crate) fn stride_offset_parity(deint: &DeintParams) -> bool {
    let f = deint.field_fmt;
    match deint.motion {
        Motion::High => f.masked(mask1()) == mask1() || f.masked(mask2()) == FieldFlags::BOTTOM,
        Motion::Medium => f.masked(mask2()) == mask1(),
        Motion::Low => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_overflow_shrinks_source() {
        // Destination sticks 100 pixels out on the right of a 1280-wide
        // screen; the source loses 100 * srcWidth/dstWidth pixels.
        let mut src = Rect::new(0.0, 0.0, 640.0, 480.0);
        let mut dst = Rect::new(0.0, 0.0, 1380.0, 720.0);
        clamp_to_screen(&mut src, &mut dst, 1280.0, 720.0);

        assert_eq!(dst.x2, 1280.0);
        let expected = 640.0 - 100.0 * 640.0 / 1380.0;
        assert!((src.x2 - expected).abs() < 1e-3);
        // The vertical axis was untouched.
        assert_eq!(dst.y2, 720.0);
        assert_eq!(src.y2, 480.0);
    }

    #[test]
    fn negative_destination_clamps_to_zero() {
        let mut src = Rect::new(0.0, 0.0, 720.0, 576.0);
        let mut dst = Rect::new(-64.0, -32.0, 1280.0, 720.0);
        clamp_to_screen(&mut src, &mut dst, 1280.0, 720.0);

        assert_eq!(dst.x1, 0.0);
        assert_eq!(dst.y1, 0.0);
        assert!(src.x1 > 0.0);
        assert!(src.y1 > 0.0);
    }

    #[test]
    fn aligned_rects_never_grow() {
        let rect = Rect::new(3.0, 5.0, 1277.0, 715.0);
        let aligned = blit_align(&rect);
        assert_eq!(aligned, IRect::new(8, 8, 1272, 712));
    }

    #[test]
    fn composition_stays_inside_framebuffer() {
        let rects = composition_rects(
            Rect::new(0.0, 0.0, 1920.0, 1080.0),
            Rect::new(-40.0, 0.0, 1320.0, 760.0),
            1280,
            720,
            false,
        );
        assert!(rects.output.x >= 0);
        assert!(rects.output.y >= 0);
        assert!(rects.output.x + rects.output.width <= 1280);
        assert!(rects.output.y + rects.output.height <= 720);
        assert_eq!(rects.output.x % BLIT_ALIGN, 0);
        assert_eq!(rects.output.width % BLIT_ALIGN, 0);
    }

    #[test]
    fn capture_output_is_origin_based() {
        let rects = composition_rects(
            Rect::new(0.0, 0.0, 640.0, 480.0),
            Rect::new(0.0, 0.0, 320.0, 240.0),
            1280,
            720,
            true,
        );
        assert_eq!(rects.output.x, 0);
        assert_eq!(rects.output.y, 0);
        assert_eq!(rects.output.width, 320);
        assert_eq!(rects.output.height, 240);
    }

    #[test]
    fn motion_selection() {
        assert_eq!(select_motion(true, DeintMethod::Weave), Motion::Low);
        assert_eq!(select_motion(true, DeintMethod::Auto), Motion::Medium);
        assert_eq!(select_motion(true, DeintMethod::AdvancedMotion), Motion::Medium);
        assert_eq!(select_motion(false, DeintMethod::Weave), Motion::High);
        assert_eq!(select_motion(false, DeintMethod::Auto), Motion::High);
    }

    #[test]
    fn parity_rules() {
        let task = |motion, field_fmt| DeintParams { enabled: true, motion, field_fmt };

        // High motion: second field of the pair rendering the top field, or
        // a first-field bottom pass.
        assert!(stride_offset_parity(&task(
            Motion::High,
            FieldFlags::RATE_FRAME1 | FieldFlags::TOP
        )));
        assert!(stride_offset_parity(&task(Motion::High, FieldFlags::BOTTOM)));
        assert!(!stride_offset_parity(&task(Motion::High, FieldFlags::TOP)));
        assert!(!stride_offset_parity(&task(
            Motion::High,
            FieldFlags::RATE_FRAME1 | FieldFlags::BOTTOM
        )));

        // The medium-motion comparison can never hold.
        assert!(!stride_offset_parity(&task(
            Motion::Medium,
            FieldFlags::RATE_FRAME1 | FieldFlags::BOTTOM
        )));
        assert!(!stride_offset_parity(&task(Motion::Medium, FieldFlags::TOP)));

        // Low motion always shifts.
        assert!(stride_offset_parity(&task(Motion::Low, FieldFlags::NONE)));
    }
}

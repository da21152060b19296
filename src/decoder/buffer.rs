// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted handles to hardware frame buffers.
//!
//! Each pool slot is wrapped by one [`DecodeBuffer`] whose reference count
//! is shared between the decode session, the display pipeline and any
//! consumer holding a displayed frame. The count is not a plain liveness
//! counter: crossing specific values triggers the lifecycle side effects
//! that keep the hardware fed.
//!
//! * dropping to **2** means only the session and the next frame still
//!   reference the buffer, so its chained predecessor is no longer needed
//!   for motion compensation and is released;
//! * dropping to **1** means only the session holds it: the buffer is
//!   marked rendered so its hardware slot can be reclaimed on the next
//!   decode call, and the predecessor is released;
//! * dropping to **0** destroys the object.
//!
//! These are exact equality checks; a count never skips a value.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::device::decode::DecodeDevice;
use crate::device::decode::FieldType;
use crate::device::decode::FrameBufferDesc;
use crate::device::DeviceError;
use crate::DecodedFormat;
use crate::IRect;

/// Decoded content attached to a pool slot.
#[derive(Debug, Clone)]
pub struct AttachedFrame {
    /// Luma plane address, identifying the hardware slot.
    pub luma_phys: u64,
    /// Coded size, already rounded up to the macroblock grid.
    pub width: u32,
    pub height: u32,
    pub format: DecodedFormat,
    pub field: FieldType,
    pub crop: IRect,
    pub aspect_q16: u32,
    pub planes: FrameBufferDesc,
}

#[derive(Default)]
struct Inner {
    frame: Option<AttachedFrame>,
    pts: Option<u64>,
    dts: Option<u64>,
    /// The immediately preceding displayed buffer, kept alive for
    /// motion-compensated deinterlacing. Holds one reference.
    previous: Option<Arc<DecodeBuffer>>,
}

/// One hardware frame buffer slot and its decoded content.
pub struct DecodeBuffer {
    index: usize,
    refs: AtomicI32,
    rendered: AtomicBool,
    inner: Mutex<Inner>,
}

impl DecodeBuffer {
    /// Creates a slot wrapper with a count of 1: the pool's own reference.
    pub(crate) fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            refs: AtomicI32::new(1),
            rendered: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Takes a reference.
    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference and returns the remaining count, applying the
    /// threshold side effects described in the module documentation.
    ///
    /// The side effects run outside the atomic operation and outside any
    /// pool-wide lock, so a release from the display thread can never
    /// deadlock against the session.
    pub fn release(&self) -> i32 {
        let count = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(count >= 0, "refcount underflow on buffer {}", self.index);
        match count {
            2 => {
                // Only the session and the successor frame are left; the
                // predecessor is no longer needed.
                self.release_previous();
            }
            1 => {
                let previous = {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.frame.is_some() {
                        self.rendered.store(true, Ordering::Release);
                        inner.previous.take()
                    } else {
                        None
                    }
                };
                if let Some(previous) = previous {
                    previous.release();
                }
            }
            _ => {}
        }
        count
    }

    fn release_previous(&self) {
        let previous = self.inner.lock().unwrap().previous.take();
        if let Some(previous) = previous {
            previous.release();
        }
    }

    /// Whether only the session holds this buffer and its slot may be
    /// returned to the engine.
    pub fn rendered(&self) -> bool {
        self.rendered.load(Ordering::Acquire)
    }

    /// Returns the hardware slot to the engine and clears the decoded
    /// content. Idempotent: calling it on an already-cleared buffer does
    /// nothing.
    pub fn release_hw_slot<D: DecodeDevice>(&self, device: &mut D) -> Result<(), DeviceError> {
        let (frame, previous) = {
            let mut inner = self.inner.lock().unwrap();
            inner.pts = None;
            inner.dts = None;
            (inner.frame.take(), inner.previous.take())
        };
        self.rendered.store(false, Ordering::Release);
        let ret = match &frame {
            Some(frame) => device.frame_displayed(frame.luma_phys),
            None => Ok(()),
        };
        if let Some(previous) = previous {
            previous.release();
        }
        ret
    }

    /// Attaches freshly decoded content and chains the previously displayed
    /// buffer. Only the session calls this, at a point where no external
    /// reference to the slot exists.
    pub(crate) fn attach_frame(&self, frame: AttachedFrame, previous: Option<&Arc<DecodeBuffer>>) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.previous.is_none(), "chaining over a live predecessor");
        inner.frame = Some(frame);
        self.rendered.store(false, Ordering::Release);
        inner.previous = previous.map(|prev| {
            prev.acquire();
            Arc::clone(prev)
        });
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().frame.is_some()
    }

    pub fn has_previous(&self) -> bool {
        self.inner.lock().unwrap().previous.is_some()
    }

    pub fn frame(&self) -> Option<AttachedFrame> {
        self.inner.lock().unwrap().frame.clone()
    }

    pub fn pts(&self) -> Option<u64> {
        self.inner.lock().unwrap().pts
    }

    pub fn set_pts(&self, pts: Option<u64>) {
        self.inner.lock().unwrap().pts = pts;
    }

    pub fn dts(&self) -> Option<u64> {
        self.inner.lock().unwrap().dts
    }

    pub fn set_dts(&self, dts: Option<u64>) {
        self.inner.lock().unwrap().dts = dts;
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }
}

impl Drop for DecodeBuffer {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.refs.load(Ordering::Acquire),
            0,
            "buffer {} destroyed with live references",
            self.index
        );
    }
}

impl std::fmt::Debug for DecodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeBuffer")
            .field("index", &self.index)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("rendered", &self.rendered.load(Ordering::Relaxed))
            .finish()
    }
}

/// Caller-facing reference to a decoded frame.
///
/// Construction and `clone` take a buffer reference, `drop` releases it.
pub struct FrameHandle {
    buffer: Arc<DecodeBuffer>,
}

impl FrameHandle {
    /// Wraps a buffer whose reference for this handle has already been
    /// taken by the session.
    pub(crate) fn from_acquired(buffer: Arc<DecodeBuffer>) -> Self {
        Self { buffer }
    }

    pub fn frame(&self) -> Option<AttachedFrame> {
        self.buffer.frame()
    }

    pub fn pts(&self) -> Option<u64> {
        self.buffer.pts()
    }

    pub fn dts(&self) -> Option<u64> {
        self.buffer.dts()
    }

    pub(crate) fn buffer(&self) -> &Arc<DecodeBuffer> {
        &self.buffer
    }
}

impl Clone for FrameHandle {
    fn clone(&self) -> Self {
        self.buffer.acquire();
        Self { buffer: Arc::clone(&self.buffer) }
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle").field("buffer", &self.buffer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::DecodeCall;
    use crate::device::fake::FakeDecodeDevice;

    fn attached(luma: u64) -> AttachedFrame {
        AttachedFrame {
            luma_phys: luma,
            width: 320,
            height: 240,
            format: DecodedFormat::NV12,
            field: FieldType::Progressive,
            crop: IRect::new(0, 0, 320, 240),
            aspect_q16: 1 << 16,
            planes: FrameBufferDesc { y_phys: luma, ..Default::default() },
        }
    }

    #[test]
    fn rendered_at_count_one() {
        let buf = DecodeBuffer::new(0);
        buf.attach_frame(attached(0x1000), None);
        buf.acquire(); // consumer
        assert!(!buf.rendered());
        assert_eq!(buf.release(), 1);
        assert!(buf.rendered());
        // Tear down: drop the pool reference.
        assert_eq!(buf.release(), 0);
    }

    #[test]
    fn predecessor_released_once_at_count_two() {
        let prev = DecodeBuffer::new(0);
        prev.attach_frame(attached(0x1000), None);

        let cur = DecodeBuffer::new(1);
        cur.attach_frame(attached(0x2000), Some(&prev));
        assert_eq!(prev.refcount(), 2);

        // Renderer and display pipeline both hold the current frame.
        cur.acquire();
        cur.acquire();

        // First release lands on 2 and unchains the predecessor.
        assert_eq!(cur.release(), 2);
        assert_eq!(prev.refcount(), 1);
        assert!(prev.rendered());
        assert!(!cur.has_previous());

        // Second release lands on 1; the chain is already empty, so the
        // predecessor is not touched again.
        assert_eq!(cur.release(), 1);
        assert_eq!(prev.refcount(), 1);
        assert!(cur.rendered());

        assert_eq!(cur.release(), 0);
        assert_eq!(prev.release(), 0);
    }

    #[test]
    fn release_hw_slot_is_idempotent() {
        let mut dev = FakeDecodeDevice::new();
        let buf = DecodeBuffer::new(0);
        buf.attach_frame(attached(0x1000), None);
        buf.set_pts(Some(42));

        buf.release_hw_slot(&mut dev).unwrap();
        assert!(!buf.is_attached());
        assert_eq!(buf.pts(), None);
        assert!(!buf.rendered());

        // Second call is a no-op and must not notify the engine again.
        buf.release_hw_slot(&mut dev).unwrap();
        let displays = dev
            .calls
            .iter()
            .filter(|c| matches!(c, DecodeCall::FrameDisplayed(_)))
            .count();
        assert_eq!(displays, 1);

        assert_eq!(buf.release(), 0);
    }

    #[test]
    fn handle_clone_and_drop_balance() {
        let buf = DecodeBuffer::new(0);
        buf.attach_frame(attached(0x1000), None);
        buf.acquire();
        let handle = FrameHandle::from_acquired(Arc::clone(&buf));
        assert_eq!(buf.refcount(), 2);
        let second = handle.clone();
        assert_eq!(buf.refcount(), 3);
        drop(second);
        assert_eq!(buf.refcount(), 2);
        drop(handle);
        assert!(buf.rendered());
        assert_eq!(buf.release(), 0);
    }
}

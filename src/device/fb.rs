// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framebuffer device access.
//!
//! The display pipeline owns one fbdev node and drives it through a small
//! set of ioctls: mode programming, blanking, page flips via display
//! panning, and the vertical-sync wait. The device's memory is mapped so
//! pages can be cleared and captured by the CPU.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::slice;

use nix::libc;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use zerocopy::FromZeros;

use crate::device::DeviceError;
use crate::utils::fourcc;

/// Pixel format programmed into the framebuffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScreenFormat {
    /// 32-bit RGBA, used for progressive content.
    Rgba32,
    /// Packed 16-bit YUV 4:2:2, used when deinterlacing or when bandwidth
    /// demands it.
    Yuyv16,
}

impl ScreenFormat {
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            ScreenFormat::Rgba32 => 32,
            ScreenFormat::Yuyv16 => 16,
        }
    }

    /// Non-standard pixel format tag the driver expects alongside the
    /// depth.
    pub fn nonstd(&self) -> u32 {
        match self {
            ScreenFormat::Rgba32 => fourcc(b"RGB4"),
            ScreenFormat::Yuyv16 => fourcc(b"YUYV"),
        }
    }
}

/// Mode requested of the display device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScreenConfig {
    pub width: u32,
    pub height: u32,
    pub format: ScreenFormat,
    /// Framebuffer pages cycled by panning.
    pub pages: u32,
}

/// Result of programming a mode: the device-chosen layout of the
/// framebuffer memory.
#[derive(Copy, Clone, Debug, Default)]
pub struct ScreenMap {
    pub line_length: usize,
    pub smem_start: u64,
    pub smem_len: usize,
}

/// Mode of the primary display the overlay sits on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeMode {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

/// The display device as the pipeline sees it.
///
/// Implemented by [`FbDevice`] for real fbdev nodes and by the fake device
/// in tests.
pub trait DisplayDevice: Send {
    /// Mode of the primary display, used to size the overlay and pick its
    /// depth.
    fn native_mode(&mut self) -> Result<NativeMode, DeviceError>;

    /// Programs `config` and remaps the framebuffer memory.
    fn configure(&mut self, config: &ScreenConfig) -> Result<ScreenMap, DeviceError>;

    fn blank(&mut self) -> Result<(), DeviceError>;

    fn unblank(&mut self) -> Result<(), DeviceError>;

    /// Pans the visible region to `yoffset` lines from the top of the
    /// virtual framebuffer, taking effect at the next vertical blank.
    fn pan(&mut self, yoffset: u32) -> Result<(), DeviceError>;

    /// Blocks until the next vertical blank.
    fn wait_vsync(&mut self) -> Result<(), DeviceError>;

    /// The mapped framebuffer memory, if a mode has been programmed.
    fn memory(&mut self) -> Option<&mut [u8]>;
}

/// Variable screen information, matching the kernel's `fb_var_screeninfo`.
#[repr(C)]
#[derive(FromZeros, Clone, Copy)]
pub struct VarScreenInfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(FromZeros, Clone, Copy)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

/// Fixed screen information, matching the kernel's `fb_fix_screeninfo`.
#[repr(C)]
#[derive(FromZeros, Clone, Copy)]
pub struct FixScreenInfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub fb_type: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOPUT_VSCREENINFO: u32 = 0x4601;
const FBIOGET_FSCREENINFO: u32 = 0x4602;
const FBIOPAN_DISPLAY: u32 = 0x4606;
const FBIOBLANK: u32 = 0x4611;

const FB_ACTIVATE_NOW: u32 = 0;
const FB_ACTIVATE_VBL: u32 = 16;
const FB_BLANK_UNBLANK: i32 = 0;
const FB_BLANK_NORMAL: i32 = 1;

nix::ioctl_read_bad!(fbioget_vscreeninfo, FBIOGET_VSCREENINFO, VarScreenInfo);
nix::ioctl_write_ptr_bad!(fbioput_vscreeninfo, FBIOPUT_VSCREENINFO, VarScreenInfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, FBIOGET_FSCREENINFO, FixScreenInfo);
nix::ioctl_write_ptr_bad!(fbiopan_display, FBIOPAN_DISPLAY, VarScreenInfo);
nix::ioctl_write_int_bad!(fbioblank, FBIOBLANK);
// FBIO_WAITFORVSYNC is a regular encoded ioctl, unlike the legacy ones
// above.
nix::ioctl_write_ptr!(fbio_waitforvsync, b'F', 0x20, u32);

struct Mapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

/// An fbdev node plus its current mapping.
pub struct FbDevice {
    file: File,
    primary: PathBuf,
    var: VarScreenInfo,
    map: Option<Mapping>,
}

// SAFETY: the mapping pointer is only dereferenced through `&mut self`, so
// moving the device to the display thread is sound.
unsafe impl Send for FbDevice {}

impl FbDevice {
    /// Opens the overlay framebuffer at `path`. `primary` is the base
    /// framebuffer whose mode defines the visible resolution.
    pub fn open<P: AsRef<Path>>(path: P, primary: P) -> Result<Self, DeviceError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| {
                log::warn!("failed to open framebuffer {}: {}", path.as_ref().display(), e);
                DeviceError::Io(nix::Error::from_raw(e.raw_os_error().unwrap_or(0)))
            })?;
        Ok(Self {
            file,
            primary: primary.as_ref().to_path_buf(),
            var: VarScreenInfo::new_zeroed(),
            map: None,
        })
    }

    fn unmap(&mut self) {
        if let Some(map) = self.map.take() {
            // SAFETY: `ptr` and `len` come from a successful mmap of the
            // framebuffer and nothing else aliases the mapping.
            if let Err(e) = unsafe { munmap(map.ptr, map.len) } {
                log::error!("failed to unmap framebuffer memory: {}", e);
            }
        }
    }
}

impl DisplayDevice for FbDevice {
    fn native_mode(&mut self) -> Result<NativeMode, DeviceError> {
        let file = File::open(&self.primary).map_err(|e| {
            log::warn!("failed to open {}: {}", self.primary.display(), e);
            DeviceError::Io(nix::Error::from_raw(e.raw_os_error().unwrap_or(0)))
        })?;
        let mut var = VarScreenInfo::new_zeroed();
        // SAFETY: the fd is valid and `var` is a correctly sized
        // fb_var_screeninfo.
        unsafe { fbioget_vscreeninfo(file.as_raw_fd(), &mut var) }?;
        Ok(NativeMode { width: var.xres, height: var.yres, bits_per_pixel: var.bits_per_pixel })
    }

    fn configure(&mut self, config: &ScreenConfig) -> Result<ScreenMap, DeviceError> {
        let fd = self.file.as_raw_fd();
        let mut var = VarScreenInfo::new_zeroed();
        // SAFETY: valid fd, correctly sized struct.
        unsafe { fbioget_vscreeninfo(fd, &mut var) }?;

        var.xoffset = 0;
        var.yoffset = 0;
        var.xres = config.width;
        var.yres = config.height;
        var.xres_virtual = config.width;
        // One spare line per page keeps the field parity shift addressable.
        var.yres_virtual = (config.height + 1) * config.pages;
        var.bits_per_pixel = config.format.bits_per_pixel();
        var.nonstd = config.format.nonstd();
        var.activate = FB_ACTIVATE_NOW;

        // SAFETY: valid fd, correctly sized struct.
        unsafe { fbioput_vscreeninfo(fd, &var) }?;
        let mut fix = FixScreenInfo::new_zeroed();
        // SAFETY: valid fd, correctly sized struct.
        unsafe { fbioget_fscreeninfo(fd, &mut fix) }?;
        self.var = var;

        self.unmap();
        let len = NonZeroUsize::new(fix.smem_len as usize)
            .ok_or_else(|| anyhow::anyhow!("device reports zero framebuffer memory"))?;
        // SAFETY: mapping the framebuffer fd shared read/write; the mapping
        // is released in unmap() before the fd can be closed.
        let ptr = unsafe {
            mmap(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, &self.file, 0)
        }?;
        self.map = Some(Mapping { ptr, len: len.get() });

        Ok(ScreenMap {
            line_length: fix.line_length as usize,
            smem_start: fix.smem_start as u64,
            smem_len: fix.smem_len as usize,
        })
    }

    fn blank(&mut self) -> Result<(), DeviceError> {
        // SAFETY: valid fd, integer argument ioctl.
        unsafe { fbioblank(self.file.as_raw_fd(), FB_BLANK_NORMAL) }?;
        Ok(())
    }

    fn unblank(&mut self) -> Result<(), DeviceError> {
        // SAFETY: valid fd, integer argument ioctl.
        unsafe { fbioblank(self.file.as_raw_fd(), FB_BLANK_UNBLANK) }?;
        Ok(())
    }

    fn pan(&mut self, yoffset: u32) -> Result<(), DeviceError> {
        self.var.activate = FB_ACTIVATE_VBL;
        self.var.yoffset = yoffset;
        // SAFETY: valid fd, correctly sized struct.
        unsafe { fbiopan_display(self.file.as_raw_fd(), &self.var) }?;
        Ok(())
    }

    fn wait_vsync(&mut self) -> Result<(), DeviceError> {
        let arg: u32 = 0;
        // SAFETY: valid fd, correctly sized argument.
        unsafe { fbio_waitforvsync(self.file.as_raw_fd(), &arg) }?;
        Ok(())
    }

    fn memory(&mut self) -> Option<&mut [u8]> {
        self.map.as_mut().map(|map| {
            // SAFETY: the mapping is valid for `len` bytes for as long as
            // `self` lives, and `&mut self` guarantees exclusivity.
            unsafe { slice::from_raw_parts_mut(map.ptr.as_ptr() as *mut u8, map.len) }
        })
    }
}

impl Drop for FbDevice {
    fn drop(&mut self) {
        self.unmap();
    }
}

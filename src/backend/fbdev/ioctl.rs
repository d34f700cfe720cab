// SPDX-License-Identifier: GPL-3.0-only

//! Linux fbdev ioctls, see `<linux/fb.h>`.

use std::{
    io,
    os::unix::io::AsRawFd,
    ptr::{self, NonNull},
    slice,
};

use tracing::warn;

use super::{DeviceMemory, FramebufferDevice};
use crate::session::SessionFd;

const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOPUT_VSCREENINFO: u32 = 0x4601;
const FBIOGET_FSCREENINFO: u32 = 0x4602;
const FBIOBLANK: u32 = 0x4611;

pub const FB_ACTIVATE_NOW: u32 = 0;
const FB_BLANK_UNBLANK: libc::c_int = 0;
const FB_BLANK_POWERDOWN: libc::c_int = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarScreenInfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: Bitfield,
    pub green: Bitfield,
    pub blue: Bitfield,
    pub transp: Bitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    /// Picoseconds per pixel.
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
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixScreenInfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub type_: u32,
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

/// A `/dev/fbN` device node.
#[derive(Debug)]
pub struct FbdevNode {
    fd: SessionFd,
}

impl FbdevNode {
    pub fn new(fd: SessionFd) -> FbdevNode {
        FbdevNode { fd }
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl FramebufferDevice for FbdevNode {
    fn var_screen_info(&self) -> io::Result<VarScreenInfo> {
        let mut info = VarScreenInfo::default();
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                FBIOGET_VSCREENINFO as _,
                &mut info as *mut VarScreenInfo,
            )
        })?;
        Ok(info)
    }

    fn put_var_screen_info(&mut self, info: &mut VarScreenInfo) -> io::Result<()> {
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                FBIOPUT_VSCREENINFO as _,
                info as *mut VarScreenInfo,
            )
        })
    }

    fn fix_screen_info(&self) -> io::Result<FixScreenInfo> {
        let mut info = FixScreenInfo::default();
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                FBIOGET_FSCREENINFO as _,
                &mut info as *mut FixScreenInfo,
            )
        })?;
        Ok(info)
    }

    fn blank(&mut self, blank: bool) -> io::Result<()> {
        let level = if blank {
            FB_BLANK_POWERDOWN
        } else {
            FB_BLANK_UNBLANK
        };
        check(unsafe { libc::ioctl(self.fd.as_raw_fd(), FBIOBLANK as _, level) })
    }

    fn map(&mut self, len: usize) -> io::Result<Box<dyn DeviceMemory>> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Box::new(MappedMemory { ptr, len }))
    }
}

struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl DeviceMemory for MappedMemory {
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) } < 0 {
            warn!(err = ?io::Error::last_os_error(), "Failed to unmap framebuffer");
        }
    }
}

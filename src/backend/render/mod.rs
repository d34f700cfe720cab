// SPDX-License-Identifier: GPL-3.0-only

use std::{cell::RefCell, rc::Rc};

use smithay::utils::{Physical, Point, Rectangle, Size};

use crate::utils::geometry::Region;

pub mod memory;
pub use self::memory::MemoryRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u32);

impl TargetId {
    pub fn new(raw: u32) -> TargetId {
        TargetId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Pixel layouts, named like their DRM fourcc counterparts (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            _ => 4,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Argb8888 | PixelFormat::Abgr8888)
    }

    /// Encodes a `0xAARRGGBB` pixel into `out`.
    pub fn write_pixel(self, argb: u32, out: &mut [u8]) {
        let [b, g, r, a] = argb.to_le_bytes();
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => {
                out[..4].copy_from_slice(&[b, g, r, a]);
            }
            PixelFormat::Abgr8888 | PixelFormat::Xbgr8888 => {
                out[..4].copy_from_slice(&[r, g, b, a]);
            }
            PixelFormat::Rgb565 => {
                let packed =
                    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
                out[..2].copy_from_slice(&packed.to_le_bytes());
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown render target {0:?}")]
    UnknownTarget(TargetId),
    #[error("no render target is bound")]
    NotBound,
    #[error("invalid render target size {0}x{1}")]
    InvalidSize(i32, i32),
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
}

/// The narrow slice of a GPU renderer the outputs rely on.
pub trait Renderer {
    fn create_target(
        &mut self,
        size: Size<i32, Physical>,
        format: PixelFormat,
    ) -> Result<TargetId, RenderError>;
    fn destroy_target(&mut self, target: TargetId);

    fn bind(&mut self, target: TargetId) -> Result<(), RenderError>;
    fn unbind(&mut self);

    fn begin(&mut self, size: Size<i32, Physical>) -> Result<(), RenderError>;
    fn clear(&mut self, color: [f32; 4]);
    fn end(&mut self);

    /// Reads `src` of `target` into `dst`, an image with `stride` bytes per row,
    /// placing the first pixel at `dst_loc`.
    ///
    /// `src` uses the GL convention: y grows upwards from the bottom row.
    /// Rows are written in the order they are read, no flipping takes place.
    fn read_pixels(
        &mut self,
        target: TargetId,
        format: PixelFormat,
        stride: usize,
        src: Rectangle<i32, Physical>,
        dst_loc: Point<i32, Physical>,
        dst: &mut [u8],
    ) -> bool;

    /// Age of the target contents in frames, or a negative value if unknown.
    fn buffer_age(&self, target: TargetId) -> i32;
}

pub type SharedRenderer = Rc<RefCell<dyn Renderer>>;

/// Copies the damaged parts of `target` into a top-down image.
///
/// Render targets are stored bottom-up, so every row is read individually
/// from its mirrored position.
#[profiling::function]
pub fn copy_damage_flipped(
    renderer: &mut dyn Renderer,
    target: TargetId,
    height: i32,
    format: PixelFormat,
    stride: usize,
    damage: &Region,
    dst: &mut [u8],
) -> bool {
    for rect in damage.rects() {
        for row in rect.loc.y..rect.loc.y + rect.size.h {
            let src = Rectangle::new((rect.loc.x, height - row - 1).into(), (rect.size.w, 1).into());
            if !renderer.read_pixels(target, format, stride, src, (rect.loc.x, row).into(), dst) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_encoding() {
        let mut out = [0u8; 4];
        PixelFormat::Xrgb8888.write_pixel(0xff112233, &mut out);
        assert_eq!(out, [0x33, 0x22, 0x11, 0xff]);
        PixelFormat::Xbgr8888.write_pixel(0xff112233, &mut out);
        assert_eq!(out, [0x11, 0x22, 0x33, 0xff]);

        let mut out = [0u8; 2];
        PixelFormat::Rgb565.write_pixel(0xffff0000, &mut out);
        assert_eq!(u16::from_le_bytes(out), 0xf800);
    }
}

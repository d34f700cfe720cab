// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::{Physical, Size};

use super::ShadowImage;
use crate::{backend::render::PixelFormat, utils::geometry::Region};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("unsupported frame size {0}x{1}")]
    UnsupportedSize(i32, i32),
    #[error("encoder has not been initialized")]
    Uninitialized,
    #[error("image does not match the encoder configuration")]
    ImageMismatch,
    #[error("damage lies outside of the image")]
    OutOfBounds,
    #[error("codec failure: {0}")]
    Codec(String),
}

/// Turns damaged parts of an image into bytes for the peer.
pub trait FrameEncoder {
    /// (Re)configures the encoder for images of `size`.
    fn reset(&mut self, size: Size<i32, Physical>, format: PixelFormat) -> Result<(), EncodeError>;
    fn encode(
        &mut self,
        image: &ShadowImage,
        damage: &Region,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError>;
}

/// Uncompressed encoding.
///
/// A little-endian `u32` rectangle count, then for every rectangle its
/// `x`, `y`, `width` and `height` as little-endian `u32`s followed by its rows.
#[derive(Debug, Default)]
pub struct RawEncoder {
    config: Option<(Size<i32, Physical>, PixelFormat)>,
}

impl FrameEncoder for RawEncoder {
    fn reset(&mut self, size: Size<i32, Physical>, format: PixelFormat) -> Result<(), EncodeError> {
        if size.w <= 0 || size.h <= 0 {
            return Err(EncodeError::UnsupportedSize(size.w, size.h));
        }
        self.config = Some((size, format));
        Ok(())
    }

    #[profiling::function]
    fn encode(
        &mut self,
        image: &ShadowImage,
        damage: &Region,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        let (size, format) = self.config.ok_or(EncodeError::Uninitialized)?;
        if image.size() != size || image.format() != format {
            return Err(EncodeError::ImageMismatch);
        }

        let bpp = format.bytes_per_pixel();
        out.extend_from_slice(&(damage.len() as u32).to_le_bytes());
        for rect in damage.rects() {
            for value in [rect.loc.x, rect.loc.y, rect.size.w, rect.size.h] {
                out.extend_from_slice(&(value as u32).to_le_bytes());
            }
            for row in rect.loc.y..rect.loc.y + rect.size.h {
                let start = row as usize * image.stride() + rect.loc.x as usize * bpp;
                let end = start + rect.size.w as usize * bpp;
                let pixels = image
                    .data()
                    .get(start..end)
                    .ok_or(EncodeError::OutOfBounds)?;
                out.extend_from_slice(pixels);
            }
        }
        Ok(())
    }
}

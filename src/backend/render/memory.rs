// SPDX-License-Identifier: GPL-3.0-only

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use smithay::utils::{Physical, Point, Rectangle, Size};
use tracing::trace;

use super::{PixelFormat, RenderError, Renderer, TargetId};
use crate::utils::geometry::Rect;

struct MemoryTarget {
    size: Size<i32, Physical>,
    /// `0xAARRGGBB`, rows stored top to bottom
    pixels: Vec<u32>,
    age: i32,
}

impl MemoryTarget {
    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.size.w || y >= self.size.h {
            return None;
        }
        Some(y as usize * self.size.w as usize + x as usize)
    }
}

/// CPU renderer drawing into plain memory.
#[derive(Default)]
pub struct MemoryRenderer {
    targets: HashMap<TargetId, MemoryTarget>,
    next_id: u32,
    bound: Option<TargetId>,
    frame: Option<Size<i32, Physical>>,
    fail_reads: bool,
}

impl MemoryRenderer {
    pub fn new() -> MemoryRenderer {
        MemoryRenderer::default()
    }

    pub fn into_shared(self) -> Rc<RefCell<MemoryRenderer>> {
        Rc::new(RefCell::new(self))
    }

    pub fn bound(&self) -> Option<TargetId> {
        self.bound
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn target_size(&self, target: TargetId) -> Option<Size<i32, Physical>> {
        self.targets.get(&target).map(|t| t.size)
    }

    /// Fills `rect` (top-left origin) of the bound target.
    pub fn fill_rect(&mut self, rect: Rect, argb: u32) -> Result<(), RenderError> {
        let target = self.bound.ok_or(RenderError::NotBound)?;
        let target = self
            .targets
            .get_mut(&target)
            .ok_or(RenderError::UnknownTarget(target))?;
        for y in rect.loc.y..rect.loc.y + rect.size.h {
            for x in rect.loc.x..rect.loc.x + rect.size.w {
                if let Some(idx) = target.index(x, y) {
                    target.pixels[idx] = argb;
                }
            }
        }
        Ok(())
    }

    /// Pixel at `x`, `y` (top-left origin).
    pub fn pixel(&self, target: TargetId, x: i32, y: i32) -> Option<u32> {
        let target = self.targets.get(&target)?;
        target.index(x, y).map(|idx| target.pixels[idx])
    }

    /// Makes every following `read_pixels` call fail.
    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }
}

fn to_argb(color: [f32; 4]) -> u32 {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
    channel(color[3]) << 24 | channel(color[0]) << 16 | channel(color[1]) << 8 | channel(color[2])
}

impl Renderer for MemoryRenderer {
    fn create_target(
        &mut self,
        size: Size<i32, Physical>,
        format: PixelFormat,
    ) -> Result<TargetId, RenderError> {
        if size.w <= 0 || size.h <= 0 {
            return Err(RenderError::InvalidSize(size.w, size.h));
        }
        let id = TargetId::new(self.next_id);
        self.next_id += 1;
        trace!(?id, ?size, ?format, "Created memory render target");
        self.targets.insert(
            id,
            MemoryTarget {
                size,
                pixels: vec![0; size.w as usize * size.h as usize],
                age: -1,
            },
        );
        Ok(id)
    }

    fn destroy_target(&mut self, target: TargetId) {
        if self.bound == Some(target) {
            self.unbind();
        }
        self.targets.remove(&target);
    }

    fn bind(&mut self, target: TargetId) -> Result<(), RenderError> {
        if !self.targets.contains_key(&target) {
            return Err(RenderError::UnknownTarget(target));
        }
        self.bound = Some(target);
        Ok(())
    }

    fn unbind(&mut self) {
        self.bound = None;
        self.frame = None;
    }

    fn begin(&mut self, size: Size<i32, Physical>) -> Result<(), RenderError> {
        if self.bound.is_none() {
            return Err(RenderError::NotBound);
        }
        self.frame = Some(size);
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) {
        let argb = to_argb(color);
        if let Some(target) = self.bound.and_then(|id| self.targets.get_mut(&id)) {
            target.pixels.fill(argb);
        }
    }

    fn end(&mut self) {
        if self.frame.take().is_some() {
            if let Some(target) = self.bound.and_then(|id| self.targets.get_mut(&id)) {
                target.age = 1;
            }
        }
    }

    fn read_pixels(
        &mut self,
        target: TargetId,
        format: PixelFormat,
        stride: usize,
        src: Rectangle<i32, Physical>,
        dst_loc: Point<i32, Physical>,
        dst: &mut [u8],
    ) -> bool {
        if self.fail_reads {
            return false;
        }
        let Some(target) = self.targets.get(&target) else {
            return false;
        };
        if src.loc.x < 0
            || src.loc.y < 0
            || dst_loc.x < 0
            || dst_loc.y < 0
            || src.loc.x + src.size.w > target.size.w
            || src.loc.y + src.size.h > target.size.h
        {
            return false;
        }

        let bpp = format.bytes_per_pixel();
        for j in 0..src.size.h {
            let row = (target.size.h - 1 - (src.loc.y + j)) as usize;
            let dst_row = (dst_loc.y + j) as usize;
            for i in 0..src.size.w {
                let pixel = target.pixels[row * target.size.w as usize + (src.loc.x + i) as usize];
                let offset = dst_row * stride + (dst_loc.x + i) as usize * bpp;
                let Some(out) = dst.get_mut(offset..offset + bpp) else {
                    return false;
                };
                format.write_pixel(pixel, out);
            }
        }
        true
    }

    fn buffer_age(&self, target: TargetId) -> i32 {
        self.targets.get(&target).map(|t| t.age).unwrap_or(-1)
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::{Physical, Size};
use tracing::trace;

use crate::{
    backend::render::{PixelFormat, RenderError, Renderer, TargetId},
    buffer::{Buffer, BufferRef},
};

#[derive(Debug)]
struct Image {
    buffer: Buffer,
    target: TargetId,
    /// 0 until the image was presented once.
    age: i32,
}

/// An image handed out for rendering. It stays locked while this (or a clone
/// of `buffer`) is alive.
#[derive(Debug)]
pub struct Acquired {
    pub index: usize,
    pub generation: u64,
    pub buffer: BufferRef,
    pub target: TargetId,
    pub age: i32,
}

/// Images the native surface renders into and hands to the host.
///
/// An image is free again once every lock on its buffer was dropped.
#[derive(Debug)]
pub struct Swapchain {
    size: Size<i32, Physical>,
    format: PixelFormat,
    capacity: usize,
    generation: u64,
    images: Vec<Image>,
}

impl Swapchain {
    pub fn new(size: Size<i32, Physical>, format: PixelFormat, capacity: usize) -> Swapchain {
        Swapchain {
            size,
            format,
            capacity: capacity.max(1),
            generation: 0,
            images: Vec::new(),
        }
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Returns a free image, allocating one if the chain is not full yet.
    /// `None` if every image is in use.
    pub fn acquire(&mut self, renderer: &mut dyn Renderer) -> Result<Option<Acquired>, RenderError> {
        let index = match self.images.iter().position(|image| !image.buffer.is_locked()) {
            Some(index) => index,
            None if self.images.len() < self.capacity => {
                let target = renderer.create_target(self.size, self.format)?;
                self.images.push(Image {
                    buffer: Buffer::new(self.size, self.format),
                    target,
                    age: 0,
                });
                trace!(images = self.images.len(), "Allocated swapchain image");
                self.images.len() - 1
            }
            None => return Ok(None),
        };

        let image = &self.images[index];
        Ok(Some(Acquired {
            index,
            generation: self.generation,
            buffer: image.buffer.lock(),
            target: image.target,
            age: image.age,
        }))
    }

    /// Ages every image after `index` was presented.
    pub fn mark_presented(&mut self, index: usize, generation: u64) {
        if generation != self.generation || index >= self.images.len() {
            return;
        }
        for (i, image) in self.images.iter_mut().enumerate() {
            if i == index {
                image.age = 1;
            } else if image.age > 0 {
                image.age += 1;
            }
        }
    }

    /// Ages every image after a buffer from outside the chain was presented.
    pub fn mark_other_presented(&mut self) {
        for image in self.images.iter_mut().filter(|image| image.age > 0) {
            image.age += 1;
        }
    }

    /// Drops all images and starts over at `size`. Images still locked
    /// elsewhere stay valid for their holders but are no longer handed out.
    pub fn resize(&mut self, size: Size<i32, Physical>, renderer: &mut dyn Renderer) {
        self.release_all(renderer);
        self.size = size;
    }

    pub fn release_all(&mut self, renderer: &mut dyn Renderer) {
        for image in self.images.drain(..) {
            renderer.destroy_target(image.target);
        }
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::render::MemoryRenderer;

    fn chain() -> Swapchain {
        Swapchain::new((16, 16).into(), PixelFormat::Argb8888, 3)
    }

    #[test]
    fn ages_follow_presentation_order() {
        let mut renderer = MemoryRenderer::new();
        let mut chain = chain();

        let a = chain.acquire(&mut renderer).unwrap().unwrap();
        let b = chain.acquire(&mut renderer).unwrap().unwrap();
        assert_eq!((a.age, b.age), (0, 0));
        assert_ne!(a.index, b.index);

        chain.mark_presented(a.index, a.generation);
        chain.mark_presented(b.index, b.generation);
        let a_index = a.index;
        drop(a);
        drop(b);

        let again = chain.acquire(&mut renderer).unwrap().unwrap();
        assert_eq!(again.index, a_index);
        assert_eq!(again.age, 2);
    }

    #[test]
    fn foreign_presents_age_images() {
        let mut renderer = MemoryRenderer::new();
        let mut chain = chain();

        let a = chain.acquire(&mut renderer).unwrap().unwrap();
        let b = chain.acquire(&mut renderer).unwrap().unwrap();
        chain.mark_presented(a.index, a.generation);
        chain.mark_other_presented();
        let a_index = a.index;
        drop(a);
        drop(b);

        let again = chain.acquire(&mut renderer).unwrap().unwrap();
        assert_eq!(again.index, a_index);
        assert_eq!(again.age, 2);
        let never = chain.acquire(&mut renderer).unwrap().unwrap();
        assert_eq!(never.age, 0);
    }

    #[test]
    fn full_chain_has_nothing_to_hand_out() {
        let mut renderer = MemoryRenderer::new();
        let mut chain = chain();
        let held: Vec<_> = (0..3)
            .map(|_| chain.acquire(&mut renderer).unwrap().unwrap())
            .collect();
        assert!(chain.acquire(&mut renderer).unwrap().is_none());
        assert_eq!(renderer.target_count(), 3);

        drop(held);
        assert!(chain.acquire(&mut renderer).unwrap().is_some());
    }

    #[test]
    fn resize_discards_images() {
        let mut renderer = MemoryRenderer::new();
        let mut chain = chain();
        let stale = chain.acquire(&mut renderer).unwrap().unwrap();

        chain.resize((32, 8).into(), &mut renderer);
        assert!(chain.is_empty());
        assert_eq!(renderer.target_count(), 0);

        // presenting an image of the old chain does not age the new one
        chain.mark_presented(stale.index, stale.generation);
        let fresh = chain.acquire(&mut renderer).unwrap().unwrap();
        assert_eq!(fresh.age, 0);
        assert_eq!(fresh.buffer.size(), (32, 8).into());
    }
}

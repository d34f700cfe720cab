// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::Cell,
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use smithay::utils::{Physical, Size};

use crate::{
    backend::render::PixelFormat,
    utils::signal::{ListenerId, Signal},
};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

struct BufferInner {
    id: BufferId,
    size: Size<i32, Physical>,
    format: PixelFormat,
    locks: Cell<usize>,
    released: Signal<BufferId>,
}

/// Handle to an image that can be presented.
///
/// The image is in use while at least one [`BufferRef`] lock is alive. Dropping
/// the last lock emits the `released` signal.
#[derive(Clone)]
pub struct Buffer(Rc<BufferInner>);

impl Buffer {
    pub fn new(size: Size<i32, Physical>, format: PixelFormat) -> Buffer {
        Buffer(Rc::new(BufferInner {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            size,
            format,
            locks: Cell::new(0),
            released: Signal::new(),
        }))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.0.size
    }

    pub fn format(&self) -> PixelFormat {
        self.0.format
    }

    pub fn is_locked(&self) -> bool {
        self.0.locks.get() > 0
    }

    pub fn lock_count(&self) -> usize {
        self.0.locks.get()
    }

    pub fn lock(&self) -> BufferRef {
        self.0.locks.set(self.0.locks.get() + 1);
        BufferRef {
            buffer: self.clone(),
        }
    }

    pub fn connect_released(&self, listener: impl FnMut(&BufferId) + 'static) -> ListenerId {
        self.0.released.connect(listener)
    }

    pub fn disconnect_released(&self, id: ListenerId) {
        self.0.released.disconnect(id);
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.0.id)
            .field("size", &self.0.size)
            .field("format", &self.0.format)
            .field("locks", &self.0.locks.get())
            .finish()
    }
}

/// A lock keeping a [`Buffer`] in use.
#[derive(Debug)]
pub struct BufferRef {
    buffer: Buffer,
}

impl BufferRef {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.buffer.size()
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        self.buffer.lock()
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        let inner = &self.buffer.0;
        let locks = inner.locks.get().saturating_sub(1);
        inner.locks.set(locks);
        if locks == 0 {
            inner.released.emit(&inner.id);
        }
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct SignalInner<T> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Listener<T>)>>,
}

/// Observer registry.
///
/// Clones share the same set of listeners. Emitting works on a snapshot, so
/// listeners may connect or disconnect (themselves or others) while being
/// notified. A listener that is already running is not re-entered.
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal {
            inner: Rc::new(SignalInner {
                next_id: Cell::new(0),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal::default()
    }

    pub fn connect(&self, listener: impl FnMut(&T) + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        let listener: Listener<T> = Rc::new(RefCell::new(listener));
        self.inner.listeners.borrow_mut().push((id, listener));
        id
    }

    /// Returns `false` if the listener was not connected.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let len = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != len
    }

    pub fn is_connected(&self, id: ListenerId) -> bool {
        self.inner
            .listeners
            .borrow()
            .iter()
            .any(|(lid, _)| *lid == id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    pub fn emit(&self, value: &T) {
        let snapshot = self.inner.listeners.borrow().clone();
        for (id, listener) in snapshot {
            // disconnected by an earlier listener of this emission
            if !self.is_connected(id) {
                continue;
            }
            match listener.try_borrow_mut() {
                Ok(mut listener) => (&mut *listener)(value),
                Err(_) => trace!(?id, "Skipping re-entrant signal listener"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_to_all_listeners() {
        let signal = Signal::<u32>::new();
        let sum = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let sum = sum.clone();
            signal.connect(move |v| sum.set(sum.get() + *v));
        }
        signal.emit(&2);
        assert_eq!(sum.get(), 6);
    }

    #[test]
    fn listener_can_disconnect_itself() {
        let signal = Signal::<()>::new();
        let calls = Rc::new(Cell::new(0));
        let id = Rc::new(Cell::new(None));

        let listener_id = {
            let signal = signal.clone();
            let calls = calls.clone();
            let id = id.clone();
            signal.clone().connect(move |_| {
                calls.set(calls.get() + 1);
                if let Some(id) = id.get() {
                    signal.disconnect(id);
                }
            })
        };
        id.set(Some(listener_id));

        signal.emit(&());
        signal.emit(&());
        assert_eq!(calls.get(), 1);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn reentrant_emit_skips_running_listener() {
        let signal = Signal::<u32>::new();
        let calls = Rc::new(Cell::new(0));
        {
            let inner = signal.clone();
            let calls = calls.clone();
            signal.connect(move |depth| {
                calls.set(calls.get() + 1);
                if *depth == 0 {
                    inner.emit(&1);
                }
            });
        }
        signal.emit(&0);
        assert_eq!(calls.get(), 1);
    }
}

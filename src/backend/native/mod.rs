// SPDX-License-Identifier: GPL-3.0-only

use std::{io, mem};

use cosmic_output_config::NativeConfig;
use smithay::utils::{Physical, Size};
use tracing::{debug, info, trace, warn};

use super::{
    render::{PixelFormat, SharedRenderer},
    BackendEvent, Capabilities, Frame, OutputBackend,
};
use crate::{
    buffer::{Buffer, BufferRef},
    output::{
        scheduler::DEFAULT_REFRESH, CurrentState, FrameStrategy, Mode, OutputError,
        PendingBuffer, PendingState, StateFields,
    },
    utils::geometry::Region,
};

mod swapchain;
pub use self::swapchain::{Acquired, Swapchain};

const FORMAT: PixelFormat = PixelFormat::Argb8888;

/// Notifications from the host compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The host changed the window geometry.
    Configure { size: Size<i32, Physical> },
    /// The image presented with `serial` reached the screen.
    Complete { serial: u64 },
    /// The host no longer reads the image in `slot`.
    Idle { slot: usize },
    Close,
}

/// A window of the host compositor we present into.
pub trait HostWindow {
    fn size(&self) -> Size<i32, Physical>;
    fn is_connected(&self) -> bool;
    /// Queues `buffer` for presentation. The host refers to it by `slot`
    /// until it reports it idle.
    fn present(
        &mut self,
        buffer: &Buffer,
        slot: usize,
        serial: u64,
        damage: &Region,
    ) -> io::Result<()>;
    fn poll_event(&mut self) -> Option<HostEvent>;
    fn destroy(&mut self) {}
}

#[derive(Debug)]
struct InFlight {
    // keeps the buffer locked until the host is done with it
    _buffer: BufferRef,
    serial: u64,
}

/// Output presenting into a window of another compositor.
pub struct NativeSurface {
    host: Box<dyn HostWindow>,
    renderer: SharedRenderer,
    size: Size<i32, Physical>,
    swapchain: Swapchain,
    slots: Vec<Option<InFlight>>,
    rendering: Option<Acquired>,
    next_serial: u64,
    exhausted: u32,
    stall_limit: u32,
}

impl NativeSurface {
    pub fn new(
        host: Box<dyn HostWindow>,
        renderer: SharedRenderer,
        config: &NativeConfig,
    ) -> Result<(NativeSurface, Mode), OutputError> {
        let size = host.size();
        if size.w <= 0 || size.h <= 0 {
            return Err(OutputError::InvalidMode(size.w, size.h));
        }
        let slots = config.in_flight_slots.max(1);
        info!(slots, "Native surface created, {}x{}", size.w, size.h);

        let surface = NativeSurface {
            host,
            renderer,
            size,
            swapchain: Swapchain::new(size, FORMAT, config.swapchain_len),
            slots: (0..slots).map(|_| None).collect(),
            rendering: None,
            next_serial: 1,
            exhausted: 0,
            stall_limit: config.stall_limit.max(1),
        };
        Ok((
            surface,
            Mode {
                size,
                refresh: DEFAULT_REFRESH,
            },
        ))
    }

    /// Slots currently held by the host.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    fn exhausted(&mut self) -> OutputError {
        self.exhausted += 1;
        if self.exhausted >= self.stall_limit {
            warn!(attempts = self.exhausted, "Host stopped releasing images");
            OutputError::HostStalled
        } else {
            OutputError::SlotsExhausted
        }
    }

    fn release_slot(&mut self, slot: usize) {
        match self.slots.get_mut(slot).and_then(Option::take) {
            Some(in_flight) => trace!(slot, serial = in_flight.serial, "Slot released"),
            None => warn!(slot, "Ignoring idle notification for unused slot"),
        }
    }
}

impl OutputBackend for NativeSurface {
    fn capabilities(&self) -> Capabilities {
        Capabilities::CUSTOM_MODES | Capabilities::CLIENT_BUFFERS
    }

    fn frame_strategy(&self) -> FrameStrategy {
        FrameStrategy::Completion
    }

    fn session_active(&self) -> bool {
        self.host.is_connected()
    }

    /// The geometry is decided by the host, only its current size is accepted.
    fn set_custom_mode(
        &mut self,
        size: Size<i32, Physical>,
        refresh: i32,
    ) -> Result<Mode, OutputError> {
        if size != self.size {
            return Err(OutputError::Rejected("mode must match the host window"));
        }
        Ok(Mode {
            size,
            refresh: if refresh > 0 { refresh } else { DEFAULT_REFRESH },
        })
    }

    fn attach_render(&mut self) -> Result<i32, OutputError> {
        if self.rendering.is_some() {
            return Err(OutputError::RenderPending);
        }
        let mut renderer = self.renderer.borrow_mut();
        let Some(acquired) = self
            .swapchain
            .acquire(&mut *renderer)
            .map_err(OutputError::RenderTarget)?
        else {
            drop(renderer);
            return Err(self.exhausted());
        };
        renderer.bind(acquired.target).map_err(OutputError::Render)?;
        let age = acquired.age;
        self.rendering = Some(acquired);
        Ok(age)
    }

    fn rollback_render(&mut self) {
        if self.rendering.take().is_some() {
            self.renderer.borrow_mut().unbind();
        }
    }

    fn test(&self, pending: &PendingState, _current: &CurrentState) -> Result<(), OutputError> {
        if let Some(mode) = pending
            .mode()
            .filter(|_| pending.committed().contains(StateFields::MODE))
        {
            if mode.size() != self.size {
                return Err(OutputError::Rejected("mode must match the host window"));
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        frame: Frame<'_>,
        _state: &CurrentState,
    ) -> Result<Option<u64>, OutputError> {
        let (buffer, image) = match frame.buffer {
            PendingBuffer::Render => {
                let acquired = self.rendering.take().ok_or(OutputError::NoRenderAttached)?;
                self.renderer.borrow_mut().unbind();
                (acquired.buffer, Some((acquired.index, acquired.generation)))
            }
            PendingBuffer::Client(buffer) => (buffer, None),
        };

        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            return Err(self.exhausted());
        };
        let serial = self.next_serial;
        self.host
            .present(buffer.buffer(), slot, serial, frame.damage)
            .map_err(OutputError::Present)?;

        self.next_serial += 1;
        self.exhausted = 0;
        match image {
            Some((index, generation)) => self.swapchain.mark_presented(index, generation),
            None => self.swapchain.mark_other_presented(),
        }
        self.slots[slot] = Some(InFlight {
            _buffer: buffer,
            serial,
        });
        trace!(slot, serial, "Image submitted to host");
        Ok(Some(serial))
    }

    fn poll_event(&mut self) -> Option<BackendEvent> {
        loop {
            match self.host.poll_event()? {
                HostEvent::Idle { slot } => self.release_slot(slot),
                HostEvent::Configure { size } => {
                    if size.w <= 0 || size.h <= 0 {
                        warn!(?size, "Ignoring invalid configure");
                        continue;
                    }
                    if size != self.size {
                        debug!("Host configured {}x{}", size.w, size.h);
                        self.size = size;
                        let mut renderer = self.renderer.borrow_mut();
                        self.swapchain.resize(size, &mut *renderer);
                    }
                    return Some(BackendEvent::Configure { size });
                }
                HostEvent::Complete { serial } => {
                    return Some(BackendEvent::Complete { sequence: serial });
                }
                HostEvent::Close => return Some(BackendEvent::Closed),
            }
        }
    }

    fn destroy(&mut self) {
        self.rollback_render();
        let released = mem::take(&mut self.slots).into_iter().flatten().count();
        debug!(released, "Releasing native surface");
        self.swapchain.release_all(&mut *self.renderer.borrow_mut());
        self.host.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        rc::Rc,
    };

    use cosmic_output_config::DamageConfig;

    use super::*;
    use crate::{
        backend::render::MemoryRenderer,
        buffer::BufferId,
        output::{DamageTracker, Output, OutputEvent},
        utils::geometry::rect,
    };

    #[derive(Default)]
    struct HostState {
        size: Size<i32, Physical>,
        connected: bool,
        presented: Vec<(BufferId, usize, u64)>,
        events: VecDeque<HostEvent>,
        destroyed: bool,
    }

    #[derive(Clone)]
    struct RecordingHost(Rc<RefCell<HostState>>);

    impl RecordingHost {
        fn new(w: i32, h: i32) -> RecordingHost {
            RecordingHost(Rc::new(RefCell::new(HostState {
                size: (w, h).into(),
                connected: true,
                ..Default::default()
            })))
        }

        fn push(&self, event: HostEvent) {
            self.0.borrow_mut().events.push_back(event);
        }

        fn presented(&self) -> usize {
            self.0.borrow().presented.len()
        }
    }

    impl HostWindow for RecordingHost {
        fn size(&self) -> Size<i32, Physical> {
            self.0.borrow().size
        }

        fn is_connected(&self) -> bool {
            self.0.borrow().connected
        }

        fn present(
            &mut self,
            buffer: &Buffer,
            slot: usize,
            serial: u64,
            _damage: &Region,
        ) -> io::Result<()> {
            self.0
                .borrow_mut()
                .presented
                .push((buffer.id(), slot, serial));
            Ok(())
        }

        fn poll_event(&mut self) -> Option<HostEvent> {
            self.0.borrow_mut().events.pop_front()
        }

        fn destroy(&mut self) {
            self.0.borrow_mut().destroyed = true;
        }
    }

    fn setup(config: NativeConfig) -> (Output<NativeSurface>, RecordingHost) {
        let host = RecordingHost::new(320, 200);
        let renderer = MemoryRenderer::new().into_shared();
        let (surface, mode) = NativeSurface::new(Box::new(host.clone()), renderer, &config).unwrap();
        let mut output = Output::new("NATIVE-1", surface, mode);
        output.set_enabled(true).unwrap();
        (output, host)
    }

    fn client_buffer() -> Buffer {
        Buffer::new((320, 200).into(), PixelFormat::Argb8888)
    }

    fn present_client(output: &mut Output<NativeSurface>, buffer: &Buffer) -> Result<(), OutputError> {
        output.pending_mut().attach_buffer(buffer.lock());
        output.commit()
    }

    #[test]
    fn exhausted_ring_rejects_commit() {
        let (mut output, host) = setup(NativeConfig::default());
        let buffers: Vec<_> = (0..9).map(|_| client_buffer()).collect();

        for buffer in &buffers[..8] {
            present_client(&mut output, buffer).unwrap();
        }
        assert!(matches!(
            present_client(&mut output, &buffers[8]),
            Err(OutputError::SlotsExhausted)
        ));
        assert!(!output.is_destroyed());
        assert_eq!(output.backend().in_flight(), 8);
        assert_eq!(host.presented(), 8);
        assert!(!buffers[8].is_locked());
        assert!(buffers[..8].iter().all(Buffer::is_locked));

        host.push(HostEvent::Idle { slot: 3 });
        output.dispatch_backend_events();
        assert!(!buffers[3].is_locked());
        present_client(&mut output, &buffers[8]).unwrap();
        assert_eq!(host.0.borrow().presented[8], (buffers[8].id(), 3, 9));
    }

    #[test]
    fn persistent_exhaustion_is_fatal() {
        let (mut output, host) = setup(NativeConfig {
            in_flight_slots: 2,
            stall_limit: 3,
            ..Default::default()
        });
        let buffer = client_buffer();
        present_client(&mut output, &buffer).unwrap();
        present_client(&mut output, &buffer).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                present_client(&mut output, &buffer),
                Err(OutputError::SlotsExhausted)
            ));
        }
        assert!(matches!(
            present_client(&mut output, &buffer),
            Err(OutputError::HostStalled)
        ));
        assert!(output.is_destroyed());
        assert!(host.0.borrow().destroyed);
        assert!(!buffer.is_locked());
    }

    #[test]
    fn idle_notification_releases_buffer() {
        let (mut output, host) = setup(NativeConfig::default());
        let buffer = client_buffer();
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();
        buffer.connect_released(move |_| counter.set(counter.get() + 1));

        present_client(&mut output, &buffer).unwrap();
        assert_eq!(released.get(), 0);

        host.push(HostEvent::Idle { slot: 0 });
        host.push(HostEvent::Idle { slot: 0 });
        output.dispatch_backend_events();
        assert_eq!(released.get(), 1);
        assert_eq!(output.backend().in_flight(), 0);
    }

    #[test]
    fn rendered_images_report_real_ages() {
        let (mut output, host) = setup(NativeConfig::default());

        assert_eq!(output.attach_for_render().unwrap(), 0);
        output.commit().unwrap();
        assert_eq!(output.attach_for_render().unwrap(), 0);
        output.commit().unwrap();

        host.push(HostEvent::Idle { slot: 0 });
        host.push(HostEvent::Idle { slot: 1 });
        output.dispatch_backend_events();

        // the first image was presented two frames ago
        assert_eq!(output.attach_for_render().unwrap(), 2);
        output.rollback_render();
        assert_eq!(output.backend().swapchain().len(), 2);
    }

    #[test]
    fn client_frames_age_rendered_images() {
        let (mut output, host) = setup(NativeConfig::default());
        let mut tracker = DamageTracker::new(&output, &DamageConfig::default());
        tracker.set_force_full(false);

        let frame = tracker.record_frame_start(&mut output).unwrap();
        output.pending_mut().set_damage(frame.damage);
        output.commit().unwrap();
        tracker.commit_frame();

        let client = rect(100, 100, 10, 10);
        tracker.add_rect(client);
        let buffer = client_buffer();
        output.pending_mut().attach_buffer(buffer.lock());
        output.pending_mut().set_damage(Region::from_rect(client));
        output.commit().unwrap();
        tracker.commit_frame();

        host.push(HostEvent::Idle { slot: 0 });
        host.push(HostEvent::Idle { slot: 1 });
        output.dispatch_backend_events();

        tracker.add_rect(rect(0, 0, 5, 5));
        let frame = tracker.record_frame_start(&mut output).unwrap();
        assert_eq!(frame.age, 2);
        assert!(frame.damage.covers(&client));
        assert!(frame.damage.covers(&rect(0, 0, 5, 5)));
        output.rollback_render();
    }

    #[test]
    fn completions_raise_one_frame_per_sequence() {
        let (mut output, host) = setup(NativeConfig::default());
        let frames = Rc::new(Cell::new(0));
        let counter = frames.clone();
        output
            .scheduler()
            .connect_frame(move |_| counter.set(counter.get() + 1));
        let presents = Rc::new(RefCell::new(Vec::new()));
        let sink = presents.clone();
        output.events().connect(move |event| {
            if let OutputEvent::Present { sequence } = event {
                sink.borrow_mut().push(*sequence);
            }
        });

        output.attach_for_render().unwrap();
        output.commit().unwrap();
        host.push(HostEvent::Complete { serial: 1 });
        host.push(HostEvent::Complete { serial: 1 });
        output.dispatch_backend_events();

        assert_eq!(frames.get(), 1);
        assert_eq!(*presents.borrow(), vec![Some(1)]);
    }

    #[test]
    fn configure_resizes_swapchain() {
        let (mut output, host) = setup(NativeConfig::default());
        output.attach_for_render().unwrap();
        output.commit().unwrap();

        host.0.borrow_mut().size = (800, 600).into();
        host.push(HostEvent::Configure {
            size: (800, 600).into(),
        });
        output.dispatch_backend_events();
        assert_eq!(output.current().buffer_size(), (800, 600).into());
        assert!(output.backend().swapchain().is_empty());

        assert_eq!(output.attach_for_render().unwrap(), 0);
        assert_eq!(output.backend().swapchain().size(), (800, 600).into());
        output.rollback_render();
    }

    #[test]
    fn mode_must_match_host() {
        let (mut output, _host) = setup(NativeConfig::default());
        assert!(matches!(
            output.set_custom_mode(1024, 768, 0),
            Err(OutputError::Rejected(_))
        ));
        assert!(!output.is_destroyed());
        output.set_custom_mode(320, 200, 75_000).unwrap();
        assert_eq!(output.current().refresh(), 75_000);
    }

    #[test]
    fn cannot_be_disabled() {
        let (mut output, _host) = setup(NativeConfig::default());
        assert!(matches!(
            output.set_enabled(false),
            Err(OutputError::CannotDisable)
        ));
        assert!(output.current().enabled);
    }

    #[test]
    fn close_destroys_output() {
        let (mut output, host) = setup(NativeConfig::default());
        host.push(HostEvent::Close);
        output.dispatch_backend_events();
        assert!(output.is_destroyed());
        assert!(host.0.borrow().destroyed);
    }
}

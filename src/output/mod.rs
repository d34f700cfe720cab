// SPDX-License-Identifier: GPL-3.0-only

use std::{mem, time::Duration};

use bitflags::bitflags;
use smithay::utils::{Clock, Monotonic, Physical, Size, Transform};
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::{BackendEvent, Capabilities, Frame, OutputBackend},
    buffer::BufferRef,
    utils::{
        geometry::{bounds, Region},
        signal::Signal,
    },
};

pub mod damage;
mod error;
pub mod scheduler;

pub use self::{
    damage::{DamageTracker, FrameDamage},
    error::{ErrorKind, OutputError},
    scheduler::{FrameNeeded, FrameScheduler, FrameStrategy},
};

bitflags! {
    /// Fields set in a [`PendingState`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateFields: u32 {
        const ENABLED = 1 << 0;
        const MODE = 1 << 1;
        const BUFFER = 1 << 2;
        const DAMAGE = 1 << 3;
        const TRANSFORM = 1 << 4;
        const SCALE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub size: Size<i32, Physical>,
    /// mHz
    pub refresh: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMode {
    /// One of the modes advertised by the output.
    Fixed(Mode),
    Custom {
        size: Size<i32, Physical>,
        refresh: i32,
    },
}

impl PendingMode {
    pub fn size(&self) -> Size<i32, Physical> {
        match self {
            PendingMode::Fixed(mode) => mode.size,
            PendingMode::Custom { size, .. } => *size,
        }
    }

    pub fn refresh(&self) -> i32 {
        match self {
            PendingMode::Fixed(mode) => mode.refresh,
            PendingMode::Custom { refresh, .. } => *refresh,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentState {
    pub enabled: bool,
    pub mode: Option<Mode>,
    pub transform: Transform,
    pub scale: f64,
}

impl CurrentState {
    /// Size of the buffers presented on the output.
    pub fn buffer_size(&self) -> Size<i32, Physical> {
        self.mode
            .map(|mode| mode.size)
            .unwrap_or_else(|| (0, 0).into())
    }

    pub fn refresh(&self) -> i32 {
        self.mode.map(|mode| mode.refresh).unwrap_or(0)
    }

    /// Size of the output after applying its transform.
    pub fn transformed_size(&self) -> Size<i32, Physical> {
        self.transform.transform_size(self.buffer_size())
    }
}

#[derive(Debug)]
pub enum PendingBuffer {
    /// The frame rendered after [`Output::attach_for_render`].
    Render,
    /// A client provided buffer, presented directly.
    Client(BufferRef),
}

/// Changes to apply atomically on the next commit.
#[derive(Debug)]
pub struct PendingState {
    committed: StateFields,
    enabled: bool,
    mode: Option<PendingMode>,
    transform: Transform,
    scale: f64,
    buffer: Option<PendingBuffer>,
    damage: Option<Region>,
}

impl Default for PendingState {
    fn default() -> Self {
        PendingState {
            committed: StateFields::empty(),
            enabled: false,
            mode: None,
            transform: Transform::Normal,
            scale: 1.0,
            buffer: None,
            damage: None,
        }
    }
}

impl PendingState {
    pub fn committed(&self) -> StateFields {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> Option<&PendingMode> {
        self.mode.as_ref()
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn buffer(&self) -> Option<&PendingBuffer> {
        self.buffer.as_ref()
    }

    pub fn damage(&self) -> Option<&Region> {
        self.damage.as_ref()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.committed |= StateFields::ENABLED;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = Some(PendingMode::Fixed(mode));
        self.committed |= StateFields::MODE;
    }

    pub fn set_custom_mode(&mut self, size: Size<i32, Physical>, refresh: i32) {
        self.mode = Some(PendingMode::Custom { size, refresh });
        self.committed |= StateFields::MODE;
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.committed |= StateFields::TRANSFORM;
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
        self.committed |= StateFields::SCALE;
    }

    /// Replaces any previously attached buffer. Dropping the state releases it.
    pub fn attach_buffer(&mut self, buffer: BufferRef) {
        self.buffer = Some(PendingBuffer::Client(buffer));
        self.committed |= StateFields::BUFFER;
    }

    /// Damage in buffer coordinates. Without it the whole output is presented.
    pub fn set_damage(&mut self, damage: Region) {
        self.damage = Some(damage);
        self.committed |= StateFields::DAMAGE;
    }

    fn uses_render(&self) -> bool {
        matches!(self.buffer, Some(PendingBuffer::Render))
    }

    fn clear_render(&mut self) {
        if self.uses_render() {
            self.buffer = None;
            self.committed.remove(StateFields::BUFFER);
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// A commit was applied. `size` is the buffer size afterwards.
    Commit {
        committed: StateFields,
        size: Size<i32, Physical>,
    },
    /// The output size changed outside of a commit.
    Mode { size: Size<i32, Physical> },
    /// A frame reached the screen.
    Present { sequence: Option<u64> },
    Destroy,
}

/// A display output with double-buffered state.
///
/// Changes are staged in [`Output::pending_mut`] and applied all at once by
/// [`Output::commit`], which either applies everything or nothing.
pub struct Output<B: OutputBackend> {
    name: String,
    backend: B,
    current: CurrentState,
    pending: PendingState,
    render_attached: bool,
    needs_frame: bool,
    scheduler: FrameScheduler,
    clock: Clock<Monotonic>,
    events: Signal<OutputEvent>,
    destroying: bool,
}

impl<B: OutputBackend> Output<B> {
    /// Outputs start disabled, with `mode` as their current mode.
    pub fn new(name: impl Into<String>, mut backend: B, mode: Mode) -> Output<B> {
        let name = name.into();
        let scheduler = FrameScheduler::new(&name, backend.frame_strategy(), mode.refresh);
        backend.bind_scheduler(&scheduler);
        info!(
            output = %name,
            "New output {}x{}@{}mHz",
            mode.size.w,
            mode.size.h,
            mode.refresh
        );

        Output {
            name,
            backend,
            current: CurrentState {
                enabled: false,
                mode: Some(mode),
                transform: Transform::Normal,
                scale: 1.0,
            },
            pending: PendingState::default(),
            render_attached: false,
            needs_frame: true,
            scheduler,
            clock: Clock::new(),
            events: Signal::new(),
            destroying: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn current(&self) -> &CurrentState {
        &self.current
    }

    pub fn pending(&self) -> &PendingState {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingState {
        &mut self.pending
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &Signal<OutputEvent> {
        &self.events
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroying
    }

    pub fn is_render_attached(&self) -> bool {
        self.render_attached
    }

    /// Whether a frame has to be drawn even without new damage.
    pub fn needs_frame(&self) -> bool {
        self.needs_frame
    }

    /// Forces the next frame to be drawn and schedules it.
    pub fn request_frame(&mut self) {
        self.needs_frame = true;
        self.scheduler.schedule_frame();
    }

    fn now(&self) -> Duration {
        self.clock.now().into()
    }

    /// Checks whether `pending` would be accepted, without side effects.
    pub fn test_state(&self, pending: &PendingState) -> Result<(), OutputError> {
        if self.destroying {
            return Err(OutputError::Destroyed);
        }

        let caps = self.backend.capabilities();
        let committed = pending.committed;
        let enabled = if committed.contains(StateFields::ENABLED) {
            pending.enabled
        } else {
            self.current.enabled
        };

        if committed.contains(StateFields::ENABLED)
            && !pending.enabled
            && !caps.contains(Capabilities::DISABLE)
        {
            return Err(OutputError::CannotDisable);
        }

        if committed.contains(StateFields::MODE) {
            let Some(mode) = pending.mode.as_ref() else {
                return Err(OutputError::InvalidMode(0, 0));
            };
            match mode {
                PendingMode::Fixed(_) if !caps.contains(Capabilities::FIXED_MODES) => {
                    return Err(OutputError::FixedModeUnsupported);
                }
                PendingMode::Custom { .. } if !caps.contains(Capabilities::CUSTOM_MODES) => {
                    return Err(OutputError::CustomModeUnsupported);
                }
                _ => {}
            }
            let size = mode.size();
            if size.w <= 0 || size.h <= 0 {
                return Err(OutputError::InvalidMode(size.w, size.h));
            }
            // the render target still has the old size
            if committed.contains(StateFields::BUFFER)
                && matches!(pending.buffer, Some(PendingBuffer::Render))
            {
                return Err(OutputError::ModeWithBuffer);
            }
        }

        if committed.contains(StateFields::SCALE)
            && !(pending.scale.is_finite() && pending.scale > 0.0)
        {
            return Err(OutputError::InvalidScale(pending.scale));
        }

        if committed.contains(StateFields::BUFFER) {
            if !enabled || !self.current.enabled {
                return Err(OutputError::Disabled);
            }
            match &pending.buffer {
                Some(PendingBuffer::Render) => {
                    if !self.render_attached {
                        return Err(OutputError::NoRenderAttached);
                    }
                }
                Some(PendingBuffer::Client(buffer)) => {
                    if !caps.contains(Capabilities::CLIENT_BUFFERS) {
                        return Err(OutputError::ClientBuffersUnsupported);
                    }
                    let size = match pending.mode.as_ref() {
                        Some(mode) if committed.contains(StateFields::MODE) => mode.size(),
                        _ => self.current.buffer_size(),
                    };
                    if buffer.size() != size {
                        return Err(OutputError::BufferSizeMismatch(buffer.size()));
                    }
                }
                None => return Err(OutputError::NoRenderAttached),
            }
        }

        self.backend.test(pending, &self.current)
    }

    /// Tests the staged state.
    pub fn test(&self) -> Result<(), OutputError> {
        self.test_state(&self.pending)
    }

    /// Applies the staged state. The staged state is consumed either way.
    pub fn commit(&mut self) -> Result<(), OutputError> {
        let pending = mem::take(&mut self.pending);
        self.commit_state(pending)
    }

    pub fn commit_state(&mut self, pending: PendingState) -> Result<(), OutputError> {
        let uses_render = pending.uses_render();
        let result = self.apply(pending);

        if uses_render && mem::replace(&mut self.render_attached, false) && result.is_err() {
            self.backend.rollback_render();
        }

        if let Err(err) = &result {
            self.handle_error(err);
        }
        result
    }

    fn handle_error(&mut self, err: &OutputError) {
        match err.kind() {
            ErrorKind::Fatal => {
                error!(output = %self.name, ?err, "Output failed");
                self.destroy();
            }
            ErrorKind::Transient => {
                debug!(output = %self.name, ?err, "Dropped frame");
                self.scheduler.frame_dropped(self.now());
            }
            ErrorKind::Contract => {
                warn!(output = %self.name, ?err, "Rejected output state");
            }
        }
    }

    fn apply(&mut self, pending: PendingState) -> Result<(), OutputError> {
        self.test_state(&pending)?;
        if !self.backend.session_active() {
            return Err(OutputError::SessionInactive);
        }

        let PendingState {
            committed,
            enabled,
            mode,
            transform,
            scale,
            buffer,
            damage,
        } = pending;
        let mut next = self.current.clone();

        if committed.contains(StateFields::ENABLED) && enabled != self.current.enabled {
            self.backend.set_enabled(enabled)?;
            info!(output = %self.name, enabled, "Output enable state changed");
            next.enabled = enabled;
        }

        if let Some(mode) = mode.filter(|_| committed.contains(StateFields::MODE)) {
            let mode = self
                .backend
                .set_custom_mode(mode.size(), mode.refresh())
                .map_err(|err| OutputError::ModeFailed(Box::new(err)))?;
            info!(
                output = %self.name,
                "Mode set to {}x{}@{}mHz",
                mode.size.w,
                mode.size.h,
                mode.refresh
            );
            self.scheduler.set_refresh(mode.refresh);
            next.mode = Some(mode);
        }

        if committed.contains(StateFields::TRANSFORM) {
            next.transform = transform;
        }
        if committed.contains(StateFields::SCALE) {
            next.scale = scale;
        }

        let mut presented = None;
        if let Some(buffer) = buffer.filter(|_| committed.contains(StateFields::BUFFER)) {
            let whole = bounds(next.buffer_size());
            let damage = match damage {
                Some(damage) => damage.intersect_rect(&whole),
                None => Region::from_rect(whole),
            };
            let sequence = self.backend.commit(
                Frame {
                    buffer,
                    damage: &damage,
                },
                &next,
            )?;
            trace!(output = %self.name, ?sequence, rects = damage.len(), "Frame presented");
            presented = Some(sequence);
        }

        self.current = next;
        if presented.is_some() {
            self.needs_frame = false;
            self.scheduler.frame_submitted(self.now());
        } else if committed.intersects(StateFields::ENABLED | StateFields::MODE)
            && self.current.enabled
        {
            self.request_frame();
        }

        self.events.emit(&OutputEvent::Commit {
            committed,
            size: self.current.buffer_size(),
        });
        // a pending sequence is reported through `BackendEvent::Complete`
        if let Some(None) = presented {
            self.events.emit(&OutputEvent::Present { sequence: None });
        }
        Ok(())
    }

    /// Binds the output's next image for rendering and stages it for commit.
    ///
    /// Returns the buffer age: how many frames ago the image was last
    /// presented, 0 if its contents are undefined.
    pub fn attach_for_render(&mut self) -> Result<i32, OutputError> {
        if self.destroying {
            return Err(OutputError::Destroyed);
        }
        if self.render_attached {
            return Err(OutputError::RenderPending);
        }
        if !self.current.enabled {
            return Err(OutputError::Disabled);
        }
        if !self.backend.session_active() {
            return Err(OutputError::SessionInactive);
        }

        let age = match self.backend.attach_render() {
            Ok(age) => age,
            Err(err) => {
                self.handle_error(&err);
                return Err(err);
            }
        };
        self.render_attached = true;
        self.pending.buffer = Some(PendingBuffer::Render);
        self.pending.committed |= StateFields::BUFFER;
        trace!(output = %self.name, age, "Attached for rendering");
        Ok(age)
    }

    /// Releases an attached render binding without presenting it.
    pub fn rollback_render(&mut self) {
        if !mem::replace(&mut self.render_attached, false) {
            return;
        }
        self.backend.rollback_render();
        self.pending.clear_render();
    }

    /// Convenience for committing only a custom mode change.
    pub fn set_custom_mode(&mut self, width: i32, height: i32, refresh: i32) -> Result<(), OutputError> {
        if self.render_attached {
            return Err(OutputError::RenderPending);
        }
        let mut pending = PendingState::default();
        pending.set_custom_mode((width, height).into(), refresh);
        self.commit_state(pending)
    }

    /// Convenience for committing only an enable state change.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), OutputError> {
        let mut pending = PendingState::default();
        pending.set_enabled(enabled);
        self.commit_state(pending)
    }

    /// Processes events queued by the backend. Returns how many were handled.
    pub fn dispatch_backend_events(&mut self) -> usize {
        let mut handled = 0;
        while !self.destroying {
            let Some(event) = self.backend.poll_event() else {
                break;
            };
            handled += 1;
            match event {
                BackendEvent::Configure { size } => {
                    let mode = Mode {
                        size,
                        refresh: self.current.refresh(),
                    };
                    if self.current.mode != Some(mode) {
                        info!(output = %self.name, "Host resized output to {}x{}", size.w, size.h);
                        self.current.mode = Some(mode);
                        self.events.emit(&OutputEvent::Mode { size });
                    }
                    self.request_frame();
                }
                BackendEvent::Complete { sequence } => {
                    if self.scheduler.on_completion(Some(sequence)) {
                        self.events.emit(&OutputEvent::Present {
                            sequence: Some(sequence),
                        });
                    }
                }
                BackendEvent::Closed => {
                    info!(output = %self.name, "Output closed by host");
                    self.destroy();
                }
            }
        }
        handled
    }

    /// Tears the output down. Listeners see [`OutputEvent::Destroy`] first.
    pub fn destroy(&mut self) {
        if mem::replace(&mut self.destroying, true) {
            return;
        }
        info!(output = %self.name, "Destroying output");
        self.events.emit(&OutputEvent::Destroy);
        if mem::replace(&mut self.render_attached, false) {
            self.backend.rollback_render();
        }
        self.pending = PendingState::default();
        self.scheduler.cancel();
        self.backend.destroy();
    }
}

impl<B: OutputBackend> Drop for Output<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

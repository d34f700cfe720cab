// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, rc::Rc};

use anyhow::{Context, Result};
use bitflags::bitflags;
use cosmic_output_config::{output::comp::OutputConfig, BackendConfig};
use indexmap::IndexMap;
use smithay::utils::{Physical, Size};
use tracing::{debug, info, warn};

use crate::{
    config::pending_from_config,
    output::{
        CurrentState, FrameScheduler, FrameStrategy, Mode, Output, OutputError, PendingBuffer,
        PendingState,
    },
    session::DeviceSession,
    utils::geometry::Region,
};

pub mod fbdev;
pub mod native;
pub mod remote;
pub mod render;

use self::{
    fbdev::FbdevOutput,
    native::{HostWindow, NativeSurface},
    remote::{FrameEncoder, RawEncoder, RemoteOutput, RemotePeer},
    render::SharedRenderer,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// The output may be disabled while it exists.
        const DISABLE = 1 << 0;
        /// The output advertises a list of fixed modes.
        const FIXED_MODES = 1 << 1;
        /// Arbitrary modes may be requested.
        const CUSTOM_MODES = 1 << 2;
        /// Client buffers can be presented without rendering.
        const CLIENT_BUFFERS = 1 << 3;
    }
}

/// What gets presented by a commit.
#[derive(Debug)]
pub struct Frame<'a> {
    pub buffer: PendingBuffer,
    /// Clipped to the output, in buffer coordinates.
    pub damage: &'a Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The host changed the output size.
    Configure { size: Size<i32, Physical> },
    /// A presented frame is done.
    Complete { sequence: u64 },
    /// The output is gone.
    Closed,
}

/// Presentation mechanism behind an [`Output`].
///
/// [`Output`] validates requests before handing them over, so implementations
/// only deal with what is specific to their mechanism.
pub trait OutputBackend {
    fn capabilities(&self) -> Capabilities;
    fn frame_strategy(&self) -> FrameStrategy;
    /// Called once, with the scheduler pacing this output.
    fn bind_scheduler(&mut self, _scheduler: &FrameScheduler) {}
    fn session_active(&self) -> bool;

    fn set_enabled(&mut self, _enabled: bool) -> Result<(), OutputError> {
        Ok(())
    }
    /// Applies a mode. Failing leaves the output unusable.
    fn set_custom_mode(
        &mut self,
        size: Size<i32, Physical>,
        refresh: i32,
    ) -> Result<Mode, OutputError>;

    /// Binds the next image for rendering and returns its age.
    fn attach_render(&mut self) -> Result<i32, OutputError>;
    fn rollback_render(&mut self);

    fn test(&self, _pending: &PendingState, _current: &CurrentState) -> Result<(), OutputError> {
        Ok(())
    }
    /// Presents `frame`. Returns the sequence to wait for if completion is
    /// reported later through [`BackendEvent::Complete`].
    fn commit(
        &mut self,
        frame: Frame<'_>,
        state: &CurrentState,
    ) -> Result<Option<u64>, OutputError>;

    fn poll_event(&mut self) -> Option<BackendEvent> {
        None
    }
    fn destroy(&mut self);
}

impl<T: OutputBackend + ?Sized> OutputBackend for Box<T> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
    fn frame_strategy(&self) -> FrameStrategy {
        (**self).frame_strategy()
    }
    fn bind_scheduler(&mut self, scheduler: &FrameScheduler) {
        (**self).bind_scheduler(scheduler)
    }
    fn session_active(&self) -> bool {
        (**self).session_active()
    }
    fn set_enabled(&mut self, enabled: bool) -> Result<(), OutputError> {
        (**self).set_enabled(enabled)
    }
    fn set_custom_mode(
        &mut self,
        size: Size<i32, Physical>,
        refresh: i32,
    ) -> Result<Mode, OutputError> {
        (**self).set_custom_mode(size, refresh)
    }
    fn attach_render(&mut self) -> Result<i32, OutputError> {
        (**self).attach_render()
    }
    fn rollback_render(&mut self) {
        (**self).rollback_render()
    }
    fn test(&self, pending: &PendingState, current: &CurrentState) -> Result<(), OutputError> {
        (**self).test(pending, current)
    }
    fn commit(
        &mut self,
        frame: Frame<'_>,
        state: &CurrentState,
    ) -> Result<Option<u64>, OutputError> {
        (**self).commit(frame, state)
    }
    fn poll_event(&mut self) -> Option<BackendEvent> {
        (**self).poll_event()
    }
    fn destroy(&mut self) {
        (**self).destroy()
    }
}

pub type AnyOutput = Output<Box<dyn OutputBackend>>;

/// Where a new output presents its frames.
pub enum OutputSource {
    Framebuffer {
        session: Rc<dyn DeviceSession>,
        /// Defaults to the configured device.
        path: Option<PathBuf>,
    },
    Remote {
        peer: Box<dyn RemotePeer>,
        /// Defaults to [`RawEncoder`].
        encoder: Option<Box<dyn FrameEncoder>>,
    },
    Native {
        host: Box<dyn HostWindow>,
    },
}

pub fn init_output(
    name: &str,
    source: OutputSource,
    renderer: SharedRenderer,
    config: &BackendConfig,
) -> Result<AnyOutput> {
    let (backend, mode): (Box<dyn OutputBackend>, Mode) = match source {
        OutputSource::Framebuffer { session, path } => {
            let path = path.unwrap_or_else(|| PathBuf::from(&config.framebuffer.path));
            let (fbdev, mode) = FbdevOutput::open(&session, &path, renderer, &config.framebuffer)
                .with_context(|| format!("Failed to initialize framebuffer {}", path.display()))?;
            (Box::new(fbdev), mode)
        }
        OutputSource::Remote { peer, encoder } => {
            let encoder = encoder
                .unwrap_or_else(|| Box::new(RawEncoder::default()) as Box<dyn FrameEncoder>);
            let (remote, mode) = RemoteOutput::new(peer, encoder, renderer, &config.remote)
                .context("Failed to initialize remote output")?;
            (Box::new(remote), mode)
        }
        OutputSource::Native { host } => {
            let (native, mode) = NativeSurface::new(host, renderer, &config.native)
                .context("Failed to initialize native surface")?;
            (Box::new(native), mode)
        }
    };
    Ok(Output::new(name, backend, mode))
}

/// All outputs of the compositor, by name.
#[derive(Default)]
pub struct Outputs {
    outputs: IndexMap<String, AnyOutput>,
}

impl Outputs {
    pub fn new() -> Outputs {
        Outputs::default()
    }

    /// Adds an output, replacing (and destroying) one with the same name.
    pub fn add(&mut self, output: AnyOutput) {
        let name = output.name().to_string();
        if let Some(mut previous) = self.outputs.insert(name.clone(), output) {
            warn!(output = %name, "Replacing existing output");
            previous.destroy();
        }
    }

    pub fn get(&self, name: &str) -> Option<&AnyOutput> {
        self.outputs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AnyOutput> {
        self.outputs.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<AnyOutput> {
        self.outputs.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnyOutput> {
        self.outputs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AnyOutput> {
        self.outputs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Handles queued backend events and drops destroyed outputs.
    /// Returns the names of the dropped outputs.
    pub fn dispatch_events(&mut self) -> Vec<String> {
        for output in self.outputs.values_mut() {
            output.dispatch_backend_events();
        }
        self.cleanup()
    }

    pub fn cleanup(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        self.outputs.retain(|name, output| {
            if output.is_destroyed() {
                removed.push(name.clone());
                false
            } else {
                true
            }
        });
        for name in &removed {
            debug!(output = %name, "Removed destroyed output");
        }
        removed
    }

    pub fn pause_session(&mut self) {
        info!("Session paused");
        for output in self.outputs.values_mut() {
            output.rollback_render();
            output.scheduler().cancel();
        }
    }

    pub fn resume_session(&mut self) {
        info!("Session resumed");
        for output in self.outputs.values_mut() {
            if output.current().enabled {
                output.request_frame();
            }
        }
    }

    /// Applies `config` to the output called `name`. With `test_only` the
    /// configuration is only checked.
    pub fn apply_config(&mut self, name: &str, config: &OutputConfig, test_only: bool) -> Result<()> {
        let output = self
            .outputs
            .get_mut(name)
            .with_context(|| format!("Unknown output {}", name))?;
        let pending = pending_from_config(config, output.current());
        output
            .test_state(&pending)
            .with_context(|| format!("Configuration rejected by {}", name))?;
        if !test_only {
            output
                .commit_state(pending)
                .with_context(|| format!("Failed to apply configuration to {}", name))?;
        }
        Ok(())
    }

    /// Applies every configured output that exists, logging failures.
    pub fn apply_all(&mut self, config: &BackendConfig) {
        let names: Vec<String> = self.outputs.keys().cloned().collect();
        for name in names {
            if let Some(output_config) = config.outputs.get(&name) {
                if let Err(err) = self.apply_config(&name, output_config, false) {
                    warn!(output = %name, ?err, "Failed to apply output configuration");
                }
            }
        }
        self.cleanup();
    }
}

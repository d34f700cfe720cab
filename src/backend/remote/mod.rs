// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
};

use cosmic_output_config::RemoteConfig;
use smithay::utils::{Physical, Size};
use tracing::{debug, info, trace};

use super::{
    render::{copy_damage_flipped, PixelFormat, SharedRenderer, TargetId},
    Capabilities, Frame, OutputBackend,
};
use crate::output::{
    CurrentState, FrameScheduler, FrameStrategy, Mode, OutputError, PendingBuffer,
};

mod encoder;
pub use self::encoder::{EncodeError, FrameEncoder, RawEncoder};

const FORMAT: PixelFormat = PixelFormat::Xrgb8888;

/// The remote viewer frames are streamed to.
pub trait RemotePeer {
    fn is_connected(&self) -> bool;
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// Top-down copy of the output contents the encoder reads from.
#[derive(Debug, Clone)]
pub struct ShadowImage {
    size: Size<i32, Physical>,
    format: PixelFormat,
    stride: usize,
    data: Vec<u8>,
}

impl ShadowImage {
    pub fn new(size: Size<i32, Physical>, format: PixelFormat) -> ShadowImage {
        let stride = size.w.max(0) as usize * format.bytes_per_pixel();
        ShadowImage {
            size,
            format,
            stride,
            data: vec![0; stride * size.h.max(0) as usize],
        }
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

struct PeerControlInner {
    allow_output: Cell<bool>,
    contents_lost: Cell<bool>,
    scheduler: RefCell<Option<FrameScheduler>>,
}

/// Lets the protocol side pause and resume the stream, e.g. while the
/// viewer is minimized.
#[derive(Clone)]
pub struct PeerControl(Rc<PeerControlInner>);

impl PeerControl {
    fn new() -> PeerControl {
        PeerControl(Rc::new(PeerControlInner {
            allow_output: Cell::new(true),
            contents_lost: Cell::new(false),
            scheduler: Default::default(),
        }))
    }

    pub fn allow_output(&self) -> bool {
        self.0.allow_output.get()
    }

    /// Resuming makes the next frame a full one.
    pub fn set_allow_output(&self, allow: bool) {
        let was_allowed = self.0.allow_output.replace(allow);
        if allow && !was_allowed {
            debug!("Remote output resumed");
            self.0.contents_lost.set(true);
            if let Some(scheduler) = self.0.scheduler.borrow().as_ref() {
                scheduler.schedule_frame();
            }
        } else if !allow && was_allowed {
            debug!("Remote output suppressed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_suppressed: u64,
}

/// Output streamed to a remote peer.
///
/// Frames are rendered into an offscreen target, copied into a shadow image
/// and the damaged parts encoded and sent.
pub struct RemoteOutput {
    peer: Box<dyn RemotePeer>,
    encoder: Box<dyn FrameEncoder>,
    renderer: SharedRenderer,
    target: Option<TargetId>,
    shadow: ShadowImage,
    scratch: Vec<u8>,
    control: PeerControl,
    rendering: bool,
    enabled: bool,
    default_refresh: i32,
    stats: RemoteStats,
}

impl RemoteOutput {
    pub fn new(
        peer: Box<dyn RemotePeer>,
        encoder: Box<dyn FrameEncoder>,
        renderer: SharedRenderer,
        config: &RemoteConfig,
    ) -> Result<(RemoteOutput, Mode), OutputError> {
        let mut output = RemoteOutput {
            peer,
            encoder,
            renderer,
            target: None,
            shadow: ShadowImage::new((0, 0).into(), FORMAT),
            scratch: Vec::new(),
            control: PeerControl::new(),
            rendering: false,
            enabled: true,
            default_refresh: config.default_refresh,
            stats: RemoteStats::default(),
        };
        let mode = output.set_custom_mode((config.width, config.height).into(), config.default_refresh)?;
        info!("Remote output created");
        Ok((output, mode))
    }

    pub fn control(&self) -> PeerControl {
        self.control.clone()
    }

    pub fn stats(&self) -> RemoteStats {
        self.stats
    }

    pub fn shadow(&self) -> &ShadowImage {
        &self.shadow
    }

    pub fn peer(&self) -> &dyn RemotePeer {
        &*self.peer
    }
}

impl OutputBackend for RemoteOutput {
    fn capabilities(&self) -> Capabilities {
        Capabilities::DISABLE | Capabilities::CUSTOM_MODES
    }

    fn frame_strategy(&self) -> FrameStrategy {
        FrameStrategy::Timer
    }

    fn bind_scheduler(&mut self, scheduler: &FrameScheduler) {
        *self.control.0.scheduler.borrow_mut() = Some(scheduler.clone());
    }

    fn session_active(&self) -> bool {
        self.peer.is_connected()
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), OutputError> {
        self.enabled = enabled;
        if enabled {
            self.control.0.contents_lost.set(true);
        }
        Ok(())
    }

    fn set_custom_mode(
        &mut self,
        size: Size<i32, Physical>,
        refresh: i32,
    ) -> Result<Mode, OutputError> {
        let refresh = if refresh > 0 {
            refresh
        } else {
            self.default_refresh
        };
        self.encoder
            .reset(size, FORMAT)
            .map_err(OutputError::EncoderInit)?;

        let mut renderer = self.renderer.borrow_mut();
        if let Some(target) = self.target.take() {
            renderer.destroy_target(target);
        }
        self.target = Some(
            renderer
                .create_target(size, FORMAT)
                .map_err(OutputError::RenderTarget)?,
        );
        self.shadow = ShadowImage::new(size, FORMAT);
        self.scratch.clear();
        Ok(Mode { size, refresh })
    }

    fn attach_render(&mut self) -> Result<i32, OutputError> {
        let target = self.target.ok_or(OutputError::Destroyed)?;
        self.renderer
            .borrow_mut()
            .bind(target)
            .map_err(OutputError::Render)?;
        self.rendering = true;
        Ok(if self.control.0.contents_lost.get() { 0 } else { 1 })
    }

    fn rollback_render(&mut self) {
        if std::mem::replace(&mut self.rendering, false) {
            self.renderer.borrow_mut().unbind();
        }
    }

    fn commit(
        &mut self,
        frame: Frame<'_>,
        _state: &CurrentState,
    ) -> Result<Option<u64>, OutputError> {
        if !matches!(frame.buffer, PendingBuffer::Render) {
            return Err(OutputError::ClientBuffersUnsupported);
        }
        let target = self.target.ok_or(OutputError::Destroyed)?;

        let copied = {
            let mut renderer = self.renderer.borrow_mut();
            let size = self.shadow.size();
            let stride = self.shadow.stride();
            let copied = copy_damage_flipped(
                &mut *renderer,
                target,
                size.h,
                FORMAT,
                stride,
                frame.damage,
                self.shadow.data_mut(),
            );
            renderer.unbind();
            copied
        };
        self.rendering = false;
        if !copied {
            return Err(OutputError::ReadPixels);
        }

        if frame.damage.is_empty() {
            return Ok(None);
        }
        if !self.enabled || !self.control.allow_output() {
            trace!("Remote output suppressed, not sending frame");
            self.stats.frames_suppressed += 1;
            return Ok(None);
        }

        self.scratch.clear();
        self.encoder
            .encode(&self.shadow, frame.damage, &mut self.scratch)
            .map_err(OutputError::Encode)?;
        self.peer.send(&self.scratch).map_err(OutputError::Send)?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += self.scratch.len() as u64;
        self.control.0.contents_lost.set(false);
        trace!(bytes = self.scratch.len(), "Sent frame to remote peer");
        Ok(None)
    }

    fn destroy(&mut self) {
        self.rollback_render();
        if let Some(target) = self.target.take() {
            self.renderer.borrow_mut().destroy_target(target);
        }
        self.control.0.scheduler.borrow_mut().take();
        self.scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::render::{MemoryRenderer, Renderer},
        output::{DamageTracker, Output},
        utils::geometry::{rect, Region},
    };
    use cosmic_output_config::DamageConfig;

    #[derive(Default)]
    struct PeerState {
        connected: bool,
        payloads: Vec<Vec<u8>>,
        fail: bool,
    }

    #[derive(Clone)]
    struct RecordingPeer(Rc<RefCell<PeerState>>);

    impl RecordingPeer {
        fn new() -> RecordingPeer {
            RecordingPeer(Rc::new(RefCell::new(PeerState {
                connected: true,
                ..Default::default()
            })))
        }

        fn bytes_sent(&self) -> usize {
            self.0.borrow().payloads.iter().map(Vec::len).sum()
        }
    }

    impl RemotePeer for RecordingPeer {
        fn is_connected(&self) -> bool {
            self.0.borrow().connected
        }

        fn send(&mut self, payload: &[u8]) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            if state.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            state.payloads.push(payload.to_vec());
            Ok(())
        }
    }

    struct FailingEncoder;

    impl FrameEncoder for FailingEncoder {
        fn reset(&mut self, size: Size<i32, Physical>, _: PixelFormat) -> Result<(), EncodeError> {
            Err(EncodeError::UnsupportedSize(size.w, size.h))
        }

        fn encode(&mut self, _: &ShadowImage, _: &Region, _: &mut Vec<u8>) -> Result<(), EncodeError> {
            Err(EncodeError::Codec("unreachable".into()))
        }
    }

    fn config() -> RemoteConfig {
        RemoteConfig {
            width: 64,
            height: 32,
            default_refresh: 60_000,
        }
    }

    fn setup() -> (Output<RemoteOutput>, RecordingPeer, Rc<RefCell<MemoryRenderer>>) {
        let peer = RecordingPeer::new();
        let renderer = MemoryRenderer::new().into_shared();
        let (remote, mode) = RemoteOutput::new(
            Box::new(peer.clone()),
            Box::new(RawEncoder::default()),
            renderer.clone(),
            &config(),
        )
        .unwrap();
        let mut output = Output::new("REMOTE-1", remote, mode);
        output.set_enabled(true).unwrap();
        (output, peer, renderer)
    }

    fn render(output: &mut Output<RemoteOutput>, renderer: &Rc<RefCell<MemoryRenderer>>, damage: Region) {
        output.attach_for_render().unwrap();
        renderer
            .borrow_mut()
            .fill_rect(rect(0, 0, 64, 32), 0xff336699)
            .unwrap();
        output.pending_mut().set_damage(damage);
        output.commit().unwrap();
    }

    #[test]
    fn damage_is_encoded_and_sent() {
        let (mut output, peer, renderer) = setup();
        render(&mut output, &renderer, Region::from_rect(rect(0, 0, 8, 2)));
        assert_eq!(peer.0.borrow().payloads.len(), 1);
        assert_eq!(peer.bytes_sent(), 4 + 16 + 8 * 2 * 4);
        assert_eq!(output.backend().stats().frames_sent, 1);
    }

    #[test]
    fn suppressed_output_sends_nothing() {
        let (mut output, peer, renderer) = setup();
        let control = output.backend().control();
        control.set_allow_output(false);

        render(&mut output, &renderer, Region::from_rect(rect(0, 0, 64, 32)));
        assert_eq!(peer.bytes_sent(), 0);
        assert_eq!(output.backend().stats().frames_suppressed, 1);
        // the frame still counts as presented
        assert!(!output.needs_frame());
    }

    #[test]
    fn resume_requests_full_frame() {
        let (mut output, peer, _renderer) = setup();
        let mut tracker = DamageTracker::new(&output, &DamageConfig::default());
        tracker.set_force_full(false);

        let frame = tracker.record_frame_start(&mut output).unwrap();
        output.pending_mut().set_damage(frame.damage.clone());
        output.commit().unwrap();
        tracker.commit_frame();

        let control = output.backend().control();
        control.set_allow_output(false);
        output.scheduler().cancel();
        control.set_allow_output(true);
        assert!(output.scheduler().is_scheduled());

        let frame = tracker.record_frame_start(&mut output).unwrap();
        assert_eq!(frame.age, 0);
        assert_eq!(frame.damage, Region::from_rect(rect(0, 0, 64, 32)));
        output.pending_mut().set_damage(frame.damage.clone());
        output.commit().unwrap();
        assert_eq!(peer.0.borrow().payloads.len(), 2);
    }

    #[test]
    fn empty_damage_sends_nothing() {
        let (mut output, peer, renderer) = setup();
        render(&mut output, &renderer, Region::new());
        assert_eq!(peer.bytes_sent(), 0);
        assert_eq!(output.backend().stats(), RemoteStats::default());
    }

    #[test]
    fn send_failure_is_transient() {
        let (mut output, peer, renderer) = setup();
        peer.0.borrow_mut().fail = true;
        output.attach_for_render().unwrap();
        renderer.borrow_mut().clear([1.0, 1.0, 1.0, 1.0]);
        let err = output.commit().unwrap_err();
        assert!(matches!(err, OutputError::Send(_)));
        assert!(!output.is_destroyed());
        assert!(output.scheduler().is_scheduled());
    }

    #[test]
    fn disconnected_peer_blocks_rendering() {
        let (mut output, peer, _renderer) = setup();
        peer.0.borrow_mut().connected = false;
        assert!(matches!(
            output.attach_for_render(),
            Err(OutputError::SessionInactive)
        ));
    }

    #[test]
    fn encoder_init_failure_is_fatal() {
        let renderer = MemoryRenderer::new().into_shared();
        let result = RemoteOutput::new(
            Box::new(RecordingPeer::new()),
            Box::new(FailingEncoder),
            renderer,
            &config(),
        );
        assert!(matches!(result, Err(OutputError::EncoderInit(_))));
    }

    #[test]
    fn mode_change_resizes_shadow() {
        let (mut output, _peer, renderer) = setup();
        output.set_custom_mode(128, 64, 0).unwrap();
        assert_eq!(output.backend().shadow().size(), (128, 64).into());
        assert_eq!(output.current().refresh(), 60_000);
        assert_eq!(renderer.borrow().target_count(), 1);
    }
}

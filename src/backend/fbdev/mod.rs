// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    io,
    path::Path,
    rc::Rc,
};

use cosmic_output_config::FramebufferConfig;
use smithay::utils::{Physical, Size};
use tracing::{debug, info, trace};

use super::{
    render::{copy_damage_flipped, PixelFormat, SharedRenderer, TargetId},
    Capabilities, Frame, OutputBackend,
};
use crate::{
    output::{CurrentState, FrameScheduler, FrameStrategy, Mode, OutputError, PendingBuffer},
    session::{DeviceSession, SessionFd},
    utils::signal::ListenerId,
};

mod ioctl;
pub use self::ioctl::{Bitfield, FbdevNode, FixScreenInfo, VarScreenInfo, FB_ACTIVATE_NOW};

/// Access to a framebuffer device.
pub trait FramebufferDevice {
    fn var_screen_info(&self) -> io::Result<VarScreenInfo>;
    /// Applies `info`. The device may adjust it to what it actually set.
    fn put_var_screen_info(&mut self, info: &mut VarScreenInfo) -> io::Result<()>;
    fn fix_screen_info(&self) -> io::Result<FixScreenInfo>;
    fn blank(&mut self, blank: bool) -> io::Result<()>;
    fn map(&mut self, len: usize) -> io::Result<Box<dyn DeviceMemory>>;
}

/// Device memory the display scans out from.
pub trait DeviceMemory {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn pixel_format(var: &VarScreenInfo) -> Option<PixelFormat> {
    let alpha = var.transp.length > 0;
    match (
        var.bits_per_pixel,
        var.red.offset,
        var.green.offset,
        var.blue.offset,
    ) {
        (32, 16, 8, 0) if alpha => Some(PixelFormat::Argb8888),
        (32, 16, 8, 0) => Some(PixelFormat::Xrgb8888),
        (32, 0, 8, 16) if alpha => Some(PixelFormat::Abgr8888),
        (32, 0, 8, 16) => Some(PixelFormat::Xbgr8888),
        (16, 11, 5, 0) => Some(PixelFormat::Rgb565),
        _ => None,
    }
}

fn total_pixels(var: &VarScreenInfo) -> u64 {
    let htotal = (var.xres + var.left_margin + var.right_margin + var.hsync_len) as u64;
    let vtotal = (var.yres + var.upper_margin + var.lower_margin + var.vsync_len) as u64;
    htotal * vtotal
}

/// Refresh rate in mHz, if the device reports its timings.
pub fn refresh_from_var(var: &VarScreenInfo) -> Option<i32> {
    let denom = total_pixels(var) * var.pixclock as u64;
    if denom == 0 {
        return None;
    }
    i32::try_from(1_000_000_000_000_000 / denom).ok()
}

/// Pixel clock in picoseconds for the given refresh rate in mHz.
pub fn pixclock_for_refresh(var: &VarScreenInfo, refresh: i32) -> u32 {
    let denom = total_pixels(var) * refresh.max(0) as u64;
    if denom == 0 {
        return 0;
    }
    u32::try_from(1_000_000_000_000_000 / denom).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    size: Size<i32, Physical>,
    stride: usize,
    format: PixelFormat,
}

/// Output on a memory-mapped framebuffer device.
///
/// Frames are rendered into a single offscreen target, and the damaged rows
/// copied into device memory on commit. There is no vblank, so frames are
/// paced by a timer.
pub struct FbdevOutput {
    device: Option<Box<dyn FramebufferDevice>>,
    session: Rc<dyn DeviceSession>,
    renderer: SharedRenderer,
    memory: Option<Box<dyn DeviceMemory>>,
    layout: Layout,
    target: Option<TargetId>,
    rendering: bool,
    contents_lost: Rc<Cell<bool>>,
    scheduler: Rc<RefCell<Option<FrameScheduler>>>,
    session_listener: Option<ListenerId>,
    default_refresh: i32,
}

impl FbdevOutput {
    pub fn open(
        session: &Rc<dyn DeviceSession>,
        path: &Path,
        renderer: SharedRenderer,
        config: &FramebufferConfig,
    ) -> Result<(FbdevOutput, Mode), OutputError> {
        let fd = SessionFd::open(session, path).map_err(OutputError::Session)?;
        info!(path = %path.display(), "Opened framebuffer device");
        FbdevOutput::new(
            Box::new(FbdevNode::new(fd)),
            session.clone(),
            renderer,
            config.default_refresh,
        )
    }

    pub fn new(
        device: Box<dyn FramebufferDevice>,
        session: Rc<dyn DeviceSession>,
        renderer: SharedRenderer,
        default_refresh: i32,
    ) -> Result<(FbdevOutput, Mode), OutputError> {
        let var = device.var_screen_info().map_err(OutputError::Device)?;
        let format = pixel_format(&var).ok_or(OutputError::UnsupportedFormat)?;

        let contents_lost = Rc::new(Cell::new(false));
        let scheduler = Rc::new(RefCell::new(None::<FrameScheduler>));
        let session_listener = {
            let contents_lost = contents_lost.clone();
            let scheduler = scheduler.clone();
            session.active_changed().connect(move |active| {
                if *active {
                    contents_lost.set(true);
                    if let Some(scheduler) = scheduler.borrow().as_ref() {
                        scheduler.schedule_frame();
                    }
                }
            })
        };

        let mut output = FbdevOutput {
            device: Some(device),
            session,
            renderer,
            memory: None,
            layout: Layout {
                size: (var.xres as i32, var.yres as i32).into(),
                stride: 0,
                format,
            },
            target: None,
            rendering: false,
            contents_lost,
            scheduler,
            session_listener: Some(session_listener),
            default_refresh,
        };
        let refresh = refresh_from_var(&var).unwrap_or(default_refresh);
        let mode = output.set_custom_mode(output.layout.size, refresh)?;
        Ok((output, mode))
    }

    pub fn stride(&self) -> usize {
        self.layout.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.layout.format
    }

    pub fn mapped_len(&self) -> usize {
        self.memory.as_ref().map(|memory| memory.len()).unwrap_or(0)
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    fn device(&mut self) -> Result<&mut Box<dyn FramebufferDevice>, OutputError> {
        self.device.as_mut().ok_or(OutputError::Destroyed)
    }

    fn release_resources(&mut self) {
        self.memory = None;
        if let Some(target) = self.target.take() {
            self.renderer.borrow_mut().destroy_target(target);
        }
    }
}

impl OutputBackend for FbdevOutput {
    fn capabilities(&self) -> Capabilities {
        Capabilities::DISABLE | Capabilities::CUSTOM_MODES
    }

    fn frame_strategy(&self) -> FrameStrategy {
        FrameStrategy::Timer
    }

    fn bind_scheduler(&mut self, scheduler: &FrameScheduler) {
        *self.scheduler.borrow_mut() = Some(scheduler.clone());
    }

    fn session_active(&self) -> bool {
        self.session.is_active()
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), OutputError> {
        self.device()?.blank(!enabled).map_err(OutputError::Blank)?;
        if enabled {
            // blanking may not preserve the scanout contents
            self.contents_lost.set(true);
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

        let device = self.device()?;
        let mut var = device.var_screen_info().map_err(OutputError::Device)?;
        var.xres = size.w as u32;
        var.yres = size.h as u32;
        var.xres_virtual = var.xres;
        var.yres_virtual = var.yres;
        var.xoffset = 0;
        var.yoffset = 0;
        var.activate = FB_ACTIVATE_NOW;
        var.pixclock = pixclock_for_refresh(&var, refresh);
        device
            .put_var_screen_info(&mut var)
            .map_err(OutputError::Device)?;
        let fix = device.fix_screen_info().map_err(OutputError::Device)?;
        let format = pixel_format(&var).ok_or(OutputError::UnsupportedFormat)?;

        self.release_resources();

        let len = var.yres_virtual as usize * fix.line_length as usize;
        let memory = self.device()?.map(len).map_err(OutputError::Device)?;
        self.memory = Some(memory);

        let size = Size::from((var.xres as i32, var.yres as i32));
        let target = self
            .renderer
            .borrow_mut()
            .create_target(size, format)
            .map_err(OutputError::RenderTarget)?;
        self.target = Some(target);
        self.layout = Layout {
            size,
            stride: fix.line_length as usize,
            format,
        };

        let mode = Mode {
            size,
            refresh: refresh_from_var(&var).unwrap_or(refresh),
        };
        debug!(
            ?format,
            stride = self.layout.stride,
            len,
            "Framebuffer reconfigured"
        );
        Ok(mode)
    }

    fn attach_render(&mut self) -> Result<i32, OutputError> {
        let target = self.target.ok_or(OutputError::Destroyed)?;
        self.renderer
            .borrow_mut()
            .bind(target)
            .map_err(OutputError::Render)?;
        self.rendering = true;
        Ok(if self.contents_lost.get() { 0 } else { 1 })
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
        let (Some(target), Some(memory)) = (self.target, self.memory.as_mut()) else {
            return Err(OutputError::Destroyed);
        };

        let mut renderer = self.renderer.borrow_mut();
        let copied = copy_damage_flipped(
            &mut *renderer,
            target,
            self.layout.size.h,
            self.layout.format,
            self.layout.stride,
            frame.damage,
            memory.as_mut_slice(),
        );
        renderer.unbind();
        self.rendering = false;
        if !copied {
            return Err(OutputError::ReadPixels);
        }

        self.contents_lost.set(false);
        trace!(rects = frame.damage.len(), "Copied damage to framebuffer");
        Ok(None)
    }

    fn destroy(&mut self) {
        self.rollback_render();
        self.release_resources();
        if let Some(id) = self.session_listener.take() {
            self.session.active_changed().disconnect(id);
        }
        self.scheduler.borrow_mut().take();
        // closes the device through the session
        self.device = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::render::{MemoryRenderer, Renderer},
        output::{DamageTracker, Output},
        session::DirectSession,
        utils::geometry::{rect, Region},
    };
    use cosmic_output_config::DamageConfig;

    #[derive(Default)]
    struct DeviceState {
        var: VarScreenInfo,
        mapped_len: usize,
        blanked: bool,
        fail_put: bool,
    }

    /// Framebuffer device backed by a plain vector.
    #[derive(Clone)]
    struct MemoryDevice(Rc<RefCell<DeviceState>>);

    impl MemoryDevice {
        fn new(w: u32, h: u32) -> MemoryDevice {
            let var = VarScreenInfo {
                xres: w,
                yres: h,
                xres_virtual: w,
                yres_virtual: h,
                bits_per_pixel: 32,
                red: Bitfield {
                    offset: 16,
                    length: 8,
                    msb_right: 0,
                },
                green: Bitfield {
                    offset: 8,
                    length: 8,
                    msb_right: 0,
                },
                blue: Bitfield {
                    offset: 0,
                    length: 8,
                    msb_right: 0,
                },
                ..Default::default()
            };
            MemoryDevice(Rc::new(RefCell::new(DeviceState {
                var,
                ..Default::default()
            })))
        }
    }

    impl DeviceMemory for Vec<u8> {
        fn as_slice(&self) -> &[u8] {
            self
        }

        fn as_mut_slice(&mut self) -> &mut [u8] {
            self
        }

        fn len(&self) -> usize {
            Vec::len(self)
        }
    }

    /// Reads back a pixel the way the display would scan it out.
    fn pixel(output: &Output<FbdevOutput>, x: usize, y: usize) -> u32 {
        let fbdev = output.backend();
        let memory = fbdev.memory.as_ref().unwrap().as_slice();
        let offset = y * fbdev.stride() + x * 4;
        u32::from_le_bytes([
            memory[offset],
            memory[offset + 1],
            memory[offset + 2],
            memory[offset + 3],
        ])
    }

    impl FramebufferDevice for MemoryDevice {
        fn var_screen_info(&self) -> io::Result<VarScreenInfo> {
            Ok(self.0.borrow().var)
        }

        fn put_var_screen_info(&mut self, info: &mut VarScreenInfo) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            if state.fail_put {
                return Err(io::Error::other("mode rejected"));
            }
            state.var = *info;
            Ok(())
        }

        fn fix_screen_info(&self) -> io::Result<FixScreenInfo> {
            Ok(FixScreenInfo {
                line_length: self.0.borrow().var.xres * 4,
                ..Default::default()
            })
        }

        fn blank(&mut self, blank: bool) -> io::Result<()> {
            self.0.borrow_mut().blanked = blank;
            Ok(())
        }

        fn map(&mut self, len: usize) -> io::Result<Box<dyn DeviceMemory>> {
            self.0.borrow_mut().mapped_len = len;
            Ok(Box::new(vec![0u8; len]))
        }
    }

    fn setup(
        w: u32,
        h: u32,
    ) -> (
        Output<FbdevOutput>,
        MemoryDevice,
        Rc<DirectSession>,
        Rc<RefCell<MemoryRenderer>>,
    ) {
        let device = MemoryDevice::new(w, h);
        let direct = DirectSession::new();
        let session: Rc<dyn DeviceSession> = direct.clone();
        let renderer = MemoryRenderer::new().into_shared();
        let (fbdev, mode) =
            FbdevOutput::new(Box::new(device.clone()), session, renderer.clone(), 60_000)
                .unwrap();
        let mut output = Output::new("FB-0", fbdev, mode);
        output.set_enabled(true).unwrap();
        (output, device, direct, renderer)
    }

    #[test]
    fn resize_remaps_device_memory() {
        let (mut output, device, _session, _renderer) = setup(1920, 1080);
        assert_eq!(output.current().buffer_size(), (1920, 1080).into());

        output.set_custom_mode(1280, 720, 60_000).unwrap();
        let current = output.current();
        assert_eq!(current.buffer_size(), (1280, 720).into());
        assert!((current.refresh() - 60_000).abs() <= 10);

        let stride = output.backend().stride();
        assert_eq!(stride, 1280 * 4);
        assert_eq!(output.backend().mapped_len(), 720 * stride);
        assert_eq!(device.0.borrow().mapped_len, 720 * stride);

        let age = output.attach_for_render().unwrap();
        assert!(age >= 0);
        output.rollback_render();
    }

    #[test]
    fn commit_copies_damage_upright() {
        let (mut output, _device, _session, renderer) = setup(64, 32);
        output.attach_for_render().unwrap();
        {
            let mut renderer = renderer.borrow_mut();
            renderer.begin((64, 32).into()).unwrap();
            renderer.clear([0.0, 0.0, 1.0, 1.0]);
            renderer.fill_rect(rect(4, 2, 8, 4), 0xff00ff00).unwrap();
            renderer.end();
        }
        output
            .pending_mut()
            .set_damage(Region::from_rect(rect(0, 0, 16, 8)));
        output.commit().unwrap();

        assert_eq!(pixel(&output, 4, 2), 0xff00ff00);
        assert_eq!(pixel(&output, 11, 5), 0xff00ff00);
        assert_eq!(pixel(&output, 0, 0), 0xff0000ff);
        // outside of the damage
        assert_eq!(pixel(&output, 40, 20), 0);
        assert_eq!(renderer.borrow().bound(), None);
    }

    #[test]
    fn failed_read_drops_frame() {
        let (mut output, _device, _session, renderer) = setup(64, 32);
        output.attach_for_render().unwrap();
        renderer.borrow_mut().set_fail_reads(true);
        let err = output.commit().unwrap_err();
        assert!(matches!(err, OutputError::ReadPixels));
        assert!(!output.is_destroyed());
        assert!(output.scheduler().is_scheduled());
    }

    #[test]
    fn rejected_mode_is_fatal() {
        let (mut output, device, _session, _renderer) = setup(64, 32);
        device.0.borrow_mut().fail_put = true;
        assert!(output.set_custom_mode(32, 32, 0).is_err());
        assert!(output.is_destroyed());
    }

    #[test]
    fn disable_blanks_display() {
        let (mut output, device, _session, _renderer) = setup(64, 32);
        output.set_enabled(false).unwrap();
        assert!(device.0.borrow().blanked);
        assert!(matches!(
            output.attach_for_render(),
            Err(OutputError::Disabled)
        ));
        output.set_enabled(true).unwrap();
        assert!(!device.0.borrow().blanked);
    }

    #[test]
    fn session_resume_forces_full_redraw() {
        let (mut output, _device, session, _renderer) = setup(64, 32);
        let mut tracker = DamageTracker::new(&output, &DamageConfig::default());
        tracker.set_force_full(false);

        let frame = tracker.record_frame_start(&mut output).unwrap();
        output.pending_mut().set_damage(frame.damage.clone());
        output.commit().unwrap();
        tracker.commit_frame();
        assert_eq!(output.attach_for_render().unwrap(), 1);
        output.rollback_render();

        session.set_active(false);
        assert!(matches!(
            output.attach_for_render(),
            Err(OutputError::SessionInactive)
        ));
        output.scheduler().cancel();
        session.set_active(true);
        assert!(output.scheduler().is_scheduled());

        let frame = tracker.record_frame_start(&mut output).unwrap();
        assert_eq!(frame.age, 0);
        assert!(frame.needs_frame);
        assert_eq!(frame.damage, Region::from_rect(rect(0, 0, 64, 32)));
        output.rollback_render();
    }

    #[test]
    fn destroy_releases_render_target() {
        let (mut output, _device, session, renderer) = setup(64, 32);
        assert_eq!(renderer.borrow().target_count(), 1);
        output.destroy();
        assert_eq!(renderer.borrow().target_count(), 0);
        assert_eq!(session.active_changed().listener_count(), 0);
    }
}

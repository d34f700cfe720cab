// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    error::Error,
    io, process,
    rc::Rc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use calloop::EventLoop;
use clap_lex::RawArgs;
use tracing::{debug, error, info, warn};

use cosmic_output::{
    backend::{
        init_output,
        remote::RemotePeer,
        render::{MemoryRenderer, Renderer},
        OutputSource, Outputs,
    },
    config::Config,
    logger,
    output::{DamageTracker, OutputEvent},
    utils::geometry::{rect, Rect},
};
use smithay::utils::{Physical, Size};

#[cfg(feature = "profile-with-tracy")]
#[global_allocator]
static GLOBAL: profiling::tracy_client::ProfiledAllocator<std::alloc::System> =
    profiling::tracy_client::ProfiledAllocator::new(std::alloc::System, 10);

const OUTPUT: &str = "HEADLESS-1";
const SQUARE: i32 = 64;
const BACKGROUND: [f32; 4] = [0.1, 0.1, 0.1, 1.0];
const FOREGROUND: u32 = 0xffe0_6c2b;

#[derive(Debug, Default)]
struct PeerStats {
    frames: Cell<u64>,
    bytes: Cell<u64>,
}

/// Peer discarding everything it is sent.
struct CountingPeer(Rc<PeerStats>);

impl RemotePeer for CountingPeer {
    fn is_connected(&self) -> bool {
        true
    }

    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.0.frames.set(self.0.frames.get() + 1);
        self.0.bytes.set(self.0.bytes.get() + payload.len() as u64);
        Ok(())
    }
}

struct State {
    outputs: Outputs,
    renderer: Rc<RefCell<MemoryRenderer>>,
    tracker: DamageTracker,
    events: Rc<RefCell<Vec<OutputEvent>>>,
    frame_needed: Rc<Cell<bool>>,
    frames: u32,
    x: i32,
}

impl State {
    fn render_frame(&mut self) -> Result<()> {
        let Some(output) = self.outputs.get_mut(OUTPUT) else {
            bail!("Output {} is gone", OUTPUT);
        };
        for event in self.events.borrow_mut().drain(..) {
            self.tracker.handle_output_event(&event);
        }

        let frame = self.tracker.record_frame_start(output)?;
        if !frame.needs_frame {
            return Ok(());
        }

        let size = output.current().buffer_size();
        let square = rect(self.x, (size.h - SQUARE) / 2, SQUARE, SQUARE);
        if let Err(err) = draw(&mut self.renderer.borrow_mut(), size, square) {
            output.rollback_render();
            return Err(err);
        }

        output.pending_mut().set_damage(frame.damage.clone());
        output.commit()?;
        self.tracker.commit_frame();
        self.frames += 1;
        debug!(
            frame = self.frames,
            age = frame.age,
            rects = frame.damage.len(),
            "Frame committed"
        );

        self.x = (self.x + 8) % (size.w - SQUARE).max(1);
        self.tracker.add_rect(square);
        self.tracker
            .add_rect(rect(self.x, square.loc.y, SQUARE, SQUARE));
        Ok(())
    }
}

fn draw(renderer: &mut MemoryRenderer, size: Size<i32, Physical>, square: Rect) -> Result<()> {
    renderer.begin(size)?;
    renderer.clear(BACKGROUND);
    renderer.fill_rect(square, FOREGROUND)?;
    renderer.end();
    Ok(())
}

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occurred in main(): {}", err);
        process::exit(1);
    }
}

fn main_inner() -> Result<(), Box<dyn Error>> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut frames = 120u32;

    // Parse the arguments
    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(());
            }
            Some("--version") | Some("-V") => {
                println!(
                    "cosmic-output-headless {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(());
            }
            Some("--frames") | Some("-n") => {
                frames = raw_args
                    .next_os(&mut cursor)
                    .and_then(|value| value.to_str())
                    .and_then(|value| value.parse().ok())
                    .context("--frames expects a number")?;
            }
            _ => {}
        }
    }

    logger::init_logger()?;
    info!("Headless output starting up!");

    profiling::register_thread!("Main Thread");
    #[cfg(feature = "profile-with-tracy")]
    tracy_client::Client::start();

    let config = Config::load();
    let renderer = MemoryRenderer::new().into_shared();
    let stats = Rc::new(PeerStats::default());

    let mut output = init_output(
        OUTPUT,
        OutputSource::Remote {
            peer: Box::new(CountingPeer(stats.clone())),
            encoder: None,
        },
        renderer.clone(),
        &config.backend,
    )?;
    output
        .set_enabled(true)
        .context("Failed to enable output")?;

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    output
        .events()
        .connect(move |event| sink.borrow_mut().push(event.clone()));
    let frame_needed = Rc::new(Cell::new(false));
    let flag = frame_needed.clone();
    output.scheduler().connect_frame(move |_| flag.set(true));

    let mut event_loop: EventLoop<'static, State> =
        EventLoop::try_new().with_context(|| "Failed to initialize event loop")?;
    output.scheduler().insert_into_loop(&event_loop.handle())?;

    let tracker = DamageTracker::new(&output, &config.backend.damage);
    let mut outputs = Outputs::new();
    outputs.add(output);
    outputs.apply_all(&config.backend);

    let mut state = State {
        outputs,
        renderer,
        tracker,
        events,
        frame_needed,
        frames: 0,
        x: 0,
    };

    while state.frames < frames {
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut state)
            .context("Failed to dispatch event loop")?;
        if !state.outputs.dispatch_events().is_empty() {
            return Err("Output was destroyed".into());
        }
        if state.frame_needed.replace(false) {
            if let Err(err) = state.render_frame() {
                warn!(?err, "Failed to render frame");
            }
        }
    }

    info!(
        frames = stats.frames.get(),
        bytes = stats.bytes.get(),
        "Done"
    );
    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"cosmic-output-headless {version} (git commit {git_rev})
Renders a moving square into a remote output and discards the encoded frames.

Project home page: https://github.com/pop-os/cosmic-comp

Options:
  -n, --frames <N>  Number of frames to render (default: 120)
  -h, --help        Show this message
  -V, --version     Show the version of cosmic-output-headless"#
    );
}

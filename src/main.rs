//! Chromacam: real-time chroma-key and filter-chain webcam compositor CLI.

use anyhow::Result;
use chromacam::backend::{Backend, BackendKind};
use chromacam::capture::{CaptureBackend, NokhwaCapture};
use chromacam::config::{Config, ConfigOverrides};
use chromacam::present::{MemoryPresenter, WindowPresenter};
use chromacam::session::Session;
use chromacam::shader::GpuContext;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

/// Real-time chroma-key and filter-chain webcam compositor.
#[derive(Parser, Debug)]
#[command(name = "chromacam")]
#[command(about = "Key out a background color and apply filters to webcam video in real-time")]
struct Args {
    /// YAML config file; watched for changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera device index (overrides the config)
    #[arg(short, long)]
    input: Option<u32>,

    /// Frame width (overrides the config)
    #[arg(long)]
    width: Option<u32>,

    /// Frame height (overrides the config)
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second (overrides the config)
    #[arg(long)]
    fps: Option<u32>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,

    /// Rendering backend for keying and filters (overrides the config)
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Process frames without opening a window
    #[arg(long)]
    headless: bool,

    /// Stop after presenting this many frames (headless only)
    #[arg(long)]
    frames: Option<u64>,
}

impl Args {
    /// The config file contents, or the defaults without `--config`.
    fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => {
                info!("Loading config from {:?}", path);
                Config::load(path)
            }
            None => Ok(Config::default()),
        }
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device_index: self.input,
            width: self.width,
            height: self.height,
            fps: self.fps,
            backend: self.backend,
        }
    }
}

/// Application state for the event loop.
struct ChromacamApp {
    session: Session,
    window: Option<Arc<Window>>,
    presenter: Option<WindowPresenter>,
    cursor: Option<PhysicalPosition<f64>>,
    last_frame_time: Instant,
}

impl ChromacamApp {
    fn new(session: Session) -> Self {
        Self {
            session,
            window: None,
            presenter: None,
            cursor: None,
            last_frame_time: Instant::now(),
        }
    }

    fn initialize(&mut self, window: Arc<Window>) -> Result<()> {
        let presenter = WindowPresenter::new(window, self.session.config().background)?;
        info!("Window created successfully");

        let backend = match self.session.config().backend {
            BackendKind::Gpu => Backend::Gpu(presenter.gpu()),
            BackendKind::Cpu => Backend::Cpu,
        };
        self.session.initialize(backend)?;
        self.presenter = Some(presenter);
        self.session.open_capture();
        Ok(())
    }

    fn process_frame(&mut self) {
        let Some(presenter) = &mut self.presenter else {
            return;
        };
        if self.session.poll_config() {
            presenter.set_background(self.session.config().background);
        }
        self.session.tick(presenter);
    }
}

impl ApplicationHandler for ChromacamApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let camera = &self.session.config().camera;
        let window_attrs = WindowAttributes::default()
            .with_title("Chromacam")
            .with_inner_size(PhysicalSize::new(camera.width, camera.height));

        match event_loop.create_window(window_attrs) {
            Ok(window) => {
                let window = Arc::new(window);
                self.window = Some(window.clone());
                if let Err(e) = self.initialize(window) {
                    error!("Initialization error: {:#}", e);
                    event_loop.exit();
                }
            }
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(presenter) = &mut self.presenter {
                    presenter.resize(size);
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.cursor = Some(position);
            }
            WindowEvent::MouseInput {
                state: ElementState::Pressed,
                button: MouseButton::Left,
                ..
            } => {
                if !self.session.config().show_color_dropper {
                    return;
                }
                if let (Some(position), Some(presenter)) = (self.cursor, &self.presenter) {
                    let size = presenter.window().inner_size();
                    self.session
                        .pick_key_color((position.x, position.y), (size.width, size.height));
                }
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                if now.duration_since(self.last_frame_time) >= self.session.frame_duration() {
                    self.process_frame();
                    self.last_frame_time = now;
                }

                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.list_devices {
        println!("Available cameras:");
        match NokhwaCapture::list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => {
                eprintln!("Failed to list devices: {}", e);
            }
        }
        return Ok(());
    }

    let config = args.load_config()?;
    info!("Starting Chromacam...");

    let session = Session::<NokhwaCapture>::new(config, args.overrides(), args.config.clone());
    if args.headless {
        run_headless(session, args.frames)
    } else {
        run_window_mode(session)
    }
}

/// Run with a window (default).
fn run_window_mode(session: Session) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ChromacamApp::new(session);
    event_loop.run_app(&mut app)?;

    Ok(())
}

/// Run without a window until interrupted or `frame_limit` frames are presented.
fn run_headless(mut session: Session, frame_limit: Option<u64>) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let backend = match session.config().backend {
        BackendKind::Cpu => Backend::Cpu,
        BackendKind::Gpu => match GpuContext::headless() {
            Ok(context) => Backend::Gpu(Arc::new(context)),
            Err(e) => {
                warn!("No GPU available ({}); falling back to CPU backend", e);
                Backend::Cpu
            }
        },
    };
    session.initialize(backend)?;
    session.open_capture();

    let mut presenter = MemoryPresenter::new();
    info!("Running headless at {} fps", session.config().camera.fps);

    while running.load(Ordering::SeqCst) {
        if frame_limit.is_some_and(|limit| presenter.frames_presented() >= limit) {
            break;
        }
        let frame_start = Instant::now();

        session.poll_config();
        session.tick(&mut presenter);

        let elapsed = frame_start.elapsed();
        let frame_duration = session.frame_duration();
        if elapsed < frame_duration {
            thread::sleep(frame_duration - elapsed);
        }
    }

    info!("Headless run stopped after {} frames", presenter.frames_presented());
    Ok(())
}

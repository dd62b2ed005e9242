//! Capture, segmentation and effect state shared by window and headless mode.

use crate::backend::{Backend, BackendKind};
use crate::capture::{AsyncCapture, CaptureBackend, NokhwaCapture};
use crate::config::{Config, ConfigOverrides, ConfigWatcher};
use crate::error::PipelineError;
use crate::pipeline::{EffectPipeline, TickOutcome};
use crate::present::{window_to_frame, FramePresenter, Overlay};
use crate::segmentation::{AsyncSegmentation, SegmentationEngine};
use crate::source::{FrameSource, VideoSource};
use crate::utils::FpsCounter;
use anyhow::Result;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

fn load_overlay(config: &Config) -> Option<Overlay> {
    let overlay_config = config.overlay.as_ref()?;
    match Overlay::load(overlay_config) {
        Ok(overlay) => Some(overlay),
        Err(e) => {
            error!("{:#}", e);
            None
        }
    }
}

fn start_segmentation(config: &Config) -> Option<AsyncSegmentation> {
    let model_path = config.segmentation.model_path.as_ref()?;
    if let Err(e) = SegmentationEngine::init() {
        warn!("Failed to initialize ONNX Runtime: {}. Segmentation will be unavailable.", e);
        return None;
    }
    let engine = match SegmentationEngine::load(model_path) {
        Ok(Some(engine)) => engine,
        Ok(None) => return None,
        Err(e) => {
            error!("Failed to load segmentation model: {}", e);
            return None;
        }
    };
    match AsyncSegmentation::spawn(engine) {
        Ok(worker) => {
            info!("Segmentation worker running");
            Some(worker)
        }
        Err(e) => {
            error!("Failed to start segmentation worker: {}", e);
            None
        }
    }
}

/// One running compositor: the camera `B`, the optional matting worker, the
/// effect pipeline and the config it was built from.
pub struct Session<B = NokhwaCapture> {
    config: Config,
    overrides: ConfigOverrides,
    watcher: Option<ConfigWatcher>,
    pipeline: EffectPipeline,
    capture: Option<AsyncCapture>,
    segmentation: Option<AsyncSegmentation>,
    /// Generation of the last camera frame handed to the segmentation worker
    last_submitted: u64,
    reconnect_at: Option<Instant>,
    fps: FpsCounter,
    _camera: PhantomData<fn() -> B>,
}

impl<B: CaptureBackend + 'static> Session<B> {
    /// `file_config` is the config as read from `config_path` (or the
    /// defaults); `overrides` are applied on top of it now and on every reload.
    pub fn new(file_config: Config, overrides: ConfigOverrides, config_path: Option<PathBuf>) -> Self {
        let watcher = config_path.and_then(|path| ConfigWatcher::new(path, file_config.clone()));
        let mut config = file_config;
        overrides.apply(&mut config);

        let mut pipeline = EffectPipeline::new(config.effect_settings());
        pipeline.set_overlay(load_overlay(&config));
        let segmentation = start_segmentation(&config);
        Self {
            config,
            overrides,
            watcher,
            pipeline,
            capture: None,
            segmentation,
            last_submitted: 0,
            reconnect_at: None,
            fps: FpsCounter::new(),
            _camera: PhantomData,
        }
    }

    /// The config in effect, overrides included.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initializes the pipeline on `backend`, dropping to the CPU backend if
    /// the GPU stages fail to build.
    pub fn initialize(&mut self, backend: Backend) -> Result<()> {
        match self.pipeline.initialize(&backend) {
            Ok(()) => Ok(()),
            Err(e) if backend.kind() == BackendKind::Gpu => {
                warn!("GPU pipeline initialization failed ({:#}); falling back to CPU backend", e);
                self.pipeline.initialize(&Backend::Cpu)
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces the matting worker.
    pub fn set_segmentation(&mut self, segmentation: Option<AsyncSegmentation>) {
        self.segmentation = segmentation;
        self.last_submitted = 0;
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// True while a reopen of the camera is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.camera.fps.max(1) as f64)
    }

    pub fn open_capture(&mut self) {
        self.capture = None;
        self.last_submitted = 0;
        info!("Opening camera device {}...", self.config.camera.device_index);
        match AsyncCapture::spawn::<B>(self.config.camera.clone()) {
            Ok(capture) => {
                let (w, h) = capture.frame_size();
                info!("Camera opened successfully at {}x{} (async capture)", w, h);
                self.capture = Some(capture);
                self.reconnect_at = None;
            }
            Err(e) => {
                error!("Failed to open camera: {}", e);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = Duration::from_millis(self.config.reconnect_after_ms);
        info!("Reconnecting to camera in {:?}", delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Applies config file changes reported by the watcher. Returns true if
    /// the config in effect changed.
    pub fn poll_config(&mut self) -> bool {
        match self.watcher.as_mut().and_then(|w| w.check_for_changes()) {
            Some((_, new)) => self.apply_config(new),
            None => false,
        }
    }

    /// Switches to `file_config` with the overrides re-applied. Only the parts
    /// that differ are rebuilt; a camera change reopens the device.
    pub fn apply_config(&mut self, file_config: Config) -> bool {
        let mut new = file_config;
        self.overrides.apply(&mut new);
        if new == self.config {
            return false;
        }

        info!("Applying new config");
        let old = std::mem::replace(&mut self.config, new);
        self.pipeline.set_settings(self.config.effect_settings());
        if old.overlay != self.config.overlay {
            self.pipeline.set_overlay(load_overlay(&self.config));
        }
        if old.segmentation != self.config.segmentation {
            self.set_segmentation(None);
            let segmentation = start_segmentation(&self.config);
            self.set_segmentation(segmentation);
        }
        if old.backend != self.config.backend {
            warn!("Backend changes take effect on restart");
        }
        if old.camera != self.config.camera {
            self.open_capture();
        }
        true
    }

    /// Runs one frame. While the camera is closed this only checks whether a
    /// scheduled reopen is due.
    pub fn tick(&mut self, presenter: &mut dyn FramePresenter) -> TickOutcome {
        let Some(capture) = &self.capture else {
            if self.reconnect_at.is_some_and(|at| Instant::now() >= at) {
                self.open_capture();
            }
            return TickOutcome::SourceUnavailable;
        };

        let outcome = match &self.segmentation {
            Some(segmentation) => {
                if let Some((generation, frame)) = capture.frames().latest_since(self.last_submitted) {
                    if segmentation.submit(frame) {
                        self.last_submitted = generation;
                    }
                }
                if !capture.is_active() {
                    TickOutcome::SourceUnavailable
                } else {
                    match segmentation.latest() {
                        Some(segmented) => self.pipeline.tick(FrameSource::Still(&segmented), presenter),
                        None => TickOutcome::Skipped(PipelineError::FrameNotReady),
                    }
                }
            }
            None => self.pipeline.tick(FrameSource::Video(capture), presenter),
        };

        match &outcome {
            TickOutcome::SourceUnavailable => {
                warn!("Camera stream ended");
                self.capture = None;
                self.schedule_reconnect();
            }
            TickOutcome::Presented => {
                if let Some(fps) = self.fps.tick() {
                    let dropped = self.segmentation.as_ref().map_or(0, |s| s.dropped());
                    debug!("[Perf] Rendering at {:.2} FPS (segmentation dropped {})", fps, dropped);
                }
            }
            TickOutcome::Empty | TickOutcome::Skipped(_) => {}
        }
        outcome
    }

    /// Sets the key color from the source pixel under a position in a
    /// `window` sized surface.
    pub fn pick_key_color(&mut self, position: (f64, f64), window: (u32, u32)) {
        let Some(frame_size) = self.pipeline.source_size() else {
            return;
        };
        let Some((x, y)) = window_to_frame(position, window, frame_size) else {
            return;
        };
        if let Some(color) = self.pipeline.sample_source(x, y) {
            self.pipeline.set_key_color(color);
            self.config.key.color = color;
            info!("Key color set to {}", color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraInfo, CaptureConfig};
    use crate::frame::Bitmap;
    use crate::present::MemoryPresenter;
    use crate::segmentation::Matting;
    use anyhow::anyhow;
    use image::{GrayImage, Luma};
    use std::thread;

    /// Delivers two frames, then fails like an unplugged camera.
    struct FlakyCamera {
        remaining: u32,
    }

    impl CaptureBackend for FlakyCamera {
        fn list_devices() -> Result<Vec<CameraInfo>> {
            Ok(Vec::new())
        }

        fn open(_config: CaptureConfig) -> Result<Self> {
            Ok(Self { remaining: 2 })
        }

        fn capture_frame(&mut self) -> Result<Bitmap> {
            if self.remaining == 0 {
                return Err(anyhow!("unplugged"));
            }
            self.remaining -= 1;
            Ok(Bitmap::solid(4, 2, [255, 0, 0, 255]))
        }

        fn frame_size(&self) -> (u32, u32) {
            (4, 2)
        }
    }

    /// Delivers red frames every millisecond until dropped.
    struct SteadyCamera;

    impl CaptureBackend for SteadyCamera {
        fn list_devices() -> Result<Vec<CameraInfo>> {
            Ok(Vec::new())
        }

        fn open(_config: CaptureConfig) -> Result<Self> {
            Ok(Self)
        }

        fn capture_frame(&mut self) -> Result<Bitmap> {
            thread::sleep(Duration::from_millis(1));
            Ok(Bitmap::solid(4, 2, [255, 0, 0, 255]))
        }

        fn frame_size(&self) -> (u32, u32) {
            (4, 2)
        }
    }

    /// Background everywhere in the first column, foreground elsewhere.
    struct FirstColumnBackground;

    impl Matting for FirstColumnBackground {
        fn predict(&mut self, frame: &Bitmap) -> Result<GrayImage> {
            Ok(GrayImage::from_fn(frame.width, frame.height, |x, _| {
                Luma([if x == 0 { 0 } else { 255 }])
            }))
        }
    }

    fn test_config(reconnect_after_ms: u64) -> Config {
        Config {
            flip_x: false,
            reconnect_after_ms,
            backend: BackendKind::Cpu,
            ..Config::default()
        }
    }

    fn cpu_session<B: CaptureBackend + 'static>(config: Config) -> Session<B> {
        let mut session = Session::<B>::new(config, ConfigOverrides::default(), None);
        session.initialize(Backend::Cpu).unwrap();
        session
    }

    /// Ticks until `done` accepts an outcome or five seconds pass.
    fn tick_until<B: CaptureBackend + 'static>(
        session: &mut Session<B>,
        presenter: &mut MemoryPresenter,
        done: impl Fn(&TickOutcome) -> bool,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done(&session.tick(presenter)) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_dead_stream_reconnects_after_delay() {
        let mut session = cpu_session::<FlakyCamera>(test_config(0));
        let mut presenter = MemoryPresenter::new();
        session.open_capture();
        assert!(session.is_capturing());

        assert!(tick_until(&mut session, &mut presenter, |o| matches!(
            o,
            TickOutcome::SourceUnavailable
        )));
        assert!(!session.is_capturing());
        assert!(session.reconnect_pending());

        // The delay is zero, so the next tick reopens the camera.
        session.tick(&mut presenter);
        assert!(session.is_capturing());
        assert!(!session.reconnect_pending());
    }

    #[test]
    fn test_reconnect_waits_for_delay() {
        let mut session = cpu_session::<FlakyCamera>(test_config(60_000));
        let mut presenter = MemoryPresenter::new();
        session.open_capture();

        assert!(tick_until(&mut session, &mut presenter, |o| matches!(
            o,
            TickOutcome::SourceUnavailable
        )));
        for _ in 0..3 {
            assert!(matches!(session.tick(&mut presenter), TickOutcome::SourceUnavailable));
        }
        assert!(!session.is_capturing());
        assert!(session.reconnect_pending());
    }

    #[test]
    fn test_overrides_survive_reload() {
        let file = test_config(3000);
        let overrides = ConfigOverrides {
            device_index: Some(1),
            backend: Some(BackendKind::Cpu),
            ..ConfigOverrides::default()
        };
        let mut session = Session::<SteadyCamera>::new(file.clone(), overrides, None);
        assert_eq!(session.config().camera.device_index, 1);

        let edited = Config {
            scale: 0.5,
            backend: BackendKind::Gpu,
            ..file.clone()
        };
        assert!(session.apply_config(edited.clone()));
        assert_eq!(session.config().camera.device_index, 1);
        assert_eq!(session.config().backend, BackendKind::Cpu);
        assert_eq!(session.config().scale, 0.5);
        // The camera settings in effect did not change, so it was not reopened.
        assert!(!session.is_capturing());

        assert!(!session.apply_config(edited.clone()));

        let camera = CaptureConfig {
            fps: 60,
            ..edited.camera.clone()
        };
        let new_camera = Config { camera, ..edited };
        assert!(session.apply_config(new_camera));
        assert_eq!(session.config().camera.fps, 60);
        assert_eq!(session.config().camera.device_index, 1);
        assert!(session.is_capturing());
    }

    #[test]
    fn test_segmented_frames_feed_the_pipeline() {
        let mut session = cpu_session::<SteadyCamera>(test_config(3000));
        session.set_segmentation(Some(AsyncSegmentation::spawn(FirstColumnBackground).unwrap()));
        let mut presenter = MemoryPresenter::new();
        session.open_capture();

        assert!(tick_until(&mut session, &mut presenter, |o| matches!(o, TickOutcome::Presented)));
        let frame = presenter.last_frame().unwrap();
        assert_eq!((frame.width, frame.height), (4, 2));
        for y in 0..2 {
            assert_eq!(frame.pixel(0, y).unwrap()[3], 0);
            assert_eq!(frame.pixel(3, y), Some([255, 0, 0, 255]));
        }
    }

    #[test]
    fn test_color_dropper_updates_key() {
        let mut session = cpu_session::<SteadyCamera>(test_config(3000));
        let mut presenter = MemoryPresenter::new();
        session.open_capture();
        assert!(tick_until(&mut session, &mut presenter, |o| matches!(o, TickOutcome::Presented)));

        // 4x2 frame shown in an 8x4 window; (5, 1) lands on pixel (2, 0).
        session.pick_key_color((5.0, 1.0), (8, 4));
        assert_eq!(session.config().key.color.to_hex(), "#ff0000");
    }
}

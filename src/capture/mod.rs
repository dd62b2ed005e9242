//! Webcam capture backends and the background capture thread.

mod nokhwa_backend;

pub use nokhwa_backend::NokhwaCapture;

use crate::frame::Bitmap;
use crate::slot::LatestSlot;
use crate::source::VideoSource;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Trait for webcam capture backends.
pub trait CaptureBackend {
    /// Returns a list of available camera devices.
    fn list_devices() -> Result<Vec<CameraInfo>>
    where
        Self: Sized;

    /// Opens the camera with the specified configuration.
    fn open(config: CaptureConfig) -> Result<Self>
    where
        Self: Sized;

    /// Captures a single frame from the camera.
    fn capture_frame(&mut self) -> Result<Bitmap>;

    /// Returns the current frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Configuration for camera capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Camera device index
    pub device_index: u32,
    /// Desired frame width
    pub width: u32,
    /// Desired frame height
    pub height: u32,
    /// Desired frame rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Camera capture running on its own thread.
///
/// The thread publishes every decoded frame into a [`LatestSlot`]; the tick
/// reads the newest one without waiting. When the camera stops delivering, the
/// thread exits and the capture reports itself inactive.
pub struct AsyncCapture {
    frames: LatestSlot<Bitmap>,
    active: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    frame_size: (u32, u32),
    thread: Option<JoinHandle<()>>,
}

impl AsyncCapture {
    /// Opens the default (nokhwa) camera backend on a capture thread.
    pub fn new(config: CaptureConfig) -> Result<Self> {
        Self::spawn::<NokhwaCapture>(config)
    }

    /// Opens backend `B` on a capture thread. The backend is created on that
    /// thread, so it does not need to be `Send`.
    pub fn spawn<B: CaptureBackend + 'static>(config: CaptureConfig) -> Result<Self> {
        let frames = LatestSlot::new();
        let active = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = {
            let frames = frames.clone();
            let active = active.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("camera-capture".to_string())
                .spawn(move || {
                    let mut camera = match B::open(config) {
                        Ok(camera) => camera,
                        Err(e) => {
                            active.store(false, Ordering::SeqCst);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(camera.frame_size()));

                    while !stop.load(Ordering::SeqCst) {
                        match camera.capture_frame() {
                            Ok(frame) => {
                                frames.publish(frame);
                            }
                            Err(e) => {
                                error!("Camera stopped delivering frames: {}", e);
                                break;
                            }
                        }
                    }
                    active.store(false, Ordering::SeqCst);
                })?
        };

        let frame_size = ready_rx
            .recv()
            .map_err(|_| anyhow!("Capture thread exited before opening the camera"))??;
        info!("Capture thread running at {}x{}", frame_size.0, frame_size.1);

        Ok(Self {
            frames,
            active,
            stop,
            frame_size,
            thread: Some(thread),
        })
    }

    /// Returns the negotiated frame dimensions.
    pub fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    /// A handle on the frame slot, for consumers on other threads.
    pub fn frames(&self) -> LatestSlot<Bitmap> {
        self.frames.clone()
    }
}

impl VideoSource for AsyncCapture {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn latest_frame(&self) -> Option<Arc<Bitmap>> {
        self.frames.latest()
    }
}

impl Drop for AsyncCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

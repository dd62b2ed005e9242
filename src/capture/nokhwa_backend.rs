//! Nokhwa-based webcam capture backend.

use super::{CameraInfo, CaptureBackend, CaptureConfig};
use crate::frame::Bitmap;
use anyhow::{anyhow, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

/// Resolutions tried after the requested one, largest first.
const FALLBACK_RESOLUTIONS: &[(u32, u32)] = &[(1280, 720), (640, 480)];

/// Webcam capture using the nokhwa library.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

/// Candidate formats for opening the stream: the requested resolution first,
/// then the fallbacks, each in MJPEG, YUYV and NV12.
fn seed_formats(config: &CaptureConfig) -> Vec<CameraFormat> {
    let mut resolutions = vec![(config.width, config.height)];
    for fallback in FALLBACK_RESOLUTIONS {
        if !resolutions.contains(fallback) {
            resolutions.push(*fallback);
        }
    }

    let mut formats = Vec::new();
    for (width, height) in resolutions {
        for frame_format in [FrameFormat::MJPEG, FrameFormat::YUYV, FrameFormat::NV12] {
            formats.push(CameraFormat::new(Resolution::new(width, height), frame_format, config.fps));
        }
    }
    formats
}

impl CaptureBackend for NokhwaCapture {
    fn list_devices() -> Result<Vec<CameraInfo>> {
        let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto)?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0),
                name: d.human_name().to_string(),
            })
            .collect())
    }

    fn open(config: CaptureConfig) -> Result<Self> {
        // Some drivers accept the Camera object but refuse the stream, so a
        // seed only counts once open_stream succeeds.
        let mut camera = None;
        for seed in seed_formats(&config) {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
            if let Ok(mut cam) = Camera::new(CameraIndex::Index(config.device_index), requested) {
                if cam.open_stream().is_ok() {
                    tracing::info!("Camera stream opened with seed format: {:?}", seed);
                    camera = Some(cam);
                    break;
                }
            }
        }

        let camera = camera.ok_or_else(|| {
            anyhow!(
                "Could not open a stream on camera index {} with any standard format",
                config.device_index
            )
        })?;

        let resolution = camera.resolution();
        tracing::info!("Camera opened with resolution: {}", resolution);

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        })
    }

    fn capture_frame(&mut self) -> Result<Bitmap> {
        let frame = self.camera.frame()?;
        let decoded = frame.decode_image::<RgbFormat>()?;
        let (width, height) = (decoded.width(), decoded.height());
        if (width, height) != (self.width, self.height) {
            tracing::info!("Camera resolution changed to {}x{}", width, height);
            self.width = width;
            self.height = height;
        }
        Bitmap::from_rgb(width, height, decoded.as_raw())
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_formats_start_with_requested_resolution() {
        let config = CaptureConfig {
            device_index: 0,
            width: 1920,
            height: 1080,
            fps: 25,
        };
        let formats = seed_formats(&config);
        assert_eq!(formats.len(), 9);
        assert_eq!(formats[0].resolution(), Resolution::new(1920, 1080));
        assert!(formats.iter().all(|f| f.frame_rate() == 25));
    }

    #[test]
    fn test_seed_formats_do_not_repeat_fallbacks() {
        let formats = seed_formats(&CaptureConfig::default());
        // 1280x720 is both requested and a fallback.
        assert_eq!(formats.len(), 6);
    }
}

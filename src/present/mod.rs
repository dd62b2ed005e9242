//! Frame presenters: where finished frames go.

mod window;

pub use window::WindowPresenter;

use crate::frame::Bitmap;
use anyhow::{Context, Result};
use image::{imageops, RgbaImage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Trait for frame presenters.
pub trait FramePresenter {
    /// Draws `frame`, with `overlay` composited on top when given.
    fn present(&mut self, frame: &Bitmap, overlay: Option<&Overlay>) -> Result<()>;
}

/// Overlay image settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayConfig {
    /// Image file (any format the `image` crate decodes)
    pub path: PathBuf,
    /// Left edge in frame pixels; may be negative
    #[serde(default)]
    pub x: i64,
    /// Top edge in frame pixels; may be negative
    #[serde(default)]
    pub y: i64,
}

/// A static image drawn over every frame at a fixed position.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub image: RgbaImage,
    pub x: i64,
    pub y: i64,
}

impl Overlay {
    pub fn load(config: &OverlayConfig) -> Result<Self> {
        let image = image::open(&config.path)
            .with_context(|| format!("Failed to load overlay {:?}", config.path))?
            .to_rgba8();
        info!(
            "Loaded overlay {:?} ({}x{}) at ({}, {})",
            config.path,
            image.width(),
            image.height(),
            config.x,
            config.y
        );
        Ok(Self {
            image,
            x: config.x,
            y: config.y,
        })
    }
}

/// Alpha-composites `overlay` over `frame`. Parts outside the frame are clipped.
pub fn compose(frame: &Bitmap, overlay: Option<&Overlay>) -> Result<Bitmap> {
    let Some(overlay) = overlay else {
        return Ok(frame.clone());
    };
    let mut canvas = frame.to_image()?;
    imageops::overlay(&mut canvas, &overlay.image, overlay.x, overlay.y);
    Ok(Bitmap::from_image(canvas))
}

/// Maps a cursor position in a `window` sized surface to the pixel of a
/// `frame` sized bitmap stretched over it.
pub fn window_to_frame(position: (f64, f64), window: (u32, u32), frame: (u32, u32)) -> Option<(u32, u32)> {
    let (px, py) = position;
    if window.0 == 0 || window.1 == 0 || px < 0.0 || py < 0.0 {
        return None;
    }
    let x = (px * frame.0 as f64 / window.0 as f64).floor() as u32;
    let y = (py * frame.1 as f64 / window.1 as f64).floor() as u32;
    (x < frame.0 && y < frame.1).then_some((x, y))
}

/// Keeps the last presented frame in memory. Used for headless runs.
#[derive(Default)]
pub struct MemoryPresenter {
    last: Option<Bitmap>,
    presented: u64,
}

impl MemoryPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_frame(&self) -> Option<&Bitmap> {
        self.last.as_ref()
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }
}

impl FramePresenter for MemoryPresenter {
    fn present(&mut self, frame: &Bitmap, overlay: Option<&Overlay>) -> Result<()> {
        self.last = Some(compose(frame, overlay)?);
        self.presented += 1;
        Ok(())
    }
}

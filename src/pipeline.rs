//! The per-tick driver: source, keying, filters, presenter.

use crate::backend::Backend;
use crate::error::PipelineError;
use crate::filters::{Filter, FilterChain};
use crate::frame::Bitmap;
use crate::keying::{ChromaKey, ChromaKeyCompositor, KeyColor};
use crate::present::{FramePresenter, Overlay};
use crate::source::{get_frame, CropRect, FrameSource};
use anyhow::Result;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-frame parameters. Swapped wholesale on config reload.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectSettings {
    pub crop: CropRect,
    pub scale: f32,
    pub flip_x: bool,
    pub flip_y: bool,
    pub key: ChromaKey,
    pub filters: Vec<Filter>,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            crop: CropRect::default(),
            scale: 1.0,
            flip_x: true,
            flip_y: false,
            key: ChromaKey::default(),
            filters: Vec::new(),
        }
    }
}

/// What happened during one tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// A frame reached the presenter.
    Presented,
    /// The frame had no pixels (degenerate crop or scale); nothing was drawn.
    Empty,
    /// The frame was dropped; the next tick tries again.
    Skipped(PipelineError),
    /// The video source is gone. The driving loop owns reconnection.
    SourceUnavailable,
}

pub struct EffectPipeline {
    keyer: ChromaKeyCompositor,
    filters: FilterChain,
    settings: EffectSettings,
    overlay: Option<Overlay>,
    /// The cropped, mirrored, scaled source of the last rendered frame
    last_source: Option<Bitmap>,
}

impl EffectPipeline {
    pub fn new(settings: EffectSettings) -> Self {
        Self {
            keyer: ChromaKeyCompositor::new(),
            filters: FilterChain::new(),
            settings,
            overlay: None,
            last_source: None,
        }
    }

    /// Initializes the keying and filter stages on `backend`.
    pub fn initialize(&mut self, backend: &Backend) -> Result<()> {
        self.keyer.initialize(backend)?;
        self.filters.initialize(backend)?;
        info!("Effect pipeline initialized");
        Ok(())
    }

    pub fn settings(&self) -> &EffectSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: EffectSettings) {
        self.settings = settings;
    }

    pub fn set_overlay(&mut self, overlay: Option<Overlay>) {
        self.overlay = overlay;
    }

    pub fn set_key_color(&mut self, color: KeyColor) {
        self.settings.key.color = color;
    }

    /// Color of the last source frame at `(x, y)`, for the color dropper.
    pub fn sample_source(&self, x: u32, y: u32) -> Option<KeyColor> {
        let [r, g, b, _] = self.last_source.as_ref()?.pixel(x, y)?;
        Some(KeyColor::from_rgb8([r, g, b]))
    }

    /// Size of the last source frame.
    pub fn source_size(&self) -> Option<(u32, u32)> {
        self.last_source.as_ref().map(|b| (b.width, b.height))
    }

    /// Runs one frame through the stages and hands it to `presenter`.
    /// Failures are reported in the outcome, never propagated.
    pub fn tick(&mut self, source: FrameSource<'_>, presenter: &mut dyn FramePresenter) -> TickOutcome {
        let start = Instant::now();
        let frame = match self.render(source) {
            Ok(frame) => frame,
            Err(PipelineError::SourceUnavailable) => return TickOutcome::SourceUnavailable,
            Err(e) => {
                match e {
                    PipelineError::FrameNotReady | PipelineError::UninitializedBackend => {
                        debug!("Skipping frame: {}", e)
                    }
                    _ => warn!("Skipping frame: {}", e),
                }
                return TickOutcome::Skipped(e);
            }
        };
        if frame.is_empty() {
            return TickOutcome::Empty;
        }

        if let Err(e) = presenter.present(&frame, self.overlay.as_ref()) {
            error!("Failed to present frame: {}", e);
            return TickOutcome::Skipped(PipelineError::Backend(e));
        }
        debug!(
            "[Perf] Frame {}x{} processed in {:.2}ms",
            frame.width,
            frame.height,
            start.elapsed().as_secs_f64() * 1000.0
        );
        TickOutcome::Presented
    }

    fn render(&mut self, source: FrameSource<'_>) -> Result<Bitmap, PipelineError> {
        let s = &self.settings;
        let source_frame = get_frame(source, s.crop, s.scale, s.flip_x, s.flip_y)?;
        if source_frame.is_empty() {
            return Ok(source_frame);
        }
        let keyed = self.keyer.update(&source_frame, &s.key)?;
        let filtered = self.filters.apply(keyed, &s.filters)?;
        self.last_source = Some(source_frame);
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::MemoryPresenter;
    use crate::source::VideoSource;
    use std::sync::Arc;

    struct DeadVideo;

    impl VideoSource for DeadVideo {
        fn is_active(&self) -> bool {
            false
        }

        fn latest_frame(&self) -> Option<Arc<Bitmap>> {
            None
        }
    }

    fn unflipped() -> EffectSettings {
        EffectSettings {
            flip_x: false,
            key: ChromaKey {
                color: KeyColor::GREEN,
                similarity: 0.1,
                smoothness: 0.05,
                spill: 0.0,
            },
            ..EffectSettings::default()
        }
    }

    fn cpu_pipeline(settings: EffectSettings) -> EffectPipeline {
        let mut pipeline = EffectPipeline::new(settings);
        pipeline.initialize(&Backend::Cpu).unwrap();
        pipeline
    }

    /// Left column green, right column red.
    fn green_red() -> Bitmap {
        let mut data = Vec::new();
        for _ in 0..2 {
            data.extend_from_slice(&[0, 255, 0, 255, 255, 0, 0, 255]);
        }
        Bitmap::from_data(2, 2, data).unwrap()
    }

    #[test]
    fn test_inactive_source_reports_unavailable() {
        let mut pipeline = cpu_pipeline(unflipped());
        let mut presenter = MemoryPresenter::new();
        let outcome = pipeline.tick(FrameSource::Video(&DeadVideo), &mut presenter);
        assert!(matches!(outcome, TickOutcome::SourceUnavailable));
        assert_eq!(presenter.frames_presented(), 0);
    }

    #[test]
    fn test_green_is_keyed_and_red_kept() {
        let mut pipeline = cpu_pipeline(unflipped());
        let mut presenter = MemoryPresenter::new();
        let source = green_red();
        let outcome = pipeline.tick(FrameSource::Still(&source), &mut presenter);
        assert!(matches!(outcome, TickOutcome::Presented));

        let out = presenter.last_frame().unwrap();
        for y in 0..2 {
            assert_eq!(out.pixel(0, y), Some([0, 255, 0, 0]));
            assert_eq!(out.pixel(1, y), Some([255, 0, 0, 255]));
        }
    }

    #[test]
    fn test_mirroring_applies_before_keying() {
        let mut pipeline = cpu_pipeline(EffectSettings {
            flip_x: true,
            ..unflipped()
        });
        let mut presenter = MemoryPresenter::new();
        pipeline.tick(FrameSource::Still(&green_red()), &mut presenter);
        let out = presenter.last_frame().unwrap();
        assert_eq!(out.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(1, 0).unwrap()[3], 0);
    }

    #[test]
    fn test_filters_run_after_keying() {
        let mut pipeline = cpu_pipeline(EffectSettings {
            filters: vec![Filter::HueSaturation {
                hue: 0.0,
                saturation: -1.0,
            }],
            ..unflipped()
        });
        let mut presenter = MemoryPresenter::new();
        pipeline.tick(FrameSource::Still(&green_red()), &mut presenter);
        let out = presenter.last_frame().unwrap();
        // Still transparent where keyed, gray where kept.
        assert_eq!(out.pixel(0, 0).unwrap()[3], 0);
        assert_eq!(out.pixel(1, 0), Some([85, 85, 85, 255]));
    }

    #[test]
    fn test_uninitialized_pipeline_skips() {
        let mut pipeline = EffectPipeline::new(unflipped());
        let mut presenter = MemoryPresenter::new();
        let outcome = pipeline.tick(FrameSource::Still(&green_red()), &mut presenter);
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(PipelineError::UninitializedBackend)
        ));
        assert!(presenter.last_frame().is_none());
    }

    #[test]
    fn test_degenerate_crop_draws_nothing() {
        let mut pipeline = cpu_pipeline(EffectSettings {
            crop: CropRect {
                left: 100,
                ..CropRect::default()
            },
            ..unflipped()
        });
        let mut presenter = MemoryPresenter::new();
        let source = Bitmap::solid(50, 10, [0, 0, 0, 255]);
        let outcome = pipeline.tick(FrameSource::Still(&source), &mut presenter);
        assert!(matches!(outcome, TickOutcome::Empty));
        assert_eq!(presenter.frames_presented(), 0);
    }

    #[test]
    fn test_oversized_scale_draws_nothing() {
        let mut pipeline = cpu_pipeline(EffectSettings {
            scale: 1.0e10,
            ..unflipped()
        });
        let mut presenter = MemoryPresenter::new();
        let outcome = pipeline.tick(FrameSource::Still(&green_red()), &mut presenter);
        assert!(matches!(outcome, TickOutcome::Empty));
        assert_eq!(presenter.frames_presented(), 0);
    }

    #[test]
    fn test_color_dropper_samples_source() {
        let mut pipeline = cpu_pipeline(unflipped());
        assert!(pipeline.sample_source(0, 0).is_none());
        let mut presenter = MemoryPresenter::new();
        pipeline.tick(FrameSource::Still(&green_red()), &mut presenter);

        let picked = pipeline.sample_source(1, 0).unwrap();
        assert_eq!(picked.to_hex(), "#ff0000");
        assert_eq!(pipeline.source_size(), Some((2, 2)));

        pipeline.set_key_color(picked);
        pipeline.tick(FrameSource::Still(&green_red()), &mut presenter);
        let out = presenter.last_frame().unwrap();
        assert_eq!(out.pixel(1, 0).unwrap()[3], 0);
        assert_eq!(out.pixel(0, 0).unwrap()[3], 255);
    }
}

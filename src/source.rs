//! Frame source adapter: turns a live video handle or a still bitmap into the
//! cropped, mirrored and scaled bitmap the rest of the pipeline works on.

use crate::error::PipelineError;
use crate::frame::Bitmap;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A video producer the adapter can sample once per tick.
pub trait VideoSource {
    /// False once the stream has ended or the device went away.
    fn is_active(&self) -> bool;

    /// The most recent decoded frame, if any has arrived yet.
    fn latest_frame(&self) -> Option<Arc<Bitmap>>;
}

/// Where this tick's pixels come from.
pub enum FrameSource<'a> {
    /// A live camera stream.
    Video(&'a dyn VideoSource),
    /// A bitmap produced elsewhere, e.g. by the segmentation worker.
    Still(&'a Bitmap),
}

/// Pixels to trim from each edge of the source before scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CropRect {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl CropRect {
    /// Checks that the crop leaves at least one pixel of a `width`x`height`
    /// source, returning the remaining size.
    pub fn validate(&self, width: u32, height: u32) -> Result<(u32, u32), PipelineError> {
        let horizontal = self.left as u64 + self.right as u64;
        let vertical = self.top as u64 + self.bottom as u64;
        if horizontal >= width as u64 || vertical >= height as u64 {
            return Err(PipelineError::DegenerateCrop {
                left: self.left,
                right: self.right,
                top: self.top,
                bottom: self.bottom,
                width,
                height,
            });
        }
        Ok((width - self.left - self.right, height - self.top - self.bottom))
    }
}

/// Largest width or height the adapter will produce. Larger outputs are
/// skipped like a degenerate crop.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// Output size for a cropped region of `width`x`height` scaled by `scale`.
pub fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    if !scale.is_finite() || scale <= 0.0 {
        return (0, 0);
    }
    let scale = scale as f64;
    (
        (width as f64 * scale).round() as u32,
        (height as f64 * scale).round() as u32,
    )
}

/// Produces this tick's frame.
///
/// Order of operations is crop, then mirror, then scale. A crop that leaves
/// nothing, or a scale that rounds a side to zero or past
/// [`MAX_FRAME_DIMENSION`], yields [`Bitmap::empty`] rather than an error; the
/// caller skips drawing it.
pub fn get_frame(
    source: FrameSource<'_>,
    crop: CropRect,
    scale: f32,
    flip_x: bool,
    flip_y: bool,
) -> Result<Bitmap, PipelineError> {
    let video_frame;
    let bitmap: &Bitmap = match source {
        FrameSource::Video(video) => {
            if !video.is_active() {
                return Err(PipelineError::SourceUnavailable);
            }
            video_frame = video.latest_frame().ok_or(PipelineError::FrameNotReady)?;
            &*video_frame
        }
        FrameSource::Still(bitmap) => bitmap,
    };

    if bitmap.is_empty() {
        return Ok(Bitmap::empty());
    }

    let (crop_w, crop_h) = match crop.validate(bitmap.width, bitmap.height) {
        Ok(size) => size,
        Err(e) => {
            debug!("Skipping frame: {}", e);
            return Ok(Bitmap::empty());
        }
    };

    let (out_w, out_h) = scaled_size(crop_w, crop_h, scale);
    if out_w == 0 || out_h == 0 {
        debug!("Skipping frame: scale {} collapses {}x{}", scale, crop_w, crop_h);
        return Ok(Bitmap::empty());
    }
    if out_w > MAX_FRAME_DIMENSION || out_h > MAX_FRAME_DIMENSION {
        debug!(
            "Skipping frame: scale {} grows {}x{} past {} pixels",
            scale, crop_w, crop_h, MAX_FRAME_DIMENSION
        );
        return Ok(Bitmap::empty());
    }

    let full = bitmap.to_image()?;
    let mut image = imageops::crop_imm(&full, crop.left, crop.top, crop_w, crop_h).to_image();
    if flip_x {
        imageops::flip_horizontal_in_place(&mut image);
    }
    if flip_y {
        imageops::flip_vertical_in_place(&mut image);
    }
    if (out_w, out_h) != (crop_w, crop_h) {
        image = imageops::resize(&image, out_w, out_h, FilterType::Triangle);
    }

    Ok(Bitmap::from_image(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeVideo {
        active: bool,
        frame: Option<Arc<Bitmap>>,
        reads: Cell<u32>,
    }

    impl VideoSource for FakeVideo {
        fn is_active(&self) -> bool {
            self.active
        }

        fn latest_frame(&self) -> Option<Arc<Bitmap>> {
            self.reads.set(self.reads.get() + 1);
            self.frame.clone()
        }
    }

    /// 3x2 bitmap where each pixel's red channel is its index.
    fn indexed_bitmap() -> Bitmap {
        let mut data = Vec::new();
        for i in 0..6u8 {
            data.extend_from_slice(&[i, 0, 0, 255]);
        }
        Bitmap::from_data(3, 2, data).unwrap()
    }

    #[test]
    fn test_output_dimensions_follow_crop_and_scale() {
        let source = Bitmap::solid(64, 48, [1, 2, 3, 255]);
        let cases = [
            (CropRect::default(), 1.0, (64, 48)),
            (CropRect { left: 4, right: 8, top: 2, bottom: 6 }, 1.0, (52, 40)),
            (CropRect { left: 4, right: 8, top: 2, bottom: 6 }, 2.0, (104, 80)),
            (CropRect { left: 0, right: 32, top: 0, bottom: 24 }, 0.5, (16, 12)),
            (CropRect { left: 63, right: 0, top: 0, bottom: 47 }, 3.0, (3, 3)),
        ];
        for (crop, scale, expected) in cases {
            let frame = get_frame(FrameSource::Still(&source), crop, scale, false, false).unwrap();
            assert_eq!((frame.width, frame.height), expected, "crop {:?} scale {}", crop, scale);
            assert_eq!(frame.data.len(), (expected.0 * expected.1 * 4) as usize);
        }
    }

    #[test]
    fn test_degenerate_crop_yields_empty_frame() {
        let source = Bitmap::solid(50, 20, [0, 0, 0, 255]);
        let crop = CropRect { left: 100, right: 0, top: 0, bottom: 0 };
        let frame = get_frame(FrameSource::Still(&source), crop, 1.0, true, false).unwrap();
        assert!(frame.is_empty());

        // Exactly consuming the width is degenerate too.
        let crop = CropRect { left: 25, right: 25, top: 0, bottom: 0 };
        assert!(get_frame(FrameSource::Still(&source), crop, 1.0, false, false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_crop_validate_reports_degenerate_crop() {
        let crop = CropRect { left: 0, right: 0, top: 10, bottom: 10 };
        assert!(matches!(
            crop.validate(30, 20),
            Err(PipelineError::DegenerateCrop { height: 20, .. })
        ));
        assert_eq!(crop.validate(30, 21).unwrap(), (30, 1));
    }

    #[test]
    fn test_non_positive_scale_yields_empty_frame() {
        let source = Bitmap::solid(8, 8, [0, 0, 0, 255]);
        for scale in [0.0, -1.0, f32::NAN] {
            let frame = get_frame(FrameSource::Still(&source), CropRect::default(), scale, false, false).unwrap();
            assert!(frame.is_empty());
        }
    }

    #[test]
    fn test_oversized_scale_yields_empty_frame() {
        let source = Bitmap::solid(2, 2, [0, 0, 0, 255]);
        for scale in [1.0e10, f32::MAX, 4097.0] {
            let frame = get_frame(FrameSource::Still(&source), CropRect::default(), scale, false, false).unwrap();
            assert!(frame.is_empty(), "scale {}", scale);
        }

        let wide = Bitmap::solid(MAX_FRAME_DIMENSION, 1, [0, 0, 0, 255]);
        let frame = get_frame(FrameSource::Still(&wide), CropRect::default(), 1.0, false, false).unwrap();
        assert_eq!((frame.width, frame.height), (MAX_FRAME_DIMENSION, 1));
        let frame = get_frame(FrameSource::Still(&wide), CropRect::default(), 1.001, false, false).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_flip_mirrors_pixels() {
        let source = indexed_bitmap();
        let frame = get_frame(FrameSource::Still(&source), CropRect::default(), 1.0, true, false).unwrap();
        let reds: Vec<u8> = frame.pixels().map(|p| p[0]).collect();
        assert_eq!(reds, vec![2, 1, 0, 5, 4, 3]);

        let frame = get_frame(FrameSource::Still(&source), CropRect::default(), 1.0, false, true).unwrap();
        let reds: Vec<u8> = frame.pixels().map(|p| p[0]).collect();
        assert_eq!(reds, vec![3, 4, 5, 0, 1, 2]);
    }

    #[test]
    fn test_crop_happens_before_flip() {
        let source = indexed_bitmap();
        let crop = CropRect { left: 1, right: 0, top: 1, bottom: 0 };
        let frame = get_frame(FrameSource::Still(&source), crop, 1.0, true, false).unwrap();
        let reds: Vec<u8> = frame.pixels().map(|p| p[0]).collect();
        assert_eq!(reds, vec![5, 4]);
    }

    #[test]
    fn test_inactive_video_is_unavailable() {
        let video = FakeVideo {
            active: false,
            frame: Some(Arc::new(Bitmap::solid(2, 2, [0, 0, 0, 255]))),
            reads: Cell::new(0),
        };
        let result = get_frame(FrameSource::Video(&video), CropRect::default(), 1.0, false, false);
        assert!(matches!(result, Err(PipelineError::SourceUnavailable)));
        assert_eq!(video.reads.get(), 0);
    }

    #[test]
    fn test_video_without_frames_is_not_ready() {
        let video = FakeVideo {
            active: true,
            frame: None,
            reads: Cell::new(0),
        };
        let result = get_frame(FrameSource::Video(&video), CropRect::default(), 1.0, false, false);
        assert!(matches!(result, Err(PipelineError::FrameNotReady)));
    }

    #[test]
    fn test_video_frame_is_sampled() {
        let video = FakeVideo {
            active: true,
            frame: Some(Arc::new(Bitmap::solid(6, 4, [9, 9, 9, 255]))),
            reads: Cell::new(0),
        };
        let frame = get_frame(FrameSource::Video(&video), CropRect::default(), 0.5, false, false).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(frame.pixel(0, 0), Some([9, 9, 9, 255]));
    }
}

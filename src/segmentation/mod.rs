//! Person matting with MODNet on ONNX Runtime, run on a worker thread.
//!
//! The worker turns camera frames into "pre-segmented" bitmaps whose alpha is
//! the predicted matte. The pipeline reads them back as still frames.

use crate::frame::Bitmap;
use crate::slot::LatestSlot;
use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma, Rgba};
use ndarray::{Array4, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// MODNet input size.
const MODEL_WIDTH: u32 = 512;
const MODEL_HEIGHT: u32 = 512;

/// Segmentation settings. Without a model path the camera feed is keyed directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmentationConfig {
    /// Path to a MODNet ONNX model
    pub model_path: Option<PathBuf>,
}

/// Produces a matte for a frame: one byte per pixel, 255 = foreground.
pub trait Matting {
    fn predict(&mut self, frame: &Bitmap) -> Result<GrayImage>;
}

/// Placement of a `width`x`height` frame scaled to fit the model input:
/// `(scaled_width, scaled_height, x_offset, y_offset)`.
pub fn letterbox(width: u32, height: u32) -> (u32, u32, u32, u32) {
    let ratio = (MODEL_WIDTH as f32 / width as f32).min(MODEL_HEIGHT as f32 / height as f32);
    let new_width = ((width as f32 * ratio).round() as u32).clamp(1, MODEL_WIDTH);
    let new_height = ((height as f32 * ratio).round() as u32).clamp(1, MODEL_HEIGHT);
    (
        new_width,
        new_height,
        (MODEL_WIDTH - new_width) / 2,
        (MODEL_HEIGHT - new_height) / 2,
    )
}

/// Multiplies the source alpha by the matte ("source-in"). A matte of a
/// different size is stretched to the source first.
pub fn apply_mask(source: &Bitmap, mask: &GrayImage) -> Bitmap {
    let resized;
    let mask = if mask.dimensions() == (source.width, source.height) {
        mask
    } else {
        resized = imageops::resize(mask, source.width, source.height, FilterType::Triangle);
        &resized
    };

    let mut out = source.clone();
    for (px, m) in out.data.chunks_exact_mut(4).zip(mask.as_raw()) {
        px[3] = ((px[3] as u32 * *m as u32 + 127) / 255) as u8;
    }
    out
}

pub struct SegmentationEngine {
    session: Session,
}

impl SegmentationEngine {
    /// Initializes the ONNX Runtime environment. Call once at startup.
    pub fn init() -> Result<()> {
        ort::init().with_name("chromacam").commit();
        Ok(())
    }

    /// Loads the model, or returns `None` if the file does not exist.
    pub fn load(model_path: &Path) -> Result<Option<Self>> {
        if !model_path.exists() {
            warn!("Segmentation model not found at {:?}; keying the raw camera feed", model_path);
            return Ok(None);
        }

        info!("Loading segmentation model from {:?}", model_path);
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;

        Ok(Some(Self { session }))
    }
}

impl Matting for SegmentationEngine {
    fn predict(&mut self, frame: &Bitmap) -> Result<GrayImage> {
        if frame.is_empty() {
            return Err(anyhow!("Cannot segment an empty frame"));
        }
        let img = DynamicImage::ImageRgba8(frame.to_image()?);

        // Fit inside the model input, centred, padded with black.
        let (new_width, new_height, x_offset, y_offset) = letterbox(frame.width, frame.height);
        let resized = img.resize_exact(new_width, new_height, FilterType::Triangle);
        let mut padded = ImageBuffer::from_pixel(MODEL_WIDTH, MODEL_HEIGHT, Rgba([0, 0, 0, 0]));
        imageops::overlay(&mut padded, &resized, x_offset as i64, y_offset as i64);

        // NCHW, normalized to [-1, 1].
        let mut input_tensor = Array4::<f32>::zeros((1, 3, MODEL_HEIGHT as usize, MODEL_WIDTH as usize));
        for (x, y, pixel) in padded.enumerate_pixels() {
            for c in 0..3 {
                input_tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - 0.5) / 0.5;
            }
        }

        let shape = input_tensor.shape().iter().map(|&x| x as i64).collect::<Vec<_>>();
        let data = input_tensor.into_raw_vec();
        let input_value = Value::from_array((shape, data))?;
        let outputs = self.session.run(ort::inputs!["input" => &input_value])?;

        // Matte of shape [1, 1, 512, 512].
        let (shape, data) = outputs["output"].try_extract_tensor::<f32>()?;
        if shape.len() != 4 {
            return Err(anyhow!("Unexpected matte shape {:?}", shape));
        }
        let matte = Array4::from_shape_vec(
            (shape[0] as usize, shape[1] as usize, shape[2] as usize, shape[3] as usize),
            data.to_vec(),
        )?;

        let batch = matte.index_axis(Axis(0), 0);
        let channel = batch.index_axis(Axis(0), 0);
        let mut mask = GrayImage::new(MODEL_WIDTH, MODEL_HEIGHT);
        for (y, row) in channel.outer_iter().enumerate() {
            for (x, val) in row.iter().enumerate() {
                if x < MODEL_WIDTH as usize && y < MODEL_HEIGHT as usize {
                    mask.put_pixel(x as u32, y as u32, Luma([(val.clamp(0.0, 1.0) * 255.0) as u8]));
                }
            }
        }

        let cropped = imageops::crop_imm(&mask, x_offset, y_offset, new_width, new_height).to_image();
        Ok(imageops::resize(&cropped, frame.width, frame.height, FilterType::Triangle))
    }
}

/// Runs a [`Matting`] model on its own thread.
///
/// Frames go in through a channel of depth one: a frame submitted while the
/// worker is still busy is dropped. Results land in a [`LatestSlot`].
pub struct AsyncSegmentation {
    input: Option<SyncSender<Arc<Bitmap>>>,
    output: LatestSlot<Bitmap>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncSegmentation {
    pub fn spawn<M: Matting + Send + 'static>(mut model: M) -> Result<Self> {
        let (input, frames) = mpsc::sync_channel::<Arc<Bitmap>>(1);
        let output = LatestSlot::new();

        let thread = {
            let output = output.clone();
            thread::Builder::new()
                .name("segmentation".to_string())
                .spawn(move || {
                    while let Ok(frame) = frames.recv() {
                        match model.predict(&frame) {
                            Ok(mask) => {
                                if output.publish(apply_mask(&frame, &mask)) {
                                    debug!("Segmented frame dropped before it was presented");
                                }
                            }
                            Err(e) => warn!("Segmentation failed: {}", e),
                        }
                    }
                    debug!("Segmentation worker exiting");
                })?
        };

        Ok(Self {
            input: Some(input),
            output,
            thread: Some(thread),
        })
    }

    /// Hands a frame to the worker. Returns false if the worker was busy and
    /// the frame was dropped.
    pub fn submit(&self, frame: Arc<Bitmap>) -> bool {
        let Some(input) = &self.input else {
            return false;
        };
        match input.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                warn!("Segmentation worker is gone");
                false
            }
        }
    }

    /// The newest segmented frame, if any.
    pub fn latest(&self) -> Option<Arc<Bitmap>> {
        self.output.latest()
    }

    /// Frames overwritten before they were read.
    pub fn dropped(&self) -> u64 {
        self.output.dropped()
    }
}

impl Drop for AsyncSegmentation {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.input.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

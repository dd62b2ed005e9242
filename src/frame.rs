//! RGBA bitmap type passed between pipeline stages.

use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Converts an 8-bit channel to [0, 1].
#[inline]
pub fn unorm(v: u8) -> f32 {
    v as f32 / 255.0
}

/// Converts a [0, 1] channel to 8 bits the way an `Rgba8Unorm` render target
/// stores it: clamped, then rounded to nearest.
#[inline]
pub fn quantize(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// A CPU-addressable RGBA8 image.
///
/// A 0x0 bitmap is the pipeline's "nothing to draw" value (see [`Bitmap::empty`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Tightly packed RGBA rows, top row first
    pub data: Vec<u8>,
}

impl Bitmap {
    /// Creates a transparent black bitmap.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// The zero-size bitmap.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Creates a bitmap filled with a single color.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * BYTES_PER_PIXEL);
        for _ in 0..count {
            data.extend_from_slice(&rgba);
        }
        Self { width, height, data }
    }

    /// Wraps existing RGBA data.
    pub fn from_data(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(anyhow!(
                "RGBA buffer for {}x{} must be {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self { width, height, data })
    }

    /// Expands packed RGB (as delivered by the camera decoder) to opaque RGBA.
    pub fn from_rgb(width: u32, height: u32, rgb: &[u8]) -> Result<Self> {
        let pixel_count = width as usize * height as usize;
        if rgb.len() != pixel_count * 3 {
            return Err(anyhow!(
                "RGB buffer for {}x{} must be {} bytes, got {}",
                width,
                height,
                pixel_count * 3,
                rgb.len()
            ));
        }
        let mut data = vec![255u8; pixel_count * BYTES_PER_PIXEL];
        for (dst, src) in data.chunks_exact_mut(4).zip(rgb.chunks_exact(3)) {
            dst[..3].copy_from_slice(src);
        }
        Ok(Self { width, height, data })
    }

    /// True when the bitmap has no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the pixel at `(x, y)`, or `None` outside the bitmap.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    /// Iterates over the pixels in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = [u8; 4]> + '_ {
        self.data
            .chunks_exact(BYTES_PER_PIXEL)
            .map(|p| [p[0], p[1], p[2], p[3]])
    }

    /// Converts into an `image` buffer without copying.
    pub fn into_image(self) -> Result<RgbaImage> {
        let (width, height) = (self.width, self.height);
        RgbaImage::from_raw(width, height, self.data)
            .ok_or_else(|| anyhow!("Bitmap data does not match {}x{}", width, height))
    }

    /// Copies into an `image` buffer.
    pub fn to_image(&self) -> Result<RgbaImage> {
        self.clone().into_image()
    }

    /// Wraps an `image` buffer without copying.
    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Two triangles covering clip space. Texture row 0 maps to the top edge.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_rgba_conversion() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = Bitmap::from_rgb(2, 2, &rgb_data).unwrap();

        assert_eq!(frame.data.len(), 16);
        assert_eq!(frame.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(1, 0), Some([0, 255, 0, 255]));
        assert_eq!(frame.pixel(1, 1), Some([255, 255, 255, 255]));
    }

    #[test]
    fn test_from_data_rejects_wrong_length() {
        assert!(Bitmap::from_data(2, 2, vec![0; 15]).is_err());
        assert!(Bitmap::from_data(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_quantize_matches_unorm_storage() {
        for v in [0u8, 1, 127, 128, 254, 255] {
            assert_eq!(quantize(unorm(v)), v);
        }
        assert_eq!(quantize(-0.5), 0);
        assert_eq!(quantize(1.5), 255);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_empty_bitmap() {
        let empty = Bitmap::empty();
        assert!(empty.is_empty());
        assert!(empty.data.is_empty());
        assert_eq!(empty.pixel(0, 0), None);
    }

    #[test]
    fn test_image_round_trip_keeps_pixels() {
        let frame = Bitmap::solid(3, 2, [10, 20, 30, 40]);
        let image = frame.to_image().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(Bitmap::from_image(image), frame);
    }
}

//! Chroma-key compositor.
//!
//! Keys out a designated color by comparing each pixel's chroma (U, V) with
//! the key's, with a smoothstep ramp for soft edges and spill suppression that
//! pulls translucent edge pixels toward gray. The GPU keyer runs the same math
//! in WGSL; [`key_pixel`] is the CPU reference both are tested against.

mod wgpu_keyer;

pub use wgpu_keyer::WgpuKeyer;

use crate::backend::{Backend, StageState};
use crate::error::PipelineError;
use crate::frame::{quantize, unorm, Bitmap};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Luma weights used for spill desaturation (Rec. 709).
const LUMA_WEIGHTS: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// The color to key out, as RGB in [0, 1]. Parsed from and written as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl KeyColor {
    pub const GREEN: KeyColor = KeyColor { r: 0.0, g: 1.0, b: 0.0 };

    /// Parses `#RRGGBB` (case-insensitive).
    pub fn from_hex(value: &str) -> Result<Self, PipelineError> {
        let malformed = || PipelineError::MalformedKeyColor {
            value: value.to_string(),
        };
        let digits = value.strip_prefix('#').ok_or_else(malformed)?;
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| malformed());
        Ok(Self::from_rgb8([channel(0)?, channel(2)?, channel(4)?]))
    }

    pub fn from_rgb8(rgb: [u8; 3]) -> Self {
        Self {
            r: unorm(rgb[0]),
            g: unorm(rgb[1]),
            b: unorm(rgb[2]),
        }
    }

    pub fn rgb(&self) -> [f32; 3] {
        [self.r, self.g, self.b]
    }

    /// Formats as lowercase `#rrggbb`.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", quantize(self.r), quantize(self.g), quantize(self.b))
    }
}

impl FromStr for KeyColor {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for KeyColor {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<KeyColor> for String {
    fn from(color: KeyColor) -> Self {
        color.to_hex()
    }
}

impl fmt::Display for KeyColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Key color plus the three shaping parameters.
///
/// `similarity`, `smoothness` and `spill` are meant to lie in [0, 1]. Values
/// outside that range are passed through unchanged; they produce fully keyed
/// or fully opaque output rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChromaKey {
    pub color: KeyColor,
    /// Chroma distance below which a pixel is fully transparent
    pub similarity: f32,
    /// Width of the soft edge above `similarity`
    pub smoothness: f32,
    /// How strongly partially keyed pixels are pulled toward gray
    pub spill: f32,
}

impl Default for ChromaKey {
    fn default() -> Self {
        Self {
            color: KeyColor::GREEN,
            similarity: 0.4,
            smoothness: 0.08,
            spill: 0.1,
        }
    }
}

/// Chroma-only projection of an RGB color.
pub fn rgb_to_uv(rgb: [f32; 3]) -> [f32; 2] {
    let [r, g, b] = rgb;
    [
        r * -0.169 + g * -0.331 + b * 0.5 + 0.5,
        r * 0.5 + g * -0.419 + b * -0.081 + 0.5,
    ]
}

/// Hermite interpolation between `edge0` and `edge1`, as in GLSL/WGSL.
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Opacity for a pixel at chroma distance `d` from the key: 0 at or below
/// `similarity`, 1 at or above `similarity + smoothness`, smooth in between.
pub fn key_mask(d: f32, similarity: f32, smoothness: f32) -> f32 {
    let upper = similarity + smoothness;
    if d <= similarity {
        return 0.0;
    }
    if d >= upper {
        return 1.0;
    }
    smoothstep(similarity, upper, d)
}

/// Keys a single RGBA pixel with channels in [0, 1].
///
/// Spill only touches pixels on the soft edge (`0 < mask < 1`); fully keyed
/// and fully opaque pixels keep their RGB.
pub fn key_pixel(rgba: [f32; 4], key: &ChromaKey) -> [f32; 4] {
    let rgb = [rgba[0], rgba[1], rgba[2]];
    let [pu, pv] = rgb_to_uv(rgb);
    let [ku, kv] = rgb_to_uv(key.color.rgb());
    let d = ((pu - ku).powi(2) + (pv - kv).powi(2)).sqrt();
    let mask = key_mask(d, key.similarity, key.smoothness);

    let luma = (rgb[0] * LUMA_WEIGHTS[0] + rgb[1] * LUMA_WEIGHTS[1] + rgb[2] * LUMA_WEIGHTS[2]).clamp(0.0, 1.0);
    let spill = if mask > 0.0 {
        (key.spill * (1.0 - mask)).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mix = |c: f32| c * (1.0 - spill) + luma * spill;

    [mix(rgb[0]), mix(rgb[1]), mix(rgb[2]), mask * rgba[3]]
}

/// A keying implementation.
pub trait Keyer {
    /// Keys `source`, returning a bitmap of the same size whose alpha carries the mask.
    fn key(&mut self, source: &Bitmap, key: &ChromaKey) -> Result<Bitmap>;
}

/// Applies [`key_pixel`] to every pixel on the CPU.
pub struct CpuKeyer;

impl Keyer for CpuKeyer {
    fn key(&mut self, source: &Bitmap, key: &ChromaKey) -> Result<Bitmap> {
        let mut out = source.clone();
        for px in out.data.chunks_exact_mut(4) {
            let keyed = key_pixel([unorm(px[0]), unorm(px[1]), unorm(px[2]), unorm(px[3])], key);
            for (dst, v) in px.iter_mut().zip(keyed) {
                *dst = quantize(v);
            }
        }
        Ok(out)
    }
}

/// The keying stage: `Uninitialized` until a backend is attached, then `Ready`.
///
/// Not safe to share between logical pipelines; each owns its compositor and
/// drives it from a single thread.
pub struct ChromaKeyCompositor {
    state: StageState<Box<dyn Keyer>>,
}

impl ChromaKeyCompositor {
    pub fn new() -> Self {
        Self {
            state: StageState::Uninitialized,
        }
    }

    /// One-time setup on `backend`. Calling it again replaces the keyer.
    pub fn initialize(&mut self, backend: &Backend) -> Result<()> {
        let keyer: Box<dyn Keyer> = match backend {
            Backend::Cpu => Box::new(CpuKeyer),
            Backend::Gpu(context) => Box::new(WgpuKeyer::new(context.clone())?),
        };
        info!("Chroma-key stage ready ({:?} backend)", backend.kind());
        self.state = StageState::Ready(keyer);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Keys `source` with `key`.
    pub fn update(&mut self, source: &Bitmap, key: &ChromaKey) -> Result<Bitmap, PipelineError> {
        let keyer = self.state.ready_mut().ok_or(PipelineError::UninitializedBackend)?;
        if source.is_empty() {
            return Ok(Bitmap::empty());
        }
        Ok(keyer.key(source, key)?)
    }
}

impl Default for ChromaKeyCompositor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_compositor() -> ChromaKeyCompositor {
        let mut compositor = ChromaKeyCompositor::new();
        compositor.initialize(&Backend::Cpu).unwrap();
        compositor
    }

    fn green_key(similarity: f32, smoothness: f32, spill: f32) -> ChromaKey {
        ChromaKey {
            color: KeyColor::from_hex("#00FF00").unwrap(),
            similarity,
            smoothness,
            spill,
        }
    }

    #[test]
    fn test_parse_hex_key_color() {
        let color = KeyColor::from_hex("#00ff80").unwrap();
        assert_eq!(color.r, 0.0);
        assert_eq!(color.g, 1.0);
        assert!((color.b - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(color.to_hex(), "#00ff80");
        assert_eq!("#ABCDEF".parse::<KeyColor>().unwrap().to_hex(), "#abcdef");
    }

    #[test]
    fn test_malformed_key_colors_are_rejected() {
        for bad in ["00ff00", "#00ff0", "#00ff000", "#00gg00", "", "#", "#+1ff00", "#ééé"] {
            let err = KeyColor::from_hex(bad).unwrap_err();
            assert!(
                matches!(err, PipelineError::MalformedKeyColor { ref value } if value == bad),
                "{:?} should be malformed",
                bad
            );
        }
    }

    #[test]
    fn test_uv_of_gray_is_centered() {
        let [u, v] = rgb_to_uv([0.5, 0.5, 0.5]);
        assert!((u - 0.5).abs() < 1e-3);
        assert!((v - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_key_mask_ramp() {
        assert_eq!(key_mask(0.05, 0.1, 0.1), 0.0);
        assert_eq!(key_mask(0.1, 0.1, 0.1), 0.0);
        assert_eq!(key_mask(0.25, 0.1, 0.1), 1.0);
        assert!((key_mask(0.15, 0.1, 0.1) - 0.5).abs() < 1e-5);

        // Zero smoothness is a hard threshold, never NaN.
        assert_eq!(key_mask(0.0, 0.0, 0.0), 0.0);
        assert_eq!(key_mask(0.01, 0.0, 0.0), 1.0);
        // Negative smoothness degenerates to the same threshold.
        assert_eq!(key_mask(0.2, 0.1, -0.5), 1.0);
    }

    #[test]
    fn test_keying_far_colors_is_identity() {
        let mut data = Vec::new();
        for px in [[255, 0, 0, 255], [0, 0, 255, 255], [128, 128, 128, 255], [250, 240, 10, 255]] {
            data.extend_from_slice(&px);
        }
        let source = Bitmap::from_data(2, 2, data).unwrap();
        let keyed = cpu_compositor().update(&source, &green_key(0.1, 0.05, 0.5)).unwrap();
        assert_eq!(keyed, source);
    }

    #[test]
    fn test_exact_key_color_is_fully_transparent() {
        let source = Bitmap::solid(3, 3, [0, 255, 0, 255]);
        let keyed = cpu_compositor().update(&source, &green_key(0.0, 0.0, 0.1)).unwrap();
        assert!(keyed.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_green_on_green_keys_out_without_touching_rgb() {
        let source = Bitmap::solid(2, 2, [0, 255, 0, 255]);
        let keyed = cpu_compositor().update(&source, &green_key(0.1, 0.05, 0.0)).unwrap();
        for p in keyed.pixels() {
            assert_eq!(p, [0, 255, 0, 0]);
        }
    }

    #[test]
    fn test_red_on_green_stays_opaque() {
        let source = Bitmap::solid(2, 2, [255, 0, 0, 255]);
        let keyed = cpu_compositor().update(&source, &green_key(0.1, 0.05, 0.0)).unwrap();
        for p in keyed.pixels() {
            assert_eq!(p, [255, 0, 0, 255]);
        }
    }

    #[test]
    fn test_spill_pulls_edge_pixels_toward_gray() {
        // A greenish pixel inside the soft edge.
        let pixel = [0.3, 0.7, 0.3, 1.0];
        let key = green_key(0.1, 0.4, 1.0);
        let keyed = key_pixel(pixel, &key);
        assert!(keyed[3] > 0.0 && keyed[3] < 1.0);

        let spread = |p: [f32; 4]| p[1] - p[0];
        assert!(spread(keyed) < spread(pixel));

        let unspilled = key_pixel(pixel, &ChromaKey { spill: 0.0, ..key });
        assert_eq!(&unspilled[..3], &pixel[..3]);
    }

    #[test]
    fn test_spill_leaves_fully_keyed_rgb_alone() {
        let source = Bitmap::solid(2, 2, [0, 255, 0, 255]);
        let keyed = cpu_compositor().update(&source, &green_key(0.1, 0.05, 1.0)).unwrap();
        for p in keyed.pixels() {
            assert_eq!(p, [0, 255, 0, 0]);
        }
    }

    #[test]
    fn test_source_alpha_is_preserved() {
        let source = Bitmap::solid(1, 1, [255, 0, 0, 0]);
        let keyed = cpu_compositor().update(&source, &ChromaKey::default()).unwrap();
        assert_eq!(keyed.pixel(0, 0).unwrap()[3], 0);
    }

    #[test]
    fn test_uninitialized_compositor_skips() {
        let mut compositor = ChromaKeyCompositor::new();
        assert!(!compositor.is_ready());
        let result = compositor.update(&Bitmap::solid(1, 1, [0, 0, 0, 255]), &ChromaKey::default());
        assert!(matches!(result, Err(PipelineError::UninitializedBackend)));
    }

    #[test]
    fn test_empty_source_yields_empty_output() {
        let keyed = cpu_compositor().update(&Bitmap::empty(), &ChromaKey::default()).unwrap();
        assert!(keyed.is_empty());
    }

    #[test]
    fn test_chroma_key_deserializes_hex_color() {
        let key: ChromaKey = serde_yaml::from_str("color: \"#0000ff\"\nsimilarity: 0.3\n").unwrap();
        assert_eq!(key.color, KeyColor { r: 0.0, g: 0.0, b: 1.0 });
        assert_eq!(key.similarity, 0.3);
        assert_eq!(key.smoothness, ChromaKey::default().smoothness);

        let err = serde_yaml::from_str::<ChromaKey>("color: lime\n").unwrap_err();
        assert!(err.to_string().contains("Malformed key color"));
    }
}

//! CPU reference kernels.
//!
//! Each function mirrors the WGSL entry point of the same name: texel fetches
//! clamp to the edge and every pass is quantized back to RGBA8.

use super::{FilterRunner, Kernel, Pass, MAX_BLUR_RADIUS, MAX_UNSHARP_RADIUS};
use crate::frame::{quantize, unorm, Bitmap};
use anyhow::Result;

type Rgba = [f32; 4];

/// Runs passes one after another on the CPU.
pub struct CpuFilterRunner;

impl FilterRunner for CpuFilterRunner {
    fn run(&mut self, source: Bitmap, passes: &[Pass], seed: f32) -> Result<Bitmap> {
        Ok(passes.iter().fold(source, |frame, pass| run_pass(&frame, pass, seed)))
    }
}

/// A bitmap unpacked to floats for neighbourhood access.
struct Texels {
    width: i64,
    height: i64,
    data: Vec<Rgba>,
}

impl Texels {
    fn new(bitmap: &Bitmap) -> Self {
        Self {
            width: bitmap.width as i64,
            height: bitmap.height as i64,
            data: bitmap
                .pixels()
                .map(|p| [unorm(p[0]), unorm(p[1]), unorm(p[2]), unorm(p[3])])
                .collect(),
        }
    }

    fn fetch(&self, x: i64, y: i64) -> Rgba {
        let x = x.clamp(0, self.width - 1);
        let y = y.clamp(0, self.height - 1);
        self.data[(y * self.width + x) as usize]
    }
}

/// Runs a single pass.
pub fn run_pass(source: &Bitmap, pass: &Pass, seed: f32) -> Bitmap {
    if source.is_empty() {
        return source.clone();
    }
    let texels = Texels::new(source);
    let p = pass.params;
    let mut data = Vec::with_capacity(source.data.len());
    for y in 0..texels.height {
        for x in 0..texels.width {
            let out = match pass.kernel {
                Kernel::Sepia => sepia(texels.fetch(x, y), p[0]),
                Kernel::BrightnessContrast => brightness_contrast(texels.fetch(x, y), p[0], p[1]),
                Kernel::Vibrance => vibrance(texels.fetch(x, y), p[0]),
                Kernel::HueSaturation => hue_saturation(texels.fetch(x, y), p[0], p[1]),
                Kernel::Denoise => denoise(&texels, x, y, p[0]),
                Kernel::Noise => noise(texels.fetch(x, y), x, y, p[0], seed),
                Kernel::Ink => ink(&texels, x, y, p[0]),
                Kernel::TriangleBlur => triangle_blur(&texels, x, y, p[0], (p[1] as i64, p[2] as i64)),
                Kernel::UnsharpMask => unsharp_mask(&texels, x, y, p[0], p[1]),
                Kernel::Posterize => posterize(texels.fetch(x, y), p[0]),
            };
            data.extend(out.map(quantize));
        }
    }
    Bitmap {
        width: source.width,
        height: source.height,
        data,
    }
}

fn dot3(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn mix(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

/// Pixel radius the way the shaders compute it: round half up, then cap.
fn tap_radius(radius: f32, max: f32) -> i64 {
    (radius.max(0.0) + 0.5).floor().min(max) as i64
}

fn sepia(c: Rgba, amount: f32) -> Rgba {
    let a = amount.clamp(0.0, 1.0);
    let [r, g, b, alpha] = c;
    [
        (r * (1.0 - 0.607 * a) + g * (0.769 * a) + b * (0.189 * a)).min(1.0),
        (r * (0.349 * a) + g * (1.0 - 0.314 * a) + b * (0.168 * a)).min(1.0),
        (r * (0.272 * a) + g * (0.534 * a) + b * (1.0 - 0.869 * a)).min(1.0),
        alpha,
    ]
}

fn brightness_contrast(c: Rgba, brightness: f32, contrast: f32) -> Rgba {
    let brightness = brightness.clamp(-1.0, 1.0);
    let contrast = contrast.clamp(-1.0, 0.999);
    let adjust = |v: f32| {
        let v = v + brightness;
        if contrast > 0.0 {
            (v - 0.5) / (1.0 - contrast) + 0.5
        } else {
            (v - 0.5) * (1.0 + contrast) + 0.5
        }
    };
    [adjust(c[0]), adjust(c[1]), adjust(c[2]), c[3]]
}

fn vibrance(c: Rgba, amount: f32) -> Rgba {
    let amount = amount.clamp(-1.0, 1.0);
    let average = (c[0] + c[1] + c[2]) / 3.0;
    let mx = c[0].max(c[1]).max(c[2]);
    let amt = (mx - average) * (-amount * 3.0);
    [mix(c[0], mx, amt), mix(c[1], mx, amt), mix(c[2], mx, amt), c[3]]
}

fn hue_saturation(c: Rgba, hue: f32, saturation: f32) -> Rgba {
    let hue = hue.clamp(-1.0, 1.0);
    let saturation = saturation.clamp(-1.0, 1.0);
    let angle = hue * std::f32::consts::PI;
    let (s, co) = angle.sin_cos();
    let sqrt3 = 3.0f32.sqrt();
    let w = [
        (2.0 * co + 1.0) / 3.0,
        (-sqrt3 * s - co + 1.0) / 3.0,
        (sqrt3 * s - co + 1.0) / 3.0,
    ];
    let rgb = [c[0], c[1], c[2]];
    let mut out = [
        dot3(rgb, [w[0], w[1], w[2]]),
        dot3(rgb, [w[2], w[0], w[1]]),
        dot3(rgb, [w[1], w[2], w[0]]),
    ];

    let average = (out[0] + out[1] + out[2]) / 3.0;
    let factor = if saturation > 0.0 {
        1.0 - 1.0 / (1.001 - saturation)
    } else {
        -saturation
    };
    for v in &mut out {
        *v += (average - *v) * factor;
    }
    [out[0], out[1], out[2], c[3]]
}

fn denoise(t: &Texels, x: i64, y: i64, exponent: f32) -> Rgba {
    let exponent = exponent.max(0.0);
    let center = t.fetch(x, y);
    let mut color = [0.0f32; 4];
    let mut total = 0.0;
    for dy in -4..=4 {
        for dx in -4..=4 {
            let sample = t.fetch(x + dx, y + dy);
            let diff = [sample[0] - center[0], sample[1] - center[1], sample[2] - center[2]];
            let weight = (1.0 - dot3(diff, [0.25; 3]).abs()).powf(exponent);
            for (acc, v) in color.iter_mut().zip(sample) {
                *acc += v * weight;
            }
            total += weight;
        }
    }
    color.map(|v| v / total)
}

/// Hash noise in [0, 1) for a pixel centre.
fn random(px: f32, py: f32, seed: f32) -> f32 {
    let v = ((px * 12.9898 + py * 78.233).sin() + seed) * 43758.5453;
    v - v.floor()
}

fn noise(c: Rgba, x: i64, y: i64, amount: f32, seed: f32) -> Rgba {
    let amount = amount.clamp(0.0, 1.0);
    let diff = (random(x as f32 + 0.5, y as f32 + 0.5, seed) - 0.5) * amount;
    [c[0] + diff, c[1] + diff, c[2] + diff, c[3]]
}

fn ink(t: &Texels, x: i64, y: i64, strength: f32) -> Rgba {
    let strength = strength.clamp(0.0, 1.0);
    let mut big = [0.0f32; 3];
    let mut small = [0.0f32; 3];
    for dy in -2i64..=2 {
        for dx in -2i64..=2 {
            let sample = t.fetch(x + dx, y + dy);
            for i in 0..3 {
                big[i] += sample[i];
            }
            if dx.abs() + dy.abs() < 2 {
                for i in 0..3 {
                    small[i] += sample[i];
                }
            }
        }
    }
    let edge = [0, 1, 2].map(|i| (big[i] / 25.0 - small[i] / 5.0).max(0.0));
    let darken = dot3(edge, edge) * strength.powi(5) * 100000.0;
    let c = t.fetch(x, y);
    [c[0] - darken, c[1] - darken, c[2] - darken, c[3]]
}

/// Accumulates a premultiplied sample.
fn accumulate(color: &mut Rgba, sample: Rgba, weight: f32) {
    let a = sample[3];
    color[0] += sample[0] * a * weight;
    color[1] += sample[1] * a * weight;
    color[2] += sample[2] * a * weight;
    color[3] += a * weight;
}

/// Normalizes a premultiplied sum back to straight alpha.
fn resolve(color: Rgba, total: f32) -> Rgba {
    let a = color[3] / total;
    let unpremultiply = |v: f32| (v / total) / (a + 0.00001);
    [unpremultiply(color[0]), unpremultiply(color[1]), unpremultiply(color[2]), a]
}

fn triangle_blur(t: &Texels, x: i64, y: i64, radius: f32, dir: (i64, i64)) -> Rgba {
    let r = tap_radius(radius, MAX_BLUR_RADIUS);
    let mut color = [0.0f32; 4];
    let mut total = 0.0;
    for i in -r..=r {
        let weight = (r + 1 - i.abs()) as f32;
        accumulate(&mut color, t.fetch(x + dir.0 * i, y + dir.1 * i), weight);
        total += weight;
    }
    resolve(color, total)
}

fn unsharp_mask(t: &Texels, x: i64, y: i64, radius: f32, strength: f32) -> Rgba {
    let r = tap_radius(radius, MAX_UNSHARP_RADIUS);
    let strength = strength.max(0.0);
    let mut color = [0.0f32; 4];
    let mut total = 0.0;
    for dy in -r..=r {
        for dx in -r..=r {
            let weight = ((r + 1 - dx.abs()) * (r + 1 - dy.abs())) as f32;
            accumulate(&mut color, t.fetch(x + dx, y + dy), weight);
            total += weight;
        }
    }
    let blurred = resolve(color, total);
    let original = t.fetch(x, y);
    [0, 1, 2, 3].map(|i| mix(blurred[i], original[i], 1.0 + strength))
}

fn posterize(c: Rgba, levels: f32) -> Rgba {
    let levels = levels.max(1.0);
    let step = |v: f32| ((v.max(0.0).powf(0.99) * levels).floor() / levels).powf(1.0 / 0.99);
    [step(c[0]), step(c[1]), step(c[2]), c[3]]
}

//! Filter chain executor.
//!
//! A [`Filter`] is what the configuration names; each one expands into one or
//! more [`Pass`]es, the unit both runners execute. Passes run in order, each
//! reading the previous pass's RGBA8 output.

mod cpu;
mod wgpu_chain;

pub use cpu::{run_pass, CpuFilterRunner};
pub use wgpu_chain::WgpuFilterChain;

use crate::backend::{Backend, StageState};
use crate::error::PipelineError;
use crate::frame::Bitmap;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Largest triangle blur radius, in pixels.
pub const MAX_BLUR_RADIUS: f32 = 64.0;

/// Largest unsharp mask radius. The mask blurs in a single 2D pass.
pub const MAX_UNSHARP_RADIUS: f32 = 8.0;

/// One stage of the filter chain with its parameters.
///
/// In YAML each entry is a single-key map, e.g. `- sepia: 0.5` or
/// `- brightness_contrast: { brightness: 0.1, contrast: 0.2 }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Sepia tone, amount in [0, 1]
    Sepia(f32),
    /// Brightness in [-1, 1], contrast in (-1, 1)
    BrightnessContrast {
        #[serde(default)]
        brightness: f32,
        #[serde(default)]
        contrast: f32,
    },
    /// Boosts (positive) or mutes (negative) less saturated colors
    Vibrance(f32),
    /// Hue rotation and saturation, both in [-1, 1]
    HueSaturation {
        #[serde(default)]
        hue: f32,
        #[serde(default)]
        saturation: f32,
    },
    /// Edge-preserving smoothing; higher exponents preserve more detail.
    ///
    /// 0 disables the filter. glfx's `denoise(0)` instead weights every
    /// neighbour equally, a 9x9 box blur run twice.
    Denoise(f32),
    /// Random per-pixel brightness noise, amount in [0, 1]
    Noise(f32),
    /// Darkens edges like an ink outline, strength in [0, 1]
    Ink(f32),
    /// Triangle-weighted blur radius in pixels
    TriangleBlur(f32),
    /// Sharpens by subtracting a blurred copy
    UnsharpMask {
        radius: f32,
        #[serde(default)]
        strength: f32,
    },
    /// Number of levels per channel. 0 disables.
    Posterize(f32),
}

impl Filter {
    /// True when the filter leaves every pixel unchanged and can be skipped.
    pub fn is_neutral(&self) -> bool {
        match *self {
            Filter::Sepia(amount) => amount == 0.0,
            Filter::BrightnessContrast { brightness, contrast } => brightness == 0.0 && contrast == 0.0,
            Filter::Vibrance(amount) => amount == 0.0,
            Filter::HueSaturation { hue, saturation } => hue == 0.0 && saturation == 0.0,
            Filter::Denoise(exponent) => exponent <= 0.0,
            Filter::Noise(amount) => amount == 0.0,
            Filter::Ink(strength) => strength <= 0.0,
            Filter::TriangleBlur(radius) => radius < 0.5,
            Filter::UnsharpMask { radius, strength } => radius < 0.5 || strength == 0.0,
            Filter::Posterize(levels) => levels <= 0.0,
        }
    }

    /// Expands the filter into the passes that implement it.
    pub fn passes(&self) -> Vec<Pass> {
        match *self {
            Filter::Sepia(amount) => vec![Pass::new(Kernel::Sepia, [amount, 0.0, 0.0, 0.0])],
            Filter::BrightnessContrast { brightness, contrast } => {
                vec![Pass::new(Kernel::BrightnessContrast, [brightness, contrast, 0.0, 0.0])]
            }
            Filter::Vibrance(amount) => vec![Pass::new(Kernel::Vibrance, [amount, 0.0, 0.0, 0.0])],
            Filter::HueSaturation { hue, saturation } => {
                vec![Pass::new(Kernel::HueSaturation, [hue, saturation, 0.0, 0.0])]
            }
            Filter::Denoise(exponent) => vec![Pass::new(Kernel::Denoise, [exponent, 0.0, 0.0, 0.0]); 2],
            Filter::Noise(amount) => vec![Pass::new(Kernel::Noise, [amount, 0.0, 0.0, 0.0])],
            Filter::Ink(strength) => vec![Pass::new(Kernel::Ink, [strength, 0.0, 0.0, 0.0])],
            Filter::TriangleBlur(radius) => vec![
                Pass::new(Kernel::TriangleBlur, [radius, 1.0, 0.0, 0.0]),
                Pass::new(Kernel::TriangleBlur, [radius, 0.0, 1.0, 0.0]),
            ],
            Filter::UnsharpMask { radius, strength } => {
                vec![Pass::new(Kernel::UnsharpMask, [radius, strength, 0.0, 0.0])]
            }
            Filter::Posterize(levels) => vec![Pass::new(Kernel::Posterize, [levels, 0.0, 0.0, 0.0])],
        }
    }
}

/// A fragment kernel. Each has one WGSL entry point and one CPU implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Sepia,
    BrightnessContrast,
    Vibrance,
    HueSaturation,
    Denoise,
    Noise,
    Ink,
    /// One axis of a separable blur; params are (radius, dx, dy)
    TriangleBlur,
    UnsharpMask,
    Posterize,
}

impl Kernel {
    pub const ALL: [Kernel; 10] = [
        Kernel::Sepia,
        Kernel::BrightnessContrast,
        Kernel::Vibrance,
        Kernel::HueSaturation,
        Kernel::Denoise,
        Kernel::Noise,
        Kernel::Ink,
        Kernel::TriangleBlur,
        Kernel::UnsharpMask,
        Kernel::Posterize,
    ];

    /// Fragment entry point in the filter shader module.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Kernel::Sepia => "fs_sepia",
            Kernel::BrightnessContrast => "fs_brightness_contrast",
            Kernel::Vibrance => "fs_vibrance",
            Kernel::HueSaturation => "fs_hue_saturation",
            Kernel::Denoise => "fs_denoise",
            Kernel::Noise => "fs_noise",
            Kernel::Ink => "fs_ink",
            Kernel::TriangleBlur => "fs_triangle_blur",
            Kernel::UnsharpMask => "fs_unsharp_mask",
            Kernel::Posterize => "fs_posterize",
        }
    }
}

/// A kernel invocation with its four parameter slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pass {
    pub kernel: Kernel,
    pub params: [f32; 4],
}

impl Pass {
    pub fn new(kernel: Kernel, params: [f32; 4]) -> Self {
        Self { kernel, params }
    }
}

/// Executes a sequence of passes.
pub trait FilterRunner {
    /// Runs `passes` over `source` in order. `seed` feeds the noise kernel.
    fn run(&mut self, source: Bitmap, passes: &[Pass], seed: f32) -> Result<Bitmap>;
}

/// The filter stage. Until [`FilterChain::initialize`] succeeds it passes
/// frames through untouched.
pub struct FilterChain {
    state: StageState<Box<dyn FilterRunner>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            state: StageState::Uninitialized,
        }
    }

    pub fn initialize(&mut self, backend: &Backend) -> Result<()> {
        let runner: Box<dyn FilterRunner> = match backend {
            Backend::Cpu => Box::new(CpuFilterRunner),
            Backend::Gpu(context) => Box::new(WgpuFilterChain::new(context.clone())?),
        };
        info!("Filter chain ready ({:?} backend)", backend.kind());
        self.state = StageState::Ready(runner);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Applies `filters` in order, skipping neutral ones.
    pub fn apply(&mut self, bitmap: Bitmap, filters: &[Filter]) -> Result<Bitmap, PipelineError> {
        let Some(runner) = self.state.ready_mut() else {
            return Ok(bitmap);
        };
        if bitmap.is_empty() {
            return Ok(bitmap);
        }

        let passes: Vec<Pass> = filters
            .iter()
            .filter(|f| !f.is_neutral())
            .flat_map(Filter::passes)
            .collect();
        if passes.is_empty() {
            return Ok(bitmap);
        }

        Ok(runner.run(bitmap, &passes, rand::random::<f32>())?)
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

//! GPU filter chain.
//!
//! All kernels live in one WGSL module with one render pipeline per entry
//! point. Passes ping-pong between two textures; each pass reads its
//! parameters from its own slot of a shared uniform buffer, selected with a
//! dynamic offset.

use super::{FilterRunner, Kernel, Pass};
use crate::frame::Bitmap;
use crate::shader::{self, GpuContext, QuadBuffers, Readback};
use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) const FILTER_FRAGMENTS: &str = r#"
struct FilterUniforms {
    params: vec4<f32>,
    size: vec2<f32>,
    seed: f32,
    _pad: f32,
}

@group(0) @binding(0) var t_source: texture_2d<f32>;
@group(0) @binding(1) var<uniform> u: FilterUniforms;

fn fetch(p: vec2<i32>) -> vec4<f32> {
    let max_p = vec2<i32>(u.size) - vec2<i32>(1, 1);
    return textureLoad(t_source, clamp(p, vec2<i32>(0, 0), max_p), 0);
}

fn tap_radius(radius: f32, max_radius: f32) -> i32 {
    return i32(min(floor(max(radius, 0.0) + 0.5), max_radius));
}

fn premultiply(c: vec4<f32>) -> vec4<f32> {
    return vec4<f32>(c.rgb * c.a, c.a);
}

fn resolve(sum: vec4<f32>, total: f32) -> vec4<f32> {
    let c = sum / total;
    return vec4<f32>(c.rgb / (c.a + 0.00001), c.a);
}

@fragment
fn fs_sepia(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = fetch(vec2<i32>(frag_coord.xy));
    let a = clamp(u.params.x, 0.0, 1.0);
    let c = color.rgb;
    let r = min(1.0, c.r * (1.0 - 0.607 * a) + c.g * (0.769 * a) + c.b * (0.189 * a));
    let g = min(1.0, c.r * (0.349 * a) + c.g * (1.0 - 0.314 * a) + c.b * (0.168 * a));
    let b = min(1.0, c.r * (0.272 * a) + c.g * (0.534 * a) + c.b * (1.0 - 0.869 * a));
    return vec4<f32>(r, g, b, color.a);
}

@fragment
fn fs_brightness_contrast(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = fetch(vec2<i32>(frag_coord.xy));
    let brightness = clamp(u.params.x, -1.0, 1.0);
    let contrast = clamp(u.params.y, -1.0, 0.999);
    var rgb = color.rgb + brightness;
    if (contrast > 0.0) {
        rgb = (rgb - 0.5) / (1.0 - contrast) + 0.5;
    } else {
        rgb = (rgb - 0.5) * (1.0 + contrast) + 0.5;
    }
    return vec4<f32>(rgb, color.a);
}

@fragment
fn fs_vibrance(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = fetch(vec2<i32>(frag_coord.xy));
    let amount = clamp(u.params.x, -1.0, 1.0);
    let average = (color.r + color.g + color.b) / 3.0;
    let mx = max(color.r, max(color.g, color.b));
    let amt = (mx - average) * (-amount * 3.0);
    return vec4<f32>(mix(color.rgb, vec3<f32>(mx), amt), color.a);
}

@fragment
fn fs_hue_saturation(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = fetch(vec2<i32>(frag_coord.xy));
    let hue = clamp(u.params.x, -1.0, 1.0);
    let saturation = clamp(u.params.y, -1.0, 1.0);
    let angle = hue * 3.14159265;
    let s = sin(angle);
    let c = cos(angle);
    let w = (vec3<f32>(2.0 * c, -sqrt(3.0) * s - c, sqrt(3.0) * s - c) + 1.0) / 3.0;
    var rgb = vec3<f32>(dot(color.rgb, w.xyz), dot(color.rgb, w.zxy), dot(color.rgb, w.yzx));
    let average = (rgb.r + rgb.g + rgb.b) / 3.0;
    if (saturation > 0.0) {
        rgb += (average - rgb) * (1.0 - 1.0 / (1.001 - saturation));
    } else {
        rgb += (average - rgb) * (-saturation);
    }
    return vec4<f32>(rgb, color.a);
}

@fragment
fn fs_denoise(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(frag_coord.xy);
    let exponent = max(u.params.x, 0.0);
    let center = fetch(p);
    var color = vec4<f32>(0.0);
    var total = 0.0;
    for (var y = -4; y <= 4; y++) {
        for (var x = -4; x <= 4; x++) {
            let texel = fetch(p + vec2<i32>(x, y));
            let weight = pow(1.0 - abs(dot(texel.rgb - center.rgb, vec3<f32>(0.25))), exponent);
            color += texel * weight;
            total += weight;
        }
    }
    return color / total;
}

fn random(co: vec2<f32>, seed: f32) -> f32 {
    return fract((sin(dot(co, vec2<f32>(12.9898, 78.233))) + seed) * 43758.5453);
}

@fragment
fn fs_noise(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = fetch(vec2<i32>(frag_coord.xy));
    let amount = clamp(u.params.x, 0.0, 1.0);
    let diff = (random(frag_coord.xy, u.seed) - 0.5) * amount;
    return vec4<f32>(color.rgb + diff, color.a);
}

@fragment
fn fs_ink(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(frag_coord.xy);
    let strength = clamp(u.params.x, 0.0, 1.0);
    var big = vec3<f32>(0.0);
    var small = vec3<f32>(0.0);
    for (var y = -2; y <= 2; y++) {
        for (var x = -2; x <= 2; x++) {
            let texel = fetch(p + vec2<i32>(x, y)).rgb;
            big += texel;
            if (abs(x) + abs(y) < 2) {
                small += texel;
            }
        }
    }
    let edge = max(vec3<f32>(0.0), big / 25.0 - small / 5.0);
    let s2 = strength * strength;
    let color = fetch(p);
    return vec4<f32>(color.rgb - dot(edge, edge) * s2 * s2 * strength * 100000.0, color.a);
}

@fragment
fn fs_triangle_blur(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(frag_coord.xy);
    let r = tap_radius(u.params.x, 64.0);
    let dir = vec2<i32>(u.params.yz);
    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var i = -r; i <= r; i++) {
        let weight = f32(r + 1 - abs(i));
        sum += premultiply(fetch(p + dir * i)) * weight;
        total += weight;
    }
    return resolve(sum, total);
}

@fragment
fn fs_unsharp_mask(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(frag_coord.xy);
    let r = tap_radius(u.params.x, 8.0);
    let strength = max(u.params.y, 0.0);
    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var y = -r; y <= r; y++) {
        for (var x = -r; x <= r; x++) {
            let weight = f32((r + 1 - abs(x)) * (r + 1 - abs(y)));
            sum += premultiply(fetch(p + vec2<i32>(x, y))) * weight;
            total += weight;
        }
    }
    return mix(resolve(sum, total), fetch(p), 1.0 + strength);
}

@fragment
fn fs_posterize(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = fetch(vec2<i32>(frag_coord.xy));
    let levels = max(u.params.x, 1.0);
    let c = pow(max(color.rgb, vec3<f32>(0.0)), vec3<f32>(0.99));
    return vec4<f32>(pow(floor(c * levels) / levels, vec3<f32>(1.0 / 0.99)), color.a);
}
"#;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct FilterUniforms {
    params: [f32; 4],
    size: [f32; 2],
    seed: f32,
    _pad: f32,
}

const UNIFORM_SIZE: u64 = std::mem::size_of::<FilterUniforms>() as u64;

/// Ping-pong targets and per-pass uniform slots for one frame size.
struct ChainResources {
    width: u32,
    height: u32,
    capacity: usize,
    textures: [wgpu::Texture; 2],
    views: [wgpu::TextureView; 2],
    /// `bind_groups[i]` samples `textures[i]`
    bind_groups: [wgpu::BindGroup; 2],
    uniform_buffer: wgpu::Buffer,
    readback: Readback,
}

pub struct WgpuFilterChain {
    gpu: Arc<GpuContext>,
    pipelines: HashMap<Kernel, wgpu::RenderPipeline>,
    bind_group_layout: wgpu::BindGroupLayout,
    quad: QuadBuffers,
    uniform_stride: u64,
    resources: Option<ChainResources>,
}

impl WgpuFilterChain {
    pub fn new(gpu: Arc<GpuContext>) -> Result<Self> {
        let device = &gpu.device;
        let module = shader::create_module(device, "Filter Shaders", shader::with_vertex_stage(FILTER_FRAGMENTS))?;

        let bind_group_layout = shader::source_uniform_layout(device, "Filter Bind Group Layout", UNIFORM_SIZE, true);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Filter Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipelines = Kernel::ALL
            .iter()
            .map(|kernel| {
                let pipeline = shader::create_quad_pipeline(
                    device,
                    &format!("Filter Pipeline {:?}", kernel),
                    &pipeline_layout,
                    &module,
                    kernel.entry_point(),
                    shader::TEXTURE_FORMAT,
                    None,
                );
                (*kernel, pipeline)
            })
            .collect();

        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let uniform_stride = UNIFORM_SIZE.div_ceil(alignment) * alignment;
        let quad = QuadBuffers::new(device, "Filter");

        Ok(Self {
            gpu,
            pipelines,
            bind_group_layout,
            quad,
            uniform_stride,
            resources: None,
        })
    }

    /// Rebuilds targets when the frame size changes and grows the uniform
    /// buffer when a chain has more passes than any before it.
    fn ensure_resources(&mut self, width: u32, height: u32, passes: usize) -> Result<()> {
        if let Some(r) = &self.resources {
            if r.width == width && r.height == height && r.capacity >= passes {
                return Ok(());
            }
        }
        shader::check_device_texture_size(&self.gpu.device, width, height)?;
        let capacity = self.resources.as_ref().map_or(0, |r| r.capacity).max(passes);
        info!("Filter chain resources resized to {}x{} ({} pass slots)", width, height, capacity);

        let device = &self.gpu.device;
        let usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        let textures = [
            shader::create_texture(device, "Filter Ping", width, height, usage),
            shader::create_texture(device, "Filter Pong", width, height, usage),
        ];
        let views = [
            textures[0].create_view(&wgpu::TextureViewDescriptor::default()),
            textures[1].create_view(&wgpu::TextureViewDescriptor::default()),
        ];
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Filter Uniform Buffer"),
            size: self.uniform_stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = |view: &wgpu::TextureView, label: &str| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &uniform_buffer,
                            offset: 0,
                            size: wgpu::BufferSize::new(UNIFORM_SIZE),
                        }),
                    },
                ],
            })
        };
        let bind_groups = [
            bind_group(&views[0], "Filter Ping Bind Group"),
            bind_group(&views[1], "Filter Pong Bind Group"),
        ];
        let readback = Readback::new(device, "Filter Readback", width, height);

        self.resources = Some(ChainResources {
            width,
            height,
            capacity,
            textures,
            views,
            bind_groups,
            uniform_buffer,
            readback,
        });
        Ok(())
    }
}

impl FilterRunner for WgpuFilterChain {
    fn run(&mut self, source: Bitmap, passes: &[Pass], seed: f32) -> Result<Bitmap> {
        if passes.is_empty() || source.is_empty() {
            return Ok(source);
        }
        self.ensure_resources(source.width, source.height, passes.len())?;
        let res = self
            .resources
            .as_ref()
            .ok_or_else(|| anyhow!("Filter chain resources missing"))?;
        let gpu = &self.gpu;

        shader::upload_bitmap(&gpu.queue, &res.textures[0], &source);

        let mut uniforms = vec![0u8; self.uniform_stride as usize * passes.len()];
        for (i, pass) in passes.iter().enumerate() {
            let slot = FilterUniforms {
                params: pass.params,
                size: [source.width as f32, source.height as f32],
                seed,
                _pad: 0.0,
            };
            let start = i * self.uniform_stride as usize;
            uniforms[start..start + UNIFORM_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&slot));
        }
        gpu.queue.write_buffer(&res.uniform_buffer, 0, &uniforms);

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Filter Encoder"),
        });
        for (i, pass) in passes.iter().enumerate() {
            let pipeline = self
                .pipelines
                .get(&pass.kernel)
                .ok_or_else(|| anyhow!("No pipeline for {:?}", pass.kernel))?;
            let read = i % 2;
            let write = 1 - read;
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Filter Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &res.views[write],
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &res.bind_groups[read], &[(i as u64 * self.uniform_stride) as u32]);
            self.quad.draw(&mut render_pass);
        }
        res.readback.copy_from(&mut encoder, &res.textures[passes.len() % 2]);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        debug!("[Perf] Filter chain ran {} passes", passes.len());
        res.readback.read(&gpu.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{CpuFilterRunner, Filter};

    #[test]
    fn test_filter_shaders_validate() {
        let module = shader::validate_wgsl(&shader::with_vertex_stage(FILTER_FRAGMENTS)).unwrap();
        for kernel in Kernel::ALL {
            assert!(
                module.entry_points.iter().any(|ep| ep.name == kernel.entry_point()),
                "missing entry point {}",
                kernel.entry_point()
            );
        }
    }

    #[test]
    fn test_filter_uniforms_fit_one_slot() {
        assert_eq!(UNIFORM_SIZE, 32);
        assert!(UNIFORM_SIZE <= 256);
    }

    fn gradient(width: u32, height: u32) -> Bitmap {
        let mut bitmap = Bitmap::new(width, height);
        for (i, px) in bitmap.data.chunks_exact_mut(4).enumerate() {
            let x = (i as u32 % width) as u8;
            let y = (i as u32 / width) as u8;
            px.copy_from_slice(&[x.wrapping_mul(37), y.wrapping_mul(51), 200 - x * 9, 255]);
        }
        bitmap
    }

    #[test]
    fn test_gpu_passes_match_cpu() {
        let Ok(gpu) = GpuContext::headless() else {
            return;
        };
        let mut gpu_chain = WgpuFilterChain::new(Arc::new(gpu)).unwrap();
        let mut cpu_chain = CpuFilterRunner;
        let source = gradient(6, 5);

        let filters = [
            Filter::Sepia(0.7),
            Filter::BrightnessContrast {
                brightness: 0.1,
                contrast: 0.3,
            },
            Filter::Vibrance(0.5),
            Filter::HueSaturation {
                hue: 0.25,
                saturation: -0.4,
            },
            Filter::TriangleBlur(2.0),
            Filter::UnsharpMask {
                radius: 2.0,
                strength: 1.5,
            },
        ];
        for filter in filters {
            let passes = filter.passes();
            let gpu_out = gpu_chain.run(source.clone(), &passes, 0.0).unwrap();
            let cpu_out = cpu_chain.run(source.clone(), &passes, 0.0).unwrap();
            assert_eq!((gpu_out.width, gpu_out.height), (cpu_out.width, cpu_out.height));
            for (i, (g, c)) in gpu_out.data.iter().zip(&cpu_out.data).enumerate() {
                assert!(g.abs_diff(*c) <= 1, "{:?}: byte {} differs: gpu {} cpu {}", filter, i, g, c);
            }
        }
    }
}

//! GPU chroma keyer: one fragment pass over the source texture.

use super::{ChromaKey, Keyer};
use crate::frame::Bitmap;
use crate::shader::{self, GpuContext, QuadBuffers, Readback};
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use tracing::info;

pub(crate) const KEY_FRAGMENT: &str = r#"
struct KeyUniforms {
    key_color: vec4<f32>,
    similarity: f32,
    smoothness: f32,
    spill: f32,
    _pad: f32,
}

@group(0) @binding(0) var t_source: texture_2d<f32>;
@group(0) @binding(1) var<uniform> u_key: KeyUniforms;

fn rgb_to_uv(rgb: vec3<f32>) -> vec2<f32> {
    return vec2<f32>(
        rgb.r * -0.169 + rgb.g * -0.331 + rgb.b * 0.5 + 0.5,
        rgb.r * 0.5 + rgb.g * -0.419 + rgb.b * -0.081 + 0.5,
    );
}

fn key_mask(d: f32) -> f32 {
    let upper = u_key.similarity + u_key.smoothness;
    if (d <= u_key.similarity) {
        return 0.0;
    }
    if (d >= upper) {
        return 1.0;
    }
    return smoothstep(u_key.similarity, upper, d);
}

@fragment
fn fs_key(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let color = textureLoad(t_source, vec2<i32>(frag_coord.xy), 0);
    let d = distance(rgb_to_uv(color.rgb), rgb_to_uv(u_key.key_color.rgb));
    let mask = key_mask(d);
    let luma = clamp(dot(color.rgb, vec3<f32>(0.2126, 0.7152, 0.0722)), 0.0, 1.0);
    let s = select(0.0, clamp(u_key.spill * (1.0 - mask), 0.0, 1.0), mask > 0.0);
    return vec4<f32>(mix(color.rgb, vec3<f32>(luma), s), mask * color.a);
}
"#;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct KeyUniforms {
    key_color: [f32; 4],
    similarity: f32,
    smoothness: f32,
    spill: f32,
    _pad: f32,
}

impl From<&ChromaKey> for KeyUniforms {
    fn from(key: &ChromaKey) -> Self {
        let [r, g, b] = key.color.rgb();
        Self {
            key_color: [r, g, b, 1.0],
            similarity: key.similarity,
            smoothness: key.smoothness,
            spill: key.spill,
            _pad: 0.0,
        }
    }
}

/// Size-dependent resources, rebuilt when the frame size changes.
struct FrameResources {
    width: u32,
    height: u32,
    source: wgpu::Texture,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    bind_group: wgpu::BindGroup,
    readback: Readback,
}

pub struct WgpuKeyer {
    gpu: Arc<GpuContext>,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    quad: QuadBuffers,
    frame: Option<FrameResources>,
}

impl WgpuKeyer {
    pub fn new(gpu: Arc<GpuContext>) -> Result<Self> {
        let device = &gpu.device;
        let module = shader::create_module(device, "Chroma Key Shader", shader::with_vertex_stage(KEY_FRAGMENT))?;

        let uniform_size = std::mem::size_of::<KeyUniforms>() as u64;
        let bind_group_layout = shader::source_uniform_layout(device, "Chroma Key Bind Group Layout", uniform_size, false);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Chroma Key Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let pipeline = shader::create_quad_pipeline(
            device,
            "Chroma Key Pipeline",
            &pipeline_layout,
            &module,
            "fs_key",
            shader::TEXTURE_FORMAT,
            None,
        );

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Chroma Key Uniform Buffer"),
            size: uniform_size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let quad = QuadBuffers::new(device, "Chroma Key");

        Ok(Self {
            gpu,
            pipeline,
            bind_group_layout,
            uniform_buffer,
            quad,
            frame: None,
        })
    }

    fn ensure_resources(&mut self, width: u32, height: u32) -> Result<()> {
        if matches!(&self.frame, Some(f) if f.width == width && f.height == height) {
            return Ok(());
        }
        shader::check_device_texture_size(&self.gpu.device, width, height)?;
        info!("Chroma key resources resized to {}x{}", width, height);

        let device = &self.gpu.device;
        let source = shader::create_texture(
            device,
            "Chroma Key Source",
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let target = shader::create_texture(
            device,
            "Chroma Key Target",
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let source_view = source.create_view(&wgpu::TextureViewDescriptor::default());
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Chroma Key Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
            ],
        });
        let readback = Readback::new(device, "Chroma Key Readback", width, height);

        self.frame = Some(FrameResources {
            width,
            height,
            source,
            target,
            target_view,
            bind_group,
            readback,
        });
        Ok(())
    }
}

impl Keyer for WgpuKeyer {
    fn key(&mut self, source: &Bitmap, key: &ChromaKey) -> Result<Bitmap> {
        self.ensure_resources(source.width, source.height)?;
        let Some(frame) = &self.frame else {
            return Ok(Bitmap::empty());
        };
        let gpu = &self.gpu;

        shader::upload_bitmap(&gpu.queue, &frame.source, source);
        gpu.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&KeyUniforms::from(key)));

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Chroma Key Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Chroma Key Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &frame.target_view,
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
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &frame.bind_group, &[]);
            self.quad.draw(&mut pass);
        }
        frame.readback.copy_from(&mut encoder, &frame.target);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        frame.readback.read(&gpu.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keying::{CpuKeyer, KeyColor};

    #[test]
    fn test_key_shader_validates() {
        let module = shader::validate_wgsl(&shader::with_vertex_stage(KEY_FRAGMENT)).unwrap();
        assert!(module.entry_points.iter().any(|ep| ep.name == "fs_key"));
    }

    #[test]
    fn test_key_uniforms_layout() {
        assert_eq!(std::mem::size_of::<KeyUniforms>(), 32);
        let uniforms = KeyUniforms::from(&ChromaKey::default());
        assert_eq!(uniforms.key_color, [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(uniforms.similarity, 0.4);
    }

    fn assert_close(gpu: &Bitmap, cpu: &Bitmap, tolerance: u8) {
        assert_eq!((gpu.width, gpu.height), (cpu.width, cpu.height));
        for (i, (g, c)) in gpu.data.iter().zip(&cpu.data).enumerate() {
            assert!(g.abs_diff(*c) <= tolerance, "byte {} differs: gpu {} cpu {}", i, g, c);
        }
    }

    #[test]
    fn test_gpu_keying_matches_cpu() {
        let Ok(gpu) = GpuContext::headless() else {
            return;
        };
        let mut gpu_keyer = WgpuKeyer::new(Arc::new(gpu)).unwrap();
        let mut cpu_keyer = CpuKeyer;

        let mut source = Bitmap::solid(2, 2, [0, 255, 0, 255]);
        source.data[4..8].copy_from_slice(&[255, 0, 0, 255]);
        source.data[8..12].copy_from_slice(&[40, 200, 60, 255]);
        source.data[12..16].copy_from_slice(&[128, 128, 128, 255]);

        let key = ChromaKey {
            color: KeyColor::from_hex("#00FF00").unwrap(),
            similarity: 0.1,
            smoothness: 0.3,
            spill: 0.5,
        };
        let gpu_out = gpu_keyer.key(&source, &key).unwrap();
        let cpu_out = cpu_keyer.key(&source, &key).unwrap();
        assert_close(&gpu_out, &cpu_out, 1);
    }
}

//! Window presenter using winit and wgpu.

use super::{compose, FramePresenter, Overlay};
use crate::frame::Bitmap;
use crate::keying::KeyColor;
use crate::shader::{self, GpuContext, QuadBuffers};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::info;
use winit::dpi::PhysicalSize;
use winit::window::Window;

const FRAGMENT_SHADER: &str = r#"
@group(0) @binding(0) var t_texture: texture_2d<f32>;
@group(0) @binding(1) var s_sampler: sampler;

@fragment
fn fs_main(@location(0) tex_coords: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(t_texture, s_sampler, tex_coords);
}
"#;

/// The frame texture, reused while the frame size stays the same.
struct FrameTexture {
    width: u32,
    height: u32,
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

/// Draws frames stretched over a window, alpha-blended over a solid background.
pub struct WindowPresenter {
    gpu: Arc<GpuContext>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    render_pipeline: wgpu::RenderPipeline,
    quad: QuadBuffers,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    background: wgpu::Color,
    frame_texture: Option<FrameTexture>,
    window: Arc<Window>,
}

impl WindowPresenter {
    /// Creates the presenter and the GPU context it renders with. The context
    /// is shared with the processing stages through [`WindowPresenter::gpu`].
    pub fn new(window: Arc<Window>, background: KeyColor) -> Result<Self> {
        let (gpu, surface) = GpuContext::for_window(&window)?;
        let gpu = Arc::new(gpu);
        let device = &gpu.device;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&gpu.adapter);
        // Frames hold display-ready bytes, so avoid a second sRGB encode.
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| anyhow!("Surface reports no supported formats"))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(device, &config);
        info!("Window surface {}x{} ({:?})", config.width, config.height, surface_format);

        let module = shader::create_module(device, "Window Shader", shader::with_vertex_stage(FRAGMENT_SHADER))?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Window Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Window Render Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let render_pipeline = shader::create_quad_pipeline(
            device,
            "Window Render Pipeline",
            &pipeline_layout,
            &module,
            "fs_main",
            surface_format,
            Some(wgpu::BlendState::ALPHA_BLENDING),
        );

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Window Texture Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let quad = QuadBuffers::new(device, "Window");

        Ok(Self {
            gpu,
            surface,
            config,
            render_pipeline,
            quad,
            bind_group_layout,
            sampler,
            background: background_color(background),
            frame_texture: None,
            window,
        })
    }

    /// The GPU context, for stages that should render on the same device.
    pub fn gpu(&self) -> Arc<GpuContext> {
        self.gpu.clone()
    }

    pub fn set_background(&mut self, background: KeyColor) {
        self.background = background_color(background);
    }

    /// Resizes the surface.
    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.gpu.device, &self.config);
        }
    }

    /// Returns a reference to the window.
    pub fn window(&self) -> &Window {
        &self.window
    }

    fn ensure_texture(&mut self, width: u32, height: u32) -> Result<()> {
        if matches!(&self.frame_texture, Some(t) if t.width == width && t.height == height) {
            return Ok(());
        }
        shader::check_device_texture_size(&self.gpu.device, width, height)?;
        info!("Window frame texture resized to {}x{}", width, height);

        let device = &self.gpu.device;
        let texture = shader::create_texture(
            device,
            "Window Frame Texture",
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Window Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        self.frame_texture = Some(FrameTexture {
            width,
            height,
            texture,
            bind_group,
        });
        Ok(())
    }
}

fn background_color(color: KeyColor) -> wgpu::Color {
    wgpu::Color {
        r: color.r as f64,
        g: color.g as f64,
        b: color.b as f64,
        a: 1.0,
    }
}

impl FramePresenter for WindowPresenter {
    fn present(&mut self, frame: &Bitmap, overlay: Option<&Overlay>) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        let composed = compose(frame, overlay)?;
        self.ensure_texture(composed.width, composed.height)?;
        let frame_texture = self
            .frame_texture
            .as_ref()
            .ok_or_else(|| anyhow!("Window frame texture missing"))?;
        shader::upload_bitmap(&self.gpu.queue, &frame_texture.texture, &composed);

        let output = self.surface.get_current_texture()?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Window Render Encoder"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Window Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.background),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&self.render_pipeline);
            render_pass.set_bind_group(0, &frame_texture.bind_group, &[]);
            self.quad.draw(&mut render_pass);
        }

        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_shader_validates() {
        shader::validate_wgsl(&shader::with_vertex_stage(FRAGMENT_SHADER)).unwrap();
    }

    #[test]
    fn test_background_color_from_hex() {
        let color = background_color(KeyColor::from_hex("#ff0000").unwrap());
        assert_eq!((color.r, color.g, color.b, color.a), (1.0, 0.0, 0.0, 1.0));
    }
}

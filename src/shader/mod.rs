//! wgpu plumbing shared by the GPU keying stage and the GPU filter chain.
//!
//! Both stages draw one full-screen quad per pass into an `Rgba8Unorm`
//! target and fetch texels with `textureLoad`, so every output pixel maps to
//! exactly one input pixel and results match the CPU reference backend.

mod gpu_context;

pub use gpu_context::GpuContext;

use crate::frame::{Bitmap, QuadVertex};
use anyhow::{anyhow, Result};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;
use wgpu::util::DeviceExt;

/// Format of every intermediate and output texture.
pub const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Vertex stage prepended to every fragment module.
pub const VERTEX_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Joins [`VERTEX_SHADER`] with a fragment source into one module.
pub fn with_vertex_stage(fragment: &str) -> String {
    format!("{}\n{}", VERTEX_SHADER, fragment)
}

/// Parses and validates WGSL with naga, so a broken kernel fails at
/// initialization with a readable message instead of a device error.
pub fn validate_wgsl(source: &str) -> Result<naga::Module> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("WGSL parse error: {}", e.emit_to_string(source)))?;
    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    validator
        .validate(&module)
        .map_err(|e| anyhow!("Shader validation error: {:?}", e))?;
    Ok(module)
}

/// Creates a validated shader module.
pub fn create_module(device: &wgpu::Device, label: &str, source: String) -> Result<wgpu::ShaderModule> {
    validate_wgsl(&source)?;
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
    }))
}

/// Layout with the source texture at binding 0 and a uniform buffer at binding 1.
pub fn source_uniform_layout(
    device: &wgpu::Device,
    label: &str,
    uniform_size: u64,
    dynamic_offset: bool,
) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: dynamic_offset,
                    min_binding_size: wgpu::BufferSize::new(uniform_size),
                },
                count: None,
            },
        ],
    })
}

/// Creates a quad render pipeline for `fragment_entry` in `module`.
pub fn create_quad_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    fragment_entry: &str,
    format: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            buffers: &[QuadVertex::layout()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

/// Vertex and index buffers for the two-triangle quad.
pub struct QuadBuffers {
    vertex: wgpu::Buffer,
    index: wgpu::Buffer,
}

impl QuadBuffers {
    pub fn new(device: &wgpu::Device, label: &str) -> Self {
        let vertex = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{} Vertex Buffer", label)),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{} Index Buffer", label)),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self { vertex, index }
    }

    /// Binds the buffers and draws the quad.
    pub fn draw(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(0, self.vertex.slice(..));
        pass.set_index_buffer(self.index.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
    }
}

/// Creates an RGBA8 texture of the given size.
pub fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage,
        view_formats: &[],
    })
}

/// Fails if a `width`x`height` texture exceeds `max_dimension` on either side.
pub fn check_texture_size(width: u32, height: u32, max_dimension: u32) -> Result<()> {
    if width > max_dimension || height > max_dimension {
        return Err(anyhow!(
            "Frame {}x{} exceeds the device texture limit of {}",
            width,
            height,
            max_dimension
        ));
    }
    Ok(())
}

/// [`check_texture_size`] against the limits `device` was created with.
pub fn check_device_texture_size(device: &wgpu::Device, width: u32, height: u32) -> Result<()> {
    check_texture_size(width, height, device.limits().max_texture_dimension_2d)
}

/// Writes a bitmap into a texture of the same size.
pub fn upload_bitmap(queue: &wgpu::Queue, texture: &wgpu::Texture, bitmap: &Bitmap) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &bitmap.data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(bitmap.width * 4),
            rows_per_image: Some(bitmap.height),
        },
        wgpu::Extent3d {
            width: bitmap.width,
            height: bitmap.height,
            depth_or_array_layers: 1,
        },
    );
}

/// Row pitch for texture-to-buffer copies, which must be a multiple of 256.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// A mappable buffer for reading a render target back into a [`Bitmap`].
pub struct Readback {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
}

impl Readback {
    pub fn new(device: &wgpu::Device, label: &str, width: u32, height: u32) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded_bytes_per_row(width) as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self { buffer, width, height }
    }

    /// Records a copy of `texture` into the buffer.
    pub fn copy_from(&self, encoder: &mut wgpu::CommandEncoder, texture: &wgpu::Texture) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row(self.width)),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Waits for submitted work, maps the buffer and strips the row padding.
    pub fn read(&self, device: &wgpu::Device) -> Result<Bitmap> {
        let slice = self.buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| anyhow!("GPU poll failed: {:?}", e))?;
        receiver.recv()??;

        let row_bytes = (self.width * 4) as usize;
        let padded = padded_bytes_per_row(self.width) as usize;
        let mut data = Vec::with_capacity(row_bytes * self.height as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded).take(self.height as usize) {
                data.extend_from_slice(&row[..row_bytes]);
            }
        }
        self.buffer.unmap();

        Bitmap::from_data(self.width, self.height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_bytes_per_row() {
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(1280), 5120);
    }

    #[test]
    fn test_texture_size_limit() {
        assert!(check_texture_size(2048, 2048, 2048).is_ok());
        assert!(check_texture_size(1, 2048, 2048).is_ok());

        let err = check_texture_size(2560, 1440, 2048).unwrap_err();
        assert!(err.to_string().contains("2560x1440"));
        assert!(check_texture_size(100, 2049, 2048).is_err());
    }

    #[test]
    fn test_vertex_stage_validates() {
        let module = validate_wgsl(VERTEX_SHADER).unwrap();
        assert!(module.entry_points.iter().any(|ep| ep.name == "vs_main"));
    }

    #[test]
    fn test_validation_reports_errors() {
        let err = validate_wgsl("fn broken( {").unwrap_err();
        assert!(err.to_string().contains("WGSL parse error"));
    }
}

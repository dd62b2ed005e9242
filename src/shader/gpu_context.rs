//! Shared GPU context for wgpu resources.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::info;
use winit::window::Window;

/// GPU device shared by the keying stage, the filter chain and the window.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Initializes a context for offscreen rendering only.
    pub fn headless() -> Result<Self> {
        let instance = Self::create_instance();
        Self::create(instance, None)
    }

    /// Initializes a context whose adapter can present to `window`, and
    /// returns the window's surface alongside it.
    pub fn for_window(window: &Arc<Window>) -> Result<(Self, wgpu::Surface<'static>)> {
        let instance = Self::create_instance();
        let surface = instance.create_surface(window.clone())?;
        let context = Self::create(instance, Some(&surface))?;
        Ok((context, surface))
    }

    fn create_instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        })
    }

    fn create(instance: wgpu::Instance, surface: Option<&wgpu::Surface<'static>>) -> Result<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        }))
        .map_err(|_| anyhow!("Failed to obtain GPU adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Chromacam Device"),
            required_features: wgpu::Features::empty(),
            required_limits: if surface.is_some() {
                wgpu::Limits::default()
            } else {
                wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits())
            },
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;

        info!("Using GPU adapter: {}", adapter.get_info().name);

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
        })
    }
}

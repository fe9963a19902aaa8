//! Device acquisition and pipeline compilation

use crate::error::{KilnError, Result};
use log::info;

/// Compiled compute pipelines, one per shader
pub struct Pipelines {
    pub binary: wgpu::ComputePipeline,
    pub unary: wgpu::ComputePipeline,
    pub matmul: wgpu::ComputePipeline,
}

/// The wgpu device and queue plus the compiled kernels
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    pipelines: Pipelines,
}

impl GpuContext {
    /// Acquire the first high-performance adapter and compile the kernels
    ///
    /// # Errors
    /// `BackendUnavailable` when no adapter or device can be acquired.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| KilnError::BackendUnavailable(format!("no suitable adapter: {e}")))?;
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("kiln device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await
            .map_err(|e| KilnError::BackendUnavailable(format!("device request failed: {e}")))?;

        let pipelines = Self::create_pipelines(&device);
        info!(
            "accelerator ready: {} ({:?}, {:?})",
            adapter_info.name, adapter_info.backend, adapter_info.device_type
        );
        Ok(Self {
            device,
            queue,
            adapter_info,
            pipelines,
        })
    }

    fn create_pipelines(device: &wgpu::Device) -> Pipelines {
        let create = |label: &str, source: &'static str| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };
        Pipelines {
            binary: create("binary", include_str!("shaders/binary.wgsl")),
            unary: create("unary", include_str!("shaders/unary.wgsl")),
            matmul: create("matmul", include_str!("shaders/matmul.wgsl")),
        }
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.adapter_info.name
    }

    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    #[must_use]
    pub const fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }
}

//! GPU support.
//!
//! Field passes run on the CPU. The GPU is used for the occupancy reduction
//! only, where the readback is the small reduction grid rather than the field.

mod field_gpu;
mod occupancy_gpu;

use std::sync::Arc;

pub use field_gpu::{FieldBufferGpu, FieldParamsGpu};
pub use occupancy_gpu::{GpuOccupancyProbe, OCCUPANCY_WGSL};

use crate::error::GpuError;

/// Headless device and queue.
#[derive(Clone, Debug)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Request an adapter and device without a surface, blocking on the futures.
    pub fn headless() -> Result<Self, GpuError> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        log::info!("Using GPU: {:?}", adapter_info);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("TPFE Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
        })
    }
}

/// Block until a `map_async` callback has reported.
pub(crate) fn await_buffer_map(
    rx: std::sync::mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
) -> Result<(), GpuError> {
    match rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GpuError::BufferMapping(e.to_string())),
        Err(_) => Err(GpuError::BufferMapping("map callback dropped".into())),
    }
}

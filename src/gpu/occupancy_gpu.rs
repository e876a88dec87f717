//! Occupancy reduction on the GPU.
//!
//! One invocation per reduction block averages the smoothed coverage of the
//! field's last channel. Only the `size × size` block averages come back to
//! the CPU; the field itself is never read back.

use std::fmt;
use std::sync::Arc;

use crate::conservation::{OccupancyProbe, ReductionParams, MAX_REDUCTION_SIZE};
use crate::error::GpuError;
use crate::field::FieldView;
use crate::gpu::{await_buffer_map, FieldBufferGpu, FieldParamsGpu, GpuContext};

const WORKGROUP_SIZE: u32 = 8;
const REDUCTION_BYTES: u64 = (MAX_REDUCTION_SIZE * MAX_REDUCTION_SIZE) as u64 * 4;

/// Block-average coverage shader. Empty blocks are written as `-1`.
pub const OCCUPANCY_WGSL: &str = r#"
struct Params {
    width: u32,
    height: u32,
    channels: u32,
    size: u32,
    visibility_low: f32,
    visibility_high: f32,
    _pad0: f32,
    _pad1: f32,
};

@group(0) @binding(0) var<storage, read> field: array<f32>;
@group(0) @binding(1) var<storage, read_write> reduction: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

fn coverage(raw: f32) -> f32 {
    // NaN compares unequal to itself.
    let v = select(0.0, raw, raw == raw);
    if (params.visibility_high <= params.visibility_low) {
        return select(0.0, 1.0, v >= params.visibility_high);
    }
    return smoothstep(params.visibility_low, params.visibility_high, v);
}

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.size || id.y >= params.size) {
        return;
    }
    let x0 = id.x * params.width / params.size;
    let x1 = (id.x + 1u) * params.width / params.size;
    let y0 = id.y * params.height / params.size;
    let y1 = (id.y + 1u) * params.height / params.size;
    let slot = id.y * params.size + id.x;

    let count = (x1 - x0) * (y1 - y0);
    if (count == 0u) {
        reduction[slot] = -1.0;
        return;
    }

    var sum = 0.0;
    for (var y = y0; y < y1; y = y + 1u) {
        for (var x = x0; x < x1; x = x + 1u) {
            let index = (y * params.width + x) * params.channels + params.channels - 1u;
            sum = sum + coverage(field[index]);
        }
    }
    reduction[slot] = sum / f32(count);
}
"#;

/// [`OccupancyProbe`] backed by a compute pass.
///
/// A failed buffer map yields `None`, which the controller treats as a
/// degenerate measurement.
pub struct GpuOccupancyProbe {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: Option<wgpu::BindGroup>,
    field: FieldBufferGpu,
    params_buffer: wgpu::Buffer,
    reduction_buffer: wgpu::Buffer,
    staging_buffer: wgpu::Buffer,
    reduction: Vec<f32>,
}

impl GpuOccupancyProbe {
    pub fn new(context: &GpuContext) -> Self {
        let device = &context.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Occupancy Reduction Shader"),
            source: wgpu::ShaderSource::Wgsl(OCCUPANCY_WGSL.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Occupancy Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Occupancy Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Occupancy Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occupancy Params Buffer"),
            size: std::mem::size_of::<FieldParamsGpu>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let reduction_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occupancy Reduction Buffer"),
            size: REDUCTION_BYTES,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occupancy Staging Buffer"),
            size: REDUCTION_BYTES,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            device: Arc::clone(&context.device),
            queue: Arc::clone(&context.queue),
            pipeline,
            bind_group_layout,
            bind_group: None,
            field: FieldBufferGpu::new(device, 1),
            params_buffer,
            reduction_buffer,
            staging_buffer,
            reduction: Vec::new(),
        }
    }

    /// Convenience constructor that creates its own headless context.
    pub fn headless() -> Result<Self, GpuError> {
        Ok(Self::new(&GpuContext::headless()?))
    }

    /// Per-block coverage from the most recent measurement; empty blocks are negative.
    pub fn reduction(&self) -> &[f32] {
        &self.reduction
    }

    fn rebuild_bind_group(&mut self) {
        self.bind_group = Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Occupancy Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.field.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.reduction_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.params_buffer.as_entire_binding(),
                },
            ],
        }));
    }

    fn read_reduction(&mut self, bytes: u64) -> Result<(), GpuError> {
        let slice = self.staging_buffer.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        await_buffer_map(rx)?;

        {
            let data = slice.get_mapped_range();
            self.reduction.clear();
            self.reduction.extend_from_slice(bytemuck::cast_slice(&data[..]));
        }
        self.staging_buffer.unmap();
        Ok(())
    }
}

impl OccupancyProbe for GpuOccupancyProbe {
    fn measure(&mut self, field: FieldView<'_>, params: &ReductionParams) -> Option<f32> {
        if field.is_empty() {
            self.reduction.clear();
            return Some(0.0);
        }

        let bytes = (field.data().len() * std::mem::size_of::<f32>()) as u64;
        let limit = self.device.limits().max_storage_buffer_binding_size as u64;
        if bytes > limit {
            log::warn!("Field of {} bytes exceeds GPU storage binding limit {}", bytes, limit);
            return None;
        }

        let size = params.size.clamp(1, MAX_REDUCTION_SIZE);
        let gpu_params = FieldParamsGpu {
            width: field.width() as u32,
            height: field.height() as u32,
            channels: field.channels() as u32,
            size,
            visibility_low: params.visibility_low,
            visibility_high: params.visibility_high,
            _pad: [0.0; 2],
        };
        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&gpu_params));
        if self.field.upload(&self.device, &self.queue, field) || self.bind_group.is_none() {
            self.rebuild_bind_group();
        }
        let bind_group = self.bind_group.as_ref()?;

        let readback = (size * size) as u64 * 4;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Occupancy Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Occupancy Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            let groups = size.div_ceil(WORKGROUP_SIZE);
            pass.dispatch_workgroups(groups, groups, 1);
        }
        encoder.copy_buffer_to_buffer(&self.reduction_buffer, 0, &self.staging_buffer, 0, readback);
        self.queue.submit(Some(encoder.finish()));

        if let Err(e) = self.read_reduction(readback) {
            log::warn!("Occupancy readback failed: {}", e);
            return None;
        }

        let (sum, count) = self
            .reduction
            .iter()
            .filter(|v| **v >= 0.0)
            .fold((0.0f64, 0usize), |(s, n), v| (s + *v as f64, n + 1));
        if count == 0 {
            return Some(0.0);
        }
        Some((sum / count as f64) as f32)
    }

    fn name(&self) -> &str {
        "gpu"
    }
}

impl fmt::Debug for GpuOccupancyProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuOccupancyProbe")
            .field("field_capacity", &self.field.capacity())
            .field("field_layout", &self.field.layout())
            .field("reduction_blocks", &self.reduction.len())
            .finish()
    }
}

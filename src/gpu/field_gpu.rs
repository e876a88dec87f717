//! Storage-buffer mirror of a CPU [`Field`](crate::field::Field).

use bytemuck::{Pod, Zeroable};

use crate::field::FieldView;

/// Field layout and reduction settings, uploaded as a uniform.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct FieldParamsGpu {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Reduction grid side length.
    pub size: u32,
    pub visibility_low: f32,
    pub visibility_high: f32,
    pub _pad: [f32; 2],
}

/// One read-only storage buffer holding a field's interleaved channels.
///
/// The buffer is reallocated only when the field outgrows it, so repeated
/// uploads at a fixed resolution reuse the same allocation.
pub struct FieldBufferGpu {
    buffer: wgpu::Buffer,
    capacity: u64,
    width: usize,
    height: usize,
    channels: usize,
}

impl FieldBufferGpu {
    pub fn new(device: &wgpu::Device, elements: usize) -> Self {
        let capacity = Self::bytes_for(elements);
        Self {
            buffer: Self::allocate(device, capacity),
            capacity,
            width: 0,
            height: 0,
            channels: 0,
        }
    }

    fn bytes_for(elements: usize) -> u64 {
        (elements.max(1) * std::mem::size_of::<f32>()) as u64
    }

    fn allocate(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Field Buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Copy `view` into the buffer, growing it first if needed.
    ///
    /// Returns `true` when the buffer was reallocated, which invalidates any
    /// bind group built over it.
    pub fn upload(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, view: FieldView<'_>) -> bool {
        let needed = Self::bytes_for(view.data().len());
        let grew = needed > self.capacity;
        if grew {
            self.buffer = Self::allocate(device, needed);
            self.capacity = needed;
        }
        self.width = view.width();
        self.height = view.height();
        self.channels = view.channels();
        if !view.data().is_empty() {
            queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(view.data()));
        }
        grew
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// `(width, height, channels)` of the last upload.
    pub fn layout(&self) -> (usize, usize, usize) {
        (self.width, self.height, self.channels)
    }
}

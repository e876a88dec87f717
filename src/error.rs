//! Error types for TPFE.
//!
//! Only allocation (construction and resize) and GPU setup are fallible.
//! Numerical trouble inside a step is handled locally and never surfaces here.

use thiserror::Error;

/// Errors that can occur while setting up GPU resources.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    #[error("no compatible GPU adapter found; ensure the system has a GPU with WebGPU/Vulkan/Metal/DX12 support")]
    NoAdapter,
    /// Failed to create GPU device.
    #[error("failed to create GPU device: {0}")]
    DeviceCreation(#[from] wgpu::RequestDeviceError),
    /// Failed to map buffer for reading.
    #[error("failed to map GPU buffer: {0}")]
    BufferMapping(String),
}

/// Errors returned by the simulation's fallible entry points.
#[derive(Debug, Error)]
pub enum FluidError {
    /// Field storage could not be allocated.
    #[error("failed to allocate {channels}-channel field of {width}x{height}")]
    Allocation {
        /// Requested width in cells.
        width: usize,
        /// Requested height in cells.
        height: usize,
        /// Channels per cell.
        channels: usize,
    },
    /// Channel count outside 1..=4.
    #[error("field channel count must be 1-4, got {0}")]
    InvalidChannels(usize),
    /// GPU initialization failed.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    /// Configuration could not be parsed or serialized.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Configuration file could not be read or written.
    #[error("configuration I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

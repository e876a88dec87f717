//! The two simulated substances.
//!
//! The primary layer is the carrier fluid: incompressible, confined, and
//! driven by impulses. The secondary layer is an immiscible film riding on
//! top of it, dragged along through [`coupling`] and shaped by its own
//! per-pixel material properties.

pub mod coupling;
pub mod primary;
pub mod secondary;
pub mod tension;

use serde::{Deserialize, Serialize};

use crate::error::FluidError;
use crate::field::Field;

pub use coupling::{coupling_factor, CouplingParams};
pub use primary::PrimaryLayer;
pub use secondary::{PaintStroke, SecondaryLayer};

/// Channels of every layer's scalar field. The last one is the conserved quantity.
pub const SCALAR_CHANNELS: usize = 4;

/// Identifies one of the two layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerId {
    Primary,
    Secondary,
}

/// Velocity plus scalar payload of one substance.
#[derive(Clone, Debug)]
pub struct Layer {
    /// Two channels, cells per second.
    pub velocity: Field,
    /// Four channels; the last one is concentration or thickness.
    pub scalar: Field,
}

impl Layer {
    /// Allocate zeroed fields.
    pub fn new(width: usize, height: usize) -> Result<Self, FluidError> {
        Ok(Self {
            velocity: Field::new(width, height, 2)?,
            scalar: Field::new(width, height, SCALAR_CHANNELS)?,
        })
    }

    /// Bilinearly resample both fields into a new layer.
    pub fn resampled(&self, width: usize, height: usize) -> Result<Self, FluidError> {
        let sx = width as f32 / self.velocity.width().max(1) as f32;
        let sy = height as f32 / self.velocity.height().max(1) as f32;
        let mut velocity = self.velocity.resampled(width, height)?;
        // Velocity is in cells per second, so it scales with the grid.
        velocity.pass(|x, y, src, out| {
            out[0] = src.at(x, y, 0) * sx;
            out[1] = src.at(x, y, 1) * sy;
        });
        Ok(Self {
            velocity,
            scalar: self.scalar.resampled(width, height)?,
        })
    }

    pub fn width(&self) -> usize {
        self.velocity.width()
    }

    pub fn height(&self) -> usize {
        self.velocity.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_resample_scales_velocity() {
        let mut layer = Layer::new(8, 8).unwrap();
        layer.velocity.fill(&[1.0, 2.0]);
        layer.scalar.fill(&[0.1, 0.2, 0.3, 0.4]);
        let bigger = layer.resampled(16, 4).unwrap();
        let v = bigger.velocity.view().vec2(3, 2);
        assert!((v.x - 2.0).abs() < 1e-5);
        assert!((v.y - 1.0).abs() < 1e-5);
        assert!((bigger.scalar.view().last(5, 1) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_layer_resample_to_zero() {
        let layer = Layer::new(8, 8).unwrap();
        let empty = layer.resampled(0, 0).unwrap();
        assert_eq!(empty.width(), 0);
        assert!(empty.scalar.is_empty());
    }
}

//! Radial splats: the only way impulses and paint enter a field.
//!
//! Positions and radii here are in cell units. Cells whose weight is
//! negligible are copied through unchanged.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::field::{clamp_unit, finite_or, Field};

const MIN_WEIGHT: f32 = 1e-4;

/// Radial weight profile of a splat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Falloff {
    /// `exp(-d² / r²)`.
    #[default]
    Gaussian,
    /// `(1 - d²/r²)²` inside the radius, zero outside.
    Smooth,
}

impl Falloff {
    /// Weight at squared distance `dist_sq` from the center.
    #[inline]
    pub fn weight(self, dist_sq: f32, radius: f32) -> f32 {
        let r2 = radius * radius;
        if !(r2 > 0.0) {
            return 0.0;
        }
        match self {
            Falloff::Gaussian => (-dist_sq / r2).exp(),
            Falloff::Smooth => {
                let t = 1.0 - dist_sq / r2;
                if t > 0.0 {
                    t * t
                } else {
                    0.0
                }
            }
        }
    }
}

/// Apply `blend(weight, src_cell, out_cell)` around `center`.
pub fn splat_with<B>(field: &mut Field, center: Vec2, radius: f32, falloff: Falloff, blend: B)
where
    B: Fn(f32, &[f32], &mut [f32]) + Sync + Send,
{
    if !center.is_finite() || !(radius > 0.0) || !radius.is_finite() {
        return;
    }
    field.pass(|x, y, src, out| {
        let cell = src.cell(x, y);
        let d = Vec2::new(x as f32, y as f32) - center;
        let w = falloff.weight(d.length_squared(), radius);
        if w < MIN_WEIGHT {
            out.copy_from_slice(cell);
        } else {
            blend(w, cell, out);
        }
    });
}

/// Add a weighted vector delta to a two-channel field.
pub fn splat_vector(field: &mut Field, center: Vec2, radius: f32, delta: Vec2, falloff: Falloff) {
    if !delta.is_finite() || delta == Vec2::ZERO {
        return;
    }
    splat_with(field, center, radius, falloff, |w, src, out| {
        out[0] = src[0] + delta.x * w;
        out[1] = src[1] + delta.y * w;
    });
}

/// Add a weighted per-channel delta to a scalar field, clamping to `[0, 1]`.
pub fn splat_scalar(field: &mut Field, center: Vec2, radius: f32, delta: &[f32], falloff: Falloff) {
    if delta.iter().all(|d| *d == 0.0) {
        return;
    }
    splat_with(field, center, radius, falloff, |w, src, out| {
        for (ch, slot) in out.iter_mut().enumerate() {
            let d = finite_or(delta.get(ch).copied().unwrap_or(0.0), 0.0);
            *slot = clamp_unit(src[ch] + d * w);
        }
    });
}

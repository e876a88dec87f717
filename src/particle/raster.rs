//! Particles to grid.
//!
//! Each cell gathers the particles around it through the spatial hash, so no
//! two threads ever write the same cell. Weights use the smooth
//! `(1 - r²/R²)²` falloff. Summed thickness is optionally pushed through a
//! smoothstep band, which merges nearby blobs the way metaballs do.

use glam::{Vec2, Vec3};

use crate::config::RasterConfig;
use crate::field::{clamp_unit, finite_vec2, smoothstep, FieldView};
use crate::layer::Layer;
use crate::ops::Falloff;
use crate::particle::hash::SpatialHash;
use crate::particle::Particle;

/// Accumulated contributions at one cell.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub thickness: f32,
    pub color: Vec3,
    pub velocity: Vec2,
}

/// Gather particle contributions at a cell-space point.
pub fn gather(particles: &[Particle], hash: &SpatialHash, point: Vec2, radius: f32, config: &RasterConfig) -> Sample {
    let mut weight = 0.0;
    let mut thickness = 0.0;
    let mut color = Vec3::ZERO;
    let mut velocity = Vec2::ZERO;

    hash.for_each_candidate(point, radius, |j| {
        let p = &particles[j];
        let w = Falloff::Smooth.weight(point.distance_squared(p.position), radius);
        if w <= 0.0 {
            return;
        }
        let aw = w * p.amount;
        weight += aw;
        thickness += aw * config.thickness_scale;
        color += p.color * aw;
        velocity += p.velocity * aw;
    });

    if !(weight > 0.0) {
        return Sample::default();
    }
    let thickness = if config.metaball {
        smoothstep(config.metaball_low, config.metaball_high, thickness)
    } else {
        clamp_unit(thickness)
    };
    let color = color / weight;
    let velocity = velocity / weight;
    Sample {
        thickness,
        color: if color.is_finite() { color.clamp(Vec3::ZERO, Vec3::ONE) } else { Vec3::ZERO },
        velocity: if velocity.is_finite() { velocity } else { Vec2::ZERO },
    }
}

/// Overwrite `layer`'s scalar and velocity fields from the particles.
///
/// `hash` must have been built from `particles`. Cells whose rasterized
/// thickness is below `min_thickness` take the carrier velocity from
/// `primary`, exactly as the grid film does.
pub fn rasterize(
    particles: &[Particle],
    hash: &SpatialHash,
    h: f32,
    config: &RasterConfig,
    primary: FieldView<'_>,
    min_thickness: f32,
    layer: &mut Layer,
) {
    let radius = h * config.radius_scale;
    layer.scalar.pass(|x, y, _, out| {
        let s = gather(particles, hash, Vec2::new(x as f32, y as f32), radius, config);
        out[0] = s.color.x;
        out[1] = s.color.y;
        out[2] = s.color.z;
        out[3] = s.thickness;
    });

    let scalar = layer.scalar.view();
    let carrier = primary.width() == scalar.width() && primary.height() == scalar.height();
    layer.velocity.pass(|x, y, _, out| {
        let v = if !(scalar.last(x, y) >= min_thickness) {
            if carrier {
                finite_vec2(primary.vec2(x, y))
            } else {
                Vec2::ZERO
            }
        } else {
            gather(particles, hash, Vec2::new(x as f32, y as f32), radius, config).velocity
        };
        out[0] = v.x;
        out[1] = v.y;
    });
}

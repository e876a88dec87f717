//! Particle representation of the secondary layer.
//!
//! Particles live in a fixed-capacity arena. They are created by paint,
//! advanced by SPH, and rasterized into the secondary layer's grid fields so
//! everything downstream treats them like the grid film.
//!
//! Lifecycle: spawned, active, then absorbed (boundary, conservation) or
//! evicted (capacity).
//!
//! # Example
//!
//! ```ignore
//! let mut system = ParticleSystem::new(&config.sph, 256, 256);
//! system.seed(Vec2::new(128.0, 128.0), 12.0, Vec3::ONE, 1.0, &config.sph);
//! system.couple(primary_velocity, props, dt, &config.sph, &CouplingParams::from(&config.secondary));
//! system.step(dt, &config.sph);
//! system.rasterize(&mut layer, primary_velocity, config.secondary.min_thickness, &config.raster);
//! ```

pub mod hash;
pub mod raster;
pub mod sph;

use glam::{Vec2, Vec3};

use crate::config::{CapacityPolicy, RasterConfig, SphConfig};
use crate::conservation::{ConservationConfig, Damping};
use crate::error::FluidError;
use crate::field::{clamp_unit, finite_vec2, FieldView};
use crate::layer::coupling::{coupling_factor, CouplingParams};
use crate::layer::Layer;

pub use hash::SpatialHash;
pub use sph::Kernels;

/// Amount below which a damped particle is absorbed.
pub const MIN_AMOUNT: f32 = 0.02;

const MAX_SUBSTEP: f32 = 1.0 / 120.0;
const MAX_SUBSTEPS: u32 = 8;
const MAX_SEED: usize = 4096;

/// One SPH particle. Positions are in cells, velocities in cells per second.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub position: Vec2,
    pub velocity: Vec2,
    pub density: f32,
    pub pressure: f32,
    /// Straight tint carried into the rasterized film.
    pub color: Vec3,
    /// Share of a full particle's thickness, `(0, 1]`. Conservation damping lowers it.
    pub amount: f32,
    /// Spawn order; lower is older.
    pub birth: u64,
}

impl Particle {
    pub fn new(position: Vec2, velocity: Vec2, color: Vec3, amount: f32, birth: u64) -> Self {
        Self {
            position,
            velocity,
            density: 0.0,
            pressure: 0.0,
            color,
            amount: clamp_unit(amount),
            birth,
        }
    }
}

/// Fixed-capacity particle arena plus its neighbour index.
#[derive(Clone, Debug)]
pub struct ParticleSystem {
    particles: Vec<Particle>,
    capacity: usize,
    next_birth: u64,
    bounds: Vec2,
    kernels: Kernels,
    hash: SpatialHash,
    accelerations: Vec<Vec2>,
}

impl ParticleSystem {
    /// Empty arena over a `width × height` cell domain.
    pub fn new(config: &SphConfig, width: usize, height: usize) -> Self {
        let kernels = Kernels::new(config.smoothing_radius);
        Self {
            particles: Vec::with_capacity(config.capacity.min(1 << 16)),
            capacity: config.capacity,
            next_birth: 0,
            bounds: Vec2::new(width as f32, height as f32),
            kernels,
            hash: SpatialHash::new(kernels.h, width, height),
            accelerations: Vec::new(),
        }
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kernels(&self) -> &Kernels {
        &self.kernels
    }

    /// Remove every particle.
    pub fn clear(&mut self) {
        self.particles.clear();
    }

    /// A copy over a new domain, with particles at the same relative place.
    ///
    /// `self` is untouched; a neighbour table that cannot be allocated is an error.
    pub fn resized(&self, width: usize, height: usize) -> Result<Self, FluidError> {
        let hash = SpatialHash::try_new(self.kernels.h, width, height)?;
        let bounds = Vec2::new(width as f32, height as f32);
        let scale = bounds / self.bounds.max(Vec2::ONE);
        let particles = self
            .particles
            .iter()
            .map(|p| Particle {
                position: p.position * scale,
                velocity: p.velocity * scale,
                ..*p
            })
            .collect();
        Ok(Self {
            particles,
            capacity: self.capacity,
            next_birth: self.next_birth,
            bounds,
            kernels: self.kernels,
            hash,
            accelerations: Vec::new(),
        })
    }

    /// Add one particle. Returns `false` if it was rejected.
    pub fn spawn(&mut self, position: Vec2, velocity: Vec2, color: Vec3, amount: f32, policy: CapacityPolicy) -> bool {
        if !position.is_finite() || !(amount > 0.0) || self.capacity == 0 {
            return false;
        }
        let particle = Particle::new(position, velocity, color, amount, self.next_birth);
        if self.particles.len() < self.capacity {
            self.particles.push(particle);
        } else {
            match policy {
                CapacityPolicy::Reject => return false,
                CapacityPolicy::EvictOldest => {
                    let oldest = self
                        .particles
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| p.birth)
                        .map(|(i, _)| i);
                    match oldest {
                        Some(i) => self.particles[i] = particle,
                        None => return false,
                    }
                }
            }
        }
        self.next_birth += 1;
        true
    }

    /// Fill a disc with particles on a golden-angle spiral. Returns how many were placed.
    pub fn seed(&mut self, center: Vec2, radius: f32, color: Vec3, amount: f32, config: &SphConfig) -> usize {
        if !center.is_finite() || !(radius > 0.0) || !radius.is_finite() {
            return 0;
        }
        let spacing = self.kernels.h * config.spawn_spacing;
        let area = std::f32::consts::PI * radius * radius;
        let count = ((area / (spacing * spacing)).round() as usize).clamp(1, MAX_SEED);

        let full = self.particles.len() >= self.capacity;
        let mut placed = 0;
        for i in 0..count {
            let position = sph::spiral_point(center, radius, i, count).clamp(Vec2::ZERO, self.max_position());
            if self.spawn(position, Vec2::ZERO, color, amount, config.capacity_policy) {
                placed += 1;
            }
        }
        if full || self.particles.len() >= self.capacity {
            match config.capacity_policy {
                CapacityPolicy::Reject => {
                    log::warn!("particle arena full ({}); rejected {} of {}", self.capacity, count - placed, count)
                }
                CapacityPolicy::EvictOldest => {
                    log::warn!("particle arena full ({}); evicting oldest particles", self.capacity)
                }
            }
        }
        placed
    }

    fn max_position(&self) -> Vec2 {
        (self.bounds - Vec2::ONE).max(Vec2::ZERO)
    }

    fn rebuild_hash(&mut self) {
        self.hash.build(self.particles.iter().map(|p| p.position));
    }

    /// Blend particle velocities toward the carrier, as the grid film does.
    ///
    /// Local thickness is `density / rest_density`; coupling strength is
    /// sampled from the property field. Particles thinner than
    /// `min_thickness` take the carrier velocity outright.
    pub fn couple(&mut self, primary: FieldView<'_>, props: FieldView<'_>, dt: f32, config: &SphConfig, params: &CouplingParams) {
        if primary.is_empty() {
            return;
        }
        for p in &mut self.particles {
            let pv = primary.sample_vec2(p.position.x, p.position.y);
            let thickness = p.density / config.rest_density;
            if !(thickness >= params.min_thickness) {
                p.velocity = finite_vec2(pv);
                continue;
            }
            let factor = coupling_factor(props.bilinear(p.position.x, p.position.y, 0), thickness, dt, params);
            let v = p.velocity + (pv - p.velocity) * factor;
            p.velocity = if v.is_finite() { v } else { Vec2::ZERO };
        }
    }

    /// Advance SPH by `dt`, split into substeps.
    pub fn step(&mut self, dt: f32, config: &SphConfig) {
        if self.particles.is_empty() || !(dt > 0.0) {
            return;
        }
        let substeps = ((dt / MAX_SUBSTEP).ceil() as u32).clamp(1, MAX_SUBSTEPS);
        let h = dt / substeps as f32;
        let center = self.bounds * 0.5;
        let bounds = self.bounds;

        for _ in 0..substeps {
            self.rebuild_hash();
            sph::compute_density(&mut self.particles, &self.hash, &self.kernels, config);
            sph::compute_accelerations(
                &self.particles,
                &self.hash,
                &self.kernels,
                config,
                center,
                &mut self.accelerations,
            );
            let accelerations = &self.accelerations;
            let mut i = 0;
            self.particles.retain_mut(|p| {
                let keep = sph::integrate(p, accelerations[i], h, config, bounds);
                i += 1;
                keep
            });
        }
    }

    /// Scale particle amounts by the conservation gate and absorb depleted ones.
    ///
    /// `thickness` is the rasterized film used for the local gate.
    pub fn damp(&mut self, damping: &Damping, config: &ConservationConfig, thickness: FieldView<'_>) {
        if !(damping.strength > 0.0) {
            return;
        }
        let channel = thickness.channels().saturating_sub(1);
        self.particles.retain_mut(|p| {
            let local = if thickness.is_empty() {
                0.0
            } else {
                thickness.bilinear(p.position.x, p.position.y, channel)
            };
            p.amount *= damping.factor(local, config).clamp(0.0, 1.0);
            p.amount >= MIN_AMOUNT
        });
    }

    /// Gather particles into `layer`'s thickness, tint and velocity fields.
    ///
    /// Cells left thinner than `min_thickness` move with `primary`.
    pub fn rasterize(&mut self, layer: &mut Layer, primary: FieldView<'_>, min_thickness: f32, config: &RasterConfig) {
        self.rebuild_hash();
        raster::rasterize(&self.particles, &self.hash, self.kernels.h, config, primary, min_thickness, layer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoundaryPolicy;

    fn system(capacity: usize) -> ParticleSystem {
        let config = SphConfig {
            capacity,
            ..SphConfig::default()
        };
        ParticleSystem::new(&config, 64, 64)
    }

    // ========== Arena Tests ==========

    #[test]
    fn test_reject_when_full() {
        let mut system = system(2);
        assert!(system.spawn(Vec2::ONE, Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::Reject));
        assert!(system.spawn(Vec2::ONE, Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::Reject));
        assert!(!system.spawn(Vec2::ONE, Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::Reject));
        assert_eq!(system.len(), 2);
    }

    #[test]
    fn test_evict_oldest_when_full() {
        let mut system = system(2);
        system.spawn(Vec2::new(1.0, 1.0), Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::EvictOldest);
        system.spawn(Vec2::new(2.0, 2.0), Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::EvictOldest);
        system.spawn(Vec2::new(3.0, 3.0), Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::EvictOldest);
        assert_eq!(system.len(), 2);
        let positions: Vec<Vec2> = system.particles().iter().map(|p| p.position).collect();
        assert!(!positions.contains(&Vec2::new(1.0, 1.0)));
        assert!(positions.contains(&Vec2::new(3.0, 3.0)));
    }

    #[test]
    fn test_invalid_spawn_rejected() {
        let mut system = system(8);
        assert!(!system.spawn(Vec2::new(f32::NAN, 1.0), Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::EvictOldest));
        assert!(!system.spawn(Vec2::ONE, Vec2::ZERO, Vec3::ONE, 0.0, CapacityPolicy::EvictOldest));
        assert!(system.is_empty());
    }

    #[test]
    fn test_seed_is_deterministic_and_in_bounds() {
        let mut a = system(10_000);
        let mut b = system(10_000);
        let config = SphConfig::default();
        let placed = a.seed(Vec2::new(2.0, 32.0), 10.0, Vec3::ONE, 1.0, &config);
        b.seed(Vec2::new(2.0, 32.0), 10.0, Vec3::ONE, 1.0, &config);
        assert!(placed > 1);
        assert_eq!(a.particles(), b.particles());
        assert!(a.particles().iter().all(|p| p.position.x >= 0.0 && p.position.x <= 63.0));
    }

    // ========== Step Tests ==========

    #[test]
    fn test_step_keeps_everything_finite_and_capped() {
        let config = SphConfig {
            max_speed: 30.0,
            ..SphConfig::default()
        };
        let mut system = ParticleSystem::new(&config, 64, 64);
        system.seed(Vec2::new(32.0, 32.0), 8.0, Vec3::ONE, 1.0, &config);
        // Stack extra particles exactly on top of existing ones.
        let copies: Vec<Vec2> = system.particles().iter().take(10).map(|p| p.position).collect();
        for p in copies {
            system.spawn(p, Vec2::ZERO, Vec3::ONE, 1.0, config.capacity_policy);
        }
        for _ in 0..20 {
            system.step(1.0 / 30.0, &config);
        }
        for p in system.particles() {
            assert!(p.position.is_finite());
            assert!(p.density.is_finite() && p.pressure.is_finite());
            assert!(p.velocity.length() <= config.max_speed + 1e-3);
        }
    }

    #[test]
    fn test_absorb_boundary_removes_particles() {
        let config = SphConfig {
            boundary: BoundaryPolicy::Absorb,
            centering: 0.0,
            cohesion: 0.0,
            ..SphConfig::default()
        };
        let mut system = ParticleSystem::new(&config, 16, 16);
        system.spawn(Vec2::new(1.0, 8.0), Vec2::new(-40.0, 0.0), Vec3::ONE, 1.0, config.capacity_policy);
        system.spawn(Vec2::new(8.0, 8.0), Vec2::ZERO, Vec3::ONE, 1.0, config.capacity_policy);
        system.step(1.0 / 10.0, &config);
        assert_eq!(system.len(), 1);
    }

    #[test]
    fn test_damp_absorbs_depleted_particles() {
        let mut system = system(16);
        system.spawn(Vec2::ONE, Vec2::ZERO, Vec3::ONE, 0.021, CapacityPolicy::Reject);
        system.spawn(Vec2::ONE, Vec2::ZERO, Vec3::ONE, 1.0, CapacityPolicy::Reject);
        let empty = crate::field::Field::new(0, 0, 4).unwrap();
        let config = ConservationConfig::default();
        system.damp(&config.damping(0.5), &config, empty.view());
        assert_eq!(system.len(), 1);
        assert!((system.particles()[0].amount - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_isolated_particle_moves_with_carrier() {
        let config = SphConfig::default();
        let mut system = system(4);
        system.spawn(Vec2::new(20.0, 20.0), Vec2::new(-5.0, 0.0), Vec3::ONE, 1.0, CapacityPolicy::Reject);
        let carrier = crate::field::Field::from_fn(64, 64, 2, |_, _, out| out[1] = 7.0).unwrap();
        let props = crate::field::Field::new(64, 64, 4).unwrap();
        let params = CouplingParams {
            inertia: 4.0,
            min_thickness: 0.01,
            reference_dt: None,
        };
        system.couple(carrier.view(), props.view(), 1.0 / 60.0, &config, &params);
        assert_eq!(system.particles()[0].velocity, Vec2::new(0.0, 7.0));
    }

    #[test]
    fn test_resize_rescales_positions() {
        let mut system = system(4);
        system.spawn(Vec2::new(32.0, 16.0), Vec2::new(1.0, 1.0), Vec3::ONE, 1.0, CapacityPolicy::Reject);
        let resized = system.resized(128, 32).unwrap();
        let p = resized.particles()[0];
        assert_eq!(p.position, Vec2::new(64.0, 8.0));
        assert_eq!(p.velocity, Vec2::new(2.0, 0.5));
        assert_eq!(resized.kernels().h, system.kernels().h);
        assert_eq!(system.particles()[0].position, Vec2::new(32.0, 16.0));
    }
}

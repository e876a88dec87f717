//! 2D SPH: density, pressure, forces, integration.
//!
//! Kernels are the standard 2D normalizations:
//!
//! | Kernel | Form |
//! |--------|------|
//! | poly6 | `4 / (π h⁸) · (h² - r²)³` |
//! | spiky gradient | `-30 / (π h⁵) · (h - r)² · r̂` |
//! | viscosity Laplacian | `40 / (π h⁵) · (h - r)` |
//!
//! The equation of state clamps at zero, so particles never attract through
//! pressure. Every accumulator is checked and zeroed if it goes non-finite.

use std::f32::consts::PI;

use glam::Vec2;
use rayon::prelude::*;

use crate::config::{BoundaryPolicy, SphConfig};
use crate::field::finite_or;
use crate::particle::hash::SpatialHash;
use crate::particle::Particle;

const GOLDEN_ANGLE: f32 = 2.399_963_1;
const MIN_DISTANCE: f32 = 1e-5;

/// Precomputed kernel coefficients for one smoothing radius.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Kernels {
    pub h: f32,
    pub h2: f32,
    poly6: f32,
    spiky: f32,
    viscosity: f32,
}

impl Kernels {
    pub fn new(h: f32) -> Self {
        let h = finite_or(h, 1.0).max(1e-3);
        Self {
            h,
            h2: h * h,
            poly6: 4.0 / (PI * h.powi(8)),
            spiky: -30.0 / (PI * h.powi(5)),
            viscosity: 40.0 / (PI * h.powi(5)),
        }
    }

    #[inline]
    pub fn poly6(&self, r2: f32) -> f32 {
        if r2 >= self.h2 {
            return 0.0;
        }
        let t = self.h2 - r2;
        self.poly6 * t * t * t
    }

    /// Gradient of the spiky kernel along unit direction `dir` at distance `r`.
    #[inline]
    pub fn spiky_gradient(&self, dir: Vec2, r: f32) -> Vec2 {
        if r >= self.h {
            return Vec2::ZERO;
        }
        let t = self.h - r;
        dir * (self.spiky * t * t)
    }

    #[inline]
    pub fn viscosity_laplacian(&self, r: f32) -> f32 {
        if r >= self.h {
            return 0.0;
        }
        self.viscosity * (self.h - r)
    }
}

/// Unit vector from `j` toward `i`, with a fixed per-pair fallback for coincident particles.
///
/// The fallback flips sign when `i` and `j` swap, so the pair still separates.
#[inline]
pub fn separation(delta: Vec2, r: f32, i: usize, j: usize) -> Vec2 {
    if r > MIN_DISTANCE {
        return delta / r;
    }
    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
    let angle = (lo.wrapping_mul(31).wrapping_add(hi) % 4096) as f32 * GOLDEN_ANGLE;
    let dir = Vec2::new(angle.cos(), angle.sin());
    if i < j {
        dir
    } else {
        -dir
    }
}

/// Sum densities and derive pressures.
pub fn compute_density(particles: &mut [Particle], hash: &SpatialHash, kernels: &Kernels, config: &SphConfig) {
    let positions: Vec<Vec2> = particles.iter().map(|p| p.position).collect();
    particles.par_iter_mut().enumerate().for_each(|(i, p)| {
        let mut density = 0.0;
        hash.for_each_candidate(positions[i], kernels.h, |j| {
            let r2 = positions[i].distance_squared(positions[j]);
            density += config.particle_mass * kernels.poly6(r2);
        });
        // Self-contribution keeps density strictly positive.
        let density = finite_or(density, 0.0).max(config.particle_mass * kernels.poly6(0.0));
        p.density = density;
        p.pressure = finite_or(config.stiffness * (density - config.rest_density), 0.0).max(0.0);
    });
}

/// Acceleration on every particle from pressure, viscosity, cohesion, centering and gravity.
pub fn compute_accelerations(
    particles: &[Particle],
    hash: &SpatialHash,
    kernels: &Kernels,
    config: &SphConfig,
    center: Vec2,
    out: &mut Vec<Vec2>,
) {
    out.clear();
    out.resize(particles.len(), Vec2::ZERO);
    let mass = config.particle_mass;

    out.par_iter_mut().enumerate().for_each(|(i, acc)| {
        let pi = &particles[i];
        let mut pressure = Vec2::ZERO;
        let mut viscosity = Vec2::ZERO;
        let mut cohesion = Vec2::ZERO;

        hash.for_each_candidate(pi.position, kernels.h, |j| {
            if i == j {
                return;
            }
            let pj = &particles[j];
            let delta = pi.position - pj.position;
            let r = delta.length();
            if r >= kernels.h {
                return;
            }
            let dir = separation(delta, r, i, j);
            let rho_j = pj.density.max(1e-6);

            pressure -= kernels.spiky_gradient(dir, r) * (mass * (pi.pressure + pj.pressure) / (2.0 * rho_j));
            viscosity += (pj.velocity - pi.velocity) * (mass / rho_j * kernels.viscosity_laplacian(r));
            cohesion -= dir * (mass * kernels.poly6(r * r) * kernels.h);
        });

        let rho_i = pi.density.max(1e-6);
        let sum = |v: Vec2| if v.is_finite() { v } else { Vec2::ZERO };
        let total = sum(pressure) / rho_i
            + sum(viscosity) * (config.viscosity / rho_i)
            + sum(cohesion) * (config.cohesion / rho_i)
            + (center - pi.position) * config.centering
            + config.gravity;
        *acc = if total.is_finite() { total } else { Vec2::ZERO };
    });
}

/// Integrate velocity (capped) then position, and apply the boundary policy.
///
/// Returns `false` for particles that must be removed.
pub fn integrate(particle: &mut Particle, acceleration: Vec2, dt: f32, config: &SphConfig, bounds: Vec2) -> bool {
    let mut v = (particle.velocity + acceleration * dt).clamp_length_max(config.max_speed);
    if !v.is_finite() {
        v = Vec2::ZERO;
    }
    let mut x = particle.position + v * dt;
    if !x.is_finite() {
        return false;
    }

    let max = (bounds - Vec2::ONE).max(Vec2::ZERO);
    match config.boundary {
        BoundaryPolicy::Absorb => {
            if x.x < 0.0 || x.y < 0.0 || x.x > max.x || x.y > max.y {
                return false;
            }
        }
        BoundaryPolicy::Reflect => {
            for axis in 0..2 {
                if x[axis] < 0.0 {
                    x[axis] = 0.0;
                    v[axis] = -v[axis] * config.restitution;
                } else if x[axis] > max[axis] {
                    x[axis] = max[axis];
                    v[axis] = -v[axis] * config.restitution;
                }
            }
        }
    }

    particle.position = x;
    particle.velocity = v;
    true
}

/// Point `i` of `count` on a golden-angle spiral filling a disc of `radius`.
#[inline]
pub fn spiral_point(center: Vec2, radius: f32, i: usize, count: usize) -> Vec2 {
    let r = radius * ((i as f32 + 0.5) / count.max(1) as f32).sqrt();
    let angle = i as f32 * GOLDEN_ANGLE;
    center + Vec2::new(angle.cos(), angle.sin()) * r
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn particle(x: f32, y: f32) -> Particle {
        Particle::new(Vec2::new(x, y), Vec2::ZERO, Vec3::ONE, 1.0, 0)
    }

    fn run(particles: &mut Vec<Particle>, config: &SphConfig, steps: usize) {
        let kernels = Kernels::new(config.smoothing_radius);
        let bounds = Vec2::new(32.0, 32.0);
        let mut hash = SpatialHash::new(kernels.h, 32, 32);
        let mut acc = Vec::new();
        for _ in 0..steps {
            hash.build(particles.iter().map(|p| p.position));
            compute_density(particles, &hash, &kernels, config);
            compute_accelerations(particles, &hash, &kernels, config, bounds * 0.5, &mut acc);
            for (p, a) in particles.iter_mut().zip(acc.iter()) {
                integrate(p, *a, 1.0 / 60.0, config, bounds);
            }
        }
    }

    // ========== Kernel Tests ==========

    #[test]
    fn test_kernels_vanish_at_support() {
        let k = Kernels::new(2.0);
        assert_eq!(k.poly6(4.0), 0.0);
        assert_eq!(k.spiky_gradient(Vec2::X, 2.0), Vec2::ZERO);
        assert_eq!(k.viscosity_laplacian(2.5), 0.0);
        assert!(k.poly6(0.0) > k.poly6(1.0));
    }

    #[test]
    fn test_poly6_integrates_to_one() {
        let k = Kernels::new(1.5);
        let step = 0.01;
        let mut sum = 0.0;
        let n = (k.h / step) as i32 + 1;
        for y in -n..=n {
            for x in -n..=n {
                let r2 = (x as f32 * step).powi(2) + (y as f32 * step).powi(2);
                sum += k.poly6(r2) * step * step;
            }
        }
        assert!((sum - 1.0).abs() < 0.01, "{sum}");
    }

    #[test]
    fn test_separation_is_antisymmetric_when_coincident() {
        let a = separation(Vec2::ZERO, 0.0, 3, 7);
        let b = separation(Vec2::ZERO, 0.0, 7, 3);
        assert!((a + b).length() < 1e-6);
        assert!((a.length() - 1.0).abs() < 1e-5);
    }

    // ========== Step Tests ==========

    #[test]
    fn test_coincident_particles_stay_finite_and_capped() {
        let config = SphConfig {
            max_speed: 25.0,
            ..SphConfig::default()
        };
        let mut particles = vec![particle(16.0, 16.0), particle(16.0, 16.0)];
        run(&mut particles, &config, 1);
        for p in &particles {
            assert!(p.density.is_finite() && p.density > 0.0);
            assert!(p.pressure.is_finite() && p.pressure >= 0.0);
            assert!(p.velocity.length() <= config.max_speed + 1e-4);
        }
        assert_ne!(particles[0].position, particles[1].position);
    }

    #[test]
    fn test_pressure_never_negative() {
        let config = SphConfig::default();
        let mut particles = vec![particle(4.0, 4.0), particle(28.0, 28.0)];
        run(&mut particles, &config, 1);
        assert!(particles.iter().all(|p| p.pressure == 0.0));
    }

    #[test]
    fn test_reflect_keeps_particles_inside() {
        let config = SphConfig {
            max_speed: 1000.0,
            ..SphConfig::default()
        };
        let mut p = particle(1.0, 30.0);
        p.velocity = Vec2::new(-600.0, 600.0);
        assert!(integrate(&mut p, Vec2::ZERO, 0.1, &config, Vec2::new(32.0, 32.0)));
        assert_eq!(p.position, Vec2::new(0.0, 31.0));
        assert!(p.velocity.x > 0.0 && p.velocity.y < 0.0);
    }

    #[test]
    fn test_absorb_removes_escaping_particles() {
        let config = SphConfig {
            boundary: BoundaryPolicy::Absorb,
            ..SphConfig::default()
        };
        let mut p = particle(0.5, 10.0);
        p.velocity = Vec2::new(-50.0, 0.0);
        assert!(!integrate(&mut p, Vec2::ZERO, 0.1, &config, Vec2::new(32.0, 32.0)));
    }

    #[test]
    fn test_non_finite_acceleration_is_dropped() {
        let config = SphConfig::default();
        let mut p = particle(10.0, 10.0);
        assert!(integrate(&mut p, Vec2::new(f32::NAN, 0.0), 0.1, &config, Vec2::new(32.0, 32.0)));
        assert_eq!(p.velocity, Vec2::ZERO);
        assert_eq!(p.position, Vec2::new(10.0, 10.0));
    }

    #[test]
    fn test_spiral_points_fill_disc() {
        let center = Vec2::new(5.0, 5.0);
        let points: Vec<Vec2> = (0..50).map(|i| spiral_point(center, 3.0, i, 50)).collect();
        assert!(points.iter().all(|p| p.distance(center) <= 3.0));
        for (i, a) in points.iter().enumerate() {
            for b in &points[i + 1..] {
                assert!(a.distance(*b) > 0.1);
            }
        }
    }
}

//! Simulation configuration.
//!
//! [`FluidConfig`] gathers every tunable of the engine. All records are plain
//! serde types with `#[serde(default)]`, so a JSON file only needs the keys it
//! changes. Values are clamped when read through [`FluidConfig::sanitized`];
//! nothing here ever fails a step.
//!
//! # Example
//!
//! ```ignore
//! let config = FluidConfig::default()
//!     .with_size(512, 288)
//!     .with_secondary_mode(SecondaryMode::Particles);
//! let json = config.to_json()?;
//! let back = FluidConfig::from_json(&json)?;
//! ```

use std::fs;
use std::path::Path;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::conservation::ConservationConfig;
use crate::error::FluidError;
use crate::field::{clamp_unit, finite_or};
use crate::material::{MaterialPreset, MaterialProps, MAX_VISCOSITY_ITERATIONS};
use crate::ops::{AdvectionScheme, Falloff};

/// Upper bound on any Jacobi iteration count.
pub const MAX_ITERATIONS: u32 = 256;

/// How the secondary layer is represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecondaryMode {
    /// Eulerian grid fields.
    #[default]
    Grid,
    /// SPH particles rasterized into the grid fields each step.
    Particles,
}

/// What happens when a particle spawns into a full arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CapacityPolicy {
    /// Drop the new particle.
    Reject,
    /// Replace the oldest live particle.
    #[default]
    EvictOldest,
}

/// What happens when a particle reaches the container edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundaryPolicy {
    /// Clamp to the edge and reflect the normal velocity.
    #[default]
    Reflect,
    /// Remove the particle.
    Absorb,
}

/// Carrier fluid tunables.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryConfig {
    pub advection: AdvectionScheme,
    /// Per-second velocity decay.
    pub velocity_dissipation: f32,
    /// Per-second dye decay.
    pub dye_dissipation: f32,
    /// Kinematic viscosity; 0 skips the viscosity solve.
    pub viscosity: f32,
    /// Dye diffusion rate; 0 skips dye diffusion.
    pub dye_diffusion: f32,
    pub diffusion_iterations: u32,
    pub pressure_iterations: u32,
    pub vorticity: f32,
    pub max_vorticity_force: f32,
    pub falloff: Falloff,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            advection: AdvectionScheme::MacCormack,
            velocity_dissipation: 0.1,
            dye_dissipation: 0.05,
            viscosity: 0.0,
            dye_diffusion: 0.0,
            diffusion_iterations: 8,
            pressure_iterations: 40,
            vorticity: 10.0,
            max_vorticity_force: 200.0,
            falloff: Falloff::Gaussian,
        }
    }
}

/// Immiscible film tunables.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryConfig {
    pub advection: AdvectionScheme,
    pub velocity_dissipation: f32,
    /// Per-second thickness decay; 0 keeps film indefinitely.
    pub thickness_dissipation: f32,
    /// How quickly coupling falls off with thickness: `f(t) = 1 / (1 + inertia * t)`.
    pub inertia: f32,
    /// Below this thickness the film moves exactly with the carrier.
    pub min_thickness: f32,
    /// When set, coupling is rescaled as `1 - (1 - c)^(dt / reference_dt)`.
    pub coupling_reference_dt: Option<f32>,
    /// Tint diffusion rate; thickness is never diffused.
    pub tint_diffusion: f32,
    pub tint_iterations: u32,
    /// Confinement on the film. Viscous material should not regain swirl, so this defaults to 0.
    pub vorticity: f32,
    pub max_vorticity_force: f32,
    pub max_tension_force: f32,
    /// Upper bound on viscosity sweeps regardless of painted presets.
    pub max_viscosity_iterations: u32,
    /// Properties of cells that have never been painted.
    pub base_props: MaterialProps,
    pub falloff: Falloff,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            advection: AdvectionScheme::MacCormack,
            velocity_dissipation: 0.2,
            thickness_dissipation: 0.0,
            inertia: 4.0,
            min_thickness: 0.01,
            coupling_reference_dt: None,
            tint_diffusion: 0.05,
            tint_iterations: 4,
            vorticity: 0.0,
            max_vorticity_force: 60.0,
            max_tension_force: 40.0,
            max_viscosity_iterations: 32,
            base_props: MaterialPreset::ink().props(),
            falloff: Falloff::Gaussian,
        }
    }
}

/// Particle representation tunables. Lengths are in cells.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphConfig {
    pub capacity: usize,
    pub capacity_policy: CapacityPolicy,
    pub boundary: BoundaryPolicy,
    /// Kernel support radius `h`; also the spatial hash cell size.
    pub smoothing_radius: f32,
    pub particle_mass: f32,
    pub rest_density: f32,
    /// Equation-of-state stiffness `k` in `p = max(0, k (ρ - ρ0))`.
    pub stiffness: f32,
    pub viscosity: f32,
    /// Pull toward neighbours; 0 disables it.
    pub cohesion: f32,
    /// Gentle pull toward the container center.
    pub centering: f32,
    pub max_speed: f32,
    /// Fraction of normal velocity kept on reflection.
    pub restitution: f32,
    pub gravity: Vec2,
    /// Spacing of painted particles as a fraction of `h`.
    pub spawn_spacing: f32,
}

impl Default for SphConfig {
    fn default() -> Self {
        Self {
            capacity: 8192,
            capacity_policy: CapacityPolicy::EvictOldest,
            boundary: BoundaryPolicy::Reflect,
            smoothing_radius: 4.0,
            particle_mass: 1.0,
            rest_density: 0.35,
            stiffness: 60.0,
            viscosity: 0.8,
            cohesion: 0.2,
            centering: 0.02,
            max_speed: 80.0,
            restitution: 0.4,
            gravity: Vec2::ZERO,
            spawn_spacing: 0.5,
        }
    }
}

/// How particles become grid thickness.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterConfig {
    /// Splat radius as a multiple of the smoothing radius.
    pub radius_scale: f32,
    /// Thickness contributed by one particle at its center.
    pub thickness_scale: f32,
    /// Remap summed thickness through a smoothstep band.
    pub metaball: bool,
    pub metaball_low: f32,
    pub metaball_high: f32,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            radius_scale: 1.0,
            thickness_scale: 0.5,
            metaball: true,
            metaball_low: 0.15,
            metaball_high: 0.6,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidConfig {
    pub width: usize,
    pub height: usize,
    /// Largest timestep a single step will integrate.
    pub max_dt: f32,
    pub secondary_mode: SecondaryMode,
    pub primary: PrimaryConfig,
    pub secondary: SecondaryConfig,
    pub conservation: ConservationConfig,
    pub sph: SphConfig,
    pub raster: RasterConfig,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            max_dt: 1.0 / 30.0,
            secondary_mode: SecondaryMode::Grid,
            primary: PrimaryConfig::default(),
            secondary: SecondaryConfig::default(),
            conservation: ConservationConfig::default(),
            sph: SphConfig::default(),
            raster: RasterConfig::default(),
        }
    }
}

impl FluidConfig {
    /// Default configuration at the given grid size.
    pub fn new(width: usize, height: usize) -> Self {
        Self::default().with_size(width, height)
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_max_dt(mut self, max_dt: f32) -> Self {
        self.max_dt = max_dt.max(0.0);
        self
    }

    pub fn with_secondary_mode(mut self, mode: SecondaryMode) -> Self {
        self.secondary_mode = mode;
        self
    }

    pub fn with_pressure_iterations(mut self, iterations: u32) -> Self {
        self.primary.pressure_iterations = iterations.min(MAX_ITERATIONS);
        self
    }

    pub fn with_vorticity(mut self, strength: f32) -> Self {
        self.primary.vorticity = strength.max(0.0);
        self
    }

    pub fn with_conservation(mut self, conservation: ConservationConfig) -> Self {
        self.conservation = conservation;
        self
    }

    pub fn with_sph(mut self, sph: SphConfig) -> Self {
        self.sph = sph;
        self
    }

    /// Parse from JSON. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, FluidError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, FluidError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FluidError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Save to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FluidError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Copy with every value clamped into its valid range.
    pub fn sanitized(&self) -> Self {
        let rate = |v: f32| finite_or(v, 0.0).max(0.0);
        let iterations = |n: u32| n.min(MAX_ITERATIONS);

        let p = &self.primary;
        let primary = PrimaryConfig {
            advection: p.advection,
            velocity_dissipation: rate(p.velocity_dissipation),
            dye_dissipation: rate(p.dye_dissipation),
            viscosity: rate(p.viscosity),
            dye_diffusion: rate(p.dye_diffusion),
            diffusion_iterations: iterations(p.diffusion_iterations),
            pressure_iterations: iterations(p.pressure_iterations),
            vorticity: rate(p.vorticity),
            max_vorticity_force: rate(p.max_vorticity_force),
            falloff: p.falloff,
        };

        let s = &self.secondary;
        let secondary = SecondaryConfig {
            advection: s.advection,
            velocity_dissipation: rate(s.velocity_dissipation),
            thickness_dissipation: rate(s.thickness_dissipation),
            inertia: rate(s.inertia),
            min_thickness: clamp_unit(s.min_thickness),
            coupling_reference_dt: s.coupling_reference_dt.filter(|dt| dt.is_finite() && *dt > 0.0),
            tint_diffusion: rate(s.tint_diffusion),
            tint_iterations: iterations(s.tint_iterations),
            vorticity: rate(s.vorticity),
            max_vorticity_force: rate(s.max_vorticity_force),
            max_tension_force: rate(s.max_tension_force),
            max_viscosity_iterations: s.max_viscosity_iterations.clamp(1, MAX_VISCOSITY_ITERATIONS),
            base_props: MaterialProps {
                coupling: clamp_unit(s.base_props.coupling),
                viscosity: rate(s.base_props.viscosity),
                tension: rate(s.base_props.tension),
                drag: rate(s.base_props.drag),
            },
            falloff: s.falloff,
        };

        let h = &self.sph;
        let smoothing_radius = finite_or(h.smoothing_radius, 4.0).clamp(0.5, 64.0);
        let sph = SphConfig {
            capacity: h.capacity,
            capacity_policy: h.capacity_policy,
            boundary: h.boundary,
            smoothing_radius,
            particle_mass: finite_or(h.particle_mass, 1.0).max(1e-6),
            rest_density: finite_or(h.rest_density, 1.0).max(1e-6),
            stiffness: rate(h.stiffness),
            viscosity: rate(h.viscosity),
            cohesion: rate(h.cohesion),
            centering: rate(h.centering),
            max_speed: rate(h.max_speed),
            restitution: clamp_unit(h.restitution),
            gravity: if h.gravity.is_finite() { h.gravity } else { Vec2::ZERO },
            spawn_spacing: finite_or(h.spawn_spacing, 0.5).clamp(0.05, 4.0),
        };

        let r = &self.raster;
        let metaball_low = clamp_unit(r.metaball_low);
        let raster = RasterConfig {
            radius_scale: finite_or(r.radius_scale, 1.0).clamp(0.1, 4.0),
            thickness_scale: rate(r.thickness_scale),
            metaball: r.metaball,
            metaball_low,
            metaball_high: clamp_unit(r.metaball_high).max(metaball_low),
        };

        Self {
            width: self.width,
            height: self.height,
            max_dt: finite_or(self.max_dt, 1.0 / 30.0).max(0.0),
            secondary_mode: self.secondary_mode,
            primary,
            secondary,
            conservation: self.conservation.sanitized(),
            sph,
            raster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FluidConfig::default();
        assert_eq!(config.secondary_mode, SecondaryMode::Grid);
        assert_eq!(config.secondary.vorticity, 0.0);
        assert!(config.secondary.coupling_reference_dt.is_none());
        assert_eq!(config, config.sanitized());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = FluidConfig::new(64, 32).with_secondary_mode(SecondaryMode::Particles);
        let json = config.to_json().unwrap();
        let back = FluidConfig::from_json(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_partial_json() {
        let config = FluidConfig::from_json(r#"{ "width": 10, "primary": { "vorticity": 3.0 } }"#).unwrap();
        assert_eq!(config.width, 10);
        assert_eq!(config.height, FluidConfig::default().height);
        assert_eq!(config.primary.vorticity, 3.0);
        assert_eq!(config.primary.pressure_iterations, PrimaryConfig::default().pressure_iterations);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(FluidConfig::from_json("{ width: "), Err(FluidError::Config(_))));
    }

    #[test]
    fn test_sanitized_clamps() {
        let mut config = FluidConfig::default();
        config.max_dt = f32::NAN;
        config.primary.pressure_iterations = 100_000;
        config.secondary.min_thickness = 4.0;
        config.secondary.coupling_reference_dt = Some(-1.0);
        config.sph.smoothing_radius = 0.0;
        config.sph.restitution = 2.0;
        config.raster.metaball_low = 0.8;
        config.raster.metaball_high = 0.2;

        let clean = config.sanitized();
        assert_eq!(clean.max_dt, 1.0 / 30.0);
        assert_eq!(clean.primary.pressure_iterations, MAX_ITERATIONS);
        assert_eq!(clean.secondary.min_thickness, 1.0);
        assert!(clean.secondary.coupling_reference_dt.is_none());
        assert_eq!(clean.sph.smoothing_radius, 0.5);
        assert_eq!(clean.sph.restitution, 1.0);
        assert!(clean.raster.metaball_high >= clean.raster.metaball_low);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("tpfe-config-{}.json", std::process::id()));
        let config = FluidConfig::new(40, 20).with_vorticity(2.5);
        config.save(&path).unwrap();
        let loaded = FluidConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(config, loaded);
    }
}

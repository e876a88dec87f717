//! The engine facade.
//!
//! [`FluidSim`] owns both layers, the material library, the two conservation
//! controllers and, in particle mode, the particle arena. A driver calls
//! [`FluidSim::step`] once per frame and reads fields back through
//! [`FluidSim::field`].
//!
//! # Example
//!
//! ```no_run
//! use tpfe::prelude::*;
//!
//! let mut sim = FluidSim::new(FluidConfig::new(128, 128)).unwrap();
//! sim.paint(Vec2::new(0.5, 0.5), 0.1, 0.8, &MaterialPreset::oil());
//! let push = Impulse::new(Vec2::new(0.3, 0.5), 0.05).with_velocity(Vec2::new(40.0, 0.0));
//! sim.step(1.0 / 60.0, &[push]);
//! let thickness = sim.field(FieldName::SecondaryScalar).last(64, 64);
//! # let _ = thickness;
//! ```

use glam::{Vec2, Vec4};
use serde::{Deserialize, Serialize};

use crate::config::{FluidConfig, SecondaryMode};
use crate::conservation::{damp, ConservationController, DampTarget, OccupancyProbe};
use crate::error::FluidError;
use crate::field::{clamp_unit, finite_or, FieldView};
use crate::layer::{CouplingParams, LayerId, PaintStroke, PrimaryLayer, SecondaryLayer};
use crate::material::{BlendPolicy, MaterialId, MaterialLibrary, MaterialPreset, ThicknessWeighted};
use crate::particle::ParticleSystem;

/// Buoyancy kick in grid heights per second, per unit of buoyancy and paint strength.
const BUOYANCY_SCALE: f32 = 0.05;

/// One forcing event, applied before the step's passes.
///
/// `position` is normalized `[0, 1]²` with y down. `radius` is a fraction
/// of the grid height. `velocity_delta` is in cells per second.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Impulse {
    pub position: Vec2,
    pub radius: f32,
    pub velocity_delta: Vec2,
    /// Premultiplied dye added to the primary layer. With a material, `w` is
    /// the paint strength instead.
    pub scalar_delta: Vec4,
    /// Deposit this material into the secondary layer instead of dye.
    pub material: Option<MaterialId>,
}

impl Impulse {
    pub fn new(position: Vec2, radius: f32) -> Self {
        Self {
            position,
            radius,
            velocity_delta: Vec2::ZERO,
            scalar_delta: Vec4::ZERO,
            material: None,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec2) -> Self {
        self.velocity_delta = velocity;
        self
    }

    pub fn with_dye(mut self, dye: Vec4) -> Self {
        self.scalar_delta = dye;
        self
    }

    /// Paint `material` at strength `strength`.
    pub fn with_material(mut self, material: MaterialId, strength: f32) -> Self {
        self.material = Some(material);
        self.scalar_delta.w = strength;
        self
    }

    fn is_valid(&self) -> bool {
        self.position.is_finite() && self.radius.is_finite() && self.radius > 0.0
    }
}

/// Fields exposed for presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldName {
    PrimaryVelocity,
    /// Premultiplied dye RGB plus concentration.
    PrimaryScalar,
    SecondaryVelocity,
    /// Straight tint RGB plus thickness.
    SecondaryScalar,
    /// `{coupling, viscosity, tension, drag}` per cell.
    MaterialProps,
    Pressure,
    Curl,
}

/// Two-phase fluid engine.
#[derive(Debug)]
pub struct FluidSim {
    config: FluidConfig,
    primary: PrimaryLayer,
    secondary: SecondaryLayer,
    particles: Option<ParticleSystem>,
    primary_conservation: ConservationController,
    secondary_conservation: ConservationController,
    materials: MaterialLibrary,
    blend: Box<dyn BlendPolicy>,
    steps: u64,
}

impl FluidSim {
    /// Allocate every field for `config`'s grid size.
    pub fn new(config: FluidConfig) -> Result<Self, FluidError> {
        let config = config.sanitized();
        let (w, h) = (config.width, config.height);
        let primary = PrimaryLayer::new(w, h)?;
        let secondary = SecondaryLayer::new(w, h, config.secondary.base_props)?;
        let particles = match config.secondary_mode {
            SecondaryMode::Grid => None,
            SecondaryMode::Particles => Some(ParticleSystem::new(&config.sph, w, h)),
        };
        log::info!("fluid engine created at {}x{} ({:?} secondary)", w, h, config.secondary_mode);

        Ok(Self {
            primary_conservation: ConservationController::new(config.conservation.primary, DampTarget::AllChannels),
            secondary_conservation: ConservationController::new(config.conservation.secondary, DampTarget::LastChannel),
            config,
            primary,
            secondary,
            particles,
            materials: MaterialLibrary::builtin(),
            blend: Box::new(ThicknessWeighted),
            steps: 0,
        })
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    /// `(width, height)` in cells.
    pub fn size(&self) -> (usize, usize) {
        (self.config.width, self.config.height)
    }

    /// Steps that advanced time.
    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Apply `impulses`, then advance both layers by `dt` seconds.
    ///
    /// `dt` is clamped to `max_dt`. A zero, negative or non-finite `dt` still
    /// applies the impulses but runs no passes.
    pub fn step(&mut self, dt: f32, impulses: &[Impulse]) {
        let dt = self.guard_dt(dt);
        if self.is_empty() {
            return;
        }

        for impulse in impulses {
            self.apply_impulse(impulse);
        }
        if dt <= 0.0 {
            return;
        }

        self.primary.step(dt, &self.config.primary);
        match self.particles.as_mut() {
            None => {
                self.secondary
                    .step(dt, self.primary.layer.velocity.view(), &self.config.secondary);
            }
            Some(particles) => {
                particles.couple(
                    self.primary.layer.velocity.view(),
                    self.secondary.props(),
                    dt,
                    &self.config.sph,
                    &CouplingParams::from(&self.config.secondary),
                );
                particles.step(dt, &self.config.sph);
                particles.rasterize(
                    &mut self.secondary.layer,
                    self.primary.layer.velocity.view(),
                    self.config.secondary.min_thickness,
                    &self.config.raster,
                );
            }
        }

        self.conserve();
        self.steps += 1;
    }

    fn guard_dt(&self, dt: f32) -> f32 {
        if !dt.is_finite() || dt < 0.0 {
            log::warn!("ignoring invalid timestep {}", dt);
            return 0.0;
        }
        dt.min(self.config.max_dt)
    }

    fn is_empty(&self) -> bool {
        self.config.width == 0 || self.config.height == 0
    }

    fn to_cells(&self, uv: Vec2) -> Vec2 {
        uv * Vec2::new(self.config.width as f32, self.config.height as f32)
    }

    fn apply_impulse(&mut self, impulse: &Impulse) {
        if !impulse.is_valid() {
            log::warn!("rejected impulse at {:?} with radius {}", impulse.position, impulse.radius);
            return;
        }
        let center = self.to_cells(impulse.position);
        let radius = impulse.radius * self.config.height as f32;
        let velocity = if impulse.velocity_delta.is_finite() {
            impulse.velocity_delta
        } else {
            Vec2::ZERO
        };

        let Some(id) = impulse.material else {
            let dye = Vec4::from_array(impulse.scalar_delta.to_array().map(|v| finite_or(v, 0.0)));
            self.primary
                .apply_impulse(center, radius, velocity, dye, self.config.primary.falloff);
            if dye.max_element() > 0.0 {
                self.primary_conservation.record_inflow();
            }
            return;
        };

        self.primary
            .apply_impulse(center, radius, velocity, Vec4::ZERO, self.config.primary.falloff);
        match self.materials.get(id).cloned() {
            Some(preset) => self.paint(impulse.position, impulse.radius, impulse.scalar_delta.w, &preset),
            None => log::warn!("impulse references unknown material {:?}", id),
        }
    }

    fn conserve(&mut self) {
        let config = &self.config.conservation;
        if !config.enabled {
            return;
        }
        self.primary_conservation.tick(&mut self.primary.layer.scalar, config);

        match self.particles.as_mut() {
            None => {
                self.secondary_conservation.tick(&mut self.secondary.layer.scalar, config);
            }
            Some(particles) => {
                if !self.secondary_conservation.advance(config) {
                    return;
                }
                let scalar = &mut self.secondary.layer.scalar;
                if let Some(damping) = self.secondary_conservation.measure(scalar.view(), config) {
                    particles.damp(&damping, config, scalar.view());
                    damp(scalar, &damping, config, DampTarget::LastChannel);
                }
            }
        }
    }

    /// Deposit `preset` at normalized `position`.
    ///
    /// `radius` is a fraction of the grid height and `strength` the thickness
    /// added at the center. Painting also makes the preset's conservation band
    /// govern later secondary checks, and gives the carrier the preset's
    /// buoyancy kick. In particle mode the film is seeded as particles.
    pub fn paint(&mut self, position: Vec2, radius: f32, strength: f32, preset: &MaterialPreset) {
        if self.is_empty() {
            return;
        }
        if !position.is_finite() || !radius.is_finite() || !(radius > 0.0) || !(strength > 0.0) {
            log::warn!("rejected paint at {:?} (radius {}, strength {})", position, radius, strength);
            return;
        }
        let preset = preset.sanitized();
        let strength = clamp_unit(strength);
        let stroke = PaintStroke {
            center: self.to_cells(position),
            radius: radius * self.config.height as f32,
            strength,
            falloff: self.config.secondary.falloff,
        };

        self.secondary
            .paint(&stroke, &preset, self.blend.as_ref(), &self.config.secondary);
        self.secondary_conservation.record_inflow();
        if let Some(particles) = self.particles.as_mut() {
            particles.seed(
                stroke.center,
                stroke.radius,
                preset.tint * preset.occlusion,
                strength,
                &self.config.sph,
            );
        }

        if preset.buoyancy != 0.0 {
            // Rows run top-down, so up is -y.
            let kick = Vec2::new(0.0, -preset.buoyancy * strength * BUOYANCY_SCALE * self.config.height as f32);
            self.primary
                .apply_impulse(stroke.center, stroke.radius, kick, Vec4::ZERO, self.config.primary.falloff);
        }

        self.secondary_conservation.set_thresholds(preset.conservation);
    }

    /// Last valid occupancy estimate for `layer`, in `[0, 1]`.
    pub fn occupancy(&self, layer: LayerId) -> f32 {
        match layer {
            LayerId::Primary => self.primary_conservation.occupancy(),
            LayerId::Secondary => self.secondary_conservation.occupancy(),
        }
    }

    pub fn conservation(&self, layer: LayerId) -> &ConservationController {
        match layer {
            LayerId::Primary => &self.primary_conservation,
            LayerId::Secondary => &self.secondary_conservation,
        }
    }

    /// Read-only view of one field.
    pub fn field(&self, name: FieldName) -> FieldView<'_> {
        match name {
            FieldName::PrimaryVelocity => self.primary.layer.velocity.view(),
            FieldName::PrimaryScalar => self.primary.layer.scalar.view(),
            FieldName::SecondaryVelocity => self.secondary.layer.velocity.view(),
            FieldName::SecondaryScalar => self.secondary.layer.scalar.view(),
            FieldName::MaterialProps => self.secondary.props(),
            FieldName::Pressure => self.primary.pressure(),
            FieldName::Curl => self.primary.curl(),
        }
    }

    /// Reallocate at a new size, bilinearly resampling existing content.
    ///
    /// Everything is allocated before anything is replaced, so a failed
    /// allocation leaves the engine as it was.
    pub fn resize(&mut self, width: usize, height: usize) -> Result<(), FluidError> {
        if (width, height) == self.size() {
            return Ok(());
        }
        let primary = self.primary.resampled(width, height)?;
        let secondary = self.secondary.resampled(width, height)?;
        let particles = self
            .particles
            .as_ref()
            .map(|particles| particles.resized(width, height))
            .transpose()?;

        self.primary = primary;
        self.secondary = secondary;
        self.particles = particles;
        log::info!("resized from {}x{} to {}x{}", self.config.width, self.config.height, width, height);
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    pub fn materials(&self) -> &MaterialLibrary {
        &self.materials
    }

    pub fn materials_mut(&mut self) -> &mut MaterialLibrary {
        &mut self.materials
    }

    /// Replace the law used to merge material properties at paint time.
    pub fn set_blend_policy(&mut self, policy: Box<dyn BlendPolicy>) {
        self.blend = policy;
    }

    pub fn set_occupancy_probe(&mut self, layer: LayerId, probe: Box<dyn OccupancyProbe>) {
        match layer {
            LayerId::Primary => self.primary_conservation.set_probe(probe),
            LayerId::Secondary => self.secondary_conservation.set_probe(probe),
        }
    }

    /// Switch the secondary representation.
    ///
    /// Entering particle mode starts with an empty arena; the grid film is
    /// replaced by the rasterized particles on the next step. Leaving it
    /// keeps the last rasterized film as grid content.
    pub fn set_secondary_mode(&mut self, mode: SecondaryMode) {
        if mode == self.config.secondary_mode {
            return;
        }
        self.particles = match mode {
            SecondaryMode::Grid => None,
            SecondaryMode::Particles => Some(ParticleSystem::new(
                &self.config.sph,
                self.config.width,
                self.config.height,
            )),
        };
        log::info!("secondary layer switched to {:?}", mode);
        self.config.secondary_mode = mode;
    }

    pub fn particles(&self) -> Option<&ParticleSystem> {
        self.particles.as_ref()
    }

    pub fn primary(&self) -> &PrimaryLayer {
        &self.primary
    }

    pub fn secondary(&self) -> &SecondaryLayer {
        &self.secondary
    }

    /// Direct access for drivers that seed or edit content.
    pub fn primary_mut(&mut self) -> &mut PrimaryLayer {
        &mut self.primary
    }

    /// Direct access for drivers that seed or edit content.
    ///
    /// Material properties stay read-only here; change them with [`FluidSim::paint`].
    pub fn secondary_mut(&mut self) -> &mut SecondaryLayer {
        &mut self.secondary
    }
}

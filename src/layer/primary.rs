//! The carrier fluid.

use glam::{Vec2, Vec4};

use crate::config::PrimaryConfig;
use crate::error::FluidError;
use crate::field::FieldView;
use crate::layer::Layer;
use crate::ops::{self, Confinement, Falloff, Projector};

/// Incompressible carrier with premultiplied dye.
#[derive(Clone, Debug)]
pub struct PrimaryLayer {
    pub layer: Layer,
    projector: Projector,
    confinement: Confinement,
}

impl PrimaryLayer {
    pub fn new(width: usize, height: usize) -> Result<Self, FluidError> {
        Ok(Self {
            layer: Layer::new(width, height)?,
            projector: Projector::new(width, height)?,
            confinement: Confinement::new(width, height)?,
        })
    }

    /// Resample into a new layer of the given size, leaving `self` untouched.
    pub fn resampled(&self, width: usize, height: usize) -> Result<Self, FluidError> {
        Ok(Self {
            layer: self.layer.resampled(width, height)?,
            projector: Projector::new(width, height)?,
            confinement: Confinement::new(width, height)?,
        })
    }

    /// Add a radial velocity and dye impulse. Positions and radius are in cells.
    pub fn apply_impulse(&mut self, center: Vec2, radius: f32, velocity: Vec2, dye: Vec4, falloff: Falloff) {
        ops::splat_vector(&mut self.layer.velocity, center, radius, velocity, falloff);
        ops::splat_scalar(&mut self.layer.scalar, center, radius, &dye.to_array(), falloff);
    }

    /// Advect, diffuse, project and confine.
    pub fn step(&mut self, dt: f32, config: &PrimaryConfig) {
        let layer = &mut self.layer;

        ops::advect_velocity(&mut layer.velocity, dt, config.velocity_dissipation);
        if config.viscosity > 0.0 {
            ops::diffuse(&mut layer.velocity, config.viscosity, dt, config.diffusion_iterations, false);
        }
        self.projector.project(&mut layer.velocity, config.pressure_iterations);

        ops::advect(
            &mut layer.scalar,
            layer.velocity.view(),
            dt,
            config.dye_dissipation,
            config.advection,
        );
        if config.dye_diffusion > 0.0 {
            ops::diffuse(&mut layer.scalar, config.dye_diffusion, dt, config.diffusion_iterations, false);
        }

        self.confinement
            .apply(&mut layer.velocity, config.vorticity, dt, config.max_vorticity_force);
    }

    /// Pressure from the most recent projection.
    pub fn pressure(&self) -> FieldView<'_> {
        self.projector.pressure()
    }

    /// Curl from the most recent confinement pass.
    pub fn curl(&self) -> FieldView<'_> {
        self.confinement.curl()
    }
}

//! The immiscible film.
//!
//! Every operator here reads its coefficients from the per-pixel property
//! field, so films of different materials coexist side by side. The property
//! field only changes when paint lands on it. The viscosity sweep count is
//! recomputed every step from the materials that still have film on them.

use glam::{Vec2, Vec3};
use rayon::prelude::*;

use crate::config::SecondaryConfig;
use crate::error::FluidError;
use crate::field::{clamp_unit, finite_or, smoothstep, Field, FieldView};
use crate::layer::coupling::{couple, CouplingParams};
use crate::layer::tension::apply_surface_tension;
use crate::layer::Layer;
use crate::material::{BlendPolicy, MaterialPreset, MaterialProps, PROPERTY_CHANNELS};
use crate::ops::{self, Confinement, Falloff};

/// Where and how hard a preset is painted. Lengths are in cells.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaintStroke {
    pub center: Vec2,
    pub radius: f32,
    /// Thickness deposited at the stroke center, `[0, 1]`.
    pub strength: f32,
    pub falloff: Falloff,
}

impl PaintStroke {
    /// Thickness deposited at `cell`, or 0 outside the stroke.
    #[inline]
    pub fn deposit(&self, x: usize, y: usize) -> f32 {
        let d = Vec2::new(x as f32, y as f32) - self.center;
        clamp_unit(self.strength) * self.falloff.weight(d.length_squared(), self.radius)
    }

    fn is_valid(&self) -> bool {
        self.center.is_finite() && self.radius.is_finite() && self.radius > 0.0 && self.strength > 0.0
    }
}

/// Film velocity and scalars plus its material properties.
#[derive(Clone, Debug)]
pub struct SecondaryLayer {
    pub layer: Layer,
    props: Field,
    /// Viscosity sweeps asked for by the material painted at each cell.
    sweeps: Field,
    confinement: Confinement,
}

impl SecondaryLayer {
    /// Allocate with every cell set to `base` properties.
    pub fn new(width: usize, height: usize, base: MaterialProps) -> Result<Self, FluidError> {
        let mut props = Field::new(width, height, PROPERTY_CHANNELS)?;
        props.pass(|_, _, _, out| base.write(out));
        Ok(Self {
            layer: Layer::new(width, height)?,
            props,
            sweeps: Field::new(width, height, 1)?,
            confinement: Confinement::new(width, height)?,
        })
    }

    /// Resample into a new layer of the given size, leaving `self` untouched.
    pub fn resampled(&self, width: usize, height: usize) -> Result<Self, FluidError> {
        Ok(Self {
            layer: self.layer.resampled(width, height)?,
            props: self.props.resampled(width, height)?,
            sweeps: self.sweeps.resampled(width, height)?,
            confinement: Confinement::new(width, height)?,
        })
    }

    /// Per-pixel `{coupling, viscosity, tension, drag}`.
    pub fn props(&self) -> FieldView<'_> {
        self.props.view()
    }

    /// Properties at one cell.
    pub fn props_at(&self, x: usize, y: usize) -> MaterialProps {
        MaterialProps::from_cell(self.props.view().cell(x, y))
    }

    /// Viscosity sweeps the next step will run: the largest count asked for
    /// by any cell still carrying at least `min_thickness` of film.
    pub fn viscosity_iterations(&self, config: &SecondaryConfig) -> u32 {
        let scalar = self.layer.scalar.view();
        let channels = scalar.channels();
        let min_thickness = config.min_thickness;
        let live = self
            .sweeps
            .data()
            .par_iter()
            .zip(scalar.data().par_chunks(channels))
            .filter(|(_, cell)| cell[channels - 1] >= min_thickness)
            .map(|(sweeps, _)| finite_or(*sweeps, 0.0))
            .reduce(|| 0.0, f32::max);
        (live.round() as u32).clamp(1, config.max_viscosity_iterations.max(1))
    }

    /// Deposit `preset` along `stroke`.
    ///
    /// Thickness is added and clamped. Tint mixes by `color_mix`, weighted by
    /// thickness. Properties are merged by `policy`. Cells outside the stroke
    /// are untouched.
    pub fn paint(&mut self, stroke: &PaintStroke, preset: &MaterialPreset, policy: &dyn BlendPolicy, config: &SecondaryConfig) {
        if !stroke.is_valid() {
            return;
        }
        let preset = preset.sanitized();
        let incoming = preset.props();
        let sweeps = preset.viscosity_iterations as f32;

        {
            let scalar = self.layer.scalar.view();
            self.props.pass(|x, y, src, out| {
                let added = stroke.deposit(x, y);
                let existing = MaterialProps::from_cell(src.cell(x, y));
                if added < 1e-4 {
                    existing.write(out);
                    return;
                }
                policy.blend(existing, scalar.last(x, y), incoming, added).write(out);
            });
            // Sweeps left behind by film that is already gone do not carry over.
            self.sweeps.pass(|x, y, src, out| {
                let existing = src.at(x, y, 0);
                out[0] = if stroke.deposit(x, y) < 1e-4 {
                    existing
                } else if scalar.last(x, y) >= config.min_thickness {
                    existing.max(sweeps)
                } else {
                    sweeps
                };
            });
        }

        let deposited = preset.tint * preset.occlusion;
        let settle = 4.0 * config.min_thickness.max(1e-3);
        self.layer.scalar.pass(|x, y, src, out| {
            let cell = src.cell(x, y);
            let added = stroke.deposit(x, y);
            if added < 1e-4 {
                out.copy_from_slice(cell);
                return;
            }
            let thickness = finite_or(cell[3], 0.0).max(0.0);
            let share = added / (thickness + added);
            // Fresh film takes the new tint outright; settled film mixes by color_mix.
            let mix = share * (1.0 - smoothstep(0.0, settle, thickness) * (1.0 - preset.color_mix));
            let tint = Vec3::new(cell[0], cell[1], cell[2]).lerp(deposited, mix);
            out[0] = clamp_unit(tint.x);
            out[1] = clamp_unit(tint.y);
            out[2] = clamp_unit(tint.z);
            out[3] = clamp_unit(thickness + added);
        });
    }

    /// Couple, apply tension and drag, then advect and diffuse.
    pub fn step(&mut self, dt: f32, primary_velocity: FieldView<'_>, config: &SecondaryConfig) {
        if !(dt > 0.0) {
            return;
        }
        let sweeps = self.viscosity_iterations(config);
        let props = self.props.view();
        let layer = &mut self.layer;

        couple(
            &mut layer.velocity,
            primary_velocity,
            layer.scalar.view(),
            props,
            dt,
            &CouplingParams::from(config),
        );
        apply_surface_tension(&mut layer.velocity, layer.scalar.view(), props, dt, config.max_tension_force);
        layer.velocity.pass(|x, y, src, out| {
            let keep = 1.0 / (1.0 + finite_or(props.at(x, y, 3), 0.0).max(0.0) * dt);
            out[0] = src.at(x, y, 0) * keep;
            out[1] = src.at(x, y, 1) * keep;
        });

        ops::advect_velocity(&mut layer.velocity, dt, config.velocity_dissipation);
        ops::diffuse_with(&mut layer.velocity, dt, sweeps, false, |x, y| props.at(x, y, 1));
        self.confinement
            .apply(&mut layer.velocity, config.vorticity, dt, config.max_vorticity_force);

        ops::advect(&mut layer.scalar, layer.velocity.view(), dt, 0.0, config.advection);
        if config.thickness_dissipation > 0.0 {
            let keep = 1.0 / (1.0 + config.thickness_dissipation * dt);
            layer.scalar.pass(|x, y, src, out| {
                out.copy_from_slice(src.cell(x, y));
                out[3] *= keep;
            });
        }
        if config.tint_diffusion > 0.0 {
            ops::diffuse(&mut layer.scalar, config.tint_diffusion, dt, config.tint_iterations, true);
        }
    }
}

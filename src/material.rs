//! Material presets and the per-pixel property field.
//!
//! A [`MaterialPreset`] is a plain immutable record. Painting blends a preset
//! into the secondary layer's property field at the painted location only.
//! Nothing is ever switched globally, so several materials coexist side by side.
//!
//! # Property Channels
//!
//! | Channel | Meaning |
//! |---------|---------|
//! | 0 | coupling strength to the primary flow |
//! | 1 | viscosity rate |
//! | 2 | surface tension |
//! | 3 | velocity drag |
//!
//! How overlapping materials merge is decided by a [`BlendPolicy`]. The
//! default, [`ThicknessWeighted`], is a convex combination weighted by
//! existing and deposited thickness.

use std::fmt;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::conservation::ConservationThresholds;
use crate::field::{clamp_unit, finite_or};

/// Number of channels in the property field.
pub const PROPERTY_CHANNELS: usize = 4;

/// Upper bound on per-preset viscosity sweeps.
pub const MAX_VISCOSITY_ITERATIONS: u32 = 64;

/// Per-cell material properties read by every secondary-layer operator.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct MaterialProps {
    /// Fraction of primary velocity transferred per step (before thickness falloff).
    pub coupling: f32,
    /// Viscosity diffusion rate.
    pub viscosity: f32,
    /// Surface tension coefficient.
    pub tension: f32,
    /// Per-second velocity drag.
    pub drag: f32,
}

impl MaterialProps {
    /// Read from a property-field cell.
    #[inline]
    pub fn from_cell(cell: &[f32]) -> Self {
        Self {
            coupling: cell[0],
            viscosity: cell[1],
            tension: cell[2],
            drag: cell[3],
        }
    }

    /// Write into a property-field cell.
    #[inline]
    pub fn write(&self, cell: &mut [f32]) {
        cell[0] = self.coupling;
        cell[1] = self.viscosity;
        cell[2] = self.tension;
        cell[3] = self.drag;
    }

    /// Linear interpolation toward `other`.
    #[inline]
    pub fn lerp(self, other: Self, t: f32) -> Self {
        let t = clamp_unit(t);
        let mix = |a: f32, b: f32| a + (b - a) * t;
        Self {
            coupling: mix(self.coupling, other.coupling),
            viscosity: mix(self.viscosity, other.viscosity),
            tension: mix(self.tension, other.tension),
            drag: mix(self.drag, other.drag),
        }
    }
}

/// A named material: everything paint needs to deposit it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialPreset {
    pub name: String,
    /// Coupling strength to the primary flow, `[0, 1]`.
    pub coupling: f32,
    /// Viscosity diffusion rate.
    pub viscosity: f32,
    /// Jacobi sweeps used while this material is present.
    pub viscosity_iterations: u32,
    pub surface_tension: f32,
    pub drag: f32,
    /// How strongly the film hides what is beneath it; premultiplies the deposited tint.
    pub occlusion: f32,
    pub tint: Vec3,
    /// Conservation band applied to the secondary layer after painting this preset.
    pub conservation: ConservationThresholds,
    /// How much new tint mixes into existing film, `[0, 1]`.
    pub color_mix: f32,
    /// Upward velocity kick given to the primary flow per unit paint strength.
    pub buoyancy: f32,
}

impl Default for MaterialPreset {
    fn default() -> Self {
        Self::ink()
    }
}

impl MaterialPreset {
    /// Thin, fully coupled ink.
    pub fn ink() -> Self {
        Self {
            name: "ink".into(),
            coupling: 0.9,
            viscosity: 0.05,
            viscosity_iterations: 4,
            surface_tension: 0.0,
            drag: 0.1,
            occlusion: 0.8,
            tint: Vec3::new(0.08, 0.1, 0.35),
            conservation: ConservationThresholds::secondary(),
            color_mix: 0.6,
            buoyancy: 0.0,
        }
    }

    /// Oil: beads up, loosely coupled, floats.
    pub fn oil() -> Self {
        Self {
            name: "oil".into(),
            coupling: 0.35,
            viscosity: 0.6,
            viscosity_iterations: 12,
            surface_tension: 2.0,
            drag: 0.4,
            occlusion: 0.5,
            tint: Vec3::new(0.9, 0.75, 0.2),
            conservation: ConservationThresholds {
                upper: 0.9,
                lower: 0.75,
                interval: 45,
            },
            color_mix: 0.3,
            buoyancy: 1.5,
        }
    }

    /// Honey: heavy, slow, barely follows the carrier.
    pub fn honey() -> Self {
        Self {
            name: "honey".into(),
            coupling: 0.1,
            viscosity: 4.0,
            viscosity_iterations: 30,
            surface_tension: 0.8,
            drag: 1.5,
            occlusion: 0.9,
            tint: Vec3::new(0.85, 0.5, 0.05),
            conservation: ConservationThresholds {
                upper: 0.92,
                lower: 0.8,
                interval: 60,
            },
            color_mix: 0.2,
            buoyancy: -0.5,
        }
    }

    /// Watercolor: thin wash that mixes freely.
    pub fn watercolor() -> Self {
        Self {
            name: "watercolor".into(),
            coupling: 0.7,
            viscosity: 0.2,
            viscosity_iterations: 6,
            surface_tension: 0.1,
            drag: 0.2,
            occlusion: 0.35,
            tint: Vec3::new(0.7, 0.2, 0.45),
            conservation: ConservationThresholds::secondary(),
            color_mix: 0.9,
            buoyancy: 0.0,
        }
    }

    /// Mercury: strong tension, almost no coupling.
    pub fn mercury() -> Self {
        Self {
            name: "mercury".into(),
            coupling: 0.05,
            viscosity: 0.3,
            viscosity_iterations: 8,
            surface_tension: 6.0,
            drag: 0.8,
            occlusion: 1.0,
            tint: Vec3::new(0.75, 0.78, 0.8),
            conservation: ConservationThresholds {
                upper: 0.9,
                lower: 0.78,
                interval: 60,
            },
            color_mix: 0.05,
            buoyancy: -1.0,
        }
    }

    /// Set the coupling strength.
    pub fn with_coupling(mut self, coupling: f32) -> Self {
        self.coupling = clamp_unit(coupling);
        self
    }

    /// Set viscosity rate and sweep count.
    pub fn with_viscosity(mut self, viscosity: f32, iterations: u32) -> Self {
        self.viscosity = viscosity.max(0.0);
        self.viscosity_iterations = iterations.clamp(1, MAX_VISCOSITY_ITERATIONS);
        self
    }

    /// Set the surface tension.
    pub fn with_surface_tension(mut self, tension: f32) -> Self {
        self.surface_tension = tension.max(0.0);
        self
    }

    /// Set the tint.
    pub fn with_tint(mut self, tint: Vec3) -> Self {
        self.tint = tint.clamp(Vec3::ZERO, Vec3::ONE);
        self
    }

    /// Copy with every value clamped into its valid range.
    pub fn sanitized(&self) -> Self {
        let tint = Vec3::new(clamp_unit(self.tint.x), clamp_unit(self.tint.y), clamp_unit(self.tint.z));
        Self {
            name: self.name.clone(),
            coupling: clamp_unit(self.coupling),
            viscosity: finite_or(self.viscosity, 0.0).clamp(0.0, 50.0),
            viscosity_iterations: self.viscosity_iterations.clamp(1, MAX_VISCOSITY_ITERATIONS),
            surface_tension: finite_or(self.surface_tension, 0.0).clamp(0.0, 20.0),
            drag: finite_or(self.drag, 0.0).clamp(0.0, 20.0),
            occlusion: clamp_unit(self.occlusion),
            tint,
            conservation: self.conservation.sanitized(),
            color_mix: clamp_unit(self.color_mix),
            buoyancy: finite_or(self.buoyancy, 0.0).clamp(-50.0, 50.0),
        }
    }

    /// The property vector this preset deposits.
    pub fn props(&self) -> MaterialProps {
        let clean = self.sanitized();
        MaterialProps {
            coupling: clean.coupling,
            viscosity: clean.viscosity,
            tension: clean.surface_tension,
            drag: clean.drag,
        }
    }
}

/// Law for merging deposited material properties into existing ones.
///
/// Implementations must return a convex combination of the two inputs.
pub trait BlendPolicy: Send + Sync + fmt::Debug {
    /// Merge `incoming` (deposited with `added` thickness) into `existing` (present at `thickness`).
    fn blend(&self, existing: MaterialProps, thickness: f32, incoming: MaterialProps, added: f32) -> MaterialProps;
}

/// Convex combination weighted by existing and deposited thickness.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThicknessWeighted;

impl BlendPolicy for ThicknessWeighted {
    fn blend(&self, existing: MaterialProps, thickness: f32, incoming: MaterialProps, added: f32) -> MaterialProps {
        let thickness = finite_or(thickness, 0.0).max(0.0);
        let added = finite_or(added, 0.0).max(0.0);
        let total = thickness + added;
        if total <= f32::EPSILON {
            return incoming;
        }
        existing.lerp(incoming, added / total)
    }
}

/// Thickness-weighted blending where established film resists being overwritten.
///
/// `resistance = 1` matches [`ThicknessWeighted`]; larger values move toward
/// immiscible behaviour while staying a smooth convex combination.
#[derive(Clone, Copy, Debug)]
pub struct Resistant {
    pub resistance: f32,
}

impl BlendPolicy for Resistant {
    fn blend(&self, existing: MaterialProps, thickness: f32, incoming: MaterialProps, added: f32) -> MaterialProps {
        let resistance = finite_or(self.resistance, 1.0).max(0.0);
        ThicknessWeighted.blend(existing, thickness * resistance, incoming, added)
    }
}

/// Handle to a preset stored in a [`MaterialLibrary`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub u16);

/// Registry of presets addressable by [`MaterialId`].
#[derive(Clone, Debug)]
pub struct MaterialLibrary {
    presets: Vec<MaterialPreset>,
}

impl Default for MaterialLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MaterialLibrary {
    /// An empty library.
    pub fn new() -> Self {
        Self { presets: Vec::new() }
    }

    /// The built-in presets: ink, oil, honey, watercolor, mercury.
    pub fn builtin() -> Self {
        let mut library = Self::new();
        for preset in [
            MaterialPreset::ink(),
            MaterialPreset::oil(),
            MaterialPreset::honey(),
            MaterialPreset::watercolor(),
            MaterialPreset::mercury(),
        ] {
            library.add(preset);
        }
        library
    }

    /// Register a preset and return its handle.
    ///
    /// Returns `None` once every [`MaterialId`] is taken.
    pub fn add(&mut self, preset: MaterialPreset) -> Option<MaterialId> {
        let Ok(index) = u16::try_from(self.presets.len()) else {
            log::warn!("material library full; dropped preset {:?}", preset.name);
            return None;
        };
        self.presets.push(preset);
        Some(MaterialId(index))
    }

    /// Look up a preset.
    pub fn get(&self, id: MaterialId) -> Option<&MaterialPreset> {
        self.presets.get(id.0 as usize)
    }

    /// Find a preset by name.
    pub fn find(&self, name: &str) -> Option<MaterialId> {
        self.presets.iter().position(|p| p.name == name).map(|i| MaterialId(i as u16))
    }

    /// Number of presets.
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    /// Whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Iterate over `(id, preset)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (MaterialId, &MaterialPreset)> {
        self.presets.iter().enumerate().map(|(i, p)| (MaterialId(i as u16), p))
    }
}

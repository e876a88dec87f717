//! # TPFE - Two-Phase Fluid Engine
//!
//! A stylized two-phase fluid simulator for real-time visuals.
//!
//! A primary carrier fluid is advected, diffused, projected and confined on
//! a grid. A secondary immiscible film rides on top of it, dragged along by
//! a thickness-dependent fraction of the carrier's velocity. Every cell of the
//! film carries its own material properties, so oil, honey and ink can share
//! one canvas without a global parameter switch. An occupancy controller
//! keeps either layer from filling the screen.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tpfe::prelude::*;
//!
//! let mut sim = FluidSim::new(FluidConfig::new(256, 256)).unwrap();
//! sim.paint(Vec2::new(0.5, 0.5), 0.08, 1.0, &MaterialPreset::oil());
//!
//! for _ in 0..120 {
//!     let stir = Impulse::new(Vec2::new(0.3, 0.5), 0.04).with_velocity(Vec2::new(60.0, 0.0));
//!     sim.step(1.0 / 60.0, &[stir]);
//! }
//!
//! let film = sim.field(FieldName::SecondaryScalar);
//! println!("film occupancy {:.2}", sim.occupancy(LayerId::Secondary));
//! # let _ = film;
//! ```
//!
//! ## Core Concepts
//!
//! ### Fields
//!
//! A [`Field`] is a double-buffered grid of 1-4 `f32` channels. Every
//! operator is a pass that reads the front buffer, writes the back buffer
//! and swaps. Rows run in parallel through `rayon`.
//!
//! ### Layers
//!
//! Both layers hold a two-channel velocity and a four-channel scalar whose
//! last channel is the conserved quantity: dye concentration for the
//! primary, film thickness for the secondary.
//!
//! ### Materials
//!
//! A [`MaterialPreset`] is painted with [`FluidSim::paint`]. Its coupling,
//! viscosity, tension and drag are blended into the per-cell property field
//! by a [`BlendPolicy`].
//!
//! ### Conservation
//!
//! Every few steps an [`OccupancyProbe`] measures how much of a layer is
//! visibly covered. Above the upper threshold the layer is damped
//! proportionally toward the lower one. The probe runs on the CPU by
//! default; [`gpu::GpuOccupancyProbe`] moves the reduction to a compute shader.
//!
//! ### Particles
//!
//! With [`SecondaryMode::Particles`] the film is carried by SPH particles and
//! rasterized into the same grid fields each step.
//!
//! ## Logging
//!
//! The crate logs through the `log` facade and installs no logger.

pub mod config;
pub mod conservation;
pub mod error;
pub mod field;
pub mod gpu;
pub mod layer;
pub mod material;
pub mod ops;
pub mod particle;
mod simulation;

pub use config::{
    BoundaryPolicy, CapacityPolicy, FluidConfig, PrimaryConfig, RasterConfig, SecondaryConfig, SecondaryMode,
    SphConfig,
};
pub use conservation::{ConservationConfig, ConservationThresholds, CpuProbe, Damping, OccupancyProbe, ReductionParams};
pub use error::{FluidError, GpuError};
pub use field::{Field, FieldView};
pub use glam::{Vec2, Vec3, Vec4};
pub use layer::LayerId;
pub use material::{BlendPolicy, MaterialId, MaterialLibrary, MaterialPreset, MaterialProps, Resistant, ThicknessWeighted};
pub use ops::{AdvectionScheme, Falloff};
pub use particle::{Particle, ParticleSystem};
pub use simulation::{FieldName, FluidSim, Impulse};

/// Convenient re-exports for common usage.
///
/// ```ignore
/// use tpfe::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{FluidConfig, SecondaryMode};
    pub use crate::conservation::{ConservationConfig, ConservationThresholds, OccupancyProbe};
    pub use crate::error::FluidError;
    pub use crate::field::FieldView;
    pub use crate::layer::LayerId;
    pub use crate::material::{BlendPolicy, MaterialId, MaterialPreset, Resistant, ThicknessWeighted};
    pub use crate::simulation::{FieldName, FluidSim, Impulse};
    pub use crate::{Vec2, Vec3, Vec4};
}

//! Grid operators shared by both layers.
//!
//! Every operator is a sequence of [`Field::pass`](crate::field::Field::pass)
//! invocations, so each one reads a consistent buffer and writes the other.

pub mod advect;
pub mod diffuse;
pub mod project;
pub mod splat;
pub mod vorticity;

pub use advect::{advect, advect_velocity, AdvectionScheme};
pub use diffuse::{diffuse, diffuse_with};
pub use project::{divergence_norm, Projector};
pub use splat::{splat_scalar, splat_vector, Falloff};
pub use vorticity::Confinement;

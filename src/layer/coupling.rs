//! Momentum transfer from the carrier to the film.
//!
//! Coupling is a per-step fractional blend, not an accumulated force:
//!
//! ```text
//! factor = coupling(x) / (1 + inertia * thickness)
//! sv    += (pv - sv) * clamp(factor, 0, 1)
//! ```
//!
//! Thin film follows the carrier almost completely; thick film keeps more of
//! its own momentum. Below `min_thickness` the film velocity is set to the
//! carrier velocity exactly.
//!
//! When `reference_dt` is set the factor is treated as the fraction
//! transferred per `reference_dt` and rescaled to the actual step.

use crate::config::SecondaryConfig;
use crate::field::{clamp_unit, finite_or, Field, FieldView};

/// Coupling tunables taken from [`SecondaryConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CouplingParams {
    pub inertia: f32,
    pub min_thickness: f32,
    pub reference_dt: Option<f32>,
}

impl From<&SecondaryConfig> for CouplingParams {
    fn from(config: &SecondaryConfig) -> Self {
        Self {
            inertia: config.inertia,
            min_thickness: config.min_thickness,
            reference_dt: config.coupling_reference_dt,
        }
    }
}

/// Fraction of the velocity difference transferred this step, in `[0, 1]`.
///
/// Never increases with `thickness`.
#[inline]
pub fn coupling_factor(coupling: f32, thickness: f32, dt: f32, params: &CouplingParams) -> f32 {
    let thickness = finite_or(thickness, 0.0).max(0.0);
    let inertia = finite_or(params.inertia, 0.0).max(0.0);
    let base = clamp_unit(coupling) / (1.0 + inertia * thickness);
    let factor = match params.reference_dt {
        Some(reference) if reference > 0.0 && dt >= 0.0 => 1.0 - (1.0 - base).powf(dt / reference),
        _ => base,
    };
    clamp_unit(factor)
}

/// Blend the film velocity toward the carrier velocity.
///
/// `scalar` supplies thickness in its last channel and `props` the per-cell
/// coupling strength in channel 0.
pub fn couple(
    velocity: &mut Field,
    primary: FieldView<'_>,
    scalar: FieldView<'_>,
    props: FieldView<'_>,
    dt: f32,
    params: &CouplingParams,
) {
    velocity.pass(|x, y, src, out| {
        let pv = primary.vec2(x, y);
        let thickness = scalar.last(x, y);
        if !(thickness >= params.min_thickness) {
            out[0] = pv.x;
            out[1] = pv.y;
            return;
        }
        let factor = coupling_factor(props.at(x, y, 0), thickness, dt, params);
        let sv = src.vec2(x, y);
        let v = sv + (pv - sv) * factor;
        out[0] = finite_or(v.x, pv.x);
        out[1] = finite_or(v.y, pv.y);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CouplingParams {
        CouplingParams {
            inertia: 4.0,
            min_thickness: 0.01,
            reference_dt: None,
        }
    }

    #[test]
    fn test_factor_never_increases_with_thickness() {
        for reference_dt in [None, Some(1.0 / 60.0)] {
            let params = CouplingParams {
                reference_dt,
                ..params()
            };
            let mut previous = f32::INFINITY;
            for i in 0..=100 {
                let factor = coupling_factor(0.8, i as f32 * 0.01, 1.0 / 30.0, &params);
                assert!(factor <= previous);
                assert!((0.0..=1.0).contains(&factor));
                previous = factor;
            }
        }
    }

    #[test]
    fn test_factor_clamps_inputs() {
        assert_eq!(coupling_factor(5.0, 0.0, 0.1, &params()), 1.0);
        assert_eq!(coupling_factor(f32::NAN, 0.5, 0.1, &params()), 0.0);
        assert_eq!(coupling_factor(0.5, f32::NAN, 0.1, &params()), 0.5);
    }

    #[test]
    fn test_reference_dt_scales_with_step() {
        let params = CouplingParams {
            reference_dt: Some(0.1),
            ..params()
        };
        let at_reference = coupling_factor(0.5, 0.0, 0.1, &params);
        let double = coupling_factor(0.5, 0.0, 0.2, &params);
        assert!((at_reference - 0.5).abs() < 1e-6);
        assert!((double - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_near_empty_matches_primary_exactly() {
        let primary = Field::from_fn(6, 6, 2, |x, y, out| {
            out[0] = x as f32 * 0.37;
            out[1] = -(y as f32) * 1.3;
        })
        .unwrap();
        let scalar = Field::from_fn(6, 6, 4, |x, _, out| out[3] = if x < 3 { 0.005 } else { 0.5 }).unwrap();
        let props = Field::from_fn(6, 6, 4, |_, _, out| out[0] = 0.2).unwrap();
        let mut velocity = Field::from_fn(6, 6, 2, |_, _, out| out[0] = 9.0).unwrap();

        couple(&mut velocity, primary.view(), scalar.view(), props.view(), 0.016, &params());

        let (v, p) = (velocity.view(), primary.view());
        for y in 0..6 {
            for x in 0..3 {
                assert_eq!(v.vec2(x, y), p.vec2(x, y));
            }
            for x in 3..6 {
                assert_ne!(v.vec2(x, y), p.vec2(x, y));
            }
        }
    }
}

//! Semi-Lagrangian advection with optional MacCormack correction.
//!
//! Each destination cell traces backward one `dt` along the velocity field and
//! bilinearly samples the source. The MacCormack scheme then pushes the
//! prediction forward again, measures the round-trip error and adds half of it
//! back, clamped to the four taps of the original backtrace so sharp fronts
//! never overshoot.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::field::{finite_or, finite_vec2, Field, FieldView};

/// Advection scheme for scalar fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdvectionScheme {
    /// First-order backtrace. Unconditionally stable.
    SemiLagrangian,
    /// Second-order corrected backtrace with neighborhood clamping.
    #[default]
    MacCormack,
}

#[inline]
fn trace(x: usize, y: usize, velocity: Vec2, dt: f32) -> (f32, f32) {
    let v = finite_vec2(velocity);
    (x as f32 - dt * v.x, y as f32 - dt * v.y)
}

#[inline]
fn decay(dissipation: f32, dt: f32) -> f32 {
    1.0 / (1.0 + finite_or(dissipation, 0.0).max(0.0) * dt)
}

/// Transport `field` along `velocity` for one timestep.
///
/// `velocity` must have the same dimensions as `field`. `dissipation` is a
/// per-second decay rate applied after transport (0 disables it).
pub fn advect(
    field: &mut Field,
    velocity: FieldView<'_>,
    dt: f32,
    dissipation: f32,
    scheme: AdvectionScheme,
) {
    if field.is_empty() || !(dt > 0.0) {
        return;
    }
    debug_assert_eq!(field.width(), velocity.width());
    debug_assert_eq!(field.height(), velocity.height());
    let keep = decay(dissipation, dt);

    match scheme {
        AdvectionScheme::SemiLagrangian => {
            field.pass(|x, y, src, out| {
                let (px, py) = trace(x, y, velocity.vec2(x, y), dt);
                for (ch, slot) in out.iter_mut().enumerate() {
                    *slot = src.bilinear(px, py, ch) * keep;
                }
            });
        }
        AdvectionScheme::MacCormack => {
            let mut predicted = field.clone();
            advect(&mut predicted, velocity, dt, 0.0, AdvectionScheme::SemiLagrangian);
            let predicted = predicted.view();

            field.pass(|x, y, src, out| {
                let v = finite_vec2(velocity.vec2(x, y));
                let (bx, by) = (x as f32 - dt * v.x, y as f32 - dt * v.y);
                let (fx, fy) = (x as f32 + dt * v.x, y as f32 + dt * v.y);
                for (ch, slot) in out.iter_mut().enumerate() {
                    let forward = predicted.at(x, y, ch);
                    let round_trip = predicted.bilinear(fx, fy, ch);
                    let corrected = forward + 0.5 * (src.at(x, y, ch) - round_trip);
                    let (_, lo, hi) = src.bilinear_range(bx, by, ch);
                    *slot = finite_or(corrected, forward).clamp(lo, hi) * keep;
                }
            });
        }
    }
}

/// Self-advect a two-channel velocity field. Always first order.
pub fn advect_velocity(velocity: &mut Field, dt: f32, dissipation: f32) {
    if velocity.is_empty() || !(dt > 0.0) {
        return;
    }
    let keep = decay(dissipation, dt);
    velocity.pass(|x, y, src, out| {
        let (px, py) = trace(x, y, src.vec2(x, y), dt);
        let v = finite_vec2(src.sample_vec2(px, py)) * keep;
        out[0] = v.x;
        out[1] = v.y;
    });
}

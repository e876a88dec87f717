//! Vorticity confinement.
//!
//! Numerical damping smears small eddies out of a semi-Lagrangian flow. The
//! confinement force `ε (N⊥ ω)` pushes along the direction of increasing curl
//! magnitude to put that rotational energy back.

use glam::Vec2;

use crate::error::FluidError;
use crate::field::{finite_vec2, Field, FieldView};

/// Curl scratch buffer plus the confinement pass.
#[derive(Clone, Debug)]
pub struct Confinement {
    curl: Field,
}

impl Confinement {
    /// Allocate for a `width × height` grid.
    pub fn new(width: usize, height: usize) -> Result<Self, FluidError> {
        Ok(Self {
            curl: Field::new(width, height, 1)?,
        })
    }

    /// Curl from the most recent application.
    pub fn curl(&self) -> FieldView<'_> {
        self.curl.view()
    }

    /// Add the confinement force scaled by `strength` to `velocity`.
    ///
    /// `max_force` caps the per-cell acceleration.
    pub fn apply(&mut self, velocity: &mut Field, strength: f32, dt: f32, max_force: f32) {
        if velocity.is_empty() || !(strength > 0.0) || !(dt > 0.0) {
            return;
        }

        {
            let v = velocity.view();
            self.curl.pass(|x, y, _, out| {
                let (xi, yi) = (x as isize, y as isize);
                let dvdx = v.clamped(xi + 1, yi, 1) - v.clamped(xi - 1, yi, 1);
                let dudy = v.clamped(xi, yi + 1, 0) - v.clamped(xi, yi - 1, 0);
                let w = 0.5 * (dvdx - dudy);
                out[0] = if w.is_finite() { w } else { 0.0 };
            });
        }

        let curl = self.curl.view();
        velocity.pass(|x, y, src, out| {
            let (xi, yi) = (x as isize, y as isize);
            let grad = Vec2::new(
                curl.clamped(xi + 1, yi, 0).abs() - curl.clamped(xi - 1, yi, 0).abs(),
                curl.clamped(xi, yi + 1, 0).abs() - curl.clamped(xi, yi - 1, 0).abs(),
            ) * 0.5;
            let n = grad / (grad.length() + 1e-5);
            let w = curl.at(x, y, 0);
            let force = finite_vec2(Vec2::new(n.y * w, -n.x * w) * strength).clamp_length_max(max_force);
            let v = src.vec2(x, y) + force * dt;
            out[0] = v.x;
            out[1] = v.y;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vortex(w: usize, h: usize) -> Field {
        Field::from_fn(w, h, 2, move |x, y, out| {
            let p = Vec2::new(x as f32 - w as f32 / 2.0, y as f32 - h as f32 / 2.0);
            let falloff = (-p.length_squared() / 16.0).exp();
            out[0] = -p.y * falloff;
            out[1] = p.x * falloff;
        })
        .unwrap()
    }

    #[test]
    fn test_zero_strength_is_noop() {
        let mut velocity = vortex(16, 16);
        let before = velocity.data().to_vec();
        let mut confinement = Confinement::new(16, 16).unwrap();
        confinement.apply(&mut velocity, 0.0, 0.1, 10.0);
        assert_eq!(velocity.data(), before.as_slice());
    }

    #[test]
    fn test_confinement_changes_rotational_flow() {
        let mut velocity = vortex(16, 16);
        let before = velocity.data().to_vec();
        let mut confinement = Confinement::new(16, 16).unwrap();
        confinement.apply(&mut velocity, 5.0, 0.1, 100.0);
        assert!(confinement.curl().max_abs() > 0.0);
        assert_ne!(velocity.data(), before.as_slice());
        assert!(velocity.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_force_is_capped() {
        let mut velocity = vortex(16, 16);
        let before = velocity.clone();
        let mut confinement = Confinement::new(16, 16).unwrap();
        confinement.apply(&mut velocity, 1.0e6, 1.0, 0.5);
        for (a, b) in velocity.data().chunks(2).zip(before.data().chunks(2)) {
            let delta = Vec2::new(a[0] - b[0], a[1] - b[1]).length();
            assert!(delta <= 0.5 + 1e-4);
        }
    }
}

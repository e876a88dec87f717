//! Surface-tension forcing on the film.
//!
//! The thickness gradient approximates the interface normal and its Laplacian
//! the curvature. The resulting force is added to velocity ahead of
//! advection; thickness itself is never edited here.

use glam::Vec2;

use crate::field::{finite_vec2, Field, FieldView};

const MIN_GRADIENT: f32 = 1e-4;

/// Tension acceleration at one cell, before the timestep and cap are applied.
#[inline]
pub fn tension_force(scalar: FieldView<'_>, x: usize, y: usize, tension: f32) -> Vec2 {
    if !(tension > 0.0) {
        return Vec2::ZERO;
    }
    let (xi, yi) = (x as isize, y as isize);
    let t = |dx: isize, dy: isize| scalar.clamped(xi + dx, yi + dy, scalar.channels() - 1);

    let here = t(0, 0);
    let (l, r, d, u) = (t(-1, 0), t(1, 0), t(0, -1), t(0, 1));
    let gradient = Vec2::new(r - l, u - d) * 0.5;
    let length = gradient.length();
    if !(length > MIN_GRADIENT) {
        return Vec2::ZERO;
    }
    let curvature = l + r + d + u - 4.0 * here;
    finite_vec2(gradient / length * curvature.abs() * tension)
}

/// Add `normalize(∇T) · |∇²T| · tension · dt` to `velocity`.
///
/// `tension` is read from channel 2 of `props`. The per-step velocity change
/// is capped at `max_force * dt`.
pub fn apply_surface_tension(
    velocity: &mut Field,
    scalar: FieldView<'_>,
    props: FieldView<'_>,
    dt: f32,
    max_force: f32,
) {
    if !(dt > 0.0) || !(max_force > 0.0) {
        return;
    }
    velocity.pass(|x, y, src, out| {
        let force = tension_force(scalar, x, y, props.at(x, y, 2)) * dt;
        let v = src.vec2(x, y) + force.clamp_length_max(max_force * dt);
        out[0] = v.x;
        out[1] = v.y;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disc(size: usize, radius: f32) -> Field {
        Field::from_fn(size, size, 4, move |x, y, out| {
            let c = size as f32 / 2.0;
            let d = Vec2::new(x as f32 - c, y as f32 - c).length();
            out[3] = if d < radius { 1.0 } else { 0.0 };
        })
        .unwrap()
    }

    fn uniform_props(size: usize, tension: f32) -> Field {
        Field::from_fn(size, size, 4, move |_, _, out| out[2] = tension).unwrap()
    }

    #[test]
    fn test_flat_film_has_no_force() {
        let scalar = Field::from_fn(8, 8, 4, |_, _, out| out[3] = 0.6).unwrap();
        let props = uniform_props(8, 5.0);
        let mut velocity = Field::new(8, 8, 2).unwrap();
        apply_surface_tension(&mut velocity, scalar.view(), props.view(), 0.1, 100.0);
        assert!(velocity.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_edge_force_points_into_film() {
        let scalar = disc(20, 5.0);
        let props = uniform_props(20, 2.0);
        let mut velocity = Field::new(20, 20, 2).unwrap();
        apply_surface_tension(&mut velocity, scalar.view(), props.view(), 0.1, 100.0);
        // Just outside the right edge of the disc the force points left, toward the film.
        let v = velocity.view().vec2(15, 10);
        assert!(v.x < 0.0, "{v:?}");
        // Thickness is untouched.
        assert_eq!(scalar.view().last(10, 10), 1.0);
    }

    #[test]
    fn test_force_is_capped() {
        let scalar = disc(20, 5.0);
        let props = uniform_props(20, 1.0e6);
        let mut velocity = Field::new(20, 20, 2).unwrap();
        apply_surface_tension(&mut velocity, scalar.view(), props.view(), 0.1, 3.0);
        for cell in velocity.data().chunks(2) {
            assert!(Vec2::new(cell[0], cell[1]).length() <= 0.3 + 1e-5);
        }
    }

    #[test]
    fn test_zero_tension_is_noop() {
        let scalar = disc(12, 3.0);
        let props = uniform_props(12, 0.0);
        let mut velocity = Field::new(12, 12, 2).unwrap();
        apply_surface_tension(&mut velocity, scalar.view(), props.view(), 0.1, 10.0);
        assert!(velocity.data().iter().all(|v| *v == 0.0));
    }
}

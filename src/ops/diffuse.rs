//! Jacobi diffusion and viscosity.
//!
//! Solves the implicit step `(1 + 4a) x - a Σ neighbours(x) = x0` with a fixed
//! number of Jacobi sweeps. Each sweep reads the whole previous buffer, so all
//! cells update from one consistent state. Every sweep is a convex combination
//! of `x0` and neighbour values, which keeps bounded inputs bounded.
//!
//! With `preserve_last` set, the last channel (thickness or concentration) is
//! copied through untouched while the remaining channels relax.

use crate::field::{finite_or, Field};

/// Diffuse with a uniform rate.
pub fn diffuse(field: &mut Field, rate: f32, dt: f32, iterations: u32, preserve_last: bool) {
    diffuse_with(field, dt, iterations, preserve_last, |_, _| rate);
}

/// Diffuse with a per-cell rate given by `rate(x, y)`.
pub fn diffuse_with<R>(field: &mut Field, dt: f32, iterations: u32, preserve_last: bool, rate: R)
where
    R: Fn(usize, usize) -> f32 + Sync + Send,
{
    if field.is_empty() || iterations == 0 || !(dt > 0.0) {
        return;
    }
    if preserve_last && field.channels() == 1 {
        return;
    }

    let initial = field.clone();
    let x0 = initial.view();
    let last = field.channels() - 1;

    for _ in 0..iterations {
        field.pass(|x, y, src, out| {
            let a = (finite_or(rate(x, y), 0.0) * dt).max(0.0);
            let (xi, yi) = (x as isize, y as isize);
            for (ch, slot) in out.iter_mut().enumerate() {
                if preserve_last && ch == last {
                    *slot = src.at(x, y, ch);
                    continue;
                }
                let neighbours = src.clamped(xi - 1, yi, ch)
                    + src.clamped(xi + 1, yi, ch)
                    + src.clamped(xi, yi - 1, ch)
                    + src.clamped(xi, yi + 1, ch);
                *slot = (x0.at(x, y, ch) + a * neighbours) / (1.0 + 4.0 * a);
            }
        });
    }
}

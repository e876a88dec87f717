//! Pressure projection.
//!
//! Velocity components are treated as fluxes through the cell's `+x` and `+y`
//! faces. Divergence uses backward differences and the pressure gradient uses
//! forward differences, so their composition is exactly the Neumann 5-point
//! Laplacian the Jacobi solve inverts. The post-projection divergence is then
//! the solver residual, which shrinks with every extra iteration.
//!
//! The container edge is a solid wall: fluxes through the last column/row and
//! through the implicit face before the first column/row are zero.

use rayon::prelude::*;

use crate::error::FluidError;
use crate::field::{finite_or, Field, FieldView};

#[inline]
fn flux_x(v: FieldView<'_>, x: isize, y: usize) -> f32 {
    if x < 0 || x as usize + 1 >= v.width() {
        0.0
    } else {
        v.at(x as usize, y, 0)
    }
}

#[inline]
fn flux_y(v: FieldView<'_>, x: usize, y: isize) -> f32 {
    if y < 0 || y as usize + 1 >= v.height() {
        0.0
    } else {
        v.at(x, y as usize, 1)
    }
}

/// Discrete divergence at one cell.
#[inline]
pub fn divergence_at(velocity: FieldView<'_>, x: usize, y: usize) -> f32 {
    let (xi, yi) = (x as isize, y as isize);
    flux_x(velocity, xi, y) - flux_x(velocity, xi - 1, y) + flux_y(velocity, x, yi)
        - flux_y(velocity, x, yi - 1)
}

/// Root-mean-square divergence of a velocity field.
pub fn divergence_norm(velocity: FieldView<'_>) -> f32 {
    if velocity.is_empty() {
        return 0.0;
    }
    let sum: f64 = (0..velocity.height())
        .into_par_iter()
        .map(|y| {
            (0..velocity.width())
                .map(|x| {
                    let d = divergence_at(velocity, x, y) as f64;
                    d * d
                })
                .sum::<f64>()
        })
        .sum();
    (sum / (velocity.width() * velocity.height()) as f64).sqrt() as f32
}

/// Scratch storage and solver for the pressure Poisson equation.
#[derive(Clone, Debug)]
pub struct Projector {
    pressure: Field,
    divergence: Field,
}

impl Projector {
    /// Allocate scratch fields for a `width × height` grid.
    pub fn new(width: usize, height: usize) -> Result<Self, FluidError> {
        Ok(Self {
            pressure: Field::new(width, height, 1)?,
            divergence: Field::new(width, height, 1)?,
        })
    }

    /// Pressure from the most recent solve.
    pub fn pressure(&self) -> FieldView<'_> {
        self.pressure.view()
    }

    /// Divergence measured before the most recent solve.
    pub fn divergence(&self) -> FieldView<'_> {
        self.divergence.view()
    }

    /// Make `velocity` approximately divergence-free.
    ///
    /// The solve starts from zero pressure each call, so the result depends only
    /// on the input field and `iterations`.
    pub fn project(&mut self, velocity: &mut Field, iterations: u32) {
        if velocity.is_empty() {
            return;
        }
        debug_assert_eq!(velocity.width(), self.pressure.width());
        debug_assert_eq!(velocity.height(), self.pressure.height());

        {
            let v = velocity.view();
            self.divergence
                .pass(|x, y, _, out| out[0] = finite_or(divergence_at(v, x, y), 0.0));
        }
        self.pressure.fill(&[0.0]);

        let div = self.divergence.view();
        for _ in 0..iterations {
            self.pressure.pass(|x, y, src, out| {
                let (w, h) = (src.width(), src.height());
                let mut sum = 0.0;
                let mut count = 0.0;
                if x > 0 {
                    sum += src.at(x - 1, y, 0);
                    count += 1.0;
                }
                if x + 1 < w {
                    sum += src.at(x + 1, y, 0);
                    count += 1.0;
                }
                if y > 0 {
                    sum += src.at(x, y - 1, 0);
                    count += 1.0;
                }
                if y + 1 < h {
                    sum += src.at(x, y + 1, 0);
                    count += 1.0;
                }
                out[0] = if count > 0.0 {
                    finite_or((sum - div.at(x, y, 0)) / count, 0.0)
                } else {
                    0.0
                };
            });
        }

        let p = self.pressure.view();
        velocity.pass(|x, y, src, out| {
            let (w, h) = (src.width(), src.height());
            let here = p.at(x, y, 0);
            out[0] = if x + 1 < w {
                src.at(x, y, 0) - (p.at(x + 1, y, 0) - here)
            } else {
                0.0
            };
            out[1] = if y + 1 < h {
                src.at(x, y, 1) - (p.at(x, y + 1, 0) - here)
            } else {
                0.0
            };
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swirl_with_source(w: usize, h: usize) -> Field {
        Field::from_fn(w, h, 2, move |x, y, out| {
            let fx = x as f32 / w as f32;
            let fy = y as f32 / h as f32;
            out[0] = (fy * 3.1).sin() + 2.0 * (fx - 0.5);
            out[1] = (fx * 2.7).cos() + 1.5 * (fy - 0.4);
        })
        .unwrap()
    }

    #[test]
    fn test_projection_reduces_divergence() {
        let mut velocity = swirl_with_source(32, 24);
        let before = divergence_norm(velocity.view());
        let mut projector = Projector::new(32, 24).unwrap();
        projector.project(&mut velocity, 60);
        let after = divergence_norm(velocity.view());
        assert!(after < before * 0.5, "before {before}, after {after}");
    }

    #[test]
    fn test_divergence_decreases_with_iterations() {
        let source = swirl_with_source(24, 24);
        let mut projector = Projector::new(24, 24).unwrap();
        let mut previous = f32::INFINITY;
        for iterations in [2, 8, 32, 128] {
            let mut velocity = source.clone();
            projector.project(&mut velocity, iterations);
            let norm = divergence_norm(velocity.view());
            assert!(norm < previous, "{iterations} iterations: {norm} !< {previous}");
            previous = norm;
        }
    }

    #[test]
    fn test_divergence_free_field_is_unchanged() {
        // Uniform flow between walls is not divergence-free, but a zero field is.
        let mut velocity = Field::new(8, 8, 2).unwrap();
        let mut projector = Projector::new(8, 8).unwrap();
        projector.project(&mut velocity, 10);
        assert!(velocity.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_walls_have_zero_flux() {
        let mut velocity = Field::from_fn(6, 5, 2, |_, _, out| {
            out[0] = 1.0;
            out[1] = -1.0;
        })
        .unwrap();
        let mut projector = Projector::new(6, 5).unwrap();
        projector.project(&mut velocity, 4);
        let v = velocity.view();
        for y in 0..5 {
            assert_eq!(v.at(5, y, 0), 0.0);
        }
        for x in 0..6 {
            assert_eq!(v.at(x, 4, 1), 0.0);
        }
    }

    #[test]
    fn test_single_cell_grid() {
        let mut velocity = Field::from_fn(1, 1, 2, |_, _, out| out[0] = 3.0).unwrap();
        let mut projector = Projector::new(1, 1).unwrap();
        projector.project(&mut velocity, 5);
        assert!(velocity.data().iter().all(|v| v.is_finite()));
    }
}

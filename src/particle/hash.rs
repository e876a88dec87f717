//! Uniform-grid spatial hash built by counting sort.
//!
//! The build is the classic three passes: histogram particle counts per cell,
//! exclusive prefix sum into `cell_start`, then scatter particle indices into
//! `entries`. Particles of one cell are contiguous in `entries`, so a query
//! is a handful of slice reads with no pointer chasing. Cell size equals the
//! smoothing radius, so every neighbour within `h` lies in the surrounding
//! 3×3 block of cells.

use glam::Vec2;

use crate::error::FluidError;
use crate::field::finite_or;

/// Index-based neighbour grid over the simulation domain.
#[derive(Clone, Debug)]
pub struct SpatialHash {
    cell_size: f32,
    cols: usize,
    rows: usize,
    /// `cell_start[c]..cell_start[c + 1]` indexes `entries` for cell `c`.
    cell_start: Vec<u32>,
    entries: Vec<u32>,
    cursor: Vec<u32>,
}

impl SpatialHash {
    /// Grid covering `width × height` cells of the field, bucketed by `cell_size`.
    ///
    /// Falls back to one bucket holding everything when the bucket table
    /// cannot be allocated. Queries stay correct, only slower.
    pub fn new(cell_size: f32, width: usize, height: usize) -> Self {
        Self::try_new(cell_size, width, height).unwrap_or_else(|err| {
            log::warn!("{}; spatial hash falls back to a single bucket", err);
            Self::single_bucket()
        })
    }

    /// Like [`SpatialHash::new`], but reports a bucket table that cannot be allocated.
    pub fn try_new(cell_size: f32, width: usize, height: usize) -> Result<Self, FluidError> {
        let cell_size = finite_or(cell_size, 1.0).max(1e-3);
        let cols = ((width as f32 / cell_size).ceil() as usize).max(1);
        let rows = ((height as f32 / cell_size).ceil() as usize).max(1);
        let err = || FluidError::Allocation {
            width: cols,
            height: rows,
            channels: 1,
        };
        let len = cols
            .checked_mul(rows)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(err)?;
        let mut cell_start = Vec::new();
        cell_start.try_reserve_exact(len).map_err(|_| err())?;
        cell_start.resize(len, 0);
        Ok(Self {
            cell_size,
            cols,
            rows,
            cell_start,
            entries: Vec::new(),
            cursor: Vec::new(),
        })
    }

    fn single_bucket() -> Self {
        Self {
            cell_size: 1.0,
            cols: 1,
            rows: 1,
            cell_start: vec![0; 2],
            entries: Vec::new(),
            cursor: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// `(cols, rows)` of the bucket grid.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// Bucket coordinates of a position, clamped into the grid.
    #[inline]
    pub fn cell_of(&self, position: Vec2) -> (usize, usize) {
        let clamp = |v: f32, n: usize| {
            let c = (finite_or(v, 0.0) / self.cell_size).floor();
            c.clamp(0.0, (n - 1) as f32) as usize
        };
        (clamp(position.x, self.cols), clamp(position.y, self.rows))
    }

    /// Rebuild from particle positions.
    pub fn build<I>(&mut self, positions: I)
    where
        I: IntoIterator<Item = Vec2>,
        I::IntoIter: Clone,
    {
        let positions = positions.into_iter();
        let cells = self.cols * self.rows;

        // Histogram, offset by one so the prefix sum lands in cell_start directly.
        self.cell_start.clear();
        self.cell_start.resize(cells + 1, 0);
        let mut count = 0usize;
        for p in positions.clone() {
            let (cx, cy) = self.cell_of(p);
            self.cell_start[cy * self.cols + cx + 1] += 1;
            count += 1;
        }

        for c in 0..cells {
            self.cell_start[c + 1] += self.cell_start[c];
        }

        self.cursor.clear();
        self.cursor.extend_from_slice(&self.cell_start[..cells]);
        self.entries.clear();
        self.entries.resize(count, 0);
        for (i, p) in positions.enumerate() {
            let (cx, cy) = self.cell_of(p);
            let slot = &mut self.cursor[cy * self.cols + cx];
            self.entries[*slot as usize] = i as u32;
            *slot += 1;
        }
    }

    /// Particle indices stored in one bucket.
    #[inline]
    pub fn bucket(&self, cx: usize, cy: usize) -> &[u32] {
        let c = cy * self.cols + cx;
        match (self.cell_start.get(c), self.cell_start.get(c + 1)) {
            (Some(&start), Some(&end)) => &self.entries[start as usize..end as usize],
            _ => &[],
        }
    }

    /// Visit every particle index in the buckets within `radius` of `position`.
    ///
    /// With `radius <= cell_size` this is the 3×3 block around the position's
    /// bucket. Candidates still need a distance check.
    #[inline]
    pub fn for_each_candidate<F>(&self, position: Vec2, radius: f32, mut visit: F)
    where
        F: FnMut(usize),
    {
        if self.entries.is_empty() {
            return;
        }
        let reach = (finite_or(radius, 0.0) / self.cell_size).ceil().max(1.0) as usize;
        let (cx, cy) = self.cell_of(position);
        let x0 = cx.saturating_sub(reach);
        let y0 = cy.saturating_sub(reach);
        let x1 = (cx + reach).min(self.cols - 1);
        let y1 = (cy + reach).min(self.rows - 1);
        for by in y0..=y1 {
            for bx in x0..=x1 {
                for &j in self.bucket(bx, by) {
                    visit(j as usize);
                }
            }
        }
    }

    /// Number of indexed particles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

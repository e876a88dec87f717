//! Double-buffered 2D fields.
//!
//! A [`Field`] is a fixed `width × height` grid carrying 1-4 interleaved `f32`
//! channels per cell. Every write goes through [`Field::pass`], which reads the
//! front buffer, writes the back buffer, then swaps. No pass ever observes a
//! partially written buffer, so all cells of a pass can run in parallel.
//!
//! # Channel Layouts
//!
//! | Field | Channels |
//! |-------|----------|
//! | velocity | `(u, v)` in cells per second |
//! | primary scalar | premultiplied dye `rgb`, concentration |
//! | secondary scalar | straight tint `rgb`, thickness |
//! | material properties | coupling, viscosity, tension, drag |
//!
//! Conserved quantities (concentration, thickness) always sit in the last channel.
//!
//! # Example
//!
//! ```ignore
//! let mut field = Field::new(64, 64, 1)?;
//! field.pass(|x, y, src, out| {
//!     out[0] = (src.at(x, y, 0) * 0.5).clamp(0.0, 1.0);
//! });
//! ```

use glam::Vec2;
use rayon::prelude::*;

use crate::error::FluidError;

/// Largest channel count a field may carry.
pub const MAX_CHANNELS: usize = 4;

/// Replace a non-finite value with `fallback`.
#[inline]
pub fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Clamp to `[0, 1]`, mapping NaN to zero.
#[inline]
pub fn clamp_unit(value: f32) -> f32 {
    finite_or(value, 0.0).clamp(0.0, 1.0)
}

/// Replace a non-finite vector with zero.
#[inline]
pub fn finite_vec2(v: Vec2) -> Vec2 {
    if v.is_finite() {
        v
    } else {
        Vec2::ZERO
    }
}

/// Hermite smoothstep between two edges.
#[inline]
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x >= edge1 { 1.0 } else { 0.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Read-only view over one buffer of a field.
///
/// This is the handle handed to pass kernels and to external readers.
#[derive(Clone, Copy, Debug)]
pub struct FieldView<'a> {
    data: &'a [f32],
    width: usize,
    height: usize,
    channels: usize,
}

impl<'a> FieldView<'a> {
    /// Wrap a raw interleaved slice.
    pub fn new(data: &'a [f32], width: usize, height: usize, channels: usize) -> Self {
        debug_assert_eq!(data.len(), width * height * channels);
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    /// Width in cells.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in cells.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Channels per cell.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Raw interleaved data.
    #[inline]
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Whether the grid has no cells.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Value of one channel at an in-range cell.
    #[inline]
    pub fn at(&self, x: usize, y: usize, ch: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + ch]
    }

    /// All channels of an in-range cell.
    #[inline]
    pub fn cell(&self, x: usize, y: usize) -> &'a [f32] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    /// Value at a possibly out-of-range cell, clamped to the nearest edge.
    #[inline]
    pub fn clamped(&self, x: isize, y: isize, ch: usize) -> f32 {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.at(cx, cy, ch)
    }

    /// Two-channel vector at an in-range cell.
    #[inline]
    pub fn vec2(&self, x: usize, y: usize) -> Vec2 {
        let c = self.cell(x, y);
        Vec2::new(c[0], c[1])
    }

    /// Value of the last channel at an in-range cell.
    #[inline]
    pub fn last(&self, x: usize, y: usize) -> f32 {
        self.at(x, y, self.channels - 1)
    }

    fn taps(&self, x: f32, y: f32) -> ([usize; 4], f32, f32) {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let x = finite_or(x, 0.0).clamp(0.0, max_x);
        let y = finite_or(y, 0.0).clamp(0.0, max_y);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let idx = |cx: usize, cy: usize| (cy * self.width + cx) * self.channels;
        ([idx(x0, y0), idx(x1, y0), idx(x0, y1), idx(x1, y1)], x - x0 as f32, y - y0 as f32)
    }

    /// Bilinear sample of one channel at a continuous cell-space position.
    ///
    /// Cell centers sit on integer coordinates; positions outside the grid clamp to the edge.
    pub fn bilinear(&self, x: f32, y: f32, ch: usize) -> f32 {
        self.bilinear_range(x, y, ch).0
    }

    /// Bilinear sample together with the min and max of the four taps used.
    pub fn bilinear_range(&self, x: f32, y: f32, ch: usize) -> (f32, f32, f32) {
        if self.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let (taps, sx, sy) = self.taps(x, y);
        let v00 = self.data[taps[0] + ch];
        let v10 = self.data[taps[1] + ch];
        let v01 = self.data[taps[2] + ch];
        let v11 = self.data[taps[3] + ch];

        let v0 = v00 + (v10 - v00) * sx;
        let v1 = v01 + (v11 - v01) * sx;
        let value = v0 + (v1 - v0) * sy;

        let lo = v00.min(v10).min(v01).min(v11);
        let hi = v00.max(v10).max(v01).max(v11);
        (value, lo, hi)
    }

    /// Bilinear sample of the first two channels as a vector.
    pub fn sample_vec2(&self, x: f32, y: f32) -> Vec2 {
        Vec2::new(self.bilinear(x, y, 0), self.bilinear(x, y, 1))
    }

    /// Largest absolute value across all channels.
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }
}

/// A double-buffered 2D grid.
#[derive(Clone, Debug)]
pub struct Field {
    width: usize,
    height: usize,
    channels: usize,
    front: Vec<f32>,
    back: Vec<f32>,
}

fn allocate(width: usize, height: usize, channels: usize) -> Result<Vec<f32>, FluidError> {
    let err = || FluidError::Allocation {
        width,
        height,
        channels,
    };
    let len = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(err)?;
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| err())?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

impl Field {
    /// Allocate a zeroed field.
    ///
    /// Zero width or height is valid; every pass over an empty field is a no-op.
    pub fn new(width: usize, height: usize, channels: usize) -> Result<Self, FluidError> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(FluidError::InvalidChannels(channels));
        }
        Ok(Self {
            width,
            height,
            channels,
            front: allocate(width, height, channels)?,
            back: allocate(width, height, channels)?,
        })
    }

    /// Allocate a field and initialize every cell with `init(x, y, cell)`.
    pub fn from_fn<F>(width: usize, height: usize, channels: usize, init: F) -> Result<Self, FluidError>
    where
        F: Fn(usize, usize, &mut [f32]) + Sync + Send,
    {
        let mut field = Self::new(width, height, channels)?;
        field.pass(|x, y, _, out| init(x, y, out));
        Ok(field)
    }

    /// Width in cells.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in cells.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Channels per cell.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of cells.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    /// Whether the field has no cells.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Read-only view of the current (front) buffer.
    #[inline]
    pub fn view(&self) -> FieldView<'_> {
        FieldView::new(&self.front, self.width, self.height, self.channels)
    }

    /// Raw current buffer.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.front
    }

    /// Run one data-parallel pass.
    ///
    /// `kernel(x, y, src, out)` is called once per cell with a view of the front
    /// buffer and the cell's slot in the back buffer. Rows run in parallel. The
    /// buffers swap once every cell is written.
    pub fn pass<F>(&mut self, kernel: F)
    where
        F: Fn(usize, usize, FieldView<'_>, &mut [f32]) + Sync + Send,
    {
        if self.is_empty() {
            return;
        }
        let src = FieldView::new(&self.front, self.width, self.height, self.channels);
        let channels = self.channels;
        self.back
            .par_chunks_mut(self.width * channels)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, cell) in row.chunks_mut(channels).enumerate() {
                    kernel(x, y, src, cell);
                }
            });
        self.swap();
    }

    /// Exchange front and back buffers.
    #[inline]
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
    }

    /// Set every cell to `value` (missing channels become zero).
    pub fn fill(&mut self, value: &[f32]) {
        self.pass(|_, _, _, out| {
            for (ch, slot) in out.iter_mut().enumerate() {
                *slot = value.get(ch).copied().unwrap_or(0.0);
            }
        });
    }

    /// Bilinearly resample the current contents into a newly allocated field.
    ///
    /// `self` is untouched; on allocation failure the error is returned and nothing changes.
    pub fn resampled(&self, width: usize, height: usize) -> Result<Field, FluidError> {
        let mut out = Field::new(width, height, self.channels)?;
        if self.is_empty() {
            return Ok(out);
        }
        let old = self.view();
        let sx = self.width as f32 / width.max(1) as f32;
        let sy = self.height as f32 / height.max(1) as f32;
        out.pass(|x, y, _, cell| {
            let px = (x as f32 + 0.5) * sx - 0.5;
            let py = (y as f32 + 0.5) * sy - 0.5;
            for (ch, slot) in cell.iter_mut().enumerate() {
                *slot = old.bilinear(px, py, ch);
            }
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Allocation Tests ==========

    #[test]
    fn test_field_new_zeroed() {
        let field = Field::new(8, 4, 2).unwrap();
        assert_eq!(field.width(), 8);
        assert_eq!(field.height(), 4);
        assert_eq!(field.channels(), 2);
        assert_eq!(field.data().len(), 8 * 4 * 2);
        assert!(field.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_field_zero_size_is_valid() {
        let mut field = Field::new(0, 16, 1).unwrap();
        assert!(field.is_empty());
        field.pass(|_, _, _, out| out[0] = 1.0);
        assert!(field.data().is_empty());
        assert_eq!(field.view().bilinear(3.0, 3.0, 0), 0.0);
    }

    #[test]
    fn test_field_invalid_channels() {
        assert!(matches!(Field::new(4, 4, 0), Err(FluidError::InvalidChannels(0))));
        assert!(matches!(Field::new(4, 4, 5), Err(FluidError::InvalidChannels(5))));
    }

    #[test]
    fn test_field_overflowing_size_fails() {
        let result = Field::new(usize::MAX, 2, 4);
        assert!(matches!(result, Err(FluidError::Allocation { .. })));
    }

    // ========== Pass Tests ==========

    #[test]
    fn test_pass_reads_previous_buffer() {
        let mut field = Field::from_fn(4, 1, 1, |x, _, out| out[0] = x as f32).unwrap();
        // Shift right by one: every cell must see the pre-pass state.
        field.pass(|x, y, src, out| {
            out[0] = src.clamped(x as isize - 1, y as isize, 0);
        });
        assert_eq!(field.data(), &[0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_fill_pads_missing_channels() {
        let mut field = Field::new(2, 2, 3).unwrap();
        field.fill(&[0.5]);
        assert_eq!(field.view().cell(1, 1), &[0.5, 0.0, 0.0]);
    }

    // ========== Sampling Tests ==========

    #[test]
    fn test_bilinear_midpoint() {
        let field = Field::from_fn(2, 2, 1, |x, y, out| out[0] = (x + 2 * y) as f32).unwrap();
        let v = field.view().bilinear(0.5, 0.5, 0);
        assert!((v - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_range_brackets_value() {
        let field = Field::from_fn(3, 3, 1, |x, y, out| out[0] = ((x * 7 + y * 3) % 5) as f32).unwrap();
        let (v, lo, hi) = field.view().bilinear_range(1.3, 0.6, 0);
        assert!(v >= lo && v <= hi);
    }

    #[test]
    fn test_bilinear_non_finite_position() {
        let field = Field::from_fn(3, 3, 1, |_, _, out| out[0] = 0.25).unwrap();
        assert_eq!(field.view().bilinear(f32::NAN, f32::INFINITY, 0), 0.25);
    }

    // ========== Resample Tests ==========

    #[test]
    fn test_resample_constant_field() {
        let field = Field::from_fn(8, 8, 2, |_, _, out| {
            out[0] = 0.3;
            out[1] = 0.7;
        })
        .unwrap();
        let resized = field.resampled(3, 17).unwrap();
        assert_eq!(resized.width(), 3);
        assert_eq!(resized.height(), 17);
        for cell in resized.data().chunks(2) {
            assert!((cell[0] - 0.3).abs() < 1e-6);
            assert!((cell[1] - 0.7).abs() < 1e-6);
        }
    }

    // ========== Helper Tests ==========

    #[test]
    fn test_sanitize_helpers() {
        assert_eq!(clamp_unit(f32::NAN), 0.0);
        assert_eq!(clamp_unit(2.0), 1.0);
        assert_eq!(finite_vec2(Vec2::new(f32::INFINITY, 1.0)), Vec2::ZERO);
        assert_eq!(smoothstep(0.0, 1.0, 0.5), 0.5);
        assert_eq!(smoothstep(0.2, 0.2, 0.3), 1.0);
    }
}

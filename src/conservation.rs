//! Occupancy measurement and proportional damping.
//!
//! Every `interval` steps a layer's last channel is reduced into a small
//! `R × R` coverage buffer, which is averaged into an occupancy estimate in
//! `[0, 1]`. When occupancy exceeds the upper threshold, one damping pass
//! multiplies the layer toward the lower target:
//!
//! ```text
//! strength = min(max_strength, occupancy - lower)
//! factor   = 1 - strength * gate(local thickness)
//! ```
//!
//! `gate` is 1 for thin cells and falls smoothly to `retention` for
//! established ones, so speckle decays faster than structure.
//!
//! Content that keeps arriving while the layer is over the band builds up
//! `pressure`. Pressure is added to the strength, shortens the cadence to
//! `catch_up_interval`, and lifts `retention` toward 1 so established film
//! is no longer spared. It bleeds off by `relief` on every check that finds
//! the layer back inside the band. Strength never reaches 1, so a single
//! pass never zeroes a cell.
//!
//! Measurement goes through an [`OccupancyProbe`]. [`CpuProbe`] is the
//! default. The GPU probe lives in [`crate::gpu`].

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::field::{clamp_unit, finite_or, smoothstep, Field, FieldView};

/// Largest reduction buffer edge.
pub const MAX_REDUCTION_SIZE: u32 = 32;

/// Largest damping strength of a single pass.
pub const MAX_DAMPING_STRENGTH: f32 = 0.95;

/// Pressure at which established cells lose all protection.
pub const RELEASE_PRESSURE: f32 = 0.5;

/// Band and cadence of one layer's conservation checks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConservationThresholds {
    /// Occupancy above which damping starts.
    pub upper: f32,
    /// Occupancy the damping pulls toward.
    pub lower: f32,
    /// Steps between checks.
    pub interval: u32,
}

impl Default for ConservationThresholds {
    fn default() -> Self {
        Self::primary()
    }
}

impl ConservationThresholds {
    /// Primary-layer defaults.
    pub fn primary() -> Self {
        Self {
            upper: 0.85,
            lower: 0.70,
            interval: 30,
        }
    }

    /// Secondary-layer defaults. Looser than the primary band so viscous
    /// material persists longer on screen.
    pub fn secondary() -> Self {
        Self {
            upper: 0.92,
            lower: 0.78,
            interval: 60,
        }
    }

    /// Copy with `0 <= lower <= upper <= 1` and `interval >= 1`.
    pub fn sanitized(&self) -> Self {
        let upper = clamp_unit(self.upper);
        Self {
            upper,
            lower: clamp_unit(self.lower).min(upper),
            interval: self.interval.max(1),
        }
    }
}

/// Controller tunables shared by both layers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConservationConfig {
    pub enabled: bool,
    pub primary: ConservationThresholds,
    pub secondary: ConservationThresholds,
    /// Cap on the damping strength of one pass.
    pub max_strength: f32,
    /// Edge of the reduction buffer, at most [`MAX_REDUCTION_SIZE`].
    pub reduction_size: u32,
    /// Value at which a cell starts to count as covered.
    pub visibility_low: f32,
    /// Value at which a cell counts as fully covered.
    pub visibility_high: f32,
    /// Thickness at which a cell counts as established.
    pub falloff_thickness: f32,
    /// Fraction of the damping strength applied to established cells.
    pub retention: f32,
    /// Steps between checks while pressure is non-zero.
    pub catch_up_interval: u32,
    /// Pressure gained per over-band check that saw new content, per unit of `occupancy - lower`.
    pub escalation: f32,
    /// Share of pressure kept after an in-band check.
    pub relief: f32,
}

impl Default for ConservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary: ConservationThresholds::primary(),
            secondary: ConservationThresholds::secondary(),
            max_strength: 0.25,
            reduction_size: 16,
            visibility_low: 0.02,
            visibility_high: 0.25,
            falloff_thickness: 0.35,
            retention: 0.35,
            catch_up_interval: 2,
            escalation: 0.1,
            relief: 0.9,
        }
    }
}

impl ConservationConfig {
    /// Set the damping strength cap.
    pub fn with_max_strength(mut self, strength: f32) -> Self {
        self.max_strength = strength.clamp(0.0, MAX_DAMPING_STRENGTH);
        self
    }

    /// Set the reduction buffer edge.
    pub fn with_reduction_size(mut self, size: u32) -> Self {
        self.reduction_size = size.clamp(1, MAX_REDUCTION_SIZE);
        self
    }

    /// Copy with every value clamped into its valid range.
    pub fn sanitized(&self) -> Self {
        let low = clamp_unit(self.visibility_low);
        Self {
            enabled: self.enabled,
            primary: self.primary.sanitized(),
            secondary: self.secondary.sanitized(),
            max_strength: finite_or(self.max_strength, 0.0).clamp(0.0, MAX_DAMPING_STRENGTH),
            reduction_size: self.reduction_size.clamp(1, MAX_REDUCTION_SIZE),
            visibility_low: low,
            visibility_high: clamp_unit(self.visibility_high).max(low),
            falloff_thickness: finite_or(self.falloff_thickness, 0.0).max(0.0),
            retention: clamp_unit(self.retention),
            catch_up_interval: self.catch_up_interval.max(1),
            escalation: finite_or(self.escalation, 0.0).max(0.0),
            relief: clamp_unit(self.relief),
        }
    }

    /// Reduction parameters handed to probes.
    pub fn reduction(&self) -> ReductionParams {
        ReductionParams {
            size: self.reduction_size.clamp(1, MAX_REDUCTION_SIZE),
            visibility_low: self.visibility_low,
            visibility_high: self.visibility_high,
        }
    }

    /// A pass at `strength` with the configured retention and no pressure.
    pub fn damping(&self, strength: f32) -> Damping {
        Damping {
            strength: finite_or(strength, 0.0).clamp(0.0, MAX_DAMPING_STRENGTH),
            retention: self.retention,
        }
    }
}

/// One damping pass decided by a check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Damping {
    /// Strength applied to thin cells, below 1.
    pub strength: f32,
    /// Share of the strength applied to established cells.
    pub retention: f32,
}

impl Damping {
    /// Damping gate for a cell of the given thickness, in `[retention, 1]`.
    #[inline]
    pub fn gate(&self, thickness: f32, config: &ConservationConfig) -> f32 {
        let established = smoothstep(0.0, config.falloff_thickness, finite_or(thickness, 0.0));
        1.0 - (1.0 - self.retention) * established
    }

    /// Multiplier for a cell of the given thickness.
    #[inline]
    pub fn factor(&self, thickness: f32, config: &ConservationConfig) -> f32 {
        1.0 - self.strength * self.gate(thickness, config)
    }
}

/// How a probe turns a field into an occupancy estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReductionParams {
    /// Edge of the `size × size` reduction buffer.
    pub size: u32,
    pub visibility_low: f32,
    pub visibility_high: f32,
}

impl ReductionParams {
    /// Smoothly thresholded coverage of one value.
    #[inline]
    pub fn coverage(&self, value: f32) -> f32 {
        smoothstep(self.visibility_low, self.visibility_high, finite_or(value, 0.0))
    }
}

/// Source of occupancy measurements.
///
/// `None` or a non-finite value marks the measurement as degenerate; the
/// controller then keeps its previous estimate and skips damping.
pub trait OccupancyProbe: Send + fmt::Debug {
    /// Estimate the covered fraction of `field`'s last channel.
    fn measure(&mut self, field: FieldView<'_>, params: &ReductionParams) -> Option<f32>;

    /// Short name for log output.
    fn name(&self) -> &str;
}

/// Block-averaging reduction on the CPU.
#[derive(Clone, Debug, Default)]
pub struct CpuProbe {
    reduction: Vec<f32>,
}

impl CpuProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-block coverage from the most recent measurement, row-major.
    pub fn reduction(&self) -> &[f32] {
        &self.reduction
    }
}

/// Range of grid cells covered by reduction block `i` of `size` along an axis of `len` cells.
#[inline]
pub(crate) fn block_range(i: usize, size: usize, len: usize) -> (usize, usize) {
    (i * len / size, (i + 1) * len / size)
}

impl OccupancyProbe for CpuProbe {
    fn measure(&mut self, field: FieldView<'_>, params: &ReductionParams) -> Option<f32> {
        if field.is_empty() {
            self.reduction.clear();
            return Some(0.0);
        }
        let size = params.size.clamp(1, MAX_REDUCTION_SIZE) as usize;
        let (w, h) = (field.width(), field.height());

        self.reduction.resize(size * size, 0.0);
        self.reduction
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(by, row)| {
                let (y0, y1) = block_range(by, size, h);
                for (bx, slot) in row.iter_mut().enumerate() {
                    let (x0, x1) = block_range(bx, size, w);
                    let count = (x1 - x0) * (y1 - y0);
                    *slot = if count == 0 {
                        f32::NAN
                    } else {
                        let mut sum = 0.0;
                        for y in y0..y1 {
                            for x in x0..x1 {
                                sum += params.coverage(field.last(x, y));
                            }
                        }
                        sum / count as f32
                    };
                }
            });

        // Blocks narrower than a cell are empty on small grids and skipped.
        let (sum, count) = self
            .reduction
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0f64, 0usize), |(s, n), v| (s + *v as f64, n + 1));
        if count == 0 {
            return Some(0.0);
        }
        Some((sum / count as f64) as f32)
    }

    fn name(&self) -> &str {
        "cpu"
    }
}

/// Which channels a damping pass scales.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DampTarget {
    /// Every channel; used for premultiplied primary dye.
    AllChannels,
    /// Only the last channel; used for secondary thickness under straight tint.
    LastChannel,
}

/// Per-layer controller state. Only [`ConservationController`] mutates it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConservationState {
    /// Last valid occupancy estimate.
    pub occupancy: f32,
    pub thresholds: ConservationThresholds,
    /// Steps since the last check.
    pub steps_since_check: u32,
    /// Checks performed so far, including degenerate ones.
    pub checks: u64,
    /// Strength of the most recent damping pass, 0 when none ran.
    pub last_strength: f32,
    /// Escalation built up by content arriving over the band.
    pub pressure: f32,
}

/// Measures and damps one layer.
#[derive(Debug)]
pub struct ConservationController {
    state: ConservationState,
    target: DampTarget,
    probe: Box<dyn OccupancyProbe>,
    inflow: bool,
}

impl ConservationController {
    /// Create a controller with the CPU probe.
    pub fn new(thresholds: ConservationThresholds, target: DampTarget) -> Self {
        Self {
            state: ConservationState {
                occupancy: 0.0,
                thresholds: thresholds.sanitized(),
                steps_since_check: 0,
                checks: 0,
                last_strength: 0.0,
                pressure: 0.0,
            },
            target,
            probe: Box::new(CpuProbe::new()),
            inflow: false,
        }
    }

    /// Replace the measurement backend.
    pub fn set_probe(&mut self, probe: Box<dyn OccupancyProbe>) {
        log::info!("occupancy probe switched to {}", probe.name());
        self.probe = probe;
    }

    /// Replace the band and cadence used by future checks.
    pub fn set_thresholds(&mut self, thresholds: ConservationThresholds) {
        self.state.thresholds = thresholds.sanitized();
    }

    pub fn state(&self) -> &ConservationState {
        &self.state
    }

    /// Last valid occupancy estimate.
    pub fn occupancy(&self) -> f32 {
        self.state.occupancy
    }

    /// Note that new content reached the layer since the last check.
    pub fn record_inflow(&mut self) {
        self.inflow = true;
    }

    /// Steps between checks at the current pressure.
    pub fn interval(&self, config: &ConservationConfig) -> u32 {
        let interval = self.state.thresholds.interval.max(1);
        if self.state.pressure > 0.0 {
            interval.min(config.catch_up_interval.max(1))
        } else {
            interval
        }
    }

    /// Advance the step counter. Returns `true` when a check is due.
    pub fn advance(&mut self, config: &ConservationConfig) -> bool {
        self.state.steps_since_check += 1;
        if self.state.steps_since_check < self.interval(config) {
            return false;
        }
        self.state.steps_since_check = 0;
        true
    }

    /// Advance the step counter and run a check when the interval elapses.
    ///
    /// Returns the damping pass applied, if one ran.
    pub fn tick(&mut self, field: &mut Field, config: &ConservationConfig) -> Option<Damping> {
        if !self.advance(config) {
            return None;
        }
        self.check(field, config)
    }

    /// Measure now and damp if over the upper threshold.
    pub fn check(&mut self, field: &mut Field, config: &ConservationConfig) -> Option<Damping> {
        let damping = self.measure(field.view(), config)?;
        damp(field, &damping, config, self.target);
        Some(damping)
    }

    /// Measure `view` and return the damping pass it calls for, without damping.
    ///
    /// Used directly when the layer's content lives outside the measured field,
    /// as with rasterized particles.
    pub fn measure(&mut self, view: FieldView<'_>, config: &ConservationConfig) -> Option<Damping> {
        self.state.checks += 1;
        self.state.last_strength = 0.0;

        let measured = self.probe.measure(view, &config.reduction());
        let occupancy = match measured {
            Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
            other => {
                log::warn!(
                    "degenerate occupancy from {} probe ({:?}); holding {:.3}",
                    self.probe.name(),
                    other,
                    self.state.occupancy
                );
                return None;
            }
        };
        self.state.occupancy = occupancy;
        let inflow = std::mem::take(&mut self.inflow);

        let ConservationThresholds { upper, lower, .. } = self.state.thresholds;
        if occupancy <= upper {
            self.state.pressure *= config.relief;
            if self.state.pressure < 1e-3 {
                self.state.pressure = 0.0;
            }
            return None;
        }
        if inflow {
            self.state.pressure =
                (self.state.pressure + config.escalation * (occupancy - lower)).min(MAX_DAMPING_STRENGTH);
        }

        let pressure = self.state.pressure;
        let base = (occupancy - lower).min(config.max_strength).max(0.0);
        let strength = (base + pressure).min(MAX_DAMPING_STRENGTH);
        if strength <= 0.0 {
            return None;
        }
        let release = (pressure / RELEASE_PRESSURE).min(1.0);
        let damping = Damping {
            strength,
            retention: config.retention + (1.0 - config.retention) * release,
        };
        log::debug!(
            "occupancy {:.3} above {:.3}; damping toward {:.3} at strength {:.3} (pressure {:.3})",
            occupancy,
            upper,
            lower,
            strength,
            pressure
        );
        self.state.last_strength = strength;
        Some(damping)
    }
}

/// One proportional damping pass.
pub fn damp(field: &mut Field, damping: &Damping, config: &ConservationConfig, target: DampTarget) {
    let strength = finite_or(damping.strength, 0.0).clamp(0.0, MAX_DAMPING_STRENGTH);
    if strength <= 0.0 {
        return;
    }
    let damping = Damping {
        strength,
        retention: clamp_unit(damping.retention),
    };
    let last = field.channels() - 1;
    field.pass(|x, y, src, out| {
        let cell = src.cell(x, y);
        let factor = damping.factor(cell[last], config);
        for (ch, slot) in out.iter_mut().enumerate() {
            *slot = match target {
                DampTarget::AllChannels => clamp_unit(cell[ch] * factor),
                DampTarget::LastChannel if ch == last => clamp_unit(cell[ch] * factor),
                DampTarget::LastChannel => cell[ch],
            };
        }
    });
}

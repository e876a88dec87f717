//! Integration tests for coupling and conservation behaviour.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tpfe::conservation::ConservationThresholds;
use tpfe::gpu::{GpuContext, GpuOccupancyProbe};
use tpfe::prelude::*;

// ============================================================================
// Coupling Tests
// ============================================================================

/// Two disjoint regions painted with different coupling feel the same carrier flow.
#[test]
fn test_stronger_coupling_moves_film_further() {
    let mut sim = FluidSim::new(FluidConfig::new(64, 64)).unwrap();
    let strong = Vec2::new(0.3, 0.5);
    let weak = Vec2::new(0.7, 0.5);
    sim.paint(strong, 0.08, 1.0, &MaterialPreset::ink().with_coupling(0.5));
    sim.paint(weak, 0.08, 1.0, &MaterialPreset::ink().with_coupling(0.1));

    // Flow along y is mirror-symmetric about x = 0.5, so both regions see the same carrier.
    sim.primary_mut().layer.velocity.fill(&[0.0, 20.0]);
    sim.step(1.0 / 60.0, &[]);

    let velocity = sim.field(FieldName::SecondaryVelocity);
    let at_strong = velocity.vec2(19, 32).length();
    let at_weak = velocity.vec2(44, 32).length();
    assert!(at_strong > at_weak, "strong {at_strong} vs weak {at_weak}");
    assert!(at_weak > 0.0);
}

#[test]
fn test_thin_film_follows_carrier() {
    let mut sim = FluidSim::new(FluidConfig::new(32, 32)).unwrap();
    sim.secondary_mut().layer.scalar.fill(&[0.5, 0.5, 0.5, 1e-4]);
    sim.primary_mut().layer.velocity.fill(&[0.0, 10.0]);
    sim.step(1.0 / 60.0, &[]);

    let primary = sim.field(FieldName::PrimaryVelocity);
    let secondary = sim.field(FieldName::SecondaryVelocity);
    assert!(secondary.data().iter().all(|v| v.is_finite()));
    let (p, s) = (primary.vec2(16, 16), secondary.vec2(16, 16));
    assert!(s.y > 0.0);
    assert!((s - p).length() <= 0.05 * p.length() + 1e-3, "film {s} vs carrier {p}");
}

// ============================================================================
// Conservation Tests
// ============================================================================

/// Film covering 95% of an 80-wide grid: 76 full columns over 16 blocks of 5.
fn overfilled_sim(interval: u32) -> FluidSim {
    let band = ConservationThresholds {
        upper: 0.85,
        lower: 0.70,
        interval,
    };
    let mut conservation = ConservationConfig::default();
    conservation.secondary = band;
    let mut sim = FluidSim::new(FluidConfig::new(80, 80).with_conservation(conservation)).unwrap();
    let scalar = &mut sim.secondary_mut().layer.scalar;
    scalar.pass(|x, _, _, out| {
        out.copy_from_slice(&[0.3, 0.6, 0.9, if x < 76 { 1.0 } else { 0.0 }]);
    });
    sim
}

fn occupancy_per_check(sim: &mut FluidSim, steps: usize) -> Vec<f32> {
    let mut seen = 0;
    let mut occupancies = Vec::new();
    for _ in 0..steps {
        sim.step(1.0 / 60.0, &[]);
        let state = sim.conservation(LayerId::Secondary).state();
        if state.checks > seen {
            seen = state.checks;
            occupancies.push(state.occupancy);
        }
    }
    occupancies
}

#[test]
fn test_overfilled_layer_settles_in_band() {
    let mut sim = overfilled_sim(5);
    let occupancies = occupancy_per_check(&mut sim, 150);
    assert_eq!(occupancies.len(), 30);

    assert!((occupancies[0] - 0.95).abs() < 1e-3, "first check {}", occupancies[0]);
    for pair in occupancies.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-5, "occupancy rose: {:?}", pair);
    }
    let last = *occupancies.last().unwrap();
    assert!(last <= 0.85 + 1e-4, "settled at {last}");
    assert!(last >= 0.70, "overshot to {last}");

    let thickness = sim.field(FieldName::SecondaryScalar);
    assert!(thickness.last(10, 10) > 0.0, "damping must never clear the film");
}

/// Paint lands somewhere every step, far faster than the scheduled checks
/// could drain it on their own.
#[test]
fn test_sustained_painting_held_near_band() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut sim = FluidSim::new(FluidConfig::new(64, 64)).unwrap();
    let ink = MaterialPreset::ink();
    let band = ink.conservation;

    let mut seen = 0;
    let mut settled = Vec::new();
    for step in 0..500 {
        let at = Vec2::new(rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0));
        sim.paint(at, 0.15, 0.8, &ink);
        sim.step(1.0 / 60.0, &[]);
        let state = sim.conservation(LayerId::Secondary).state();
        if state.checks > seen {
            seen = state.checks;
            assert!(state.occupancy > 0.0, "film cleared at step {step}");
            if step >= 150 {
                settled.push(state.occupancy);
            }
        }
    }

    assert!(settled.len() > 100, "only {} checks", settled.len());
    let mean = settled.iter().sum::<f32>() / settled.len() as f32;
    assert!(mean >= band.lower && mean <= band.upper + 0.03, "mean occupancy {mean}");
    let near = settled
        .iter()
        .filter(|o| (band.lower..=band.upper + 0.05).contains(*o))
        .count();
    assert!(near * 5 >= settled.len() * 4, "{near} of {} checks near the band", settled.len());
}

#[test]
fn test_pressure_fades_once_painting_stops() {
    let mut sim = FluidSim::new(FluidConfig::new(48, 48)).unwrap();
    let ink = MaterialPreset::ink();
    for i in 0..120 {
        let t = i as f32 * 0.37;
        sim.paint(Vec2::new(0.5 + 0.35 * t.cos(), 0.5 + 0.35 * t.sin()), 0.2, 0.9, &ink);
        sim.step(1.0 / 60.0, &[]);
    }
    assert!(sim.conservation(LayerId::Secondary).state().pressure > 0.0);

    for _ in 0..600 {
        sim.step(1.0 / 60.0, &[]);
    }
    let state = sim.conservation(LayerId::Secondary).state();
    assert_eq!(state.pressure, 0.0);
    assert!(state.occupancy <= ink.conservation.upper + 0.02, "{}", state.occupancy);
    assert!(sim.field(FieldName::SecondaryScalar).max_abs() > 0.0);
}

// ============================================================================
// Material Tests
// ============================================================================

#[test]
fn test_viscous_sweeps_leave_with_their_film() {
    let mut sim = FluidSim::new(FluidConfig::new(48, 48)).unwrap();
    let (honey, ink) = (MaterialPreset::honey(), MaterialPreset::ink());
    sim.paint(Vec2::new(0.25, 0.25), 0.1, 1.0, &honey);
    sim.step(1.0 / 60.0, &[]);
    assert_eq!(
        sim.secondary().viscosity_iterations(&sim.config().secondary),
        honey.viscosity_iterations
    );

    sim.secondary_mut().layer.scalar.fill(&[0.0, 0.0, 0.0, 0.0]);
    sim.paint(Vec2::new(0.75, 0.75), 0.1, 1.0, &ink);
    for _ in 0..10 {
        sim.step(1.0 / 60.0, &[]);
    }
    assert_eq!(
        sim.secondary().viscosity_iterations(&sim.config().secondary),
        ink.viscosity_iterations
    );
    // The honey's properties are still where it was painted.
    let props = sim.secondary().props_at(12, 12);
    assert!((props.viscosity - honey.props().viscosity).abs() < 0.05);
}

#[test]
fn test_damping_waits_for_interval() {
    let mut sim = overfilled_sim(8);
    for _ in 0..7 {
        sim.step(1.0 / 60.0, &[]);
    }
    assert_eq!(sim.conservation(LayerId::Secondary).state().checks, 0);
    assert_eq!(sim.field(FieldName::SecondaryScalar).last(10, 10), 1.0);

    sim.step(1.0 / 60.0, &[]);
    assert_eq!(sim.conservation(LayerId::Secondary).state().checks, 1);
    let damped = sim.field(FieldName::SecondaryScalar).last(10, 10);
    assert!(damped < 1.0 && damped > 0.5);
}

#[test]
fn test_damping_keeps_tint() {
    let mut sim = overfilled_sim(1);
    sim.step(1.0 / 60.0, &[]);
    let cell = sim.field(FieldName::SecondaryScalar).cell(40, 40).to_vec();
    assert!(cell[3] < 1.0);
    assert!((cell[2] - 0.9).abs() < 0.05, "tint changed to {}", cell[2]);
}

#[test]
fn test_disabled_conservation_never_damps() {
    let mut sim = overfilled_sim(1);
    let mut config = sim.config().conservation;
    config.enabled = false;
    let mut disabled = FluidSim::new(FluidConfig::new(80, 80).with_conservation(config)).unwrap();
    disabled.secondary_mut().layer.scalar.fill(&[0.0, 0.0, 0.0, 1.0]);
    for _ in 0..5 {
        disabled.step(1.0 / 60.0, &[]);
        sim.step(1.0 / 60.0, &[]);
    }
    assert_eq!(disabled.field(FieldName::SecondaryScalar).last(5, 5), 1.0);
    assert!(sim.field(FieldName::SecondaryScalar).last(5, 5) < 1.0);
}

#[test]
fn test_gpu_probe_drives_conservation() {
    let Ok(context) = GpuContext::headless() else {
        eprintln!("Skipping: no GPU adapter");
        return;
    };
    let mut sim = overfilled_sim(1);
    sim.set_occupancy_probe(LayerId::Secondary, Box::new(GpuOccupancyProbe::new(&context)));
    sim.step(1.0 / 60.0, &[]);
    let occupancy = sim.occupancy(LayerId::Secondary);
    assert!((occupancy - 0.95).abs() < 1e-3, "{occupancy}");
}

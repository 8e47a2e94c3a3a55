// End-to-end analysis scenarios on stored runs

use approx::{assert_abs_diff_eq, assert_relative_eq};
use tempfile::TempDir;

use shiftlab::analysis::cleaner::analyze_run_quality;
use shiftlab::analysis::comparison::{CompareOptions, Verdict, compare_runs};
use shiftlab::analysis::gear_ratios::detect_gear_ratios;
use shiftlab::analysis::shift_points::{ratios_by_gear, solve_shift_points};
use shiftlab::analysis::torque_curve::{TorqueCurve, TorquePoint};
use shiftlab::storage::FileRunStore;
use shiftlab::{MemoryRunStore, RunKind, RunStore, Sample, SessionInfo};

const TICK_S: f64 = 0.02;
/// Road speed per engine speed (km/h per rev/min) of gears 1 to 4
const GEAR_SPEED_RATIOS: [f64; 4] = [0.0125, 0.017, 0.022, 0.027];
const SHIFT_RPM: f64 = 7500.0;

fn session(vehicle_name: &str) -> SessionInfo {
    SessionInfo {
        vehicle_name: vehicle_name.to_string(),
        ..Default::default()
    }
}

/// Full-throttle pull from standstill with a 3 tick power cut at every upshift
fn drag_pull(power: f64) -> Vec<Sample> {
    let mut samples = Vec::new();
    let (mut speed_kmh, mut elapsed_s) = (5., 0.);
    let (mut gear, mut cut_ticks) = (1usize, 0);
    while speed_kmh < 250. && elapsed_s < 80. {
        if gear < GEAR_SPEED_RATIOS.len() && speed_kmh / GEAR_SPEED_RATIOS[gear - 1] > SHIFT_RPM {
            gear += 1;
            cut_ticks = 3;
        }
        let accel = power * (1. - speed_kmh / 300.) / (gear as f64).sqrt();
        let torque_proxy = if cut_ticks > 0 {
            cut_ticks -= 1;
            100.
        } else {
            accel * 1000.
        };
        samples.push(Sample {
            elapsed_s,
            gear: gear as i32,
            engine_rpm: speed_kmh / GEAR_SPEED_RATIOS[gear - 1],
            torque_proxy,
            speed_kmh,
            throttle: 1.,
            lat_g: Some(0.05),
            lon_g: Some(torque_proxy / 1000. / 9.81),
            steering: Some(0.),
            ..Default::default()
        });
        speed_kmh += torque_proxy / 1000. * 3.6 * TICK_S;
        elapsed_s += TICK_S;
    }
    samples
}

fn store_drag_run(store: &mut impl RunStore, vehicle_name: &str, samples: Vec<Sample>) {
    let run_id = store.create_run(&session(vehicle_name), RunKind::Drag).unwrap();
    store.append_samples(run_id, &samples).unwrap();
    store.seal_run(run_id, samples.len()).unwrap();
}

/// Constant 0.5 g lap at 120 km/h, the first sample replaced by `first_lat_g`
fn handling_lap(first_lat_g: f64) -> Vec<Sample> {
    (0..200)
        .map(|i| Sample {
            elapsed_s: i as f64 * 0.05,
            gear: 3,
            engine_rpm: 6000.,
            speed_kmh: 120.,
            throttle: 1.,
            lat_g: Some(if i == 0 { first_lat_g } else { 0.5 }),
            lon_g: Some(-0.2),
            steering: Some(0.1 + 0.01 * (i as f64 * 0.3).sin()),
            ..Default::default()
        })
        .collect()
}

#[test]
fn test_identical_runs_tie() {
    let mut store = MemoryRunStore::new();
    let a = store.insert_run(&session("Car"), RunKind::Drag, drag_pull(10.));
    let b = store.insert_run(&session("Car"), RunKind::Drag, drag_pull(10.));

    let comparison = compare_runs(&store, a, b, &CompareOptions::default()).unwrap();

    assert!(comparison.delta.points.len() > 5);
    assert!(
        comparison
            .delta
            .points
            .iter()
            .all(|p| p.distance_delta_m == 0.)
    );
    assert_eq!(comparison.delta.verdict, Verdict::Tie);
    assert_eq!(comparison.a.kpis, comparison.b.kpis);
    assert_eq!(comparison.delta.points[0].elapsed_s, 0.);
}

#[test]
fn test_stronger_car_wins_and_shifts_are_found() {
    let mut store = MemoryRunStore::new();
    let a = store.insert_run(&session("Strong"), RunKind::Drag, drag_pull(11.));
    let b = store.insert_run(&session("Weak"), RunKind::Drag, drag_pull(10.));

    let comparison = compare_runs(&store, a, b, &CompareOptions::default()).unwrap();

    assert!(matches!(comparison.delta.verdict, Verdict::AheadA { metres } if metres > 1.));
    let shifts = &comparison.a.shifts;
    assert!(!shifts.is_empty());
    for shift in shifts {
        assert_eq!(shift.to_gear, shift.from_gear + 1);
        // three cut ticks of 20 ms
        assert_abs_diff_eq!(shift.latency_ms, 40., epsilon = 1e-6);
    }
    let t100_a = comparison.a.kpis.time_to_speed[0].seconds.unwrap();
    let t100_b = comparison.b.kpis.time_to_speed[0].seconds.unwrap();
    assert!(t100_a < t100_b);
    assert!(!comparison.a.gear_acceleration.is_empty());
}

/// Launch from standstill at a constant 5 m/s^2 (18 km/h per second)
fn standstill_launch() -> Vec<Sample> {
    (0..=420)
        .map(|i| {
            let elapsed_s = i as f64 * TICK_S;
            Sample {
                elapsed_s,
                gear: 1,
                engine_rpm: 3000.,
                torque_proxy: 5000.,
                speed_kmh: 18. * elapsed_s,
                throttle: 1.,
                ..Default::default()
            }
        })
        .collect()
}

#[test]
fn test_time_to_speed_counts_from_sync_speed() {
    let mut store = MemoryRunStore::new();
    let a = store.insert_run(&session("Car"), RunKind::Drag, standstill_launch());
    let b = store.insert_run(&session("Car"), RunKind::Drag, standstill_launch());

    let t100 = |sync_speed_kmh: f64| {
        let options = CompareOptions {
            sync_speed_kmh,
            ..Default::default()
        };
        let comparison = compare_runs(&store, a, b, &options).unwrap();
        assert_eq!(comparison.delta.verdict, Verdict::Tie);
        assert_eq!(comparison.a.kpis.time_to_speed[0].target_kmh, 100.);
        comparison.a.kpis.time_to_speed[0].seconds.unwrap()
    };

    // first samples at or above 20, 50, 60 and 100 km/h: 1.12 s, 2.78 s, 3.34 s, 5.56 s
    assert_abs_diff_eq!(t100(20.), 4.44, epsilon = 1e-9);
    assert_abs_diff_eq!(t100(50.), 2.78, epsilon = 1e-9);
    assert_abs_diff_eq!(t100(60.), 2.22, epsilon = 1e-9);
}

#[test]
fn test_virtual_runs_compare_on_envelope() {
    let mut store = MemoryRunStore::new();
    let a = store.insert_run(&session("Strong"), RunKind::Drag, drag_pull(11.));
    let b = store.insert_run(&session("Weak"), RunKind::Drag, drag_pull(10.));
    let options = CompareOptions {
        virtual_run: true,
        ..Default::default()
    };

    let comparison = compare_runs(&store, a, b, &options).unwrap();
    assert!(matches!(comparison.delta.verdict, Verdict::AheadA { .. }));
    assert!(
        comparison
            .delta
            .points
            .windows(2)
            .all(|pair| pair[1].elapsed_s > pair[0].elapsed_s)
    );
}

#[test]
fn test_lateral_spike_flags_crash_but_scores_clipped() {
    let spiked = analyze_run_quality(&handling_lap(8.0));
    let clipped = analyze_run_quality(&handling_lap(4.0));

    assert!(spiked.crash_detected);
    assert!(!clipped.crash_detected);
    assert_eq!(spiked.cleaned.len(), clipped.cleaned.len());
    assert_eq!(spiked.stability, clipped.stability);
    assert_eq!(spiked.confidence, clipped.confidence);
    assert_eq!(spiked.score, clipped.score);
    assert!((0. ..=100.).contains(&spiked.score));
}

#[test]
fn test_gear_ratios_detected_from_stored_runs() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = FileRunStore::new(temp_dir.path().to_path_buf()).unwrap();
    store_drag_run(&mut store, "Porsche 963", drag_pull(10.));
    store_drag_run(&mut store, "Porsche 963", drag_pull(9.));

    let profile = detect_gear_ratios(&mut store, "Porsche 963")
        .unwrap()
        .unwrap();
    assert_eq!(profile.ratios.len(), GEAR_SPEED_RATIOS.len());
    for (gear, expected) in GEAR_SPEED_RATIOS.iter().enumerate() {
        assert_relative_eq!(profile.ratios[&(gear as i32 + 1)], *expected, max_relative = 1e-9);
    }
    assert_eq!(
        FileRunStore::new(temp_dir.path().to_path_buf())
            .unwrap()
            .load_gear_ratios("Porsche 963")
            .unwrap(),
        Some(profile)
    );
}

#[test]
fn test_analytic_peak_shift_point() {
    let torque = |rpm: f64| 500. - 0.4 * ((rpm - 6000.) / 100.).powi(2);
    let curve = TorqueCurve {
        points: (0..=140)
            .map(|i| {
                let engine_rpm = 2000. + i as f64 * 50.;
                TorquePoint {
                    engine_rpm,
                    torque_nm: torque(engine_rpm),
                }
            })
            .collect(),
        smoothed: true,
    };
    let (r1, r2) = (3.25, 2.5);
    let solution = solve_shift_points(&curve, &ratios_by_gear(&[r1, r2]), 1.0, 0.34);
    let shift_rpm = solution.shift_points[0].shift_rpm;

    // T(n) * r1 == T(n / 1.3) * r2 above the peak
    let gap = |n: f64| torque(n) * r1 - torque(n / 1.3) * r2;
    let (mut lo, mut hi) = (6000., 9000.);
    for _ in 0..60 {
        let mid = (lo + hi) / 2.;
        if gap(mid) > 0. {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    assert!(shift_rpm < 9000.);
    assert_abs_diff_eq!(shift_rpm, lo, epsilon = 20.);
    assert_abs_diff_eq!(
        solution.shift_points[0].landing_rpm,
        shift_rpm / 1.3,
        epsilon = 1e-6
    );
}

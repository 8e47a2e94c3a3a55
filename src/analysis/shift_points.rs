// Optimal up-shift engine speeds from a torque curve and the gear ratios.

use std::f64::consts::PI;

use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::VehicleParams;
use crate::errors::ShiftlabError;
use crate::storage::{GearRatios, RunId, RunStore, ShiftProfile};

use super::gear_ratios::detect_gear_ratios;
use super::interpolate::CubicSpline;
use super::torque_curve::{TorqueCurve, reconstruct_torque_curve};
use super::arange;

/// Scan never starts below this engine speed
const MIN_SCAN_RPM: f64 = 3000.0;
const SCAN_STEP_RPM: f64 = 10.0;
/// Shift points this close to the limiter are reported as the limiter
const LIMITER_SNAP_RPM: f64 = 50.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShiftPoint {
    pub from_gear: i32,
    pub to_gear: i32,
    pub shift_rpm: f64,
    /// Engine speed right after the shift
    pub landing_rpm: f64,
}

/// Gross wheel force of one gear against road speed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WheelForceTrace {
    pub gear: i32,
    pub speed_kmh: Vec<f64>,
    pub force_n: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ShiftSolution {
    pub shift_points: Vec<ShiftPoint>,
    pub traces: Vec<WheelForceTrace>,
}

fn road_speed_kmh(engine_rpm: f64, ratio: f64, final_drive: f64, wheel_radius_m: f64) -> f64 {
    engine_rpm * 2. * PI / 60. * wheel_radius_m / (ratio * final_drive) * 3.6
}

/// Number a plain ratio list from first gear up
pub fn ratios_by_gear(ratios: &[f64]) -> GearRatios {
    (1..).zip(ratios.iter().copied()).collect()
}

/// One shift point per pair of adjacent gears that both have a ratio.
///
/// For gear pair (i, i+1) the wheel force of gear i at engine speed `n` is
/// compared with gear i+1 at the same road speed (engine speed
/// `n * r[i+1] / r[i]`). Scanning from the top, the first engine speed where
/// gear i still pulls harder is the shift point. Aerodynamic drag is the same
/// for both gears at equal road speed and is left out. Without a crossing, or
/// within 50 rev/min of it, the limiter (curve maximum) is used.
pub fn solve_shift_points(
    curve: &TorqueCurve,
    gear_ratios: &GearRatios,
    final_drive: f64,
    wheel_radius_m: f64,
) -> ShiftSolution {
    let Some(torque) = CubicSpline::new(
        curve.points.iter().map(|p| p.engine_rpm).collect(),
        curve.points.iter().map(|p| p.torque_nm).collect(),
    ) else {
        warn!("Torque curve cannot be interpolated");
        return ShiftSolution::default();
    };
    if gear_ratios.values().any(|r| *r <= 0.) || final_drive <= 0. || wheel_radius_m <= 0. {
        warn!("Non-positive drivetrain parameters, no shift points");
        return ShiftSolution::default();
    }

    let limiter = torque.max_x();
    let fine_rpm = arange(torque.min_x().max(MIN_SCAN_RPM), limiter, SCAN_STEP_RPM);
    let wheel_force =
        |rpm: f64, ratio: f64| torque.eval(rpm) * ratio * final_drive / wheel_radius_m;

    let traces = gear_ratios
        .iter()
        .map(|(gear, ratio)| WheelForceTrace {
            gear: *gear,
            speed_kmh: fine_rpm
                .iter()
                .map(|rpm| road_speed_kmh(*rpm, *ratio, final_drive, wheel_radius_m))
                .collect(),
            force_n: fine_rpm.iter().map(|rpm| wheel_force(*rpm, *ratio)).collect(),
        })
        .collect();

    let shift_points = gear_ratios
        .iter()
        .tuple_windows()
        .filter(|((gear, _), (next_gear, _))| **next_gear == **gear + 1)
        .map(|((gear, ratio), (next_gear, next_ratio))| {
            let (ratio, next_ratio) = (*ratio, *next_ratio);
            let drop_factor = next_ratio / ratio;

            let mut shift_rpm = limiter;
            for j in (1..fine_rpm.len()).rev() {
                let rpm = fine_rpm[j];
                if wheel_force(rpm, ratio) > wheel_force(rpm * drop_factor, next_ratio) {
                    shift_rpm = rpm;
                    break;
                }
            }
            if fine_rpm.first() == Some(&shift_rpm) || shift_rpm > limiter - LIMITER_SNAP_RPM {
                shift_rpm = limiter;
            }

            ShiftPoint {
                from_gear: *gear,
                to_gear: *next_gear,
                shift_rpm,
                landing_rpm: shift_rpm * drop_factor,
            }
        })
        .collect();

    ShiftSolution {
        shift_points,
        traces,
    }
}

/// Everything derived while computing the shift table of a run
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShiftAnalysis {
    pub run_id: RunId,
    pub gear_ratios: GearRatios,
    pub final_drive: f64,
    pub torque_curve: TorqueCurve,
    pub solution: ShiftSolution,
}

/// Reconstruct the torque curve of a run, solve its shift points and store
/// them as the run's shift profile.
///
/// Explicit ratios are numbered from first gear. Without them the vehicle's
/// stored (or freshly detected) gear ratio profile is used, keeping its gear
/// numbers; those ratios already include the final drive, so `final_drive`
/// is ignored for them.
pub fn analyze_shift_points<R: RunStore + ?Sized>(
    store: &mut R,
    run_id: RunId,
    gear_ratios: Option<Vec<f64>>,
    final_drive: f64,
    params: &VehicleParams,
) -> Result<ShiftAnalysis, ShiftlabError> {
    let run = store.require_run(run_id)?;
    let vehicle_name = run.header.vehicle_name.clone();

    let (gear_ratios, final_drive) = match gear_ratios {
        Some(ratios) => (ratios_by_gear(&ratios), final_drive),
        None => {
            let profile = match store.load_gear_ratios(&vehicle_name)? {
                Some(profile) if !profile.ratios.is_empty() => Some(profile),
                _ => detect_gear_ratios(store, &vehicle_name)?,
            };
            let ratios = profile
                .map(|p| p.drivetrain_ratios())
                .unwrap_or_default();
            (ratios, 1.0)
        }
    };
    if gear_ratios.len() < 2 {
        return Err(ShiftlabError::InsufficientData {
            reason: format!("{} gear ratios known for {}", gear_ratios.len(), vehicle_name),
        });
    }

    let torque_curve =
        reconstruct_torque_curve(&run.samples, &gear_ratios, final_drive, params)?;
    let solution = solve_shift_points(
        &torque_curve,
        &gear_ratios,
        final_drive,
        params.wheel_radius_m,
    );

    store.save_shift_profile(&ShiftProfile {
        run_id,
        vehicle_name,
        shift_points: solution.shift_points.clone(),
    })?;
    info!(
        "Stored {} shift points for run {}",
        solution.shift_points.len(),
        run_id
    );

    Ok(ShiftAnalysis {
        run_id,
        gear_ratios,
        final_drive,
        torque_curve,
        solution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::torque_curve::TorquePoint;
    use crate::config::VehicleClass;
    use crate::storage::{GearRatioProfile, MemoryRunStore};
    use crate::telemetry::{RunKind, Sample, SessionInfo, TORQUE_PROXY_SCALE};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn curve_from(torque: impl Fn(f64) -> f64, min_rpm: f64, max_rpm: f64) -> TorqueCurve {
        TorqueCurve {
            points: arange(min_rpm, max_rpm + 1., 50.)
                .into_iter()
                .map(|engine_rpm| TorquePoint {
                    engine_rpm,
                    torque_nm: torque(engine_rpm),
                })
                .collect(),
            smoothed: true,
        }
    }

    #[test]
    fn test_decreasing_curve_shifts_at_limiter() {
        let curve = curve_from(|rpm| 600. - rpm * 0.03, 2000., 8000.);
        let solution = solve_shift_points(&curve, &ratios_by_gear(&[3.0, 2.2, 1.7]), 1.0, 0.33);

        assert_eq!(solution.shift_points.len(), 2);
        for point in &solution.shift_points {
            assert_eq!(point.shift_rpm, 8000.);
        }
        assert_abs_diff_eq!(
            solution.shift_points[0].landing_rpm,
            8000. * 2.2 / 3.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_traces_cover_every_gear() {
        let curve = curve_from(|_| 400., 3000., 7000.);
        let solution = solve_shift_points(&curve, &ratios_by_gear(&[3.0, 2.0]), 1.0, 0.33);

        assert_eq!(solution.traces.len(), 2);
        let first = &solution.traces[0];
        assert_eq!(first.gear, 1);
        assert_abs_diff_eq!(first.force_n[0], 400. * 3.0 / 0.33, epsilon = 1e-6);
        assert_abs_diff_eq!(
            first.speed_kmh[0],
            3000. * 2. * PI / 60. * 0.33 / 3.0 * 3.6,
            epsilon = 1e-9
        );
        assert!(solution.traces[1].speed_kmh[0] > first.speed_kmh[0]);
    }

    #[test]
    fn test_single_gear_has_no_shift_points() {
        let curve = curve_from(|_| 400., 3000., 7000.);
        assert!(
            solve_shift_points(&curve, &ratios_by_gear(&[3.0]), 1.0, 0.33)
                .shift_points
                .is_empty()
        );
    }

    #[test]
    fn test_peaky_curve_shifts_before_limiter() {
        let torque = |rpm: f64| 400. - 0.5 * ((rpm - 6000.) / 100.).powi(2);
        let curve = curve_from(torque, 2000., 9000.);
        let (r1, r2) = (2.6, 2.0);
        let solution = solve_shift_points(&curve, &ratios_by_gear(&[r1, r2]), 1.0, 0.35);
        let shift = solution.shift_points[0].shift_rpm;

        // root of T(n) * r1 = T(n * r2 / r1) * r2 above the torque peak
        let gap = |n: f64| torque(n) * r1 - torque(n * r2 / r1) * r2;
        let (mut lo, mut hi) = (6000., 9000.);
        for _ in 0..60 {
            let mid = (lo + hi) / 2.;
            if gap(mid) > 0. {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        assert!(shift < 9000.);
        assert_abs_diff_eq!(shift, lo, epsilon = 20.);
    }

    #[test]
    fn test_shift_points_carry_real_gear_numbers() {
        let torque = |rpm: f64| 400. - 0.5 * ((rpm - 6000.) / 100.).powi(2);
        let curve = curve_from(torque, 2000., 9000.);

        let solution = solve_shift_points(&curve, &GearRatios::from([(2, 2.6), (3, 2.0)]), 1.0, 0.35);
        assert_eq!(solution.shift_points.len(), 1);
        assert_eq!(solution.shift_points[0].from_gear, 2);
        assert_eq!(solution.shift_points[0].to_gear, 3);
        assert_eq!(
            solution.traces.iter().map(|t| t.gear).collect::<Vec<_>>(),
            vec![2, 3]
        );

        // no ratio for second gear: first and third are not a shift
        let with_gap = GearRatios::from([(1, 3.2), (3, 2.0), (4, 1.6)]);
        let solution = solve_shift_points(&curve, &with_gap, 1.0, 0.35);
        assert_eq!(solution.shift_points.len(), 1);
        assert_eq!(solution.shift_points[0].from_gear, 3);
        assert_eq!(solution.shift_points[0].to_gear, 4);
    }

    #[test]
    fn test_profile_without_first_gear_keeps_gear_numbers() {
        let params = VehicleClass::Generic.params();
        let torque = |rpm: f64| 400. - 0.00002 * (rpm - 6000.).powi(2);
        // km/h per rev/min, first gear too sparse to be detected
        let profile_ratios = [(2, 0.02), (3, 0.026)];

        let mut samples = Vec::new();
        for (gear, speed_ratio) in profile_ratios {
            let drivetrain_ratio = 0.12 / speed_ratio;
            for i in 0..=100 {
                let engine_rpm = 3000. + i as f64 * 50.;
                let accel =
                    torque(engine_rpm) * drivetrain_ratio / (params.wheel_radius_m * params.mass_kg);
                samples.push(Sample {
                    elapsed_s: samples.len() as f64 * 0.02,
                    gear,
                    engine_rpm,
                    torque_proxy: accel * TORQUE_PROXY_SCALE,
                    speed_kmh: engine_rpm * speed_ratio,
                    throttle: 1.,
                    ..Default::default()
                });
            }
        }
        samples.extend((0..10).map(|i| Sample {
            elapsed_s: 10. + i as f64 * 0.02,
            gear: 1,
            engine_rpm: 7000.,
            torque_proxy: 15000.,
            speed_kmh: 87.5,
            throttle: 1.,
            ..Default::default()
        }));

        let session = SessionInfo {
            vehicle_name: "Car".to_string(),
            ..Default::default()
        };
        let mut store = MemoryRunStore::new();
        let run_id = store.insert_run(&session, RunKind::Drag, samples);
        store
            .save_gear_ratios(&GearRatioProfile {
                vehicle_name: "Car".to_string(),
                ratios: GearRatios::from(profile_ratios),
            })
            .unwrap();

        let analysis = analyze_shift_points(&mut store, run_id, None, 3.5, &params).unwrap();
        let peak = analysis
            .torque_curve
            .points
            .iter()
            .max_by(|a, b| a.torque_nm.total_cmp(&b.torque_nm))
            .unwrap();
        assert_abs_diff_eq!(peak.torque_nm, 400., epsilon = 1.);
        assert_abs_diff_eq!(peak.engine_rpm, 6000., epsilon = 50.);

        let shift_points = &analysis.solution.shift_points;
        assert_eq!(shift_points.len(), 1);
        assert_eq!((shift_points[0].from_gear, shift_points[0].to_gear), (2, 3));
        let stored = store.load_shift_profile(run_id).unwrap().unwrap();
        assert_eq!(&stored.shift_points, shift_points);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_no_crossing_means_limiter(
            peak in 300.0..800.0f64,
            slope in 0.001..0.015f64,
            first in 2.0..4.0f64,
            step in 1.1..1.6f64,
        ) {
            let curve = curve_from(|rpm| peak - slope * rpm, 2000., 8500.);
            let ratios = [first, first / step];
            // decreasing torque: the lower gear wins at every engine speed
            let solution = solve_shift_points(&curve, &ratios_by_gear(&ratios), 1.0, 0.34);
            prop_assert_eq!(solution.shift_points[0].shift_rpm, 8500.);
        }
    }
}

// Head-to-head comparison of two runs aligned at a common sync speed.

use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_SYNC_SPEED_KMH, DEFAULT_VIRTUAL_SHIFT_DELAY_S};
use crate::errors::ShiftlabError;
use crate::storage::{RunId, RunStore};
use crate::telemetry::Sample;

use super::cleaner::analyze_run_quality;
use super::interpolate::LinearInterpolant;
use super::sectors::{SectorComparison, compare_sectors};
use super::virtual_run::synthesize_virtual_run;
use super::{mean, quantile};

const SHIFT_WINDOW_S: f64 = 0.4;
const FULL_THROTTLE: f64 = 0.9;
const REFERENCE_TORQUE_QUANTILE: f64 = 0.8;
const DEFAULT_REFERENCE_TORQUE: f64 = 2000.0;
/// Torque below this share of the reference counts as power interruption
const INTERRUPTION_FRACTION: f64 = 0.4;
/// Each run needs more samples than this inside the common time span
const MIN_DELTA_SAMPLES: usize = 5;
pub const TIE_TOLERANCE_M: f64 = 1e-6;
pub const HIGH_INTERVAL_KMH: (f64, f64) = (100.0, 250.0);

/// Shift a run so that elapsed time is 0 at the first sample reaching
/// `sync_speed_kmh`, dropping everything before it.
///
/// A run that never reaches the sync speed is returned unchanged.
pub fn synchronize(samples: &[Sample], sync_speed_kmh: f64) -> Vec<Sample> {
    let Some(t0) = samples
        .iter()
        .find(|s| s.speed_kmh >= sync_speed_kmh)
        .map(|s| s.elapsed_s)
    else {
        debug!("Run never reaches {} km/h, not synchronized", sync_speed_kmh);
        return samples.to_vec();
    };
    samples
        .iter()
        .filter(|s| s.elapsed_s >= t0)
        .map(|s| Sample {
            elapsed_s: s.elapsed_s - t0,
            ..s.clone()
        })
        .collect()
}

fn first_reaching(samples: &[Sample], speed_kmh: f64) -> Option<&Sample> {
    samples.iter().find(|s| s.speed_kmh >= speed_kmh)
}

/// Seconds from the first sample until `target_kmh` is reached
pub fn time_to_speed(samples: &[Sample], target_kmh: f64) -> Option<f64> {
    let start = samples.first()?;
    first_reaching(samples, target_kmh).map(|s| s.elapsed_s - start.elapsed_s)
}

/// Seconds between first reaching `from_kmh` and first reaching `to_kmh`
pub fn interval(samples: &[Sample], from_kmh: f64, to_kmh: f64) -> Option<f64> {
    let start = first_reaching(samples, from_kmh)?;
    let end = first_reaching(samples, to_kmh)?;
    Some(end.elapsed_s - start.elapsed_s)
}

pub fn peak_speed(samples: &[Sample]) -> Option<f64> {
    samples.iter().map(|s| s.speed_kmh).max_by(f64::total_cmp)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpeedTarget {
    pub target_kmh: f64,
    pub seconds: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IntervalKpis {
    pub time_to_speed: Vec<SpeedTarget>,
    /// 100 to 250 km/h
    pub high_interval_s: Option<f64>,
    pub peak_speed_kmh: Option<f64>,
}

impl IntervalKpis {
    pub fn compute(samples: &[Sample], target_speeds_kmh: &[f64]) -> Self {
        Self {
            time_to_speed: target_speeds_kmh
                .iter()
                .map(|target| SpeedTarget {
                    target_kmh: *target,
                    seconds: time_to_speed(samples, *target),
                })
                .collect(),
            high_interval_s: interval(samples, HIGH_INTERVAL_KMH.0, HIGH_INTERVAL_KMH.1),
            peak_speed_kmh: peak_speed(samples),
        }
    }
}

/// One up-shift with its power interruption
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShiftEvent {
    pub from_gear: i32,
    pub to_gear: i32,
    pub elapsed_s: f64,
    pub latency_ms: f64,
    pub landing_rpm: f64,
}

/// Full-throttle torque level of `gear`, the base of the interruption threshold
fn reference_torque(samples: &[Sample], gear: i32) -> f64 {
    let torque = samples
        .iter()
        .filter(|s| s.gear == gear && s.throttle > FULL_THROTTLE)
        .map(|s| s.torque_proxy)
        .collect_vec();
    match quantile(&torque, REFERENCE_TORQUE_QUANTILE) {
        Some(reference) if reference > 0. => reference,
        _ => DEFAULT_REFERENCE_TORQUE,
    }
}

/// Detect up-shifts and measure how long the torque proxy stays below 40% of
/// the destination gear's full-throttle level within +-0.4 s of each shift.
///
/// The landing engine speed is taken at the first sample after the
/// interruption where torque has recovered, or at the shift sample itself.
pub fn shift_events(samples: &[Sample]) -> Vec<ShiftEvent> {
    samples
        .iter()
        .tuple_windows()
        .filter(|(previous, current)| current.gear > previous.gear)
        .map(|(previous, current)| {
            let shift_time = current.elapsed_s;
            let window = samples
                .iter()
                .filter(|s| (s.elapsed_s - shift_time).abs() <= SHIFT_WINDOW_S)
                .collect_vec();
            let threshold = reference_torque(samples, current.gear) * INTERRUPTION_FRACTION;

            let dip_times = window
                .iter()
                .filter(|s| s.torque_proxy < threshold)
                .map(|s| s.elapsed_s)
                .collect_vec();
            let (latency_ms, landing_rpm) = match dip_times.iter().copied().minmax().into_option() {
                Some((dip_start, dip_end)) => {
                    let landing_rpm = window
                        .iter()
                        .find(|s| s.elapsed_s > dip_end && s.torque_proxy >= threshold)
                        .map_or(current.engine_rpm, |s| s.engine_rpm);
                    ((dip_end - dip_start) * 1000., landing_rpm)
                }
                None => (0., current.engine_rpm),
            };

            ShiftEvent {
                from_gear: previous.gear,
                to_gear: current.gear,
                elapsed_s: shift_time,
                latency_ms,
                landing_rpm,
            }
        })
        .collect()
}

/// Distance covered since the first sample, integrated from speed and the
/// time step to the previous sample.
pub fn cumulative_distance(samples: &[Sample]) -> Vec<f64> {
    let mut previous_time = samples.first().map_or(0., |s| s.elapsed_s);
    samples
        .iter()
        .scan(0., |distance, s| {
            *distance += s.speed_kmh / 3.6 * (s.elapsed_s - previous_time);
            previous_time = s.elapsed_s;
            Some(*distance)
        })
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeltaPoint {
    pub elapsed_s: f64,
    /// Positive when A is ahead
    pub distance_delta_m: f64,
    /// A minus B
    pub speed_delta_kmh: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Verdict {
    AheadA { metres: f64 },
    AheadB { metres: f64 },
    Tie,
}

impl Verdict {
    pub fn from_gap(gap_m: f64) -> Self {
        if gap_m > TIE_TOLERANCE_M {
            Verdict::AheadA { metres: gap_m }
        } else if gap_m < -TIE_TOLERANCE_M {
            Verdict::AheadB { metres: -gap_m }
        } else {
            Verdict::Tie
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DistanceDelta {
    pub points: Vec<DeltaPoint>,
    pub final_gap_m: f64,
    pub verdict: Verdict,
}

/// Interpolant over a run's timestamps; later samples with a repeated timestamp are skipped
fn interpolant_over_time(samples: &[Sample], values: &[f64]) -> Option<LinearInterpolant> {
    let mut knots = samples
        .iter()
        .map(|s| s.elapsed_s)
        .zip(values.iter().copied())
        .collect_vec();
    knots.dedup_by(|current, previous| current.0 <= previous.0);
    let (xs, ys) = knots.into_iter().unzip();
    LinearInterpolant::new(xs, ys)
}

/// Gap between two synchronized runs over their common time span.
///
/// B's distance and speed are interpolated linearly onto A's timestamps.
pub fn distance_delta(a: &[Sample], b: &[Sample]) -> Result<DistanceDelta, ShiftlabError> {
    let (Some(last_a), Some(last_b)) = (a.last(), b.last()) else {
        return Err(ShiftlabError::InsufficientData {
            reason: "empty run in distance comparison".to_string(),
        });
    };
    let end = last_a.elapsed_s.min(last_b.elapsed_s);
    let a_len = a.iter().take_while(|s| s.elapsed_s <= end).count();
    let b_len = b.iter().take_while(|s| s.elapsed_s <= end).count();
    if a_len <= MIN_DELTA_SAMPLES || b_len <= MIN_DELTA_SAMPLES {
        return Err(ShiftlabError::InsufficientData {
            reason: format!(
                "{} and {} samples in the common time span, need more than {}",
                a_len, b_len, MIN_DELTA_SAMPLES
            ),
        });
    }
    let (a, b) = (&a[..a_len], &b[..b_len]);

    let distance_a = cumulative_distance(a);
    let distance_b = cumulative_distance(b);
    let speed_b = b.iter().map(|s| s.speed_kmh).collect_vec();
    let (Some(b_distance_at), Some(b_speed_at)) = (
        interpolant_over_time(b, &distance_b),
        interpolant_over_time(b, &speed_b),
    ) else {
        return Err(ShiftlabError::InsufficientData {
            reason: "run B spans no time".to_string(),
        });
    };

    let points = a
        .iter()
        .zip(&distance_a)
        .map(|(s, distance)| DeltaPoint {
            elapsed_s: s.elapsed_s,
            distance_delta_m: distance - b_distance_at.eval(s.elapsed_s),
            speed_delta_kmh: s.speed_kmh - b_speed_at.eval(s.elapsed_s),
        })
        .collect_vec();
    let final_gap_m = points.last().map_or(0., |p| p.distance_delta_m);

    Ok(DistanceDelta {
        points,
        final_gap_m,
        verdict: Verdict::from_gap(final_gap_m),
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GearAcceleration {
    pub gear: i32,
    pub mean_accel_mps2: f64,
}

/// Mean full-throttle acceleration per forward gear
pub fn gear_acceleration(samples: &[Sample]) -> Vec<GearAcceleration> {
    samples
        .iter()
        .filter(|s| s.gear >= 1 && s.throttle > FULL_THROTTLE && s.torque_proxy > 0.)
        .map(|s| (s.gear, s.acceleration_mps2()))
        .into_group_map()
        .into_iter()
        .filter_map(|(gear, accels)| {
            mean(&accels).map(|mean_accel_mps2| GearAcceleration {
                gear,
                mean_accel_mps2,
            })
        })
        .sorted_by_key(|g| g.gear)
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompareOptions {
    pub sync_speed_kmh: f64,
    pub target_speeds_kmh: Vec<f64>,
    /// Compare virtual best runs instead of the recorded ones
    pub virtual_run: bool,
    pub virtual_shift_delay_s: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            sync_speed_kmh: DEFAULT_SYNC_SPEED_KMH,
            target_speeds_kmh: vec![100., 200., 300.],
            virtual_run: false,
            virtual_shift_delay_s: DEFAULT_VIRTUAL_SHIFT_DELAY_S,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub vehicle_name: String,
    pub kpis: IntervalKpis,
    pub shifts: Vec<ShiftEvent>,
    pub gear_acceleration: Vec<GearAcceleration>,
}

impl RunSummary {
    fn new(run_id: RunId, vehicle_name: String, samples: &[Sample], options: &CompareOptions) -> Self {
        Self {
            run_id,
            vehicle_name,
            kpis: IntervalKpis::compute(samples, &options.target_speeds_kmh),
            shifts: shift_events(samples),
            gear_acceleration: gear_acceleration(samples),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    pub options: CompareOptions,
    pub a: RunSummary,
    pub b: RunSummary,
    pub delta: DistanceDelta,
    pub sectors: Vec<SectorComparison>,
}

/// Synchronize, optionally idealize, and compare two stored runs.
///
/// Interval KPIs and the distance delta start from the recorded samples so
/// the launch up to the sync speed is still there to be cut. Sector KPIs use
/// the cleaned recorded samples, also in virtual mode.
pub fn compare_runs<R: RunStore + ?Sized>(
    store: &R,
    run_a: RunId,
    run_b: RunId,
    options: &CompareOptions,
) -> Result<Comparison, ShiftlabError> {
    let prepare = |run_id: RunId| -> Result<(String, Vec<Sample>, Vec<Sample>), ShiftlabError> {
        let run = store.require_run(run_id)?;
        let compared = if options.virtual_run {
            synthesize_virtual_run(&run.samples, options.virtual_shift_delay_s)
        } else {
            run.samples.clone()
        };
        Ok((
            run.header.vehicle_name,
            analyze_run_quality(&run.samples).cleaned,
            synchronize(&compared, options.sync_speed_kmh),
        ))
    };
    let (vehicle_a, cleaned_a, samples_a) = prepare(run_a)?;
    let (vehicle_b, cleaned_b, samples_b) = prepare(run_b)?;

    let delta = distance_delta(&samples_a, &samples_b)?;
    info!(
        "Compared run {} with run {}: {:?}",
        run_a, run_b, delta.verdict
    );

    Ok(Comparison {
        options: options.clone(),
        a: RunSummary::new(run_a, vehicle_a, &samples_a, options),
        b: RunSummary::new(run_b, vehicle_b, &samples_b, options),
        delta,
        sectors: compare_sectors(&cleaned_a, &cleaned_b),
    })
}

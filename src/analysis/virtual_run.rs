// Virtual best run: replay a run from its own acceleration envelope.

use itertools::Itertools;
use log::debug;

use crate::telemetry::{Sample, TORQUE_PROXY_SCALE};

use super::interpolate::LinearInterpolant;
use super::{arange, quantile};

const ENVELOPE_QUANTILE: f64 = 0.95;
const MIN_ENVELOPE_BINS: usize = 5;
/// Integration never divides by less than this acceleration (m/s^2)
pub const MIN_ACCELERATION_MPS2: f64 = 0.05;
pub const SPEED_STEP_KMH: f64 = 0.1;

/// Time needed to gain one speed step at `accel_mps2`, floored acceleration included
pub fn integration_step(accel_mps2: f64) -> f64 {
    let accel = if accel_mps2.is_finite() {
        accel_mps2.max(MIN_ACCELERATION_MPS2)
    } else {
        MIN_ACCELERATION_MPS2
    };
    (SPEED_STEP_KMH / 3.6) / accel
}

/// 95th percentile torque proxy per 1 km/h bin, gaps between bins filled linearly
fn acceleration_envelope(valid: &[&Sample]) -> Option<LinearInterpolant> {
    let bins = valid
        .iter()
        .map(|s| (s.speed_kmh.round() as i64, s.torque_proxy))
        .into_group_map()
        .into_iter()
        .filter_map(|(bin, torque)| quantile(&torque, ENVELOPE_QUANTILE).map(|t| (bin, t)))
        .sorted_by_key(|(bin, _)| *bin)
        .collect_vec();
    if bins.len() < MIN_ENVELOPE_BINS {
        debug!("Only {} speed bins, no virtual run", bins.len());
        return None;
    }

    let known = LinearInterpolant::new(
        bins.iter().map(|(bin, _)| *bin as f64).collect(),
        bins.iter().map(|(_, torque)| *torque).collect(),
    )?;
    let (first, last) = (bins[0].0, bins[bins.len() - 1].0);
    let speeds = (first..=last).map(|bin| bin as f64).collect_vec();
    let accels = speeds
        .iter()
        .map(|v| (known.eval(*v) / TORQUE_PROXY_SCALE).max(MIN_ACCELERATION_MPS2))
        .collect();
    LinearInterpolant::new(speeds, accels)
}

/// Synthesize an idealized run from the samples' own acceleration envelope.
///
/// Time is integrated in 0.1 km/h steps from the first sample's speed up to
/// the run's peak speed. Every up-shift of the original run is replayed at
/// its original road speed with a fixed `shift_delay_s` instead of the real
/// shift duration. Runs with fewer than five speed bins of positive torque
/// come back unchanged.
///
/// Synthesized samples carry the elapsed time, speed, replayed gear and the
/// envelope acceleration as torque proxy at full throttle.
pub fn synthesize_virtual_run(samples: &[Sample], shift_delay_s: f64) -> Vec<Sample> {
    let valid = samples.iter().filter(|s| s.torque_proxy > 0.).collect_vec();
    let (Some(first), Some(first_valid)) = (samples.first(), valid.first()) else {
        return samples.to_vec();
    };
    let Some(envelope) = acceleration_envelope(&valid) else {
        return samples.to_vec();
    };

    let start_speed = first.speed_kmh.max(0.);
    let max_speed = samples.iter().map(|s| s.speed_kmh).fold(f64::MIN, f64::max);

    let mut shifts = Vec::new();
    let mut last_gear = first_valid.gear;
    for sample in &valid[1..] {
        if sample.gear > last_gear {
            shifts.push((sample.speed_kmh, sample.gear));
            last_gear = sample.gear;
        }
    }

    let mut gear = first_valid.gear;
    let mut applied = 0;
    for (speed, to_gear) in &shifts {
        if *speed < start_speed {
            gear = *to_gear;
            applied += 1;
        }
    }

    let mut elapsed_s = first.elapsed_s;
    let virtual_run = arange(start_speed, max_speed, SPEED_STEP_KMH)
        .into_iter()
        .map(|speed_kmh| {
            let accel = envelope.eval(speed_kmh).max(MIN_ACCELERATION_MPS2);
            while applied < shifts.len() && speed_kmh >= shifts[applied].0 {
                elapsed_s += shift_delay_s;
                gear = shifts[applied].1;
                applied += 1;
            }
            elapsed_s += integration_step(accel);
            Sample {
                elapsed_s,
                gear,
                torque_proxy: accel * TORQUE_PROXY_SCALE,
                speed_kmh,
                throttle: 1.,
                ..Default::default()
            }
        })
        .collect_vec();

    debug!(
        "Virtual run: {} samples, {} shifts, {:.2}s",
        virtual_run.len(),
        shifts.len(),
        elapsed_s - first.elapsed_s
    );
    virtual_run
}

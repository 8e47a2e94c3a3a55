// Engine torque curve reconstructed from full-throttle acceleration.

use std::collections::BTreeMap;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::VehicleParams;
use crate::errors::ShiftlabError;
use crate::storage::GearRatios;
use crate::telemetry::Sample;

use super::{arange, quantile};

const FULL_THROTTLE: f64 = 0.95;
const MIN_ENGINE_RPM: f64 = 2000.0;
pub const RPM_BUCKET: f64 = 50.0;
const ENVELOPE_QUANTILE: f64 = 0.95;
/// At least this many buckets are needed before the curve is smoothed
const MIN_FIT_BUCKETS: usize = 4;
const FIT_DEGREE: usize = 3;
const EXTRAPOLATE_BELOW_RPM: f64 = 1000.0;
const EXTRAPOLATE_ABOVE_RPM: f64 = 500.0;
/// Fewer points than this cannot drive the shift solver
pub const MIN_CURVE_POINTS: usize = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TorquePoint {
    pub engine_rpm: f64,
    pub torque_nm: f64,
}

/// Engine torque against engine speed, ordered by engine speed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TorqueCurve {
    pub points: Vec<TorquePoint>,
    /// Whether the points come from the polynomial fit rather than the raw envelope
    pub smoothed: bool,
}

impl TorqueCurve {
    pub fn min_rpm(&self) -> Option<f64> {
        self.points.first().map(|p| p.engine_rpm)
    }

    /// The highest engine speed on the curve, used as the limiter
    pub fn max_rpm(&self) -> Option<f64> {
        self.points.last().map(|p| p.engine_rpm)
    }
}

/// Least-squares polynomial over normalized abscissae, so that engine speeds
/// in the thousands do not make the Vandermonde matrix ill-conditioned.
#[derive(Clone, Debug)]
pub struct Polynomial {
    /// Coefficients by ascending power of the normalized variable
    coefficients: Vec<f64>,
    center: f64,
    scale: f64,
}

impl Polynomial {
    pub fn fit(xs: &[f64], ys: &[f64], degree: usize) -> Option<Self> {
        if xs.len() != ys.len() || xs.len() <= degree {
            return None;
        }
        let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let center = (min + max) / 2.;
        let scale = ((max - min) / 2.).max(f64::EPSILON);

        let columns = degree + 1;
        let vandermonde = DMatrix::from_fn(xs.len(), columns, |row, col| {
            ((xs[row] - center) / scale).powi(col as i32)
        });
        let targets = DVector::from_column_slice(ys);
        let coefficients = vandermonde
            .svd(true, true)
            .solve(&targets, 1e-12)
            .ok()?
            .iter()
            .copied()
            .collect();
        Some(Self {
            coefficients,
            center,
            scale,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = (x - self.center) / self.scale;
        self.coefficients
            .iter()
            .rev()
            .fold(0., |acc, coefficient| acc * t + coefficient)
    }
}

/// Ratio used for a sample in `gear`.
///
/// Gears above the highest known one reuse its ratio; a gear missing below
/// that has no usable ratio.
fn ratio_for_gear(gear_ratios: &GearRatios, gear: i32) -> Option<f64> {
    match gear_ratios.get(&gear) {
        Some(ratio) => Some(*ratio),
        None => gear_ratios
            .last_key_value()
            .filter(|(top_gear, _)| gear > **top_gear)
            .map(|(_, ratio)| *ratio),
    }
}

/// Per-sample engine torque estimates as (engine speed, torque) pairs.
///
/// Net wheel force is mass times acceleration; no drag correction is
/// applied, the high quantile over gears already favours the low-drag estimate.
pub fn engine_torque_estimates(
    samples: &[Sample],
    gear_ratios: &GearRatios,
    final_drive: f64,
    params: &VehicleParams,
) -> Vec<(f64, f64)> {
    samples
        .iter()
        .filter(|s| {
            s.throttle > FULL_THROTTLE
                && s.engine_rpm > MIN_ENGINE_RPM
                && s.torque_proxy > 0.
                && s.gear >= 1
        })
        .filter_map(|s| {
            let ratio = ratio_for_gear(gear_ratios, s.gear)?;
            let wheel_force = params.mass_kg * s.acceleration_mps2();
            let wheel_torque = wheel_force * params.wheel_radius_m;
            Some((s.engine_rpm, wheel_torque / (ratio * final_drive)))
        })
        .collect()
}

/// 95th percentile of torque per 50 rev/min bucket, keyed by bucket center.
fn bucket_envelope(estimates: &[(f64, f64)]) -> Vec<TorquePoint> {
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for (rpm, torque) in estimates {
        let bucket = (rpm / RPM_BUCKET).round() as i64;
        buckets.entry(bucket).or_default().push(*torque);
    }
    buckets
        .into_iter()
        .filter_map(|(bucket, torques)| {
            quantile(&torques, ENVELOPE_QUANTILE).map(|torque_nm| TorquePoint {
                engine_rpm: bucket as f64 * RPM_BUCKET,
                torque_nm,
            })
        })
        .collect()
}

/// Reconstruct the engine torque curve of one run.
///
/// With at least four buckets the envelope is smoothed by a cubic fit and
/// resampled every 50 rev/min from `max(2000, min - 1000)` to `max + 500`.
///
/// # Errors
///
/// `InsufficientData` when no ratios are known or the resulting curve has
/// fewer than [`MIN_CURVE_POINTS`] points.
pub fn reconstruct_torque_curve(
    samples: &[Sample],
    gear_ratios: &GearRatios,
    final_drive: f64,
    params: &VehicleParams,
) -> Result<TorqueCurve, ShiftlabError> {
    if gear_ratios.is_empty() || final_drive <= 0. {
        return Err(ShiftlabError::InsufficientData {
            reason: "no gear ratios available".to_string(),
        });
    }

    let estimates = engine_torque_estimates(samples, gear_ratios, final_drive, params);
    let envelope = bucket_envelope(&estimates);
    debug!(
        "{} full-throttle samples in {} buckets",
        estimates.len(),
        envelope.len()
    );

    let curve = if envelope.len() >= MIN_FIT_BUCKETS {
        smooth_envelope(&envelope).unwrap_or(TorqueCurve {
            points: envelope,
            smoothed: false,
        })
    } else {
        TorqueCurve {
            points: envelope,
            smoothed: false,
        }
    };

    if curve.points.len() < MIN_CURVE_POINTS {
        return Err(ShiftlabError::InsufficientData {
            reason: format!(
                "torque curve has {} points, {} needed",
                curve.points.len(),
                MIN_CURVE_POINTS
            ),
        });
    }
    info!(
        "Torque curve with {} points from {:.0} to {:.0} rev/min",
        curve.points.len(),
        curve.min_rpm().unwrap_or_default(),
        curve.max_rpm().unwrap_or_default()
    );
    Ok(curve)
}

fn smooth_envelope(envelope: &[TorquePoint]) -> Option<TorqueCurve> {
    let xs: Vec<f64> = envelope.iter().map(|p| p.engine_rpm).collect();
    let ys: Vec<f64> = envelope.iter().map(|p| p.torque_nm).collect();
    let polynomial = Polynomial::fit(&xs, &ys, FIT_DEGREE)?;

    let observed_min = xs.first()?;
    let observed_max = xs.last()?;
    let start = MIN_ENGINE_RPM.max(observed_min - EXTRAPOLATE_BELOW_RPM);
    let points = arange(start, observed_max + EXTRAPOLATE_ABOVE_RPM, RPM_BUCKET)
        .into_iter()
        .map(|engine_rpm| TorquePoint {
            engine_rpm,
            torque_nm: polynomial.eval(engine_rpm),
        })
        .collect();
    Some(TorqueCurve {
        points,
        smoothed: true,
    })
}

// Run cleaning and the handling stability score.

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use simple_moving_average::{SMA, SumTreeSMA};

use crate::telemetry::{GRAVITY_MPS2, Sample};

use super::mean;

const LAUNCH_MIN_SPEED_KMH: f64 = 60.0;
const LAUNCH_MIN_THROTTLE: f64 = 0.8;
const WIND_DOWN_MAX_SPEED_KMH: f64 = 10.0;
/// Fewer samples than this after trimming means the trim is discarded
pub const MIN_TRIMMED_SAMPLES: usize = 10;
/// Runs shorter than this are not scored at all
pub const MIN_SCORABLE_SAMPLES: usize = 2;
pub const NEUTRAL_SCORE: f64 = 50.0;

pub const SMOOTHING_WINDOW: usize = 10;
/// Smoothed accelerations above this are physically implausible (impact, teleport)
pub const MAX_SAFE_G: f64 = 4.0;

const CORNER_MIN_LAT_G: f64 = 0.5;
const HARD_CORNER_MIN_LAT_G: f64 = 0.8;
const STEERING_NOISE_WEIGHT: f64 = 1000.0;
const YAW_RATE_MIN_SPEED_KMH: f64 = 10.0;

const COUNTER_STEER_MIN_STEERING: f64 = 0.05;
const RECOVERY_WINDOW_S: f64 = 2.0;
const SPIN_MIN_YAW_RATE: f64 = 2.0;
const SPIN_SPEED_RATIO: f64 = 0.7;
const SPIN_MAX_BRAKE: f64 = 0.2;
const UNRECOVERABLE_PENALTY: f64 = 10.0;
const RECOVERY_BONUS: f64 = 2.0;
const MAX_RECOVERY_BONUS: f64 = 15.0;

const ROTATION_MIN_YAW_RATE: f64 = 2.5;
const ROTATION_MIN_SPEED_DROP_KMH: f64 = 10.0;
const ROTATION_SAMPLES_PER_SPIN: usize = 10;
const SPIN_PENALTY: f64 = 5.0;

const YAW_ACCEL_LIMIT: f64 = 5.0;
const YAW_ACCEL_PENALTY_RATE: f64 = 2.0;
const MAX_YAW_ACCEL_PENALTY: f64 = 15.0;

const OVER_REV_RPM: f64 = 9000.0;
const OVER_REV_MAX_SAMPLES: usize = 10;
const OVER_REV_PENALTY: f64 = 10.0;

const STABILITY_WEIGHT: f64 = 0.6;
const CONFIDENCE_WEIGHT: f64 = 0.4;

/// Result of cleaning and scoring one run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunQuality {
    pub cleaned: Vec<Sample>,
    /// Composite stability index in [0, 100]
    pub score: f64,
    pub crash_detected: bool,
    /// False when the run was too short to be scored and `score` is the neutral default
    pub sufficient_data: bool,
    pub stability: f64,
    pub confidence: f64,
    pub recovered_corrections: usize,
    pub unrecoverable_events: usize,
    pub spin_count: usize,
    pub peak_yaw_accel: f64,
    pub over_rev_samples: usize,
    /// Peak smoothed lateral g after clipping
    pub max_lateral_g: Option<f64>,
    /// Peak smoothed deceleration in g after clipping
    pub max_braking_g: Option<f64>,
}

impl RunQuality {
    fn neutral(cleaned: Vec<Sample>) -> Self {
        Self {
            cleaned,
            score: NEUTRAL_SCORE,
            crash_detected: false,
            sufficient_data: false,
            stability: NEUTRAL_SCORE,
            confidence: NEUTRAL_SCORE,
            recovered_corrections: 0,
            unrecoverable_events: 0,
            spin_count: 0,
            peak_yaw_accel: 0.,
            over_rev_samples: 0,
            max_lateral_g: None,
            max_braking_g: None,
        }
    }
}

/// Drop the pre-launch and wind-down parts of a run.
///
/// The run starts at the first sample above 60 km/h with more than 80%
/// throttle and ends at (including) the first later sample below 10 km/h.
/// If fewer than [`MIN_TRIMMED_SAMPLES`] remain the input is returned as is.
pub fn trim_run(samples: &[Sample]) -> Vec<Sample> {
    let start = samples
        .iter()
        .position(|s| s.speed_kmh > LAUNCH_MIN_SPEED_KMH && s.throttle > LAUNCH_MIN_THROTTLE)
        .unwrap_or(0);
    let launched = &samples[start..];
    let end = launched
        .iter()
        .position(|s| s.speed_kmh < WIND_DOWN_MAX_SPEED_KMH)
        .map_or(launched.len(), |i| i + 1);
    let trimmed = &launched[..end];

    if trimmed.len() < MIN_TRIMMED_SAMPLES {
        debug!(
            "Trim left {} samples, keeping all {}",
            trimmed.len(),
            samples.len()
        );
        return samples.to_vec();
    }
    trimmed.to_vec()
}

/// Trailing mean over the last [`SMOOTHING_WINDOW`] values. The first values
/// average over what is available.
pub fn rolling_mean(values: &[f64]) -> Vec<f64> {
    let mut window = SumTreeSMA::<f64, f64, SMOOTHING_WINDOW>::new();
    values
        .iter()
        .map(|value| {
            window.add_sample(*value);
            window.get_average()
        })
        .collect()
}

/// Yaw rate (rad/s) implied by lateral acceleration at the given road speed.
pub fn yaw_rate(lat_g: f64, speed_kmh: f64) -> f64 {
    if speed_kmh > YAW_RATE_MIN_SPEED_KMH {
        lat_g * GRAVITY_MPS2 / (speed_kmh / 3.6)
    } else {
        0.
    }
}

#[derive(Debug, Default)]
struct HandlingMetrics {
    stability: Option<f64>,
    confidence: Option<f64>,
    peak_yaw_accel: f64,
    recovered_corrections: usize,
    unrecoverable_events: usize,
    rotation_spins: usize,
}

impl HandlingMetrics {
    /// `lat_g` must already be clipped to [`MAX_SAFE_G`]
    fn compute(samples: &[Sample], lat_g: &[f64], steering: &[f64]) -> Self {
        let yaw: Vec<f64> = samples
            .iter()
            .zip(lat_g)
            .map(|(s, g)| yaw_rate(*g, s.speed_kmh))
            .collect();
        let yaw_accel: Vec<Option<f64>> = std::iter::once(None)
            .chain(samples.iter().tuple_windows().zip(yaw.iter().tuple_windows()).map(
                |((prev, cur), (yaw_prev, yaw_cur))| {
                    let dt = cur.elapsed_s - prev.elapsed_s;
                    (dt > 0.).then(|| (yaw_cur - yaw_prev).abs() / dt)
                },
            ))
            .collect();

        let mut metrics = HandlingMetrics::default();

        let corners = (0..samples.len())
            .filter(|i| lat_g[*i].abs() > CORNER_MIN_LAT_G)
            .collect_vec();
        let steering_changes = corners
            .iter()
            .tuple_windows()
            .map(|(a, b)| (steering[*b] - steering[*a]).abs())
            .collect_vec();
        metrics.stability =
            mean(&steering_changes).map(|noise| (100. - noise * STEERING_NOISE_WEIGHT).max(0.));
        metrics.peak_yaw_accel = corners
            .iter()
            .filter_map(|i| yaw_accel[*i])
            .fold(0., f64::max);

        let hard_corner_g = lat_g
            .iter()
            .map(|g| g.abs())
            .filter(|g| *g > HARD_CORNER_MIN_LAT_G)
            .collect_vec();
        let peak_g = hard_corner_g.iter().copied().fold(0., f64::max);
        if peak_g > 0. {
            metrics.confidence = mean(&hard_corner_g).map(|avg| (avg / peak_g * 100.).min(100.));
        }

        let counter_steering = lat_g
            .iter()
            .zip(steering)
            .map(|(g, steer)| {
                g * steer < 0.
                    && g.abs() > CORNER_MIN_LAT_G
                    && steer.abs() > COUNTER_STEER_MIN_STEERING
            })
            .collect_vec();
        let event_starts = (0..samples.len())
            .filter(|i| counter_steering[*i] && (*i == 0 || !counter_steering[*i - 1]))
            .collect_vec();
        for start in event_starts {
            let t0 = samples[start].elapsed_s;
            let window = (start + 1..samples.len())
                .take_while(|i| samples[*i].elapsed_s <= t0 + RECOVERY_WINDOW_S)
                .filter(|i| samples[*i].elapsed_s > t0)
                .collect_vec();
            if window.is_empty() {
                continue;
            }
            let max_yaw = window.iter().map(|i| yaw[*i].abs()).fold(0., f64::max);
            let min_speed = window
                .iter()
                .map(|i| samples[*i].speed_kmh)
                .fold(f64::INFINITY, f64::min);
            let max_brake = window
                .iter()
                .map(|i| samples[*i].brake)
                .fold(f64::NEG_INFINITY, f64::max);
            let lost_speed = min_speed < samples[start].speed_kmh * SPIN_SPEED_RATIO;
            if max_yaw > SPIN_MIN_YAW_RATE || (lost_speed && max_brake < SPIN_MAX_BRAKE) {
                debug!("Unrecoverable slide at {:.2}s", t0);
                metrics.unrecoverable_events += 1;
            } else {
                metrics.recovered_corrections += 1;
            }
        }

        let rotation_samples = (1..samples.len())
            .filter(|i| {
                yaw[*i].abs() > ROTATION_MIN_YAW_RATE
                    && samples[*i].speed_kmh - samples[*i - 1].speed_kmh
                        < -ROTATION_MIN_SPEED_DROP_KMH
            })
            .count();
        metrics.rotation_spins = rotation_samples / ROTATION_SAMPLES_PER_SPIN;

        metrics
    }
}

/// Trim a run, detect crash-like acceleration peaks and compute the
/// composite stability index.
///
/// Runs shorter than [`MIN_SCORABLE_SAMPLES`] come back unchanged with the
/// neutral score. Missing lateral/steering channels leave the sub-scores at
/// their neutral value; trimming and the over-rev penalty still apply.
pub fn analyze_run_quality(samples: &[Sample]) -> RunQuality {
    if samples.len() < MIN_SCORABLE_SAMPLES {
        return RunQuality::neutral(samples.to_vec());
    }

    let cleaned = trim_run(samples);
    let mut quality = RunQuality::neutral(Vec::new());
    quality.sufficient_data = true;

    let lat_g: Option<Vec<f64>> = cleaned.iter().map(|s| s.lat_g).collect();
    let lon_g: Option<Vec<f64>> = cleaned.iter().map(|s| s.lon_g).collect();
    let steering: Option<Vec<f64>> = cleaned.iter().map(|s| s.steering).collect();

    if let (Some(lat), Some(lon)) = (&lat_g, &lon_g) {
        let lat_smooth = rolling_mean(lat);
        let lon_smooth = rolling_mean(lon);
        quality.crash_detected = lat_smooth
            .iter()
            .chain(&lon_smooth)
            .any(|g| g.abs() > MAX_SAFE_G);

        let peak_lat = lat_smooth
            .iter()
            .map(|g| g.abs().min(MAX_SAFE_G))
            .fold(0., f64::max);
        let min_lon = lon_smooth
            .iter()
            .map(|g| g.max(-MAX_SAFE_G))
            .fold(0., f64::min);
        quality.max_lateral_g = (peak_lat > 0.).then_some(peak_lat);
        quality.max_braking_g = (min_lon < 0.).then_some(-min_lon);
    }

    let mut recovery_bonus = 0.;
    let mut unrecoverable_penalty = 0.;
    if let (Some(lat), Some(steering)) = (lat_g, steering) {
        let clipped = lat
            .iter()
            .map(|g| g.clamp(-MAX_SAFE_G, MAX_SAFE_G))
            .collect_vec();
        let handling = HandlingMetrics::compute(&cleaned, &clipped, &steering);
        quality.stability = handling.stability.unwrap_or(NEUTRAL_SCORE);
        quality.confidence = handling.confidence.unwrap_or(NEUTRAL_SCORE);
        quality.peak_yaw_accel = handling.peak_yaw_accel;
        quality.recovered_corrections = handling.recovered_corrections;
        quality.unrecoverable_events = handling.unrecoverable_events;
        quality.spin_count = handling.unrecoverable_events + handling.rotation_spins;
        recovery_bonus = handling.recovered_corrections as f64 * RECOVERY_BONUS;
        unrecoverable_penalty = handling.unrecoverable_events as f64 * UNRECOVERABLE_PENALTY;
    }

    let mut score = STABILITY_WEIGHT * quality.stability + CONFIDENCE_WEIGHT * quality.confidence;
    score += recovery_bonus.min(MAX_RECOVERY_BONUS);
    score -= unrecoverable_penalty;
    score -= quality.spin_count as f64 * SPIN_PENALTY;
    if quality.peak_yaw_accel > YAW_ACCEL_LIMIT {
        score -= ((quality.peak_yaw_accel - YAW_ACCEL_LIMIT) * YAW_ACCEL_PENALTY_RATE)
            .min(MAX_YAW_ACCEL_PENALTY);
    }
    score = score.clamp(0., 100.);

    quality.over_rev_samples = cleaned
        .iter()
        .filter(|s| s.engine_rpm > OVER_REV_RPM)
        .count();
    if quality.over_rev_samples > OVER_REV_MAX_SAMPLES {
        score = (score - OVER_REV_PENALTY).max(0.);
    }

    debug!(
        "Run quality: {} of {} samples kept, score {:.1}, crash {}",
        cleaned.len(),
        samples.len(),
        score,
        quality.crash_detected
    );
    quality.score = score;
    quality.cleaned = cleaned;
    quality
}

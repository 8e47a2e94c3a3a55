// Offline analysis of recorded runs. Every function here works on already
// loaded, time-ordered samples and never touches storage itself.

pub mod cleaner;
pub mod comparison;
pub mod gear_ratios;
pub mod interpolate;
pub mod scoring;
pub mod sectors;
pub mod shift_points;
pub mod torque_curve;
pub mod virtual_run;

use itertools::Itertools;

/// Quantile `q` in [0, 1] with linear interpolation between closest ranks.
/// Returns `None` for an empty input.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted = values.iter().copied().sorted_by(f64::total_cmp).collect_vec();
    let position = q.clamp(0., 1.) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Evenly spaced values from `start` (inclusive) to `stop` (exclusive).
pub(crate) fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step <= 0. || !start.is_finite() || !stop.is_finite() || stop <= start {
        return Vec::new();
    }
    let count = ((stop - start) / step).ceil() as usize;
    (0..count)
        .map(|i| start + i as f64 * step)
        .filter(|v| *v < stop)
        .collect()
}

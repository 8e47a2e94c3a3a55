// Overall performance index: two vehicles rated against the best values of
// every drag and handling run in the store.

use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::ShiftlabError;
use crate::storage::{RunId, RunStore};
use crate::telemetry::{RunKind, Sample};

use super::cleaner::{NEUTRAL_SCORE, analyze_run_quality};
use super::comparison::{peak_speed, time_to_speed};

const LOW_TARGET_KMH: f64 = 100.0;
const HIGH_TARGET_KMH: f64 = 200.0;

/// Weighting of the six categories by track character
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackProfile {
    HighSpeed,
    Technical,
    Endurance,
    #[default]
    Balanced,
}

impl TrackProfile {
    /// Weights of accel low, accel high, top speed, lateral grip, braking and stability
    pub fn weights(&self) -> [f64; 6] {
        match self {
            TrackProfile::HighSpeed => [0.10, 0.20, 0.40, 0.10, 0.10, 0.10],
            TrackProfile::Technical => [0.20, 0.15, 0.10, 0.30, 0.15, 0.10],
            TrackProfile::Endurance => [0.05, 0.10, 0.15, 0.10, 0.10, 0.50],
            TrackProfile::Balanced => [0.15, 0.15, 0.15, 0.20, 0.15, 0.20],
        }
    }
}

impl fmt::Display for TrackProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackProfile::HighSpeed => "high-speed",
            TrackProfile::Technical => "technical",
            TrackProfile::Endurance => "endurance",
            TrackProfile::Balanced => "balanced",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for TrackProfile {
    type Err = ShiftlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "high-speed" => Ok(TrackProfile::HighSpeed),
            "technical" => Ok(TrackProfile::Technical),
            "endurance" => Ok(TrackProfile::Endurance),
            "balanced" => Ok(TrackProfile::Balanced),
            _ => Err(ShiftlabError::InvalidUserInput {
                field: "track".to_string(),
                reason: format!(
                    "'{}' is not one of high-speed, technical, endurance, balanced",
                    s
                ),
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct DragMetrics {
    pub time_to_100_s: Option<f64>,
    pub time_to_200_s: Option<f64>,
    pub peak_speed_kmh: Option<f64>,
}

impl DragMetrics {
    /// Acceleration times are measured from the first cleaned sample
    pub fn from_samples(samples: &[Sample]) -> Self {
        let cleaned = analyze_run_quality(samples).cleaned;
        Self {
            time_to_100_s: time_to_speed(&cleaned, LOW_TARGET_KMH),
            time_to_200_s: time_to_speed(&cleaned, HIGH_TARGET_KMH),
            peak_speed_kmh: peak_speed(&cleaned),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HandlingMetrics {
    pub max_lateral_g: Option<f64>,
    pub max_braking_g: Option<f64>,
    pub stability_index: f64,
    pub crash_detected: bool,
}

impl Default for HandlingMetrics {
    fn default() -> Self {
        Self {
            max_lateral_g: None,
            max_braking_g: None,
            stability_index: NEUTRAL_SCORE,
            crash_detected: false,
        }
    }
}

impl HandlingMetrics {
    pub fn from_samples(samples: &[Sample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let quality = analyze_run_quality(samples);
        Self {
            max_lateral_g: quality.max_lateral_g,
            max_braking_g: quality.max_braking_g,
            stability_index: quality.score,
            crash_detected: quality.crash_detected,
        }
    }
}

/// Best value of every category over all stored drag and handling runs
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalBests {
    pub time_to_100_s: Option<f64>,
    pub time_to_200_s: Option<f64>,
    pub peak_speed_kmh: Option<f64>,
    pub max_lateral_g: Option<f64>,
    pub max_braking_g: Option<f64>,
}

fn better(current: Option<f64>, candidate: Option<f64>, lower_is_better: bool) -> Option<f64> {
    match (current, candidate.filter(|v| *v > 0.)) {
        (None, candidate) => candidate,
        (Some(current), Some(candidate)) if lower_is_better => Some(current.min(candidate)),
        (Some(current), Some(candidate)) => Some(current.max(candidate)),
        (current, None) => current,
    }
}

impl GlobalBests {
    pub fn add_drag(&mut self, metrics: &DragMetrics) {
        self.time_to_100_s = better(self.time_to_100_s, metrics.time_to_100_s, true);
        self.time_to_200_s = better(self.time_to_200_s, metrics.time_to_200_s, true);
        self.peak_speed_kmh = better(self.peak_speed_kmh, metrics.peak_speed_kmh, false);
    }

    pub fn add_handling(&mut self, metrics: &HandlingMetrics) {
        self.max_lateral_g = better(self.max_lateral_g, metrics.max_lateral_g, false);
        self.max_braking_g = better(self.max_braking_g, metrics.max_braking_g, false);
    }

    /// Scan the store. Runs that fail to load are skipped.
    pub fn from_store<R: RunStore + ?Sized>(store: &R) -> Result<Self, ShiftlabError> {
        let mut bests = Self::default();
        for header in store.list_runs()? {
            let run = match store.load_run(header.id) {
                Ok(Some(run)) => run,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping run {} in best-value scan: {}", header.id, e);
                    continue;
                }
            };
            match header.run_kind {
                RunKind::Drag => bests.add_drag(&DragMetrics::from_samples(&run.samples)),
                RunKind::Handling => {
                    bests.add_handling(&HandlingMetrics::from_samples(&run.samples))
                }
                RunKind::QuickA | RunKind::QuickB => {}
            }
        }
        Ok(bests)
    }
}

/// Share of the best value in percent, 0 when either is missing
pub fn lower_is_better_score(value: Option<f64>, best: Option<f64>) -> f64 {
    match (value, best) {
        (Some(value), Some(best)) if value > 0. => best / value * 100.,
        _ => 0.,
    }
}

pub fn higher_is_better_score(value: Option<f64>, best: Option<f64>) -> f64 {
    match (value, best) {
        (Some(value), Some(best)) if best > 0. => value / best * 100.,
        _ => 0.,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CategoryScores {
    pub accel_low: f64,
    pub accel_high: f64,
    pub top_speed: f64,
    pub lateral_grip: f64,
    pub braking: f64,
    pub stability: f64,
}

impl CategoryScores {
    pub fn rate(drag: &DragMetrics, handling: &HandlingMetrics, bests: &GlobalBests) -> Self {
        Self {
            accel_low: lower_is_better_score(drag.time_to_100_s, bests.time_to_100_s),
            accel_high: lower_is_better_score(drag.time_to_200_s, bests.time_to_200_s),
            top_speed: higher_is_better_score(drag.peak_speed_kmh, bests.peak_speed_kmh),
            lateral_grip: higher_is_better_score(handling.max_lateral_g, bests.max_lateral_g),
            braking: higher_is_better_score(handling.max_braking_g, bests.max_braking_g),
            stability: handling.stability_index,
        }
    }

    fn as_array(&self) -> [f64; 6] {
        [
            self.accel_low,
            self.accel_high,
            self.top_speed,
            self.lateral_grip,
            self.braking,
            self.stability,
        ]
    }

    pub fn weighted(&self, profile: TrackProfile) -> f64 {
        self.as_array()
            .iter()
            .zip(profile.weights())
            .map(|(score, weight)| score * weight)
            .sum()
    }
}

/// The drag and handling run representing one vehicle
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunPair {
    pub drag: RunId,
    pub handling: RunId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VehicleScore {
    pub runs: RunPair,
    pub vehicle_name: String,
    pub drag: DragMetrics,
    pub handling: HandlingMetrics,
    pub categories: CategoryScores,
    pub overall: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PerformanceIndex {
    pub track_profile: TrackProfile,
    pub bests: GlobalBests,
    pub a: VehicleScore,
    pub b: VehicleScore,
    /// Categories without data for at least one vehicle, scored as 0
    pub missing: Vec<String>,
}

fn vehicle_score<R: RunStore + ?Sized>(
    store: &R,
    runs: RunPair,
    bests: &GlobalBests,
    profile: TrackProfile,
) -> Result<VehicleScore, ShiftlabError> {
    let drag_run = store.require_run(runs.drag)?;
    let handling_run = store.require_run(runs.handling)?;
    let drag = DragMetrics::from_samples(&drag_run.samples);
    let handling = HandlingMetrics::from_samples(&handling_run.samples);
    if handling.crash_detected {
        warn!(
            "Crash detected in handling run {}, peaks were clipped",
            runs.handling
        );
    }

    let vehicle_name = if drag_run.header.vehicle_name == handling_run.header.vehicle_name {
        drag_run.header.vehicle_name
    } else {
        format!(
            "{} / {}",
            drag_run.header.vehicle_name, handling_run.header.vehicle_name
        )
    };
    let categories = CategoryScores::rate(&drag, &handling, bests);
    Ok(VehicleScore {
        runs,
        vehicle_name,
        overall: categories.weighted(profile),
        drag,
        handling,
        categories,
    })
}

/// Rate two vehicles head to head for a track profile
pub fn performance_index<R: RunStore + ?Sized>(
    store: &R,
    a: RunPair,
    b: RunPair,
    profile: TrackProfile,
) -> Result<PerformanceIndex, ShiftlabError> {
    let bests = GlobalBests::from_store(store)?;
    let a = vehicle_score(store, a, &bests, profile)?;
    let b = vehicle_score(store, b, &bests, profile)?;

    let mut missing = Vec::new();
    if a.drag.time_to_100_s.is_none() || b.drag.time_to_100_s.is_none() {
        missing.push("drag".to_string());
    }
    if a.handling.max_lateral_g.is_none() || b.handling.max_lateral_g.is_none() {
        missing.push("handling".to_string());
    }
    if !missing.is_empty() {
        warn!("Incomplete comparison, no {} data for one vehicle", missing.join(", "));
    }
    info!(
        "Performance index ({}): {} {:.1}, {} {:.1}",
        profile, a.vehicle_name, a.overall, b.vehicle_name, b.overall
    );

    Ok(PerformanceIndex {
        track_profile: profile,
        bests,
        a,
        b,
        missing,
    })
}

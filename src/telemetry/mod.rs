pub mod source;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uom::si::f64::Velocity;
use uom::si::velocity::{kilometer_per_hour, meter_per_second};

use crate::ShiftlabError;

pub use source::{ReplayTelemetrySource, TelemetrySource};

/// Scale applied to longitudinal acceleration (m/s^2) to obtain the torque proxy.
pub const TORQUE_PROXY_SCALE: f64 = 1000.0;
/// Divisor used to express accelerations in g.
pub const GRAVITY_MPS2: f64 = 9.81;

/// The kind of maneuver a run records.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum RunKind {
    /// Straight-line acceleration from near standstill
    #[default]
    Drag,
    /// Cornering run, ended only by the operator
    Handling,
    /// Quick-comparison drag run, car A
    QuickA,
    /// Quick-comparison drag run, car B
    QuickB,
}

impl RunKind {
    pub const ALL: [RunKind; 4] = [
        RunKind::Drag,
        RunKind::Handling,
        RunKind::QuickA,
        RunKind::QuickB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Drag => "DRAG",
            RunKind::Handling => "HANDLING",
            RunKind::QuickA => "QUICK_A",
            RunKind::QuickB => "QUICK_B",
        }
    }

    /// Drag and quick-comparison runs share the launch trigger and the lift/brake stop.
    pub fn is_drag_like(&self) -> bool {
        !matches!(self, RunKind::Handling)
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = ShiftlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        RunKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or(ShiftlabError::InvalidUserInput {
                field: "run_kind".to_string(),
                reason: format!("'{}' is not one of drag, handling, quick-a, quick-b", s),
            })
    }
}

/// One telemetry observation inside a run.
///
/// Fields added after the first storage schema carry serde defaults so older
/// records still load: `brake`, `lap_distance_m` and `sector` default to 0 and
/// the handling channels default to `None` (channel not recorded).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Sample {
    /// Seconds since the run started
    pub elapsed_s: f64,
    /// 0 = neutral, negative = reverse
    pub gear: i32,
    pub engine_rpm: f64,
    /// Longitudinal acceleration scaled to an Nm-like range, see [`TORQUE_PROXY_SCALE`]
    pub torque_proxy: f64,
    pub speed_kmh: f64,
    /// 0=off throttle to 1=full throttle
    pub throttle: f64,
    #[serde(default)]
    pub brake: f64,
    /// Lateral acceleration in g
    #[serde(default)]
    pub lat_g: Option<f64>,
    /// Longitudinal acceleration in g, positive when accelerating
    #[serde(default)]
    pub lon_g: Option<f64>,
    /// Steering position, -1 (full left lock) to 1
    #[serde(default)]
    pub steering: Option<f64>,
    /// Meters traveled from S/F this lap
    #[serde(default)]
    pub lap_distance_m: f64,
    #[serde(default)]
    pub sector: i32,
}

impl Sample {
    /// Convert a raw snapshot into a run sample taken `elapsed_s` seconds after run start.
    pub fn from_snapshot(snapshot: &TelemetrySnapshot, elapsed_s: f64) -> Self {
        // the simulator's local z axis points backwards
        let forward_accel = -snapshot.longitudinal_accel_mps2;
        let speed = Velocity::new::<meter_per_second>(snapshot.speed_mps.abs());

        Self {
            elapsed_s,
            gear: snapshot.gear,
            engine_rpm: snapshot.engine_rpm,
            torque_proxy: forward_accel * TORQUE_PROXY_SCALE,
            speed_kmh: speed.get::<kilometer_per_hour>(),
            throttle: snapshot.throttle,
            brake: snapshot.brake,
            lat_g: Some(snapshot.lateral_accel_mps2 / GRAVITY_MPS2),
            lon_g: Some(forward_accel / GRAVITY_MPS2),
            steering: Some(snapshot.steering),
            lap_distance_m: snapshot.lap_distance_m,
            sector: snapshot.sector,
        }
    }

    /// Forward acceleration in m/s^2 recovered from the torque proxy.
    pub fn acceleration_mps2(&self) -> f64 {
        self.torque_proxy / TORQUE_PROXY_SCALE
    }
}

/// Identity of the car and track of the current session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub vehicle_name: String,
    pub vehicle_class: String,
    pub track_name: String,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            vehicle_name: "Unknown_Vehicle".to_string(),
            vehicle_class: "Unknown Class".to_string(),
            track_name: "Unknown Track".to_string(),
        }
    }
}

/// A single read of the live telemetry source.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TelemetrySnapshot {
    /// Simulator session clock, when the source provides one
    #[serde(default)]
    pub session_time_s: Option<f64>,
    pub engine_rpm: f64,
    pub gear: i32,
    /// Local longitudinal acceleration (m/s^2) in the simulator frame, positive towards the rear
    pub longitudinal_accel_mps2: f64,
    /// Local lateral acceleration (m/s^2)
    pub lateral_accel_mps2: f64,
    /// Local longitudinal velocity (m/s), sign depends on direction of travel
    pub speed_mps: f64,
    pub throttle: f64,
    pub brake: f64,
    pub steering: f64,
    #[serde(default)]
    pub lap_distance_m: f64,
    #[serde(default)]
    pub sector: i32,
}

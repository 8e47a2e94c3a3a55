// Persistence of runs, samples and derived profiles

pub mod file;
pub mod migrations;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::SystemTime;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::shift_points::ShiftPoint;
use crate::errors::ShiftlabError;
use crate::telemetry::{RunKind, Sample, SessionInfo};

pub use file::FileRunStore;
pub use migrations::CURRENT_SCHEMA_VERSION;

/// Unique identifier of a recorded run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata stored for each run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunHeader {
    /// Version of the stored header format
    pub schema_version: u64,
    pub id: RunId,
    pub vehicle_name: String,
    pub vehicle_class: String,
    pub track_name: String,
    pub created_at: SystemTime,
    pub run_kind: RunKind,
    /// Free text, the only field editable after sealing
    pub notes: String,
    /// Set once recording ended and the last batch was flushed
    pub sealed: bool,
    pub sample_count: usize,
}

impl RunHeader {
    pub fn new(id: RunId, session: &SessionInfo, run_kind: RunKind) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            id,
            vehicle_name: session.vehicle_name.clone(),
            vehicle_class: session.vehicle_class.clone(),
            track_name: session.track_name.clone(),
            created_at: SystemTime::now(),
            run_kind,
            notes: String::new(),
            sealed: false,
            sample_count: 0,
        }
    }
}

/// A run read back from storage, samples ordered by elapsed time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub header: RunHeader,
    pub samples: Vec<Sample>,
}

/// Ratios keyed by gear number; gears may be missing.
pub type GearRatios = BTreeMap<i32, f64>;

/// Median speed/engine-speed ratio per gear for one vehicle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GearRatioProfile {
    pub vehicle_name: String,
    /// km/h per rev/min
    pub ratios: GearRatios,
}

/// Scale turning a speed/engine-speed ratio into a drivetrain ratio for the shift solver.
pub const NORMALIZED_RATIO_SCALE: f64 = 0.12;

impl GearRatioProfile {
    /// Overall drivetrain ratios (final drive folded in, so use a final drive of 1.0).
    ///
    /// Only relative ratios matter to the shift solver, the scale keeps the
    /// reconstructed torque in a plausible range.
    pub fn drivetrain_ratios(&self) -> GearRatios {
        self.ratios
            .iter()
            .filter(|(_, r)| **r > 0.)
            .map(|(gear, r)| (*gear, NORMALIZED_RATIO_SCALE / r))
            .collect()
    }
}

/// Shift table computed for a run, reused by the shift-light overlay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShiftProfile {
    pub run_id: RunId,
    pub vehicle_name: String,
    pub shift_points: Vec<ShiftPoint>,
}

/// Interface for the durable store of runs and profiles.
///
/// Run-open and seal failures must be surfaced to the operator; sample batch
/// writes are independent units that the recorder may drop on failure.
pub trait RunStore {
    /// Write a new run header and return its identifier
    fn create_run(
        &mut self,
        session: &SessionInfo,
        run_kind: RunKind,
    ) -> Result<RunId, ShiftlabError>;

    /// Append a batch of samples to an open run, preserving their order
    fn append_samples(&mut self, run_id: RunId, samples: &[Sample]) -> Result<(), ShiftlabError>;

    /// Mark a run as complete
    fn seal_run(&mut self, run_id: RunId, sample_count: usize) -> Result<(), ShiftlabError>;

    /// Load a run with its samples ordered by elapsed time
    fn load_run(&self, run_id: RunId) -> Result<Option<Run>, ShiftlabError>;

    /// All run headers, newest first
    fn list_runs(&self) -> Result<Vec<RunHeader>, ShiftlabError>;

    fn update_notes(&mut self, run_id: RunId, notes: &str) -> Result<(), ShiftlabError>;

    /// Remove a run, its samples and its shift profile
    fn delete_run(&mut self, run_id: RunId) -> Result<(), ShiftlabError>;

    fn load_gear_ratios(&self, vehicle_name: &str)
    -> Result<Option<GearRatioProfile>, ShiftlabError>;

    /// Replace the stored gear ratio profile of the vehicle
    fn save_gear_ratios(&mut self, profile: &GearRatioProfile) -> Result<(), ShiftlabError>;

    /// Shift profile stored for a run, if any (stale profiles are ignored)
    fn load_shift_profile(&self, run_id: RunId) -> Result<Option<ShiftProfile>, ShiftlabError>;

    fn save_shift_profile(&mut self, profile: &ShiftProfile) -> Result<(), ShiftlabError>;

    fn delete_shift_profile(&mut self, run_id: RunId) -> Result<(), ShiftlabError>;

    /// All shift profiles whose run still exists
    fn list_shift_profiles(&self) -> Result<Vec<ShiftProfile>, ShiftlabError>;

    /// All runs recorded with the given vehicle
    fn runs_for_vehicle(&self, vehicle_name: &str) -> Result<Vec<Run>, ShiftlabError> {
        let mut runs = Vec::new();
        for header in self.list_runs()? {
            if header.vehicle_name != vehicle_name {
                continue;
            }
            if let Some(run) = self.load_run(header.id)? {
                runs.push(run);
            }
        }
        debug!("Found {} runs for vehicle {}", runs.len(), vehicle_name);
        Ok(runs)
    }

    /// Load a run that must exist
    fn require_run(&self, run_id: RunId) -> Result<Run, ShiftlabError> {
        self.load_run(run_id)?
            .ok_or(ShiftlabError::UnknownRun { run_id })
    }
}

/// Sort samples by elapsed time, keeping insertion order for equal timestamps.
pub(crate) fn order_samples(samples: &mut [Sample]) {
    samples.sort_by(|a, b| a.elapsed_s.total_cmp(&b.elapsed_s));
}

/// In-memory store, used by tests and short-lived sessions
#[derive(Default)]
pub struct MemoryRunStore {
    headers: BTreeMap<RunId, RunHeader>,
    samples: HashMap<RunId, Vec<Sample>>,
    gear_ratios: HashMap<String, GearRatioProfile>,
    shift_profiles: BTreeMap<RunId, ShiftProfile>,
    next_id: u64,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an already complete run, returning its new identifier
    pub fn insert_run(
        &mut self,
        session: &SessionInfo,
        run_kind: RunKind,
        samples: Vec<Sample>,
    ) -> RunId {
        let run_id = self.allocate_id();
        let mut header = RunHeader::new(run_id, session, run_kind);
        header.sealed = true;
        header.sample_count = samples.len();
        self.headers.insert(run_id, header);
        self.samples.insert(run_id, samples);
        run_id
    }

    fn allocate_id(&mut self) -> RunId {
        self.next_id += 1;
        RunId(self.next_id)
    }
}

impl RunStore for MemoryRunStore {
    fn create_run(
        &mut self,
        session: &SessionInfo,
        run_kind: RunKind,
    ) -> Result<RunId, ShiftlabError> {
        let run_id = self.allocate_id();
        self.headers
            .insert(run_id, RunHeader::new(run_id, session, run_kind));
        self.samples.insert(run_id, Vec::new());
        Ok(run_id)
    }

    fn append_samples(&mut self, run_id: RunId, samples: &[Sample]) -> Result<(), ShiftlabError> {
        self.samples
            .get_mut(&run_id)
            .ok_or(ShiftlabError::UnknownRun { run_id })?
            .extend_from_slice(samples);
        Ok(())
    }

    fn seal_run(&mut self, run_id: RunId, sample_count: usize) -> Result<(), ShiftlabError> {
        let header = self
            .headers
            .get_mut(&run_id)
            .ok_or(ShiftlabError::UnknownRun { run_id })?;
        header.sealed = true;
        header.sample_count = sample_count;
        Ok(())
    }

    fn load_run(&self, run_id: RunId) -> Result<Option<Run>, ShiftlabError> {
        let Some(header) = self.headers.get(&run_id) else {
            return Ok(None);
        };
        let mut samples = self.samples.get(&run_id).cloned().unwrap_or_default();
        order_samples(&mut samples);
        Ok(Some(Run {
            header: header.clone(),
            samples,
        }))
    }

    fn list_runs(&self) -> Result<Vec<RunHeader>, ShiftlabError> {
        Ok(self.headers.values().rev().cloned().collect())
    }

    fn update_notes(&mut self, run_id: RunId, notes: &str) -> Result<(), ShiftlabError> {
        self.headers
            .get_mut(&run_id)
            .ok_or(ShiftlabError::UnknownRun { run_id })?
            .notes = notes.to_string();
        Ok(())
    }

    fn delete_run(&mut self, run_id: RunId) -> Result<(), ShiftlabError> {
        self.headers.remove(&run_id);
        self.samples.remove(&run_id);
        self.shift_profiles.remove(&run_id);
        Ok(())
    }

    fn load_gear_ratios(
        &self,
        vehicle_name: &str,
    ) -> Result<Option<GearRatioProfile>, ShiftlabError> {
        Ok(self.gear_ratios.get(vehicle_name).cloned())
    }

    fn save_gear_ratios(&mut self, profile: &GearRatioProfile) -> Result<(), ShiftlabError> {
        self.gear_ratios
            .insert(profile.vehicle_name.clone(), profile.clone());
        Ok(())
    }

    fn load_shift_profile(&self, run_id: RunId) -> Result<Option<ShiftProfile>, ShiftlabError> {
        let Some(profile) = self.shift_profiles.get(&run_id) else {
            return Ok(None);
        };
        if !self.headers.contains_key(&run_id) {
            warn!("Ignoring stale shift profile for deleted run {}", run_id);
            return Ok(None);
        }
        Ok(Some(profile.clone()))
    }

    fn save_shift_profile(&mut self, profile: &ShiftProfile) -> Result<(), ShiftlabError> {
        self.shift_profiles.insert(profile.run_id, profile.clone());
        Ok(())
    }

    fn delete_shift_profile(&mut self, run_id: RunId) -> Result<(), ShiftlabError> {
        self.shift_profiles.remove(&run_id);
        Ok(())
    }

    fn list_shift_profiles(&self) -> Result<Vec<ShiftProfile>, ShiftlabError> {
        Ok(self
            .shift_profiles
            .values()
            .filter(|p| self.headers.contains_key(&p.run_id))
            .cloned()
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample(elapsed_s: f64) -> Sample {
        Sample {
            elapsed_s,
            ..Default::default()
        }
    }

    #[test]
    fn test_memory_store_run_lifecycle() {
        let mut store = MemoryRunStore::new();
        let run_id = store
            .create_run(&SessionInfo::default(), RunKind::Handling)
            .unwrap();

        store
            .append_samples(run_id, &[sample(0.), sample(0.02)])
            .unwrap();
        store.append_samples(run_id, &[sample(0.04)]).unwrap();
        store.seal_run(run_id, 3).unwrap();

        let run = store.load_run(run_id).unwrap().unwrap();
        assert!(run.header.sealed);
        assert_eq!(run.header.sample_count, 3);
        assert_eq!(run.header.run_kind, RunKind::Handling);
        assert_eq!(
            run.samples.iter().map(|s| s.elapsed_s).collect::<Vec<_>>(),
            vec![0., 0.02, 0.04]
        );
    }

    #[test]
    fn test_append_to_unknown_run_fails() {
        let mut store = MemoryRunStore::new();
        let result = store.append_samples(RunId(42), &[sample(0.)]);
        assert!(matches!(result, Err(ShiftlabError::UnknownRun { .. })));
    }

    #[test]
    fn test_stale_shift_profile_is_ignored() {
        let mut store = MemoryRunStore::new();
        let run_id = store.insert_run(&SessionInfo::default(), RunKind::Drag, vec![sample(0.)]);
        store
            .save_shift_profile(&ShiftProfile {
                run_id,
                vehicle_name: "car".to_string(),
                shift_points: Vec::new(),
            })
            .unwrap();
        store
            .save_shift_profile(&ShiftProfile {
                run_id: RunId(99),
                vehicle_name: "gone".to_string(),
                shift_points: Vec::new(),
            })
            .unwrap();

        assert!(store.load_shift_profile(RunId(99)).unwrap().is_none());
        assert_eq!(store.list_shift_profiles().unwrap().len(), 1);

        store.delete_run(run_id).unwrap();
        assert!(store.load_shift_profile(run_id).unwrap().is_none());
    }

    #[test]
    fn test_drivetrain_ratios_are_normalized() {
        let profile = GearRatioProfile {
            vehicle_name: "car".to_string(),
            ratios: BTreeMap::from([(1, 0.012), (2, 0.024)]),
        };
        let ratios = profile.drivetrain_ratios();
        assert!((ratios[&1] - 10.0).abs() < 1e-9);
        assert!((ratios[&2] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_drivetrain_ratios_keep_gear_numbers() {
        // first gear dropped by detection
        let profile = GearRatioProfile {
            vehicle_name: "car".to_string(),
            ratios: BTreeMap::from([(2, 0.02), (3, 0.024), (4, 0.)]),
        };
        let ratios = profile.drivetrain_ratios();
        assert_eq!(ratios.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert!((ratios[&2] - 6.0).abs() < 1e-9);
        assert!((ratios[&3] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_runs_for_vehicle_filters_by_name() {
        let mut store = MemoryRunStore::new();
        let car_a = SessionInfo {
            vehicle_name: "A".to_string(),
            ..Default::default()
        };
        let car_b = SessionInfo {
            vehicle_name: "B".to_string(),
            ..Default::default()
        };
        store.insert_run(&car_a, RunKind::Drag, vec![sample(0.)]);
        store.insert_run(&car_b, RunKind::Drag, vec![sample(0.)]);
        store.insert_run(&car_a, RunKind::Handling, vec![sample(0.)]);

        assert_eq!(store.runs_for_vehicle("A").unwrap().len(), 2);
        assert_eq!(store.runs_for_vehicle("C").unwrap().len(), 0);
    }
}

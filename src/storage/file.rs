// File-based run storage: one directory per run, JSON headers and JSON-lines samples

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::ShiftlabError;
use crate::telemetry::{RunKind, Sample, SessionInfo};

use super::migrations::migrate_header;
use super::{GearRatioProfile, Run, RunHeader, RunId, RunStore, ShiftProfile, order_samples};

const RUNS_DIR: &str = "runs";
const GEAR_RATIOS_DIR: &str = "gear_ratios";
const SHIFT_PROFILES_DIR: &str = "shift_profiles";
const HEADER_FILE: &str = "header.json";
const SAMPLES_FILE: &str = "samples.jsonl";

/// Run store persisted under a data directory:
///
/// ```text
/// <data_dir>/runs/<id>/header.json
/// <data_dir>/runs/<id>/samples.jsonl
/// <data_dir>/gear_ratios/<vehicle>.json
/// <data_dir>/shift_profiles/<id>.json
/// ```
pub struct FileRunStore {
    storage_path: PathBuf,
}

fn io_error(operation: &str, path: &Path) -> impl FnOnce(io::Error) -> ShiftlabError {
    let operation = format!("{} {:?}", operation, path);
    move |e| ShiftlabError::StorageIo {
        operation,
        source: e,
    }
}

impl FileRunStore {
    /// Open (and create if needed) a store rooted at `storage_path`
    pub fn new(storage_path: PathBuf) -> Result<Self, ShiftlabError> {
        for dir in [RUNS_DIR, GEAR_RATIOS_DIR, SHIFT_PROFILES_DIR] {
            let path = storage_path.join(dir);
            fs::create_dir_all(&path).map_err(io_error("create directory", &path))?;
        }
        debug!("Opened run store at {:?}", storage_path);
        Ok(Self { storage_path })
    }

    /// Default location in the user's application data directory
    pub fn default_storage_path() -> Result<PathBuf, ShiftlabError> {
        let app_data_dir = dirs::data_dir().ok_or(ShiftlabError::NoDataDir)?;
        Ok(app_data_dir.join("shiftlab"))
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.storage_path.join(RUNS_DIR).join(run_id.to_string())
    }

    fn header_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join(HEADER_FILE)
    }

    fn samples_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join(SAMPLES_FILE)
    }

    fn gear_ratios_path(&self, vehicle_name: &str) -> PathBuf {
        self.storage_path
            .join(GEAR_RATIOS_DIR)
            .join(format!("{}.json", normalize_name(vehicle_name)))
    }

    fn shift_profile_path(&self, run_id: RunId) -> PathBuf {
        self.storage_path
            .join(SHIFT_PROFILES_DIR)
            .join(format!("{}.json", run_id))
    }

    fn read_header(&self, run_id: RunId) -> Result<Option<RunHeader>, ShiftlabError> {
        let Some(raw) = read_json::<serde_json::Value>(&self.header_path(run_id))? else {
            return Ok(None);
        };
        migrate_header(raw).map(Some)
    }

    fn write_header(&self, header: &RunHeader) -> Result<(), ShiftlabError> {
        write_json(&self.header_path(header.id), header)
    }

    fn require_header(&self, run_id: RunId) -> Result<RunHeader, ShiftlabError> {
        self.read_header(run_id)?
            .ok_or(ShiftlabError::UnknownRun { run_id })
    }

    /// Ids of every run directory, in ascending order
    fn run_ids(&self) -> Result<Vec<RunId>, ShiftlabError> {
        let runs_dir = self.storage_path.join(RUNS_DIR);
        let entries = fs::read_dir(&runs_dir).map_err(io_error("list runs in", &runs_dir))?;
        let mut ids: Vec<RunId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .map(RunId)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Claim the next free run directory. `create_dir` fails on an existing
    /// directory, so two recorders never share an id.
    fn allocate_run_dir(&self) -> Result<RunId, ShiftlabError> {
        let mut candidate = self.run_ids()?.last().map_or(1, |id| id.0 + 1);
        loop {
            let run_id = RunId(candidate);
            let path = self.run_dir(run_id);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(run_id),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => candidate += 1,
                Err(e) => return Err(io_error("create run directory", &path)(e)),
            }
        }
    }
}

/// Lowercase alphanumeric file name for a vehicle
fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ShiftlabError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(io_error("read", path))?;
    let value =
        serde_json::from_str(&content).map_err(|e| ShiftlabError::StorageSerialize { source: e })?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ShiftlabError> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| ShiftlabError::StorageSerialize { source: e })?;
    fs::write(path, content).map_err(io_error("write", path))
}

fn remove_file_if_exists(path: &Path) -> Result<(), ShiftlabError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error("remove", path)(e)),
        _ => Ok(()),
    }
}

impl RunStore for FileRunStore {
    fn create_run(
        &mut self,
        session: &SessionInfo,
        run_kind: RunKind,
    ) -> Result<RunId, ShiftlabError> {
        let run_id = self.allocate_run_dir()?;
        let header = RunHeader::new(run_id, session, run_kind);
        if let Err(e) = self.write_header(&header) {
            // leave no headerless directory behind
            let _ = fs::remove_dir_all(self.run_dir(run_id));
            return Err(e);
        }
        info!(
            "Created {} run {} for {} at {}",
            run_kind, run_id, session.vehicle_name, session.track_name
        );
        Ok(run_id)
    }

    fn append_samples(&mut self, run_id: RunId, samples: &[Sample]) -> Result<(), ShiftlabError> {
        if !self.run_dir(run_id).exists() {
            return Err(ShiftlabError::UnknownRun { run_id });
        }
        let path = self.samples_path(run_id);
        serde_jsonlines::append_json_lines(&path, samples).map_err(io_error("append to", &path))
    }

    fn seal_run(&mut self, run_id: RunId, sample_count: usize) -> Result<(), ShiftlabError> {
        let mut header = self.require_header(run_id)?;
        header.sealed = true;
        header.sample_count = sample_count;
        self.write_header(&header)?;
        info!("Sealed run {} with {} samples", run_id, sample_count);
        Ok(())
    }

    fn load_run(&self, run_id: RunId) -> Result<Option<Run>, ShiftlabError> {
        let Some(header) = self.read_header(run_id)? else {
            return Ok(None);
        };
        let path = self.samples_path(run_id);
        let mut samples = if path.exists() {
            serde_jsonlines::json_lines(&path)
                .map_err(io_error("read", &path))?
                .collect::<Result<Vec<Sample>, _>>()
                .map_err(io_error("parse", &path))?
        } else {
            Vec::new()
        };
        order_samples(&mut samples);
        Ok(Some(Run { header, samples }))
    }

    fn list_runs(&self) -> Result<Vec<RunHeader>, ShiftlabError> {
        let mut headers = Vec::new();
        for run_id in self.run_ids()?.into_iter().rev() {
            match self.read_header(run_id) {
                Ok(Some(header)) => headers.push(header),
                Ok(None) => warn!("Run directory {} has no header, skipping", run_id),
                Err(e) => warn!("Skipping unreadable run {}: {}", run_id, e),
            }
        }
        Ok(headers)
    }

    fn update_notes(&mut self, run_id: RunId, notes: &str) -> Result<(), ShiftlabError> {
        let mut header = self.require_header(run_id)?;
        header.notes = notes.to_string();
        self.write_header(&header)
    }

    fn delete_run(&mut self, run_id: RunId) -> Result<(), ShiftlabError> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(io_error("remove", &dir))?;
        }
        remove_file_if_exists(&self.shift_profile_path(run_id))?;
        info!("Deleted run {}", run_id);
        Ok(())
    }

    fn load_gear_ratios(
        &self,
        vehicle_name: &str,
    ) -> Result<Option<GearRatioProfile>, ShiftlabError> {
        read_json(&self.gear_ratios_path(vehicle_name))
    }

    fn save_gear_ratios(&mut self, profile: &GearRatioProfile) -> Result<(), ShiftlabError> {
        write_json(&self.gear_ratios_path(&profile.vehicle_name), profile)
    }

    fn load_shift_profile(&self, run_id: RunId) -> Result<Option<ShiftProfile>, ShiftlabError> {
        let Some(profile) = read_json::<ShiftProfile>(&self.shift_profile_path(run_id))? else {
            return Ok(None);
        };
        if !self.header_path(run_id).exists() {
            warn!("Ignoring stale shift profile for deleted run {}", run_id);
            return Ok(None);
        }
        Ok(Some(profile))
    }

    fn save_shift_profile(&mut self, profile: &ShiftProfile) -> Result<(), ShiftlabError> {
        write_json(&self.shift_profile_path(profile.run_id), profile)
    }

    fn delete_shift_profile(&mut self, run_id: RunId) -> Result<(), ShiftlabError> {
        remove_file_if_exists(&self.shift_profile_path(run_id))
    }

    fn list_shift_profiles(&self) -> Result<Vec<ShiftProfile>, ShiftlabError> {
        let dir = self.storage_path.join(SHIFT_PROFILES_DIR);
        let entries = fs::read_dir(&dir).map_err(io_error("list", &dir))?;
        let mut run_ids: Vec<RunId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                path.file_stem()?.to_str()?.parse::<u64>().ok()
            })
            .map(RunId)
            .collect();
        run_ids.sort();

        let mut profiles = Vec::new();
        for run_id in run_ids {
            if let Some(profile) = self.load_shift_profile(run_id)? {
                profiles.push(profile);
            }
        }
        Ok(profiles)
    }
}

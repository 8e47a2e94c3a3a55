use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::ShiftlabError;
use crate::recorder::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL};
use crate::storage::FileRunStore;

const APP_DIR_NAME: &str = "shiftlab";
const CONFIG_FILE_NAME: &str = "config.json";
const STATE_FILE_NAME: &str = "recorder.state";

/// Default standardized shift duration inserted by the virtual run
pub const DEFAULT_VIRTUAL_SHIFT_DELAY_S: f64 = 0.08;
pub const DEFAULT_SYNC_SPEED_KMH: f64 = 50.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the run store
    pub data_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Speed at which two runs are aligned for comparison
    pub sync_speed_kmh: f64,
    pub virtual_shift_delay_s: f64,
    pub kpi_target_speeds_kmh: Vec<f64>,
    pub default_final_drive: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: FileRunStore::default_storage_path()
                .unwrap_or_else(|_| PathBuf::from(APP_DIR_NAME)),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            batch_size: DEFAULT_BATCH_SIZE,
            sync_speed_kmh: DEFAULT_SYNC_SPEED_KMH,
            virtual_shift_delay_s: DEFAULT_VIRTUAL_SHIFT_DELAY_S,
            kpi_target_speeds_kmh: vec![100., 200., 300.],
            default_final_drive: 1.0,
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        Some(
            dirs::config_dir()?
                .join(APP_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        )
    }

    /// Config from the user's config directory, `None` if absent or unreadable
    pub fn from_local_file() -> Option<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            return None;
        }
        match Self::from_file(&config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring config file {:?}: {}", config_path, e);
                None
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ShiftlabError> {
        let file = File::open(path).map_err(|e| ShiftlabError::ConfigIOError { source: e })?;
        serde_json::from_reader(file).map_err(|e| ShiftlabError::ConfigSerializeError { source: e })
    }

    pub fn save(&self) -> Result<(), ShiftlabError> {
        let config_path = Self::config_path().ok_or(ShiftlabError::NoConfigDir)?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ShiftlabError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ShiftlabError::ConfigIOError { source: e })?;
        }
        let file = File::create(path).map_err(|e| ShiftlabError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| ShiftlabError::ConfigSerializeError { source: e })
    }

    /// File holding the recorder state shared between processes
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }
}

/// Physical parameters used to turn acceleration into engine torque.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct VehicleParams {
    pub mass_kg: f64,
    pub wheel_radius_m: f64,
}

impl Default for VehicleParams {
    fn default() -> Self {
        VehicleClass::Generic.params()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleClass {
    Gte,
    Hypercar,
    Lmp2,
    Gt3,
    Generic,
}

impl VehicleClass {
    pub fn params(&self) -> VehicleParams {
        let (mass_kg, wheel_radius_m) = match self {
            VehicleClass::Gte => (1245., 0.35),
            VehicleClass::Hypercar => (1050., 0.35),
            VehicleClass::Lmp2 => (930., 0.33),
            VehicleClass::Gt3 => (1300., 0.34),
            VehicleClass::Generic => (1200., 0.33),
        };
        VehicleParams {
            mass_kg,
            wheel_radius_m,
        }
    }

    /// Best guess of the class from a simulator vehicle name
    pub fn guess_from_vehicle_name(vehicle_name: &str) -> Self {
        let name = vehicle_name.to_lowercase();
        let contains_any = |keys: &[&str]| keys.iter().any(|key| name.contains(key));
        if contains_any(&["hypercar", "lmdh", "lmh", "499", "963", "toyota"]) {
            VehicleClass::Hypercar
        } else if contains_any(&["lmp2", "oreca"]) {
            VehicleClass::Lmp2
        } else if contains_any(&["gt3"]) {
            VehicleClass::Gt3
        } else {
            VehicleClass::Gte
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleClass::Gte => "GTE",
            VehicleClass::Hypercar => "Hypercar",
            VehicleClass::Lmp2 => "LMP2",
            VehicleClass::Gt3 => "GT3",
            VehicleClass::Generic => "Generic",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for VehicleClass {
    type Err = ShiftlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gte" => Ok(VehicleClass::Gte),
            "hypercar" => Ok(VehicleClass::Hypercar),
            "lmp2" => Ok(VehicleClass::Lmp2),
            "gt3" => Ok(VehicleClass::Gt3),
            "generic" => Ok(VehicleClass::Generic),
            _ => Err(ShiftlabError::InvalidUserInput {
                field: "vehicle_class".to_string(),
                reason: format!("'{}' is not one of gte, hypercar, lmp2, gt3, generic", s),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);
        let config = AppConfig {
            data_dir: temp_dir.path().to_path_buf(),
            virtual_shift_delay_s: 0.1,
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"sync_speed_kmh": 80.0}"#).unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.sync_speed_kmh, 80.);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.poll_interval_ms, 20);
        assert_eq!(config.virtual_shift_delay_s, DEFAULT_VIRTUAL_SHIFT_DELAY_S);
    }

    #[test]
    fn test_guess_vehicle_class() {
        assert_eq!(
            VehicleClass::guess_from_vehicle_name("Porsche 963"),
            VehicleClass::Hypercar
        );
        assert_eq!(
            VehicleClass::guess_from_vehicle_name("Oreca 07 Gibson"),
            VehicleClass::Lmp2
        );
        assert_eq!(
            VehicleClass::guess_from_vehicle_name("McLaren 720S GT3 Evo"),
            VehicleClass::Gt3
        );
        assert_eq!(
            VehicleClass::guess_from_vehicle_name("Corvette C8.R"),
            VehicleClass::Gte
        );
        assert_eq!(VehicleClass::Lmp2.params().mass_kg, 930.);
        assert_eq!("GT3".parse::<VehicleClass>().unwrap(), VehicleClass::Gt3);
    }
}

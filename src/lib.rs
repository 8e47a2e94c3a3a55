// Library interface for shiftlab
// The binary and the integration tests both build on these modules

pub mod analysis;
pub mod config;
pub mod errors;
pub mod recorder;
pub mod storage;
pub mod telemetry;

// Re-export commonly used types
pub use config::{AppConfig, VehicleClass, VehicleParams};
pub use errors::ShiftlabError;
pub use recorder::{Recorder, RecorderState};
pub use storage::{FileRunStore, MemoryRunStore, RunId, RunStore};
pub use telemetry::{RunKind, Sample, SessionInfo};

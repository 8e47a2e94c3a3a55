// Error types for shiftlab

use snafu::Snafu;
use std::io;

use crate::storage::RunId;

#[derive(Debug, Snafu)]
pub enum ShiftlabError {
    // Errors from the live telemetry source
    #[snafu(display("Telemetry source error: {description}"))]
    TelemetrySourceError { description: String },
    #[snafu(display("Invalid telemetry replay file: {path}"))]
    InvalidTelemetryFile { path: String },
    #[snafu(display("Error reading telemetry replay file"))]
    TelemetryReplayError { source: io::Error },

    // Recorder state and operator command errors
    #[snafu(display("Unknown recorder state: {value}"))]
    InvalidRecorderState { value: String },
    #[snafu(display("Cannot {command} while the recorder is {state}"))]
    InvalidStateTransition { command: String, state: String },
    #[snafu(display("Error accessing recorder state file"))]
    StateFileError { source: io::Error },
    #[snafu(display("Recorder state lock poisoned"))]
    StatePoisoned,

    // Run lifecycle errors, fatal to the run they belong to
    #[snafu(display("Could not open run record: {reason}"))]
    RunOpenFailed { reason: String },
    #[snafu(display("Could not seal run {run_id}: {reason}"))]
    RunSealFailed { run_id: RunId, reason: String },

    // Persistence errors
    #[snafu(display("Storage operation failed: {operation}"))]
    StorageIo { operation: String, source: io::Error },
    #[snafu(display("Error serializing stored record"))]
    StorageSerialize { source: serde_json::Error },
    #[snafu(display("Run {run_id} does not exist"))]
    UnknownRun { run_id: RunId },
    #[snafu(display("Unsupported record schema version {version}"))]
    UnsupportedSchemaVersion { version: u64 },
    #[snafu(display("Could not find application data directory"))]
    NoDataDir,

    // Config management errors
    #[snafu(display("Could not find application config directory to save config file"))]
    NoConfigDir,
    #[snafu(display("Error reading or writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },

    // Analysis errors
    #[snafu(display("Not enough data: {reason}"))]
    InsufficientData { reason: String },

    // Command line output errors
    #[snafu(display("Error writing command output"))]
    OutputError { source: serde_json::Error },

    // User input validation errors
    #[snafu(display("Invalid user input: {field} - {reason}"))]
    InvalidUserInput { field: String, reason: String },
}

impl ShiftlabError {
    /// True for failures that only mean "not enough data" and can be shown as a neutral result.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, ShiftlabError::InsufficientData { .. })
    }
}

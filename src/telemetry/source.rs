use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::ShiftlabError;

use super::{SessionInfo, TelemetrySnapshot};

/// A pull-based source of live telemetry.
///
/// The recorder polls the source once per tick:
///
/// 1. `is_active()` tells whether the simulator (or replay) is running at all
/// 2. `is_on_track()` tells whether the player's car is currently driving
/// 3. `session_info()` identifies car, class and track when a run is opened
/// 4. `snapshot()` returns the current vehicle state
///
/// A source that is inactive or off track is not an error: the recorder simply
/// holds its state until the source comes back.
pub trait TelemetrySource {
    fn is_active(&mut self) -> bool;

    fn is_on_track(&mut self) -> bool;

    /// # Errors
    ///
    /// Returns an error if the session metadata cannot be read.
    fn session_info(&mut self) -> Result<SessionInfo, ShiftlabError>;

    /// # Errors
    ///
    /// Returns an error if the source is not running or the read fails.
    fn snapshot(&mut self) -> Result<TelemetrySnapshot, ShiftlabError>;
}

/// One line of a telemetry replay file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ReplayRecord {
    /// Car/track identity for the following snapshots
    Session(SessionInfo),
    Snapshot(TelemetrySnapshot),
    /// The car left the track (garage, menu) for one poll
    OffTrack,
}

/// Replays a JSON-lines file of [`ReplayRecord`]s as if it were a live source.
pub struct ReplayTelemetrySource {
    records: Vec<ReplayRecord>,
    cursor: usize,
    session: SessionInfo,
}

impl ReplayTelemetrySource {
    pub fn new(records: Vec<ReplayRecord>) -> Self {
        Self {
            records,
            cursor: 0,
            session: SessionInfo::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ShiftlabError> {
        if !path.exists() {
            return Err(ShiftlabError::InvalidTelemetryFile {
                path: format!("{:?}", path),
            });
        }
        let records = serde_jsonlines::json_lines(path)
            .map_err(|e| ShiftlabError::TelemetryReplayError { source: e })?
            .collect::<Result<Vec<ReplayRecord>, _>>()
            .map_err(|e| ShiftlabError::TelemetryReplayError { source: e })?;
        info!("Loaded {} replay records from {:?}", records.len(), path);
        Ok(Self::new(records))
    }

    fn consume_session_records(&mut self) {
        while let Some(ReplayRecord::Session(info)) = self.records.get(self.cursor) {
            debug!("Replay session change: {:?}", info);
            self.session = info.clone();
            self.cursor += 1;
        }
    }
}

impl TelemetrySource for ReplayTelemetrySource {
    fn is_active(&mut self) -> bool {
        self.cursor < self.records.len()
    }

    fn is_on_track(&mut self) -> bool {
        self.consume_session_records();
        if let Some(ReplayRecord::OffTrack) = self.records.get(self.cursor) {
            self.cursor += 1;
            return false;
        }
        self.cursor < self.records.len()
    }

    fn session_info(&mut self) -> Result<SessionInfo, ShiftlabError> {
        self.consume_session_records();
        Ok(self.session.clone())
    }

    fn snapshot(&mut self) -> Result<TelemetrySnapshot, ShiftlabError> {
        self.consume_session_records();
        match self.records.get(self.cursor) {
            Some(ReplayRecord::Snapshot(snapshot)) => {
                self.cursor += 1;
                Ok(snapshot.clone())
            }
            Some(other) => Err(ShiftlabError::TelemetrySourceError {
                description: format!("expected a snapshot, found {:?}", other),
            }),
            None => Err(ShiftlabError::TelemetrySourceError {
                description: "replay exhausted".to_string(),
            }),
        }
    }
}

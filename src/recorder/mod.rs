// Recorder state machine: arms on operator command, starts on a trigger sample,
// stops on the drag stop condition, operator abort or loss of telemetry.

pub mod buffer;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::errors::ShiftlabError;
use crate::storage::{RunId, RunStore};
use crate::telemetry::{RunKind, Sample, SessionInfo, TelemetrySnapshot, TelemetrySource};

pub use buffer::{DEFAULT_BATCH_SIZE, SampleBuffer};

/// Default polling period, about 50 Hz.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

const DRAG_TRIGGER_MIN_THROTTLE: f64 = 0.05;
const DRAG_TRIGGER_MAX_SPEED_KMH: f64 = 40.0;
const DRAG_TRIGGER_MAX_BRAKE: f64 = 0.1;
const HANDLING_TRIGGER_MIN_SPEED_KMH: f64 = 15.0;
const DRAG_STOP_MAX_THROTTLE: f64 = 0.05;
const DRAG_STOP_MIN_BRAKE: f64 = 0.1;

/// The recorder's single shared state, readable and writable from outside the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecorderState {
    #[default]
    Idle,
    Armed(RunKind),
    Recording(RunKind),
    Finished,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "IDLE"),
            RecorderState::Armed(kind) => write!(f, "ARMED_{}", kind.as_str()),
            RecorderState::Recording(kind) => write!(f, "RECORDING_{}", kind.as_str()),
            RecorderState::Finished => write!(f, "FINISHED"),
        }
    }
}

impl FromStr for RecorderState {
    type Err = ShiftlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ShiftlabError::InvalidRecorderState {
            value: s.to_string(),
        };
        let value = s.trim();
        match value {
            "IDLE" => Ok(RecorderState::Idle),
            "FINISHED" => Ok(RecorderState::Finished),
            _ => {
                if let Some(kind) = value.strip_prefix("ARMED_") {
                    kind.parse().map(RecorderState::Armed).map_err(|_| invalid())
                } else if let Some(kind) = value.strip_prefix("RECORDING_") {
                    kind.parse()
                        .map(RecorderState::Recording)
                        .map_err(|_| invalid())
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

impl RunKind {
    /// Whether a live sample starts a run of this kind
    pub fn should_start(&self, sample: &Sample) -> bool {
        if self.is_drag_like() {
            sample.throttle > DRAG_TRIGGER_MIN_THROTTLE
                && sample.speed_kmh < DRAG_TRIGGER_MAX_SPEED_KMH
                && sample.gear >= 1
                && sample.brake < DRAG_TRIGGER_MAX_BRAKE
        } else {
            sample.speed_kmh > HANDLING_TRIGGER_MIN_SPEED_KMH
        }
    }

    /// Whether a live sample ends a run of this kind. Handling runs only end on operator stop.
    pub fn should_stop(&self, sample: &Sample) -> bool {
        self.is_drag_like()
            && (sample.throttle < DRAG_STOP_MAX_THROTTLE || sample.brake > DRAG_STOP_MIN_BRAKE)
    }
}

/// Shared cell holding the recorder state.
///
/// The recorder loop and the operator both read and write it; the loop
/// only writes through `compare_and_set` so an operator command issued
/// between its read and its write is never overwritten.
pub trait CommandChannel {
    fn read(&self) -> Result<RecorderState, ShiftlabError>;

    fn write(&self, state: RecorderState) -> Result<(), ShiftlabError>;

    /// Replace the state with `new` only if it still equals `expected`.
    /// Returns whether the write happened.
    fn compare_and_set(
        &self,
        expected: RecorderState,
        new: RecorderState,
    ) -> Result<bool, ShiftlabError>;
}

/// In-process channel, clone it to hand the same state to the operator side.
#[derive(Clone, Debug, Default)]
pub struct SharedCommandChannel {
    state: Arc<Mutex<RecorderState>>,
}

impl SharedCommandChannel {
    pub fn new(state: RecorderState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl CommandChannel for SharedCommandChannel {
    fn read(&self) -> Result<RecorderState, ShiftlabError> {
        let state = self.state.lock().map_err(|_| ShiftlabError::StatePoisoned)?;
        Ok(*state)
    }

    fn write(&self, new: RecorderState) -> Result<(), ShiftlabError> {
        let mut state = self.state.lock().map_err(|_| ShiftlabError::StatePoisoned)?;
        *state = new;
        Ok(())
    }

    fn compare_and_set(
        &self,
        expected: RecorderState,
        new: RecorderState,
    ) -> Result<bool, ShiftlabError> {
        let mut state = self.state.lock().map_err(|_| ShiftlabError::StatePoisoned)?;
        if *state != expected {
            return Ok(false);
        }
        *state = new;
        Ok(true)
    }
}

/// Channel backed by a small text file holding the state string, used to
/// drive a recorder running in another process.
#[derive(Clone, Debug)]
pub struct StateFileChannel {
    path: PathBuf,
}

impl StateFileChannel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CommandChannel for StateFileChannel {
    /// A missing file reads as `IDLE`
    fn read(&self) -> Result<RecorderState, ShiftlabError> {
        if !self.path.exists() {
            return Ok(RecorderState::Idle);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| ShiftlabError::StateFileError { source: e })?;
        content.parse()
    }

    fn write(&self, state: RecorderState) -> Result<(), ShiftlabError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ShiftlabError::StateFileError { source: e })?;
        }
        // readers never see a half written value
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, state.to_string())
            .map_err(|e| ShiftlabError::StateFileError { source: e })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| ShiftlabError::StateFileError { source: e })
    }

    // Not atomic across processes: another writer can still slip in between the read and the rename.
    fn compare_and_set(
        &self,
        expected: RecorderState,
        new: RecorderState,
    ) -> Result<bool, ShiftlabError> {
        if self.read()? != expected {
            return Ok(false);
        }
        self.write(new)?;
        Ok(true)
    }
}

/// Operator command: arm the recorder for a run kind. Allowed from `IDLE` or `FINISHED`.
pub fn arm<C: CommandChannel + ?Sized>(
    channel: &C,
    kind: RunKind,
) -> Result<RecorderState, ShiftlabError> {
    loop {
        let current = channel.read()?;
        if !matches!(current, RecorderState::Idle | RecorderState::Finished) {
            return Err(ShiftlabError::InvalidStateTransition {
                command: format!("arm {}", kind),
                state: current.to_string(),
            });
        }
        let armed = RecorderState::Armed(kind);
        if channel.compare_and_set(current, armed)? {
            info!("Recorder armed for {}", kind);
            return Ok(armed);
        }
    }
}

/// Operator emergency stop: any armed or recording state goes to `FINISHED`,
/// other states are left alone. Returns the resulting state.
pub fn abort<C: CommandChannel + ?Sized>(channel: &C) -> Result<RecorderState, ShiftlabError> {
    loop {
        let current = channel.read()?;
        if !matches!(
            current,
            RecorderState::Armed(_) | RecorderState::Recording(_)
        ) {
            return Ok(current);
        }
        if channel.compare_and_set(current, RecorderState::Finished)? {
            info!("Recorder stopped by operator while {}", current);
            return Ok(RecorderState::Finished);
        }
    }
}

/// Operator acknowledgement of a finished run: `FINISHED` goes back to `IDLE`.
pub fn acknowledge<C: CommandChannel + ?Sized>(
    channel: &C,
) -> Result<RecorderState, ShiftlabError> {
    match channel.read()? {
        RecorderState::Idle => Ok(RecorderState::Idle),
        RecorderState::Finished => {
            if channel.compare_and_set(RecorderState::Finished, RecorderState::Idle)? {
                Ok(RecorderState::Idle)
            } else {
                channel.read()
            }
        }
        other => Err(ShiftlabError::InvalidStateTransition {
            command: "acknowledge".to_string(),
            state: other.to_string(),
        }),
    }
}

/// The run currently being written
struct ActiveRun {
    kind: RunKind,
    buffer: SampleBuffer,
    started_at: Instant,
    session_start_s: Option<f64>,
}

impl ActiveRun {
    fn run_id(&self) -> RunId {
        self.buffer.run_id()
    }

    /// Seconds since the trigger sample, from the simulator clock when available
    fn elapsed_s(&self, snapshot: &TelemetrySnapshot) -> f64 {
        match (self.session_start_s, snapshot.session_time_s) {
            (Some(start), Some(now)) => (now - start).max(0.),
            _ => self.started_at.elapsed().as_secs_f64(),
        }
    }
}

/// Polls a telemetry source and records runs according to the shared state.
pub struct Recorder<S, R, C> {
    source: S,
    store: R,
    channel: C,
    batch_size: usize,
    active: Option<ActiveRun>,
}

impl<S, R, C> Recorder<S, R, C>
where
    S: TelemetrySource,
    R: RunStore,
    C: CommandChannel,
{
    pub fn new(source: S, store: R, channel: C, batch_size: usize) -> Self {
        Self {
            source,
            store,
            channel,
            batch_size,
            active: None,
        }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    /// Id of the run being recorded, if any
    pub fn active_run(&self) -> Option<RunId> {
        self.active.as_ref().map(ActiveRun::run_id)
    }

    pub fn into_parts(self) -> (S, R, C) {
        (self.source, self.store, self.channel)
    }

    /// One polling step. Returns the state after the step.
    ///
    /// # Errors
    ///
    /// Fails when the state cannot be read or written, when a run header cannot
    /// be created (`RunOpenFailed`, the state moves to `FINISHED`) or when a run
    /// cannot be sealed (`RunSealFailed`). Batch write failures are not errors.
    pub fn poll(&mut self) -> Result<RecorderState, ShiftlabError> {
        let state = self.channel.read()?;
        let reading = self.read_source();

        match state {
            RecorderState::Idle | RecorderState::Finished => {
                // stopped or acknowledged by the operator since the last poll
                if let Some(active) = self.active.take() {
                    self.seal(active)?;
                }
                Ok(state)
            }
            RecorderState::Armed(kind) => {
                if let Some(active) = self.active.take() {
                    self.seal(active)?;
                }
                let Some(snapshot) = reading else {
                    return Ok(state);
                };
                let trigger = Sample::from_snapshot(&snapshot, 0.);
                if !kind.should_start(&trigger) {
                    return Ok(state);
                }
                self.start_recording(kind, &snapshot, trigger)
            }
            RecorderState::Recording(kind) => {
                let Some(active) = self.active.as_mut() else {
                    warn!("Recorder was {} with no open run, resetting", state);
                    self.channel.compare_and_set(state, RecorderState::Idle)?;
                    return self.channel.read();
                };
                let Some(snapshot) = reading else {
                    warn!("Telemetry lost during run {}, sealing", active.run_id());
                    return self.finish(state);
                };
                let sample = Sample::from_snapshot(&snapshot, active.elapsed_s(&snapshot));
                let stop = kind.should_stop(&sample);
                active.buffer.push(&mut self.store, sample);
                if stop {
                    debug!("Stop condition reached for {} run", kind);
                    return self.finish(state);
                }
                Ok(state)
            }
        }
    }

    /// Seal any open run and move the state to `FINISHED`
    pub fn shutdown(&mut self) -> Result<RecorderState, ShiftlabError> {
        let state = self.channel.read()?;
        match state {
            RecorderState::Recording(_) => self.finish(state),
            _ => {
                if let Some(active) = self.active.take() {
                    self.seal(active)?;
                }
                Ok(state)
            }
        }
    }

    fn read_source(&mut self) -> Option<TelemetrySnapshot> {
        if !self.source.is_active() || !self.source.is_on_track() {
            return None;
        }
        match self.source.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!("No telemetry this poll: {}", e);
                None
            }
        }
    }

    fn start_recording(
        &mut self,
        kind: RunKind,
        snapshot: &TelemetrySnapshot,
        trigger: Sample,
    ) -> Result<RecorderState, ShiftlabError> {
        let armed = RecorderState::Armed(kind);
        let session = self.source.session_info().unwrap_or_else(|e| {
            warn!("Session info unavailable, using defaults: {}", e);
            SessionInfo::default()
        });

        let run_id = match self.store.create_run(&session, kind) {
            Ok(run_id) => run_id,
            Err(e) => {
                error!("Could not create {} run: {}", kind, e);
                self.channel
                    .compare_and_set(armed, RecorderState::Finished)?;
                return Err(ShiftlabError::RunOpenFailed {
                    reason: e.to_string(),
                });
            }
        };

        let mut active = ActiveRun {
            kind,
            buffer: SampleBuffer::new(run_id, self.batch_size),
            started_at: Instant::now(),
            session_start_s: snapshot.session_time_s,
        };
        active.buffer.push(&mut self.store, trigger);

        if !self
            .channel
            .compare_and_set(armed, RecorderState::Recording(kind))?
        {
            info!("Operator changed state before run {} started", run_id);
            self.seal(active)?;
            return self.channel.read();
        }
        info!("Recording {} run {}", kind, run_id);
        self.active = Some(active);
        Ok(RecorderState::Recording(kind))
    }

    fn finish(&mut self, from: RecorderState) -> Result<RecorderState, ShiftlabError> {
        let moved = self
            .channel
            .compare_and_set(from, RecorderState::Finished)?;
        if let Some(active) = self.active.take() {
            self.seal(active)?;
        }
        if moved {
            Ok(RecorderState::Finished)
        } else {
            self.channel.read()
        }
    }

    fn seal(&mut self, mut active: ActiveRun) -> Result<(), ShiftlabError> {
        let run_id = active.run_id();
        active.buffer.flush(&mut self.store);
        if active.buffer.dropped() > 0 {
            warn!(
                "Run {} lost {} samples to failed writes",
                run_id,
                active.buffer.dropped()
            );
        }
        self.store
            .seal_run(run_id, active.buffer.written())
            .map_err(|e| ShiftlabError::RunSealFailed {
                run_id,
                reason: e.to_string(),
            })?;
        info!(
            "{} run {} finished with {} samples",
            active.kind,
            run_id,
            active.buffer.written()
        );
        Ok(())
    }
}

/// Options for [`run_recorder`]
#[derive(Clone, Copy, Debug)]
pub struct LoopOptions {
    pub poll_interval: Duration,
    /// Leave the loop once the source reports inactive (finite replays)
    pub exit_when_source_inactive: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            exit_when_source_inactive: false,
        }
    }
}

/// Poll until `shutdown` is raised, then seal any open run.
///
/// Errors from a single poll are logged and the loop keeps going, so a
/// failed run header does not stop the next run from being recorded.
pub fn run_recorder<S, R, C>(
    recorder: &mut Recorder<S, R, C>,
    options: LoopOptions,
    shutdown: &AtomicBool,
) -> Result<RecorderState, ShiftlabError>
where
    S: TelemetrySource,
    R: RunStore,
    C: CommandChannel,
{
    info!("Recorder loop started, polling every {:?}", options.poll_interval);
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = recorder.poll() {
            error!("Recorder poll failed: {}", e);
        }
        if options.exit_when_source_inactive && !recorder.source.is_active() {
            info!("Telemetry source finished");
            break;
        }
        thread::sleep(options.poll_interval);
    }
    recorder.shutdown()
}

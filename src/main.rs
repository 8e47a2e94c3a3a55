use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;

use shiftlab::analysis::cleaner::analyze_run_quality;
use shiftlab::analysis::comparison::{CompareOptions, compare_runs};
use shiftlab::analysis::gear_ratios::detect_gear_ratios;
use shiftlab::analysis::scoring::{RunPair, TrackProfile, performance_index};
use shiftlab::analysis::shift_points::analyze_shift_points;
use shiftlab::recorder::{self, CommandChannel, LoopOptions, StateFileChannel, run_recorder};
use shiftlab::telemetry::ReplayTelemetrySource;
use shiftlab::{
    AppConfig, FileRunStore, Recorder, RunId, RunKind, RunStore, ShiftlabError, VehicleClass,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Run store directory, overrides the config file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record runs from a replayed telemetry stream
    Record {
        #[arg(short, long)]
        replay: PathBuf,

        /// Arm the recorder before the loop starts
        #[arg(short, long)]
        arm: Option<RunKind>,

        /// Poll without pausing between replayed snapshots
        #[arg(long)]
        fast: bool,
    },
    /// Arm the recorder for drag, handling, quick-a or quick-b
    Arm { kind: RunKind },
    /// Abort the armed or running recording
    Stop,
    /// Acknowledge a finished run
    Ack,
    Status,
    Runs,
    Notes { run_id: u64, text: String },
    Delete { run_id: u64 },
    /// Trim and score a run
    Clean {
        run_id: u64,

        /// Include the cleaned samples in the output
        #[arg(long)]
        samples: bool,
    },
    /// Detect the gear ratios of a vehicle from all of its runs
    Gears { vehicle: String },
    /// Reconstruct the torque curve and solve the shift points of a run
    Shift {
        run_id: u64,

        #[arg(long, value_delimiter = ',')]
        ratios: Option<Vec<f64>>,

        #[arg(long)]
        final_drive: Option<f64>,

        #[arg(long)]
        class: Option<VehicleClass>,
    },
    /// Compare two runs head to head
    Compare {
        run_a: u64,
        run_b: u64,

        #[arg(long)]
        sync_speed: Option<f64>,

        /// Compare virtual best runs
        #[arg(long = "virtual")]
        virtual_run: bool,
    },
    /// Overall performance index of two vehicles
    Score {
        #[arg(long)]
        drag_a: u64,
        #[arg(long)]
        handling_a: u64,
        #[arg(long)]
        drag_b: u64,
        #[arg(long)]
        handling_b: u64,

        #[arg(long, default_value_t = TrackProfile::Balanced)]
        track: TrackProfile,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ShiftlabError> {
    let output =
        serde_json::to_string_pretty(value).map_err(|e| ShiftlabError::OutputError { source: e })?;
    println!("{}", output);
    Ok(())
}

fn record(
    config: &AppConfig,
    store: FileRunStore,
    replay: &Path,
    arm: Option<RunKind>,
    fast: bool,
) -> Result<(), ShiftlabError> {
    let source = ReplayTelemetrySource::from_file(replay)?;
    let channel = StateFileChannel::new(config.state_file());
    if let Some(kind) = arm {
        recorder::arm(&channel, kind)?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("Exiting...");
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not set Ctrl-C handler: {}", e);
    }

    let options = LoopOptions {
        poll_interval: if fast {
            Duration::ZERO
        } else {
            Duration::from_millis(config.poll_interval_ms)
        },
        exit_when_source_inactive: true,
    };
    let mut recorder = Recorder::new(source, store, channel, config.batch_size);
    let state = run_recorder(&mut recorder, options, &shutdown)?;
    let runs = recorder.store().list_runs()?;
    print_json(&json!({
        "state": state.to_string(),
        "latest_run": runs.first(),
    }))
}

fn run(args: Args) -> Result<(), ShiftlabError> {
    let mut config = AppConfig::from_local_file().unwrap_or_default();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    let mut store = FileRunStore::new(config.data_dir.clone())?;
    let channel = StateFileChannel::new(config.state_file());

    match args.command {
        Commands::Record { replay, arm, fast } => record(&config, store, &replay, arm, fast),
        Commands::Arm { kind } => print_json(&recorder::arm(&channel, kind)?.to_string()),
        Commands::Stop => print_json(&recorder::abort(&channel)?.to_string()),
        Commands::Ack => print_json(&recorder::acknowledge(&channel)?.to_string()),
        Commands::Status => print_json(&channel.read()?.to_string()),
        Commands::Runs => print_json(&store.list_runs()?),
        Commands::Notes { run_id, text } => {
            store.update_notes(RunId(run_id), &text)?;
            print_json(&store.require_run(RunId(run_id))?.header)
        }
        Commands::Delete { run_id } => {
            store.delete_run(RunId(run_id))?;
            info!("Deleted run {}", run_id);
            Ok(())
        }
        Commands::Clean { run_id, samples } => {
            let run = store.require_run(RunId(run_id))?;
            let mut quality = analyze_run_quality(&run.samples);
            let cleaned_samples = quality.cleaned.len();
            if !samples {
                quality.cleaned.clear();
            }
            print_json(&json!({
                "run_id": run.header.id,
                "raw_samples": run.samples.len(),
                "cleaned_samples": cleaned_samples,
                "quality": quality,
            }))
        }
        Commands::Gears { vehicle } => print_json(&detect_gear_ratios(&mut store, &vehicle)?),
        Commands::Shift {
            run_id,
            ratios,
            final_drive,
            class,
        } => {
            let run_id = RunId(run_id);
            let class = match class {
                Some(class) => class,
                None => VehicleClass::guess_from_vehicle_name(
                    &store.require_run(run_id)?.header.vehicle_name,
                ),
            };
            let analysis = analyze_shift_points(
                &mut store,
                run_id,
                ratios,
                final_drive.unwrap_or(config.default_final_drive),
                &class.params(),
            )?;
            print_json(&analysis)
        }
        Commands::Compare {
            run_a,
            run_b,
            sync_speed,
            virtual_run,
        } => {
            let options = CompareOptions {
                sync_speed_kmh: sync_speed.unwrap_or(config.sync_speed_kmh),
                target_speeds_kmh: config.kpi_target_speeds_kmh.clone(),
                virtual_run,
                virtual_shift_delay_s: config.virtual_shift_delay_s,
            };
            print_json(&compare_runs(&store, RunId(run_a), RunId(run_b), &options)?)
        }
        Commands::Score {
            drag_a,
            handling_a,
            drag_b,
            handling_b,
            track,
        } => {
            let a = RunPair {
                drag: RunId(drag_a),
                handling: RunId(handling_a),
            };
            let b = RunPair {
                drag: RunId(drag_b),
                handling: RunId(handling_b),
            };
            print_json(&performance_index(&store, a, b, track)?)
        }
    }
}

fn main() {
    colog::init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

use std::{path::PathBuf, process};

use structopt::StructOpt;
use tracing_subscriber::*;

use fedsim_simulator::{
    inference::{self, WeightSource},
    model::ModelRegistry,
    roster::{DataConfig, Roster},
    settings::Settings,
    state_machine::SimulationInitializer,
    storage::CheckpointName,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedsim", about = "A single-process federated-learning simulator")]
enum Opt {
    /// Runs a federated simulation according to a plan
    Simulate {
        /// Path of the federation plan
        #[structopt(short, long, parse(from_os_str))]
        plan: PathBuf,
        /// Path of the collaborator roster
        #[structopt(short, long, parse(from_os_str))]
        roster: PathBuf,
        /// Path of the per-collaborator data configuration
        #[structopt(short, long, parse(from_os_str))]
        data: PathBuf,
    },
    /// Runs inference against checkpointed or native weights
    Infer {
        /// Path of the federation plan
        #[structopt(short, long, parse(from_os_str))]
        plan: PathBuf,
        /// Path of the per-collaborator data configuration
        #[structopt(short, long, parse(from_os_str))]
        data: PathBuf,
        /// The collaborator whose local data is scored
        #[structopt(short, long)]
        collaborator: String,
        /// The checkpoint to load: init, best or latest
        #[structopt(long, conflicts_with = "native-weights")]
        checkpoint: Option<CheckpointName>,
        /// A model-native weights file to load instead of a checkpoint
        #[structopt(long, parse(from_os_str))]
        native_weights: Option<PathBuf>,
    },
}

fn main() {
    match Opt::from_args() {
        Opt::Simulate { plan, roster, data } => simulate(plan, roster, data),
        Opt::Infer {
            plan,
            data,
            collaborator,
            checkpoint,
            native_weights,
        } => infer(plan, data, collaborator, checkpoint, native_weights),
    }
}

fn load_settings(plan: PathBuf) -> Settings {
    let settings = Settings::new(plan).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(settings.log.to_filter())
        .with_ansi(true)
        .init();
    settings
}

fn simulate(plan: PathBuf, roster: PathBuf, data: PathBuf) {
    let settings = load_settings(plan);
    let roster = Roster::load(roster).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let data = DataConfig::load(data).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let (state_machine, _stop) =
        SimulationInitializer::new(settings, roster, data, ModelRegistry::default())
            .init()
            .unwrap_or_else(|err| {
                eprintln!("{}", err);
                process::exit(1);
            });

    match state_machine.run() {
        Ok(report) => {
            info!(
                rounds_completed = report.rounds_completed,
                best_score = ?report.best_score,
                "simulation complete"
            );
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}

fn infer(
    plan: PathBuf,
    data: PathBuf,
    collaborator: String,
    checkpoint: Option<CheckpointName>,
    native_weights: Option<PathBuf>,
) {
    // resolved before the plan gate and before any data is read
    let source = WeightSource::from_args(checkpoint, native_weights).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let settings = load_settings(plan);
    let data = DataConfig::load(data).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let collaborator_data = data.get(&collaborator).unwrap_or_else(|| {
        eprintln!("no data configured for collaborator {}", collaborator);
        process::exit(1);
    });

    match inference::run(&settings, collaborator_data, &ModelRegistry::default(), source) {
        Ok(outputs) => println!("{}", outputs),
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}

use std::{
    path::PathBuf,
    process,
    time::{Duration, Instant},
};

use structopt::StructOpt;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::*;

use fedavg_server::{
    coordinator::{CoordinatorService, RoundCoordinator, ServerRunState},
    model::Model,
    settings::{ModelSettings, Settings},
    storage::{FsModelStorage, StorageResult},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        protocol: protocol_settings,
        round: round_settings,
        model: model_settings,
        storage: storage_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let initial_model = initial_model(&model_settings).await.unwrap_or_else(|err| {
        error!("failed to load the initial model: {:#}", err);
        process::exit(1);
    });
    let storage = FsModelStorage::new(&storage_settings.dir)
        .await
        .unwrap_or_else(|err| {
            error!("failed to initialize storage: {:#}", err);
            process::exit(1);
        });
    let listener = TcpListener::bind(api_settings.bind_address)
        .await
        .unwrap_or_else(|err| {
            error!("failed to bind {}: {}", api_settings.bind_address, err);
            process::exit(1);
        });
    info!("listening on {}", api_settings.bind_address);

    let service = CoordinatorService::new(
        listener,
        storage,
        RoundCoordinator::new(round_settings, initial_model),
        protocol_settings.codec(),
        storage_settings.run_id,
    );

    let started = Instant::now();
    tokio::select! {
        result = service.run() => match result {
            Ok(run) => info!("done: {}", summary(&run, started.elapsed())),
            Err(err) => {
                error!("shutting down: {}", err);
                process::exit(1);
            }
        },
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }
}

/// Loads the configured initial model, or creates a model of zeros.
async fn initial_model(settings: &ModelSettings) -> StorageResult<Model> {
    let path = match &settings.initial_path {
        Some(path) => path,
        None => return Ok(Model::zeros(settings.length)),
    };
    let model = FsModelStorage::read_model(path).await?;
    model.check_len(settings.length)?;
    info!("restored the initial model from {}", path.display());
    Ok(model)
}

/// Describes a finished run.
fn summary(run: &ServerRunState, elapsed: Duration) -> String {
    format!(
        "{} of {} rounds completed in {:.3}s",
        run.rounds_completed,
        run.rounds_configured,
        elapsed.as_secs_f64()
    )
}

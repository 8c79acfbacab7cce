//! CLI entry point for the simulated camera IOC.
//!
//! Wires the pieces together in startup order: tracing, configuration,
//! catalog, parameter store, snapshot restore, the periodic snapshot task,
//! and finally the acquisition loop. Runs until ctrl-c or a `SYSRESET`
//! write clears the run flag, then shuts the background tasks down in
//! reverse order so the final parameter state is persisted.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use camsim::catalog;
use camsim::config::SimConfig;
use camsim::driver::{CameraDriver, ConfigCallback};
use camsim::error::CamError;
use camsim::snapshot::SnapshotStore;
use camsim::store::ParameterStore;
use camsim::timing::TimestampListener;

#[derive(Parser)]
#[command(name = "camsim")]
#[command(about = "Simulated camera IOC for DAQ timing-system testing", long_about = None)]
struct Cli {
    /// The camera model to simulate (Opal1k, Pulnix, Visar)
    camera_type: String,

    /// The parameter prefix for this IOC instance
    prefix: String,

    /// The DAQ platform [0-4]
    #[arg(short, long, default_value_t = 0)]
    platform: u8,

    /// The DAQ readout group [0-7]
    #[arg(short, long, default_value_t = 0)]
    readout: u8,

    /// Interface address to bind the receiving socket to
    #[arg(short, long)]
    interface: Option<Ipv4Addr>,

    /// Instance name, used to derive the snapshot directory
    #[arg(short, long)]
    name: Option<String>,

    /// Root directory for named-instance snapshot data
    #[arg(long, default_value = ".")]
    snapshot_root: PathBuf,

    /// Number of snapshot files to keep
    #[arg(long, default_value_t = camsim::snapshot::DEFAULT_RETENTION)]
    retention: usize,

    /// Seconds between periodic snapshots
    #[arg(long, default_value_t = 5.0)]
    save_interval: f64,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level)?)
        .init();

    let config = SimConfig {
        interface: cli.interface,
        instance: cli.name.clone(),
        platform: cli.platform,
        readout_group: cli.readout,
        snapshot_root: cli.snapshot_root.clone(),
        retention: cli.retention,
        save_interval: Duration::from_secs_f64(cli.save_interval.max(0.0)),
        ..SimConfig::new(cli.camera_type.clone(), &cli.prefix)
    };
    config.validate()?;

    run_ioc(config).await
}

async fn run_ioc(config: SimConfig) -> Result<()> {
    let model = catalog::camera_model(&config.model)
        .ok_or_else(|| CamError::UnknownModel(config.model.clone()))?;
    info!(model = %config.model, "camera server starting, abort with ctrl-c");

    let store = Arc::new(ParameterStore::from_catalog(catalog::full_catalog(
        &model,
        config.platform,
        config.readout_group,
    )));

    let snapshot_dir = SnapshotStore::directory_for(
        &config.snapshot_root,
        config.instance.as_deref(),
        &config.prefix,
    );
    let snapshots = Arc::new(SnapshotStore::new(
        store.clone(),
        snapshot_dir,
        config.retention,
    )?);
    if !snapshots.restore().await {
        info!("starting from catalog defaults");
    }
    if let Err(err) = snapshots.write_param_list(&config.prefix) {
        warn!(%err, "could not write the parameter listing");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let snapshot_task = tokio::spawn(snapshots.clone().run(config.save_interval, shutdown_rx));

    let config_op: ConfigCallback = Arc::new(|values| {
        info!(?values, "camera configured");
        Ok(())
    });
    let listener = TimestampListener::new(config.platform, config.readout_group, config.interface);
    let driver = Arc::new(CameraDriver::new(
        store,
        listener,
        model.pixel_kind(),
        Some(config_op),
    ));

    let mut acquisition = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.acquire().await })
    };

    let mut failure = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("camera server stopped by console interrupt");
            driver.request_stop();
            failure = join_acquisition(&mut acquisition).await;
        }
        joined = &mut acquisition => {
            failure = report_acquisition(joined);
        }
    }

    // Final autosave, then wait for the snapshot task to fully exit.
    let _ = shutdown_tx.send(true);
    if let Err(err) = snapshot_task.await {
        error!(%err, "snapshot task did not exit cleanly");
    }

    match failure {
        Some(err) => Err(err.into()),
        None => {
            info!(
                frames = driver.frames_produced(),
                "camera server exited normally"
            );
            Ok(())
        }
    }
}

async fn join_acquisition(
    task: &mut tokio::task::JoinHandle<Result<(), CamError>>,
) -> Option<CamError> {
    report_acquisition(task.await)
}

fn report_acquisition(
    joined: Result<Result<(), CamError>, tokio::task::JoinError>,
) -> Option<CamError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            error!(%err, "acquisition ended with an error");
            Some(err)
        }
        Err(err) => {
            error!(%err, "acquisition task did not exit cleanly");
            None
        }
    }
}

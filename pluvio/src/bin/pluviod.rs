use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::runtime::Builder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

use pluvio::config::{Config, Telemetry};
use pluvio::cycle::{Schema, Station};
use pluvio::gauge::RainGauge;
use pluvio::gpio::Monitor;
use pluvio::reconcile::Reconciler;
use pluvio::store::rrd::RrdTool;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] pluvio::config::Error),
    #[error("reset boundary error: {0}")]
    Reconcile(#[from] pluvio::reconcile::Error),
    #[error("measurement cycle error: {0}")]
    Cycle(#[from] pluvio::cycle::Error),
    #[error("GPIO monitor error: {0}")]
    Gpio(#[from] pluvio::gpio::Error),
    #[error("failed to install Prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("GPIO monitor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> String {
    "/etc/pluvio/pluvio.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about = "Rain-gauge acquisition station", long_about = None)]
struct Opts {
    /// Path to the station configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// Validate the configuration and exit without acquiring
    #[clap(long, action)]
    check_config: bool,
}

async fn inner_main(config: Config) -> Result<(), Error> {
    if let Some(Telemetry { prometheus_addr }) = config.telemetry {
        info!(addr = %prometheus_addr, "exposing Prometheus metrics");
        PrometheusBuilder::new()
            .with_http_listener(prometheus_addr)
            .install()?;
    }

    let (watcher, broadcaster) = pluvio_signal::signal();
    {
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("received ctrl-c, shutting down"),
                Err(err) => error!(err = %err, "could not listen for ctrl-c, shutting down"),
            }
            if let Err(err) = broadcaster.signal() {
                warn!(err = %err, "no tasks were left to stop");
            }
        });
    }

    let gauge = Arc::new(RainGauge::new(config.gauge.debounce_holdoff_micros));
    let monitor = Monitor::new(
        config.gpio.daemon_addr.clone(),
        config.gpio.pin,
        config.gpio.edge,
        Arc::clone(&gauge),
        watcher.clone(),
    )?;
    let store = RrdTool::new(
        config.store.rrdtool_binary.clone(),
        config.store.rrd_file.clone(),
        config.store.timeout_secs.map(Duration::from_secs),
    );
    let schema = Schema {
        rate_field: config.store.rate_field.clone(),
        total_field: config.store.total_field.clone(),
        data_sources: config.store.data_sources.clone(),
    };
    let station = Station::new(
        store,
        gauge,
        Reconciler::new(config.gauge.millimeters_per_tick, config.tolerance),
        config.reset_boundary()?,
        schema,
        watcher,
    );

    let mut monitor_handle = tokio::spawn(monitor.spin());

    tokio::select! {
        res = station.spin() => {
            // The loop ended, cleanly or fatally; wind the monitor down
            // either way.
            let _ = broadcaster.signal();
            match monitor_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(err = %err, "GPIO monitor exited with error during shutdown"),
                Err(err) => warn!(err = %err, "GPIO monitor task failed during shutdown"),
            }
            res?;
        }
        res = &mut monitor_handle => {
            // Without the monitor no ticks can arrive; stop the station.
            let _ = broadcaster.signal();
            res??;
        }
    }
    Ok(())
}

fn run(opts: &Opts) -> Result<(), Error> {
    let config = Config::load(Path::new(&opts.config_path))?;
    if opts.check_config {
        info!(path = %opts.config_path, "configuration OK");
        return Ok(());
    }

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(config))
}

fn main() {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .init();

    let opts = Opts::parse();
    info!("pluviod starting");
    if let Err(err) = run(&opts) {
        error!(err = %err, "pluviod exiting on fatal error");
        std::process::exit(1);
    }
    info!("pluviod finished");
}

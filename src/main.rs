use cert_expiry_exporter::config::{Config, LogFormat, Settings, DEFAULT_CONFIG_FILE};
use cert_expiry_exporter::{
    metrics, ExpiryGaugeStore, ExporterError, Scheduler, SchedulerOptions, TlsSniffer,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Publishes the remaining lifetime of TLS certificates as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "cert-expiry-exporter", version, about, long_about = None)]
struct Cli {
    /// Endpoint to probe as host:port; repeat for several
    #[arg(short = 't', long = "target", value_name = "HOST:PORT")]
    targets: Vec<String>,

    /// Configuration file (defaults to ./cert-expiry-exporter.toml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address the metrics endpoint listens on
    #[arg(long, value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// HTTP path of the metrics endpoint
    #[arg(long, value_name = "PATH")]
    metrics_path: Option<String>,

    /// Pause between probe cycles
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Connect and handshake timeout per endpoint
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Endpoints probed at once
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Drop a certificate series after this many successful probes without it
    #[arg(long, value_name = "CYCLES")]
    stale_after_cycles: Option<u64>,

    /// Log format
    #[arg(long, value_parser = ["text", "json"])]
    log_format: Option<String>,

    /// Probe every endpoint once, print the observations as JSON and exit
    #[arg(long)]
    once: bool,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn to_config(&self) -> Config {
        Config {
            targets: if self.targets.is_empty() {
                None
            } else {
                Some(self.targets.clone())
            },
            listen_address: self.listen_address.clone(),
            metrics_path: self.metrics_path.clone(),
            interval_seconds: self.interval,
            timeout_seconds: self.timeout,
            concurrency: self.concurrency,
            stale_after_cycles: self.stale_after_cycles,
            log_format: self.log_format.clone(),
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings, ExporterError> {
    let file_config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Config::from_file(DEFAULT_CONFIG_FILE)?,
        None => Config::default(),
    };

    let settings = Config::defaults()
        .merge_with(file_config)
        .merge_with(cli.to_config())
        .resolve()?;
    Ok(settings)
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::example_toml());
        return ExitCode::SUCCESS;
    }

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(settings.log_format);

    match run(settings, cli.once).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exporter stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings, once: bool) -> Result<(), ExporterError> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting certificate expiry exporter");

    let store = Arc::new(ExpiryGaugeStore::new(settings.stale_after_cycles)?);
    let sniffer = Arc::new(TlsSniffer::new(settings.timeout)?);
    let mut scheduler = Scheduler::new(
        settings.targets.clone(),
        sniffer,
        Arc::clone(&store),
        SchedulerOptions::from(&settings),
    );

    if once {
        let report = scheduler.run_cycle().await;
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!(error = %e, "failed to render report"),
        }
        return Ok(());
    }

    let listener = metrics::bind(&settings.listen_address).await?;
    let router = metrics::router(Arc::clone(&store), &settings.metrics_path);

    let cancel = CancellationToken::new();
    let probing = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let served = metrics::serve(listener, router, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = probing.await {
        warn!(error = %e, "probe scheduler task ended abnormally");
    }

    info!("shutdown complete");
    served
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => return,
    }

    info!("shutdown signal received");
    cancel.cancel();
}

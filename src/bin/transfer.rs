use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use metric_transfer::{
    app::{App, AppError},
    config::Config,
    stats,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CONFIG: u8 = 1;
const EXIT_DRAIN_DEADLINE: u8 = 2;
const EXIT_BIND: u8 = 3;

#[derive(Debug, Clone, Parser)]
#[command(disable_version_flag = true)]
struct Args {
    /// Config file; defaults to the first of etc/transfer.{local.toml,toml,local.json,json}
    #[arg(short)]
    file: Option<PathBuf>,

    /// Print version and exit
    #[arg(short)]
    version: bool,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![("metric_transfer", level), ("transfer", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if args.version {
        println!("transfer {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let _ = dotenv::dotenv();

    let (config, path) = match Config::load(args.file.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("transfer: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init(config.logging.level_filter());
    trace!("started with args: {args:?}");
    info!("using config {}", path.display());

    let app = match App::start(config).await {
        Ok(app) => app,
        Err(e @ AppError::Bind { .. }) => {
            error!("{e}");
            return ExitCode::from(EXIT_BIND);
        }
        Err(e) => {
            error!("startup failed: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = wait_for_signals(&app, &path).await {
        error!("signal handling failed: {e:#}");
    }

    if app.shutdown().await {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_DRAIN_DEADLINE)
    }
}

/// Reload on SIGHUP; return on SIGINT or SIGTERM
async fn wait_for_signals(app: &App, path: &Path) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => reload(app, path).await,
            _ = terminate.recv() => {
                info!("received SIGTERM");
                return Ok(());
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("received SIGINT");
                return Ok(());
            }
        }
    }
}

async fn reload(app: &App, path: &Path) {
    info!("reloading {}", path.display());
    let result = match Config::load(Some(path)) {
        Ok((config, _)) => app.reload(&config).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        app.stats().incr(stats::CONFIG_RELOAD_ERR);
        warn!("reload failed, keeping the running configuration: {e:#}");
    }
}

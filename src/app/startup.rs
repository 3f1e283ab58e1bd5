//! Binary entry point: configuration, logging and the report loop

use clap::Parser;
use serde::Serialize;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use super::cli::args::Args;
use super::cli::config::Config;
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::init_logging;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::version;
use crate::plugin::api::{PluginResult, Registry, Reporter};
use crate::report::Report;

/// Exit status for configuration problems
const CONFIG_EXIT_STATUS: i32 = 2;

/// One line of output
#[derive(Serialize)]
struct ReportLine<'a> {
    timestamp: String,
    source: &'a str,
    report: &'a Report,
}

/// Initialize application startup
pub fn startup() {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    let status = runtime.block_on(run(args));
    drop(runtime);
    std::process::exit(status);
}

async fn run(args: Args) -> i32 {
    let loaded = Config::load(&args).await;

    // Log with whatever settings we have, so configuration errors are
    // reported the same way as everything else.
    let (level, format, file, color) = match &loaded {
        Ok(config) => (
            config.log_level.clone(),
            config.log_format.clone(),
            config.log_file.clone(),
            config.color,
        ),
        Err(_) => (
            args.log_level.clone(),
            args.log_format.clone(),
            args.log_file.clone(),
            args.color_choice(),
        ),
    };
    let use_color = color.unwrap_or_else(|| std::io::stderr().is_terminal());
    let file = file.as_ref().map(|p| p.to_string_lossy().into_owned());
    if let Err(e) = init_logging(level.as_deref(), format.as_deref(), file.as_deref(), use_color) {
        eprintln!("Error: cannot initialise logging: {}", e);
        return 1;
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log_error_with_context(&e, "Loading configuration");
            return CONFIG_EXIT_STATUS;
        }
    };

    log::info!(
        "plugwatch {} ({} built {}) watching {} for protocol version {}",
        env!("CARGO_PKG_VERSION"),
        version::git_hash(),
        version::build_time(),
        config.root.display(),
        config.api_version
    );
    log::debug!("configuration: {:?}", config);

    match ShutdownCoordinator::guard(|shutdown| serve(config, shutdown)).await {
        Ok(()) => 0,
        Err(e) => {
            log_error_with_context(&e, "Starting plugin registry");
            1
        }
    }
}

async fn serve(config: Config, mut shutdown: broadcast::Receiver<()>) -> PluginResult<()> {
    let registry = Arc::new(Registry::new(config.registry_config()).await?);
    let reporter = Reporter::new(registry.clone());

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate; skip it so plugins get one interval to
    // handshake before the first round.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                emit(&reporter).await;
                if config.once {
                    break;
                }
            }
        }
    }

    registry.close().await;
    Ok(())
}

async fn emit(reporter: &Reporter) {
    let report = reporter.report().await;
    let line = ReportLine {
        timestamp: chrono::Utc::now().to_rfc3339(),
        source: reporter.name(),
        report: &report,
    };
    match serde_json::to_string(&line) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("cannot encode report: {}", e),
    }
}

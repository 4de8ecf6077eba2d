use std::process::ExitCode;

use clap::Parser;
use plantwire_daemon::{admin, cli::Cli};
use plantwire_infra::{PlantRuntime, PlantwireConfig, load_catalog};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("plantwire: {e:#}");
            return ExitCode::from(2);
        }
    };
    plantwire_observability::init(config.logging.format, &config.logging.filter);

    if cli.check_config {
        return check(&config).await;
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "daemon failed");
            ExitCode::from(1)
        }
    }
}

async fn check(config: &PlantwireConfig) -> ExitCode {
    match load_catalog(&config.catalog).await {
        Ok(catalog) => {
            info!(
                machines = catalog.machine_count(),
                sensors = catalog.sensor_count(),
                "configuration and catalog are valid"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "catalog is invalid");
            ExitCode::from(2)
        }
    }
}

async fn run(config: PlantwireConfig) -> anyhow::Result<ExitCode> {
    let mut runtime = match PlantRuntime::start(&config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "startup failed");
            return Ok(ExitCode::from(e.exit_code()));
        }
    };

    let admin = if config.admin.enabled {
        Some(admin::serve(config.admin_addr()?, runtime.handle()).await?)
    } else {
        None
    };

    let code = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested");
            ExitCode::SUCCESS
        }
        fatal = runtime.fatal() => match fatal {
            Some(e) => {
                error!(error = %e, "fatal supervisor error");
                ExitCode::from(3)
            }
            None => ExitCode::from(1),
        },
    };

    if let Some(admin) = admin {
        admin.shutdown().await;
    }
    let report = runtime.shutdown().await;
    if !report.abandoned_workers.is_empty() {
        error!(workers = ?report.abandoned_workers, "workers abandoned at shutdown");
    }
    Ok(code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

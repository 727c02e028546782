//! Process entry point for harbor services.
//!
//! Startup sequence:
//! 1. Let the application customise the [`Bootstrap`].
//! 2. Load and validate the configuration (file, environment, `-D`).
//! 3. For `check`, stop here.
//! 4. Initialise the telemetry pipeline (tracing + OTEL).
//! 5. Build the [`Environment`] with the built-in `log-level` task.
//! 6. Run the application so it registers routes and resources.
//! 7. Assemble listeners, dispatch chain and worker pool.
//! 8. Start everything in registration order. If that fails, stop what is
//!    left and exit with the start error.
//! 9. Wait for Ctrl-C or SIGTERM.
//! 10. Stop everything in reverse order.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use crate::admin::LogLevelTask;
use crate::application::{Application, Bootstrap};
use crate::cli::{Cli, Command};
use crate::config::Configuration;
use crate::environment::Environment;
use crate::lifecycle::{LifecycleError, LifecycleRegistry};
use crate::telemetry;

/// Parse the process arguments and run `application`.
///
/// # Errors
///
/// Configuration, telemetry, startup and shutdown failures.
pub async fn run<C, A>(application: A) -> Result<()>
where
    C: Configuration,
    A: Application<C>,
{
    run_server(application, Cli::parse()).await
}

/// Run `application` as directed by `cli`.
///
/// # Errors
///
/// See [`run`].
pub async fn run_server<C, A>(application: A, cli: Cli) -> Result<()>
where
    C: Configuration,
    A: Application<C>,
{
    // -----------------------------------------------------------------------
    // 1. Bootstrap
    // -----------------------------------------------------------------------
    let mut bootstrap = Bootstrap::<C>::new();
    application.initialize(&mut bootstrap);

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let args = cli.command.config_args();
    let factory = bootstrap.configuration_factory();
    let loaded = match &args.file {
        Some(path) => factory.build_from_file(path, &args.overrides),
        None => factory.build_default(&args.overrides),
    };
    let config = loaded.map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 3. Check only
    // -----------------------------------------------------------------------
    if let Command::Check(_) = cli.command {
        println!("configuration is valid");
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 4. Telemetry
    // -----------------------------------------------------------------------
    let filter = telemetry::init_telemetry(application.name(), config.logging())?;
    info!(
        service = application.name(),
        version = env!("CARGO_PKG_VERSION"),
        "starting"
    );

    // -----------------------------------------------------------------------
    // 5. Environment
    // -----------------------------------------------------------------------
    let mut environment = Environment::new(application.name());
    environment
        .admin_mut()
        .register_task(Arc::new(LogLevelTask::new(filter, config.logging())));

    // -----------------------------------------------------------------------
    // 6. Application
    // -----------------------------------------------------------------------
    application
        .run(&config, &mut environment)
        .await
        .with_context(|| format!("{} failed to initialise", application.name()))?;

    // -----------------------------------------------------------------------
    // 7. Assembly
    // -----------------------------------------------------------------------
    let _server = environment
        .assemble(config.server(), bootstrap.connectors())
        .context("failed to assemble the server")?;

    // -----------------------------------------------------------------------
    // 8. Start
    // -----------------------------------------------------------------------
    if let Err(e) = start_or_clean_up(environment.lifecycle_mut()).await {
        telemetry::shutdown_telemetry();
        return Err(e.into());
    }

    // -----------------------------------------------------------------------
    // 9. Wait
    // -----------------------------------------------------------------------
    shutdown_signal().await?;

    // -----------------------------------------------------------------------
    // 10. Stop
    // -----------------------------------------------------------------------
    let stopped = environment.lifecycle_mut().stop().await;
    match &stopped {
        Ok(()) => info!("stopped"),
        Err(e) => error!(error = %format!("{e:#}"), "shutdown failed"),
    }
    telemetry::shutdown_telemetry();
    stopped.map_err(Into::into)
}

/// Start `lifecycle`. On failure, stop whatever is left so the failed
/// resource gets its cleanup, then return the start error.
async fn start_or_clean_up(lifecycle: &mut LifecycleRegistry) -> Result<(), LifecycleError> {
    let Err(e) = lifecycle.start().await else {
        return Ok(());
    };
    error!(error = %format!("{e:#}"), "startup failed");
    if let Err(stop) = lifecycle.stop().await {
        error!(error = %format!("{stop:#}"), "cleanup after failed startup failed");
    }
    Err(e)
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.context("failed to listen for Ctrl-C")?;
            info!("received Ctrl-C, shutting down");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
    Ok(())
}

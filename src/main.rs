//! Process bootstrap (spec.md §6): load config, wire up registries,
//! tenants and the HTTP router, serve until a shutdown signal arrives,
//! exit cleanly (0) or report what failed (non-zero). `anyhow` is used
//! only here, at the process edge — everywhere inside the gateway itself
//! errors are the typed `ApiError` (SPEC_FULL.md §2.2).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};

use polygate::config::Config;

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("POLY_CONFIG_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"))
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        polygate::config::load(path)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("loading config from '{}'", path.display()))
    } else {
        tracing::warn!(path = %path.display(), "config file not found, starting with defaults");
        Ok(Config::default())
    }
}

async fn run(config: Config) -> Result<()> {
    let (_state, router) = polygate::server::bootstrap(&config)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("bootstrapping gateway")?;

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "polygate listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(polygate::server::shutdown_signal())
        .await
        .context("serving")?;

    tracing::info!("polygate shut down cleanly");
    Ok(())
}

fn main() -> ExitCode {
    polygate::logging::init();

    let path = config_path();
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "failed to start");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start: could not build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "failed to start");
            ExitCode::FAILURE
        }
    }
}

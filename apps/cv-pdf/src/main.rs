use std::process::ExitCode;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cv_pdf::browser::ChromiumLauncher;
use cv_pdf::config::Config;
use cv_pdf::export::{ExportSettings, Exporter};
use cv_pdf::server::CommandServer;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load configuration first; invalid values abort before anything is spawned
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("cv_pdf={}", &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cv-pdf v{}", env!("CARGO_PKG_VERSION"));

    let exporter = Exporter::new(
        CommandServer::new(&config),
        ChromiumLauncher::new(&config),
        ExportSettings::from_config(&config),
    );

    // Server and browser are released inside `run` on every path, so returning
    // is enough for the process to exit.
    match exporter.run().await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

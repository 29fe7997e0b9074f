//! PDF export workflow.
//!
//! Flow: prepare output → start preview server → stabilization delay →
//!       launch browser → capture PDF → close browser → stop server.
//!
//! The server handle and browser session are owned here for the whole run and
//! released on every exit path. Failures are never retried.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::browser::{BrowserLauncher, BrowserSession, PdfOptions};
use crate::config::Config;
use crate::errors::ExportError;
use crate::server::{PreviewServer, ServerHandle};

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub output_path: PathBuf,
    pub page_url: String,
    pub stabilization_delay: Duration,
    pub pdf: PdfOptions,
}

impl ExportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_path: config.output_path.clone(),
            page_url: config.page_url(),
            stabilization_delay: config.stabilization_delay,
            pdf: PdfOptions::default(),
        }
    }
}

pub struct Exporter<S, B> {
    server: S,
    browser: B,
    settings: ExportSettings,
}

impl<S: PreviewServer, B: BrowserLauncher> Exporter<S, B> {
    pub fn new(server: S, browser: B, settings: ExportSettings) -> Self {
        Self {
            server,
            browser,
            settings,
        }
    }

    /// Runs the whole workflow once and returns the written PDF path.
    pub async fn run(&self) -> Result<PathBuf, ExportError> {
        let mut server: Option<Box<dyn ServerHandle>> = None;
        let mut browser: Option<Box<dyn BrowserSession>> = None;

        let outcome = self.run_phases(&mut server, &mut browser).await;
        if let Err(e) = &outcome {
            error!("Error generating PDF: {e}");
        }

        // Close failures here are swallowed so they cannot mask the primary outcome.
        if let Some(mut session) = browser.take() {
            let _ = session.close().await;
        }
        if let Some(mut handle) = server.take() {
            handle.stop().await;
        }

        outcome
    }

    async fn run_phases(
        &self,
        server: &mut Option<Box<dyn ServerHandle>>,
        browser: &mut Option<Box<dyn BrowserSession>>,
    ) -> Result<PathBuf, ExportError> {
        let output = &self.settings.output_path;
        prepare_output(output).await?;

        *server = Some(self.server.start().await?);

        let delay = self.settings.stabilization_delay;
        if !delay.is_zero() {
            debug!("Waiting {}ms for the server to settle", delay.as_millis());
            tokio::time::sleep(delay).await;
        }

        info!("Launching browser...");
        let session = browser.insert(self.browser.launch().await?);

        info!("Navigating to {}", self.settings.page_url);
        let pdf = session
            .capture_pdf(&self.settings.page_url, &self.settings.pdf)
            .await?;

        write_pdf(output, pdf).await?;
        info!("PDF generated successfully: {}", output.display());

        if let Some(mut session) = browser.take() {
            session.close().await?;
        }

        Ok(output.clone())
    }
}

/// Creates the output directory and removes a stale PDF, so a failed run
/// leaves nothing at the output path.
async fn prepare_output(path: &Path) -> Result<(), ExportError> {
    if let Some(dir) = parent_dir(path) {
        tokio::fs::create_dir_all(dir).await?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed stale {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Writes the document through a temp file in the same directory, then
/// renames it over `path`. Readers never observe a partial PDF.
async fn write_pdf(path: &Path, pdf: Vec<u8>) -> Result<(), ExportError> {
    if pdf.is_empty() {
        return Err(ExportError::Capture(
            "browser returned an empty document".to_string(),
        ));
    }

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = parent_dir(&path).unwrap_or(Path::new("."));
        let mut file = tempfile::Builder::new()
            .prefix(".cv-pdf-")
            .suffix(".part")
            .tempfile_in(dir)?;
        file.write_all(&pdf)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| ExportError::Io(std::io::Error::other(e)))??;

    Ok(())
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|dir| !dir.as_os_str().is_empty())
}

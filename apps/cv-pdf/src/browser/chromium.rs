//! Chromium backend over the DevTools protocol.
//!
//! Navigation is issued as a raw `Page.navigate` so the loader id of the new
//! document is known; the page counts as loaded once that document emits the
//! lifecycle event chosen by [`WaitUntil`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, NavigateParams, PrintToPdfParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::browser::options::{cm_to_inches, PdfOptions};
use crate::browser::{BrowserLauncher, BrowserSession, WaitUntil};
use crate::config::Config;
use crate::errors::ExportError;

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
    navigation_timeout: Duration,
    wait_until: WaitUntil,
}

impl ChromiumLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            executable: config.chrome_path.clone(),
            navigation_timeout: config.navigation_timeout,
            wait_until: config.wait_until,
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ExportError> {
        let mut builder = BrowserConfig::builder().request_timeout(self.navigation_timeout);
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(ExportError::BrowserLaunch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ExportError::BrowserLaunch(e.to_string()))?;

        // The handler drives the websocket connection and must be polled for the whole session.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser connection closed: {e}");
                    break;
                }
            }
        });

        Ok(Box::new(ChromiumSession {
            browser,
            handler_task: Some(handler_task),
            navigation_timeout: self.navigation_timeout,
            wait_until: self.wait_until,
            closed: false,
        }))
    }
}

pub struct ChromiumSession {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    navigation_timeout: Duration,
    wait_until: WaitUntil,
    closed: bool,
}

/// The document a navigation produced.
#[derive(Debug, Clone, PartialEq)]
struct NavigationTarget {
    frame_id: String,
    /// None for same-document navigations.
    loader_id: Option<String>,
}

impl NavigationTarget {
    /// True when a lifecycle event reports the wanted condition for this document.
    fn is_settled_by(
        &self,
        frame_id: &str,
        loader_id: &str,
        name: &str,
        wait_until: WaitUntil,
    ) -> bool {
        name == wait_until.lifecycle_event()
            && frame_id == self.frame_id
            && self.loader_id.as_deref().map_or(true, |id| id == loader_id)
    }
}

impl ChromiumSession {
    async fn load(&self, page: &Page, url: &str) -> Result<(), ExportError> {
        let nav = |e: chromiumoxide::error::CdpError| ExportError::Navigation(e.to_string());

        page.execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(nav)?;
        let mut lifecycle = page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(nav)?;

        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(ExportError::Navigation)?;
        let navigated = page.execute(params).await.map_err(nav)?.result;
        if let Some(error_text) = navigated.error_text {
            return Err(ExportError::Navigation(format!("{url}: {error_text}")));
        }

        let target = NavigationTarget {
            frame_id: navigated.frame_id.inner().clone(),
            loader_id: navigated.loader_id.map(|id| id.inner().clone()),
        };
        let wait_until = self.wait_until;

        let settled = async {
            while let Some(event) = lifecycle.next().await {
                if target.is_settled_by(
                    event.frame_id.inner(),
                    event.loader_id.inner(),
                    &event.name,
                    wait_until,
                ) {
                    return Ok(());
                }
            }
            Err(ExportError::Navigation(
                "page closed before the network became idle".to_string(),
            ))
        };

        timeout(self.navigation_timeout, settled)
            .await
            .map_err(|_| {
                ExportError::Navigation(format!(
                    "{url} did not reach {} within {}s",
                    wait_until.lifecycle_event(),
                    self.navigation_timeout.as_secs()
                ))
            })?
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn capture_pdf(
        &mut self,
        url: &str,
        options: &PdfOptions,
    ) -> Result<Vec<u8>, ExportError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ExportError::BrowserLaunch(e.to_string()))?;

        self.load(&page, url).await?;

        info!("Generating PDF...");
        let pdf = page
            .pdf(print_params(options))
            .await
            .map_err(|e| ExportError::Capture(e.to_string()))?;

        if let Err(e) = page.close().await {
            debug!("Failed to close page: {e}");
        }
        Ok(pdf)
    }

    async fn close(&mut self) -> Result<(), ExportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| ExportError::BrowserClose(e.to_string()));
        if let Err(e) = self.browser.wait().await {
            debug!("Failed to wait for browser exit: {e}");
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        result
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}

fn print_params(options: &PdfOptions) -> PrintToPdfParams {
    let (width, height) = options.paper.inches();
    PrintToPdfParams {
        print_background: Some(options.print_background),
        paper_width: Some(width),
        paper_height: Some(height),
        margin_top: Some(cm_to_inches(options.margins.top)),
        margin_right: Some(cm_to_inches(options.margins.right)),
        margin_bottom: Some(cm_to_inches(options.margins.bottom)),
        margin_left: Some(cm_to_inches(options.margins.left)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::options::{Margins, PaperSize};

    fn target() -> NavigationTarget {
        NavigationTarget {
            frame_id: "F1".to_string(),
            loader_id: Some("L2".to_string()),
        }
    }

    #[test]
    fn test_idle_event_for_navigated_document_settles() {
        assert!(target().is_settled_by("F1", "L2", "networkIdle", WaitUntil::NetworkIdle));
    }

    #[test]
    fn test_idle_event_for_previous_document_is_ignored() {
        // about:blank emits its own lifecycle events under an older loader id
        assert!(!target().is_settled_by("F1", "L1", "networkIdle", WaitUntil::NetworkIdle));
    }

    #[test]
    fn test_other_frames_and_events_are_ignored() {
        assert!(!target().is_settled_by("F9", "L2", "networkIdle", WaitUntil::NetworkIdle));
        assert!(!target().is_settled_by("F1", "L2", "load", WaitUntil::NetworkIdle));
        assert!(!target().is_settled_by(
            "F1",
            "L2",
            "networkAlmostIdle",
            WaitUntil::NetworkIdle
        ));
    }

    #[test]
    fn test_almost_idle_condition() {
        assert!(target().is_settled_by(
            "F1",
            "L2",
            "networkAlmostIdle",
            WaitUntil::NetworkAlmostIdle
        ));
    }

    #[test]
    fn test_same_document_navigation_matches_any_loader() {
        let target = NavigationTarget {
            frame_id: "F1".to_string(),
            loader_id: None,
        };
        assert!(target.is_settled_by("F1", "anything", "networkIdle", WaitUntil::NetworkIdle));
    }

    #[test]
    fn test_print_params_for_default_options() {
        let params = print_params(&PdfOptions::default());
        assert_eq!(params.print_background, Some(true));
        assert_eq!(params.paper_width, Some(8.27));
        assert_eq!(params.paper_height, Some(11.69));
        let margin = params.margin_left.unwrap();
        assert!((margin - 1.0 / 2.54).abs() < 1e-9);
        assert_eq!(params.margin_top, params.margin_bottom);
        assert_eq!(params.landscape, None);
    }

    #[test]
    fn test_print_params_for_letter_with_custom_margins() {
        let options = PdfOptions {
            paper: PaperSize::Letter,
            print_background: false,
            margins: Margins {
                top: 2.54,
                right: 0.0,
                bottom: 2.54,
                left: 0.0,
            },
        };
        let params = print_params(&options);
        assert_eq!(params.print_background, Some(false));
        assert_eq!(params.paper_width, Some(8.5));
        assert_eq!(params.margin_top, Some(1.0));
        assert_eq!(params.margin_right, Some(0.0));
    }
}

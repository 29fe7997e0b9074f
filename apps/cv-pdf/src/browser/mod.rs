//! Headless browser capture: open a page, wait for the network to settle,
//! print it to PDF.

use std::str::FromStr;

use anyhow::bail;
use async_trait::async_trait;

use crate::errors::ExportError;

pub mod chromium;
pub mod options;

pub use chromium::ChromiumLauncher;
pub use options::{Margins, PaperSize, PdfOptions};

/// Page-load completion condition, named after the browser lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// No in-flight requests for 500 ms.
    NetworkIdle,
    /// At most two in-flight requests for 500 ms.
    NetworkAlmostIdle,
}

impl WaitUntil {
    /// The DevTools `Page.lifecycleEvent` name that satisfies this condition.
    pub fn lifecycle_event(self) -> &'static str {
        match self {
            WaitUntil::NetworkIdle => "networkIdle",
            WaitUntil::NetworkAlmostIdle => "networkAlmostIdle",
        }
    }
}

impl FromStr for WaitUntil {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "networkidle" => Ok(WaitUntil::NetworkIdle),
            "networkalmostidle" => Ok(WaitUntil::NetworkAlmostIdle),
            other => bail!("CV_WAIT_UNTIL must be 'networkidle' or 'networkalmostidle', got '{other}'"),
        }
    }
}

/// Opens a browser session. Called once per run, after the server is ready.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ExportError>;
}

/// A live browser. `close` must be safe to call repeatedly.
#[async_trait]
pub trait BrowserSession: Send {
    /// Loads `url`, waits for network idle and returns the printed PDF bytes.
    async fn capture_pdf(&mut self, url: &str, options: &PdfOptions)
        -> Result<Vec<u8>, ExportError>;

    async fn close(&mut self) -> Result<(), ExportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until_maps_to_lifecycle_events() {
        assert_eq!(WaitUntil::NetworkIdle.lifecycle_event(), "networkIdle");
        assert_eq!(
            WaitUntil::NetworkAlmostIdle.lifecycle_event(),
            "networkAlmostIdle"
        );
    }

    #[test]
    fn test_wait_until_parses_case_insensitively() {
        assert_eq!(
            "networkIdle".parse::<WaitUntil>().unwrap(),
            WaitUntil::NetworkIdle
        );
        assert_eq!(
            "NetworkAlmostIdle".parse::<WaitUntil>().unwrap(),
            WaitUntil::NetworkAlmostIdle
        );
        assert!("load".parse::<WaitUntil>().is_err());
    }
}

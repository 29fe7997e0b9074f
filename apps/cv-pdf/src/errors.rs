use std::time::Duration;

use thiserror::Error;

/// Failures of a PDF export run.
/// Every variant is terminal: the orchestrator cleans up and the binary exits 1.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Server failed to start within {} seconds", .0.as_secs())]
    StartupTimeout(Duration),

    #[error("Failed to spawn preview server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Preview server exited before signalling readiness ({0})")]
    ServerExited(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Browser close failed: {0}")]
    BrowserClose(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("PDF capture failed: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// True for failures that happen before a browser is ever launched.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            ExportError::StartupTimeout(_) | ExportError::Spawn(_) | ExportError::ServerExited(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_timeout_message() {
        let err = ExportError::StartupTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Server failed to start within 30 seconds");
        assert!(err.is_startup_failure());
    }

    #[test]
    fn test_navigation_is_not_startup_failure() {
        let err = ExportError::Navigation("net::ERR_CONNECTION_REFUSED".to_string());
        assert!(!err.is_startup_failure());
        assert!(err.to_string().contains("ERR_CONNECTION_REFUSED"));
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::browser::WaitUntil;
use crate::server::Readiness;

pub const DEFAULT_PORT: u16 = 4321;
pub const DEFAULT_OUTPUT: &str = "public/cv.pdf";
pub const DEFAULT_PAGE_PATH: &str = "/cv/";
pub const DEFAULT_SERVER_COMMAND: &str = "npm run preview -- --port {port}";

/// Export configuration loaded from environment variables.
/// Every value falls back to the fixed constant of a bare run, so no env is required.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub output_path: PathBuf,
    pub page_path: String,
    /// Shell command line; `{port}` is substituted before spawning.
    pub server_command: String,
    pub startup_timeout: Duration,
    pub stabilization_delay: Duration,
    pub readiness: Readiness,
    pub wait_until: WaitUntil,
    pub navigation_timeout: Duration,
    pub chrome_path: Option<PathBuf>,
    pub rust_log: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            output_path: PathBuf::from(DEFAULT_OUTPUT),
            page_path: DEFAULT_PAGE_PATH.to_string(),
            server_command: DEFAULT_SERVER_COMMAND.to_string(),
            startup_timeout: Duration::from_secs(30),
            stabilization_delay: Duration::from_millis(2000),
            readiness: Readiness::StdoutMarker,
            wait_until: WaitUntil::NetworkIdle,
            navigation_timeout: Duration::from_secs(60),
            chrome_path: None,
            rust_log: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match var("CV_PORT") {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .context("CV_PORT must be a valid port number")?,
            None => defaults.port,
        };
        if port == 0 {
            bail!("CV_PORT must be a valid port number");
        }

        let page_path = var("CV_PAGE_PATH").unwrap_or(defaults.page_path);
        let page_path = if page_path.starts_with('/') {
            page_path
        } else {
            format!("/{page_path}")
        };

        Ok(Config {
            port,
            output_path: var("CV_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            page_path,
            server_command: var("CV_SERVER_COMMAND").unwrap_or(defaults.server_command),
            startup_timeout: match var("CV_STARTUP_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(
                    parse_u64(&v).context("CV_STARTUP_TIMEOUT_SECS must be a whole number")?,
                ),
                None => defaults.startup_timeout,
            },
            stabilization_delay: match var("CV_STABILIZATION_DELAY_MS") {
                Some(v) => Duration::from_millis(
                    parse_u64(&v).context("CV_STABILIZATION_DELAY_MS must be a whole number")?,
                ),
                None => defaults.stabilization_delay,
            },
            readiness: match var("CV_READINESS") {
                Some(v) => v.parse()?,
                None => defaults.readiness,
            },
            wait_until: match var("CV_WAIT_UNTIL") {
                Some(v) => v.parse()?,
                None => defaults.wait_until,
            },
            navigation_timeout: match var("CV_NAVIGATION_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(
                    parse_u64(&v).context("CV_NAVIGATION_TIMEOUT_SECS must be a whole number")?,
                ),
                None => defaults.navigation_timeout,
            },
            chrome_path: var("CV_CHROME_PATH").map(PathBuf::from),
            rust_log: var("RUST_LOG").unwrap_or(defaults.rust_log),
        })
    }

    /// The page captured into the PDF, e.g. `http://localhost:4321/cv/`.
    pub fn page_url(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.page_path)
    }

    /// The server command line with the port substituted.
    pub fn resolved_server_command(&self) -> String {
        self.server_command.replace("{port}", &self.port.to_string())
    }
}

fn parse_u64(value: &str) -> Result<u64> {
    Ok(value.trim().parse::<u64>()?)
}

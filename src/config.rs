use anyhow::{Context, Result, bail};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TRACKING_URL: &str = "https://www.dbschenker.com/app/tracking-public/";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub tracking_url: Url,
    pub navigation_timeout: Duration,
    pub wait_timeout: Duration,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tracking_url: Url::parse(DEFAULT_TRACKING_URL).expect("default tracking URL is valid"),
            navigation_timeout: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(30),
            headless: true,
            chrome_executable: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    /// - `TRACKING_URL`: Optional - Public tracking page (default: DB Schenker's)
    /// - `NAVIGATION_TIMEOUT_SECS`: Optional - Page load ceiling (default: 60)
    /// - `WAIT_TIMEOUT_SECS`: Optional - Ceiling for element and network waits (default: 30)
    /// - `HEADLESS`: Optional - `false` shows the browser window (default: true)
    /// - `CHROME_EXECUTABLE`: Optional - Chrome/Chromium binary, auto-detected when unset
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let tracking_url = match env::var("TRACKING_URL") {
            Ok(raw) => parse_tracking_url(&raw)?,
            Err(_) => defaults.tracking_url,
        };

        let navigation_timeout = match env::var("NAVIGATION_TIMEOUT_SECS") {
            Ok(raw) => parse_secs("NAVIGATION_TIMEOUT_SECS", &raw)?,
            Err(_) => defaults.navigation_timeout,
        };

        let wait_timeout = match env::var("WAIT_TIMEOUT_SECS") {
            Ok(raw) => parse_secs("WAIT_TIMEOUT_SECS", &raw)?,
            Err(_) => defaults.wait_timeout,
        };

        let headless = match env::var("HEADLESS") {
            Ok(raw) => parse_bool("HEADLESS", &raw)?,
            Err(_) => defaults.headless,
        };

        let chrome_executable = env::var("CHROME_EXECUTABLE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            tracking_url,
            navigation_timeout,
            wait_timeout,
            headless,
            chrome_executable,
        })
    }
}

fn parse_tracking_url(raw: &str) -> Result<Url> {
    if raw.trim().is_empty() {
        bail!("TRACKING_URL cannot be empty");
    }

    let url = Url::parse(raw.trim()).context("TRACKING_URL is not a valid URL")?;

    if !matches!(url.scheme(), "http" | "https") {
        bail!("TRACKING_URL must be http or https, got {}", url.scheme());
    }

    Ok(url)
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds", name))?;

    if secs == 0 {
        bail!("{} must be greater than zero", name);
    }

    Ok(Duration::from_secs(secs))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => bail!("{} must be true or false, got {}", name, other),
    }
}

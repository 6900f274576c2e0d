use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use paralon_engine::remote::{RemoteConfig, RetryPolicy, DEFAULT_API_BASE};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "paralon.toml";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub bind_addr: String,
    pub api_key: Option<String>,
    pub api_base: String,
    pub upload_dir: PathBuf,
    pub generated_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_upload_bytes: usize,
    pub response_format: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".into(),
            api_key: None,
            api_base: DEFAULT_API_BASE.into(),
            upload_dir: PathBuf::from("uploads"),
            generated_dir: PathBuf::from("generated"),
            request_timeout_secs: 60,
            max_attempts: 4,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            response_format: None,
        }
    }
}

impl Settings {
    /// Checks values that would otherwise fail late, on the first request.
    pub fn validate(&self, dryrun: bool) -> Result<()> {
        if !dryrun && self.api_key.as_deref().map_or(true, str::is_empty) {
            bail!(
                "PARALONCLOUD_API_KEY is not set (pass --dryrun to run without the remote service)"
            );
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if let Some(format) = self.response_format.as_deref() {
            if format != "url" && format != "b64_json" {
                bail!("response_format must be 'url' or 'b64_json', got '{format}'");
            }
        }
        Ok(())
    }

    pub fn remote_config(&self) -> RemoteConfig {
        let mut config = RemoteConfig::new(
            self.api_base.clone(),
            self.api_key.clone().unwrap_or_default(),
        );
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config.retry = RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        };
        config.response_format = self.response_format.clone();
        config
    }
}

/// Reads the TOML file (a missing default file is fine, a missing explicit
/// one is not) and then applies environment overrides.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let mut settings = match fs::read_to_string(&path) {
        Ok(raw) => toml::from_str::<Settings>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound && !explicit => Settings::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

pub fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(v) = lookup("PARALONCLOUD_API_KEY") {
        settings.api_key = Some(v.trim().to_string()).filter(|key| !key.is_empty());
    }
    if let Some(v) = lookup("PARALONCLOUD_API_BASE") {
        settings.api_base = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = lookup("APP__UPLOAD_DIR") {
        settings.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("APP__GENERATED_DIR") {
        settings.generated_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = parse_number("APP__REQUEST_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = lookup("APP__MAX_ATTEMPTS") {
        settings.max_attempts = parse_number("APP__MAX_ATTEMPTS", &v)?;
    }
    if let Some(v) = lookup("APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = parse_number("APP__MAX_UPLOAD_BYTES", &v)?;
    }
    Ok(())
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'"))
}

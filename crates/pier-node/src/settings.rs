//! Local node settings.
//!
//! Settings live in `settings.toml` inside the settings directory and are
//! re-read on every reconciliation cycle. On first run the file does not
//! exist yet: a template with defaults is written and loading fails so the
//! operator can fill in the secret.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use pier_types::CacheLimits;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Name of the settings file inside the settings directory.
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Errors raised while loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No settings file exists.
    #[error("settings file {0} does not exist")]
    Missing(PathBuf),

    /// No settings file existed at startup; a template was written in its place.
    #[error("no settings found, wrote a template to {0}; edit it and start again")]
    TemplateWritten(PathBuf),

    #[error("settings I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("settings template could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds a value the node cannot run with.
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
}

/// Operator-provided node configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Secret issued by the control plane.
    pub client_secret: String,
    /// Directory holding cached objects.
    pub cache_directory: PathBuf,
    /// Cache size ceiling in MiB.
    pub max_cache_size_mebibytes: u64,
    /// Seconds between two cache scans.
    pub cache_scan_interval_seconds: u32,
    /// Idle time after which a cached object is expired.
    pub cache_refresh_age_seconds: u32,
    /// Log verbosity (`error`, `warn`, `info`, `debug`, `trace` or a filter directive).
    pub log_level: String,
    /// Replaces the upstream origin handed out by the control plane.
    pub override_upstream: Option<String>,
    /// Hard ceiling on the shutdown drain.
    pub graceful_shutdown_seconds: u64,
    /// Port clients reach this node on.
    pub client_port: u16,
    /// Declared upstream bandwidth (0 = unlimited).
    pub max_kilobits_per_second: u64,
    /// Base URL of the control plane.
    pub control_plane_url: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let cache_directory = dirs::cache_dir()
            .map(|d| d.join("pier"))
            .unwrap_or_else(|| PathBuf::from("cache"));
        Self {
            client_secret: String::new(),
            cache_directory,
            max_cache_size_mebibytes: 10_240,
            cache_scan_interval_seconds: 300,
            cache_refresh_age_seconds: 86_400,
            log_level: "info".to_string(),
            override_upstream: None,
            graceful_shutdown_seconds: 300,
            client_port: 443,
            max_kilobits_per_second: 0,
            control_plane_url: "https://api.pier.invalid".to_string(),
        }
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("client_secret", &"<redacted>")
            .field("cache_directory", &self.cache_directory)
            .field("max_cache_size_mebibytes", &self.max_cache_size_mebibytes)
            .field("cache_scan_interval_seconds", &self.cache_scan_interval_seconds)
            .field("cache_refresh_age_seconds", &self.cache_refresh_age_seconds)
            .field("log_level", &self.log_level)
            .field("override_upstream", &self.override_upstream)
            .field("graceful_shutdown_seconds", &self.graceful_shutdown_seconds)
            .field("client_port", &self.client_port)
            .field("max_kilobits_per_second", &self.max_kilobits_per_second)
            .field("control_plane_url", &self.control_plane_url)
            .finish()
    }
}

impl ClientSettings {
    /// Parse settings from a TOML string without validating them.
    pub fn from_toml(s: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(s)?)
    }

    /// Check that the node can run with these settings.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.client_secret.trim().is_empty() {
            return Err(SettingsError::Invalid("client_secret is empty"));
        }
        if self.cache_directory.as_os_str().is_empty() {
            return Err(SettingsError::Invalid("cache_directory is empty"));
        }
        if self.max_cache_size_mebibytes == 0 {
            return Err(SettingsError::Invalid("max_cache_size_mebibytes must be positive"));
        }
        if self.max_cache_size_mebibytes > u64::MAX / (1024 * 1024) {
            return Err(SettingsError::Invalid("max_cache_size_mebibytes is too large"));
        }
        if self.cache_scan_interval_seconds == 0 {
            return Err(SettingsError::Invalid("cache_scan_interval_seconds must be positive"));
        }
        if self.cache_refresh_age_seconds == 0 {
            return Err(SettingsError::Invalid("cache_refresh_age_seconds must be positive"));
        }
        if self.control_plane_url.trim().is_empty() {
            return Err(SettingsError::Invalid("control_plane_url is empty"));
        }
        Ok(())
    }

    /// Cache ceiling in bytes.
    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mebibytes.saturating_mul(1024 * 1024)
    }

    /// Declared bandwidth in bytes per second.
    pub fn network_speed_bytes(&self) -> u64 {
        self.max_kilobits_per_second.saturating_mul(1000) / 8
    }

    /// Cache limits derived from these settings.
    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_bytes: self.max_cache_bytes(),
            scan_interval_secs: self.cache_scan_interval_seconds,
            refresh_age_secs: self.cache_refresh_age_seconds,
        }
    }

    /// The upstream override, if one is set.
    pub fn upstream_override(&self) -> Option<&str> {
        self.override_upstream
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Where settings come from.
///
/// Loading is cheap and synchronous; it happens once per reconciliation
/// cycle.
pub trait SettingsSource: Send + Sync {
    /// Load and validate the current settings.
    fn load(&self) -> Result<ClientSettings, SettingsError>;
}

/// Settings stored as TOML on disk.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    /// Settings file at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `settings.toml` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(SETTINGS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings at startup, writing a template first if the file
    /// does not exist yet.
    ///
    /// A fresh template is never runnable, so that case still returns
    /// [`SettingsError::TemplateWritten`].
    pub fn load_or_init(&self) -> Result<ClientSettings, SettingsError> {
        match self.load() {
            Err(SettingsError::Missing(path)) => {
                self.write_template()?;
                Err(SettingsError::TemplateWritten(path))
            }
            other => other,
        }
    }

    /// Write a template populated with defaults.
    ///
    /// The file holds the node secret, so on unix it is created readable
    /// by its owner only.
    pub fn write_template(&self) -> Result<(), SettingsError> {
        let body = toml::to_string_pretty(&ClientSettings::default())?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        file.write_all(body.as_bytes())
            .map_err(|source| self.io_error(source))?;

        info!(path = %self.path.display(), "wrote settings template");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> SettingsError {
        SettingsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SettingsSource for SettingsFile {
    fn load(&self) -> Result<ClientSettings, SettingsError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SettingsError::Missing(self.path.clone()));
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let settings = ClientSettings::from_toml(&content)?;
        settings.validate()?;
        Ok(settings)
    }
}

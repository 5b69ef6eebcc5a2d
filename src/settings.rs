use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

const PACKAGE: &str = "aws-key-rotate";

#[derive(Debug, Error)]
pub(crate) enum SettingsError {
    #[error("failed to read settings {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write settings {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("missing home directory")]
    NoHome,
}

/// Local runtime settings, stored as JSON.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct Settings {
    pub(crate) logging: Logging,
    pub(crate) key_metadata: KeyMetadata,
    pub(crate) key_backup: KeyBackup,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct Logging {
    pub(crate) enabled: bool,
    pub(crate) mode: LogMode,
    pub(crate) path: PathBuf,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum LogMode {
    File,
    Stream,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct KeyMetadata {
    pub(crate) keyage_min_days: i64,
    pub(crate) keyage_max_days: i64,
    pub(crate) keyage_max_limit: i64,
    pub(crate) keyage_warning_days: i64,
    pub(crate) key_deprecation: DeprecationPolicy,
    pub(crate) rotation_delay_secs: u64,
}

/// How the key to retire is chosen when an identity holds two keys.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum DeprecationPolicy {
    /// Retire the oldest active key.
    Age,
    /// Retire the key the local credential store does not reference.
    CurrentInUse,
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "FILE",
            Self::Stream => "STREAM",
        })
    }
}

impl FromStr for LogMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(Self::File),
            "STREAM" => Ok(Self::Stream),
            _ => Err(SettingsError::Invalid(format!("unknown log mode {s}"))),
        }
    }
}

impl fmt::Display for DeprecationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Age => "AGE",
            Self::CurrentInUse => "CURRENT_IN_USE",
        })
    }
}

impl FromStr for DeprecationPolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AGE" => Ok(Self::Age),
            "CURRENT_IN_USE" => Ok(Self::CurrentInUse),
            _ => Err(SettingsError::Invalid(format!("unknown deprecation policy {s}"))),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct KeyBackup {
    pub(crate) enabled: bool,
    pub(crate) location: PathBuf,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: LogMode::File,
            path: home().join("logs").join(format!("{PACKAGE}.log")),
        }
    }
}

impl Default for KeyMetadata {
    fn default() -> Self {
        Self {
            keyage_min_days: 1,
            keyage_max_days: 30,
            keyage_max_limit: 365,
            keyage_warning_days: 2,
            key_deprecation: DeprecationPolicy::Age,
            rotation_delay_secs: 9,
        }
    }
}

impl Default for KeyBackup {
    fn default() -> Self {
        Self {
            enabled: false,
            location: home().join("Backup").join("keysets"),
        }
    }
}

impl KeyMetadata {
    pub(crate) fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.keyage_max_days)
    }

    pub(crate) fn warning(&self) -> chrono::Duration {
        chrono::Duration::days(self.keyage_warning_days)
    }

    pub(crate) fn rotation_delay(&self) -> Duration {
        Duration::from_secs(self.rotation_delay_secs)
    }
}

impl Settings {
    /// `$AWS_KEY_ROTATE_CONFIG`, or `<config dir>/aws-key-rotate/config.json`.
    pub(crate) fn path() -> Result<PathBuf, SettingsError> {
        if let Some(path) = env::var_os("AWS_KEY_ROTATE_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Ok(dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .ok_or(SettingsError::NoHome)?
            .join(PACKAGE)
            .join("config.json"))
    }

    /// Loads and validates the settings file; a missing file yields defaults.
    pub(crate) async fn load(path: &Path) -> Result<Self, SettingsError> {
        let settings = Self::read(path).await?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads the settings file without validating it.
    pub(crate) async fn read(path: &Path) -> Result<Self, SettingsError> {
        let settings = match fs::read(path).await {
            Ok(bytes) => {
                serde_json::from_slice::<Self>(&bytes).map_err(|source| SettingsError::Parse {
                    path: path.to_owned(),
                    source,
                })?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "settings not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        Ok(settings)
    }

    pub(crate) async fn save(&self, path: &Path) -> Result<(), SettingsError> {
        self.validate()?;
        let write_err = |source| SettingsError::Write {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, bytes).await.map_err(write_err)
    }

    pub(crate) fn validate(&self) -> Result<(), SettingsError> {
        let m = &self.key_metadata;
        if m.keyage_min_days < 1 {
            return Err(SettingsError::Invalid(format!(
                "keyage_min_days must be at least 1, got {}",
                m.keyage_min_days
            )));
        }
        if m.keyage_min_days > m.keyage_max_days {
            return Err(SettingsError::Invalid(format!(
                "keyage_min_days ({}) exceeds keyage_max_days ({})",
                m.keyage_min_days, m.keyage_max_days
            )));
        }
        if m.keyage_max_days > m.keyage_max_limit {
            return Err(SettingsError::Invalid(format!(
                "keyage_max_days ({}) exceeds keyage_max_limit ({})",
                m.keyage_max_days, m.keyage_max_limit
            )));
        }
        if m.keyage_warning_days < 0 || m.keyage_warning_days >= m.keyage_max_days {
            return Err(SettingsError::Invalid(format!(
                "keyage_warning_days ({}) must be within 0..{}",
                m.keyage_warning_days, m.keyage_max_days
            )));
        }
        Ok(())
    }
}

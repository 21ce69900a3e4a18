//! Settings file.
//!
//! Every field has a default, so an empty or missing file is valid. The
//! format follows the file extension (`.toml`, `.yaml`/`.yml`, `.json`);
//! anything else is sniffed from the content.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmd::DEFAULT_TIMEOUT;
use crate::error::{Result, ServError};

/// Location read when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/serv/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub commands: CommandSettings,
    pub supervisor: SupervisorSettings,
    pub nssm: NssmSettings,
    pub logging: LoggingSettings,
    /// Pause between stop and start on restart.
    pub restart_delay_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: PathSettings::default(),
            commands: CommandSettings::default(),
            supervisor: SupervisorSettings::default(),
            nssm: NssmSettings::default(),
            logging: LoggingSettings::default(),
            restart_delay_seconds: 3,
        }
    }
}

/// Framework directories, relative to `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub root: PathBuf,
    /// Where artifacts are rendered before deployment.
    pub staging_dir: PathBuf,
    /// Directory whose templates replace the built-in ones.
    pub templates: Option<PathBuf>,
    pub systemd_unit_dir: String,
    pub systemd_env_dir: String,
    pub upstart_job_dir: String,
    pub sysv_script_dir: String,
    pub sysv_defaults_dir: String,
    pub runit_service_dir: String,
    pub runit_enabled_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            staging_dir: default_staging_dir(),
            templates: None,
            systemd_unit_dir: "lib/systemd/system".into(),
            systemd_env_dir: "etc/sysconfig".into(),
            upstart_job_dir: "etc/init".into(),
            sysv_script_dir: "etc/init.d".into(),
            sysv_defaults_dir: "etc/default".into(),
            runit_service_dir: "etc/sv".into(),
            runit_enabled_dir: "var/service".into(),
        }
    }
}

#[cfg(unix)]
fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/serv/staging")
}

#[cfg(not(unix))]
fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("serv")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub timeout_seconds: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// supervisord.conf, relative to `paths.root`.
    pub config: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            config: "etc/supervisor/supervisord.conf".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NssmSettings {
    /// Directory holding nssm.exe and the generated batch files.
    pub dir: String,
    /// Directory shipping `nssm64.exe`/`nssm32.exe`, copied into `dir` on install.
    pub binaries_dir: Option<PathBuf>,
}

impl Default for NssmSettings {
    fn default() -> Self {
        Self {
            dir: r"C:\nssm".into(),
            binaries_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from [`DEFAULT_CONFIG_PATH`] if none is given.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    debug!(path = DEFAULT_CONFIG_PATH, "No settings file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| ServError::io(path, e))?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        debug!(path = %path.display(), "Loading settings");

        let settings = match extension {
            "toml" => parse_toml(&content),
            "yaml" | "yml" => parse_yaml(&content),
            "json" => parse_json(&content),
            _ => parse_auto(&content),
        };
        settings.map_err(|e| match e {
            ServError::Config { message } => ServError::Config {
                message: format!("{}: {}", path.display(), message),
            },
            other => other,
        })
    }
}

pub fn parse_toml(content: &str) -> Result<Settings> {
    toml::from_str(content).map_err(|e| ServError::Config {
        message: format!("invalid TOML: {}", e),
    })
}

pub fn parse_yaml(content: &str) -> Result<Settings> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ServError::Config {
        message: format!("invalid YAML: {}", e),
    })
}

pub fn parse_json(content: &str) -> Result<Settings> {
    serde_json::from_str(content).map_err(|e| ServError::Config {
        message: format!("invalid JSON: {}", e),
    })
}

/// Detect the format from the content.
pub fn parse_auto(content: &str) -> Result<Settings> {
    let trimmed = content.trim_start();

    if trimmed.starts_with('{') {
        return parse_json(content);
    }

    // TOML first: section headers like [paths] are not valid YAML mappings
    if let Ok(settings) = parse_toml(content) {
        return Ok(settings);
    }

    parse_yaml(content).map_err(|_| ServError::Config {
        message: "could not parse settings as TOML, YAML or JSON".into(),
    })
}

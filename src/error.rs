//! Error types for serv.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Every failure the adapter layer can report.
#[derive(Error, Debug)]
pub enum ServError {
    /// A descriptor field or an init-system specific parameter is invalid.
    #[error("Invalid value for '{param}': {reason}")]
    InvalidParameter { param: String, reason: String },

    /// The service command does not resolve to an executable file.
    #[error("Executable {} could not be found", path.display())]
    ExecutableNotFound { path: PathBuf },

    /// No adapter exists for the requested init system.
    #[error("Init system {name} not supported")]
    UnsupportedInitSystem { name: String },

    /// An artifact would overwrite an existing file.
    #[error("File already exists: {}", path.display())]
    ArtifactExists { path: PathBuf },

    /// A framework-maintained directory is missing on this host.
    #[error(
        "Directory {} does not exist and is required for {}",
        dir.display(),
        path.display()
    )]
    MissingSystemDirectory { dir: PathBuf, path: PathBuf },

    /// The init system cannot be driven from the current platform.
    #[error("Cannot manage {init_system} services on {platform}")]
    PlatformMismatch {
        init_system: String,
        platform: String,
    },

    /// The init system is not installed or not responding.
    #[error("{init_system} is not available on this host: {reason}")]
    InitSystemUnavailable { init_system: String, reason: String },

    /// The service is not known to the init system.
    #[error("Service {name} does not seem to be installed")]
    ServiceNotRegistered { name: String },

    /// A control command exited with a non-benign status.
    #[error("`{command}` failed with exit code {code:?}: {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// A control command did not finish in time and was killed.
    #[error("`{command}` timed out after {timeout_secs} seconds")]
    CommandTimedOut { command: String, timeout_secs: u64 },

    /// The template engine failed to render an artifact.
    #[error("Failed to render template '{template}': {message}")]
    TemplateRender { template: String, message: String },

    /// The settings file could not be loaded.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ServError {
    pub(crate) fn invalid(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn unavailable(init_system: &str, reason: impl Into<String>) -> Self {
        Self::InitSystemUnavailable {
            init_system: init_system.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for serv operations.
pub type Result<T> = std::result::Result<T, ServError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_path() {
        let err = ServError::ArtifactExists {
            path: PathBuf::from("/etc/init/svc.conf"),
        };
        assert_eq!(err.to_string(), "File already exists: /etc/init/svc.conf");

        let err = ServError::MissingSystemDirectory {
            dir: PathBuf::from("/lib/systemd/system"),
            path: PathBuf::from("/lib/systemd/system/svc.service"),
        };
        assert!(err.to_string().contains("/lib/systemd/system does not exist"));
    }

    #[test]
    fn command_failure_keeps_raw_output() {
        let err = ServError::CommandFailed {
            command: "systemctl start svc".into(),
            code: Some(1),
            output: "Job for svc.service failed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("systemctl start svc"));
        assert!(msg.contains("Job for svc.service failed"));
    }

    #[test]
    fn io_error_carries_source() {
        let err = ServError::io(
            Path::new("/tmp/x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{parse_pid, Binding, InitSystem, InitSystemKind, Transition};
use crate::artifact::{remove_if_present, ArtifactTarget};
use crate::cmd::CommandOutput;
use crate::config::Settings;
use crate::error::{Result, ServError};
use crate::platform::{Platform, POSIX};
use crate::status::{filter_by_name, FrameworkState, ServiceState, ServiceStatus, StatusRecord};

const DEFAULT_EXTENSION: &str = ".conf";

/// Where supervisord picks up extra program files, from `[include] files`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IncludeLayout {
    dir: PathBuf,
    /// File name part before the glob, usually empty.
    prefix: String,
    extension: String,
}

impl IncludeLayout {
    fn file_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", self.prefix, name, self.extension))
    }
}

pub struct Supervisor {
    binding: Binding,
    config: String,
}

impl Supervisor {
    pub(super) fn new(binding: Binding, settings: &Settings) -> Self {
        Self {
            binding,
            config: settings.supervisor.config.clone(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.binding.resolve(&self.config)
    }

    fn layout(&self) -> Result<IncludeLayout> {
        let config = self.config_path();
        let content = fs::read_to_string(&config).map_err(|e| {
            ServError::unavailable(
                "supervisor",
                format!("cannot read {}: {}", config.display(), e),
            )
        })?;

        let glob = include_globs(&content)
            .into_iter()
            .find(|g| g.contains('*'))
            .ok_or_else(|| {
                ServError::unavailable(
                    "supervisor",
                    format!("{} has no [include] files glob", config.display()),
                )
            })?;

        let layout = self.resolve_glob(&config, &glob);
        debug!(dir = %layout.dir.display(), extension = %layout.extension, "Supervisor include layout");
        Ok(layout)
    }

    /// Absolute globs are resolved against the host root, relative ones
    /// against the directory of supervisord.conf.
    fn resolve_glob(&self, config: &Path, glob: &str) -> IncludeLayout {
        let (before, after) = glob.split_once('*').unwrap_or((glob, ""));
        let (dir_part, prefix) = match before.rfind('/') {
            Some(idx) => (&before[..=idx], &before[idx + 1..]),
            None => ("", before),
        };

        let dir = if dir_part.starts_with('/') {
            self.binding.resolve(dir_part.trim_start_matches('/'))
        } else {
            config
                .parent()
                .map(|p| p.join(dir_part))
                .unwrap_or_else(|| PathBuf::from(dir_part))
        };

        let extension = if after.is_empty() {
            DEFAULT_EXTENSION.to_string()
        } else {
            after.to_string()
        };

        IncludeLayout {
            dir,
            prefix: prefix.to_string(),
            extension,
        }
    }

    fn ctl(&self, args: &[&str]) -> Result<CommandOutput> {
        let config = self.config_path();
        let config = config.to_string_lossy();
        let mut full = vec!["-c", config.as_ref()];
        full.extend_from_slice(args);
        self.binding.run("supervisorctl", &full)
    }
}

impl InitSystem for Supervisor {
    fn kind(&self) -> InitSystemKind {
        InitSystemKind::Supervisor
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        POSIX
    }

    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>> {
        let layout = self.layout()?;
        Ok(vec![ArtifactTarget::new(
            self.binding.template(self.kind(), ".conf"),
            layout.file_for(name),
        )
        .mode(0o644)])
    }

    fn install(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        self.ctl(&["update"])?.check()?;
        info!(service = %name, "supervisord picked up program");
        Ok(Transition::Changed)
    }

    fn start(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.ctl(&["start", name])?;
        if out.mentions("already started") {
            info!(service = %name, "Already running");
            return Ok(Transition::AlreadyInState);
        }
        // older supervisorctl reports errors with exit code 0
        if out.mentions("ERROR") {
            return Err(out.into_error());
        }
        out.check()?;
        info!(service = %name, "Started");
        Ok(Transition::Changed)
    }

    fn stop(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.ctl(&["stop", name])?;
        if out.mentions("not running") {
            info!(service = %name, "Already stopped");
            return Ok(Transition::AlreadyInState);
        }
        if out.mentions("ERROR") {
            return Err(out.into_error());
        }
        out.check()?;
        info!(service = %name, "Stopped");
        Ok(Transition::Changed)
    }

    fn uninstall(&self, name: &str) -> Result<()> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let layout = self.layout()?;
        remove_if_present(&layout.file_for(name))?;
        match self.ctl(&["update"]) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(command = %out.command, code = ?out.code, output = %out.text(), "Ignoring failed command"),
            Err(e) => warn!(error = %e, "Ignoring failed command"),
        }
        info!(service = %name, "Uninstalled");
        Ok(())
    }

    fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = match name {
            Some(name) => self.ctl(&["status", name])?,
            None => self.ctl(&["status"])?,
        };
        if out.mentions("refused connection") || out.mentions("no such file") {
            return Ok(StatusRecord::offline(
                self.kind(),
                &self.binding.reported_version,
                name,
            ));
        }

        // exit code 3 means some program is not running, the listing is still valid
        Ok(StatusRecord::online(
            self.kind(),
            &self.binding.reported_version,
            filter_by_name(parse_status(&out.stdout), name),
        ))
    }

    fn is_present(&self) -> bool {
        if !self.config_path().is_file() {
            return false;
        }
        matches!(
            self.status(None),
            Ok(record) if record.framework_state == FrameworkState::Online
        )
    }

    fn is_registered(&self, name: &str) -> Result<bool> {
        self.validate_platform()?;
        Ok(self.layout()?.file_for(name).exists())
    }
}

/// Globs listed under `[include] files =`.
fn include_globs(config: &str) -> Vec<String> {
    let mut in_include = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_include = line == "[include]";
            continue;
        }
        if !in_include || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(['=', ':']) else {
            continue;
        };
        if key.trim() == "files" {
            return value.split_whitespace().map(str::to_string).collect();
        }
    }
    Vec::new()
}

/// Parse `supervisorctl status` lines: `name STATE pid N, uptime H:MM:SS`.
fn parse_status(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (name, state) = (*fields.first()?, *fields.get(1)?);
            // "svc: ERROR (no such process)"
            if name.ends_with(':') {
                return None;
            }

            let service_state = match state {
                "RUNNING" => ServiceState::Running,
                "STOPPED" | "EXITED" => ServiceState::Stopped,
                "FATAL" | "BACKOFF" => ServiceState::Failed,
                "STARTING" | "STOPPING" | "UNKNOWN" => ServiceState::Unknown,
                _ => return None,
            };

            let mut status = ServiceStatus::new(name, service_state).with_detail("state", state);
            if state == "RUNNING" {
                if let (Some(&"pid"), Some(pid)) = (fields.get(2), fields.get(3)) {
                    status = status.with_pid(parse_pid(pid));
                }
                if let (Some(&"uptime"), Some(uptime)) = (fields.get(4), fields.get(5)) {
                    status = status.with_uptime(*uptime);
                }
            } else if fields.len() > 2 {
                status = status.with_detail("description", fields[2..].join(" "));
            }
            Some(status)
        })
        .collect()
}

use std::fs;
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{parse_pid, Binding, InitSystem, InitSystemKind, Transition};
use crate::artifact::{remove_if_present, symlink, ArtifactTarget};
use crate::cmd::CommandOutput;
use crate::config::Settings;
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServError};
use crate::platform::{Platform, UNIX};
use crate::status::{ServiceState, ServiceStatus, StatusRecord};

pub struct Runit {
    binding: Binding,
    service_dir: String,
    enabled_dir: String,
}

impl Runit {
    pub(super) fn new(binding: Binding, settings: &Settings) -> Self {
        Self {
            binding,
            service_dir: settings.paths.runit_service_dir.clone(),
            enabled_dir: settings.paths.runit_enabled_dir.clone(),
        }
    }

    fn service_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.service_dir).join(name)
    }

    fn link_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.enabled_dir).join(name)
    }

    /// `sv` is given the full link path so it works outside of `$SVDIR`.
    fn sv(&self, action: &str, name: &str) -> Result<CommandOutput> {
        let link = self.link_path(name);
        self.binding.run("sv", &[action, &link.to_string_lossy()])
    }

    fn query(&self, name: &str) -> Result<ServiceStatus> {
        let out = self.sv("status", name)?;
        Ok(parse_sv_status(name, &out.text()))
    }

    fn enabled_services(&self) -> Result<Vec<String>> {
        let dir = self.binding.resolve(&self.enabled_dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServError::io(&dir, e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }
}

impl InitSystem for Runit {
    fn kind(&self) -> InitSystemKind {
        InitSystemKind::Runit
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        UNIX
    }

    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>> {
        Ok(vec![ArtifactTarget::new(
            self.binding.template(self.kind(), ".run"),
            self.service_path(name).join("run"),
        )
        .mode(0o755)
        .creatable()])
    }

    fn parameters(&self, descriptor: &ServiceDescriptor) -> Result<Map<String, Value>> {
        let mut params = descriptor.template_context();
        let ulimits: Vec<String> = descriptor
            .limits()
            .iter()
            .map(|(kind, limit)| format!("{} {}", kind.ulimit_flag(), limit))
            .collect();
        params.insert("ulimits".into(), json!(ulimits));
        Ok(params)
    }

    fn install(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if !self.service_path(name).is_dir() {
            return Err(ServError::ServiceNotRegistered {
                name: name.to_string(),
            });
        }

        let link = self.link_path(name);
        if link.symlink_metadata().is_ok() {
            debug!(service = %name, "Already enabled");
            return Ok(Transition::AlreadyInState);
        }

        let enabled_dir = self.binding.resolve(&self.enabled_dir);
        fs::create_dir_all(&enabled_dir).map_err(|e| ServError::io(&enabled_dir, e))?;

        // runsvdir follows the link at runtime, so it must point at the live tree
        let target = self.binding.host.system_path(&self.service_dir).join(name);
        symlink(&target, &link)?;
        info!(service = %name, "Enabled");
        Ok(Transition::Changed)
    }

    fn start(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if self.query(name)?.state == ServiceState::Running {
            info!(service = %name, "Already running");
            return Ok(Transition::AlreadyInState);
        }
        self.sv("start", name)?.check()?;
        info!(service = %name, "Started");
        Ok(Transition::Changed)
    }

    fn stop(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if self.query(name)?.state == ServiceState::Stopped {
            info!(service = %name, "Already stopped");
            return Ok(Transition::AlreadyInState);
        }
        self.sv("stop", name)?.check()?;
        info!(service = %name, "Stopped");
        Ok(Transition::Changed)
    }

    fn uninstall(&self, name: &str) -> Result<()> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        remove_if_present(&self.link_path(name))?;
        remove_if_present(&self.service_path(name))?;
        info!(service = %name, "Uninstalled");
        Ok(())
    }

    fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let names = match name {
            Some(name) => vec![name.to_string()],
            None => self.enabled_services()?,
        };

        let services = names
            .iter()
            .map(|n| self.query(n))
            .collect::<Result<Vec<_>>>()?;

        // no runsv supervising anything means runsvdir is down
        if !services.is_empty() && services.iter().all(|s| s.state == ServiceState::Offline) {
            return Ok(StatusRecord::offline(
                self.kind(),
                &self.binding.reported_version,
                name,
            ));
        }

        Ok(StatusRecord::online(
            self.kind(),
            &self.binding.reported_version,
            services,
        ))
    }

    fn is_present(&self) -> bool {
        self.binding.host.locate("sv").is_some()
    }

    fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.service_path(name).is_dir())
    }
}

/// Interpret one `sv status` line:
/// `run: svc: (pid 123) 45s; run: log: (pid 122) 45s`, `down: svc: 3s, normally up`,
/// `fail: svc: unable to change to service directory`, or a `warning:` when
/// no runsv supervises the service.
fn parse_sv_status(name: &str, output: &str) -> ServiceStatus {
    let line = output.lines().next().unwrap_or_default().trim();
    let (tag, rest) = line.split_once(':').unwrap_or((line, ""));

    let state = match tag {
        "run" => ServiceState::Running,
        "down" | "finish" => ServiceState::Stopped,
        "fail" => ServiceState::Failed,
        "warning" if rest.contains("supervise") => ServiceState::Offline,
        _ => ServiceState::Unknown,
    };

    let mut status = ServiceStatus::new(name, state);
    if !line.is_empty() {
        status = status.with_detail("sv", line);
    }
    if state == ServiceState::Running {
        // the main service comes before any `; run: log:` part
        let main = rest.split(';').next().unwrap_or_default();
        let mut tokens = main.split_whitespace().skip_while(|t| *t != "(pid");
        if let (Some(_), Some(pid)) = (tokens.next(), tokens.next()) {
            status = status.with_pid(parse_pid(pid));
        }
        if let Some(uptime) = tokens.next() {
            status = status.with_uptime(uptime);
        }
    }
    status
}

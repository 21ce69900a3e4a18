use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::info;

use super::{parse_pid, Binding, InitSystem, InitSystemKind, Transition};
use crate::artifact::{remove_if_present, ArtifactTarget};
use crate::config::Settings;
use crate::descriptor::ServiceDescriptor;
use crate::error::Result;
use crate::host::Host;
use crate::platform::{Platform, LINUX_ONLY};
use crate::status::{filter_by_name, ServiceState, ServiceStatus, StatusRecord};

pub struct Upstart {
    binding: Binding,
    job_dir: String,
}

impl Upstart {
    pub(super) fn new(binding: Binding, settings: &Settings) -> Self {
        Self {
            binding,
            job_dir: settings.paths.upstart_job_dir.clone(),
        }
    }

    fn job_path(&self, name: &str) -> PathBuf {
        self.binding
            .resolve(&self.job_dir)
            .join(format!("{}.conf", name))
    }
}

impl InitSystem for Upstart {
    fn kind(&self) -> InitSystemKind {
        InitSystemKind::Upstart
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        LINUX_ONLY
    }

    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>> {
        Ok(vec![ArtifactTarget::new(
            self.binding.template(self.kind(), ".conf"),
            self.job_path(name),
        )
        .mode(0o644)])
    }

    fn parameters(&self, descriptor: &ServiceDescriptor) -> Result<Map<String, Value>> {
        let mut params = descriptor.template_context();
        let limits: Map<String, Value> = descriptor
            .limits()
            .iter()
            .map(|(kind, limit)| (kind.upstart_resource().to_string(), json!(limit.to_string())))
            .collect();
        params.insert("limits".into(), Value::Object(limits));
        Ok(params)
    }

    fn install(&self, _name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        self.binding
            .run("initctl", &["reload-configuration"])?
            .check()?;
        info!("Reloaded upstart configuration");
        Ok(Transition::Changed)
    }

    fn start(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.binding.run("initctl", &["start", name])?;
        if !out.success() && out.mentions("already running") {
            info!(service = %name, "Already running");
            return Ok(Transition::AlreadyInState);
        }
        out.check()?;
        info!(service = %name, "Started");
        Ok(Transition::Changed)
    }

    fn stop(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.binding.run("initctl", &["stop", name])?;
        if !out.success() && out.mentions("unknown instance") {
            info!(service = %name, "Already stopped");
            return Ok(Transition::AlreadyInState);
        }
        out.check()?;
        info!(service = %name, "Stopped");
        Ok(Transition::Changed)
    }

    fn uninstall(&self, name: &str) -> Result<()> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        remove_if_present(&self.job_path(name))?;
        self.binding.run_tolerant("initctl", &["reload-configuration"]);
        info!(service = %name, "Uninstalled");
        Ok(())
    }

    fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.binding.run("initctl", &["list"])?;
        if !out.success() && out.mentions("unable to connect") {
            return Ok(StatusRecord::offline(
                self.kind(),
                &self.binding.reported_version,
                name,
            ));
        }
        let out = out.check()?;

        Ok(StatusRecord::online(
            self.kind(),
            &self.binding.reported_version,
            filter_by_name(parse_initctl_list(&out.stdout), name),
        ))
    }

    fn is_present(&self) -> bool {
        probe(&self.binding.host).is_some()
    }

    fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.job_path(name).exists())
    }
}

/// Version reported by `initctl version`, e.g. `init (upstart 1.12.1)`.
pub(crate) fn probe(host: &Host) -> Option<String> {
    let out = host.run("initctl", &["version"]).ok()?;
    if !out.success() || !out.mentions("upstart") {
        return None;
    }
    let version = out
        .stdout
        .split_whitespace()
        .skip_while(|token| !token.contains("upstart"))
        .nth(1)
        .map(|v| v.trim_end_matches(')').to_string())
        .unwrap_or_else(|| "default".to_string());
    Some(version)
}

/// Parse `initctl list` lines: `name [(instance)] goal/state[, process PID]`.
fn parse_initctl_list(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace().peekable();
            let name = tokens.next()?;

            let instance = if tokens.peek().is_some_and(|t| t.starts_with('(')) {
                tokens
                    .next()
                    .map(|t| t.trim_matches(['(', ')']).to_string())
            } else {
                None
            };

            let goal_state = tokens.next()?.trim_end_matches(',');
            let (goal, state) = goal_state.split_once('/')?;

            let pid = match (tokens.next(), tokens.next()) {
                (Some("process"), Some(pid)) => parse_pid(pid),
                _ => None,
            };

            let service_state = match (goal, state) {
                ("start", "running") => ServiceState::Running,
                ("stop", "waiting") => ServiceState::Stopped,
                _ => ServiceState::Unknown,
            };

            let mut status = ServiceStatus::new(name, service_state)
                .with_pid(pid)
                .with_detail("goal", goal)
                .with_detail("state", state);
            if let Some(instance) = instance {
                status = status.with_detail("instance", instance);
            }
            Some(status)
        })
        .collect()
}

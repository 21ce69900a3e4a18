use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::info;

use super::{Binding, InitSystem, InitSystemKind, Transition};
use crate::artifact::{remove_if_present, ArtifactTarget};
use crate::config::Settings;
use crate::descriptor::{Limit, ServiceDescriptor};
use crate::error::{Result, ServError};
use crate::host::Host;
use crate::platform::{Platform, LINUX_ONLY};
use crate::status::{filter_by_name, ServiceState, ServiceStatus, StatusRecord};

/// `systemctl stop` exit code for a unit that is not loaded.
const EXIT_NOT_LOADED: i32 = 5;

pub struct Systemd {
    binding: Binding,
    unit_dir: String,
    env_dir: String,
}

impl Systemd {
    pub(super) fn new(binding: Binding, settings: &Settings) -> Self {
        Self {
            binding,
            unit_dir: settings.paths.systemd_unit_dir.clone(),
            env_dir: settings.paths.systemd_env_dir.clone(),
        }
    }

    fn unit(name: &str) -> String {
        format!("{}.service", name)
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.unit_dir).join(Self::unit(name))
    }

    fn env_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.env_dir).join(name)
    }

    fn active_state(&self, name: &str) -> Result<String> {
        let out = self.binding.run("systemctl", &["is-active", &Self::unit(name)])?;
        Ok(out.stdout.trim().to_string())
    }
}

impl InitSystem for Systemd {
    fn kind(&self) -> InitSystemKind {
        InitSystemKind::Systemd
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        LINUX_ONLY
    }

    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>> {
        let kind = self.kind();
        Ok(vec![
            ArtifactTarget::new(self.binding.template(kind, ".service"), self.unit_path(name))
                .mode(0o644),
            ArtifactTarget::new(self.binding.template(kind, ""), self.env_path(name))
                .mode(0o644)
                .creatable(),
        ])
    }

    fn parameters(&self, descriptor: &ServiceDescriptor) -> Result<Map<String, Value>> {
        // ExecStart= only takes absolute paths
        if !descriptor.command().starts_with('/') {
            return Err(ServError::invalid(
                "command",
                format!(
                    "systemd requires an absolute path to the executable, got '{}'",
                    descriptor.command()
                ),
            ));
        }

        let mut params = descriptor.template_context();
        let env_file = self
            .binding
            .host
            .system_path(&self.env_dir)
            .join(descriptor.name());
        params.insert("env_file".into(), json!(env_file.display().to_string()));

        let limits: Map<String, Value> = descriptor
            .limits()
            .iter()
            .map(|(kind, limit)| {
                let value = match limit {
                    Limit::Unlimited => "infinity".to_string(),
                    Limit::Value(v) => v.to_string(),
                };
                (kind.systemd_directive().to_string(), json!(value))
            })
            .collect();
        params.insert("limits".into(), Value::Object(limits));

        Ok(params)
    }

    fn install(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let unit = Self::unit(name);
        self.binding.run("systemctl", &["enable", &unit])?.check()?;
        self.binding.run("systemctl", &["daemon-reload"])?.check()?;

        info!(unit = %unit, "Enabled unit");
        Ok(Transition::Changed)
    }

    fn start(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if self.active_state(name)? == "active" {
            info!(service = %name, "Already running");
            return Ok(Transition::AlreadyInState);
        }

        self.binding
            .run("systemctl", &["start", &Self::unit(name)])?
            .check()?;
        info!(service = %name, "Started");
        Ok(Transition::Changed)
    }

    fn stop(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if self.active_state(name)? == "inactive" {
            info!(service = %name, "Already stopped");
            return Ok(Transition::AlreadyInState);
        }

        let out = self.binding.run("systemctl", &["stop", &Self::unit(name)])?;
        if out.code == Some(EXIT_NOT_LOADED) {
            info!(service = %name, "Unit not loaded, nothing to stop");
            return Ok(Transition::AlreadyInState);
        }
        out.check()?;
        info!(service = %name, "Stopped");
        Ok(Transition::Changed)
    }

    fn uninstall(&self, name: &str) -> Result<()> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        self.binding
            .run_tolerant("systemctl", &["disable", &Self::unit(name)]);
        remove_if_present(&self.unit_path(name))?;
        remove_if_present(&self.env_path(name))?;
        self.binding.run("systemctl", &["daemon-reload"])?.check()?;

        info!(service = %name, "Uninstalled");
        Ok(())
    }

    fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.binding.run(
            "systemctl",
            &[
                "list-units",
                "--type=service",
                "--all",
                "--no-legend",
                "--no-pager",
            ],
        )?;
        if out.mentions("failed to connect to bus") || out.mentions("not been booted with systemd")
        {
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
            filter_by_name(parse_list_units(&out.stdout), name),
        ))
    }

    fn is_present(&self) -> bool {
        probe(&self.binding.host).is_some()
    }

    fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.unit_path(name).exists())
    }
}

/// Version reported by `systemctl --version`, if systemd answers.
pub(crate) fn probe(host: &Host) -> Option<String> {
    let out = host.run("systemctl", &["--version"]).ok()?;
    if !out.success() {
        return None;
    }
    // "systemd 249 (249.11-0ubuntu3)"
    let version = out
        .stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|v| v.chars().take_while(char::is_ascii_digit).collect::<String>())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "default".to_string());
    Some(version)
}

/// Parse `systemctl list-units --no-legend` output:
/// `UNIT LOAD ACTIVE SUB DESCRIPTION...`, optionally prefixed by a marker.
fn parse_list_units(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['●', '*']).trim_start();
            let mut fields = line.split_whitespace();
            let unit = fields.next()?;
            let load = fields.next()?;
            let active = fields.next()?;
            let sub = fields.next()?;
            let description = fields.collect::<Vec<_>>().join(" ");

            let state = match (active, sub) {
                (_, "running") => ServiceState::Running,
                ("failed", _) => ServiceState::Failed,
                ("inactive", _) | (_, "exited") | (_, "dead") => ServiceState::Stopped,
                _ => ServiceState::Unknown,
            };

            Some(
                ServiceStatus::new(unit, state)
                    .with_detail("load", load)
                    .with_detail("active", active)
                    .with_detail("sub", sub)
                    .with_detail("description", description),
            )
        })
        .collect()
}

use std::fs;
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{Binding, InitSystem, InitSystemKind, Transition};
use crate::artifact::{remove_if_present, symlink, ArtifactTarget};
use crate::config::Settings;
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServError};
use crate::platform::{Platform, UNIX};
use crate::status::{filter_by_name, ServiceState, ServiceStatus, StatusRecord};

const LOG_DIR: &str = "/var/log";

/// Runlevels a service starts in, and the ones it is stopped in.
const START_RUNLEVELS: &[&str] = &["etc/rc2.d", "etc/rc3.d", "etc/rc4.d", "etc/rc5.d"];
const STOP_RUNLEVELS: &[&str] = &["etc/rc0.d", "etc/rc1.d", "etc/rc6.d"];

/// LSB `status` exit codes.
const LSB_RUNNING: i32 = 0;
const LSB_NOT_RUNNING: i32 = 3;

pub struct SysV {
    binding: Binding,
    script_dir: String,
    defaults_dir: String,
}

impl SysV {
    pub(super) fn new(binding: Binding, settings: &Settings) -> Self {
        Self {
            binding,
            script_dir: settings.paths.sysv_script_dir.clone(),
            defaults_dir: settings.paths.sysv_defaults_dir.clone(),
        }
    }

    fn script_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.script_dir).join(name)
    }

    fn defaults_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.defaults_dir).join(name)
    }

    /// Exit code of `<script> status`, or `None` if the script is missing.
    fn lsb_status(&self, name: &str) -> Result<Option<i32>> {
        let script = self.script_path(name);
        if !script.exists() {
            return Ok(None);
        }
        let out = self
            .binding
            .run(&script.to_string_lossy(), &["status"])?;
        Ok(out.code)
    }

    /// Run `action` through `service` when available, otherwise call the script.
    fn control(&self, name: &str, action: &str) -> Result<()> {
        let out = if self.binding.host.locate("service").is_some() {
            self.binding.run("service", &[name, action])?
        } else {
            warn!("service command unavailable, running the script directly");
            let script = self.script_path(name);
            self.binding.run(&script.to_string_lossy(), &[action])?
        };
        out.check()?;
        Ok(())
    }

    /// Start/stop links in the rc directories, for hosts without update-rc.d or chkconfig.
    fn link_runlevels(&self, name: &str) -> Result<()> {
        let target = self.binding.host.system_path(&self.script_dir).join(name);

        for (dirs, prefix) in [(START_RUNLEVELS, "S20"), (STOP_RUNLEVELS, "K80")] {
            for runlevel_dir in dirs {
                let dir = self.binding.resolve(runlevel_dir);
                fs::create_dir_all(&dir).map_err(|e| ServError::io(&dir, e))?;
                symlink(&target, &dir.join(format!("{}{}", prefix, name)))?;
            }
        }
        Ok(())
    }

    fn unlink_runlevels(&self, name: &str) -> Result<()> {
        for runlevel_dir in START_RUNLEVELS.iter().chain(STOP_RUNLEVELS) {
            let dir = self.binding.resolve(runlevel_dir);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if is_runlevel_link(&entry.file_name().to_string_lossy(), name) {
                    remove_if_present(&entry.path())?;
                }
            }
        }
        Ok(())
    }

    fn scripts(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.binding.resolve(&self.script_dir)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl InitSystem for SysV {
    fn kind(&self) -> InitSystemKind {
        InitSystemKind::SysV
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        UNIX
    }

    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>> {
        let kind = self.kind();
        Ok(vec![
            ArtifactTarget::new(self.binding.template(kind, ""), self.script_path(name)).mode(0o755),
            ArtifactTarget::new(self.binding.template(kind, ".defaults"), self.defaults_path(name))
                .mode(0o644)
                .creatable(),
        ])
    }

    fn parameters(&self, descriptor: &ServiceDescriptor) -> Result<Map<String, Value>> {
        let name = descriptor.name();
        let mut params = descriptor.template_context();

        let ulimits: Vec<String> = descriptor
            .limits()
            .iter()
            .map(|(kind, limit)| format!("{} {}", kind.ulimit_flag(), limit))
            .collect();
        params.insert("ulimits".into(), json!(ulimits));
        params.insert("log_dir".into(), json!(LOG_DIR));
        params.insert("log_path".into(), json!(format!("{}/{}.log", LOG_DIR, name)));

        let system = &self.binding.host;
        params.insert(
            "script_file".into(),
            json!(system.system_path(&self.script_dir).join(name).display().to_string()),
        );
        params.insert(
            "defaults_file".into(),
            json!(system.system_path(&self.defaults_dir).join(name).display().to_string()),
        );
        Ok(params)
    }

    fn install(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let host = &self.binding.host;
        if host.locate("update-rc.d").is_some() {
            self.binding
                .run("update-rc.d", &[name, "defaults"])?
                .check()?;
        } else if host.locate("chkconfig").is_some() {
            self.binding.run("chkconfig", &["--add", name])?.check()?;
        } else {
            self.link_runlevels(name)?;
        }

        info!(service = %name, "Enabled init script");
        Ok(Transition::Changed)
    }

    fn start(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if self.lsb_status(name)? == Some(LSB_RUNNING) {
            info!(service = %name, "Already running");
            return Ok(Transition::AlreadyInState);
        }
        self.control(name, "start")?;
        info!(service = %name, "Started");
        Ok(Transition::Changed)
    }

    fn stop(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if self.lsb_status(name)? == Some(LSB_NOT_RUNNING) {
            info!(service = %name, "Already stopped");
            return Ok(Transition::AlreadyInState);
        }
        self.control(name, "stop")?;
        info!(service = %name, "Stopped");
        Ok(Transition::Changed)
    }

    fn uninstall(&self, name: &str) -> Result<()> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let host = &self.binding.host;
        if host.locate("update-rc.d").is_some() {
            self.binding
                .run_tolerant("update-rc.d", &["-f", name, "remove"]);
        } else if host.locate("chkconfig").is_some() {
            self.binding.run_tolerant("chkconfig", &["--del", name]);
        } else {
            self.unlink_runlevels(name)?;
        }

        remove_if_present(&self.script_path(name))?;
        remove_if_present(&self.defaults_path(name))?;
        info!(service = %name, "Uninstalled");
        Ok(())
    }

    fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let services = match name {
            Some(name) => match self.lsb_status(name)? {
                Some(code) => vec![ServiceStatus::new(name, lsb_state(code))
                    .with_detail("exit_code", code.to_string())],
                None => Vec::new(),
            },
            None if self.binding.host.locate("service").is_some() => {
                let out = self.binding.run("service", &["--status-all"])?;
                // service --status-all exits non-zero when any script does
                parse_status_all(&out.text())
            }
            None => {
                let mut services = Vec::new();
                for script in self.scripts() {
                    if let Some(code) = self.lsb_status(&script)? {
                        services.push(ServiceStatus::new(script, lsb_state(code)));
                    }
                }
                services
            }
        };

        Ok(StatusRecord::online(
            self.kind(),
            &self.binding.reported_version,
            filter_by_name(services, name),
        ))
    }

    fn is_present(&self) -> bool {
        self.binding.resolve(&self.script_dir).is_dir()
    }

    fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.script_path(name).exists())
    }
}

fn is_runlevel_link(file_name: &str, service: &str) -> bool {
    ["S", "K"].iter().any(|prefix| {
        file_name
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches(|c: char| c.is_ascii_digit()) == service)
            .unwrap_or(false)
    })
}

fn lsb_state(code: i32) -> ServiceState {
    match code {
        0 => ServiceState::Running,
        1 | 2 => ServiceState::Failed,
        3 => ServiceState::Stopped,
        _ => ServiceState::Unknown,
    }
}

/// Parse `service --status-all` lines: ` [ + ]  name`.
fn parse_status_all(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix('[')?;
            let (marker, name) = rest.split_once(']')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let state = match marker.trim() {
                "+" => ServiceState::Running,
                "-" => ServiceState::Stopped,
                _ => ServiceState::Unknown,
            };
            Some(ServiceStatus::new(name, state))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateEngine;
    use crate::test_support::{fake_executable, scripted_host, ScriptedRunner};
    use std::path::Path;
    use std::sync::Arc;

    fn adapter(root: &Path, runner: &Arc<ScriptedRunner>) -> Box<dyn InitSystem> {
        let mut settings = Settings::default();
        settings.paths.staging_dir = root.join("staging");
        let host = scripted_host(root, Platform::Linux, runner);
        InitSystemKind::SysV.create(&host, "lsb-3.1", &settings)
    }

    fn deployed_script(root: &Path, name: &str) -> PathBuf {
        let dir = root.join("etc/init.d");
        fs::create_dir_all(&dir).unwrap();
        fake_executable(&dir, name)
    }

    #[test]
    fn generate_script_and_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = fake_executable(tmp.path(), "svc");
        let runner = ScriptedRunner::new();
        let sysv = adapter(tmp.path(), &runner);
        let engine = TemplateEngine::builtin().unwrap();

        let descriptor = ServiceDescriptor::builder(exe.to_str().unwrap())
            .env("KEY1=VALUE1")
            .limit(crate::descriptor::LimitKind::CoreDump, "unlimited")
            .limit(crate::descriptor::LimitKind::OpenFiles, "4096")
            .build()
            .unwrap();
        let generated = sysv.generate(&descriptor, &engine, false).unwrap();
        assert_eq!(
            generated.destinations(),
            vec![tmp.path().join("etc/init.d/svc"), tmp.path().join("etc/default/svc")]
        );

        let script = fs::read_to_string(generated.paths()[0]).unwrap();
        assert!(script.contains("# Provides:          svc"));
        assert!(script.contains("ulimit -c unlimited"));
        assert!(script.contains("ulimit -n 4096"));
        assert!(script.contains("DEFAULTS=/etc/default/svc"));
        assert!(script.contains("LOGFILE=/var/log/svc.log"));

        let defaults = fs::read_to_string(generated.paths()[1]).unwrap();
        assert!(defaults.contains("export KEY1='VALUE1'"));
    }

    #[test]
    fn install_prefers_update_rc_d() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.with_program("update-rc.d").with_program("chkconfig");
        let sysv = adapter(tmp.path(), &runner);

        sysv.install("svc").unwrap();
        assert_eq!(runner.calls(), vec!["update-rc.d svc defaults"]);
    }

    #[test]
    fn install_falls_back_to_chkconfig() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.with_program("chkconfig");
        let sysv = adapter(tmp.path(), &runner);

        sysv.install("svc").unwrap();
        assert_eq!(runner.calls(), vec!["chkconfig --add svc"]);
    }

    #[cfg(unix)]
    #[test]
    fn install_without_tools_links_runlevels() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let sysv = adapter(tmp.path(), &runner);

        sysv.install("svc").unwrap();
        let link = tmp.path().join("etc/rc2.d/S20svc");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/etc/init.d/svc"));
        assert!(tmp.path().join("etc/rc0.d/K80svc").symlink_metadata().is_ok());

        sysv.uninstall("svc").unwrap();
        assert!(link.symlink_metadata().is_err());
        assert!(tmp.path().join("etc/rc0.d/K80svc").symlink_metadata().is_err());
    }

    #[test]
    fn start_when_running_is_benign() {
        let tmp = tempfile::tempdir().unwrap();
        let script = deployed_script(tmp.path(), "svc");
        let runner = ScriptedRunner::new();
        runner.with_program("service");
        runner.reply(&format!("{} status", script.display()), 0, "svc is running");
        let sysv = adapter(tmp.path(), &runner);

        assert_eq!(sysv.start("svc").unwrap(), Transition::AlreadyInState);
        assert!(!runner.called("service svc start"));
    }

    #[test]
    fn start_through_service() {
        let tmp = tempfile::tempdir().unwrap();
        let script = deployed_script(tmp.path(), "svc");
        let runner = ScriptedRunner::new();
        runner.with_program("service");
        runner.reply(&format!("{} status", script.display()), 3, "svc is not running");
        let sysv = adapter(tmp.path(), &runner);

        assert_eq!(sysv.start("svc").unwrap(), Transition::Changed);
        assert!(runner.called("service svc start"));
        assert_eq!(sysv.stop("svc").unwrap(), Transition::AlreadyInState);
    }

    #[test]
    fn stop_without_service_runs_script() {
        let tmp = tempfile::tempdir().unwrap();
        let script = deployed_script(tmp.path(), "svc");
        let runner = ScriptedRunner::new();
        let sysv = adapter(tmp.path(), &runner);

        assert_eq!(sysv.stop("svc").unwrap(), Transition::Changed);
        assert!(runner.called(&format!("{} stop", script.display())));
    }

    #[test]
    fn status_maps_lsb_codes() {
        let tmp = tempfile::tempdir().unwrap();
        let script = deployed_script(tmp.path(), "svc");
        let runner = ScriptedRunner::new();
        runner.reply(&format!("{} status", script.display()), 1, "svc is dead but pid file exists");
        let sysv = adapter(tmp.path(), &runner);

        let record = sysv.status(Some("svc")).unwrap();
        assert_eq!(record.services[0].state, ServiceState::Failed);

        assert!(sysv.status(Some("missing")).unwrap().services.is_empty());
    }

    #[test]
    fn status_all() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.with_program("service");
        runner.reply("service --status-all", 0, " [ + ]  cron\n [ - ]  nginx\n [ ? ]  hwclock.sh\nnoise\n");
        let sysv = adapter(tmp.path(), &runner);

        let record = sysv.status(None).unwrap();
        let states: Vec<_> = record.services.iter().map(|s| (s.name.as_str(), s.state)).collect();
        assert_eq!(
            states,
            vec![
                ("cron", ServiceState::Running),
                ("nginx", ServiceState::Stopped),
                ("hwclock.sh", ServiceState::Unknown),
            ]
        );
    }

    #[test]
    fn runlevel_link_names() {
        assert!(is_runlevel_link("S20svc", "svc"));
        assert!(is_runlevel_link("K80svc", "svc"));
        assert!(!is_runlevel_link("S20svc2", "svc"));
        assert!(!is_runlevel_link("README", "svc"));
    }

    #[test]
    fn not_supported_on_windows() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let host = scripted_host(tmp.path(), Platform::Windows, &runner);
        let sysv = InitSystemKind::SysV.create(&host, "lsb-3.1", &Settings::default());
        assert!(matches!(sysv.install("svc"), Err(ServError::PlatformMismatch { .. })));
    }
}

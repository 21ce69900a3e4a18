use std::fs;
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{Binding, InitSystem, InitSystemKind, Transition};
use crate::artifact::{remove_if_present, ArtifactTarget};
use crate::config::Settings;
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServError};
use crate::platform::{Platform, WINDOWS_ONLY};
use crate::status::{ServiceState, ServiceStatus, StatusRecord};

/// `sc` exit codes for a service already in the requested state.
const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;

const STARTUP_POLICY: &str = "auto";
const FAILURE_RESET_TIMEOUT_SECS: u32 = 60;
const FAILURE_RESTART_DELAY_MS: u32 = 5000;

pub struct Nssm {
    binding: Binding,
    dir: String,
    binaries_dir: Option<PathBuf>,
}

impl Nssm {
    pub(super) fn new(binding: Binding, settings: &Settings) -> Self {
        Self {
            binding,
            dir: settings.nssm.dir.clone(),
            binaries_dir: settings.nssm.binaries_dir.clone(),
        }
    }

    fn batch_path(&self, name: &str) -> PathBuf {
        self.binding.resolve(&self.dir).join(format!("{}.bat", name))
    }

    fn exe_path(&self) -> PathBuf {
        self.binding.resolve(&self.dir).join("nssm.exe")
    }

    /// Helper binary matching this build's pointer width.
    fn bundled_helper(&self) -> Option<PathBuf> {
        let binary = if cfg!(target_pointer_width = "64") {
            "nssm64.exe"
        } else {
            "nssm32.exe"
        };
        self.binaries_dir
            .as_ref()
            .map(|dir| dir.join(binary))
            .filter(|path| path.is_file())
    }

    /// Copy the helper binary into place if it is not there yet.
    fn ensure_helper(&self) -> Result<()> {
        let exe = self.exe_path();
        if exe.is_file() {
            return Ok(());
        }
        let source = self.bundled_helper().ok_or_else(|| {
            ServError::unavailable(
                "nssm",
                format!(
                    "{} is missing and no helper binary is configured (nssm.binaries_dir)",
                    exe.display()
                ),
            )
        })?;
        if let Some(dir) = exe.parent() {
            fs::create_dir_all(dir).map_err(|e| ServError::io(dir, e))?;
        }
        debug!(from = %source.display(), to = %exe.display(), "Deploying nssm helper");
        fs::copy(&source, &exe).map_err(|e| ServError::io(&exe, e))?;
        Ok(())
    }

    /// Services with a deployed batch file.
    fn deployed_services(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.binding.resolve(&self.dir)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) != Some("bat") {
                    return None;
                }
                path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    fn query(&self, name: &str) -> Result<ServiceStatus> {
        let exe = self.exe_path();
        let out = self
            .binding
            .run(&exe.to_string_lossy(), &["status", name])?;
        let text = out.text();
        let state = if out.success() {
            nssm_state(&text)
        } else {
            ServiceState::Unknown
        };
        Ok(ServiceStatus::new(name, state).with_detail("status", text))
    }
}

impl InitSystem for Nssm {
    fn kind(&self) -> InitSystemKind {
        InitSystemKind::Nssm
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn supported_platforms(&self) -> &'static [Platform] {
        WINDOWS_ONLY
    }

    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>> {
        Ok(vec![ArtifactTarget::new(
            self.binding.template(self.kind(), ".bat"),
            self.batch_path(name),
        )
        .creatable()])
    }

    fn parameters(&self, descriptor: &ServiceDescriptor) -> Result<Map<String, Value>> {
        let mut params = descriptor.template_context();
        params.insert(
            "nssm_dir".into(),
            json!(self.binding.host.system_path(&self.dir).display().to_string()),
        );
        params.insert("startup_policy".into(), json!(STARTUP_POLICY));
        params.insert("failure_reset_timeout".into(), json!(FAILURE_RESET_TIMEOUT_SECS));
        params.insert("failure_restart_delay".into(), json!(FAILURE_RESTART_DELAY_MS));
        Ok(params)
    }

    fn install(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        self.ensure_helper()?;
        let batch = self.batch_path(name);
        self.binding
            .run("cmd", &["/C", &batch.to_string_lossy()])?
            .check()?;

        info!(service = %name, "Registered Windows service");
        Ok(Transition::Changed)
    }

    fn start(&self, name: &str) -> Result<Transition> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        let out = self.binding.run("sc", &["start", name])?;
        if out.code == Some(ERROR_SERVICE_ALREADY_RUNNING) {
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

        let out = self.binding.run("sc", &["stop", name])?;
        if out.code == Some(ERROR_SERVICE_NOT_ACTIVE) {
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

        self.binding
            .run_tolerant("sc", &["config", name, "start=", "disabled"]);
        let exe = self.exe_path();
        if exe.is_file() {
            self.binding
                .run_tolerant(&exe.to_string_lossy(), &["remove", name, "confirm"]);
        }
        remove_if_present(&self.batch_path(name))?;

        info!(service = %name, "Uninstalled");
        Ok(())
    }

    fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        self.validate_platform()?;
        let _guard = self.binding.span.enter();

        if !self.exe_path().is_file() {
            return Ok(StatusRecord::offline(
                self.kind(),
                &self.binding.reported_version,
                name,
            ));
        }

        let names = match name {
            Some(name) => vec![name.to_string()],
            None => self.deployed_services(),
        };
        let services = names
            .iter()
            .map(|n| self.query(n))
            .collect::<Result<Vec<_>>>()?;

        Ok(StatusRecord::online(
            self.kind(),
            &self.binding.reported_version,
            services,
        ))
    }

    fn is_present(&self) -> bool {
        self.exe_path().is_file() || self.bundled_helper().is_some()
    }

    fn is_registered(&self, name: &str) -> Result<bool> {
        self.validate_platform()?;
        Ok(self.binding.run("sc", &["query", name])?.success())
    }
}

fn nssm_state(output: &str) -> ServiceState {
    match output.trim() {
        "SERVICE_RUNNING" | "SERVICE_STOP_PENDING" => ServiceState::Running,
        "SERVICE_STOPPED" | "SERVICE_PAUSED" => ServiceState::Stopped,
        _ => ServiceState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FrameworkState;
    use crate::template::TemplateEngine;
    use crate::test_support::{fake_executable, scripted_host, ScriptedRunner};
    use std::path::Path;
    use std::sync::Arc;

    fn settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.paths.staging_dir = root.join("staging");
        settings.nssm.dir = "nssm".into();
        settings
    }

    fn adapter(root: &Path, runner: &Arc<ScriptedRunner>, settings: &Settings) -> Box<dyn InitSystem> {
        let host = scripted_host(root, Platform::Windows, runner);
        InitSystemKind::Nssm.create(&host, "default", settings)
    }

    #[test]
    fn generate_batch_file() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = fake_executable(tmp.path(), "svc");
        let runner = ScriptedRunner::new();
        let nssm = adapter(tmp.path(), &runner, &settings(tmp.path()));
        let engine = TemplateEngine::builtin().unwrap();

        let descriptor = ServiceDescriptor::builder(exe.to_str().unwrap())
            .env("KEY1=VALUE1")
            .env("KEY2=VALUE2")
            .build()
            .unwrap();
        let generated = nssm.generate(&descriptor, &engine, false).unwrap();
        assert_eq!(generated.destinations(), vec![tmp.path().join("nssm/svc.bat")]);

        let batch = fs::read_to_string(generated.paths()[0]).unwrap();
        assert!(batch.contains("set NSSM=\"nssm\\nssm.exe\""));
        assert!(batch.contains("Start SERVICE_AUTO_START"));
        assert!(batch.contains("AppEnvironmentExtra \"KEY1=VALUE1\" \"KEY2=VALUE2\""));
        assert!(batch.contains("AppRestartDelay 5000"));
        assert!(batch.contains("reset= 60"));
    }

    #[test]
    fn install_copies_helper_and_runs_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let binaries = tmp.path().join("binaries");
        fs::create_dir_all(&binaries).unwrap();
        fs::write(binaries.join("nssm64.exe"), "MZ").unwrap();
        fs::write(binaries.join("nssm32.exe"), "MZ").unwrap();

        let mut settings = settings(tmp.path());
        settings.nssm.binaries_dir = Some(binaries);
        let runner = ScriptedRunner::new();
        let nssm = adapter(tmp.path(), &runner, &settings);

        assert!(nssm.is_present());
        nssm.install("svc").unwrap();
        assert!(tmp.path().join("nssm/nssm.exe").is_file());
        assert_eq!(
            runner.calls(),
            vec![format!("cmd /C {}", tmp.path().join("nssm/svc.bat").display())]
        );
    }

    #[test]
    fn install_without_helper_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let nssm = adapter(tmp.path(), &runner, &settings(tmp.path()));

        assert!(!nssm.is_present());
        assert!(matches!(
            nssm.install("svc"),
            Err(ServError::InitSystemUnavailable { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn benign_sc_exit_codes() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.reply("sc start svc", 1056, "[SC] StartService FAILED 1056");
        runner.reply("sc stop svc", 1062, "[SC] ControlService FAILED 1062");
        let nssm = adapter(tmp.path(), &runner, &settings(tmp.path()));

        assert_eq!(nssm.start("svc").unwrap(), Transition::AlreadyInState);
        assert_eq!(nssm.stop("svc").unwrap(), Transition::AlreadyInState);

        runner.reply("sc start svc", 2, "[SC] StartService FAILED 2");
        assert!(matches!(nssm.start("svc"), Err(ServError::CommandFailed { code: Some(2), .. })));
    }

    #[test]
    fn status_of_deployed_services() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nssm");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("nssm.exe"), "MZ").unwrap();
        fs::write(dir.join("alpha.bat"), "").unwrap();
        fs::write(dir.join("beta.bat"), "").unwrap();

        let exe = dir.join("nssm.exe");
        let runner = ScriptedRunner::new();
        runner.reply(&format!("{} status alpha", exe.display()), 0, "SERVICE_RUNNING\r\n");
        runner.reply(&format!("{} status beta", exe.display()), 0, "SERVICE_PAUSED\r\n");
        let nssm = adapter(tmp.path(), &runner, &settings(tmp.path()));

        let record = nssm.status(None).unwrap();
        assert_eq!(record.framework_state, FrameworkState::Online);
        let states: Vec<_> = record.services.iter().map(|s| (s.name.as_str(), s.state)).collect();
        assert_eq!(
            states,
            vec![("alpha", ServiceState::Running), ("beta", ServiceState::Stopped)]
        );
    }

    #[test]
    fn status_without_helper_is_offline() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let nssm = adapter(tmp.path(), &runner, &settings(tmp.path()));

        let record = nssm.status(Some("svc")).unwrap();
        assert_eq!(record.framework_state, FrameworkState::Offline);
        assert_eq!(record.services[0].state, ServiceState::Offline);
    }

    #[test]
    fn registered_via_sc_query() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.reply("sc query missing", 1060, "FAILED 1060");
        let nssm = adapter(tmp.path(), &runner, &settings(tmp.path()));

        assert!(nssm.is_registered("svc").unwrap());
        assert!(!nssm.is_registered("missing").unwrap());
    }

    #[test]
    fn linux_host_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let host = scripted_host(tmp.path(), Platform::Linux, &runner);
        let nssm = InitSystemKind::Nssm.create(&host, "default", &settings(tmp.path()));
        assert!(matches!(nssm.start("svc"), Err(ServError::PlatformMismatch { .. })));
        assert!(matches!(
            nssm.is_registered("svc"),
            Err(ServError::PlatformMismatch { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn nssm_states() {
        assert_eq!(nssm_state("SERVICE_STOP_PENDING\r\n"), ServiceState::Running);
        assert_eq!(nssm_state("SERVICE_STOPPED"), ServiceState::Stopped);
        assert_eq!(nssm_state("SERVICE_START_PENDING"), ServiceState::Unknown);
    }
}

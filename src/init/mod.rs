mod nssm;
mod runit;
mod supervisor;
mod systemd;
mod sysv;
mod upstart;

pub use nssm::Nssm;
pub use runit::Runit;
pub use supervisor::Supervisor;
pub use systemd::Systemd;
pub use sysv::SysV;
pub use upstart::Upstart;

pub(crate) use systemd::probe as probe_systemd;
pub(crate) use upstart::probe as probe_upstart;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, info_span, warn, Span};

use crate::artifact::{self, ArtifactTarget, GeneratedService, Staging};
use crate::cmd::CommandOutput;
use crate::config::Settings;
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServError};
use crate::host::Host;
use crate::platform::Platform;
use crate::status::StatusRecord;
use crate::template::TemplateEngine;

/// Outcome of a lifecycle operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed,
    /// The service was already in the requested state.
    AlreadyInState,
}

/// Trait for init system adapters (systemd, upstart, sysv, ...)
///
/// One adapter is created per operation through [`InitSystemKind::create`].
/// Everything that touches the managed system checks the platform first;
/// generation alone works anywhere.
pub trait InitSystem: Send + Sync {
    fn kind(&self) -> InitSystemKind;

    /// Host, version and tracing span this adapter is bound to.
    fn binding(&self) -> &Binding;

    /// Platforms this init system can be driven from.
    fn supported_platforms(&self) -> &'static [Platform];

    /// Destinations of every artifact for service `name`.
    fn targets(&self, name: &str) -> Result<Vec<ArtifactTarget>>;

    /// Template parameters: the descriptor's plus framework-specific ones.
    fn parameters(&self, descriptor: &ServiceDescriptor) -> Result<Map<String, Value>> {
        Ok(descriptor.template_context())
    }

    /// Register deployed artifacts with the init system.
    fn install(&self, name: &str) -> Result<Transition>;

    fn start(&self, name: &str) -> Result<Transition>;

    fn stop(&self, name: &str) -> Result<Transition>;

    /// Unregister and delete artifacts. Succeeds when nothing is left to remove.
    fn uninstall(&self, name: &str) -> Result<()>;

    /// Status of `name`, or of every service the framework reports.
    fn status(&self, name: Option<&str>) -> Result<StatusRecord>;

    /// Whether the init system is installed and answering on this host.
    fn is_present(&self) -> bool;

    fn is_registered(&self, name: &str) -> Result<bool>;

    /// Template version in use.
    fn version(&self) -> &str {
        &self.binding().version
    }

    fn validate_platform(&self) -> Result<()> {
        let platform = self.binding().host.platform();
        if self.supported_platforms().contains(&platform) {
            Ok(())
        } else {
            Err(ServError::PlatformMismatch {
                init_system: self.kind().to_string(),
                platform: platform.to_string(),
            })
        }
    }

    /// Render every artifact for `descriptor` into the staging directory.
    fn generate(
        &self,
        descriptor: &ServiceDescriptor,
        engine: &TemplateEngine,
        overwrite: bool,
    ) -> Result<GeneratedService> {
        let binding = self.binding();
        let _guard = binding.span.enter();

        if let Some(kind) = descriptor.init_system() {
            if kind != self.kind() {
                return Err(ServError::invalid(
                    "init_system",
                    format!("descriptor is for {}, adapter is {}", kind, self.kind()),
                ));
            }
        }

        let params = Value::Object(self.parameters(descriptor)?);
        let staging = Staging::new(&binding.staging_dir, self.kind().name(), descriptor.name());

        let mut artifacts = Vec::new();
        for target in self.targets(descriptor.name())? {
            let rendered = engine.render(&target.template, &params)?;
            artifacts.push(staging.write(&target, &rendered, overwrite)?);
        }

        info!(
            service = %descriptor.name(),
            artifacts = artifacts.len(),
            staging = %staging.dir().display(),
            "Generated artifacts"
        );

        Ok(GeneratedService {
            name: descriptor.name().to_string(),
            artifacts,
        })
    }

    /// Move generated artifacts to their system locations.
    fn deploy(&self, generated: &GeneratedService, overwrite: bool) -> Result<Vec<PathBuf>> {
        self.validate_platform()?;
        let _guard = self.binding().span.enter();
        artifact::deploy(generated, overwrite)
    }
}

/// State shared by every adapter.
#[derive(Debug, Clone)]
pub struct Binding {
    pub host: Host,
    /// Template version, always one the init system ships templates for.
    pub version: String,
    /// Version as requested or probed (`249`), reported in status records.
    pub reported_version: String,
    pub staging_dir: PathBuf,
    pub span: Span,
}

impl Binding {
    fn new(kind: InitSystemKind, host: &Host, version: &str, settings: &Settings) -> Self {
        let template_version = kind.resolve_version(version).to_string();
        let span = info_span!(parent: host.span(), "init", system = kind.name(), version = %version);
        Self {
            host: host.clone(),
            version: template_version,
            reported_version: version.to_string(),
            staging_dir: settings.paths.staging_dir.clone(),
            span,
        }
    }

    /// Template identifier `<kind>_<version><suffix>`.
    fn template(&self, kind: InitSystemKind, suffix: &str) -> String {
        format!("{}_{}{}", kind.name(), self.version, suffix)
    }

    fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.host.resolve(rel)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.host.run(program, args)
    }

    /// Run a command whose failure is logged and otherwise ignored.
    fn run_tolerant(&self, program: &str, args: &[&str]) {
        match self.host.run(program, args) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(command = %out.command, code = ?out.code, output = %out.text(), "Ignoring failed command"),
            Err(e) => warn!(error = %e, "Ignoring failed command"),
        }
    }
}

/// Available init system adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystemKind {
    Systemd,
    Upstart,
    SysV,
    Nssm,
    Supervisor,
    Runit,
}

impl InitSystemKind {
    pub fn all() -> &'static [InitSystemKind] {
        &[
            InitSystemKind::Systemd,
            InitSystemKind::Upstart,
            InitSystemKind::SysV,
            InitSystemKind::Nssm,
            InitSystemKind::Supervisor,
            InitSystemKind::Runit,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            InitSystemKind::Systemd => "systemd",
            InitSystemKind::Upstart => "upstart",
            InitSystemKind::SysV => "sysv",
            InitSystemKind::Nssm => "nssm",
            InitSystemKind::Supervisor => "supervisor",
            InitSystemKind::Runit => "runit",
        }
    }

    /// Template sets shipped for this init system; the first is the fallback.
    pub fn template_versions(&self) -> &'static [&'static str] {
        match self {
            InitSystemKind::Upstart => &["1.5", "default"],
            InitSystemKind::SysV => &["lsb-3.1"],
            _ => &["default"],
        }
    }

    /// Map a requested or probed version to a shipped template set.
    pub fn resolve_version(&self, version: &str) -> &'static str {
        let versions = self.template_versions();
        versions
            .iter()
            .copied()
            .find(|v| *v == version)
            .unwrap_or(versions[0])
    }

    pub fn create(self, host: &Host, version: &str, settings: &Settings) -> Box<dyn InitSystem> {
        let binding = Binding::new(self, host, version, settings);
        match self {
            InitSystemKind::Systemd => Box::new(Systemd::new(binding, settings)),
            InitSystemKind::Upstart => Box::new(Upstart::new(binding, settings)),
            InitSystemKind::SysV => Box::new(SysV::new(binding, settings)),
            InitSystemKind::Nssm => Box::new(Nssm::new(binding, settings)),
            InitSystemKind::Supervisor => Box::new(Supervisor::new(binding, settings)),
            InitSystemKind::Runit => Box::new(Runit::new(binding, settings)),
        }
    }
}

impl fmt::Display for InitSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InitSystemKind {
    type Err = ServError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        InitSystemKind::all()
            .iter()
            .copied()
            .find(|kind| kind.name() == lower)
            .ok_or_else(|| ServError::UnsupportedInitSystem {
                name: s.to_string(),
            })
    }
}

/// Parse a leading process id such as `1234` or `1234)`.
pub(crate) fn parse_pid(token: &str) -> Option<u32> {
    let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scripted_host, ScriptedRunner};

    #[test]
    fn parse_known_kinds() {
        assert_eq!("systemd".parse::<InitSystemKind>().unwrap(), InitSystemKind::Systemd);
        assert_eq!("SysV".parse::<InitSystemKind>().unwrap(), InitSystemKind::SysV);
        assert_eq!("nssm".parse::<InitSystemKind>().unwrap(), InitSystemKind::Nssm);
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        match "launchd".parse::<InitSystemKind>() {
            Err(ServError::UnsupportedInitSystem { name }) => assert_eq!(name, "launchd"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn all_kinds_round_trip_through_names() {
        for kind in InitSystemKind::all() {
            assert_eq!(kind.name().parse::<InitSystemKind>().unwrap(), *kind);
        }
        assert_eq!(InitSystemKind::all().len(), 6);
    }

    #[test]
    fn unknown_versions_fall_back() {
        assert_eq!(InitSystemKind::Upstart.resolve_version("1.5"), "1.5");
        assert_eq!(InitSystemKind::Upstart.resolve_version("0.6"), "1.5");
        assert_eq!(InitSystemKind::Systemd.resolve_version("249"), "default");
        assert_eq!(InitSystemKind::SysV.resolve_version("default"), "lsb-3.1");
    }

    #[test]
    fn create_every_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let host = scripted_host(tmp.path(), Platform::Linux, &runner);
        let settings = Settings::default();
        for kind in InitSystemKind::all() {
            let adapter = kind.create(&host, "default", &settings);
            assert_eq!(adapter.kind(), *kind);
        }
    }

    #[test]
    fn platform_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let settings = Settings::default();

        let linux = scripted_host(tmp.path(), Platform::Linux, &runner);
        assert!(InitSystemKind::Systemd
            .create(&linux, "default", &settings)
            .validate_platform()
            .is_ok());
        match InitSystemKind::Nssm
            .create(&linux, "default", &settings)
            .validate_platform()
        {
            Err(ServError::PlatformMismatch { init_system, platform }) => {
                assert_eq!(init_system, "nssm");
                assert_eq!(platform, "Linux");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let windows = scripted_host(tmp.path(), Platform::Windows, &runner);
        assert!(InitSystemKind::Systemd
            .create(&windows, "default", &settings)
            .validate_platform()
            .is_err());
        assert!(InitSystemKind::SysV
            .create(&windows, "lsb-3.1", &settings)
            .validate_platform()
            .is_err());

        let mac = scripted_host(tmp.path(), Platform::MacOs, &runner);
        assert!(InitSystemKind::Supervisor
            .create(&mac, "default", &settings)
            .validate_platform()
            .is_ok());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn pids() {
        assert_eq!(parse_pid("1234"), Some(1234));
        assert_eq!(parse_pid("1234)"), Some(1234));
        assert_eq!(parse_pid("abc"), None);
    }
}

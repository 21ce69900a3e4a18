//! Init system selection for a host.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Settings;
use crate::distro::OsRelease;
use crate::error::{Result, ServError};
use crate::host::Host;
use crate::init::{probe_systemd, probe_upstart, InitSystem, InitSystemKind};
use crate::platform::Platform;

/// How a selection was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Explicit,
    Platform,
    Distro,
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub kind: InitSystemKind,
    pub version: String,
    pub source: Source,
}

impl Selection {
    fn new(kind: InitSystemKind, version: impl Into<String>, source: Source) -> Self {
        Self {
            kind,
            version: version.into(),
            source,
        }
    }

    pub fn create(&self, host: &Host, settings: &Settings) -> Box<dyn InitSystem> {
        self.kind.create(host, &self.version, settings)
    }
}

/// Pick the init system for `host`.
///
/// An explicit choice is taken as is. Otherwise Windows means nssm, macOS is
/// refused, and other hosts are matched against the distribution table and
/// then probed.
pub fn select(host: &Host, choice: Option<InitSystemKind>, version: Option<&str>) -> Result<Selection> {
    if let Some(kind) = choice {
        return Ok(Selection::new(kind, version.unwrap_or("default"), Source::Explicit));
    }

    let selection = match host.platform() {
        Platform::Windows => Selection::new(InitSystemKind::Nssm, "default", Source::Platform),
        Platform::MacOs => {
            return Err(ServError::UnsupportedInitSystem {
                name: "launchd".to_string(),
            })
        }
        Platform::Linux | Platform::OtherUnix => match from_distro(host).or_else(|| probe(host)) {
            Some(selection) => selection,
            None => {
                return Err(ServError::unavailable(
                    "any",
                    "no known distribution and no init system could be probed",
                ))
            }
        },
    };

    info!(
        init_system = %selection.kind,
        version = %selection.version,
        source = ?selection.source,
        "Selected init system"
    );
    Ok(selection)
}

/// Resolve and build the adapter in one step.
pub fn select_adapter(
    host: &Host,
    settings: &Settings,
    choice: Option<InitSystemKind>,
    version: Option<&str>,
) -> Result<Box<dyn InitSystem>> {
    Ok(select(host, choice, version)?.create(host, settings))
}

fn from_distro(host: &Host) -> Option<Selection> {
    let release = OsRelease::read(host)?;
    let init = release.init_system();
    debug!(id = %release.id, version = ?release.version_id, found = init.is_some(), "Distribution lookup");
    init.map(|init| Selection::new(init.kind, init.version, Source::Distro))
}

fn probe(host: &Host) -> Option<Selection> {
    if host.resolve("usr/lib/systemd").is_dir() {
        if let Some(version) = probe_systemd(host) {
            return Some(Selection::new(InitSystemKind::Systemd, version, Source::Probe));
        }
    }
    if host.resolve("usr/share/upstart").is_dir() {
        if let Some(version) = probe_upstart(host) {
            return Some(Selection::new(InitSystemKind::Upstart, version, Source::Probe));
        }
    }
    if host.resolve("etc/init.d").is_dir() {
        return Some(Selection::new(InitSystemKind::SysV, "lsb-3.1", Source::Probe));
    }
    None
}

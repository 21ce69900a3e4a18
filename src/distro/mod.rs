//! Distribution identification and the distro → init system table.

use std::collections::HashMap;
use std::fs;

use tracing::debug;

use crate::host::Host;
use crate::init::InitSystemKind;
use crate::init::InitSystemKind::{SysV, Systemd, Upstart};

const OS_RELEASE_PATHS: [&str; 2] = ["etc/os-release", "usr/lib/os-release"];

/// Release numbers a table row applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Rolling releases
    Any,
    Exactly(u32),
    Between(u32, u32),
    From(u32),
}

impl Release {
    pub fn matches(&self, major: Option<u32>) -> bool {
        match (self, major) {
            (Release::Any, _) => true,
            (Release::Exactly(v), Some(m)) => m == *v,
            (Release::Between(lo, hi), Some(m)) => (*lo..=*hi).contains(&m),
            (Release::From(v), Some(m)) => m >= *v,
            (_, None) => false,
        }
    }
}

/// Init system a distribution release ships, with its template version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistroInit {
    pub kind: InitSystemKind,
    pub version: &'static str,
}

const fn row(
    id: &'static str,
    release: Release,
    kind: InitSystemKind,
    version: &'static str,
) -> (&'static str, Release, DistroInit) {
    (id, release, DistroInit { kind, version })
}

const TABLE: &[(&str, Release, DistroInit)] = &[
    row("centos", Release::Exactly(5), SysV, "lsb-3.1"),
    row("centos", Release::Exactly(6), Upstart, "default"),
    row("centos", Release::From(7), Systemd, "default"),
    row("rhel", Release::Exactly(5), SysV, "lsb-3.1"),
    row("rhel", Release::Exactly(6), Upstart, "default"),
    row("rhel", Release::From(7), Systemd, "default"),
    row("redhat", Release::Exactly(5), SysV, "lsb-3.1"),
    row("redhat", Release::Exactly(6), Upstart, "default"),
    row("redhat", Release::From(7), Systemd, "default"),
    row("debian", Release::Between(6, 7), SysV, "lsb-3.1"),
    row("debian", Release::From(8), Systemd, "default"),
    row("fedora", Release::From(15), Systemd, "default"),
    row("opensuse", Release::Exactly(12), SysV, "lsb-3.1"),
    row("opensuse", Release::From(13), Systemd, "default"),
    row("ubuntu", Release::Between(12, 14), Upstart, "1.5"),
    row("ubuntu", Release::From(15), Systemd, "default"),
    row("arch", Release::Any, Systemd, "default"),
];

/// Look up the init system for a distribution id and major release.
pub fn lookup(id: &str, major: Option<u32>) -> Option<DistroInit> {
    let id = id.to_lowercase();
    TABLE
        .iter()
        .find(|(row_id, release, _)| *row_id == id && release.matches(major))
        .map(|(_, _, init)| *init)
}

/// Fields of `/etc/os-release` relevant to init system selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
    pub pretty_name: Option<String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let fields: HashMap<&str, String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), unquote(value.trim())))
            .collect();

        Self {
            id: fields.get("ID").cloned().unwrap_or_default().to_lowercase(),
            id_like: fields
                .get("ID_LIKE")
                .map(|v| v.split_whitespace().map(str::to_lowercase).collect())
                .unwrap_or_default(),
            version_id: fields.get("VERSION_ID").cloned(),
            pretty_name: fields.get("PRETTY_NAME").cloned(),
        }
    }

    /// Read os-release under the host root. `None` when neither file exists.
    pub fn read(host: &Host) -> Option<Self> {
        OS_RELEASE_PATHS.iter().find_map(|rel| {
            let path = host.resolve(rel);
            let content = fs::read_to_string(&path).ok()?;
            debug!(path = %path.display(), "Read os-release");
            Some(Self::parse(&content))
        })
    }

    /// Leading number of `VERSION_ID`, e.g. `7` for `7.9.2009`.
    pub fn major_version(&self) -> Option<u32> {
        let version = self.version_id.as_deref()?;
        let digits: String = version.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    /// Table entry for `ID`, then for each `ID_LIKE` entry in order.
    pub fn init_system(&self) -> Option<DistroInit> {
        let major = self.major_version();
        std::iter::once(&self.id)
            .chain(self.id_like.iter())
            .filter(|id| !id.is_empty())
            .find_map(|id| lookup(id, major))
    }
}

fn unquote(value: &str) -> String {
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);
    value.to_string()
}

use serde::Serialize;

/// Host platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    /// BSDs and other POSIX systems
    OtherUnix,
    Windows,
}

impl Platform {
    /// Platform this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::OtherUnix
        }
    }

    /// Get a human-readable name for this platform
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "Linux",
            Platform::MacOs => "macOS",
            Platform::OtherUnix => "Unix",
            Platform::Windows => "Windows",
        }
    }

    pub fn is_posix(&self) -> bool {
        !matches!(self, Platform::Windows)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Platforms where POSIX init scripts can be driven
pub const UNIX: &[Platform] = &[Platform::Linux, Platform::OtherUnix];

pub const LINUX_ONLY: &[Platform] = &[Platform::Linux];

pub const WINDOWS_ONLY: &[Platform] = &[Platform::Windows];

pub const POSIX: &[Platform] = &[Platform::Linux, Platform::MacOs, Platform::OtherUnix];

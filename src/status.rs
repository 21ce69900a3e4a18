//! Normalized status model shared by every init system.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::init::InitSystemKind;

/// Whether the framework itself answered the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Failed,
    Unknown,
    /// The framework could not be reached to ask.
    Offline,
}

/// One service as reported by its init system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    /// Framework-specific columns kept verbatim.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>, state: ServiceState) -> Self {
        Self {
            name: name.into(),
            state,
            pid: None,
            uptime: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_uptime(mut self, uptime: impl Into<String>) -> Self {
        self.uptime = Some(uptime.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub init_system: InitSystemKind,
    pub init_system_version: String,
    pub framework_state: FrameworkState,
    pub queried_at: DateTime<Utc>,
    pub services: Vec<ServiceStatus>,
}

impl StatusRecord {
    pub fn online(
        init_system: InitSystemKind,
        version: impl Into<String>,
        services: Vec<ServiceStatus>,
    ) -> Self {
        Self {
            init_system,
            init_system_version: version.into(),
            framework_state: FrameworkState::Online,
            queried_at: Utc::now(),
            services,
        }
    }

    /// The framework did not answer. A requested name is still reported,
    /// as `offline`.
    pub fn offline(init_system: InitSystemKind, version: impl Into<String>, name: Option<&str>) -> Self {
        let services = name
            .map(|n| vec![ServiceStatus::new(n, ServiceState::Offline)])
            .unwrap_or_default();
        Self {
            init_system,
            init_system_version: version.into(),
            framework_state: FrameworkState::Offline,
            queried_at: Utc::now(),
            services,
        }
    }

    /// Look up a service by name, accepting suffixed forms such as `name.service`.
    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| matches_name(&s.name, name))
    }
}

/// True if `candidate` is `name` or `name` followed by a `.suffix`.
pub(crate) fn matches_name(candidate: &str, name: &str) -> bool {
    match candidate.strip_prefix(name) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// Keep only entries for `name`, if one was requested.
pub(crate) fn filter_by_name(services: Vec<ServiceStatus>, name: Option<&str>) -> Vec<ServiceStatus> {
    match name {
        Some(name) => services
            .into_iter()
            .filter(|s| matches_name(&s.name, name))
            .collect(),
        None => services,
    }
}

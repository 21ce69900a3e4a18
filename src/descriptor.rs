//! Service descriptor: the validated description of a service to manage.
//!
//! A descriptor is built fresh for every operation through
//! [`DescriptorBuilder`], which applies defaults and refuses to produce a
//! descriptor unless every field passes validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::error::{Result, ServError};
use crate::init::InitSystemKind;

/// Sentinel accepted by every resource limit.
pub const UNLIMITED: &str = "unlimited";

pub const DEFAULT_DESCRIPTION: &str = "no description given";
pub const DEFAULT_VERSION: &str = "default";

const NICE_RANGE: std::ops::RangeInclusive<i32> = -20..=19;
const MAX_UMASK: u32 = 0o777;

/// Resource limits a service can be started with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LimitKind {
    CoreDump,
    CpuTime,
    Data,
    FileSize,
    LockedMemory,
    OpenFiles,
    UserProcesses,
    PhysicalMemory,
    StackSize,
}

impl LimitKind {
    pub const ALL: [LimitKind; 9] = [
        LimitKind::CoreDump,
        LimitKind::CpuTime,
        LimitKind::Data,
        LimitKind::FileSize,
        LimitKind::LockedMemory,
        LimitKind::OpenFiles,
        LimitKind::UserProcesses,
        LimitKind::PhysicalMemory,
        LimitKind::StackSize,
    ];

    /// Parameter name, as used in templates and error messages
    pub fn param(&self) -> &'static str {
        match self {
            LimitKind::CoreDump => "limit_coredump",
            LimitKind::CpuTime => "limit_cputime",
            LimitKind::Data => "limit_data",
            LimitKind::FileSize => "limit_file_size",
            LimitKind::LockedMemory => "limit_locked_memory",
            LimitKind::OpenFiles => "limit_open_files",
            LimitKind::UserProcesses => "limit_user_processes",
            LimitKind::PhysicalMemory => "limit_physical_memory",
            LimitKind::StackSize => "limit_stack_size",
        }
    }

    /// Look up a limit by parameter name; dashes and the `limit` prefix are optional.
    pub fn from_param(param: &str) -> Option<Self> {
        let normalized = param.replace('-', "_");
        let normalized = normalized.trim_start_matches("limit_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.param().trim_start_matches("limit_") == normalized)
    }

    /// `ulimit` flag for shell-based init scripts
    pub fn ulimit_flag(&self) -> &'static str {
        match self {
            LimitKind::CoreDump => "-c",
            LimitKind::CpuTime => "-t",
            LimitKind::Data => "-d",
            LimitKind::FileSize => "-f",
            LimitKind::LockedMemory => "-l",
            LimitKind::OpenFiles => "-n",
            LimitKind::UserProcesses => "-u",
            LimitKind::PhysicalMemory => "-m",
            LimitKind::StackSize => "-s",
        }
    }

    /// systemd `[Service]` directive
    pub fn systemd_directive(&self) -> &'static str {
        match self {
            LimitKind::CoreDump => "LimitCORE",
            LimitKind::CpuTime => "LimitCPU",
            LimitKind::Data => "LimitDATA",
            LimitKind::FileSize => "LimitFSIZE",
            LimitKind::LockedMemory => "LimitMEMLOCK",
            LimitKind::OpenFiles => "LimitNOFILE",
            LimitKind::UserProcesses => "LimitNPROC",
            LimitKind::PhysicalMemory => "LimitRSS",
            LimitKind::StackSize => "LimitSTACK",
        }
    }

    /// upstart `limit` stanza resource name
    pub fn upstart_resource(&self) -> &'static str {
        match self {
            LimitKind::CoreDump => "core",
            LimitKind::CpuTime => "cpu",
            LimitKind::Data => "data",
            LimitKind::FileSize => "fsize",
            LimitKind::LockedMemory => "memlock",
            LimitKind::OpenFiles => "nofile",
            LimitKind::UserProcesses => "nproc",
            LimitKind::PhysicalMemory => "rss",
            LimitKind::StackSize => "stack",
        }
    }
}

/// A single resource limit value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Value(u64),
}

impl Limit {
    /// Parse `raw` as either the unlimited sentinel or a strictly positive integer.
    pub fn parse(kind: LimitKind, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == UNLIMITED {
            return Ok(Limit::Unlimited);
        }
        match raw.parse::<u64>() {
            Ok(value) if value > 0 => Ok(Limit::Value(value)),
            _ => Err(ServError::invalid(
                kind.param(),
                format!(
                    "all limits must be integers greater than 0 or `{}`, got '{}'",
                    UNLIMITED, raw
                ),
            )),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => f.write_str(UNLIMITED),
            Limit::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Parse `KEY=VALUE` tokens into an environment map.
///
/// Each token must contain exactly one `=` and a non-empty key.
pub fn parse_env<I, S>(tokens: I) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut env = BTreeMap::new();
    for token in tokens {
        let token = token.as_ref();
        let malformed = || {
            ServError::invalid(
                "environment",
                format!("expected KEY=VALUE, got '{}'", token),
            )
        };
        if token.matches('=').count() != 1 {
            return Err(malformed());
        }
        let (key, value) = token.split_once('=').ok_or_else(malformed)?;
        if key.is_empty() {
            return Err(malformed());
        }
        // every artifact format is line based
        if value.contains(['\n', '\r']) {
            return Err(ServError::invalid(
                "environment",
                format!("value of {} spans several lines", key),
            ));
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Validated description of a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    name: String,
    command: String,
    arguments: String,
    working_directory: String,
    root_directory: String,
    user: String,
    group: String,
    description: String,
    environment: BTreeMap<String, String>,
    limits: BTreeMap<LimitKind, Limit>,
    nice: Option<i32>,
    umask: Option<u32>,
    init_system: Option<InitSystemKind>,
    init_system_version: String,
}

impl ServiceDescriptor {
    pub fn builder(command: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(command)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn root_directory(&self) -> &str {
        &self.root_directory
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn limits(&self) -> &BTreeMap<LimitKind, Limit> {
        &self.limits
    }

    pub fn limit(&self, kind: LimitKind) -> Option<Limit> {
        self.limits.get(&kind).copied()
    }

    pub fn nice(&self) -> Option<i32> {
        self.nice
    }

    pub fn umask(&self) -> Option<u32> {
        self.umask
    }

    pub fn init_system(&self) -> Option<InitSystemKind> {
        self.init_system
    }

    pub fn init_system_version(&self) -> &str {
        &self.init_system_version
    }

    /// Template parameters shared by every init system.
    ///
    /// Optional fields are left out entirely so templates can test them
    /// with `is defined`.
    pub fn template_context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        ctx.insert("name".into(), json!(self.name));
        ctx.insert("cmd".into(), json!(self.command));
        ctx.insert("args".into(), json!(self.arguments));
        ctx.insert("description".into(), json!(self.description));
        ctx.insert("chdir".into(), json!(self.working_directory));
        ctx.insert("chroot".into(), json!(self.root_directory));
        ctx.insert("user".into(), json!(self.user));
        ctx.insert("group".into(), json!(self.group));
        ctx.insert("env".into(), json!(self.environment));
        if let Some(nice) = self.nice {
            ctx.insert("nice".into(), json!(nice));
        }
        if let Some(umask) = self.umask {
            ctx.insert("umask".into(), json!(format!("{:03o}", umask)));
        }
        for (kind, limit) in &self.limits {
            ctx.insert(kind.param().into(), json!(limit.to_string()));
        }
        ctx
    }
}

/// Builder for [`ServiceDescriptor`]
#[derive(Debug, Clone, Default)]
pub struct DescriptorBuilder {
    command: String,
    name: Option<String>,
    arguments: Option<String>,
    working_directory: Option<String>,
    root_directory: Option<String>,
    user: Option<String>,
    group: Option<String>,
    description: Option<String>,
    env_tokens: Vec<String>,
    limits: Vec<(LimitKind, String)>,
    nice: Option<i32>,
    umask: Option<u32>,
    init_system: Option<InitSystemKind>,
    init_system_version: Option<String>,
}

impl DescriptorBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn root_directory(mut self, dir: impl Into<String>) -> Self {
        self.root_directory = Some(dir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add one `KEY=VALUE` environment token.
    pub fn env(mut self, token: impl Into<String>) -> Self {
        self.env_tokens.push(token.into());
        self
    }

    pub fn envs<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Set a resource limit from its raw value (`unlimited` or a positive integer).
    pub fn limit(mut self, kind: LimitKind, raw: impl Into<String>) -> Self {
        self.limits.retain(|(k, _)| *k != kind);
        self.limits.push((kind, raw.into()));
        self
    }

    pub fn nice(mut self, nice: i32) -> Self {
        self.nice = Some(nice);
        self
    }

    pub fn umask(mut self, umask: u32) -> Self {
        self.umask = Some(umask);
        self
    }

    pub fn init_system(mut self, kind: InitSystemKind) -> Self {
        self.init_system = Some(kind);
        self
    }

    pub fn init_system_version(mut self, version: impl Into<String>) -> Self {
        self.init_system_version = Some(version.into());
        self
    }

    /// Apply defaults and validate. The first violation aborts construction.
    pub fn build(self) -> Result<ServiceDescriptor> {
        let command = self.command.trim().to_string();
        if command.is_empty() {
            return Err(ServError::invalid("command", "a command is required"));
        }
        if which::which(&command).is_err() {
            return Err(ServError::ExecutableNotFound {
                path: PathBuf::from(&command),
            });
        }

        if let Some(nice) = self.nice {
            if !NICE_RANGE.contains(&nice) {
                return Err(ServError::invalid(
                    "nice",
                    format!("niceness level must be between -20 and 19, got {}", nice),
                ));
            }
        }

        if let Some(umask) = self.umask {
            if umask > MAX_UMASK {
                return Err(ServError::invalid(
                    "umask",
                    format!("umask must be between 000 and 777, got {:o}", umask),
                ));
            }
        }

        let mut limits = BTreeMap::new();
        for (kind, raw) in &self.limits {
            limits.insert(*kind, Limit::parse(*kind, raw)?);
        }

        let environment = parse_env(&self.env_tokens)?;

        let name = match self.name {
            Some(name) => name,
            None => name_from_command(&command)?,
        };
        validate_name(&name)?;

        Ok(ServiceDescriptor {
            name,
            command,
            arguments: self.arguments.unwrap_or_default(),
            working_directory: self.working_directory.unwrap_or_else(|| "/".into()),
            root_directory: self.root_directory.unwrap_or_else(|| "/".into()),
            user: self.user.unwrap_or_else(|| "root".into()),
            group: self.group.unwrap_or_else(|| "root".into()),
            description: self
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.into()),
            environment,
            limits,
            nice: self.nice,
            umask: self.umask,
            init_system: self.init_system,
            init_system_version: self
                .init_system_version
                .unwrap_or_else(|| DEFAULT_VERSION.into()),
        })
    }
}

/// Derive a service name from the executable's base name.
///
/// Two services wrapping the same binary end up with the same name, so
/// callers running more than one should name them explicitly.
fn name_from_command(command: &str) -> Result<String> {
    Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ServError::invalid("name", "cannot derive a name from the command"))
}

/// Service names end up in file names, so path separators are refused.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_whitespace)
    {
        return Err(ServError::invalid(
            "name",
            format!("'{}' is not a valid service name", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_executable;

    #[test]
    fn defaults_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "mydaemon");
        let d = ServiceDescriptor::builder(exe.to_str().unwrap()).build().unwrap();

        assert_eq!(d.name(), "mydaemon");
        assert_eq!(d.description(), DEFAULT_DESCRIPTION);
        assert_eq!(d.working_directory(), "/");
        assert_eq!(d.root_directory(), "/");
        assert_eq!(d.user(), "root");
        assert_eq!(d.group(), "root");
        assert_eq!(d.init_system_version(), "default");
        assert!(d.environment().is_empty());
        assert!(d.limits().is_empty());
    }

    #[test]
    fn missing_executable_names_the_path() {
        let err = ServiceDescriptor::builder("/nonexistent/bin/thing")
            .build()
            .unwrap_err();
        match err {
            ServError::ExecutableNotFound { path } => {
                assert_eq!(path, PathBuf::from("/nonexistent/bin/thing"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn empty_command_is_invalid() {
        let err = ServiceDescriptor::builder("  ").build().unwrap_err();
        assert!(matches!(err, ServError::InvalidParameter { ref param, .. } if param == "command"));
    }

    #[test]
    fn niceness_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let exe = exe.to_str().unwrap();

        assert!(ServiceDescriptor::builder(exe).nice(-20).build().is_ok());
        assert!(ServiceDescriptor::builder(exe).nice(19).build().is_ok());
        for nice in [-21, 20, 100] {
            let err = ServiceDescriptor::builder(exe).nice(nice).build().unwrap_err();
            assert!(matches!(err, ServError::InvalidParameter { ref param, .. } if param == "nice"));
        }
    }

    #[test]
    fn every_limit_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let exe = exe.to_str().unwrap();

        for kind in LimitKind::ALL {
            for bad in ["abc", "0", "-5", "1.5", "ulimited", ""] {
                let err = ServiceDescriptor::builder(exe)
                    .limit(kind, bad)
                    .build()
                    .unwrap_err();
                match err {
                    ServError::InvalidParameter { param, reason } => {
                        assert_eq!(param, kind.param());
                        assert!(reason.contains(&format!("'{}'", bad)));
                    }
                    other => panic!("unexpected: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn limits_accept_unlimited_and_positive() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let d = ServiceDescriptor::builder(exe.to_str().unwrap())
            .limit(LimitKind::OpenFiles, "4096")
            .limit(LimitKind::CoreDump, "unlimited")
            .build()
            .unwrap();
        assert_eq!(d.limit(LimitKind::OpenFiles), Some(Limit::Value(4096)));
        assert_eq!(d.limit(LimitKind::CoreDump), Some(Limit::Unlimited));
        assert_eq!(d.limit(LimitKind::StackSize), None);
    }

    #[test]
    fn env_tokens_are_parsed() {
        let env = parse_env(["a=b", "b=c"]).unwrap();
        assert_eq!(env.get("a").map(String::as_str), Some("b"));
        assert_eq!(env.get("b").map(String::as_str), Some("c"));
    }

    #[test]
    fn env_tokens_need_exactly_one_separator() {
        assert!(parse_env(["novalue"]).is_err());
        assert!(parse_env(["a=b=c"]).is_err());
        assert!(parse_env(["=value"]).is_err());
        assert!(parse_env(["EMPTY="]).is_ok());
    }

    #[test]
    fn env_values_stay_on_one_line() {
        assert!(parse_env(["MOTD=hello\nworld"]).is_err());
        assert!(parse_env(["MOTD=hello\r"]).is_err());
        assert!(parse_env(["MOTD=it's \"quoted\" $HOME"]).is_ok());
    }

    #[test]
    fn malformed_env_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let err = ServiceDescriptor::builder(exe.to_str().unwrap())
            .env("KEY1=VALUE1")
            .env("BROKEN")
            .build()
            .unwrap_err();
        assert!(matches!(err, ServError::InvalidParameter { ref param, .. } if param == "environment"));
    }

    #[test]
    fn umask_range() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let exe = exe.to_str().unwrap();
        assert!(ServiceDescriptor::builder(exe).umask(0o022).build().is_ok());
        assert!(ServiceDescriptor::builder(exe).umask(0o1000).build().is_err());
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let exe = exe.to_str().unwrap();
        for bad in ["a/b", "..", "with space", ""] {
            assert!(ServiceDescriptor::builder(exe).name(bad).build().is_err());
        }
    }

    #[test]
    fn limit_kind_lookup() {
        assert_eq!(LimitKind::from_param("limit-open-files"), Some(LimitKind::OpenFiles));
        assert_eq!(LimitKind::from_param("limit_coredump"), Some(LimitKind::CoreDump));
        assert_eq!(LimitKind::from_param("stack_size"), Some(LimitKind::StackSize));
        assert_eq!(LimitKind::from_param("bogus"), None);
    }

    #[test]
    fn template_context_omits_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_executable(dir.path(), "svc");
        let d = ServiceDescriptor::builder(exe.to_str().unwrap())
            .env("KEY1=VALUE1")
            .umask(0o22)
            .build()
            .unwrap();
        let ctx = d.template_context();
        assert_eq!(ctx["name"], "svc");
        assert_eq!(ctx["env"]["KEY1"], "VALUE1");
        assert_eq!(ctx["umask"], "022");
        assert!(!ctx.contains_key("nice"));
        assert!(!ctx.contains_key("limit_coredump"));
    }
}

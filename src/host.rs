//! The machine being managed: filesystem root, platform and command runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info_span, Span};

use crate::cmd::{CommandOutput, CommandRunner, SystemRunner};
use crate::config::Settings;
use crate::error::Result;
use crate::platform::Platform;

/// Context every adapter operates in.
///
/// Framework directories are resolved against `root`, which is `/` in
/// production and a temporary directory in tests. Paths written *into*
/// artifacts (a unit's `EnvironmentFile=`, a runit symlink target) are
/// always absolute on the managed system, see [`Host::system_path`].
#[derive(Clone)]
pub struct Host {
    root: PathBuf,
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    span: Span,
}

impl Host {
    pub fn new(root: impl Into<PathBuf>, platform: Platform, runner: Arc<dyn CommandRunner>) -> Self {
        let root = root.into();
        let span = info_span!("serv", root = %root.display(), platform = %platform);
        Self {
            root,
            platform,
            runner,
            span,
        }
    }

    /// The local machine, as configured by `settings`.
    pub fn local(settings: &Settings) -> Self {
        let runner = SystemRunner::new(Duration::from_secs(settings.commands.timeout_seconds));
        Self::new(&settings.paths.root, Platform::current(), Arc::new(runner))
    }

    /// Record this host's events under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Location of `rel` on this host's filesystem.
    pub fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    /// Location of `rel` as seen by the managed system itself.
    pub fn system_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        if self.platform == Platform::Windows {
            return rel.as_ref().to_path_buf();
        }
        Path::new("/").join(rel)
    }

    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(program, args)
    }

    pub fn locate(&self, program: &str) -> Option<PathBuf> {
        self.runner.locate(program)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("root", &self.root)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

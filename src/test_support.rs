//! Helpers shared by unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cmd::{command_line, CommandOutput, CommandRunner};
use crate::error::{Result, ServError};
use crate::host::Host;
use crate::platform::Platform;

/// Write an executable shell script named `name` into `dir`.
pub fn fake_executable(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

enum Reply {
    Output { code: i32, stdout: String, stderr: String },
    Timeout,
}

/// Command runner answering from a script instead of spawning processes.
///
/// Replies are matched by command-line prefix; the most recently registered
/// match wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
    programs: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, prefix: &str, code: i32, stdout: &str) -> &Self {
        self.reply_full(prefix, code, stdout, "")
    }

    pub fn reply_full(&self, prefix: &str, code: i32, stdout: &str, stderr: &str) -> &Self {
        self.replies.lock().unwrap().push((
            prefix.to_string(),
            Reply::Output {
                code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn time_out(&self, prefix: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .push((prefix.to_string(), Reply::Timeout));
        self
    }

    /// Make `locate(program)` succeed.
    pub fn with_program(&self, program: &str) -> &Self {
        self.programs.lock().unwrap().push(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());

        let replies = self.replies.lock().unwrap();
        match replies.iter().rev().find(|(p, _)| line.starts_with(p.as_str())) {
            Some((_, Reply::Output { code, stdout, stderr })) => Ok(CommandOutput::new(
                line,
                Some(*code),
                stdout.as_str(),
                stderr.as_str(),
            )),
            Some((_, Reply::Timeout)) => Err(ServError::CommandTimedOut {
                command: line,
                timeout_secs: 60,
            }),
            None => Ok(CommandOutput::new(line, Some(0), "", "")),
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.programs
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.as_str() == program)
            .map(|p| PathBuf::from("/usr/bin").join(p))
    }
}

/// Host rooted at `root` that answers commands from `runner`.
pub fn scripted_host(root: &Path, platform: Platform, runner: &Arc<ScriptedRunner>) -> Host {
    let runner: Arc<dyn CommandRunner> = runner.clone();
    Host::new(root, platform, runner)
}

//! External command execution.
//!
//! Every control command (systemctl, initctl, sc, supervisorctl, ...) goes
//! through a [`CommandRunner`] so adapters never spawn processes directly.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, ServError};

/// Default limit for a single control command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Minimum time left to collect output once the command has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Captured result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Command line as it was run, for diagnostics.
    pub command: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(
        command: impl Into<String>,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, trimmed.
    pub fn text(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{}\n{}", stdout, stderr),
            (false, true) => stdout.to_string(),
            _ => stderr.to_string(),
        }
    }

    /// Case-insensitive search over both streams.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.stdout.to_lowercase().contains(&needle)
            || self.stderr.to_lowercase().contains(&needle)
    }

    pub fn into_error(self) -> ServError {
        let output = self.text();
        ServError::CommandFailed {
            command: self.command,
            code: self.code,
            output,
        }
    }

    /// Turn a non-zero exit into [`ServError::CommandFailed`].
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }
}

/// Runs framework control commands.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion, capturing its output.
    ///
    /// A non-zero exit is not an error at this level; adapters decide which
    /// exit codes are benign.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Resolve `program` on the search path.
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Runs commands on the local host with a kill-on-expiry timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command = command_line(program, args);
        debug!(
            command = %command,
            timeout_secs = self.timeout.as_secs(),
            "Running command"
        );

        let mut builder = Command::new(program);
        builder
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // own process group, so expiry also reaches whatever the command forked
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut builder, 0);

        let mut child = builder
            .spawn()
            .map_err(|e| ServError::CommandFailed {
                command: command.clone(),
                code: None,
                output: format!("failed to spawn {}: {}", program, e),
            })?;

        // pipes are drained while polling, a full pipe would stall the child
        let (tx, rx) = mpsc::channel();
        let mut captured = Captured::default();
        if let Some(pipe) = child.stdout.take() {
            spawn_reader(pipe, Stream::Stdout, tx.clone());
            captured.open += 1;
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader(pipe, Stream::Stderr, tx);
            captured.open += 1;
        }

        let start = Instant::now();
        let deadline = start + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() > deadline {
                        warn!(
                            command = %command,
                            timeout_secs = self.timeout.as_secs(),
                            "Command timed out, killing"
                        );
                        if let Err(e) = kill_group(&mut child) {
                            warn!(error = %e, "Failed to kill timed-out command");
                        }
                        let _ = child.wait();
                        return Err(ServError::CommandTimedOut {
                            command,
                            timeout_secs: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(ServError::CommandFailed {
                        command,
                        code: None,
                        output: format!("failed to wait for {}: {}", program, e),
                    });
                }
            }
        };

        // a forked daemon may keep the pipes open long after the command exits
        let drain_until = deadline.max(Instant::now() + DRAIN_GRACE);
        if !captured.collect(&rx, drain_until) {
            warn!(
                command = %command,
                "Output still held open by a background process, returning what was read"
            );
        }

        let output = CommandOutput::new(
            command,
            status.code(),
            decode(&captured.stdout),
            decode(&captured.stderr),
        );
        debug!(
            command = %output.command,
            code = ?output.code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command completed"
        );
        Ok(output)
    }
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL)?;
    Ok(())
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// `None` marks end of stream.
type Chunk = (Stream, Option<Vec<u8>>);

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R, stream: Stream, tx: Sender<Chunk>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, Some(buf[..n].to_vec()))).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send((stream, None));
    });
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    open: usize,
}

impl Captured {
    /// Read chunks until both streams close or `until` passes.
    /// Returns false if a stream was still open at the deadline.
    fn collect(&mut self, rx: &Receiver<Chunk>, until: Instant) -> bool {
        while self.open > 0 {
            let remaining = until.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((_, None)) => self.open -= 1,
                Ok((Stream::Stdout, Some(bytes))) => self.stdout.extend_from_slice(&bytes),
                Ok((Stream::Stderr, Some(bytes))) => self.stderr.extend_from_slice(&bytes),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        true
    }
}

/// Decode command output; Windows tools such as nssm emit UTF-16LE.
pub fn decode(bytes: &[u8]) -> String {
    if looks_like_utf16le(bytes) {
        let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return true;
    }
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return false;
    }
    let zero_high = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    zero_high * 2 >= bytes.len() / 2
}

//! External command execution
//!
//! Every OS-level action (sysctl, the instance control binary, connection
//! probes) goes through `CommandRunner` so handlers can be driven by a fake
//! in tests. `SystemRunner` enforces a hard timeout: the child is killed when
//! the budget runs out, and captured output is capped.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum output length to capture per stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub program: String,
    pub args: Vec<String>,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Exit-0 output, mostly for fakes
    pub fn ok(program: &str, args: &[&str], stdout: impl Into<String>) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }

    pub fn failed(program: &str, args: &[&str], exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Self::ok(program, args, "")
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn display_command(&self) -> String {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        display_command(&self.program, &args)
    }

    /// Short failure description for error messages
    pub fn failure_summary(&self) -> String {
        let code = self
            .exit_code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("{} failed with {}", self.display_command(), code)
        } else {
            format!("{} failed with {}: {}", self.display_command(), code, stderr)
        }
    }
}

/// Render a command line the way it would be typed
pub fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("Cannot start {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Failed waiting for {command}: {reason}")]
    Wait { command: String, reason: String },
}

/// Runs external programs
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, ExecError>;
}

// ============================================================================
// System runner
// ============================================================================

/// Runs real processes, polling for exit and killing on timeout
#[derive(Debug, Clone)]
pub struct SystemRunner {
    poll_interval: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, ExecError> {
        let command = display_command(program, args);
        let start = Instant::now();
        debug!(command = %command, timeout_secs = timeout.as_secs(), "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        // Drain pipes on their own threads so a chatty child cannot block on a full pipe
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= timeout => {
                    warn!(command = %command, "Command exceeded timeout, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecError::Timeout { command, timeout });
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    let _ = child.kill();
                    return Err(ExecError::Wait {
                        command,
                        reason: e.to_string(),
                    });
                }
            }
        };

        // A background grandchild can keep the pipes open past our child's exit,
        // so collection shares the original deadline.
        let deadline = start + timeout;
        let stdout = stdout_reader
            .map(|rx| collect_output(&command, "stdout", rx, deadline))
            .unwrap_or_default();
        let stderr = stderr_reader
            .map(|rx| collect_output(&command, "stderr", rx, deadline))
            .unwrap_or_default();

        Ok(CommandOutput {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            exit_code: status.code(),
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Gather chunks until EOF or the deadline, whichever comes first
fn collect_output(command: &str, stream: &str, rx: Receiver<Vec<u8>>, deadline: Instant) -> String {
    let mut buf = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => {
                if buf.len() < MAX_OUTPUT_BYTES {
                    buf.extend_from_slice(&chunk);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!(command = %command, stream, "Output still open at deadline, returning what was read");
                break;
            }
        }
    }
    truncate_output(&buf)
}

/// Truncate output to max bytes, converting to string
fn truncate_output(bytes: &[u8]) -> String {
    let slice = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).into_owned()
}

// ============================================================================
// Fake runner
// ============================================================================

type Responder = Box<dyn Fn(&str, &[&str]) -> Result<CommandOutput, ExecError> + Send + Sync>;

/// Records every invocation and answers through a closure
pub struct FakeRunner {
    responder: Responder,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new(
        responder: impl Fn(&str, &[&str]) -> Result<CommandOutput, ExecError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every command exits 0 with empty output
    pub fn succeeding() -> Self {
        Self::new(|program, args| Ok(CommandOutput::ok(program, args, "")))
    }

    /// Command lines seen so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> Result<CommandOutput, ExecError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(display_command(program, args));
        (self.responder)(program, args)
    }
}

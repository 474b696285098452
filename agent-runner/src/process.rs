//! Agent process management

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};

/// How long the exit watcher waits for the output readers after the process
/// itself has exited. A grandchild holding the pipes open must not stall
/// reaping forever.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "[... earlier output truncated ...]\n";

/// Supported agent types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    OpenCode,
    ClaudeCode,
    GeminiCli,
    Codex,
}

impl AgentType {
    /// Get the command to run this agent
    pub fn command(&self) -> &'static str {
        match self {
            Self::OpenCode => {
                if cfg!(target_os = "windows") {
                    "opencode.cmd"
                } else {
                    "opencode"
                }
            }
            Self::ClaudeCode => {
                if cfg!(target_os = "windows") {
                    "claude.cmd"
                } else {
                    "claude"
                }
            }
            Self::GeminiCli => "gemini",
            Self::Codex => "codex",
        }
    }

    /// Get default arguments for the agent
    pub fn default_args(&self) -> Vec<&'static str> {
        match self {
            Self::OpenCode => vec!["run"],
            Self::ClaudeCode => vec!["--print", "--dangerously-skip-permissions"],
            Self::GeminiCli => vec!["--yolo", "--prompt"],
            Self::Codex => vec!["exec", "--full-auto"],
        }
    }
}

impl FromStr for AgentType {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "opencode" => Ok(Self::OpenCode),
            "claude-code" | "claudecode" | "claude" => Ok(Self::ClaudeCode),
            "gemini-cli" | "geminicli" | "gemini" => Ok(Self::GeminiCli),
            "codex" => Ok(Self::Codex),
            _ => Err(ExecutorError::InvalidAgentType {
                agent_type: s.to_string(),
            }),
        }
    }
}

/// Program and leading arguments used to start an agent. The task prompt is
/// appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Command line for one of the known agent CLIs
    pub fn for_agent(agent_type: AgentType) -> Self {
        Self {
            program: agent_type.command().to_string(),
            args: agent_type
                .default_args()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Run the prompt as a shell script (`sh -c <prompt>`)
    pub fn shell() -> Self {
        Self::new("sh", vec!["-c".to_string()])
    }

    fn build(&self, prompt: &str) -> Command {
        if cfg!(target_os = "windows") && self.program.ends_with(".cmd") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.program).args(&self.args).arg(prompt);
            c
        } else {
            let mut c = Command::new(&self.program);
            c.args(&self.args).arg(prompt);
            c
        }
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::for_agent(AgentType::ClaudeCode)
    }
}

/// Configuration for an agent process
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub command: AgentCommand,
    /// Working directory for the agent
    pub working_dir: PathBuf,
    /// The prompt/task to send to the agent
    pub prompt: String,
    /// Additional environment variables
    pub env: Vec<(String, String)>,
    /// Per-stream cap on retained output
    pub max_output_bytes: usize,
}

/// Output stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Incrementally captured stdout/stderr, bounded per stream
#[derive(Debug, Default)]
pub struct CapturedOutput {
    stdout: String,
    stderr: String,
    limit: usize,
}

impl CapturedOutput {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Append one line to a stream, dropping the oldest text past the limit
    pub fn push_line(&mut self, stream: OutputStream, line: &str) {
        let limit = self.limit;
        let buf = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        buf.push_str(line);
        buf.push('\n');

        if limit > 0 && buf.len() > limit {
            let body = buf.strip_prefix(TRUNCATION_MARKER).unwrap_or(buf.as_str());
            let mut cut = body.len().saturating_sub(limit);
            while !body.is_char_boundary(cut) {
                cut += 1;
            }
            *buf = format!("{}{}", TRUNCATION_MARKER, &body[cut..]);
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

/// How the process ended, as seen by the exit watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal or never observed
    pub code: Option<i32>,
    /// Whether the exit followed a kill request
    pub killed: bool,
    /// Error from waiting on the child, if any
    pub wait_error: Option<String>,
}

/// A spawned agent process whose output has not been wired up yet
pub struct AgentProcess {
    child: Child,
    output: Arc<RwLock<CapturedOutput>>,
}

impl AgentProcess {
    /// Spawn a new agent process
    ///
    /// The caller validates `working_dir`; a missing folder surfaces as a
    /// spawn failure.
    pub fn spawn(config: AgentConfig) -> Result<Self> {
        info!(
            program = %config.command.program,
            working_dir = %config.working_dir.display(),
            "Spawning agent with prompt: {}",
            config.prompt.chars().take(100).collect::<String>()
        );

        let mut cmd = config.command.build(&config.prompt);
        cmd.current_dir(&config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a kill reaches whatever the agent spawned
        #[cfg(unix)]
        cmd.process_group(0);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| {
            ExecutorError::spawn_failed_with_source(
                format!("Failed to spawn {}: {}", config.command.program, e),
                e,
            )
        })?;

        Ok(Self {
            child,
            output: Arc::new(RwLock::new(CapturedOutput::with_limit(
                config.max_output_bytes,
            ))),
        })
    }

    /// Start reading output from the process.
    ///
    /// Returns a cloneable control handle and the exit watcher that owns the
    /// child.
    pub fn start_output_reader(mut self) -> Result<(ProcessHandle, OutputReaderHandle)> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stdout"))?;

        let stderr = self
            .child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stderr"))?;

        let stdout_handle = spawn_reader(stdout, OutputStream::Stdout, Arc::clone(&self.output));
        let stderr_handle = spawn_reader(stderr, OutputStream::Stderr, Arc::clone(&self.output));

        let kill_token = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);

        let handle = ProcessHandle {
            pid: self.child.id(),
            output: self.output,
            kill_token: kill_token.clone(),
            exited: exited_rx,
        };

        let reader = OutputReaderHandle {
            child: self.child,
            stdout_handle,
            stderr_handle,
            kill_token,
            exited_tx,
        };

        Ok((handle, reader))
    }
}

fn spawn_reader<R>(
    stream: R,
    kind: OutputStream,
    output: Arc<RwLock<CapturedOutput>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("{:?}: {}", kind, line);
                    output.write().await.push_line(kind, &line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read {:?}: {}", kind, e);
                    break;
                }
            }
        }
    })
}

/// Exit watcher: owns the child and the reader tasks
pub struct OutputReaderHandle {
    child: Child,
    stdout_handle: JoinHandle<()>,
    stderr_handle: JoinHandle<()>,
    kill_token: CancellationToken,
    exited_tx: watch::Sender<bool>,
}

impl OutputReaderHandle {
    /// Wait for the process to exit (or be killed), then join the readers.
    ///
    /// The exit flag on the [`ProcessHandle`] flips only after both readers
    /// are done, so a set flag means the process is fully reaped.
    pub async fn wait(mut self) -> ProcessExit {
        let mut killed = false;
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = self.kill_token.cancelled() => {
                killed = true;
                terminate(&mut self.child);
                self.child.wait().await
            }
        };

        drain_reader(self.stdout_handle).await;
        drain_reader(self.stderr_handle).await;
        self.exited_tx.send_replace(true);

        match status {
            Ok(status) => ProcessExit {
                code: status.code(),
                killed,
                wait_error: None,
            },
            Err(e) => ProcessExit {
                code: None,
                killed,
                wait_error: Some(e.to_string()),
            },
        }
    }
}

async fn drain_reader(mut handle: JoinHandle<()>) {
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut handle)
        .await
        .is_err()
    {
        warn!("Output reader still open after process exit, aborting it");
        handle.abort();
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => warn!(pid, "Failed to kill process group: {}", e),
            }
        }
    }

    if let Err(e) = child.start_kill() {
        warn!("Failed to kill agent process: {}", e);
    }
}

/// Cloneable control handle for a running agent process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    output: Arc<RwLock<CapturedOutput>>,
    kill_token: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the exit watcher has observed the exit and joined the readers
    pub fn is_reaped(&self) -> bool {
        *self.exited.borrow()
    }

    /// Ask the OS whether the process is still alive, independent of any
    /// recorded status.
    ///
    /// May block briefly; callers must not hold the registry lock.
    pub fn is_alive(&self) -> bool {
        if self.is_reaped() {
            return false;
        }
        match self.pid {
            Some(pid) => pid_alive(pid),
            None => false,
        }
    }

    /// Signal the exit watcher to kill the process
    pub fn request_kill(&self) {
        self.kill_token.cancel();
    }

    /// Copy of the output captured so far: `(stdout, stderr)`
    pub async fn output(&self) -> (String, String) {
        let output = self.output.read().await;
        (output.stdout().to_string(), output.stderr().to_string())
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell_config(dir: &TempDir, script: &str) -> AgentConfig {
        AgentConfig {
            command: AgentCommand::shell(),
            working_dir: dir.path().to_path_buf(),
            prompt: script.to_string(),
            env: vec![("AGENT_GREETING".to_string(), "hi".to_string())],
            max_output_bytes: 64 * 1024,
        }
    }

    #[test]
    fn test_agent_type_from_str() {
        assert_eq!("opencode".parse::<AgentType>().unwrap(), AgentType::OpenCode);
        assert_eq!("claude-code".parse::<AgentType>().unwrap(), AgentType::ClaudeCode);
        assert_eq!("gemini-cli".parse::<AgentType>().unwrap(), AgentType::GeminiCli);
        assert_eq!("codex".parse::<AgentType>().unwrap(), AgentType::Codex);
        assert!("unknown".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_captured_output_is_bounded() {
        let mut output = CapturedOutput::with_limit(16);
        for i in 0..10 {
            output.push_line(OutputStream::Stdout, &format!("line {}", i));
        }
        assert!(output.stdout().starts_with(TRUNCATION_MARKER));
        assert!(output.stdout().ends_with("line 9\n"));
        assert!(output.stdout().len() <= TRUNCATION_MARKER.len() + 16);
        assert!(output.stderr().is_empty());
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let process = AgentProcess::spawn(shell_config(
            &dir,
            "echo out-$AGENT_GREETING; echo err >&2; exit 3",
        ))
        .unwrap();
        let (handle, reader) = process.start_output_reader().unwrap();

        let exit = reader.wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.killed);
        assert!(exit.wait_error.is_none());

        assert!(handle.is_reaped());
        assert!(!handle.is_alive());
        let (stdout, stderr) = handle.output().await;
        assert_eq!(stdout, "out-hi\n");
        assert_eq!(stderr, "err\n");
    }

    #[tokio::test]
    async fn test_output_is_visible_before_exit() {
        let dir = TempDir::new().unwrap();
        let process =
            AgentProcess::spawn(shell_config(&dir, "echo early; sleep 30")).unwrap();
        let (handle, reader) = process.start_output_reader().unwrap();
        let watcher = tokio::spawn(reader.wait());

        let mut seen = false;
        for _ in 0..100 {
            if handle.output().await.0.contains("early") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen);
        assert!(handle.is_alive());

        handle.request_kill();
        let exit = watcher.await.unwrap();
        assert!(exit.killed);
        // The exit flag flips before `wait` returns
        assert!(handle.is_reaped());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = shell_config(&dir, "true");
        config.command = AgentCommand::new("definitely-not-an-agent-binary", vec![]);
        let result = AgentProcess::spawn(config);
        assert!(matches!(result, Err(ExecutorError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_missing_folder_is_a_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let mut config = shell_config(&dir, "true");
        config.working_dir = dir.path().join("missing");
        let result = AgentProcess::spawn(config);
        assert!(matches!(result, Err(ExecutorError::SpawnFailed { .. })));
    }
}

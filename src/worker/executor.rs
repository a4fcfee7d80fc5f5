use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long to keep draining pipes once the shell is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("exit status {code}")]
    NonZeroExit { code: i32 },

    #[error("killed by signal")]
    KilledBySignal,

    #[error("execution timed out")]
    Timeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),

    #[error("execution panicked")]
    Panicked,

    #[error("output held open by background processes, killed")]
    OutputHeldOpen,
}

/// Output of one command execution.
///
/// `output` holds whatever the command wrote before it finished or was cut
/// short; it is never discarded because `error` is set.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub output: String,
    pub error: Option<ExecError>,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs a command bounded by a deadline and a cancellation token.
#[async_trait]
pub trait Execute: Send + Sync + 'static {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecOutput;
}

/// Executes commands with `sh -c` in a dedicated process group.
///
/// On timeout or cancellation the whole group is killed, so children spawned
/// by the shell cannot keep the output pipes open.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn spawn(&self, command: &str) -> std::io::Result<Child> {
        Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }
}

#[async_trait]
impl Execute for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecOutput {
        let mut child = match self.spawn(command) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn command");
                return ExecOutput {
                    output: String::new(),
                    error: Some(ExecError::Spawn(e.to_string())),
                };
            }
        };
        // The shell leads its own group; the id stays valid for the group
        // after the shell itself has been reaped.
        let group = child.id();

        let mut stdout = PipeReader::spawn(child.stdout.take());
        let mut stderr = PipeReader::spawn(child.stderr.take());

        let mut error = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => None,
                Ok(status) => Some(match status.code() {
                    Some(code) => ExecError::NonZeroExit { code },
                    None => ExecError::KilledBySignal,
                }),
                Err(e) => Some(ExecError::Io(e.to_string())),
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!(timeout_secs = timeout.as_secs(), "Deadline reached, killing process group");
                kill_group(group, &mut child).await;
                Some(ExecError::Timeout)
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Cancelled, killing process group");
                kill_group(group, &mut child).await;
                Some(ExecError::Cancelled)
            }
        };

        let deadline = Instant::now() + PIPE_DRAIN_TIMEOUT;
        let mut drained = stdout.drain_until(deadline).await & stderr.drain_until(deadline).await;
        if !drained {
            // Background children still hold the pipes open.
            tracing::warn!("Output pipes held open after the shell exited, killing process group");
            kill_group(group, &mut child).await;
            if error.is_none() {
                error = Some(ExecError::OutputHeldOpen);
            }
            let deadline = Instant::now() + PIPE_DRAIN_TIMEOUT;
            drained = stdout.drain_until(deadline).await & stderr.drain_until(deadline).await;
            if !drained {
                tracing::warn!("Output pipes still open after kill, keeping what was read");
            }
        }

        let mut output = stdout.into_string();
        output.push_str(&stderr.into_string());

        ExecOutput { output, error }
    }
}

/// Collects a child pipe on a background task.
///
/// Chunks are handed over as they arrive, so whatever was read before a
/// drain gives up is still returned.
struct PipeReader {
    chunks: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    buf: Vec<u8>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(mut pipe) = pipe else {
            return Self {
                chunks: None,
                buf: Vec::new(),
            };
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Output pipe read failed");
                        break;
                    }
                }
            }
        });

        Self {
            chunks: Some(rx),
            buf: Vec::new(),
        }
    }

    /// Take chunks until the pipe closes or `deadline` passes. Returns `true`
    /// once the pipe has closed.
    async fn drain_until(&mut self, deadline: Instant) -> bool {
        let Some(chunks) = self.chunks.as_mut() else {
            return true;
        };
        loop {
            match tokio::time::timeout_at(deadline, chunks.recv()).await {
                Ok(Some(chunk)) => self.buf.extend_from_slice(&chunk),
                Ok(None) => {
                    self.chunks = None;
                    return true;
                }
                Err(_) => return false,
            }
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

async fn kill_group(group: Option<u32>, child: &mut Child) {
    if let Some(pid) = group {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "Process group kill failed");
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already exited");
    }
}

//! Subprocess executor with confinement, deadlines, and output capture.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::changeset;
use super::preamble;

/// Per-stream capture cap. Excess is discarded with a trailing marker so a
/// runaway printer cannot consume memory.
const STREAM_CAP: usize = 1024 * 1024;

/// Marker appended when a stream was cut at [`STREAM_CAP`].
const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// How long a signaled process gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one subprocess execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Captured stdout (possibly truncated).
    pub stdout: String,
    /// Captured stderr (possibly truncated).
    pub stderr: String,
    /// Process exit code; -1 when the process was killed.
    pub exit_code: i32,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    /// Files created or modified in the working directory during execution.
    pub changed_files: Vec<String>,
    /// True when the descriptor deadline elapsed and the process was
    /// signaled. Partial output and the change set are still populated.
    pub timed_out: bool,
}

/// Sandbox failure taxonomy. Non-zero exits are not errors at this layer:
/// they come back in [`ExecResult::exit_code`] for the calling tool to
/// classify.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A denylist rule matched the shell command.
    #[error("Command refused by rule '{rule}'")]
    Forbidden {
        /// Name of the matching denylist rule.
        rule: &'static str,
    },

    /// The subprocess could not be spawned or its streams could not be read.
    #[error("Execution failed: {0}")]
    Internal(String),
}

/// Denylist for shell commands. This is a design contract for what the
/// executor will run on behalf of a model, not a sandbox substitute.
const DENYLIST: &[(&str, &[&str])] = &[
    ("privilege-escalation", &["sudo ", "sudo\t", "su -", "doas "]),
    (
        "package-install",
        &[
            "apt install",
            "apt-get install",
            "yum install",
            "dnf install",
            "pacman -s",
            "pip install",
            "pip3 install",
            "npm install -g",
            "gem install",
        ],
    ),
    (
        "remote-shell",
        &["ssh ", "nc -e", "ncat -e", "telnet ", "socat "],
    ),
    (
        "destructive-delete",
        &["rm -rf /", "rm -fr /", "rm -rf ~", "rm -rf ..", "mkfs", ":(){"],
    ),
    (
        "network-config",
        &["iptables", "nftables", "ifconfig ", "ip link", "ip addr add", "route add"],
    ),
    ("host-control", &["shutdown", "reboot", "halt ", "poweroff", "kill -9 1"]),
];

/// Runs model-supplied Python or shell in a confined subprocess.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    python_bin: String,
    shell_bin: String,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxExecutor {
    pub fn new() -> Self {
        Self {
            python_bin: std::env::var("PYTHON_BIN").unwrap_or_else(|_| "python3".to_string()),
            shell_bin: "/bin/sh".to_string(),
        }
    }

    /// Execute Python source with the environment preamble injected after
    /// the leading import block.
    pub async fn execute_code(
        &self,
        source: &str,
        workdir: &Path,
        conversation_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ExecError> {
        let prepared = preamble::inject(source, &preamble::build_preamble(conversation_id));
        let mut command = Command::new(&self.python_bin);
        command.arg("-c").arg(prepared);
        self.run(command, workdir, timeout, cancel).await
    }

    /// Execute a shell command after checking the denylist.
    pub async fn execute_shell(
        &self,
        command_line: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ExecError> {
        check_denylist(command_line)?;
        let mut command = Command::new(&self.shell_bin);
        command.arg("-c").arg(command_line);
        self.run(command, workdir, timeout, cancel).await
    }

    async fn run(
        &self,
        mut command: Command,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ExecError> {
        let started = Instant::now();
        let scan_start = SystemTime::now();

        let mut child = command
            .current_dir(workdir)
            .env("CONVERSATION_WORKDIR", workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Internal(format!("Failed to spawn process: {}", e)))?;

        // Drain the pipes while the process runs: a child writing more than
        // the pipe buffer would otherwise block forever on write.
        let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        let mut timed_out = false;
        let exit_code = tokio::select! {
            status = child.wait() => {
                status
                    .map_err(|e| ExecError::Internal(format!("Failed to wait for process: {}", e)))?
                    .code()
                    .unwrap_or(-1)
            }
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                warn!(elapsed = ?started.elapsed(), "Execution deadline elapsed, signaling process");
                terminate(&mut child).await;
                -1
            }
            _ = cancel.cancelled() => {
                debug!("Execution cancelled, signaling process");
                terminate(&mut child).await;
                -1
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|e| ExecError::Internal(format!("stdout reader failed: {}", e)))?;
        let stderr = stderr_task
            .await
            .map_err(|e| ExecError::Internal(format!("stderr reader failed: {}", e)))?;

        let changed_files = changeset::changed_files(workdir, scan_start, &stdout);

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
            duration: started.elapsed(),
            changed_files,
            timed_out,
        })
    }
}

fn check_denylist(command_line: &str) -> Result<(), ExecError> {
    let normalized = command_line.to_lowercase();
    for (rule, patterns) in DENYLIST {
        if patterns.iter().any(|p| normalized.contains(p)) {
            return Err(ExecError::Forbidden { rule });
        }
    }
    Ok(())
}

/// SIGTERM first, SIGKILL after the grace window.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Read a stream to EOF, keeping at most [`STREAM_CAP`] bytes. The stream is
/// always fully drained so the child never blocks on a full pipe.
async fn read_capped<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut kept: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < STREAM_CAP {
                    let take = n.min(STREAM_CAP - kept.len());
                    kept.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new()
    }

    #[tokio::test]
    async fn test_shell_echo() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .execute_shell(
                "echo hello",
                dir.path(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_shell_captures_changed_files() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .execute_shell(
                "printf data > out.txt",
                dir.path(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.changed_files, vec!["out.txt"]);
    }

    #[tokio::test]
    async fn test_shell_overwrite_detected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("chart.png"), "old bytes").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let result = executor()
            .execute_shell(
                "printf 'new bytes' > chart.png",
                dir.path(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.changed_files, vec!["chart.png"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("chart.png")).unwrap(),
            "new bytes"
        );
    }

    #[tokio::test]
    async fn test_denylist_refuses_sudo() {
        let dir = TempDir::new().unwrap();
        let err = executor()
            .execute_shell(
                "sudo rm -rf /tmp/x",
                dir.path(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            ExecError::Forbidden { rule } => assert_eq!(rule, "privilege-escalation"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_signals_process() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        let result = executor()
            .execute_shell(
                "sleep 30",
                dir.path(),
                Duration::from_millis(200),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        // deadline + grace window, with scheduling slack
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output_and_changeset() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .execute_shell(
                "echo started; printf x > partial.txt; sleep 30",
                dir.path(),
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(result.stdout.contains("started"));
        assert_eq!(result.changed_files, vec!["partial.txt"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .execute_shell(
                "echo oops >&2; exit 3",
                dir.path(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_stream_cap_truncates() {
        let dir = TempDir::new().unwrap();
        // ~4 MiB of output against a 1 MiB cap
        let result = executor()
            .execute_shell(
                "yes 0123456789abcdef | head -c 4194304",
                dir.path(),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.stdout.len() <= STREAM_CAP + TRUNCATION_MARKER.len());
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_execute_code_runs_python() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .execute_code(
                "import sys\nprint(CONVERSATION_ID)\n",
                dir.path(),
                "conv-7",
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "conv-7");
    }

    #[tokio::test]
    async fn test_execute_code_sentinel_registers_output() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .execute_code(
                "register_output('virtual.bin')\n",
                dir.path(),
                "conv-7",
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        assert!(result.changed_files.contains(&"virtual.bin".to_string()));
    }
}

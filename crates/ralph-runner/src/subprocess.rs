use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Output from a subprocess execution.
#[derive(Debug, Clone)]
pub struct SubprocessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl SubprocessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr, the order diagnostics are scanned in.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }

    /// Last `n` non-empty lines of combined output.
    pub fn tail(&self, n: usize) -> String {
        let combined = self.combined();
        let lines: Vec<&str> = combined.lines().filter(|l| !l.trim().is_empty()).collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Run a shell command with a timeout.
pub async fn run_cmd(cmd: &str, cwd: &Path, timeout: Duration) -> Result<SubprocessOutput> {
    run_cmd_with_stdin(cmd, cwd, timeout, None).await
}

/// Run a shell command with a timeout, optionally feeding `input` on stdin.
///
/// The shell leads its own process group. On timeout the whole group is
/// killed, so grandchildren started by the command do not outlive it.
pub async fn run_cmd_with_stdin(
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
    input: Option<Vec<u8>>,
) -> Result<SubprocessOutput> {
    tracing::debug!(
        cmd,
        ?cwd,
        ?timeout,
        stdin_len = input.as_ref().map(Vec::len),
        "spawning subprocess"
    );

    let mut std_command = std::process::Command::new("sh");
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut std_command, 0);

    let mut child = Command::from(std_command)
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        // Allow an agent CLI to run inside a parent agent session.
        .env_remove("CLAUDECODE")
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context(format!("failed to spawn: {cmd}"))?;
    let pid = child.id();

    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        tokio::spawn(async move {
            // A command that never reads stdin closes the pipe early.
            if let Err(e) = stdin.write_all(&bytes).await {
                tracing::debug!(error = %e, "stdin closed before the input was written");
            }
        });
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = SubprocessOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                timed_out: false,
            };
            tracing::debug!(
                exit_code = result.exit_code,
                stdout_len = result.stdout.len(),
                "subprocess completed"
            );
            Ok(result)
        }
        Ok(Err(e)) => Err(e).context(format!("subprocess failed: {cmd}")),
        Err(_) => {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            tracing::warn!(cmd, ?timeout, "subprocess timed out, killed");
            Ok(SubprocessOutput {
                stdout: String::new(),
                stderr: format!("Process timed out after {timeout:?}"),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Quote `arg` for `sh -c` using single quotes.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_cmd("echo hello; echo oops >&2; exit 3", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.tail(1), "oops");
    }

    #[tokio::test]
    async fn timeout_is_reported_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();
        let out = run_cmd("sleep 5", dir.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_cmd("ls", dir.path(), Duration::from_secs(5)).await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn stdin_input_reaches_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let input = "x".repeat(300_000);
        let input = Some(input.into_bytes());
        let out = run_cmd_with_stdin("wc -c", dir.path(), Duration::from_secs(10), input)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "300000");
    }

    #[tokio::test]
    async fn unread_stdin_does_not_fail_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let input = Some(vec![b'a'; 1 << 20]);
        let out = run_cmd_with_stdin("true", dir.path(), Duration::from_secs(5), input)
            .await
            .unwrap();
        assert!(out.success());
    }

    /// A process counts as gone once it no longer exists or is a zombie
    /// waiting on a reaper.
    #[cfg(target_os = "linux")]
    fn alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_cmd(
            "sleep 30 & echo $! > child.pid; wait",
            dir.path(),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert!(out.timed_out);

        let pid: i32 = std::fs::read_to_string(dir.path().join("child.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while alive(pid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive(pid), "sleep {pid} outlived the timed-out command");
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}

//! Timeout-bound subprocess execution

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::{EnvironmentOverlay, Error, Result};

/// How a command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The command exited on its own; `output` is stdout and stderr combined
    Completed { exit_code: i32, output: String },
    /// The deadline elapsed and the command was killed
    TimedOut,
}

/// Runs shell command lines for the executor
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        command_line: &str,
        env: &EnvironmentOverlay,
        timeout: Duration,
    ) -> Result<RunOutcome>;
}

/// Append `2>&1` unless the command already redirects stderr
///
/// This is a plain substring check and does not understand quoting.
pub fn merge_stderr(command_line: &str) -> String {
    if command_line.contains("2>") {
        command_line.to_string()
    } else {
        format!("{} 2>&1", command_line)
    }
}

/// Runs commands through `sh -c` with a hard wall-clock deadline
///
/// The child is started in its own process group. On timeout the whole
/// group is killed and the child is reaped before `run` returns.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }

    /// Use a different shell binary
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRunner for ProcessRunner {
    #[instrument(skip(self, env), fields(timeout_secs = timeout.as_secs()))]
    async fn run(
        &self,
        command_line: &str,
        env: &EnvironmentOverlay,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        let command_line = merge_stderr(command_line);
        debug!(command = %command_line, "Spawning command");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        env.apply(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExecutionError(format!("Failed to execute: {}", e)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ExecutionError("child stdout was not captured".into()))?;

        let finished = tokio::time::timeout(timeout, async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, buf))
        })
        .await;

        match finished {
            Ok(Ok((status, buf))) => {
                let exit_code = exit_code(status);
                let output = String::from_utf8_lossy(&buf).into_owned();
                debug!(exit_code, bytes = buf.len(), "Command finished");
                Ok(RunOutcome::Completed { exit_code, output })
            }
            Ok(Err(e)) => {
                terminate(&mut child).await;
                Err(Error::ExecutionError(format!(
                    "Failed while waiting for command: {}",
                    e
                )))
            }
            Err(_) => {
                warn!(command = %command_line, "Command exceeded its deadline, killing it");
                terminate(&mut child).await;
                Ok(RunOutcome::TimedOut)
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Kill the child's process group and reap the child
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "killpg failed, falling back to kill");
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnvAction, EnvironmentDirective};
    use std::time::Instant;

    fn runner() -> ProcessRunner {
        ProcessRunner::new()
    }

    #[test]
    fn test_merge_stderr() {
        assert_eq!(merge_stderr("probe -m x"), "probe -m x 2>&1");
        assert_eq!(merge_stderr("probe 2>/dev/null"), "probe 2>/dev/null");
    }

    #[tokio::test]
    async fn test_captures_combined_output() {
        let outcome = runner()
            .run(
                "sh -c 'echo out; echo err >&2; exit 3'",
                &EnvironmentOverlay::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        match outcome {
            RunOutcome::Completed { exit_code, output } => {
                assert_eq!(exit_code, 3);
                assert!(output.contains("out"));
                assert!(output.contains("err"));
            }
            RunOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let command = format!("sleep 3; touch {}", marker.display());

        let started = Instant::now();
        let outcome = runner()
            .run(&command, &EnvironmentOverlay::new(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));

        // Nothing from the killed group may survive to touch the marker
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_overlay_reaches_child_only() {
        let mut overlay = EnvironmentOverlay::resolve(
            &[EnvironmentDirective::new(
                "GRIDPROBE_CHILD_VAR",
                EnvAction::Set,
                "from-overlay",
            )],
            &Default::default(),
        );
        overlay.unset("HOME");

        let outcome = runner()
            .run(
                "echo \"$GRIDPROBE_CHILD_VAR:${HOME:-unset}\"",
                &overlay,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                exit_code: 0,
                output: "from-overlay:unset\n".to_string()
            }
        );
        assert!(std::env::var("GRIDPROBE_CHILD_VAR").is_err());
    }

    #[tokio::test]
    async fn test_missing_shell_is_an_error() {
        let result = ProcessRunner::new()
            .with_shell("/nonexistent/sh")
            .run("true", &EnvironmentOverlay::new(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::ExecutionError(_))));
    }
}

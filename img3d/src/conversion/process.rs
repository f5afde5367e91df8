//! Spawning and supervising external executables.
//!
//! Stdout and stderr are drained concurrently into unbounded buffers while the process runs, so a
//! chatty process can never block on a full pipe. Every line is logged as it arrives; progress
//! lines on stdout are logged at info level. A deadline bounds the whole run and, when it
//! expires, the entire process group is killed.

use std::{
    ffi::OsStr,
    fmt, io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tracing::{debug, info, instrument, warn};

use super::output;
use crate::config::ExecutableConfig;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` did not finish within {}", humantime::format_duration(*.timeout))]
    Timeout { program: String, timeout: Duration },
    #[error("failed to collect output of `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Everything a finished process left behind.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        })
    }
}

/// Runs one configured executable with per-call trailing arguments.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(config: &ExecutableConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
            working_dir: config.working_dir.clone(),
        }
    }

    /// Run to completion, returning captured output whatever the exit status.
    #[instrument(skip_all, fields(program = %self.program, pid = tracing::field::Empty))]
    pub async fn run<I, S>(&self, extra_args: I) -> Result<ProcessOutput, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut std_command = std::process::Command::new(&self.program);
        std_command
            .args(&self.args)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            std_command.current_dir(dir);
        }
        // Own process group so a timeout can take down anything the script started
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        if let Some(pid) = pid {
            tracing::Span::current().record("pid", pid);
        }
        let mut group = GroupGuard { pid };
        debug!("Spawned external process");

        let io_error = |source| ProcessError::Io {
            program: self.program.clone(),
            source,
        };
        let stdout = child.stdout.take().ok_or_else(|| io_error(io::Error::other("stdout was not captured")))?;
        let stderr = child.stderr.take().ok_or_else(|| io_error(io::Error::other("stderr was not captured")))?;

        let collect = async {
            let (stdout, stderr) = tokio::try_join!(drain(stdout, Stream::Stdout), drain(stderr, Stream::Stderr))?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout, stderr))
        };
        let outcome = tokio::time::timeout(self.timeout, collect).await;

        match outcome {
            Ok(Ok((status, stdout, stderr))) => {
                group.disarm();
                let elapsed = started.elapsed();
                info!(%status, elapsed_ms = elapsed.as_millis() as u64, "External process exited");
                Ok(ProcessOutput {
                    status,
                    stdout,
                    stderr,
                    elapsed,
                })
            }
            Ok(Err(source)) => {
                terminate(&mut child, pid).await;
                group.disarm();
                Err(io_error(source))
            }
            Err(_) => {
                warn!(timeout = %humantime::format_duration(self.timeout), "External process timed out, killing it");
                terminate(&mut child, pid).await;
                group.disarm();
                Err(ProcessError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

async fn drain<R>(reader: R, stream: Stream) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end();

        match stream {
            Stream::Stdout => match output::parse_progress(trimmed) {
                Some(progress) => info!(
                    stage = progress.stage.as_deref().unwrap_or("unknown"),
                    progress = progress.progress.unwrap_or_default(),
                    message = progress.message.as_deref().unwrap_or_default(),
                    "Conversion progress"
                ),
                None if !trimmed.is_empty() => debug!(%stream, "{trimmed}"),
                None => {}
            },
            Stream::Stderr if !trimmed.is_empty() => debug!(%stream, "{trimmed}"),
            Stream::Stderr => {}
        }

        collected.push_str(&text);
    }

    Ok(collected)
}

/// Kills the child's process group if `run` is dropped before the child has been reaped.
///
/// `kill_on_drop` alone only reaches the direct child. Disarmed once the child is reaped so a
/// recycled pid is never signalled.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            debug!(pid, "External process abandoned, killing its process group");
            kill_process_group(pid);
        }
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill external process");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // The child was started with process_group(0), so its pid is also its group id
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(error = %io::Error::last_os_error(), "Failed to signal process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, timeout: Duration) -> ProcessRunner {
        ProcessRunner::new(&ExecutableConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            timeout,
            working_dir: None,
        })
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_args() {
        let runner = shell(r#"echo "first $1"; echo oops >&2; echo "second $2""#, Duration::from_secs(10));

        let output = runner.run(["a", "b"]).await.unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, "first a\nsecond b\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runner = shell("echo failing >&2; exit 3", Duration::from_secs(10));

        let output = runner.run(Vec::<String>::new()).await.unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr, "failing\n");
    }

    #[tokio::test]
    async fn test_large_output_does_not_block() {
        // Well past a pipe buffer on both streams
        let runner = shell(
            "i=0; while [ $i -lt 20000 ]; do echo \"line $i\"; echo \"err $i\" >&2; i=$((i+1)); done",
            Duration::from_secs(30),
        );

        let output = runner.run(Vec::<String>::new()).await.unwrap();

        assert_eq!(output.stdout.lines().count(), 20000);
        assert_eq!(output.stderr.lines().count(), 20000);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessRunner::new(&ExecutableConfig {
            program: "/definitely/not/a/real/converter".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
            working_dir: None,
        });

        let err = runner.run(["x"]).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        // The background sleeper shares the group and must die with the parent
        let script = format!("(sleep 2; touch {}) & sleep 30", marker.display());
        let runner = shell(&script, Duration::from_millis(300));

        let started = Instant::now();
        let err = runner.run(Vec::<String>::new()).await.unwrap_err();

        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "grandchild outlived the timeout");
    }

    #[tokio::test]
    async fn test_dropped_run_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let script = format!("(sleep 2; touch {}) & sleep 30", marker.display());
        let runner = shell(&script, Duration::from_secs(60));

        // The caller gives up long before the runner's own deadline
        let abandoned = tokio::time::timeout(Duration::from_millis(300), runner.run(Vec::<String>::new())).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "grandchild outlived the dropped run");
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(&ExecutableConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "pwd".to_string()],
            timeout: Duration::from_secs(5),
            working_dir: Some(dir.path().to_path_buf()),
        });

        let output = runner.run(Vec::<String>::new()).await.unwrap();
        let reported = PathBuf::from(output.stdout.trim()).canonicalize().unwrap();
        assert_eq!(reported, dir.path().canonicalize().unwrap());
    }
}

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    constants::{BYTES_IN_MB, OUTPUT_DRAIN_GRACE},
    core::{
        domain::{StageOutcome, StageRequest, bytes_to_mb},
        traits::executor::{ExecError, StageExecutor},
    },
    native::memory::{MemorySampler, kill_group},
};

/// Runs stages as direct child processes, each in its own process group.
#[derive(Clone, Debug, Default)]
pub struct NativeExecutor {
    working_dir: Option<PathBuf>,
}

impl NativeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir<T: AsRef<Path>>(dir: T) -> Self {
        Self {
            working_dir: Some(dir.as_ref().into()),
        }
    }

    fn command(&self, program: &str, request: &StageRequest) -> Command {
        let mut command = Command::new(program);
        command
            .args(&request.argv[1..])
            .envs(request.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

enum Termination {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    MemoryExceeded,
    Cancelled,
}

#[async_trait::async_trait]
impl StageExecutor for NativeExecutor {
    #[tracing::instrument(skip_all, fields(argv = ?request.argv))]
    async fn run(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, ExecError> {
        let program = request.argv.first().ok_or(ExecError::EmptyCommand)?.clone();

        if cancel.is_cancelled() {
            return Ok(cancelled_before_start());
        }

        let mut command = self.command(&program, &request);
        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| ExecError::from_spawn(&program, e))?;
        let Some(pid) = child.id() else {
            return Err(ExecError::Io {
                msg: format!("{program} exited before it could be tracked"),
            });
        };
        tracing::debug!(pid, "Stage spawned");

        let stdin_task = child.stdin.take().map(|mut stdin| {
            let input = request.stdin;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::debug!("Failed to write stage stdin: {}", e);
                    }
                }
            })
        });
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        let limit_bytes = request
            .limits
            .memory_mb
            .map(|mb| (mb * BYTES_IN_MB) as u64);
        let sampler = MemorySampler::spawn(pid, limit_bytes);
        let deadline = tokio::time::sleep(request.limits.time);
        tokio::pin!(deadline);

        let termination = tokio::select! {
            biased;
            status = child.wait() => Termination::Exited(status),
            _ = sampler.exceeded().cancelled() => Termination::MemoryExceeded,
            _ = &mut deadline => Termination::TimedOut,
            _ = cancel.cancelled() => Termination::Cancelled,
        };
        let elapsed = started.elapsed();
        let timed_out = matches!(termination, Termination::TimedOut);
        let cancelled = matches!(termination, Termination::Cancelled);

        // Stragglers of an exited stage go down with the group as well.
        if let Err(e) = kill_group(pid) {
            tracing::warn!(pid, "Failed to kill stage process group: {}", e);
        }
        let status = match termination {
            Termination::Exited(status) => status,
            _ => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let memory_exceeded = sampler.exceeded().is_cancelled();
        let peak_bytes = sampler.finish();

        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = collect_output(stdout_task).await;
        let stderr = collect_output(stderr_task).await;

        let status = status.map_err(|e| ExecError::Io { msg: e.to_string() })?;

        let outcome = StageOutcome {
            stdout: stdout?,
            stderr: stderr?,
            exit_code: exit_code(status),
            elapsed_seconds: elapsed.as_secs_f64(),
            peak_memory_mb: bytes_to_mb(peak_bytes),
            timed_out,
            killed_for_memory: memory_exceeded,
            cancelled,
        };
        tracing::debug!(
            exit_code = outcome.exit_code,
            elapsed = outcome.elapsed_seconds,
            peak_mb = outcome.peak_memory_mb,
            timed_out = outcome.timed_out,
            killed_for_memory = outcome.killed_for_memory,
            cancelled = outcome.cancelled,
            "Stage finished"
        );
        Ok(outcome)
    }
}

fn cancelled_before_start() -> StageOutcome {
    StageOutcome {
        exit_code: -1,
        cancelled: true,
        ..StageOutcome::default()
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect_output(
    task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Vec<u8>, ExecError> {
    let Some(mut task) = task else {
        return Ok(Vec::new());
    };
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
        Ok(Ok(Ok(buf))) => Ok(buf),
        Ok(Ok(Err(e))) => Err(ExecError::Io { msg: e.to_string() }),
        Ok(Err(e)) => Err(ExecError::Io { msg: e.to_string() }),
        Err(_) => {
            // A detached descendant is still holding the pipe open.
            tracing::warn!("Stage output pipe still open after exit, dropping it");
            task.abort();
            Ok(Vec::new())
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::domain::StageLimits;

    fn request(argv: &[&str], stdin: &str, time: Duration, memory_mb: Option<f64>) -> StageRequest {
        StageRequest {
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            stdin: stdin.as_bytes().to_vec(),
            limits: StageLimits { time, memory_mb },
            env: vec![],
        }
    }

    fn relaxed(argv: &[&str], stdin: &str) -> StageRequest {
        request(argv, stdin, Duration::from_secs(10), None)
    }

    #[tokio::test]
    async fn test_stdin_is_echoed() {
        let executor = NativeExecutor::new();
        let outcome = executor
            .run(relaxed(&["cat"], "1 2 3\n4 5 6\n"), CancellationToken::new())
            .await
            .expect("cat should run");

        assert_eq!(outcome.stdout, b"1 2 3\n4 5 6\n");
        assert!(outcome.stderr.is_empty());
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let executor = NativeExecutor::new();
        let outcome = executor
            .run(
                relaxed(&["sh", "-c", "echo oops >&2; exit 3"], ""),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stderr_lossy(), "oops\n");
        assert!(outcome.finished());
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        let executor = NativeExecutor::new();
        let input = "x".repeat(2 * 1024 * 1024);
        let outcome = executor
            .run(
                relaxed(&["sh", "-c", "cat; head -c 3000000 /dev/zero >&2"], &input),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stdout.len(), input.len());
        assert_eq!(outcome.stderr.len(), 3_000_000);
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let executor = NativeExecutor::new();
        let mut req = relaxed(&["sh", "-c", "printf %s \"$STRESS_CASE_NUMBER\""], "");
        req.env.push(("STRESS_CASE_NUMBER".to_string(), "17".to_string()));
        let outcome = executor.run(req, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.stdout_lossy(), "17");
    }

    #[tokio::test]
    async fn test_time_limit() {
        let executor = NativeExecutor::new();
        let outcome = executor
            .run(
                request(&["sleep", "5"], "", Duration::from_millis(100), None),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.killed_for_memory);
        assert!(!outcome.cancelled);
        assert!(outcome.elapsed_seconds >= 0.1);
        assert!(outcome.elapsed_seconds < 2.0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_limit() {
        let executor = NativeExecutor::new();
        // tail buffers /dev/zero looking for a newline that never comes
        let outcome = executor
            .run(
                request(&["tail", "/dev/zero"], "", Duration::from_secs(10), Some(32.0)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.killed_for_memory);
        assert!(!outcome.timed_out);
        assert!(outcome.peak_memory_mb > 32.0);
        assert!(outcome.elapsed_seconds < 10.0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_peak_memory_is_sampled() {
        let executor = NativeExecutor::new();
        let outcome = executor
            .run(relaxed(&["sleep", "0.2"], ""), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.peak_memory_mb > 0.0);
        assert!(!outcome.killed_for_memory);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = executor
            .run(relaxed(&["sleep", "5"], ""), cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
        assert!(!outcome.killed_for_memory);
        assert!(outcome.elapsed_seconds < 1.0);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_spawn() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor
            .run(relaxed(&["sleep", "5"], ""), cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.elapsed_seconds, 0.0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_descendants_are_killed() {
        use crate::native::memory::process_alive;

        let executor = NativeExecutor::new();
        let outcome = executor
            .run(
                request(
                    &["sh", "-c", "sleep 30 & echo $!; wait"],
                    "",
                    Duration::from_millis(300),
                    None,
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        let grandchild: u32 = outcome.stdout_lossy().trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..50 {
            alive = process_alive(grandchild);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!alive, "grandchild {grandchild} survived the stage");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let executor = NativeExecutor::new();
        let result = executor
            .run(
                relaxed(&["/nonexistent/stress/binary"], ""),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ExecError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let executor = NativeExecutor::new();
        let result = executor.run(relaxed(&[], ""), CancellationToken::new()).await;

        assert_eq!(result, Err(ExecError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = std::env::temp_dir();
        let executor = NativeExecutor::with_working_dir(&dir);
        let outcome = executor
            .run(relaxed(&["pwd"], ""), CancellationToken::new())
            .await
            .unwrap();

        let reported = PathBuf::from(outcome.stdout_lossy().trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.canonicalize().unwrap()
        );
    }
}

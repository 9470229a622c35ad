//! Subprocess Execution Module
//!
//! Runs external tools as child processes with a timeout and bounded output
//! capture. A timed-out child is killed and reaped before returning; any child
//! whose future is dropped early is killed by `kill_on_drop`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Execution result from a subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Whether the process exited with status 0
    pub success: bool,
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output content, possibly truncated
    pub stdout: String,
    /// Standard error content, possibly truncated
    pub stderr: String,
    /// Execution duration in milliseconds
    pub duration_ms: u64,
}

/// Subprocess failures that prevent an exit status from being observed
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command {program} timed out after {timeout_ms}ms")]
    TimedOut { program: String, timeout_ms: u64 },

    #[error("Failed to wait for command {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Which end of an over-long stream is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    Head,
    /// Tracebacks name the exception on their last line
    Tail,
}

/// Captured bytes of one stream plus how much was discarded
#[derive(Debug)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
    keep: Keep,
}

/// Subprocess executor for running external tools
pub struct SubprocessExecutor;

impl SubprocessExecutor {
    /// Execute a command with arguments.
    ///
    /// Each of stdout and stderr keeps at most `max_output_bytes`. Stdout keeps
    /// its beginning and stderr its end; the rest is drained and replaced by a
    /// `[truncated N bytes]` marker.
    pub async fn execute_command(
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env_vars: Option<&HashMap<String, String>>,
        timeout_ms: Option<u64>,
        max_output_bytes: usize,
    ) -> Result<ExecutionResult, ExecutorError> {
        let start_time = Instant::now();

        debug!("Executing command: {command} with args: {args:?}");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        if let Some(env) = env_vars {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: command.to_string(),
            source,
        })?;

        let collected = tokio::select! {
            collected = collect(&mut child, max_output_bytes) => Some(collected),
            _ = sleep_or_forever(timeout_ms) => None,
        };

        let (status, stdout, stderr) = match collected {
            Some(result) => result.map_err(|source| ExecutorError::Wait {
                program: command.to_string(),
                source,
            })?,
            None => {
                let timeout_ms = timeout_ms.unwrap_or_default();
                warn!("Command '{command}' timed out after {timeout_ms}ms, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out command '{command}': {e}");
                }
                return Err(ExecutorError::TimedOut {
                    program: command.to_string(),
                    timeout_ms,
                });
            }
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let success = status.success();
        let exit_code = status.code();

        if success {
            info!("Command '{command}' completed successfully in {duration_ms}ms");
        } else {
            warn!("Command '{command}' failed with exit code {exit_code:?} in {duration_ms}ms");
        }

        Ok(ExecutionResult {
            success,
            exit_code,
            stdout: into_text(stdout),
            stderr: into_text(stderr),
            duration_ms,
        })
    }
}

async fn collect(
    child: &mut Child,
    max_output_bytes: usize,
) -> io::Result<(std::process::ExitStatus, Captured, Captured)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) = tokio::join!(
        read_capped(stdout, max_output_bytes, Keep::Head),
        read_capped(stderr, max_output_bytes, Keep::Tail),
        child.wait()
    );
    Ok((status?, stdout?, stderr?))
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    max: usize,
    keep: Keep,
) -> io::Result<Captured> {
    let mut bytes = VecDeque::new();
    let mut dropped = 0;

    if let Some(mut reader) = reader {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            match keep {
                Keep::Head => {
                    let kept = max.saturating_sub(bytes.len()).min(n);
                    bytes.extend(&chunk[..kept]);
                    dropped += n - kept;
                }
                Keep::Tail => {
                    bytes.extend(&chunk[..n]);
                    let excess = bytes.len().saturating_sub(max);
                    bytes.drain(..excess);
                    dropped += excess;
                }
            }
        }
    }

    Ok(Captured {
        bytes: bytes.into(),
        dropped,
        keep,
    })
}

async fn sleep_or_forever(timeout_ms: Option<u64>) {
    match timeout_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending::<()>().await,
    }
}

fn into_text(captured: Captured) -> String {
    let Captured {
        mut bytes,
        mut dropped,
        keep,
    } = captured;
    if dropped == 0 {
        return String::from_utf8_lossy(&bytes).into_owned();
    }

    // do not leave a partial UTF-8 sequence at the cut
    match keep {
        Keep::Head => {
            if let Err(e) = std::str::from_utf8(&bytes) {
                if e.error_len().is_none() {
                    dropped += bytes.len() - e.valid_up_to();
                    bytes.truncate(e.valid_up_to());
                }
            }
        }
        Keep::Tail => {
            let partial = bytes
                .iter()
                .take(3)
                .take_while(|b| (**b & 0b1100_0000) == 0b1000_0000)
                .count();
            bytes.drain(..partial);
            dropped += partial;
        }
    }

    let text = String::from_utf8_lossy(&bytes);
    match keep {
        Keep::Head => format!("{text}\n[truncated {dropped} bytes]"),
        Keep::Tail => format!("[truncated {dropped} bytes]\n{text}"),
    }
}

//! The subprocess-backed completion provider.
//!
//! The production provider shells out to the `claude` CLI:
//!
//! ```text
//! claude -p --output-format json --model sonnet \
//!     [--allowedTools ...] [--disallowedTools ...] \
//!     [--max-turns N] [--resume <session_id>] <prompt>
//! ```
//!
//! Stdout and stderr are drained on background reader tasks that also
//! refresh a last-output stamp. Two timers run against the child: a progress
//! watchdog (no output for too long) and the per-attempt overall timeout;
//! either kills the process and classifies the attempt as a timeout. Exit
//! status maps onto the stable failure taxonomy in
//! [`ProviderFailure`](super::types::ProviderFailure).

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{ProviderFailure, ProviderInvocation, ProviderResponse};

/// A completion provider. The daemon runs one; tests substitute stubs.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        invocation: ProviderInvocation,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderFailure>;
}

/// Provider that spawns the CLI binary.
pub struct CliProvider {
    bin: PathBuf,
    workdir: Option<PathBuf>,
}

impl CliProvider {
    pub fn new(bin: PathBuf, workdir: Option<PathBuf>) -> Self {
        Self { bin, workdir }
    }

    fn build_command(&self, inv: &ProviderInvocation) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(&inv.model);
        if !inv.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").args(&inv.allowed_tools);
        }
        if !inv.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools").args(&inv.disallowed_tools);
        }
        if let Some(turns) = inv.max_turns {
            cmd.arg("--max-turns").arg(turns.to_string());
        }
        if let Some(session) = &inv.session_id {
            cmd.arg("--resume").arg(session);
        }
        cmd.arg(&inv.prompt);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    KilledByWatchdog,
    KilledByAttemptTimeout,
    Cancelled,
}

#[async_trait]
impl CompletionProvider for CliProvider {
    async fn complete(
        &self,
        inv: ProviderInvocation,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderFailure> {
        let mut cmd = self.build_command(&inv);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderFailure::Unavailable {
                    message: format!("provider binary not found at {}", self.bin.display()),
                });
            }
            Err(e) => {
                return Err(ProviderFailure::Unavailable {
                    message: format!("failed to spawn provider: {e}"),
                });
            }
        };

        let stdout = child.stdout.take().ok_or_else(|| ProviderFailure::Internal {
            message: "child stdout was not piped".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ProviderFailure::Internal {
            message: "child stderr was not piped".into(),
        })?;

        let last_output = Arc::new(Mutex::new(Instant::now()));
        let stdout_task = tokio::spawn(drain_stream(stdout, last_output.clone()));
        let stderr_task = tokio::spawn(drain_stream(stderr, last_output.clone()));

        let start = Instant::now();
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => break WaitOutcome::Exited(status),
                        Err(e) => {
                            return Err(ProviderFailure::Internal {
                                message: format!("wait on provider failed: {e}"),
                            });
                        }
                    }
                }
                _ = cancel.cancelled() => break WaitOutcome::Cancelled,
                _ = tick.tick() => {
                    let silent = last_output.lock().unwrap().elapsed();
                    if silent > inv.progress_timeout {
                        warn!(
                            silent_secs = silent.as_secs(),
                            "no provider output, watchdog killing process"
                        );
                        break WaitOutcome::KilledByWatchdog;
                    }
                    if start.elapsed() > inv.attempt_timeout {
                        warn!(
                            elapsed_secs = start.elapsed().as_secs(),
                            "attempt timeout exceeded, killing process"
                        );
                        break WaitOutcome::KilledByAttemptTimeout;
                    }
                }
            }
        };

        if !matches!(outcome, WaitOutcome::Exited(_)) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();
        let elapsed_secs = start.elapsed().as_secs();

        match outcome {
            WaitOutcome::Cancelled => Err(ProviderFailure::Cancelled),
            WaitOutcome::KilledByWatchdog => Err(ProviderFailure::Timeout {
                elapsed_secs,
                reason: "progress watchdog".into(),
            }),
            WaitOutcome::KilledByAttemptTimeout => Err(ProviderFailure::Timeout {
                elapsed_secs,
                reason: "attempt timeout".into(),
            }),
            WaitOutcome::Exited(status) => {
                classify_exit(status, stdout_text, stderr_text, elapsed_secs)
            }
        }
    }
}

fn classify_exit(
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
    elapsed_secs: u64,
) -> Result<ProviderResponse, ProviderFailure> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            // An external SIGKILL/SIGTERM looks like a stuck process being
            // reaped; treat it as a retryable system failure.
            if signal == libc::SIGKILL || signal == libc::SIGTERM {
                return Err(ProviderFailure::Timeout {
                    elapsed_secs,
                    reason: format!("killed by signal {signal}"),
                });
            }
            return Err(ProviderFailure::Internal {
                message: format!("provider died on signal {signal}"),
            });
        }
    }

    match status.code() {
        Some(0) => Ok(parse_provider_stdout(stdout, stderr)),
        Some(1) if !stderr.trim().is_empty() => Err(ProviderFailure::Logical {
            stderr: stderr.trim().to_string(),
        }),
        Some(code) => Err(ProviderFailure::Internal {
            message: format!("provider exited with code {code}: {}", stderr.trim()),
        }),
        None => Err(ProviderFailure::Internal {
            message: "provider exited without status".into(),
        }),
    }
}

/// Decode provider stdout. Valid JSON yields the assistant text, session id,
/// and usage; anything else is still a response, delivered verbatim with a
/// decode diagnostic.
pub fn parse_provider_stdout(stdout: String, stderr: String) -> ProviderResponse {
    let trimmed = stdout.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(doc) => {
            let text = assistant_text(&doc).unwrap_or_else(|| trimmed.to_string());
            ProviderResponse {
                text,
                session_id: doc
                    .get("sessionId")
                    .or_else(|| doc.get("session_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage: doc.get("usage").cloned(),
                metadata: Some(doc),
                raw_stdout: stdout,
                stderr,
                json_decode_error: None,
            }
        }
        Err(e) => {
            debug!("provider stdout was not JSON: {e}");
            ProviderResponse {
                text: trimmed.to_string(),
                session_id: None,
                usage: None,
                metadata: None,
                raw_stdout: stdout,
                stderr,
                json_decode_error: Some(e.to_string()),
            }
        }
    }
}

/// Concatenated text blocks of an assistant document, or the flat `result`
/// field some CLI versions emit.
fn assistant_text(doc: &Value) -> Option<String> {
    if let Some(content) = doc
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    {
        let text: String = content
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        if !text.is_empty() {
            return Some(text);
        }
    }
    doc.get("result").and_then(Value::as_str).map(str::to_string)
}

async fn drain_stream<R>(mut reader: R, last_output: Arc<Mutex<Instant>>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut acc = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                *last_output.lock().unwrap() = Instant::now();
            }
        }
    }
    String::from_utf8_lossy(&acc).into_owned()
}

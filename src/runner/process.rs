use super::{CloseHandle, CommandRunner, PrivilegeMode, RunHandle, RunOptions, Settled, StderrMode};
use crate::error::AppError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stderr kept per run when it is also streamed, enough for the engine's error line.
const STDERR_TAIL_BYTES: usize = 4096;

/// Launches engine commands as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// `sudo` binary, present only when non-interactive elevation works.
    sudo: Option<PathBuf>,
}

impl ProcessRunner {
    /// Probes whether `sudo -n` works so `PrivilegeMode::Try` knows whether to elevate.
    pub async fn detect() -> Self {
        let sudo = match which::which("sudo") {
            Ok(path) => {
                let probe = TokioCommand::new(&path)
                    .args(["-n", "true"])
                    .stdin(StdProcessStdio::null())
                    .stdout(StdProcessStdio::null())
                    .stderr(StdProcessStdio::null())
                    .status()
                    .await;
                match probe {
                    Ok(status) if status.success() => Some(path),
                    _ => None,
                }
            }
            Err(_) => None,
        };
        debug!(sudo = ?sudo, "Probed non-interactive privilege elevation");
        Self { sudo }
    }

    fn command_line(&self, argv: &[String], privilege: PrivilegeMode) -> Result<Vec<String>, AppError> {
        let elevated = |sudo: &PathBuf| {
            let mut line = vec![sudo.to_string_lossy().into_owned(), "-n".to_string()];
            line.extend(argv.iter().cloned());
            line
        };
        match (privilege, &self.sudo) {
            (PrivilegeMode::None, _) | (PrivilegeMode::Try, None) => Ok(argv.to_vec()),
            (PrivilegeMode::Try, Some(sudo)) | (PrivilegeMode::Require, Some(sudo)) => Ok(elevated(sudo)),
            (PrivilegeMode::Require, None) => Err(AppError::SpawnError {
                program: argv.first().cloned().unwrap_or_default(),
                reason: "privileges are required but passwordless sudo is not available".to_string(),
            }),
        }
    }
}

/// Reads `reader` line by line, decoding lossily so a stray byte never ends the stream.
async fn next_lossy_line<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(String::from_utf8_lossy(buf).into_owned()),
    }
}

/// Drops everything but the last `max` bytes, cutting on a char boundary.
fn keep_tail(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

/// Forwards each line to `forward` (if any) and returns the last `keep` bytes read.
fn read_lines<R>(reader: R, forward: Option<mpsc::UnboundedSender<String>>, keep: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut kept = String::new();
        while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
            if keep > 0 {
                kept.push_str(&line);
                keep_tail(&mut kept, keep);
            }
            if let Some(tx) = &forward {
                // Nobody listening any more; keep draining so the child never blocks on a full pipe.
                let _ = tx.send(line);
            }
        }
        kept
    })
}

async fn supervise(
    mut child: Child,
    program: String,
    stdout_task: Option<JoinHandle<String>>,
    stderr_task: Option<JoinHandle<String>>,
    mut cancel_rx: oneshot::Receiver<()>,
    settle_tx: oneshot::Sender<Settled>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut cancel_rx => None,
    };

    let outcome = match waited {
        None => {
            if let Err(e) = child.start_kill() {
                warn!(program = %program, error = %e, "Failed to kill cancelled command");
            }
            let _ = child.wait().await;
            // Readers may be held open by grandchildren; drop our ends of the pipes.
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
            info!(program = %program, "Command cancelled");
            Settled::Cancelled
        }
        Some(Ok(status)) => {
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            let stderr_text = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            if status.success() {
                debug!(program = %program, "Command finished");
                Settled::Success
            } else {
                let message = stderr_text.trim();
                let message = if message.is_empty() {
                    format!("{} exited with {}", program, status)
                } else {
                    message.to_string()
                };
                info!(program = %program, exit_code = ?status.code(), "Command failed");
                Settled::Failed(message)
            }
        }
        Some(Err(e)) => {
            error!(program = %program, error = %e, "Failed to wait for command");
            Settled::Failed(format!("failed to wait for {}: {}", program, e))
        }
    };
    let _ = settle_tx.send(outcome);
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], options: &RunOptions) -> Result<RunHandle, AppError> {
        if options.pty {
            return Err(AppError::Unsupported("pty mode is not available for local processes".to_string()));
        }
        let program = argv
            .first()
            .cloned()
            .ok_or_else(|| AppError::InvalidInputArgument("Empty command".to_string()))?;
        let line = self.command_line(argv, options.privilege)?;

        let mut command = TokioCommand::new(&line[0]);
        command.args(&line[1..]);
        command.stdin(StdProcessStdio::null());
        command.stdout(StdProcessStdio::piped());
        command.stderr(match options.stderr {
            StderrMode::Ignore => StdProcessStdio::null(),
            StderrMode::Message | StderrMode::Out => StdProcessStdio::piped(),
        });
        command.kill_on_drop(true);

        debug!(command = ?line, "Spawning command");
        let mut child = command.spawn().map_err(|e| {
            error!(error = %e, command = ?line, "Failed to spawn command");
            AppError::SpawnError {
                program: program.clone(),
                reason: e.to_string(),
            }
        })?;

        let (chunk_tx, chunks) = mpsc::unbounded_channel();
        let (settle_tx, settled) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let stdout_task = child.stdout.take().map(|out| read_lines(out, Some(chunk_tx.clone()), 0));
        // Stderr becomes the failure message in both modes; `Out` also streams it.
        let stderr_task = match (options.stderr, child.stderr.take()) {
            (StderrMode::Out, Some(err)) => Some(read_lines(err, Some(chunk_tx.clone()), STDERR_TAIL_BYTES)),
            (StderrMode::Message, Some(err)) => Some(read_lines(err, None, usize::MAX)),
            _ => None,
        };
        drop(chunk_tx);

        tokio::spawn(supervise(child, program, stdout_task, stderr_task, cancel_rx, settle_tx));

        Ok(RunHandle {
            chunks,
            settled,
            close: CloseHandle::new(cancel_tx),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn runner() -> ProcessRunner {
        ProcessRunner { sudo: None }
    }

    fn plain() -> RunOptions {
        RunOptions::new(PrivilegeMode::None)
    }

    #[tokio::test]
    async fn output_returns_stdout() {
        let out = runner().output(&sh("printf 'a\\nb\\n'"), &plain()).await.unwrap();
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let err = runner()
            .output(&sh("echo oops >&2; exit 3"), &plain())
            .await
            .unwrap_err();
        match err {
            AppError::EngineCommandError(message) => assert_eq!(message, "oops"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let out = runner().output(&sh("printf 'a\\377b\\nnext\\n'"), &plain()).await.unwrap();
        assert_eq!(out, "a\u{FFFD}b\nnext\n");
    }

    #[tokio::test]
    async fn stderr_out_mode_merges_into_chunks() {
        let options = plain().with_stderr(StderrMode::Out);
        let out = runner().output(&sh("echo warn >&2"), &options).await.unwrap();
        assert_eq!(out, "warn\n");
    }

    #[tokio::test]
    async fn streamed_stderr_still_explains_a_failure() {
        let options = plain().with_stderr(StderrMode::Out);
        let err = runner()
            .output(&sh("echo partial; echo 'Error: No such container: web1' >&2; exit 1"), &options)
            .await
            .unwrap_err();
        match err {
            AppError::EngineCommandError(message) => assert_eq!(message, "Error: No such container: web1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stderr_tail_is_cut_on_a_char_boundary() {
        let mut text = "ééé".to_string();
        keep_tail(&mut text, 3);
        assert_eq!(text, "é");
        let mut short = "ok".to_string();
        keep_tail(&mut short, 10);
        assert_eq!(short, "ok");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sudo_detection_yields_to_other_tasks() {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let ticker = tokio::spawn(async move {
            loop {
                if tick_tx.send(()).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        let detected = tokio::time::timeout(Duration::from_secs(10), ProcessRunner::detect())
            .await
            .expect("detection finishes");
        ticker.abort();
        // Without sudo on PATH there is nothing to wait for.
        if which::which("sudo").is_ok() {
            assert!(tick_rx.try_recv().is_ok(), "other tasks ran while detection was pending");
        }

        let out = detected
            .output(&sh("echo hi"), &RunOptions::new(PrivilegeMode::Try))
            .await
            .unwrap();
        assert_eq!(out, "hi\n");
    }

    #[tokio::test]
    async fn close_cancels_a_long_running_command() {
        let handle = runner().run(&sh("sleep 30"), &plain()).unwrap();
        handle.close.close();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.settled)
            .await
            .expect("cancelled command settles promptly")
            .unwrap();
        assert_eq!(outcome, Settled::Cancelled);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let argv = vec!["definitely-not-a-container-engine".to_string()];
        let err = runner().run(&argv, &plain()).unwrap_err();
        assert!(matches!(err, AppError::SpawnError { .. }));
    }

    #[test]
    fn require_without_sudo_fails_and_pty_is_rejected() {
        let argv = vec!["docker".to_string(), "ps".to_string()];
        assert!(matches!(
            runner().command_line(&argv, PrivilegeMode::Require),
            Err(AppError::SpawnError { .. })
        ));
        assert_eq!(runner().command_line(&argv, PrivilegeMode::Try).unwrap(), argv);

        let elevated = ProcessRunner { sudo: Some(PathBuf::from("/usr/bin/sudo")) };
        assert_eq!(
            elevated.command_line(&argv, PrivilegeMode::Try).unwrap(),
            vec!["/usr/bin/sudo", "-n", "docker", "ps"]
        );

        let mut options = plain();
        options.pty = true;
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            assert!(matches!(runner().run(&argv, &options), Err(AppError::Unsupported(_))));
        });
    }
}

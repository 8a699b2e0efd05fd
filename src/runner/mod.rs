//! The seam between the panel and whatever actually launches engine commands.

pub mod process;

use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

pub use process::ProcessRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Collect stderr and use it as the failure message.
    Message,
    /// Interleave stderr with stdout in the chunk stream.
    Out,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    None,
    /// Elevate when possible, otherwise run as the current user.
    Try,
    Require,
}

impl FromStr for PrivilegeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PrivilegeMode::None),
            "try" => Ok(PrivilegeMode::Try),
            "require" => Ok(PrivilegeMode::Require),
            _ => Err(anyhow::anyhow!("Invalid privilege mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub stderr: StderrMode,
    pub privilege: PrivilegeMode,
    pub pty: bool,
}

impl RunOptions {
    pub fn new(privilege: PrivilegeMode) -> Self {
        Self {
            stderr: StderrMode::Message,
            privilege,
            pty: false,
        }
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Success,
    Failed(String),
    Cancelled,
}

/// A live run. The chunk stream and the settle outcome are consumed by whoever
/// forwards output; `close` stays with whoever owns the session.
#[derive(Debug)]
pub struct RunHandle {
    pub chunks: mpsc::UnboundedReceiver<String>,
    pub settled: oneshot::Receiver<Settled>,
    pub close: CloseHandle,
}

#[derive(Debug)]
pub struct CloseHandle {
    cancel_tx: oneshot::Sender<()>,
}

impl CloseHandle {
    pub fn new(cancel_tx: oneshot::Sender<()>) -> Self {
        Self { cancel_tx }
    }

    /// Requests cancellation. Consuming `self` makes a second close impossible.
    pub fn close(self) {
        let _ = self.cancel_tx.send(());
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, argv: &[String], options: &RunOptions) -> Result<RunHandle, AppError>;

    /// Runs `argv` to completion and returns everything it printed.
    async fn output(&self, argv: &[String], options: &RunOptions) -> Result<String, AppError> {
        let RunHandle {
            mut chunks,
            settled,
            close,
        } = self.run(argv, options)?;
        let mut collected = String::new();
        while let Some(chunk) = chunks.recv().await {
            collected.push_str(&chunk);
        }
        let outcome = settled.await.unwrap_or(Settled::Failed("runner dropped the command".to_string()));
        drop(close);
        match outcome {
            Settled::Success => Ok(collected),
            Settled::Failed(message) => Err(AppError::EngineCommandError(message)),
            Settled::Cancelled => Err(AppError::EngineCommandError(format!("'{}' was cancelled", argv.join(" ")))),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for tests: every `run` records its argv and hands the
    //! test the sending half of the chunk and settle channels.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct FakeProcess {
        pub argv: Vec<String>,
        pub chunk_tx: mpsc::UnboundedSender<String>,
        pub settle_tx: Option<oneshot::Sender<Settled>>,
        pub cancel_rx: oneshot::Receiver<()>,
    }

    impl FakeProcess {
        pub fn emit(&self, chunk: &str) {
            let _ = self.chunk_tx.send(chunk.to_string());
        }

        /// Ends the chunk stream and reports the outcome.
        pub fn finish(mut self, outcome: Settled) -> oneshot::Receiver<()> {
            drop(self.chunk_tx);
            if let Some(tx) = self.settle_tx.take() {
                let _ = tx.send(outcome);
            }
            self.cancel_rx
        }

        pub fn was_closed(&mut self) -> bool {
            matches!(self.cancel_rx.try_recv(), Ok(()))
        }
    }

    #[derive(Default)]
    pub struct FakeRunner {
        pub processes: Mutex<Vec<FakeProcess>>,
        /// Canned output for `output()` calls, matched by argv prefix.
        pub canned: Mutex<VecDeque<(Vec<String>, Result<String, String>)>>,
        pub fail_spawn: Mutex<Option<String>>,
        pub spawned: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, argv: Vec<String>, result: Result<&str, &str>) {
            self.canned.lock().unwrap().push_back((
                argv,
                result.map(str::to_string).map_err(str::to_string),
            ));
        }

        pub fn take(&self, index: usize) -> FakeProcess {
            self.processes.lock().unwrap().remove(index)
        }

        pub fn live_count(&self) -> usize {
            self.processes.lock().unwrap().len()
        }

        pub fn spawned(&self) -> Vec<Vec<String>> {
            self.spawned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        fn run(&self, argv: &[String], _options: &RunOptions) -> Result<RunHandle, AppError> {
            if let Some(reason) = self.fail_spawn.lock().unwrap().clone() {
                return Err(AppError::SpawnError {
                    program: argv.first().cloned().unwrap_or_default(),
                    reason,
                });
            }
            self.spawned.lock().unwrap().push(argv.to_vec());
            let (chunk_tx, chunks) = mpsc::unbounded_channel();
            let (settle_tx, settled) = oneshot::channel();
            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.processes.lock().unwrap().push(FakeProcess {
                argv: argv.to_vec(),
                chunk_tx,
                settle_tx: Some(settle_tx),
                cancel_rx,
            });
            Ok(RunHandle {
                chunks,
                settled,
                close: CloseHandle::new(cancel_tx),
            })
        }

        async fn output(&self, argv: &[String], _options: &RunOptions) -> Result<String, AppError> {
            self.spawned.lock().unwrap().push(argv.to_vec());
            let mut canned = self.canned.lock().unwrap();
            let position = canned
                .iter()
                .position(|(prefix, _)| argv.starts_with(prefix))
                .ok_or_else(|| AppError::EngineCommandError(format!("no canned output for {:?}", argv)))?;
            let (_, result) = canned.remove(position).expect("position is in range");
            result.map_err(AppError::EngineCommandError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRunner;
    use super::*;

    #[test]
    fn privilege_mode_parses_case_insensitively() {
        assert_eq!("TRY".parse::<PrivilegeMode>().unwrap(), PrivilegeMode::Try);
        assert_eq!("require".parse::<PrivilegeMode>().unwrap(), PrivilegeMode::Require);
        assert!("sometimes".parse::<PrivilegeMode>().is_err());
    }

    #[tokio::test]
    async fn default_output_collects_chunks_until_settled() {
        struct Scripted(FakeRunner);

        #[async_trait]
        impl CommandRunner for Scripted {
            fn run(&self, argv: &[String], options: &RunOptions) -> Result<RunHandle, AppError> {
                self.0.run(argv, options)
            }
        }

        let runner = std::sync::Arc::new(Scripted(FakeRunner::new()));
        let argv = vec!["docker".to_string(), "info".to_string()];
        let task_runner = runner.clone();
        let task = tokio::spawn(async move {
            task_runner
                .output(&argv, &RunOptions::new(PrivilegeMode::None))
                .await
        });

        while runner.0.live_count() == 0 {
            tokio::task::yield_now().await;
        }
        let process = runner.0.take(0);
        process.emit("Server: ");
        process.emit("ok\n");
        process.finish(Settled::Success);

        assert_eq!(task.await.unwrap().unwrap(), "Server: ok\n");
    }
}

//! The manage modal: logs, terminal and details for one container at a time.
//!
//! The modal owns no streams itself. Log follow and terminal commands run in
//! the [`StreamManager`] slots; this module decides when they start and stop.

use super::EngineContext;
use crate::config::Config;
use crate::engine::validate_container_name;
use crate::error::AppError;
use crate::lifecycle::{SessionInfo, StopOptions, StreamKind, StreamManager, StreamStats};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManageTab {
    #[default]
    Logs,
    Terminal,
    Details,
}

#[derive(Debug, Deserialize)]
pub struct OpenManageParams {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SwitchTabParams {
    pub tab: ManageTab,
}

#[derive(Debug, Default, Deserialize)]
pub struct FollowLogsParams {
    pub tail: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenTerminalParams {
    pub shell: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunCommandParams {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct OpenManageResult {
    pub container: String,
    pub tab: ManageTab,
    pub initial_logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_error: Option<String>,
    /// `None` when the modal was reopened or closed while logs were loading.
    pub follow: Option<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct TerminalOpened {
    pub container: String,
    pub shell: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResult {
    /// Absent for an empty command, which runs nothing.
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct StopResult {
    pub stopped: bool,
}

#[derive(Debug, Serialize)]
pub struct ManageStatus {
    pub open: bool,
    pub container: Option<String>,
    pub tab: ManageTab,
    pub terminal_shell: Option<String>,
    pub log_follow: Option<SessionInfo>,
    pub terminal: Option<SessionInfo>,
    pub log_follow_stats: StreamStats,
    pub terminal_stats: StreamStats,
}

#[derive(Debug, Default)]
struct ModalState {
    container: Option<String>,
    tab: ManageTab,
    terminal_shell: Option<String>,
    /// Bumped on every open and close; an open that awaited the initial logs
    /// only starts following if nothing replaced it meanwhile.
    generation: u64,
}

#[derive(Debug)]
pub struct ManageModal {
    ctx: EngineContext,
    streams: StreamManager,
    config: Arc<Config>,
    state: Mutex<ModalState>,
}

impl ManageModal {
    pub fn new(ctx: EngineContext, streams: StreamManager, config: Arc<Config>) -> Self {
        Self {
            ctx,
            streams,
            config,
            state: Mutex::new(ModalState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_container(&self) -> Result<String, AppError> {
        self.lock()
            .container
            .clone()
            .ok_or_else(|| AppError::NotFound("manage modal".to_string()))
    }

    fn start_follow(&self, container: &str, tail: u32) -> SessionInfo {
        self.streams.start(
            StreamKind::LogFollow,
            container,
            self.ctx.engine.follow_logs(container, tail),
            &self.ctx.stream_options(),
        )
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn open(&self, params: &OpenManageParams) -> Result<OpenManageResult, AppError> {
        let name = validate_container_name(&params.name)?.to_string();
        self.streams.shutdown();
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.container = Some(name.clone());
            state.tab = ManageTab::Logs;
            state.terminal_shell = None;
            state.generation
        };

        let (initial_logs, log_error) = match self
            .ctx
            .runner
            .output(&self.ctx.engine.logs(&name, self.config.initial_log_tail), &self.ctx.stream_options())
            .await
        {
            Ok(logs) => (logs, None),
            Err(e) => {
                warn!(error = %e, "Failed to load initial logs");
                (String::new(), Some(format!("Failed to load logs: {}", e)))
            }
        };

        let still_current = {
            let state = self.lock();
            state.generation == generation && state.tab == ManageTab::Logs
        };
        let follow = if still_current {
            Some(self.start_follow(&name, self.config.follow_log_tail))
        } else {
            debug!("Modal changed while loading logs; not following");
            None
        };
        info!("Opened manage modal");

        Ok(OpenManageResult {
            container: name,
            tab: ManageTab::Logs,
            initial_logs,
            log_error,
            follow,
        })
    }

    #[instrument(skip(self, params), fields(tab = ?params.tab))]
    pub async fn switch_tab(&self, params: &SwitchTabParams) -> Result<ManageStatus, AppError> {
        self.open_container()?;
        self.lock().tab = params.tab;
        if params.tab != ManageTab::Logs {
            self.streams.stop(StreamKind::LogFollow, StopOptions::announced());
        }
        Ok(self.status())
    }

    #[instrument(skip(self, params), fields(tail = ?params.tail))]
    pub async fn follow_logs(&self, params: &FollowLogsParams) -> Result<SessionInfo, AppError> {
        let container = self.open_container()?;
        if self.lock().tab != ManageTab::Logs {
            return Err(AppError::InvalidInputArgument(
                "Logs can only be followed from the logs tab".to_string(),
            ));
        }
        Ok(self.start_follow(&container, params.tail.unwrap_or(self.config.follow_log_tail)))
    }

    #[instrument(skip(self))]
    pub async fn stop_logs(&self) -> Result<StopResult, AppError> {
        self.open_container()?;
        Ok(StopResult {
            stopped: self.streams.stop(StreamKind::LogFollow, StopOptions::announced()),
        })
    }

    #[instrument(skip(self, params), fields(shell = ?params.shell))]
    pub async fn open_terminal(&self, params: &OpenTerminalParams) -> Result<TerminalOpened, AppError> {
        let container = self.open_container()?;
        let shell = params
            .shell
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.config.default_shell.as_str())
            .to_string();
        let plain_path = shell
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'));
        if !shell.starts_with('/') || !plain_path {
            return Err(AppError::InvalidInputArgument(format!(
                "Shell must be an absolute path: {:?}",
                shell
            )));
        }
        // A reopened terminal must not show output of a command from the old one.
        self.streams.stop(StreamKind::Terminal, StopOptions::silent());
        self.lock().terminal_shell = Some(shell.clone());
        info!(shell = %shell, "Terminal opened");
        Ok(TerminalOpened {
            message: format!("Connected to {} using {}", container, shell),
            container,
            shell,
        })
    }

    /// Runs one command in the open terminal, superseding any command still
    /// running there.
    #[instrument(skip(self, params))]
    pub async fn run_command(&self, params: &RunCommandParams) -> Result<CommandResult, AppError> {
        let (container, shell) = {
            let state = self.lock();
            match (&state.container, &state.terminal_shell) {
                (Some(container), Some(shell)) => (container.clone(), shell.clone()),
                _ => return Err(AppError::NotFound("terminal".to_string())),
            }
        };
        let command = params.command.trim();
        if command.is_empty() {
            return Ok(CommandResult { session: None });
        }
        if self.config.is_command_blocked(command) {
            warn!(command = %command, "Blocked terminal command");
            return Err(AppError::CommandBlocked(command.to_string()));
        }
        let session = self.streams.start(
            StreamKind::Terminal,
            &container,
            self.ctx.engine.exec(&container, &shell, command),
            &self.ctx.stream_options(),
        );
        Ok(CommandResult { session: Some(session) })
    }

    #[instrument(skip(self))]
    pub async fn close_terminal(&self) -> Result<StopResult, AppError> {
        if self.lock().terminal_shell.take().is_none() {
            return Err(AppError::NotFound("terminal".to_string()));
        }
        Ok(StopResult {
            stopped: self.streams.stop(StreamKind::Terminal, StopOptions::announced()),
        })
    }

    /// Silent teardown of both streams. Closing a closed modal is fine.
    #[instrument(skip(self))]
    pub async fn close(&self) -> StopResult {
        let was_open = {
            let mut state = self.lock();
            let generation = state.generation + 1;
            let was_open = state.container.is_some();
            *state = ModalState {
                generation,
                ..ModalState::default()
            };
            was_open
        };
        self.streams.shutdown();
        StopResult { stopped: was_open }
    }

    /// Closes the modal if it is showing `name`.
    pub async fn on_container_deleted(&self, name: &str) {
        let targets = self.lock().container.as_deref() == Some(name);
        if targets {
            debug!(name, "Closing manage modal of deleted container");
            self.close().await;
        }
    }

    pub fn status(&self) -> ManageStatus {
        let state = self.lock();
        ManageStatus {
            open: state.container.is_some(),
            container: state.container.clone(),
            tab: state.tab,
            terminal_shell: state.terminal_shell.clone(),
            log_follow: self.streams.session(StreamKind::LogFollow),
            terminal: self.streams.session(StreamKind::Terminal),
            log_follow_stats: self.streams.stats(StreamKind::LogFollow),
            terminal_stats: self.streams.stats(StreamKind::Terminal),
        }
    }
}

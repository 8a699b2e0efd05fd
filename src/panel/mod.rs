pub mod containers;
pub mod images;
pub mod manage;

use crate::config::Config;
use crate::engine::EngineCli;
use crate::error::AppError;
use crate::runner::{CommandRunner, PrivilegeMode, RunOptions, StderrMode};
use std::sync::Arc;

/// What every panel service needs to talk to the engine.
#[derive(Clone)]
pub struct EngineContext {
    pub runner: Arc<dyn CommandRunner>,
    pub engine: EngineCli,
    pub privilege: PrivilegeMode,
}

impl EngineContext {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            engine: EngineCli::new(config.engine_binary.clone()),
            privilege: config.privilege_mode,
        }
    }

    /// One-shot commands: stderr becomes the error message.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::new(self.privilege)
    }

    /// Log and terminal streams: stderr is part of the output.
    pub fn stream_options(&self) -> RunOptions {
        self.run_options().with_stderr(StderrMode::Out)
    }

    pub async fn output(&self, argv: Vec<String>) -> Result<String, AppError> {
        self.runner.output(&argv, &self.run_options()).await
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("engine", &self.engine)
            .field("privilege", &self.privilege)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "PANEL_LOG_DIR" => Some(std::env::temp_dir().join("container-panel-tests").to_string_lossy().into_owned()),
        "PRIVILEGE_MODE" => Some("none".to_string()),
        "BLOCKED_COMMANDS" => Some("shutdown".to_string()),
        _ => None,
    })
    .expect("test config")
}

use crate::engine::parse::SortKey;
use crate::runner::PrivilegeMode;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub engine_binary: String,
    pub privilege_mode: PrivilegeMode,
    pub log_level: String,
    pub transport_mode: TransportMode,
    pub sse_host: String,
    pub sse_port: u16,
    pub initial_log_tail: u32,
    pub follow_log_tail: u32,
    pub default_shell: String,
    pub default_sort: SortKey,
    pub blocked_commands: Vec<String>,
    #[serde(skip)]
    pub blocked_command_patterns: Vec<Regex>,
    pub event_buffer_size: usize,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    Sse,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "sse" => Ok(TransportMode::Sse),
            _ => Err(anyhow::anyhow!("Invalid transport mode: {}", s)),
        }
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    shellexpand::full(path_str)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| anyhow::anyhow!("Failed to expand tilde for path '{}': {}", path_str, e))
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, raw, e))
}

/// Builds a matcher for a blocked command word. Leading `VAR=value` pairs are skipped.
fn blocked_command_regex(command: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
        regex::escape(command)
    ))
    .context(format!("Invalid regex for blocked command: {}", command))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let engine_binary = lookup("CONTAINER_ENGINE").unwrap_or_else(|| "docker".to_string());
        if engine_binary.trim().is_empty() || engine_binary.starts_with('-') {
            anyhow::bail!("CONTAINER_ENGINE is not a usable program name: {:?}", engine_binary);
        }

        let privilege_mode: PrivilegeMode = parse_var(&lookup, "PRIVILEGE_MODE", "try")?;
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let transport_mode: TransportMode = parse_var(&lookup, "PANEL_TRANSPORT", "stdio")?;

        let sse_host = lookup("PANEL_SSE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let sse_port: u16 = parse_var(&lookup, "PANEL_SSE_PORT", "9095")?;

        let initial_log_tail: u32 = parse_var(&lookup, "INITIAL_LOG_TAIL", "100")?;
        let follow_log_tail: u32 = parse_var(&lookup, "FOLLOW_LOG_TAIL", "0")?;

        let default_shell = lookup("DEFAULT_SHELL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let default_sort: SortKey = parse_var(&lookup, "DEFAULT_SORT", "name")?;

        let blocked_commands: Vec<String> = lookup("BLOCKED_COMMANDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let blocked_command_patterns = blocked_commands
            .iter()
            .map(|s| blocked_command_regex(s))
            .collect::<Result<Vec<Regex>>>()?;

        let mut event_buffer_size: usize = parse_var(&lookup, "EVENT_BUFFER_SIZE", "500")?;
        if event_buffer_size == 0 {
            warn!("EVENT_BUFFER_SIZE is 0; using 1 so late subscribers can still poll the last event");
            event_buffer_size = 1;
        }

        let log_dir_base = lookup("PANEL_LOG_DIR").unwrap_or_else(|| "~/.container-panel".to_string());
        let audit_log_file = expand_tilde(&log_dir_base)?.join("actions.log");
        let audit_log_max_size_bytes = lookup("AUDIT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(10 * 1024 * 1024);

        Ok(Config {
            engine_binary,
            privilege_mode,
            log_level,
            transport_mode,
            sse_host,
            sse_port,
            initial_log_tail,
            follow_log_tail,
            default_shell,
            default_sort,
            blocked_commands,
            blocked_command_patterns,
            event_buffer_size,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }

    /// Checks every simple command in `command_str`, so chaining, pipes and
    /// substitutions cannot smuggle a blocked command past the first word.
    pub fn is_command_blocked(&self, command_str: &str) -> bool {
        command_separators()
            .split(command_str)
            .map(str::trim_start)
            .filter(|segment| !segment.is_empty())
            .any(|segment| self.blocked_command_patterns.iter().any(|regex| regex.is_match(segment)))
    }
}

/// Shell control operators and substitution openers that start a new command.
fn command_separators() -> &'static Regex {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS.get_or_init(|| Regex::new(r"&&|\|\||[;&|\n`()]|\$\(").expect("separator regex is valid"))
}

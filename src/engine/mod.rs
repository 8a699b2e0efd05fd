//! Argument vectors for the container engine CLI.

pub mod parse;

use crate::error::AppError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const CONTAINER_LIST_FORMAT: &str = "{{.Names}}\t{{.Status}}\t{{.Ports}}";
pub const CONTAINER_ID_FORMAT: &str = "{{.ID}}\t{{.Names}}";
pub const STATS_FORMAT: &str = "{{.Container}}\t{{.CPUPerc}}\t{{.MemUsage}}\t{{.MemPerc}}";
pub const IMAGE_LIST_FORMAT: &str = "{{.Repository}}:{{.Tag}}\t{{.ID}}\t{{.Size}}\t{{.CreatedSince}}";
pub const IMAGE_USAGE_FORMAT: &str = "{{.Image}}\t{{.ImageID}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
        }
    }

    /// Banner text shown while the action runs, e.g. "Stopping web1…".
    pub fn progress_label(&self) -> &'static str {
        match self {
            ContainerAction::Start => "Starting",
            ContainerAction::Stop => "Stopping",
            ContainerAction::Restart => "Restarting",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            ContainerAction::Start => "Started",
            ContainerAction::Stop => "Stopped",
            ContainerAction::Restart => "Restarted",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn container_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/?[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("static regex"))
}

fn image_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.:/@+-]*$").expect("static regex"))
}

/// Rejects anything the engine could read as a flag or that is not a legal name.
pub fn validate_container_name(name: &str) -> Result<&str, AppError> {
    let trimmed = name.trim();
    if container_name_regex().is_match(trimmed) {
        Ok(trimmed.trim_start_matches('/'))
    } else {
        Err(AppError::InvalidInputArgument(format!("Invalid container name: {:?}", name)))
    }
}

pub fn validate_image_ref(image: &str) -> Result<&str, AppError> {
    let trimmed = image.trim();
    if image_ref_regex().is_match(trimmed) {
        Ok(trimmed)
    } else {
        Err(AppError::InvalidInputArgument(format!("Invalid image reference: {:?}", image)))
    }
}

/// Builds argv for one engine binary (`docker`, `podman`, ...).
#[derive(Debug, Clone)]
pub struct EngineCli {
    binary: String,
}

impl EngineCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.binary.as_str())
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    pub fn info(&self) -> Vec<String> {
        self.argv(&["info"])
    }

    pub fn list_containers(&self) -> Vec<String> {
        self.argv(&["ps", "-a", "--format", CONTAINER_LIST_FORMAT])
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.argv(&["ps", "-a", "--format", CONTAINER_ID_FORMAT])
    }

    pub fn stats(&self) -> Vec<String> {
        self.argv(&["stats", "--no-stream", "--format", STATS_FORMAT])
    }

    pub fn container_action(&self, action: ContainerAction, name: &str) -> Vec<String> {
        self.argv(&[action.as_str(), name])
    }

    pub fn remove_container(&self, name: &str) -> Vec<String> {
        self.argv(&["rm", "-f", name])
    }

    pub fn inspect(&self, name: &str) -> Vec<String> {
        self.argv(&["inspect", "--type", "container", name])
    }

    /// Same as [`inspect`](Self::inspect) but with the engine pre-formatting JSON.
    pub fn inspect_json(&self, name: &str) -> Vec<String> {
        self.argv(&["inspect", "--type", "container", "--format", "{{json .}}", name])
    }

    pub fn logs(&self, name: &str, tail: u32) -> Vec<String> {
        self.argv(&["logs", "--tail", &tail.to_string(), name])
    }

    pub fn follow_logs(&self, name: &str, tail: u32) -> Vec<String> {
        self.argv(&["logs", "--tail", &tail.to_string(), "-f", name])
    }

    pub fn exec(&self, name: &str, shell: &str, command: &str) -> Vec<String> {
        self.argv(&["exec", name, shell, "-lc", command])
    }

    pub fn images(&self) -> Vec<String> {
        self.argv(&["images", "--no-trunc", "--format", IMAGE_LIST_FORMAT])
    }

    pub fn image_usage(&self) -> Vec<String> {
        self.argv(&["ps", "-a", "--no-trunc", "--format", IMAGE_USAGE_FORMAT])
    }

    pub fn remove_image(&self, id: &str) -> Vec<String> {
        self.argv(&["rmi", id])
    }

    pub fn prune_images(&self) -> Vec<String> {
        self.argv(&["image", "prune", "-a", "-f"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_and_exec_argv_match_engine_cli() {
        let engine = EngineCli::new("docker");
        assert_eq!(engine.follow_logs("web1", 0), vec!["docker", "logs", "--tail", "0", "-f", "web1"]);
        assert_eq!(engine.logs("web1", 100), vec!["docker", "logs", "--tail", "100", "web1"]);
        assert_eq!(
            engine.exec("db1", "/bin/bash", "ls -la | head"),
            vec!["docker", "exec", "db1", "/bin/bash", "-lc", "ls -la | head"]
        );
        assert_eq!(
            engine.container_action(ContainerAction::Restart, "web1"),
            vec!["docker", "restart", "web1"]
        );
        assert_eq!(EngineCli::new("podman").prune_images(), vec!["podman", "image", "prune", "-a", "-f"]);
    }

    #[test]
    fn names_that_look_like_flags_are_rejected() {
        assert_eq!(validate_container_name("web_1.prod-a").unwrap(), "web_1.prod-a");
        assert_eq!(validate_container_name("/web1").unwrap(), "web1");
        assert!(validate_container_name("-f").is_err());
        assert!(validate_container_name("web1; rm").is_err());
        assert!(validate_container_name("").is_err());

        assert!(validate_image_ref("sha256:0123abcd").is_ok());
        assert!(validate_image_ref("ghcr.io/org/app:1.2").is_ok());
        assert!(validate_image_ref("--force").is_err());
    }
}

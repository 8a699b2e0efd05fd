use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_STRING_LEN: usize = 1024;

/// Appends one line per dispatched action to a size-rotated file.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(log_file_path: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        let log_file_path = log_file_path.into();
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_path = self
                .log_file_path
                .with_file_name(format!("{}_{}.{}", file_stem, timestamp, extension));
            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Never fails the action; write errors only end up in the tracing log.
    pub async fn log_action(&self, action: &str, params: &Value) {
        if let Err(e) = self.try_log_action(action, params).await {
            error!(action = %action, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_action(&self, action: &str, params: &Value) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let entry = format!(
            "{} | {:<20} | Params: {}\n",
            Utc::now().to_rfc3339(),
            action,
            serde_json::to_string(&sanitize(params))?
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        Ok(())
    }
}

/// Replaces long string params (pasted scripts, mostly) with a placeholder.
fn sanitize(params: &Value) -> Value {
    let mut sanitized = params.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for (key, value) in obj.iter_mut() {
            if value.as_str().is_some_and(|s| s.len() > MAX_LOGGED_STRING_LEN) {
                *value = Value::String(format!("<{} truncated for log>", key));
            }
        }
    }
    sanitized
}

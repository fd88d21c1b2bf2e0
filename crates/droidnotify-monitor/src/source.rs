use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use droidnotify_core::NotificationRecord;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Termux:API command printing the active notifications as a JSON array.
pub const DEFAULT_LIST_COMMAND: &str = "termux-notification-list";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("spawn failure: `{command}`: {detail}")]
    Spawn { command: String, detail: String },
    #[error("non-zero exit ({}): {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("malformed output: {detail}")]
    MalformedOutput { detail: String },
    #[error("timed out: listing command ran longer than {0:?}")]
    TimedOut(Duration),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "killed by signal".to_string(),
    }
}

impl SourceError {
    pub fn category(&self) -> &'static str {
        match self {
            SourceError::Spawn { .. } => "spawn failure",
            SourceError::NonZeroExit { .. } => "non-zero exit",
            SourceError::MalformedOutput { .. } => "malformed output",
            SourceError::TimedOut(_) => "timed out",
        }
    }
}

/// Produces one full snapshot of the active notifications per call.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<NotificationRecord>, SourceError>;

    /// Called by the monitor once per stop, after its in-flight poll has been
    /// dropped. Must not disturb fetches started by anyone else.
    fn cleanup(&self) {}
}

/// Runs the listing command through `sh -c`, one process per fetch.
///
/// Each fetch owns its child; dropping the fetch future kills it.
pub struct CommandSource {
    command: String,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Default for CommandSource {
    fn default() -> Self {
        Self::new(DEFAULT_LIST_COMMAND, Duration::from_secs(10))
    }
}

#[async_trait]
impl SnapshotSource for CommandSource {
    async fn fetch(&self) -> Result<Vec<NotificationRecord>, SourceError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Spawn {
                command: self.command.clone(),
                detail: e.to_string(),
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(SourceError::Spawn {
                    command: self.command.clone(),
                    detail: e.to_string(),
                });
            }
            Err(_) => return Err(SourceError::TimedOut(self.timeout)),
        };

        if !output.status.success() {
            return Err(SourceError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parse_snapshot(&stdout)?;
        debug!(count = records.len(), "fetched notification snapshot");
        Ok(records)
    }
}

/// Turn the listing command's stdout into records.
///
/// Empty output and a literal `null` are an empty snapshot. The whole array is
/// decoded strictly first; if that fails, each entry is validated on its own and
/// only the invalid ones are dropped, since the command's output shape is not
/// guaranteed.
pub fn parse_snapshot(stdout: &str) -> Result<Vec<NotificationRecord>, SourceError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| SourceError::MalformedOutput {
        detail: format!("{e}: {}", preview(trimmed)),
    })?;

    let Value::Array(items) = value else {
        return Err(SourceError::MalformedOutput {
            detail: format!("expected a JSON array: {}", preview(trimmed)),
        });
    };

    if let Ok(records) = serde_json::from_value::<Vec<NotificationRecord>>(Value::Array(items.clone()))
    {
        return Ok(records);
    }

    let total = items.len();
    let records = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match NotificationRecord::validate(item) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!(index, error = %e, "dropping invalid notification entry");
                None
            }
        })
        .collect::<Vec<_>>();

    warn!(
        kept = records.len(),
        dropped = total - records.len(),
        "notification snapshot partially invalid"
    );
    Ok(records)
}

fn preview(s: &str) -> String {
    const MAX: usize = 200;
    match s.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

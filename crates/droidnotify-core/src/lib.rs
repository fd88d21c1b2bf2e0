//! Core types shared across the droidnotify workspace.
//!
//! Kept free of async runtimes so the monitor, the MCP server and the fuzz
//! harness can all depend on it.

pub mod record;

pub use record::{FieldIssue, NotificationRecord, RecordError};

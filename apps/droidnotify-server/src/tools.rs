use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use droidnotify_core::NotificationRecord;
use droidnotify_mcp::{
    CallToolParams, CallToolResult, JsonRpcMessage, JsonRpcNotification, ListToolsParams,
    ListToolsResult, McpHandler, Tool,
};
use droidnotify_monitor::{Monitor, MonitorEvent};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, info, warn};

use crate::session::SessionHub;

pub const TOOL_WAIT: &str = "waitForNotification";
pub const TOOL_STOP: &str = "stopWaitingForNotification";
pub const TOOL_GET: &str = "getCurrentNotifications";

pub const METHOD_NEW_NOTIFICATION: &str = "notifications/newNotification";
pub const METHOD_ERROR: &str = "notifications/error";

const MAX_LIMIT: i64 = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitArgs {
    timeout: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetArgs {
    package_name: Option<String>,
    limit: Option<i64>,
}

/// The three notification tools, shared by every session.
///
/// Monitor events are forwarded to all sessions with a push channel by a task
/// spawned at construction.
pub struct NotificationTools {
    monitor: Arc<Monitor>,
    forwarder: JoinHandle<()>,
}

impl NotificationTools {
    pub fn new(monitor: Arc<Monitor>, hub: SessionHub) -> Self {
        let forwarder = spawn_event_forwarder(monitor.subscribe(), hub);
        Self { monitor, forwarder }
    }

    fn wait_for_notification(&self, args: WaitArgs) -> CallToolResult {
        let timeout = match args.timeout {
            None => None,
            Some(secs) => match Duration::try_from_secs_f64(secs) {
                Ok(d) if secs > 0.0 => Some((secs, d)),
                _ => {
                    return CallToolResult::failure(format!(
                        "Invalid arguments: timeout must be a positive number of seconds, got {secs}"
                    ));
                }
            },
        };

        let started = self.monitor.start();

        if let Some((_, d)) = timeout {
            let monitor = Arc::downgrade(&self.monitor);
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                if let Some(m) = monitor.upgrade()
                    && m.stop()
                {
                    info!(timeout_ms = d.as_millis() as u64, "monitoring timeout elapsed");
                }
            });
        }

        let mut summary = if started {
            "Started monitoring for new notifications.".to_string()
        } else {
            "Already monitoring for new notifications.".to_string()
        };
        if let Some((secs, _)) = timeout {
            summary.push_str(&format!(" Monitoring will stop after {secs} seconds."));
        }
        summary.push_str(" New notifications are pushed as notifications/newNotification messages.");

        CallToolResult::success(
            summary,
            serde_json::json!({
                "monitoring": true,
                "alreadyMonitoring": !started,
                "timeoutSet": timeout.is_some(),
                "timeoutSeconds": timeout.map(|(secs, _)| secs),
            }),
        )
    }

    fn stop_waiting(&self) -> CallToolResult {
        let was_monitoring = self.monitor.stop();
        let summary = if was_monitoring {
            "Stopped monitoring for new notifications."
        } else {
            "Monitoring was not active."
        };
        CallToolResult::success(
            summary,
            serde_json::json!({ "monitoring": false, "wasMonitoring": was_monitoring }),
        )
    }

    async fn get_current(&self, args: GetArgs) -> CallToolResult {
        if let Some(limit) = args.limit
            && !(1..=MAX_LIMIT).contains(&limit)
        {
            return CallToolResult::failure(format!(
                "Invalid arguments: limit must be between 1 and {MAX_LIMIT}, got {limit}"
            ));
        }

        let snapshot = match self.monitor.current_notifications().await {
            Ok(s) => s,
            Err(e) => {
                warn!(category = e.category(), error = %e, "snapshot for tool call failed");
                return CallToolResult::failure(format!("Failed to get notifications: {e}"));
            }
        };

        let notifications = select_notifications(snapshot, args.package_name.as_deref(), args.limit);
        let count = notifications.len();
        CallToolResult::success(
            format!("Found {count} notification(s)."),
            serde_json::json!({ "notifications": notifications, "count": count }),
        )
    }
}

impl Drop for NotificationTools {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Filter by exact package name, then keep the first `limit` records.
fn select_notifications(
    snapshot: Vec<NotificationRecord>,
    package_name: Option<&str>,
    limit: Option<i64>,
) -> Vec<NotificationRecord> {
    let limit = limit.and_then(|l| usize::try_from(l).ok()).unwrap_or(usize::MAX);
    snapshot
        .into_iter()
        .filter(|r| package_name.is_none_or(|p| r.package_name == p))
        .take(limit)
        .collect()
}

fn parse_args<T: DeserializeOwned + Default>(args: Option<Value>) -> Result<T, String> {
    match args {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v).map_err(|e| e.to_string()),
    }
}

#[async_trait]
impl McpHandler for NotificationTools {
    async fn list_tools(&self, _params: ListToolsParams) -> anyhow::Result<ListToolsResult> {
        Ok(ListToolsResult {
            tools: tool_definitions(),
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult> {
        let tool = params.name.clone();
        async move {
            let result = match params.name.as_str() {
                TOOL_WAIT => match parse_args::<WaitArgs>(params.arguments) {
                    Ok(args) => self.wait_for_notification(args),
                    Err(e) => CallToolResult::failure(format!("Invalid arguments: {e}")),
                },
                TOOL_STOP => self.stop_waiting(),
                TOOL_GET => match parse_args::<GetArgs>(params.arguments) {
                    Ok(args) => self.get_current(args).await,
                    Err(e) => CallToolResult::failure(format!("Invalid arguments: {e}")),
                },
                other => CallToolResult::failure(format!("Unknown tool: {other}")),
            };
            debug!(is_error = result.is_failure(), "tool call finished");
            Ok(result)
        }
        .instrument(tracing::info_span!("tools.call", tool = %tool))
        .await
    }
}

fn tool_definitions() -> Vec<Tool> {
    vec![
        Tool {
            name: TOOL_WAIT.to_string(),
            title: Some("Wait for notifications".to_string()),
            description: Some(
                "Start monitoring for new Android notifications. Each new notification is \
                 pushed to connected clients as a notifications/newNotification message. \
                 Returns immediately."
                    .to_string(),
            ),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "timeout": {
                        "type": "number",
                        "exclusiveMinimum": 0,
                        "description": "Stop monitoring automatically after this many seconds."
                    }
                }
            }),
        },
        Tool {
            name: TOOL_STOP.to_string(),
            title: Some("Stop waiting for notifications".to_string()),
            description: Some(
                "Stop monitoring for new notifications. Safe to call when not monitoring."
                    .to_string(),
            ),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        },
        Tool {
            name: TOOL_GET.to_string(),
            title: Some("Get current notifications".to_string()),
            description: Some(
                "List the notifications currently shown on the device, optionally filtered \
                 by package name and limited in count."
                    .to_string(),
            ),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "packageName": {
                        "type": "string",
                        "description": "Only return notifications from this package, e.g. com.whatsapp."
                    },
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_LIMIT,
                        "description": "Maximum number of notifications to return."
                    }
                }
            }),
        },
    ]
}

/// JSON-RPC notification pushed to clients for one monitor event.
pub fn event_notification(ev: &MonitorEvent) -> JsonRpcMessage {
    match ev {
        MonitorEvent::NewNotification(rec) => JsonRpcNotification::new(
            METHOD_NEW_NOTIFICATION,
            Some(serde_json::json!({ "notification": rec })),
        ),
        MonitorEvent::Error(message) => {
            JsonRpcNotification::new(METHOD_ERROR, Some(serde_json::json!({ "message": message })))
        }
    }
    .into()
}

fn spawn_event_forwarder(
    mut events: broadcast::Receiver<MonitorEvent>,
    hub: SessionHub,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        let delivered = hub.broadcast(&event_notification(&ev));
                        debug!(delivered, "forwarded monitor event");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event forwarder lagged behind monitor");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
        .instrument(tracing::info_span!("event_forwarder")),
    )
}

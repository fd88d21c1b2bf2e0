use anyhow::Context as _;
use droidnotify_mcp::{JsonRpcMessage, parse_message};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::app::AppState;

pub async fn run_stdio(st: AppState) -> anyhow::Result<()> {
    run_lines(st, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Newline-delimited JSON-RPC over a byte stream pair.
///
/// The process-wide stdio session is registered in the hub like any other, so
/// monitor events reach it too. Responses and pushes share one writer task so
/// lines never interleave.
pub async fn run_lines<R, W>(st: AppState, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = st.hub.create(st.new_connection());
    let (tx, rx) = mpsc::channel(st.push_capacity);
    session.attach_push(tx.clone());
    let writer_task = tokio::spawn(write_lines(rx, writer));
    info!(session_id = %session.id(), "stdio transport ready");

    let mut lines = BufReader::new(reader).lines();
    let served = async {
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let resp = match parse_message(&line) {
                Ok(msg) => session.handle(msg).await,
                Err(resp) => Some(resp),
            };
            if let Some(resp) = resp {
                tx.send(resp.into())
                    .await
                    .map_err(|_| anyhow::anyhow!("stdout writer stopped"))?;
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    st.hub.remove(session.id());
    drop(tx);
    let written = writer_task.await.context("stdout writer join")?;
    info!("stdin closed");
    served.and(written)
}

async fn write_lines<W>(mut rx: mpsc::Receiver<JsonRpcMessage>, mut out: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let line = serde_json::to_string(&msg)?;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use droidnotify_core::NotificationRecord;
    use droidnotify_mcp::{JsonRpcNotification, McpHandler, McpServerConfig};
    use droidnotify_monitor::{Monitor, MonitorConfig, SnapshotSource, SourceError};
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, Lines};

    use super::*;
    use crate::session::SessionHub;
    use crate::tools::NotificationTools;

    struct Empty;

    #[async_trait]
    impl SnapshotSource for Empty {
        async fn fetch(&self) -> Result<Vec<NotificationRecord>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn state() -> AppState {
        let monitor = Monitor::new(Arc::new(Empty), MonitorConfig::default());
        let hub = SessionHub::new();
        let handler: Arc<dyn McpHandler> =
            Arc::new(NotificationTools::new(monitor.clone(), hub.clone()));
        AppState::new(
            McpServerConfig::default_for_binary("droidnotify-test", "0.0.0"),
            handler,
            hub,
            monitor,
        )
    }

    async fn next_json(lines: &mut Lines<BufReader<DuplexStream>>) -> anyhow::Result<Value> {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await?
            .context("io")?
            .context("eof")?;
        Ok(serde_json::from_str(&line)?)
    }

    #[tokio::test]
    async fn answers_requests_and_reports_bad_lines() -> anyhow::Result<()> {
        let st = state();
        let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(run_lines(st.clone(), server_in, server_out));

        let input = [
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"0"}}}"#,
            "",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "not json",
            r#"[{"jsonrpc":"2.0","id":3,"method":"ping"}]"#,
        ]
        .join("\n");
        client_in.write_all(input.as_bytes()).await?;
        client_in.write_all(b"\n").await?;
        drop(client_in);

        let mut lines = BufReader::new(client_out).lines();
        let init = next_json(&mut lines).await?;
        assert_eq!(init["result"]["protocolVersion"], "2024-11-05");

        let list = next_json(&mut lines).await?;
        assert_eq!(list["id"], 2);
        assert_eq!(list["result"]["tools"][0]["name"], "waitForNotification");

        let parse = next_json(&mut lines).await?;
        assert_eq!(parse["error"]["code"], -32700);

        let batch = next_json(&mut lines).await?;
        assert_eq!(batch["error"]["code"], -32600);

        server.await??;
        assert!(lines.next_line().await?.is_none());
        assert!(st.hub.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stdio_session_receives_broadcasts() -> anyhow::Result<()> {
        let st = state();
        let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(run_lines(st.clone(), server_in, server_out));
        let mut lines = BufReader::new(client_out).lines();

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await?;
        assert_eq!(next_json(&mut lines).await?["id"], 1);
        assert_eq!(st.hub.len(), 1);

        let note = JsonRpcNotification::new(
            "notifications/error",
            Some(serde_json::json!({ "message": "boom" })),
        );
        assert_eq!(st.hub.broadcast(&note.into()), 1);
        let pushed = next_json(&mut lines).await?;
        assert_eq!(pushed["method"], "notifications/error");
        assert_eq!(pushed["params"]["message"], "boom");

        drop(client_in);
        server.await??;
        Ok(())
    }
}

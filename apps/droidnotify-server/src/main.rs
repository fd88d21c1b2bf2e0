use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use droidnotify_mcp::{McpHandler, McpServerConfig};
use droidnotify_monitor::{CommandSource, DEFAULT_LIST_COMMAND, Monitor, MonitorConfig};
use tracing::{info, warn};

mod app;
mod auth;
mod http;
mod session;
mod stdio;
mod tools;

use crate::auth::{AuthConfig, BasicCredentials};

const INSTRUCTIONS: &str = "Reads the Android notification feed. Call getCurrentNotifications \
for a snapshot, or waitForNotification to receive notifications/newNotification messages as \
new notifications arrive; stopWaitingForNotification ends monitoring for every client.";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "droidnotify-server",
    version,
    about = "MCP server exposing an Android device's notification feed"
)]
struct Args {
    /// Listen on HTTP (streamable HTTP at --http-path plus legacy /sse).
    #[arg(long, env = "DROIDNOTIFY_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Shorthand for `--http-addr 0.0.0.0:<port>`.
    #[arg(long, env = "PORT", conflicts_with = "http_addr")]
    port: Option<u16>,

    /// HTTP path for the MCP streamable HTTP endpoint.
    #[arg(long, env = "DROIDNOTIFY_MCP_HTTP_PATH", default_value = "/mcp")]
    http_path: String,

    /// Disable the stdio transport (use HTTP only).
    #[arg(long, env = "DROIDNOTIFY_NO_STDIO", default_value_t = false)]
    no_stdio: bool,

    /// Browser origins allowed to call the HTTP transports. Without any, only
    /// loopback origins are accepted.
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Bearer token required on HTTP requests (header or `?token=`).
    #[arg(long, env = "MCP_AUTH_TOKEN")]
    auth_token: Option<String>,

    #[arg(long, env = "MCP_BASIC_USER")]
    basic_user: Option<String>,

    #[arg(long, env = "MCP_BASIC_PASSWORD")]
    basic_password: Option<String>,

    /// Command printing the active notifications as a JSON array. Run via `sh -c`.
    #[arg(long, env = "DROIDNOTIFY_LIST_COMMAND", default_value = DEFAULT_LIST_COMMAND)]
    list_command: String,

    /// Kill the listing command if it runs longer than this.
    #[arg(long, env = "DROIDNOTIFY_LIST_TIMEOUT_SECS", default_value_t = 10)]
    list_timeout_secs: u64,

    #[arg(long, env = "DROIDNOTIFY_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Drop HTTP sessions with no open stream after this long without a request.
    #[arg(long, env = "DROIDNOTIFY_SESSION_IDLE_SECS", default_value_t = 1800)]
    session_idle_secs: u64,
}

impl Args {
    fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
            .or_else(|| self.port.map(|p| SocketAddr::from(([0, 0, 0, 0], p))))
    }

    fn auth_config(&self) -> anyhow::Result<AuthConfig> {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());

        let basic = match (non_empty(&self.basic_user), non_empty(&self.basic_password)) {
            (Some(username), Some(password)) => Some(BasicCredentials { username, password }),
            (None, None) => None,
            _ => anyhow::bail!("--basic-user and --basic-password must be set together"),
        };

        Ok(AuthConfig {
            bearer_token: non_empty(&self.auth_token),
            basic,
        })
    }

    fn allowed_origins(&self) -> Vec<String> {
        self.allowed_origins
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.no_stdio && self.http_addr().is_none() {
            anyhow::bail!("nothing to serve: set --http-addr or --port, or drop --no-stdio");
        }
        if !self.http_path.starts_with('/') {
            anyhow::bail!("--http-path must start with '/': {}", self.http_path);
        }
        if [http::HEALTH_PATH, http::LEGACY_SSE_PATH, http::LEGACY_MESSAGES_PATH]
            .contains(&self.http_path.as_str())
        {
            anyhow::bail!("--http-path {} is reserved", self.http_path);
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("--poll-interval-ms must be positive");
        }
        if self.session_idle_secs == 0 {
            anyhow::bail!("--session-idle-secs must be positive");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    args.validate()?;
    let auth = args.auth_config()?;

    let source = Arc::new(CommandSource::new(
        args.list_command.clone(),
        Duration::from_secs(args.list_timeout_secs),
    ));
    let monitor = Monitor::new(
        source,
        MonitorConfig {
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            ..MonitorConfig::default()
        },
    );
    let hub = session::SessionHub::new();
    let handler: Arc<dyn McpHandler> =
        Arc::new(tools::NotificationTools::new(monitor.clone(), hub.clone()));
    let cfg = McpServerConfig::default_for_binary("droidnotify-server", env!("CARGO_PKG_VERSION"))
        .with_instructions(INSTRUCTIONS);

    let st = app::AppState::new(cfg, handler, hub, monitor.clone())
        .with_auth(auth)
        .with_allowed_origins(args.allowed_origins())
        .with_session_idle(Duration::from_secs(args.session_idle_secs));
    info!(command = %args.list_command, "notification source configured");

    let http_task = args.http_addr().map(|addr| {
        if st.auth.is_open() {
            warn!("no MCP_AUTH_TOKEN or basic credentials configured; HTTP transports are open");
        }
        let st = st.clone();
        let path = args.http_path.clone();
        tokio::spawn(async move { http::serve(addr, path, st).await })
    });

    if !args.no_stdio {
        stdio::run_stdio(st.clone()).await?;
    }

    if let Some(t) = http_task {
        t.await.context("http task join")??;
    }

    monitor.stop();
    Ok(())
}

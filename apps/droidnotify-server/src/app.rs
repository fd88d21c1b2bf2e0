use std::sync::Arc;
use std::time::Duration;

use droidnotify_mcp::{McpConnection, McpHandler, McpServerConfig};
use droidnotify_monitor::Monitor;

use crate::auth::AuthConfig;
use crate::session::SessionHub;

/// Messages buffered per push channel before broadcasts to that session drop.
pub const PUSH_CAPACITY: usize = 64;

/// Streamable HTTP sessions without a push stream are dropped after this long
/// without a request.
pub const SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

/// Everything a transport needs, cloned into every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: McpServerConfig,
    pub handler: Arc<dyn McpHandler>,
    pub hub: SessionHub,
    pub monitor: Arc<Monitor>,
    pub auth: Arc<AuthConfig>,
    /// Exact `Origin` values accepted; empty means loopback only.
    pub allowed_origins: Arc<Vec<String>>,
    pub push_capacity: usize,
    pub session_idle: Duration,
}

impl AppState {
    pub fn new(
        cfg: McpServerConfig,
        handler: Arc<dyn McpHandler>,
        hub: SessionHub,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            cfg,
            handler,
            hub,
            monitor,
            auth: Arc::new(AuthConfig::default()),
            allowed_origins: Arc::new(Vec::new()),
            push_capacity: PUSH_CAPACITY,
            session_idle: SESSION_IDLE,
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }

    pub fn with_session_idle(mut self, idle: Duration) -> Self {
        self.session_idle = idle;
        self
    }

    pub fn new_connection(&self) -> McpConnection {
        McpConnection::new(self.cfg.clone(), self.handler.clone())
    }
}

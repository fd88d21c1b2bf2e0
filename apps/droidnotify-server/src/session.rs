use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use droidnotify_mcp::{JsonRpcMessage, JsonRpcResponse, McpConnection};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type PushSender = mpsc::Sender<JsonRpcMessage>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("push channel full")]
    Full,
    #[error("push channel closed")]
    Closed,
    #[error("no push channel attached")]
    Detached,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One connected client: its MCP lifecycle plus, when the transport has one,
/// the channel used for server-initiated messages.
pub struct Session {
    id: String,
    conn: McpConnection,
    push: Mutex<Option<PushSender>>,
    last_seen: Mutex<Instant>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn handle(&self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        *lock(&self.last_seen) = Instant::now();
        self.conn.handle_message(msg).await
    }

    /// Idle sessions with an open push stream are still in use.
    fn is_idle(&self, max_idle: Duration) -> bool {
        !self.has_push() && lock(&self.last_seen).elapsed() >= max_idle
    }

    /// Attach a push channel, replacing any previous one.
    pub fn attach_push(&self, tx: PushSender) {
        *lock(&self.push) = Some(tx);
    }

    /// Detach `tx` if it is still the attached channel; a newer stream that
    /// replaced it stays attached.
    pub fn detach_push(&self, tx: &PushSender) {
        let mut slot = lock(&self.push);
        if slot.as_ref().is_some_and(|cur| cur.same_channel(tx)) {
            *slot = None;
        }
    }

    pub fn has_push(&self) -> bool {
        lock(&self.push).is_some()
    }

    /// Non-blocking delivery used for broadcasts. A closed channel is detached.
    pub fn try_push(&self, msg: JsonRpcMessage) -> Result<(), PushError> {
        let mut slot = lock(&self.push);
        let Some(tx) = slot.as_ref() else {
            return Err(PushError::Detached);
        };
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PushError::Full),
            Err(TrySendError::Closed(_)) => {
                *slot = None;
                Err(PushError::Closed)
            }
        }
    }

    /// Delivery that waits for channel capacity; used for responses that must
    /// reach the client (legacy SSE transport).
    pub async fn push(&self, msg: JsonRpcMessage) -> Result<(), PushError> {
        let tx = lock(&self.push).clone().ok_or(PushError::Detached)?;
        tx.send(msg).await.map_err(|_| PushError::Closed)
    }

    fn close(&self) {
        lock(&self.push).take();
    }
}

/// Registry of live sessions, shared by every transport.
///
/// Sessions only own transport-side state; the notification monitor is owned
/// by the process and is never touched when a session goes away.
#[derive(Clone, Default)]
pub struct SessionHub {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, conn: McpConnection) -> Arc<Session> {
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            conn,
            push: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        });
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, "session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = lock(&self.sessions).remove(id);
        match removed {
            Some(session) => {
                session.close();
                info!(session_id = %id, "session closed");
                true
            }
            None => false,
        }
    }

    /// Drop every session. Open push streams see their channel close and end.
    pub fn close_all(&self) {
        let drained = lock(&self.sessions).drain().collect::<Vec<_>>();
        for (_, session) in &drained {
            session.close();
        }
        info!(count = drained.len(), "all sessions closed");
    }

    /// Remove sessions that have neither a push stream nor a request within
    /// `max_idle`. Streamable HTTP clients may vanish without a DELETE.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let idle = lock(&self.sessions)
            .values()
            .filter(|s| s.is_idle(max_idle))
            .map(|s| s.id.clone())
            .collect::<Vec<_>>();
        let removed = idle.iter().filter(|id| self.remove(id)).count();
        if removed > 0 {
            info!(removed, "idle sessions swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `msg` to every session with a push channel. Failures are logged per
    /// session and never stop delivery to the others. Returns how many sessions
    /// accepted the message.
    pub fn broadcast(&self, msg: &JsonRpcMessage) -> usize {
        let targets = lock(&self.sessions).values().cloned().collect::<Vec<_>>();
        let mut delivered = 0;
        for session in targets {
            match session.try_push(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(PushError::Detached) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "push to session failed"),
            }
        }
        debug!(delivered, "broadcast complete");
        delivered
    }
}

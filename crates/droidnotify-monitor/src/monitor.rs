use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use droidnotify_core::NotificationRecord;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::source::{SnapshotSource, SourceError};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between the end of one poll and the start of the next.
    pub poll_interval: Duration,
    /// Events buffered per subscriber before a slow one starts losing them.
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    NewNotification(NotificationRecord),
    Error(String),
}

#[derive(Default)]
struct MonitorState {
    monitoring: bool,
    last_known: Vec<NotificationRecord>,
    poll_task: Option<JoinHandle<()>>,
    /// Bumped on every start and stop; a poll whose generation is stale drops
    /// its result instead of touching `last_known`.
    generation: u64,
}

/// Polls a [`SnapshotSource`] and broadcasts notifications whose key was not in
/// the previous successful snapshot.
///
/// One instance is shared by every session of a server process.
pub struct Monitor {
    source: Arc<dyn SnapshotSource>,
    cfg: MonitorConfig,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<MonitorEvent>,
}

impl Monitor {
    pub fn new(source: Arc<dyn SnapshotSource>, cfg: MonitorConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(cfg.event_capacity.max(1));
        Arc::new(Self {
            source,
            cfg,
            state: Mutex::new(MonitorState::default()),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock().monitoring
    }

    pub fn last_known(&self) -> Vec<NotificationRecord> {
        self.lock().last_known.clone()
    }

    /// Start polling. Returns `false` (and changes nothing) if already running.
    ///
    /// The first poll happens immediately on the spawned task; this call never
    /// waits for it.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut st = self.lock();
        if st.monitoring {
            return false;
        }
        st.monitoring = true;
        st.generation += 1;
        let generation = st.generation;
        st.poll_task = Some(tokio::spawn(poll_loop(Arc::downgrade(self), generation)));
        info!(
            interval_ms = self.cfg.poll_interval.as_millis() as u64,
            "notification monitoring started"
        );
        true
    }

    /// Stop polling. Returns `false` if it was not running, in which case the
    /// source cleanup hook is not called either.
    ///
    /// `last_known` is kept, so a later start does not report the current
    /// notifications again.
    pub fn stop(&self) -> bool {
        let task = {
            let mut st = self.lock();
            if !st.monitoring {
                return false;
            }
            st.monitoring = false;
            st.generation += 1;
            st.poll_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.source.cleanup();
        info!("notification monitoring stopped");
        true
    }

    /// One-shot snapshot, independent of the polling state.
    pub async fn current_notifications(&self) -> Result<Vec<NotificationRecord>, SourceError> {
        self.source.fetch().await
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = self.lock();
        st.monitoring && st.generation == generation
    }

    /// Fetch once, diff against `last_known` by key and emit the new records.
    ///
    /// A failed fetch emits an error event and leaves `last_known` as it was.
    async fn poll_once(&self) {
        let generation = self.lock().generation;
        let fetched = self.source.fetch().await;

        let events = {
            let mut st = self.lock();
            if st.generation != generation {
                debug!("discarding poll result from a stopped monitor");
                return;
            }
            match fetched {
                Ok(snapshot) => {
                    let known = st
                        .last_known
                        .iter()
                        .map(|r| r.key())
                        .collect::<HashSet<_>>();
                    let fresh = snapshot
                        .iter()
                        .filter(|r| !known.contains(r.key()))
                        .cloned()
                        .map(MonitorEvent::NewNotification)
                        .collect::<Vec<_>>();
                    st.last_known = snapshot;
                    fresh
                }
                Err(e) => {
                    warn!(category = e.category(), error = %e, "notification poll failed");
                    vec![MonitorEvent::Error(e.to_string())]
                }
            }
        };

        if !events.is_empty() {
            debug!(count = events.len(), "emitting monitor events");
        }
        for ev in events {
            // No receivers is fine: nobody is listening yet.
            let _ = self.events.send(ev);
        }
    }
}

async fn poll_loop(monitor: Weak<Monitor>, generation: u64) {
    loop {
        let Some(m) = monitor.upgrade() else {
            return;
        };
        if !m.is_current(generation) {
            return;
        }
        m.poll_once().await;
        let interval = m.cfg.poll_interval;
        drop(m);
        tokio::time::sleep(interval).await;
    }
}

//! Polling watcher for long-running operations.
//!
//! The status source has no push channel, so each tracked operation gets its
//! own poll loop. A notification is raised exactly when a poll returns a state
//! different from the previous successful poll.

pub mod http;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::SyncError;
use crate::models::operation::{OperationState, Transition};

pub use self::http::HttpStatusSource;

/// Capacity of the transition channel. Slow receivers skip transitions.
const TRANSITION_CAPACITY: usize = 256;

/// Read-only accessor for an operation's current state.
///
/// Polling sits behind this trait so a push-based source can replace it
/// without touching consumers.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn get_state(&self, operation_id: &str) -> Result<OperationState, SyncError>;
}

/// Host-level notifications, shown alongside the in-app ones when allowed.
#[async_trait]
pub trait SystemNotifier: Send + Sync {
    /// Ask the host for permission. Called at most once per watcher.
    async fn request_permission(&self) -> bool;
    fn show(&self, transition: &Transition);
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval used by `start_default`.
    pub default_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct Notifications {
    transitions: broadcast::Sender<Transition>,
    system: Option<Arc<dyn SystemNotifier>>,
    permission: Arc<OnceCell<bool>>,
}

impl Notifications {
    async fn raise(&self, transition: Transition) {
        tracing::info!(
            operation_id = %transition.operation_id,
            previous = %transition.previous,
            current = %transition.current,
            "operation state changed"
        );
        // send() returns Err if nobody is listening, which is fine.
        let _ = self.transitions.send(transition.clone());

        if let Some(system) = &self.system {
            let granted = *self
                .permission
                .get_or_init(|| system.request_permission())
                .await;
            if granted {
                system.show(&transition);
            }
        }
    }
}

struct Watch {
    task: JoinHandle<()>,
    stopped: Arc<AtomicBool>,
    last_seen: Arc<Mutex<Option<OperationState>>>,
}

impl Watch {
    fn cancel(self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

pub struct TransactionStatusWatcher {
    source: Arc<dyn StatusSource>,
    config: WatcherConfig,
    watches: DashMap<String, Watch>,
    notifications: Notifications,
}

impl TransactionStatusWatcher {
    pub fn new(source: Arc<dyn StatusSource>, config: WatcherConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            source,
            config,
            watches: DashMap::new(),
            notifications: Notifications {
                transitions,
                system: None,
                permission: Arc::new(OnceCell::new()),
            },
        }
    }

    /// Also raise host-level notifications through `notifier`.
    pub fn with_system_notifier(mut self, notifier: Arc<dyn SystemNotifier>) -> Self {
        self.notifications.system = Some(notifier);
        self
    }

    /// Begin polling `operation_id` every `interval`.
    ///
    /// The first successful poll records the baseline without notifying.
    /// Returns false if the operation is already being watched.
    pub fn start(&self, operation_id: &str, interval: Duration) -> bool {
        let entry = self.watches.entry(operation_id.to_string());
        let dashmap::mapref::entry::Entry::Vacant(vacant) = entry else {
            tracing::debug!(%operation_id, "already watching operation");
            return false;
        };

        let stopped = Arc::new(AtomicBool::new(false));
        let last_seen = Arc::new(Mutex::new(None));
        let task = tokio::spawn(poll_loop(
            self.source.clone(),
            self.notifications.clone(),
            operation_id.to_string(),
            interval,
            stopped.clone(),
            last_seen.clone(),
        ));
        vacant.insert(Watch {
            task,
            stopped,
            last_seen,
        });

        tracing::info!(
            %operation_id,
            interval_ms = interval.as_millis() as u64,
            "watching operation"
        );
        true
    }

    pub fn start_default(&self, operation_id: &str) -> bool {
        self.start(operation_id, self.config.default_interval)
    }

    /// Cancel polling for `operation_id`. No fetch starts and no transition is
    /// raised after this returns.
    pub fn stop(&self, operation_id: &str) -> bool {
        match self.watches.remove(operation_id) {
            Some((_, watch)) => {
                watch.cancel();
                tracing::info!(%operation_id, "stopped watching operation");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.watches.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn is_watching(&self, operation_id: &str) -> bool {
        self.watches.contains_key(operation_id)
    }

    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watches.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// State recorded by the most recent successful poll.
    pub fn last_seen(&self, operation_id: &str) -> Option<OperationState> {
        self.watches
            .get(operation_id)
            .and_then(|watch| *watch.last_seen.lock())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.notifications.transitions.subscribe()
    }
}

impl Drop for TransactionStatusWatcher {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn poll_loop(
    source: Arc<dyn StatusSource>,
    notifications: Notifications,
    operation_id: String,
    interval: Duration,
    stopped: Arc<AtomicBool>,
    last_seen: Arc<Mutex<Option<OperationState>>>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if stopped.load(Ordering::SeqCst) {
            return;
        }

        let fetched = source.get_state(&operation_id).await;
        // stop() may have run on another worker while the fetch was in flight.
        if stopped.load(Ordering::SeqCst) {
            return;
        }

        let current = match fetched {
            Ok(state) => state,
            Err(error) => {
                // Never a state change; try again next tick.
                if error.is_transient() {
                    tracing::debug!(%operation_id, %error, "status poll failed, skipping tick");
                } else {
                    tracing::warn!(%operation_id, %error, "status poll failed, skipping tick");
                }
                continue;
            }
        };

        let previous = last_seen.lock().replace(current);
        match previous {
            Some(previous) if previous != current => {
                notifications
                    .raise(Transition {
                        operation_id: operation_id.clone(),
                        previous,
                        current,
                    })
                    .await;
            }
            Some(_) => {}
            None => tracing::debug!(%operation_id, state = %current, "baseline state recorded"),
        }
    }
}

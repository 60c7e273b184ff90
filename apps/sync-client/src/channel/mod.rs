//! Single logical event channel to the real-time server.
//!
//! [`EventChannel`] owns the physical link: it connects, notices drops, and
//! reconnects with linear backoff. Other components get a [`ChannelHandle`],
//! which can subscribe and publish but never close the link.

pub mod backoff;
pub mod events;
pub mod transport;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::{HandlerError, SyncError};

use self::backoff::ReconnectPolicy;
use self::events::{
    ChannelEvent, DisconnectReason, EventKind, Identity, InboundEvent, LifecycleEvent,
    OutboundEvent,
};
use self::transport::{Link, Transport};

/// Callback invoked for every event of the kind it was registered under.
pub type Handler = Arc<dyn Fn(&ChannelEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&ChannelEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Returned by `on`; pass it to `off` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Gave up after `max_attempts`; only an explicit `connect` restarts.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ChannelConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.base_delay, self.max_attempts)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_delay: policy.base_delay,
            max_attempts: policy.max_attempts,
        }
    }
}

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

struct ChannelState {
    status: ConnectionStatus,
    identity: Option<Identity>,
    outbound: Option<mpsc::UnboundedSender<OutboundEvent>>,
    /// Failed attempts since the last successful connect.
    attempts: u32,
    /// Bumped by every explicit `connect`/`disconnect`; stale retries bail out.
    session_gen: u64,
    /// Bumped for every established link; stale readers bail out.
    link_id: u64,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state: Mutex<ChannelState>,
    registry: Mutex<HandlerRegistry>,
}

/// Owner of the physical connection. Exactly one per session.
pub struct EventChannel {
    inner: Arc<Inner>,
}

/// Borrowed view of an [`EventChannel`]: subscribe and publish only.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<Inner>,
}

impl EventChannel {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                policy: config.policy(),
                state: Mutex::new(ChannelState {
                    status: ConnectionStatus::Disconnected,
                    identity: None,
                    outbound: None,
                    attempts: 0,
                    session_gen: 0,
                    link_id: 0,
                    reader: None,
                    retry: None,
                }),
                registry: Mutex::new(HandlerRegistry::default()),
            }),
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            inner: self.inner.clone(),
        }
    }

    /// Open the connection carrying `identity` as handshake metadata.
    ///
    /// No-op while connected or connecting. A failed first attempt is retried
    /// with the same backoff as a dropped link.
    pub async fn connect(&self, identity: Identity) {
        let generation = {
            let mut state = self.inner.state.lock();
            if matches!(
                state.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                tracing::debug!(user_id = %identity.user_id, "connect ignored, channel already active");
                return;
            }
            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            state.attempts = 0;
            state.identity = Some(identity);
            state.status = ConnectionStatus::Connecting;
            state.session_gen += 1;
            state.session_gen
        };

        Inner::establish(self.inner.clone(), generation).await;
    }

    /// Close the connection and drop every subscription. Safe to call when
    /// already disconnected.
    pub fn disconnect(&self) {
        let was_active = {
            let mut state = self.inner.state.lock();
            state.session_gen += 1;
            state.link_id += 1;
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            let was_active = state.status != ConnectionStatus::Disconnected;
            state.outbound = None;
            state.identity = None;
            state.attempts = 0;
            state.status = ConnectionStatus::Disconnected;
            was_active
        };

        if was_active {
            tracing::info!("event channel disconnected");
            self.inner.dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Disconnected {
                reason: DisconnectReason::Explicit,
            }));
        }

        let mut registry = self.inner.registry.lock();
        registry.handlers.clear();
    }

    pub fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.inner.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.off(id)
    }

    pub fn publish(&self, event: OutboundEvent) -> Result<(), SyncError> {
        self.inner.publish(event)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Failed reconnect attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.lock().identity.clone()
    }
}

impl ChannelHandle {
    pub fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.inner.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.off(id)
    }

    pub fn publish(&self, event: OutboundEvent) -> Result<(), SyncError> {
        self.inner.publish(event)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// User id of the identity the channel was connected with.
    pub fn user_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .identity
            .as_ref()
            .map(|identity| identity.user_id.clone())
    }
}

impl Inner {
    fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        for handlers in registry.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(existing, _)| *existing == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    fn publish(&self, event: OutboundEvent) -> Result<(), SyncError> {
        let state = self.state.lock();
        match (&state.outbound, state.status) {
            (Some(outbound), ConnectionStatus::Connected) => {
                tracing::debug!(event = event.name(), "publishing event");
                outbound.send(event).map_err(|_| SyncError::NotConnected)
            }
            _ => Err(SyncError::NotConnected),
        }
    }

    /// Invoke every handler registered for the event's kind, in registration
    /// order. A failing or panicking handler does not stop the others.
    fn dispatch(&self, event: &ChannelEvent) {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .registry
            .lock()
            .handlers
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for (id, handler) in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(event = kind.as_str(), subscription = id.0, %error, "event handler failed");
                }
                Err(_) => {
                    tracing::warn!(event = kind.as_str(), subscription = id.0, "event handler panicked");
                }
            }
        }
    }

    /// One connection attempt within `generation`.
    fn establish(inner: Arc<Inner>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let identity = {
                let state = inner.state.lock();
                if state.session_gen != generation {
                    return;
                }
                match state.identity.clone() {
                    Some(identity) => identity,
                    None => return,
                }
            };

            match inner.transport.open(&identity).await {
                Ok(link) => inner.install(link, generation, &identity),
                Err(error) => {
                    if inner.state.lock().session_gen != generation {
                        return;
                    }
                    tracing::warn!(user_id = %identity.user_id, %error, "event channel connect attempt failed");
                    inner.dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Error {
                        message: error.to_string(),
                    }));
                    Inner::schedule_reconnect(&inner, generation);
                }
            }
        })
    }

    fn install(self: &Arc<Self>, link: Link, generation: u64, identity: &Identity) {
        let Link { outbound, inbound } = link;
        {
            let mut state = self.state.lock();
            if state.session_gen != generation {
                // Superseded by disconnect/connect while the handshake ran.
                return;
            }
            state.link_id += 1;
            state.status = ConnectionStatus::Connected;
            state.attempts = 0;
            state.outbound = Some(outbound);
            state.retry = None;
            state.reader = Some(tokio::spawn(Inner::read_loop(
                self.clone(),
                inbound,
                state.link_id,
            )));
        }

        tracing::info!(user_id = %identity.user_id, "event channel connected");
        self.dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Connected));
    }

    async fn read_loop(
        inner: Arc<Inner>,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
        link_id: u64,
    ) {
        while let Some(event) = inbound.recv().await {
            inner.dispatch(&ChannelEvent::Inbound(event));
        }
        inner.handle_lost(link_id);
    }

    fn handle_lost(self: &Arc<Self>, link_id: u64) {
        let generation = {
            let mut state = self.state.lock();
            if state.link_id != link_id || state.status != ConnectionStatus::Connected {
                return;
            }
            state.outbound = None;
            state.reader = None;
            state.status = ConnectionStatus::Reconnecting;
            state.session_gen
        };

        tracing::warn!("event channel lost its connection");
        self.dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Disconnected {
            reason: DisconnectReason::Lost,
        }));
        Inner::schedule_reconnect(self, generation);
    }

    fn schedule_reconnect(inner: &Arc<Inner>, generation: u64) {
        let mut state = inner.state.lock();
        if state.session_gen != generation {
            return;
        }

        state.attempts += 1;
        let attempt = state.attempts;
        match inner.policy.delay_for(attempt) {
            Some(delay) => {
                state.status = ConnectionStatus::Reconnecting;
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                let task_inner = inner.clone();
                state.retry = Some(tokio::spawn(async move {
                    time::sleep(delay).await;
                    Inner::establish(task_inner, generation).await;
                }));
            }
            None => {
                state.status = ConnectionStatus::Exhausted;
                state.retry = None;
                drop(state);
                let attempts = inner.policy.max_attempts;
                tracing::warn!(attempts, "reconnect attempts exhausted");
                inner.dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::MaxReconnectReached {
                    attempts,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::MemoryTransport;

    fn channel() -> (EventChannel, MemoryTransport) {
        let transport = MemoryTransport::new();
        let channel = EventChannel::new(Arc::new(transport.clone()), ChannelConfig::default());
        (channel, transport)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Handler {
        let log = log.clone();
        let tag = tag.to_string();
        handler(move |event| {
            log.lock().push(format!("{tag}:{}", event.kind().as_str()));
            Ok(())
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let (channel, _) = channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.on(EventKind::Connected, recorder(&log, "first"));
        channel.on(EventKind::Connected, recorder(&log, "second"));
        channel.on(EventKind::Disconnected, recorder(&log, "other"));

        channel
            .inner
            .dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Connected));

        assert_eq!(*log.lock(), vec!["first:connected", "second:connected"]);
    }

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let (channel, _) = channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.on(EventKind::Connected, handler(|_| Err("boom".into())));
        channel.on(EventKind::Connected, handler(|_| panic!("handler bug")));
        channel.on(EventKind::Connected, recorder(&log, "survivor"));

        channel
            .inner
            .dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Connected));

        assert_eq!(*log.lock(), vec!["survivor:connected"]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let (channel, _) = channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = channel.on(EventKind::Connected, recorder(&log, "first"));
        channel.on(EventKind::Connected, recorder(&log, "second"));

        assert!(channel.off(first));
        assert!(!channel.off(first));

        channel
            .inner
            .dispatch(&ChannelEvent::Lifecycle(LifecycleEvent::Connected));
        assert_eq!(*log.lock(), vec!["second:connected"]);
    }

    #[test]
    fn publish_requires_connection() {
        let (channel, _) = channel();
        let err = channel
            .publish(OutboundEvent::LeaveRoom(events::RoomPayload {
                room_id: "room_a".into(),
            }))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[test]
    fn disconnect_when_idle_is_silent() {
        let (channel, _) = channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.on(EventKind::Disconnected, recorder(&log, "h"));

        channel.disconnect();
        channel.disconnect();

        assert!(log.lock().is_empty());
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
    }
}

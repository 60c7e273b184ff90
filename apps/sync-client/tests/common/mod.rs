#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use sync_client::channel::events::{Identity, InboundEvent, NewMessagePayload, OutboundEvent};
use sync_client::channel::transport::MemoryTransport;
use sync_client::channel::{ChannelConfig, EventChannel};
use sync_client::models::message::MessageBody;
use sync_client::models::operation::{OperationState, Transition};
use sync_client::models::room::{Participant, PresenceState, Room};
use sync_client::session::{ContractHandle, SessionBackend, StaticBackend};
use sync_client::watcher::{StatusSource, SystemNotifier};
use sync_client::SyncError;

pub const ME: &str = "usr_ana";
pub const PEER: &str = "usr_kenji";

pub fn identity(user_id: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        display_name: user_id.trim_start_matches("usr_").to_string(),
        token: format!("tok_{user_id}"),
    }
}

pub fn room(id: &str) -> Room {
    Room {
        id: id.to_string(),
        display_name: format!("Room {id}"),
        language: "ja".to_string(),
        is_private: false,
    }
}

pub fn participant(user_id: &str) -> Participant {
    Participant {
        user_id: user_id.to_string(),
        display_name: user_id.trim_start_matches("usr_").to_string(),
        presence_state: PresenceState::Online,
    }
}

/// A `new_message` event as the server would send it.
pub fn echo(
    room_id: &str,
    local_id: Option<&str>,
    server_id: &str,
    sender_id: &str,
    text: &str,
) -> InboundEvent {
    InboundEvent::NewMessage(NewMessagePayload {
        room_id: room_id.to_string(),
        local_id: local_id.map(str::to_string),
        server_id: server_id.to_string(),
        sender_id: sender_id.to_string(),
        body: MessageBody::Text(text.to_string()),
        timestamp: Utc::now(),
    })
}

/// A channel over an in-process transport, already connected as [`ME`].
pub async fn connected_channel(config: ChannelConfig) -> (EventChannel, MemoryTransport) {
    let transport = MemoryTransport::new();
    let channel = EventChannel::new(Arc::new(transport.clone()), config);
    channel.connect(identity(ME)).await;
    (channel, transport)
}

/// Let spawned tasks (channel reader, handlers) run without advancing time.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds or `timeout` passes (real-time tests).
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn names(events: &[OutboundEvent]) -> Vec<&'static str> {
    events.iter().map(|event| event.name()).collect()
}

// ---------------------------------------------------------------------------
// Status source
// ---------------------------------------------------------------------------

/// Status source whose answer the test controls.
pub struct ScriptedSource {
    state: Mutex<OperationState>,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(state: OperationState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            failing: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: OperationState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn get_state(&self, operation_id: &str) -> Result<OperationState, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::poll_fetch(operation_id, "rpc unavailable"));
        }
        Ok(*self.state.lock().unwrap())
    }
}

// ---------------------------------------------------------------------------
// System notifier
// ---------------------------------------------------------------------------

pub struct RecordingNotifier {
    grant: bool,
    pub permission_requests: AtomicUsize,
    pub shown: Mutex<Vec<Transition>>,
}

impl RecordingNotifier {
    pub fn new(grant: bool) -> Arc<Self> {
        Arc::new(Self {
            grant,
            permission_requests: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SystemNotifier for RecordingNotifier {
    async fn request_permission(&self) -> bool {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        self.grant
    }

    fn show(&self, transition: &Transition) {
        self.shown.lock().unwrap().push(transition.clone());
    }
}

// ---------------------------------------------------------------------------
// Session backend
// ---------------------------------------------------------------------------

/// Static contract table that counts bind calls and can be told to fail.
pub struct CountingBackend {
    inner: StaticBackend,
    pub binds: AtomicUsize,
    pub fail_binding: AtomicBool,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StaticBackend::new(
                vec![
                    ("translation".to_string(), "0x7a1e".to_string()),
                    ("token".to_string(), "0x70ce".to_string()),
                ],
                None,
                "tok".to_string(),
            ),
            binds: AtomicUsize::new(0),
            fail_binding: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionBackend for CountingBackend {
    async fn bind_contracts(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<HashMap<String, ContractHandle>, SyncError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if self.fail_binding.load(Ordering::SeqCst) {
            return Err(SyncError::binding("unsupported network"));
        }
        self.inner.bind_contracts(account_id, network_id).await
    }

    fn identity(&self, account_id: &str) -> Identity {
        self.inner.identity(account_id)
    }
}

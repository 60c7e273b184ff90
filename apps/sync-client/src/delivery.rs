//! Optimistic message delivery and echo reconciliation.
//!
//! A send appends a `sending` record to the local log right away and
//! publishes it. The server's echo carries the same `local_id` and updates
//! that record in place, so a message is never listed twice and the log is
//! never reordered.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tandem_common::id::PrefixedId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::channel::events::{
    ChannelEvent, EventKind, InboundEvent, MessageStatusPayload, NewMessagePayload,
    OutboundEvent, SendMessagePayload,
};
use crate::channel::{handler, ChannelHandle, SubscriptionId};
use crate::error::SyncError;
use crate::models::message::{DeliveryState, Message, MessageBody, VoiceClip};
use crate::presence::PresenceRoom;

/// Capacity of the log observer channel. Slow observers skip updates.
const LOG_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// A message still pending after this long is marked `failed`.
    pub delivery_timeout: Duration,
    /// How often pending messages are checked against the timeout.
    pub sweep_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Change notification for observers of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Appended {
        index: usize,
        local_id: String,
    },
    Updated {
        index: usize,
        local_id: String,
        state: DeliveryState,
    },
    Cleared,
}

#[derive(Default)]
struct MessageLog {
    messages: Vec<Message>,
    by_local: HashMap<String, usize>,
    by_server: HashMap<String, usize>,
    /// When each still-pending local message was queued.
    queued_at: HashMap<String, Instant>,
}

impl MessageLog {
    fn append(&mut self, message: Message) -> usize {
        let index = self.messages.len();
        self.by_local.insert(message.local_id.clone(), index);
        if let Some(server_id) = &message.server_id {
            self.by_server.insert(server_id.clone(), index);
        }
        self.messages.push(message);
        index
    }

    /// Move the message at `index` to `next` if the transition is legal.
    fn advance(&mut self, index: usize, next: DeliveryState) -> bool {
        let message = &mut self.messages[index];
        if !message.delivery_state.can_advance_to(next) {
            return false;
        }
        message.delivery_state = next;
        if !next.is_pending() {
            self.queued_at.remove(&message.local_id);
        }
        true
    }
}

#[derive(Default)]
struct Lifecycle {
    subscriptions: Vec<SubscriptionId>,
    sweeper: Option<JoinHandle<()>>,
}

struct DeliveryInner {
    channel: ChannelHandle,
    presence: PresenceRoom,
    config: DeliveryConfig,
    log: Mutex<MessageLog>,
    events: broadcast::Sender<LogEvent>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    inner: Arc<DeliveryInner>,
}

impl DeliveryPipeline {
    pub fn new(channel: ChannelHandle, presence: PresenceRoom, config: DeliveryConfig) -> Self {
        let (events, _) = broadcast::channel(LOG_EVENT_CAPACITY);
        Self {
            inner: Arc::new(DeliveryInner {
                channel,
                presence,
                config,
                log: Mutex::new(MessageLog::default()),
                events,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Subscribe to echoes and receipts and start the timeout sweeper. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.subscriptions.is_empty() {
            return;
        }

        for kind in [EventKind::NewMessage, EventKind::MessageStatus] {
            let weak = Arc::downgrade(&self.inner);
            let id = self.inner.channel.on(
                kind,
                handler(move |event| {
                    if let (Some(inner), ChannelEvent::Inbound(inbound)) = (weak.upgrade(), event) {
                        inner.handle(inbound);
                    }
                    Ok(())
                }),
            );
            lifecycle.subscriptions.push(id);
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        lifecycle.sweeper = Some(tokio::spawn(sweep_loop(weak, interval)));
    }

    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        for id in lifecycle.subscriptions.drain(..) {
            self.inner.channel.off(id);
        }
        if let Some(sweeper) = lifecycle.sweeper.take() {
            sweeper.abort();
        }
    }

    /// Send a text message to the current room. Returns its `local_id`.
    ///
    /// The record is in the log before this returns. If the channel is down
    /// the record is marked `failed` immediately.
    pub fn send_text(&self, content: impl Into<String>) -> Result<String, SyncError> {
        self.inner.send(MessageBody::Text(content.into()))
    }

    /// Send a reference to an uploaded voice clip. Same contract as `send_text`.
    pub fn send_voice(&self, clip: VoiceClip) -> Result<String, SyncError> {
        self.inner.send(MessageBody::Voice(clip))
    }

    /// Re-send a failed message as a new record at the end of the log.
    pub fn retry(&self, local_id: &str) -> Result<String, SyncError> {
        let (room_id, body) = {
            let log = self.inner.log.lock();
            let index = *log.by_local.get(local_id).ok_or_else(|| SyncError::DeliveryFailure {
                local_id: local_id.to_string(),
                reason: "unknown message".to_string(),
            })?;
            let message = &log.messages[index];
            if message.delivery_state != DeliveryState::Failed {
                return Err(SyncError::DeliveryFailure {
                    local_id: local_id.to_string(),
                    reason: "only failed messages can be retried".to_string(),
                });
            }
            (message.room_id.clone(), message.body.clone())
        };

        if self.inner.presence.current_room_id().as_deref() != Some(room_id.as_str()) {
            return Err(SyncError::NoActiveRoom);
        }
        self.inner.send(body)
    }

    /// Mark every message pending longer than the delivery timeout as failed.
    /// Returns the affected `local_id`s.
    pub fn expire_pending(&self) -> Vec<String> {
        self.inner.expire_pending()
    }

    /// Mark every pending message as failed, e.g. when the session that sent
    /// them is invalidated.
    pub fn fail_pending(&self, reason: &str) -> Vec<String> {
        let pending: Vec<String> = {
            let log = self.inner.log.lock();
            log.queued_at.keys().cloned().collect()
        };
        pending
            .into_iter()
            .filter(|local_id| self.inner.fail(local_id, reason))
            .collect()
    }

    /// Empty the log.
    pub fn reset(&self) {
        *self.inner.log.lock() = MessageLog::default();
        let _ = self.inner.events.send(LogEvent::Cleared);
    }

    /// The log in processing order.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.log.lock().messages.clone()
    }

    pub fn message(&self, local_id: &str) -> Option<Message> {
        let log = self.inner.log.lock();
        log.by_local
            .get(local_id)
            .map(|&index| log.messages[index].clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.events.subscribe()
    }
}

impl DeliveryInner {
    fn send(&self, body: MessageBody) -> Result<String, SyncError> {
        let room_id = self
            .presence
            .current_room_id()
            .ok_or(SyncError::NoActiveRoom)?;
        let sender_id = self.channel.user_id().ok_or(SyncError::NotConnected)?;
        let local_id = Message::generate();

        let index = {
            let mut log = self.log.lock();
            let index = log.append(Message {
                local_id: local_id.clone(),
                server_id: None,
                room_id: room_id.clone(),
                sender_id,
                body: body.clone(),
                created_at: Utc::now(),
                delivery_state: DeliveryState::Sending,
            });
            log.queued_at.insert(local_id.clone(), Instant::now());
            index
        };
        let _ = self.events.send(LogEvent::Appended {
            index,
            local_id: local_id.clone(),
        });

        let published = self.channel.publish(OutboundEvent::SendMessage(SendMessagePayload {
            room_id: room_id.clone(),
            local_id: local_id.clone(),
            body,
        }));
        match published {
            Ok(()) => tracing::debug!(%room_id, %local_id, "message queued"),
            Err(error) => {
                self.fail(&local_id, &error.to_string());
            }
        }
        Ok(local_id)
    }

    /// Mark `local_id` failed if it is still pending.
    fn fail(&self, local_id: &str, reason: &str) -> bool {
        let index = {
            let mut log = self.log.lock();
            let Some(&index) = log.by_local.get(local_id) else {
                return false;
            };
            if !log.advance(index, DeliveryState::Failed) {
                return false;
            }
            index
        };

        let error = SyncError::DeliveryFailure {
            local_id: local_id.to_string(),
            reason: reason.to_string(),
        };
        tracing::warn!(%error, "message delivery failed");
        let _ = self.events.send(LogEvent::Updated {
            index,
            local_id: local_id.to_string(),
            state: DeliveryState::Failed,
        });
        true
    }

    fn expire_pending(&self) -> Vec<String> {
        let now = Instant::now();
        let timeout = self.config.delivery_timeout;
        let expired: Vec<String> = {
            let log = self.log.lock();
            log.queued_at
                .iter()
                .filter(|(_, queued)| now.duration_since(**queued) >= timeout)
                .map(|(local_id, _)| local_id.clone())
                .collect()
        };
        expired
            .into_iter()
            .filter(|local_id| self.fail(local_id, "no echo before delivery timeout"))
            .collect()
    }

    fn handle(&self, event: &InboundEvent) {
        match event {
            InboundEvent::NewMessage(payload) => self.reconcile(payload),
            InboundEvent::MessageStatus(payload) => self.apply_status(payload),
            _ => {}
        }
    }

    /// Merge a server echo into the log.
    fn reconcile(&self, payload: &NewMessagePayload) {
        if self.presence.current_room_id().as_deref() != Some(payload.room_id.as_str()) {
            tracing::debug!(
                room_id = %payload.room_id,
                server_id = %payload.server_id,
                "dropping message for a room that is not current"
            );
            return;
        }

        let mut log = self.log.lock();
        if log.by_server.contains_key(&payload.server_id) {
            tracing::debug!(server_id = %payload.server_id, "duplicate echo ignored");
            return;
        }

        let matched = payload
            .local_id
            .as_ref()
            .and_then(|local_id| log.by_local.get(local_id).copied());

        let update = match matched {
            Some(index) => {
                let message = &log.messages[index];
                if message.room_id != payload.room_id || message.sender_id != payload.sender_id {
                    tracing::warn!(
                        local_id = %message.local_id,
                        server_id = %payload.server_id,
                        "echo does not match the local record, dropped"
                    );
                    return;
                }
                if let Some(existing) = &message.server_id {
                    tracing::debug!(
                        local_id = %message.local_id,
                        %existing,
                        server_id = %payload.server_id,
                        "echo for an already reconciled message ignored"
                    );
                    return;
                }
                let local_id = message.local_id.clone();
                log.messages[index].server_id = Some(payload.server_id.clone());
                log.by_server.insert(payload.server_id.clone(), index);
                if log.advance(index, DeliveryState::Delivered) {
                    LogEvent::Updated {
                        index,
                        local_id,
                        state: DeliveryState::Delivered,
                    }
                } else {
                    tracing::debug!(%local_id, "echo arrived after the message was marked failed");
                    return;
                }
            }
            None => {
                let local_id = payload
                    .local_id
                    .clone()
                    .unwrap_or_else(Message::generate);
                let index = log.append(Message {
                    local_id: local_id.clone(),
                    server_id: Some(payload.server_id.clone()),
                    room_id: payload.room_id.clone(),
                    sender_id: payload.sender_id.clone(),
                    body: payload.body.clone(),
                    created_at: payload.timestamp,
                    delivery_state: DeliveryState::Delivered,
                });
                LogEvent::Appended { index, local_id }
            }
        };
        drop(log);
        let _ = self.events.send(update);
    }

    fn apply_status(&self, payload: &MessageStatusPayload) {
        if payload.state == DeliveryState::Failed {
            tracing::debug!(server_id = %payload.server_id, "ignoring failed receipt from server");
            return;
        }

        let update = {
            let mut log = self.log.lock();
            let Some(&index) = log.by_server.get(&payload.server_id) else {
                tracing::debug!(server_id = %payload.server_id, "receipt for unknown message");
                return;
            };
            if !log.advance(index, payload.state) {
                return;
            }
            LogEvent::Updated {
                index,
                local_id: log.messages[index].local_id.clone(),
                state: payload.state,
            }
        };
        let _ = self.events.send(update);
    }
}

async fn sweep_loop(inner: Weak<DeliveryInner>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.tick().await; // First tick fires immediately; skip it.
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.expire_pending();
    }
}

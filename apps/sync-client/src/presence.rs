//! Current-room binding with participant roster and typing marks.
//!
//! The roster is a cache of server state: it is rebuilt from `roster_snapshot`
//! after every join and dropped on room switch or disconnect.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::channel::events::{
    ChannelEvent, EventKind, InboundEvent, JoinRoomPayload, LifecycleEvent, OutboundEvent,
    PresencePayload, RoomPayload, TypingPayload,
};
use crate::channel::{handler, ChannelHandle, SubscriptionId};
use crate::error::SyncError;
use crate::models::room::{Participant, PresenceState, Room};

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// A typing mark expires after this long without a refresh.
    pub typing_ttl: Duration,
    /// How often expired marks are swept.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(3),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

/// A participant currently typing in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingMark {
    pub user_id: String,
    pub room_id: String,
    pub expires_at: Instant,
}

#[derive(Default)]
struct Binding {
    current: Option<Room>,
    roster: BTreeMap<String, Participant>,
    typing: HashMap<String, TypingMark>,
    /// Set while this client has announced `start_typing`.
    local_typing_until: Option<Instant>,
}

impl Binding {
    fn is_current(&self, room_id: &str) -> bool {
        self.current.as_ref().is_some_and(|room| room.id == room_id)
    }

    fn clear_cache(&mut self) {
        self.roster.clear();
        self.typing.clear();
    }
}

#[derive(Default)]
struct Lifecycle {
    subscriptions: Vec<SubscriptionId>,
    sweeper: Option<JoinHandle<()>>,
}

struct PresenceInner {
    channel: ChannelHandle,
    config: PresenceConfig,
    binding: Mutex<Binding>,
    lifecycle: Mutex<Lifecycle>,
}

/// The single "current room" of a channel.
#[derive(Clone)]
pub struct PresenceRoom {
    inner: Arc<PresenceInner>,
}

impl PresenceRoom {
    pub fn new(channel: ChannelHandle, config: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                channel,
                config,
                binding: Mutex::new(Binding::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Subscribe to room events and start the typing sweeper. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.subscriptions.is_empty() {
            return;
        }

        let kinds = [
            EventKind::UserJoined,
            EventKind::UserLeft,
            EventKind::RosterSnapshot,
            EventKind::StartTyping,
            EventKind::StopTyping,
            EventKind::PresenceUpdate,
            EventKind::Connected,
            EventKind::Disconnected,
        ];
        for kind in kinds {
            let weak = Arc::downgrade(&self.inner);
            let id = self.inner.channel.on(
                kind,
                handler(move |event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle(event);
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

    /// Unsubscribe and stop the sweeper. Announces `stop_typing` if needed.
    pub fn stop(&self) {
        self.stop_typing();
        let mut lifecycle = self.inner.lifecycle.lock();
        for id in lifecycle.subscriptions.drain(..) {
            self.inner.channel.off(id);
        }
        if let Some(sweeper) = lifecycle.sweeper.take() {
            sweeper.abort();
        }
    }

    /// Bind to `room`, implicitly leaving the current room first.
    ///
    /// Joining the room that is already bound does nothing. While the channel
    /// is down the binding still changes; the join is sent on reconnect.
    pub fn join(&self, room: Room) {
        let previous = {
            let binding = self.inner.binding.lock();
            if binding.is_current(&room.id) {
                tracing::debug!(room_id = %room.id, "already in room, join ignored");
                return;
            }
            binding.current.as_ref().map(|r| r.id.clone())
        };

        if let Some(previous) = previous {
            self.leave(&previous);
        }

        let room_id = room.id.clone();
        let metadata = room.metadata();
        {
            let mut binding = self.inner.binding.lock();
            binding.current = Some(room);
            binding.clear_cache();
            binding.local_typing_until = None;
        }

        let joined = self.inner.send(OutboundEvent::JoinRoom(JoinRoomPayload {
            room_id: room_id.clone(),
            metadata,
        }));
        if joined {
            self.inner
                .send(OutboundEvent::RequestRoster(RoomPayload { room_id: room_id.clone() }));
            tracing::info!(%room_id, "joined room");
        } else {
            tracing::debug!(%room_id, "channel down, join deferred until reconnect");
        }
    }

    /// Leave `room_id` if it is the bound room. A leave for any other room is
    /// stale (superseded by a later join) and ignored.
    pub fn leave(&self, room_id: &str) {
        let announce_stop = {
            let mut binding = self.inner.binding.lock();
            if !binding.is_current(room_id) {
                tracing::debug!(%room_id, "stale leave ignored");
                return;
            }
            binding.current = None;
            binding.clear_cache();
            binding.local_typing_until.take().is_some()
        };

        if announce_stop {
            self.inner.send_typing(room_id, false);
        }
        self.inner.send(OutboundEvent::LeaveRoom(RoomPayload {
            room_id: room_id.to_string(),
        }));
        tracing::info!(%room_id, "left room");
    }

    /// Drop the binding and caches without telling the server.
    pub fn reset(&self) {
        let mut binding = self.inner.binding.lock();
        *binding = Binding::default();
    }

    /// Announce that the local user is typing. Repeated calls extend the mark;
    /// `stop_typing` is sent automatically after `typing_ttl` of silence.
    pub fn notify_typing(&self) -> Result<(), SyncError> {
        let (room_id, first) = {
            let mut binding = self.inner.binding.lock();
            let room_id = binding
                .current
                .as_ref()
                .map(|room| room.id.clone())
                .ok_or(SyncError::NoActiveRoom)?;
            let first = binding.local_typing_until.is_none();
            binding.local_typing_until = Some(Instant::now() + self.inner.config.typing_ttl);
            (room_id, first)
        };

        if first {
            self.inner.send_typing(&room_id, true);
        }
        Ok(())
    }

    /// Announce that the local user stopped typing, if it was.
    pub fn stop_typing(&self) {
        let room_id = {
            let mut binding = self.inner.binding.lock();
            if binding.local_typing_until.take().is_none() {
                return;
            }
            binding.current.as_ref().map(|room| room.id.clone())
        };
        if let Some(room_id) = room_id {
            self.inner.send_typing(&room_id, false);
        }
    }

    /// Publish the local user's presence to the current room.
    pub fn set_presence(&self, state: PresenceState) -> Result<(), SyncError> {
        let room_id = self.current_room_id().ok_or(SyncError::NoActiveRoom)?;
        let user_id = self.inner.channel.user_id().ok_or(SyncError::NotConnected)?;
        self.inner
            .channel
            .publish(OutboundEvent::PresenceUpdate(PresencePayload {
                room_id,
                user_id,
                state,
            }))
    }

    pub fn current_room(&self) -> Option<Room> {
        self.inner.binding.lock().current.clone()
    }

    pub fn current_room_id(&self) -> Option<String> {
        self.inner
            .binding
            .lock()
            .current
            .as_ref()
            .map(|room| room.id.clone())
    }

    /// Participants of the current room, ordered by user id.
    pub fn roster(&self) -> Vec<Participant> {
        self.inner.binding.lock().roster.values().cloned().collect()
    }

    pub fn participant(&self, user_id: &str) -> Option<Participant> {
        self.inner.binding.lock().roster.get(user_id).cloned()
    }

    /// Participants that have not expired, ordered by user id.
    pub fn typing_users(&self) -> Vec<String> {
        let now = Instant::now();
        let binding = self.inner.binding.lock();
        let mut users: Vec<String> = binding
            .typing
            .values()
            .filter(|mark| mark.expires_at > now)
            .map(|mark| mark.user_id.clone())
            .collect();
        users.sort();
        users
    }

    pub fn is_typing_locally(&self) -> bool {
        self.inner.binding.lock().local_typing_until.is_some()
    }
}

impl PresenceInner {
    /// Publish, treating a down channel as "will be resent on reconnect".
    fn send(&self, event: OutboundEvent) -> bool {
        match self.channel.publish(event) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(%error, "presence event not sent");
                false
            }
        }
    }

    fn send_typing(&self, room_id: &str, typing: bool) {
        let Some(user_id) = self.channel.user_id() else {
            return;
        };
        let payload = TypingPayload {
            room_id: room_id.to_string(),
            user_id,
        };
        let event = if typing {
            OutboundEvent::StartTyping(payload)
        } else {
            OutboundEvent::StopTyping(payload)
        };
        self.send(event);
    }

    fn handle(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Inbound(inbound) => self.handle_inbound(inbound),
            ChannelEvent::Lifecycle(LifecycleEvent::Connected) => self.rejoin(),
            ChannelEvent::Lifecycle(LifecycleEvent::Disconnected { .. }) => {
                let mut binding = self.binding.lock();
                binding.clear_cache();
                binding.local_typing_until = None;
            }
            ChannelEvent::Lifecycle(_) => {}
        }
    }

    fn handle_inbound(&self, event: &InboundEvent) {
        let mut binding = self.binding.lock();
        if !binding.is_current(event.room_id()) {
            tracing::debug!(
                room_id = %event.room_id(),
                event = event.kind().as_str(),
                "dropping event for a room that is not current"
            );
            return;
        }

        match event {
            InboundEvent::UserJoined(p) => {
                binding.roster.insert(p.user.user_id.clone(), p.user.clone());
            }
            InboundEvent::UserLeft(p) => {
                binding.roster.remove(&p.user.user_id);
                binding.typing.remove(&p.user.user_id);
            }
            InboundEvent::RosterSnapshot(p) => {
                binding.roster = p
                    .users
                    .iter()
                    .map(|user| (user.user_id.clone(), user.clone()))
                    .collect();
            }
            InboundEvent::StartTyping(p) => {
                if self.channel.user_id().as_deref() == Some(p.user_id.as_str()) {
                    return;
                }
                binding.typing.insert(
                    p.user_id.clone(),
                    TypingMark {
                        user_id: p.user_id.clone(),
                        room_id: p.room_id.clone(),
                        expires_at: Instant::now() + self.config.typing_ttl,
                    },
                );
            }
            InboundEvent::StopTyping(p) => {
                binding.typing.remove(&p.user_id);
            }
            InboundEvent::PresenceUpdate(p) => {
                if let Some(participant) = binding.roster.get_mut(&p.user_id) {
                    participant.presence_state = p.state;
                }
            }
            InboundEvent::NewMessage(_) | InboundEvent::MessageStatus(_) => {}
        }
    }

    /// Re-announce the bound room after the channel comes back.
    fn rejoin(&self) {
        let room = self.binding.lock().current.clone();
        let Some(room) = room else {
            return;
        };
        let sent = self.send(OutboundEvent::JoinRoom(JoinRoomPayload {
            room_id: room.id.clone(),
            metadata: room.metadata(),
        }));
        if sent {
            self.send(OutboundEvent::RequestRoster(RoomPayload {
                room_id: room.id.clone(),
            }));
            tracing::info!(room_id = %room.id, "rejoined room after reconnect");
        }
    }

    /// Expire stale remote marks and end the local typing announcement.
    fn sweep(&self) {
        let now = Instant::now();
        let local_expired = {
            let mut binding = self.binding.lock();
            binding.typing.retain(|_, mark| mark.expires_at > now);
            match binding.local_typing_until {
                Some(until) if until <= now => {
                    binding.local_typing_until = None;
                    binding.current.as_ref().map(|room| room.id.clone())
                }
                _ => None,
            }
        };
        if let Some(room_id) = local_expired {
            self.send_typing(&room_id, false);
        }
    }
}

async fn sweep_loop(inner: Weak<PresenceInner>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.tick().await; // First tick fires immediately; skip it.
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.sweep();
    }
}

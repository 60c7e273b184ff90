mod common;

use std::time::Duration;

use sync_client::channel::events::{
    InboundEvent, MemberPayload, OutboundEvent, PresencePayload, RosterPayload, TypingPayload,
};
use sync_client::channel::transport::MemoryTransport;
use sync_client::channel::{ChannelConfig, EventChannel};
use sync_client::models::room::PresenceState;
use sync_client::presence::{PresenceConfig, PresenceRoom};
use sync_client::{ConnectionStatus, SyncError};

use common::{connected_channel, names, participant, room, settle, ME, PEER};

async fn presence() -> (EventChannel, MemoryTransport, PresenceRoom) {
    let (channel, transport) = connected_channel(ChannelConfig::default()).await;
    let presence = PresenceRoom::new(channel.handle(), PresenceConfig::default());
    presence.start();
    (channel, transport, presence)
}

fn roster_snapshot(room_id: &str, users: &[&str]) -> InboundEvent {
    InboundEvent::RosterSnapshot(RosterPayload {
        room_id: room_id.to_string(),
        users: users.iter().map(|user| participant(user)).collect(),
    })
}

fn typing(room_id: &str, user_id: &str, start: bool) -> InboundEvent {
    let payload = TypingPayload {
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
    };
    if start {
        InboundEvent::StartTyping(payload)
    } else {
        InboundEvent::StopTyping(payload)
    }
}

fn roster_ids(presence: &PresenceRoom) -> Vec<String> {
    presence.roster().into_iter().map(|p| p.user_id).collect()
}

#[tokio::test(start_paused = true)]
async fn join_announces_room_and_requests_roster() {
    let (_channel, transport, presence) = presence().await;

    presence.join(room("room_a"));

    let sent = transport.take_sent();
    assert_eq!(names(&sent), vec!["join_room", "request_roster"]);
    match &sent[0] {
        OutboundEvent::JoinRoom(p) => {
            assert_eq!(p.room_id, "room_a");
            assert_eq!(p.metadata["language"], "ja");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(presence.current_room_id().as_deref(), Some("room_a"));
}

#[tokio::test(start_paused = true)]
async fn switching_rooms_leaves_exactly_once_before_joining() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    transport.take_sent();

    presence.join(room("room_b"));

    let sent = transport.take_sent();
    assert_eq!(names(&sent), vec!["leave_room", "join_room", "request_roster"]);
    assert!(matches!(&sent[0], OutboundEvent::LeaveRoom(p) if p.room_id == "room_a"));
    assert!(matches!(&sent[1], OutboundEvent::JoinRoom(p) if p.room_id == "room_b"));
    assert_eq!(presence.current_room_id().as_deref(), Some("room_b"));
}

#[tokio::test(start_paused = true)]
async fn joining_the_current_room_sends_nothing() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    transport.take_sent();

    presence.join(room("room_a"));

    assert!(transport.take_sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_leave_is_ignored() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    presence.join(room("room_b"));
    transport.take_sent();

    presence.leave("room_a");

    assert!(transport.take_sent().is_empty());
    assert_eq!(presence.current_room_id().as_deref(), Some("room_b"));
}

#[tokio::test(start_paused = true)]
async fn leave_unbinds_the_room() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    transport.take_sent();

    presence.leave("room_a");

    assert_eq!(names(&transport.take_sent()), vec!["leave_room"]);
    assert!(presence.current_room().is_none());
}

#[tokio::test(start_paused = true)]
async fn roster_snapshot_replaces_and_deltas_apply() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));

    transport.deliver(InboundEvent::UserJoined(MemberPayload {
        room_id: "room_a".into(),
        user: participant("usr_ghost"),
    }));
    transport.deliver(roster_snapshot("room_a", &[ME, PEER]));
    settle().await;
    assert_eq!(roster_ids(&presence), vec![ME, PEER]);

    transport.deliver(InboundEvent::UserJoined(MemberPayload {
        room_id: "room_a".into(),
        user: participant("usr_mei"),
    }));
    transport.deliver(InboundEvent::UserLeft(MemberPayload {
        room_id: "room_a".into(),
        user: participant(PEER),
    }));
    transport.deliver(InboundEvent::PresenceUpdate(PresencePayload {
        room_id: "room_a".into(),
        user_id: ME.into(),
        state: PresenceState::Away,
    }));
    settle().await;

    assert_eq!(roster_ids(&presence), vec![ME, "usr_mei"]);
    assert_eq!(
        presence.participant(ME).map(|p| p.presence_state),
        Some(PresenceState::Away)
    );
}

#[tokio::test(start_paused = true)]
async fn events_for_other_rooms_are_dropped() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));

    transport.deliver(roster_snapshot("room_b", &[PEER]));
    transport.deliver(typing("room_b", PEER, true));
    settle().await;

    assert!(presence.roster().is_empty());
    assert!(presence.typing_users().is_empty());
}

#[tokio::test(start_paused = true)]
async fn room_switch_drops_cached_roster() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    transport.deliver(roster_snapshot("room_a", &[ME, PEER]));
    settle().await;

    presence.join(room("room_b"));

    assert!(presence.roster().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_typing_marks_expire_without_refresh() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));

    transport.deliver(typing("room_a", PEER, true));
    settle().await;
    assert_eq!(presence.typing_users(), vec![PEER]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    transport.deliver(typing("room_a", PEER, true));
    settle().await;

    // Refreshed at 2s, so still typing at 4s.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(presence.typing_users(), vec![PEER]);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(presence.typing_users().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_typing_clears_the_mark() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));

    transport.deliver(typing("room_a", PEER, true));
    transport.deliver(typing("room_a", "usr_mei", true));
    transport.deliver(typing("room_a", PEER, false));
    settle().await;

    assert_eq!(presence.typing_users(), vec!["usr_mei"]);
}

#[tokio::test(start_paused = true)]
async fn own_typing_echo_is_not_listed() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));

    transport.deliver(typing("room_a", ME, true));
    settle().await;

    assert!(presence.typing_users().is_empty());
}

#[tokio::test(start_paused = true)]
async fn local_typing_stops_after_silence() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    transport.take_sent();

    presence.notify_typing().unwrap();
    assert_eq!(names(&transport.take_sent()), vec!["start_typing"]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    presence.notify_typing().unwrap();
    assert!(transport.take_sent().is_empty());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(transport.take_sent().is_empty());
    assert!(presence.is_typing_locally());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(names(&transport.take_sent()), vec!["stop_typing"]);
    assert!(!presence.is_typing_locally());
}

#[tokio::test(start_paused = true)]
async fn notify_typing_requires_a_room() {
    let (_channel, transport, presence) = presence().await;

    let err = presence.notify_typing().unwrap_err();

    assert!(matches!(err, SyncError::NoActiveRoom));
    assert!(transport.take_sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn leaving_while_typing_announces_stop_first() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    presence.notify_typing().unwrap();
    transport.take_sent();

    presence.leave("room_a");

    assert_eq!(names(&transport.take_sent()), vec!["stop_typing", "leave_room"]);
}

#[tokio::test(start_paused = true)]
async fn set_presence_publishes_to_current_room() {
    let (_channel, transport, presence) = presence().await;
    assert!(matches!(
        presence.set_presence(PresenceState::Busy),
        Err(SyncError::NoActiveRoom)
    ));

    presence.join(room("room_a"));
    transport.take_sent();
    presence.set_presence(PresenceState::Busy).unwrap();

    let sent = transport.take_sent();
    assert!(matches!(
        &sent[..],
        [OutboundEvent::PresenceUpdate(p)]
            if p.room_id == "room_a" && p.user_id == ME && p.state == PresenceState::Busy
    ));
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_the_bound_room() {
    let (channel, transport, presence) = presence().await;
    presence.join(room("room_a"));
    transport.deliver(roster_snapshot("room_a", &[ME, PEER]));
    settle().await;
    transport.take_sent();

    transport.sever();
    settle().await;
    assert_eq!(channel.status(), ConnectionStatus::Reconnecting);
    assert!(presence.roster().is_empty());
    assert_eq!(presence.current_room_id().as_deref(), Some("room_a"));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(channel.status(), ConnectionStatus::Connected);
    let sent = transport.take_sent();
    assert_eq!(names(&sent), vec!["join_room", "request_roster"]);
    assert!(matches!(&sent[0], OutboundEvent::JoinRoom(p) if p.room_id == "room_a"));
}

#[tokio::test(start_paused = true)]
async fn join_while_offline_is_sent_on_reconnect() {
    let (_channel, transport, presence) = presence().await;
    transport.set_reachable(false);
    transport.sever();
    settle().await;

    presence.join(room("room_a"));
    assert_eq!(presence.current_room_id().as_deref(), Some("room_a"));
    assert!(transport.take_sent().is_empty());

    transport.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(names(&transport.take_sent()), vec!["join_room", "request_roster"]);
}

#[tokio::test(start_paused = true)]
async fn stopped_room_ignores_events() {
    let (_channel, transport, presence) = presence().await;
    presence.join(room("room_a"));

    presence.stop();
    transport.deliver(roster_snapshot("room_a", &[ME, PEER]));
    settle().await;

    assert!(presence.roster().is_empty());
}

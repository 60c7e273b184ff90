use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_client::channel::events::{ChannelEvent, EventKind, LifecycleEvent};
use sync_client::channel::handler;
use sync_client::channel::transport::WsTransport;
use sync_client::config::Config;
use sync_client::delivery::LogEvent;
use sync_client::models::message::MessageBody;
use sync_client::models::room::Room;
use sync_client::session::StaticBackend;
use sync_client::watcher::HttpStatusSource;
use sync_client::{SessionRegistry, TransactionStatusWatcher};
use tandem_common::id::{prefix, prefixed_ulid};

/// Usage: `sync-client [room-id] [operation-id ...]`
#[tokio::main]
async fn main() {
    // Load .env if present; variables may also come from the environment.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let mut args = std::env::args().skip(1);
    let room_id = args.next().unwrap_or_else(|| "lobby".to_string());
    let operations: Vec<String> = args.collect();

    let transport = Arc::new(WsTransport::new(&config.sync_url, config.handshake_timeout));
    let source = Arc::new(HttpStatusSource::new(&config.status_url));
    let watcher = Arc::new(TransactionStatusWatcher::new(source, config.watcher()));
    let backend = Arc::new(StaticBackend::new(
        config.contracts.clone(),
        config.display_name.clone(),
        config.auth_token.clone(),
    ));

    let registry = SessionRegistry::new(
        backend,
        transport,
        watcher.clone(),
        config.channel(),
        config.presence(),
        config.delivery(),
    );

    let account_id = config
        .wallet_account
        .clone()
        .unwrap_or_else(|| prefixed_ulid(prefix::USER));
    tracing::info!(%account_id, chain_id = %config.chain_id, sync_url = %config.sync_url, "sync-client configured");

    if let Err(error) = registry.connect_wallet(&account_id, &config.chain_id).await {
        tracing::error!(%error, "failed to establish session");
        return;
    }

    let (Some(presence), Some(delivery)) = (registry.presence(), registry.delivery()) else {
        tracing::error!("session has no room components");
        return;
    };

    let channel = registry.channel();
    channel.on(
        EventKind::Connected,
        handler(|_| {
            println!("* connected");
            Ok(())
        }),
    );
    channel.on(
        EventKind::Disconnected,
        handler(|event| {
            if let ChannelEvent::Lifecycle(LifecycleEvent::Disconnected { reason }) = event {
                println!("* disconnected ({reason:?})");
            }
            Ok(())
        }),
    );
    channel.on(
        EventKind::MaxReconnectReached,
        handler(|_| {
            println!("* connection lost for good; restart to reconnect");
            Ok(())
        }),
    );

    presence.join(Room {
        id: room_id.clone(),
        display_name: room_id.clone(),
        language: "en".to_string(),
        is_private: false,
    });

    for operation_id in &operations {
        watcher.start_default(operation_id);
    }

    let mut log_events = delivery.subscribe();
    let mut transitions = watcher.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(error) = delivery.send_text(line) {
                        println!("* not sent: {error}");
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(%error, "stdin read failed");
                    break;
                }
            },

            event = log_events.recv() => match event {
                Ok(LogEvent::Appended { local_id, .. }) => {
                    if let Some(message) = delivery.message(&local_id) {
                        let text = match &message.body {
                            MessageBody::Text(text) => text.clone(),
                            MessageBody::Voice(clip) => format!("[voice {} ms] {}", clip.duration_ms, clip.url),
                        };
                        println!("<{}> {}", message.sender_id, text);
                    }
                }
                Ok(LogEvent::Updated { local_id, state, .. }) => {
                    tracing::debug!(%local_id, ?state, "message state changed");
                }
                Ok(LogEvent::Cleared) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "message log observer lagged");
                }
                Err(RecvError::Closed) => break,
            },

            transition = transitions.recv() => match transition {
                Ok(transition) => println!(
                    "* operation {} moved from {} to {}",
                    transition.operation_id, transition.previous, transition.current
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transition observer lagged");
                }
                Err(RecvError::Closed) => break,
            },

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    presence.leave(&room_id);
    registry.shutdown().await;
    tracing::info!("sync-client stopped");
}

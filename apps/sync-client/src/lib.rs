pub mod channel;
pub mod config;
pub mod delivery;
pub mod error;
pub mod models;
pub mod presence;
pub mod session;
pub mod watcher;

pub use channel::{ChannelHandle, ConnectionStatus, EventChannel};
pub use delivery::DeliveryPipeline;
pub use error::SyncError;
pub use presence::PresenceRoom;
pub use session::SessionRegistry;
pub use watcher::TransactionStatusWatcher;

//! Wallet session ownership and teardown/rebuild on account or network change.
//!
//! The registry is the only owner of the [`EventChannel`]. Everything derived
//! from the wallet identity (contract bindings, room binding, message log,
//! watched operations) is rebuilt from scratch when the identity changes;
//! nothing carries over from a previous account or network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_common::id::{prefix, PrefixedId};

use crate::channel::events::Identity;
use crate::channel::{ChannelConfig, ChannelHandle, ConnectionStatus, EventChannel};
use crate::channel::transport::Transport;
use crate::delivery::{DeliveryConfig, DeliveryPipeline};
use crate::error::SyncError;
use crate::presence::{PresenceConfig, PresenceRoom};
use crate::watcher::TransactionStatusWatcher;

/// A contract bound to a specific signer on a specific network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractHandle {
    pub name: String,
    pub address: String,
    pub network_id: String,
    /// Account whose signing capability the binding uses.
    pub signer: String,
}

/// The active wallet identity and everything bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub account_id: String,
    pub network_id: String,
    pub bound_contracts: HashMap<String, ContractHandle>,
}

/// Events reported by the wallet provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(String),
}

/// Wallet/contract collaborator the registry derives a session from.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Bind every contract the app uses for `account_id` on `network_id`.
    async fn bind_contracts(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<HashMap<String, ContractHandle>, SyncError>;

    /// Handshake identity for the event channel.
    fn identity(&self, account_id: &str) -> Identity;
}

/// Backend with a fixed contract address table, used by the CLI.
pub struct StaticBackend {
    contracts: Vec<(String, String)>,
    display_name: Option<String>,
    token: String,
}

impl StaticBackend {
    pub fn new(contracts: Vec<(String, String)>, display_name: Option<String>, token: String) -> Self {
        Self {
            contracts,
            display_name,
            token,
        }
    }
}

#[async_trait]
impl SessionBackend for StaticBackend {
    async fn bind_contracts(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<HashMap<String, ContractHandle>, SyncError> {
        Ok(self
            .contracts
            .iter()
            .map(|(name, address)| {
                (
                    name.clone(),
                    ContractHandle {
                        name: name.clone(),
                        address: address.clone(),
                        network_id: network_id.to_string(),
                        signer: account_id.to_string(),
                    },
                )
            })
            .collect())
    }

    fn identity(&self, account_id: &str) -> Identity {
        Identity {
            user_id: account_id.to_string(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| account_id.to_string()),
            token: self.token.clone(),
        }
    }
}

/// A contract call awaiting confirmation, tied to the session that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub id: String,
    pub label: String,
    epoch: u64,
}

impl PrefixedId for PendingOperation {
    const PREFIX: &'static str = prefix::OPERATION;
}

/// A pending operation that was cut off by a session change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub id: String,
    pub label: String,
    pub reason: String,
}

#[derive(Default)]
struct RegistryState {
    session: Option<Session>,
    /// Kept across teardown so an account can reconnect on the same network.
    last_network: Option<String>,
    /// Bumped on every teardown.
    epoch: u64,
    presence: Option<PresenceRoom>,
    delivery: Option<DeliveryPipeline>,
    pending: HashMap<String, PendingOperation>,
    failed: Vec<FailedOperation>,
}

pub struct SessionRegistry {
    backend: Arc<dyn SessionBackend>,
    channel: EventChannel,
    watcher: Arc<TransactionStatusWatcher>,
    presence_config: PresenceConfig,
    delivery_config: DeliveryConfig,
    /// Serializes wallet transitions, which await the backend and the channel.
    transition: tokio::sync::Mutex<()>,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        transport: Arc<dyn Transport>,
        watcher: Arc<TransactionStatusWatcher>,
        channel_config: ChannelConfig,
        presence_config: PresenceConfig,
        delivery_config: DeliveryConfig,
    ) -> Self {
        Self {
            backend,
            channel: EventChannel::new(transport, channel_config),
            watcher,
            presence_config,
            delivery_config,
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Establish a session for a freshly connected wallet.
    pub async fn connect_wallet(&self, account_id: &str, network_id: &str) -> Result<(), SyncError> {
        let _guard = self.transition.lock().await;
        if self.state.lock().session.is_some() {
            self.teardown("wallet reconnected");
        }
        self.rebuild(account_id, network_id).await
    }

    /// React to a wallet provider event.
    pub async fn handle(&self, event: WalletEvent) -> Result<(), SyncError> {
        let _guard = self.transition.lock().await;
        match event {
            WalletEvent::AccountsChanged(accounts) => {
                let Some(account_id) = accounts.first() else {
                    tracing::info!("wallet reported no accounts, clearing session");
                    self.teardown("wallet disconnected");
                    return Ok(());
                };

                let network_id = {
                    let state = self.state.lock();
                    if state
                        .session
                        .as_ref()
                        .is_some_and(|session| &session.account_id == account_id)
                    {
                        return Ok(());
                    }
                    state
                        .session
                        .as_ref()
                        .map(|session| session.network_id.clone())
                        .or_else(|| state.last_network.clone())
                        .ok_or(SyncError::NoSession)?
                };

                tracing::info!(%account_id, %network_id, "wallet account changed");
                self.teardown("account changed");
                self.rebuild(account_id, &network_id).await
            }
            WalletEvent::ChainChanged(network_id) => {
                let account_id = {
                    let mut state = self.state.lock();
                    state.last_network = Some(network_id.clone());
                    match state.session.as_ref() {
                        Some(session) if session.network_id == network_id => return Ok(()),
                        Some(session) => session.account_id.clone(),
                        None => return Ok(()),
                    }
                };

                // Contract addresses and ABIs are network-specific: reload everything.
                tracing::info!(%account_id, %network_id, "wallet network changed");
                self.teardown("network changed");
                self.rebuild(&account_id, &network_id).await
            }
        }
    }

    /// Reconnect the channel after reconnect attempts were exhausted.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        let account_id = self
            .state
            .lock()
            .session
            .as_ref()
            .map(|session| session.account_id.clone())
            .ok_or(SyncError::NoSession)?;
        self.channel.connect(self.backend.identity(&account_id)).await;
        Ok(())
    }

    /// Tear everything down for application shutdown.
    pub async fn shutdown(&self) {
        let _guard = self.transition.lock().await;
        self.teardown("shutdown");
        self.watcher.stop_all();
    }

    /// Record a contract call that is awaiting confirmation.
    pub fn begin_operation(&self, label: &str) -> Result<PendingOperation, SyncError> {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(SyncError::NoSession);
        }
        let operation = PendingOperation {
            id: PendingOperation::generate(),
            label: label.to_string(),
            epoch: state.epoch,
        };
        state.pending.insert(operation.id.clone(), operation.clone());
        Ok(operation)
    }

    /// Settle a pending operation. Fails with `SessionInvalidated` if the
    /// session that started it is gone; the result must then be discarded.
    pub fn complete_operation(&self, operation: &PendingOperation) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if operation.epoch != state.epoch {
            tracing::warn!(
                operation_id = %operation.id,
                label = %operation.label,
                "operation completed after its session was invalidated"
            );
            return Err(SyncError::SessionInvalidated);
        }
        state.pending.remove(&operation.id);
        Ok(())
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.state.lock().pending.values().cloned().collect()
    }

    /// Drain operations failed by session changes since the last call.
    pub fn take_failed_operations(&self) -> Vec<FailedOperation> {
        std::mem::take(&mut self.state.lock().failed)
    }

    pub fn session(&self) -> Option<Session> {
        self.state.lock().session.clone()
    }

    pub fn presence(&self) -> Option<PresenceRoom> {
        self.state.lock().presence.clone()
    }

    pub fn delivery(&self) -> Option<DeliveryPipeline> {
        self.state.lock().delivery.clone()
    }

    pub fn watcher(&self) -> Arc<TransactionStatusWatcher> {
        self.watcher.clone()
    }

    pub fn channel(&self) -> ChannelHandle {
        self.channel.handle()
    }

    pub fn channel_status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    /// Drop the session and everything derived from it.
    fn teardown(&self, reason: &str) {
        let (presence, delivery) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            let failed: Vec<FailedOperation> = state
                .pending
                .drain()
                .map(|(_, op)| FailedOperation {
                    id: op.id,
                    label: op.label,
                    reason: reason.to_string(),
                })
                .collect();
            if !failed.is_empty() {
                tracing::warn!(count = failed.len(), %reason, "pending operations invalidated");
            }
            state.failed.extend(failed);
            state.session = None;
            (state.presence.take(), state.delivery.take())
        };

        if let Some(delivery) = delivery {
            delivery.fail_pending(reason);
            delivery.stop();
            delivery.reset();
        }
        if let Some(presence) = presence {
            presence.stop();
            presence.reset();
        }
        self.watcher.stop_all();
        self.channel.disconnect();
    }

    async fn rebuild(&self, account_id: &str, network_id: &str) -> Result<(), SyncError> {
        let bound_contracts = self
            .backend
            .bind_contracts(account_id, network_id)
            .await
            .map_err(|e| {
                tracing::error!(%account_id, %network_id, error = %e, "contract binding failed");
                e
            })?;

        // Subscribe before connecting so no event from the new link is missed.
        let presence = PresenceRoom::new(self.channel.handle(), self.presence_config.clone());
        presence.start();
        let delivery = DeliveryPipeline::new(
            self.channel.handle(),
            presence.clone(),
            self.delivery_config.clone(),
        );
        delivery.start();

        {
            let mut state = self.state.lock();
            state.session = Some(Session {
                account_id: account_id.to_string(),
                network_id: network_id.to_string(),
                bound_contracts,
            });
            state.last_network = Some(network_id.to_string());
            state.presence = Some(presence);
            state.delivery = Some(delivery);
        }

        self.channel.connect(self.backend.identity(account_id)).await;
        tracing::info!(%account_id, %network_id, "session established");
        Ok(())
    }
}

//! Realtime invitation and notification sync for Teammy clients: one shared
//! hub connection, a fan-out registry of listeners, a normalizing store and
//! pull-based reconciliation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, Result};
use serde_json::Value;
use shared::{
    domain::{GroupId, InvitationDecision, InvitationId, InvitationStatus},
    protocol::{event_names, HubEvent},
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod normalize;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use connection::{ConnectionManager, ConnectionState, StateObserver};
pub use reconcile::SyncOutcome;
pub use registry::{EventHandler, EventRegistry, Subscription};
pub use store::{ApplicationsState, ClientStore, InvitationsState};

use crate::{
    api::{HttpInvitationApi, InvitationApi},
    config::Settings,
    credentials::{CredentialCell, CredentialStore, FileCredentialStore, NoPersistedCredentials},
    normalize::{normalize_application, normalize_invitation},
    reconcile::Reconciler,
    registry::handler,
    transport::{HubConnector, WebSocketConnector},
};

/// Long-lived service object composing the connection, registry, store and
/// reconciler. UI surfaces call [`NotificationHub::attach`] when they mount
/// and drop or [`Subscriber::detach`] the result when they unmount.
pub struct NotificationHub {
    connection: Arc<ConnectionManager>,
    registry: Arc<EventRegistry>,
    store: Arc<ClientStore>,
    reconciler: Arc<Reconciler>,
    api: Arc<dyn InvitationApi>,
    _core_handlers: Vec<Subscription>,
    subscribers: Mutex<HashMap<String, usize>>,
}

impl NotificationHub {
    pub fn from_settings(settings: &Settings) -> Result<Arc<Self>> {
        let persisted: Arc<dyn CredentialStore> = match &settings.credentials_path {
            Some(path) => Arc::new(FileCredentialStore::new(path)),
            None => Arc::new(NoPersistedCredentials),
        };
        let credentials = Arc::new(CredentialCell::new(persisted));
        let api = Arc::new(HttpInvitationApi::new(
            settings.api_base_url.clone(),
            settings.request_timeout(),
            Arc::clone(&credentials),
        )?);
        let connector = Arc::new(WebSocketConnector::new(
            &settings.hub_url,
            settings.keepalive_interval(),
        )?);
        Ok(Self::new_with_dependencies(
            connector,
            api,
            credentials,
            settings.reconnect_delay(),
        ))
    }

    pub fn new_with_dependencies(
        connector: Arc<dyn HubConnector>,
        api: Arc<dyn InvitationApi>,
        credentials: Arc<CredentialCell>,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(EventRegistry::new());
        let store = Arc::new(ClientStore::new());
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&api), Arc::clone(&store)));
        let connection = Arc::new(ConnectionManager::new(
            connector,
            credentials,
            Arc::clone(&registry),
            reconnect_delay,
        ));

        let on_connected = Arc::clone(&reconciler);
        connection.observe_state(Arc::new(move |state| {
            if state == ConnectionState::Connected {
                spawn_sync(&on_connected);
            }
        }));

        let core_handlers = register_core_handlers(&registry, &store, &reconciler);
        Arc::new(Self {
            connection,
            registry,
            store,
            reconciler,
            api,
            _core_handlers: core_handlers,
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Ensures the shared connection for these credentials and returns a
    /// subscriber owning any listeners registered through it.
    pub fn attach(
        self: &Arc<Self>,
        key: impl Into<String>,
        token: Option<&str>,
        user_id: Option<&str>,
    ) -> Subscriber {
        let key = key.into();
        {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mounts = subscribers.entry(key.clone()).or_default();
            *mounts += 1;
            if *mounts > 1 {
                warn!(key = %key, mounts = *mounts, "hub: subscriber key attached more than once");
            }
        }
        self.connection.ensure_connection(token, user_id);
        debug!(key = %key, "hub: subscriber attached");
        Subscriber {
            key,
            hub: Arc::clone(self),
            subscriptions: Vec::new(),
        }
    }

    /// Like [`NotificationHub::attach`] with a generated key.
    pub fn attach_anonymous(self: &Arc<Self>, token: Option<&str>, user_id: Option<&str>) -> Subscriber {
        self.attach(uuid::Uuid::new_v4().to_string(), token, user_id)
    }

    /// Re-evaluates the connection after a sign-in, sign-out or token refresh.
    pub fn update_credentials(&self, token: Option<&str>, user_id: Option<&str>) {
        self.connection.ensure_connection(token, user_id);
    }

    pub fn active_subscribers(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, key: &str) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mounts) = subscribers.get_mut(key) {
            *mounts -= 1;
            if *mounts == 0 {
                subscribers.remove(key);
            }
        }
        debug!(key, remaining = subscribers.len(), "hub: subscriber detached");
    }

    pub fn store(&self) -> &Arc<ClientStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// The credential source shared by the hub connection and REST calls.
    pub fn credentials(&self) -> &Arc<CredentialCell> {
        self.connection.credentials()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn observe_connection(&self, observer: StateObserver) {
        self.connection.observe_state(observer);
    }

    pub async fn sync_pending_invitations(&self) -> SyncOutcome {
        self.reconciler.sync_pending_invitations().await
    }

    /// Starts a reconciliation in the background.
    pub fn schedule_sync(&self) {
        spawn_sync(&self.reconciler);
    }

    pub fn is_syncing(&self) -> bool {
        self.reconciler.is_syncing()
    }

    /// Posts the decision, then applies the same transition a pushed
    /// `InvitationStatusChanged` would.
    pub async fn respond_to_invitation(
        &self,
        invitation_id: &InvitationId,
        decision: InvitationDecision,
    ) -> Result<()> {
        self.api
            .respond_to_invitation(invitation_id, decision)
            .await?;
        info!(invitation_id = %invitation_id, ?decision, "hub: invitation answered");
        self.store
            .apply_invitation_status(invitation_id.clone(), decision.resulting_status());
        Ok(())
    }

    pub async fn refresh_group_applications(&self, group_id: &GroupId) -> Result<usize> {
        self.reconciler.refresh_group_applications(group_id).await
    }

    pub fn join_group(&self, group_id: &GroupId) -> bool {
        self.connection.join_group(group_id)
    }

    pub fn leave_group(&self, group_id: &GroupId) -> bool {
        self.connection.leave_group(group_id)
    }

    pub fn mark_as_read(&self) -> bool {
        self.store.mark_as_read()
    }

    /// Closes the connection regardless of attached subscribers.
    pub fn shutdown(&self) {
        self.connection.stop();
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.connection.stop();
    }
}

fn spawn_sync(reconciler: &Arc<Reconciler>) {
    let Ok(runtime) = Handle::try_current() else {
        warn!("sync: no async runtime; reconciliation not scheduled");
        return;
    };
    let reconciler = Arc::clone(reconciler);
    runtime.spawn(async move {
        reconciler.sync_pending_invitations().await;
    });
}

fn register_core_handlers(
    registry: &Arc<EventRegistry>,
    store: &Arc<ClientStore>,
    reconciler: &Arc<Reconciler>,
) -> Vec<Subscription> {
    let created_store = Arc::clone(store);
    let created_reconciler = Arc::clone(reconciler);
    let on_created = handler(move |payload| {
        let invitation = normalize_invitation(payload);
        debug!(invitation_id = %invitation.id, "hub: invitation created");
        created_store.add_pending_invitation(invitation);
        spawn_sync(&created_reconciler);
        Ok(())
    });

    let status_store = Arc::clone(store);
    let on_status_changed = handler(move |payload| {
        let HubEvent::InvitationStatusChanged(change) =
            HubEvent::decode(event_names::INVITATION_STATUS_CHANGED, payload)?
        else {
            return Ok(());
        };
        let invitation_id = change
            .target_id()
            .ok_or_else(|| anyhow!("status change without an invitation id"))?;
        let status: InvitationStatus = change
            .status
            .as_deref()
            .ok_or_else(|| anyhow!("status change for {invitation_id} without a status"))?
            .parse()?;
        debug!(invitation_id, %status, "hub: invitation status changed");
        status_store.apply_invitation_status(InvitationId::new(invitation_id), status);
        Ok(())
    });

    let pending_store = Arc::clone(store);
    let on_pending_updated = handler(move |payload| {
        let HubEvent::PendingUpdated(update) =
            HubEvent::decode(event_names::PENDING_UPDATED, payload)?
        else {
            return Ok(());
        };
        let group_id = update.group_id.map(GroupId::new);
        let mut added = 0;
        for candidate in &update.candidates {
            if pending_store.add_application(normalize_application(candidate, group_id.as_ref())) {
                added += 1;
            }
        }
        debug!(
            group_id = ?group_id.as_ref().map(GroupId::as_str),
            candidates = update.candidates.len(),
            added,
            "hub: pending applications updated"
        );
        Ok(())
    });

    vec![
        registry.subscribe(event_names::INVITATION_CREATED, on_created),
        registry.subscribe(event_names::INVITATION_STATUS_CHANGED, on_status_changed),
        registry.subscribe(event_names::PENDING_UPDATED, on_pending_updated),
    ]
}

/// One mounted consumer. Listeners registered through it are removed when
/// it is detached or dropped; the shared connection is left running.
pub struct Subscriber {
    key: String,
    hub: Arc<NotificationHub>,
    subscriptions: Vec<Subscription>,
}

impl Subscriber {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn on<F>(&mut self, event: &str, f: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.on_handler(event, handler(f))
    }

    pub fn on_handler(&mut self, event: &str, handler: EventHandler) -> &mut Self {
        self.subscriptions
            .push(self.hub.registry.subscribe(event, handler));
        self
    }

    pub fn invitations(&self) -> watch::Receiver<InvitationsState> {
        self.hub.store.watch_invitations()
    }

    pub fn applications(&self) -> watch::Receiver<ApplicationsState> {
        self.hub.store.watch_applications()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.hub.connection.watch_state()
    }

    pub fn detach(self) {}
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.subscriptions.clear();
        self.hub.release(&self.key);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

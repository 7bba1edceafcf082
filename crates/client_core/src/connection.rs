//! The single realtime hub connection shared by every mounted consumer.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use serde_json::{json, Value};
use shared::{
    domain::GroupId,
    protocol::{hub_methods, HubMessage},
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::{CredentialCell, Credentials},
    error::HubConnectError,
    registry::EventRegistry,
    transport::{HubConnector, HubLink},
};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Called synchronously, in order, for every state transition. Must not
/// call back into the manager's lifecycle methods.
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Inner {
    outbound: Option<mpsc::UnboundedSender<HubMessage>>,
    supervisor: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct ConnectionManager {
    connector: Arc<dyn HubConnector>,
    credentials: Arc<CredentialCell>,
    registry: Arc<EventRegistry>,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
    observers: RwLock<Vec<StateObserver>>,
    // Held while a transition is decided and published; taken before `inner`.
    transitions: Mutex<()>,
    inner: Mutex<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn HubConnector>,
        credentials: Arc<CredentialCell>,
        registry: Arc<EventRegistry>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            credentials,
            registry,
            reconnect_delay,
            state,
            observers: RwLock::new(Vec::new()),
            transitions: Mutex::new(()),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Idempotent: concurrent callers with the same credentials share one
    /// connection. New credentials tear the old connection down first.
    /// Missing credentials stop the connection.
    pub fn ensure_connection(self: &Arc<Self>, token: Option<&str>, user_id: Option<&str>) {
        let Some(credentials) = Credentials::from_parts(token, user_id) else {
            debug!("connection: credentials incomplete; staying disconnected");
            self.stop();
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            error!("connection: no async runtime available; cannot connect");
            return;
        };

        let order = lock(&self.transitions);
        let mut inner = lock(&self.inner);
        let user_id = credentials.user_id.clone();
        let changed = self.credentials.set(Some(credentials));
        let alive = inner
            .supervisor
            .as_ref()
            .is_some_and(|supervisor| !supervisor.is_finished());
        if alive && !changed {
            debug!(user_id = %user_id, "connection: reusing existing connection");
            return;
        }

        if let Some(previous) = inner.supervisor.take() {
            info!(user_id = %user_id, "connection: credentials changed; reconnecting");
            previous.abort();
        }
        inner.outbound = None;
        inner.generation += 1;
        let generation = inner.generation;
        let manager = Arc::clone(self);
        inner.supervisor = Some(runtime.spawn(manager.supervise(generation)));
        drop(inner);

        self.publish(&order, ConnectionState::Connecting);
    }

    /// Closes the connection and forgets the credentials.
    pub fn stop(&self) {
        let order = lock(&self.transitions);
        let mut inner = lock(&self.inner);
        self.credentials.set(None);
        inner.generation += 1;
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.abort();
            info!("connection: stopped");
        }
        inner.outbound = None;
        drop(inner);
        self.publish(&order, ConnectionState::Disconnected);
    }

    pub fn credentials(&self) -> &Arc<CredentialCell> {
        &self.credentials
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn observe_state(&self, observer: StateObserver) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Sends a hub method invocation. Returns `false` without sending when
    /// the connection is not up.
    pub fn invoke(&self, method: &str, arguments: Vec<Value>) -> bool {
        let outbound = lock(&self.inner).outbound.clone();
        let Some(outbound) = outbound.filter(|_| self.state() == ConnectionState::Connected)
        else {
            warn!(method, state = ?self.state(), "connection: not connected; invocation dropped");
            return false;
        };
        outbound.send(HubMessage::invocation(method, arguments)).is_ok()
    }

    pub fn join_group(&self, group_id: &GroupId) -> bool {
        self.invoke(hub_methods::JOIN_GROUP, vec![json!(group_id.as_str())])
    }

    pub fn leave_group(&self, group_id: &GroupId) -> bool {
        self.invoke(hub_methods::LEAVE_GROUP, vec![json!(group_id.as_str())])
    }

    /// Must be called with `transitions` held so observers see transitions
    /// in the order they happened.
    fn publish(&self, _order: &MutexGuard<'_, ()>, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return;
        }
        info!(state = ?next, "connection: state changed");

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(next))).is_err() {
                error!(state = ?next, "connection: state observer panicked");
            }
        }
    }

    /// Publishes `next` if `generation` is still current.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let order = lock(&self.transitions);
        if lock(&self.inner).generation != generation {
            return false;
        }
        self.publish(&order, next);
        true
    }

    fn install_link(&self, generation: u64, outbound: mpsc::UnboundedSender<HubMessage>) -> bool {
        let order = lock(&self.transitions);
        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                return false;
            }
            inner.outbound = Some(outbound);
        }
        self.publish(&order, ConnectionState::Connected);
        true
    }

    fn clear_link(&self, generation: u64) {
        let mut inner = lock(&self.inner);
        if inner.generation == generation {
            inner.outbound = None;
        }
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        loop {
            let Some(token) = self.credentials.access_token() else {
                warn!("connection: no usable access token");
                self.transition(generation, ConnectionState::Disconnected);
                return;
            };

            match self.connector.connect(&token).await {
                Ok(HubLink {
                    outbound,
                    mut inbound,
                }) => {
                    if !self.install_link(generation, outbound) {
                        return;
                    }
                    while let Some(event) = inbound.recv().await {
                        self.registry.dispatch(&event.target, &event.payload);
                    }
                    self.clear_link(generation);
                    warn!("connection: link lost");
                }
                Err(err) => {
                    if HubConnectError::is_unauthorized(&err) {
                        self.credentials.mark_token_stale();
                    }
                    warn!("connection: connect failed: {err:#}");
                }
            }

            if self.credentials.current().is_none() {
                self.transition(generation, ConnectionState::Disconnected);
                return;
            }
            if !self.transition(generation, ConnectionState::Reconnecting) {
                return;
            }
            debug!(delay_ms = self.reconnect_delay.as_millis() as u64, "connection: retrying");
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{GroupId, InvitationDecision, InvitationId, InvitationStatus},
    protocol::HubMessage,
};
use tokio::sync::mpsc;

use crate::{
    api::InvitationApi,
    error::HubConnectError,
    transport::{HubConnector, HubLink, InboundEvent},
};

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub(crate) struct MockInvitationApi {
    pub direct: Mutex<Result<Vec<Value>, String>>,
    pub posts: Mutex<Result<Vec<Value>, String>>,
    pub group_applications: Mutex<Vec<Value>>,
    pub respond_error: Mutex<Option<String>>,
    pub direct_calls: AtomicUsize,
    pub post_calls: AtomicUsize,
    pub responses: Mutex<Vec<(InvitationId, InvitationDecision)>>,
    pub latency: Duration,
}

impl MockInvitationApi {
    pub fn new() -> Self {
        Self {
            direct: Mutex::new(Ok(Vec::new())),
            posts: Mutex::new(Ok(Vec::new())),
            group_applications: Mutex::new(Vec::new()),
            respond_error: Mutex::new(None),
            direct_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
            responses: Mutex::new(Vec::new()),
            latency: Duration::from_millis(20),
        }
    }

    pub fn set_direct(&self, result: Result<Vec<Value>, String>) {
        *self.direct.lock().expect("direct") = result;
    }

    pub fn set_posts(&self, result: Result<Vec<Value>, String>) {
        *self.posts.lock().expect("posts") = result;
    }

    pub fn calls(&self) -> (usize, usize) {
        (
            self.direct_calls.load(Ordering::SeqCst),
            self.post_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl InvitationApi for MockInvitationApi {
    async fn list_direct_invitations(&self, status: InvitationStatus) -> Result<Vec<Value>> {
        assert_eq!(status, InvitationStatus::Pending);
        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.direct.lock().expect("direct").clone().map_err(|e| anyhow!(e))
    }

    async fn list_profile_post_invitations(&self, status: InvitationStatus) -> Result<Vec<Value>> {
        assert_eq!(status, InvitationStatus::Pending);
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.posts.lock().expect("posts").clone().map_err(|e| anyhow!(e))
    }

    async fn respond_to_invitation(
        &self,
        invitation_id: &InvitationId,
        decision: InvitationDecision,
    ) -> Result<()> {
        if let Some(err) = self.respond_error.lock().expect("respond").clone() {
            return Err(anyhow!(err));
        }
        self.responses
            .lock()
            .expect("responses")
            .push((invitation_id.clone(), decision));
        Ok(())
    }

    async fn list_group_applications(&self, _group_id: &GroupId) -> Result<Vec<Value>> {
        Ok(self.group_applications.lock().expect("apps").clone())
    }
}

/// The server's half of one scripted connection.
pub(crate) struct ServerSide {
    pub events: mpsc::UnboundedSender<InboundEvent>,
    pub invocations: mpsc::UnboundedReceiver<HubMessage>,
}

impl ServerSide {
    pub fn push(&self, target: &str, payload: Value) {
        self.events
            .send(InboundEvent {
                target: target.to_string(),
                payload,
            })
            .expect("client side still listening");
    }
}

pub(crate) struct ScriptedConnector {
    connects: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<HubConnectError>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                servers,
            }),
            rx,
        )
    }

    pub fn fail_next(&self, err: HubConnectError) {
        self.failures.lock().expect("failures").push_back(err);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("tokens").clone()
    }
}

#[async_trait]
impl HubConnector for ScriptedConnector {
    async fn connect(&self, access_token: &str) -> Result<HubLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .expect("tokens")
            .push(access_token.to_string());
        tokio::task::yield_now().await;

        if let Some(err) = self.failures.lock().expect("failures").pop_front() {
            return Err(err.into());
        }

        let (outbound, invocations) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerSide {
            events,
            invocations,
        });
        Ok(HubLink { outbound, inbound })
    }
}

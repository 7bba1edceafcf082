use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use shared::{
    domain::{GroupId, InvitationDecision, InvitationId, InvitationStatus},
    error::{ApiError, ErrorCode},
    protocol::unwrap_list,
};
use tracing::debug;

use crate::{credentials::CredentialCell, error::ApiRequestError};

pub const DIRECT_INVITATIONS_PATH: &str = "/invitations";
pub const PROFILE_POST_INVITATIONS_PATH: &str = "/profile-posts/invitations";

/// The slice of the Teammy REST API the realtime core depends on. List calls
/// return raw items; normalization happens in the caller.
#[async_trait]
pub trait InvitationApi: Send + Sync {
    async fn list_direct_invitations(&self, status: InvitationStatus) -> Result<Vec<Value>>;
    async fn list_profile_post_invitations(&self, status: InvitationStatus) -> Result<Vec<Value>>;
    async fn respond_to_invitation(
        &self,
        invitation_id: &InvitationId,
        decision: InvitationDecision,
    ) -> Result<()>;
    async fn list_group_applications(&self, group_id: &GroupId) -> Result<Vec<Value>>;
}

pub struct HttpInvitationApi {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialCell>,
}

impl HttpInvitationApi {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        credentials: Arc<CredentialCell>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .credentials
            .access_token()
            .ok_or(ApiRequestError::MissingCredentials)?;
        Ok(request.bearer_auth(token))
    }

    async fn get_list(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .authorized(self.http.get(&url).query(query))?
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .with_context(|| format!("GET {url} returned invalid JSON"))?;
        let items = unwrap_list(body).ok_or_else(|| ApiRequestError::UnexpectedShape {
            endpoint: path.to_string(),
        })?;
        debug!(endpoint = path, count = items.len(), "api: list fetched");
        Ok(items)
    }
}

/// Maps a non-success response to [`ApiError`], using the server's message
/// when the body carries one.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("title"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("request failed with status {status}"));
    Err(ApiError::new(ErrorCode::from_status(status.as_u16()), message).into())
}

#[async_trait]
impl InvitationApi for HttpInvitationApi {
    async fn list_direct_invitations(&self, status: InvitationStatus) -> Result<Vec<Value>> {
        self.get_list(DIRECT_INVITATIONS_PATH, &[("status", status.as_str())])
            .await
    }

    async fn list_profile_post_invitations(&self, status: InvitationStatus) -> Result<Vec<Value>> {
        self.get_list(PROFILE_POST_INVITATIONS_PATH, &[("status", status.as_str())])
            .await
    }

    async fn respond_to_invitation(
        &self,
        invitation_id: &InvitationId,
        decision: InvitationDecision,
    ) -> Result<()> {
        let url = format!(
            "{}{DIRECT_INVITATIONS_PATH}/{invitation_id}/{}",
            self.base_url,
            decision.path_segment()
        );
        let response = self
            .authorized(self.http.post(&url))?
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        check_status(response).await?;
        Ok(())
    }

    async fn list_group_applications(&self, group_id: &GroupId) -> Result<Vec<Value>> {
        self.get_list(&format!("/groups/{group_id}/join-requests"), &[])
            .await
    }
}

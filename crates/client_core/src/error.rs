use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubConnectError {
    #[error("hub rejected the access token")]
    Unauthorized,
    #[error("hub handshake failed: {0}")]
    Handshake(String),
    #[error("hub transport failed: {0}")]
    Transport(String),
}

impl HubConnectError {
    pub fn is_unauthorized(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Self>(), Some(Self::Unauthorized))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to list direct invitations: {0}")]
    DirectList(anyhow::Error),
    #[error("failed to list profile-post invitations: {0}")]
    PostList(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ApiRequestError {
    #[error("not signed in: no access token available")]
    MissingCredentials,
    #[error("unexpected response shape from {endpoint}")]
    UnexpectedShape { endpoint: String },
}

use std::{
    fmt, fs,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use serde::Deserialize;
use shared::domain::UserId;
use tracing::{debug, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
}

impl Credentials {
    /// Returns `None` unless both parts are present and non-blank.
    pub fn from_parts(token: Option<&str>, user_id: Option<&str>) -> Option<Self> {
        let token = token.map(str::trim).filter(|t| !t.is_empty())?;
        let user_id = user_id.map(str::trim).filter(|u| !u.is_empty())?;
        Some(Self {
            token: token.to_string(),
            user_id: UserId::new(user_id),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Where credentials persisted by the sign-in flow can be re-read from.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<Credentials>;
}

pub struct NoPersistedCredentials;

impl CredentialStore for NoPersistedCredentials {
    fn load(&self) -> Option<Credentials> {
        None
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCredentials {
    token: Option<String>,
    #[serde(alias = "userID", alias = "user_id")]
    user_id: Option<String>,
}

/// Reads `{ "token": "...", "userId": "..." }` from disk on every load so
/// a token rotated by another process is picked up.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<Credentials> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(path = %self.path.display(), "credentials: no persisted file: {err}");
                return None;
            }
        };
        match serde_json::from_str::<PersistedCredentials>(&raw) {
            Ok(persisted) => {
                Credentials::from_parts(persisted.token.as_deref(), persisted.user_id.as_deref())
            }
            Err(err) => {
                warn!(path = %self.path.display(), "credentials: persisted file is malformed: {err}");
                None
            }
        }
    }
}

#[derive(Default)]
struct LiveCredentials {
    credentials: Option<Credentials>,
    token_stale: bool,
}

/// The session's reactive credentials, shared by the hub connection and the
/// REST client.
pub struct CredentialCell {
    live: RwLock<LiveCredentials>,
    store: Arc<dyn CredentialStore>,
}

impl CredentialCell {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            live: RwLock::new(LiveCredentials::default()),
            store,
        }
    }

    pub fn without_persistence() -> Self {
        Self::new(Arc::new(NoPersistedCredentials))
    }

    /// Replaces the live credentials. Returns `true` when they changed.
    /// Supplying the current pair again keeps a stale mark in place.
    pub fn set(&self, credentials: Option<Credentials>) -> bool {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if live.credentials == credentials {
            return false;
        }
        live.credentials = credentials;
        live.token_stale = false;
        true
    }

    pub fn current(&self) -> Option<Credentials> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credentials
            .clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.current().map(|credentials| credentials.user_id)
    }

    pub fn mark_token_stale(&self) {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if live.credentials.is_some() && !live.token_stale {
            warn!("credentials: live token marked stale; falling back to persisted credentials");
            live.token_stale = true;
        }
    }

    /// Live token first; once it is stale, the persisted token for the same
    /// user. `None` when signed out.
    pub fn access_token(&self) -> Option<String> {
        let (credentials, stale) = {
            let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
            (live.credentials.clone()?, live.token_stale)
        };
        if !stale {
            return Some(credentials.token);
        }
        let persisted = self.store.load()?;
        if persisted.user_id != credentials.user_id {
            warn!(
                user_id = %credentials.user_id,
                persisted_user_id = %persisted.user_id,
                "credentials: persisted token belongs to a different user"
            );
            return None;
        }
        Some(persisted.token)
    }
}

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Terminates every frame of the JSON hub protocol.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const HUB_PROTOCOL_NAME: &str = "json";
pub const HUB_PROTOCOL_VERSION: u32 = 1;

pub mod event_names {
    pub const INVITATION_CREATED: &str = "InvitationCreated";
    pub const INVITATION_STATUS_CHANGED: &str = "InvitationStatusChanged";
    pub const PENDING_UPDATED: &str = "PendingUpdated";
    pub const MEMBER_REMOVED: &str = "MemberRemoved";
    pub const MEMBER_ROLE_CHANGED: &str = "MemberRoleChanged";
    pub const GROUP_UPDATED: &str = "GroupUpdated";
    pub const MEMBER_JOINED: &str = "MemberJoined";
    pub const USER_ONLINE: &str = "UserOnline";
    pub const USER_OFFLINE: &str = "UserOffline";
}

pub mod hub_methods {
    pub const JOIN_GROUP: &str = "JoinGroup";
    pub const LEAVE_GROUP: &str = "LeaveGroup";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed hub frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invocation frame is missing a target")]
    MissingTarget,
    #[error("hub rejected handshake: {0}")]
    HandshakeRejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Completions, stream items and other kinds this client never acts on.
    Other(u8),
}

impl HubMessage {
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

const KIND_INVOCATION: u8 = 1;
const KIND_PING: u8 = 6;
const KIND_CLOSE: u8 = 7;

impl From<&HubMessage> for RawHubMessage {
    fn from(message: &HubMessage) -> Self {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => Self {
                kind: KIND_INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Self::default()
            },
            HubMessage::Ping => Self {
                kind: KIND_PING,
                ..Self::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => Self {
                kind: KIND_CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..Self::default()
            },
            HubMessage::Other(kind) => Self {
                kind: *kind,
                ..Self::default()
            },
        }
    }
}

impl TryFrom<RawHubMessage> for HubMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawHubMessage) -> Result<Self, Self::Error> {
        Ok(match raw.kind {
            KIND_INVOCATION => HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(ProtocolError::MissingTarget)?,
                arguments: raw.arguments.unwrap_or_default(),
            },
            KIND_PING => HubMessage::Ping,
            KIND_CLOSE => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            },
            other => HubMessage::Other(other),
        })
    }
}

pub fn encode_frame(message: &HubMessage) -> Result<String, ProtocolError> {
    let mut text = serde_json::to_string(&RawHubMessage::from(message))?;
    text.push(RECORD_SEPARATOR);
    Ok(text)
}

/// Splits a transport message into frames. A malformed frame is reported in
/// place and does not hide the frames around it.
pub fn parse_frames(text: &str) -> Vec<Result<HubMessage, ProtocolError>> {
    text.split(RECORD_SEPARATOR)
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let raw: RawHubMessage = serde_json::from_str(frame)?;
            HubMessage::try_from(raw)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

pub fn handshake_request() -> String {
    let mut text = serde_json::json!({
        "protocol": HUB_PROTOCOL_NAME,
        "version": HUB_PROTOCOL_VERSION,
    })
    .to_string();
    text.push(RECORD_SEPARATOR);
    text
}

/// Validates the handshake reply and returns whatever frames trailed it in
/// the same transport message.
pub fn parse_handshake_response(text: &str) -> Result<&str, ProtocolError> {
    let (head, rest) = text.split_once(RECORD_SEPARATOR).unwrap_or((text, ""));
    let response: HandshakeResponse = serde_json::from_str(head)?;
    match response.error {
        Some(error) => Err(ProtocolError::HandshakeRejected(error)),
        None => Ok(rest),
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationStatusChanged {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub invitation_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl InvitationStatusChanged {
    pub fn target_id(&self) -> Option<&str> {
        self.invitation_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdated {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub candidates: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberEvent {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub group_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<String>,
}

/// Every server-pushed event the Teammy hub is known to emit, keyed by
/// target name.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Raw payload; interpreted only by the payload normalizer.
    InvitationCreated(Value),
    InvitationStatusChanged(InvitationStatusChanged),
    PendingUpdated(PendingUpdated),
    MemberRemoved(GroupMemberEvent),
    MemberRoleChanged(GroupMemberEvent),
    GroupUpdated(Value),
    MemberJoined(GroupMemberEvent),
    UserOnline(PresenceEvent),
    UserOffline(PresenceEvent),
    Unknown { target: String, payload: Value },
}

impl HubEvent {
    pub fn decode(target: &str, payload: &Value) -> Result<Self, ProtocolError> {
        use event_names::*;

        Ok(match target {
            INVITATION_CREATED => Self::InvitationCreated(payload.clone()),
            INVITATION_STATUS_CHANGED => {
                Self::InvitationStatusChanged(InvitationStatusChanged::deserialize(payload)?)
            }
            PENDING_UPDATED => Self::PendingUpdated(PendingUpdated::deserialize(payload)?),
            MEMBER_REMOVED => Self::MemberRemoved(GroupMemberEvent::deserialize(payload)?),
            MEMBER_ROLE_CHANGED => {
                Self::MemberRoleChanged(GroupMemberEvent::deserialize(payload)?)
            }
            GROUP_UPDATED => Self::GroupUpdated(payload.clone()),
            MEMBER_JOINED => Self::MemberJoined(GroupMemberEvent::deserialize(payload)?),
            USER_ONLINE => Self::UserOnline(presence(payload)?),
            USER_OFFLINE => Self::UserOffline(presence(payload)?),
            other => Self::Unknown {
                target: other.to_string(),
                payload: payload.clone(),
            },
        })
    }
}

fn presence(payload: &Value) -> Result<PresenceEvent, ProtocolError> {
    match payload {
        Value::String(user_id) => Ok(PresenceEvent {
            user_id: Some(user_id.clone()),
        }),
        other => Ok(PresenceEvent::deserialize(other)?),
    }
}

/// Unwraps a REST list response. The API returns both `{ "data": [...] }`
/// envelopes and bare arrays depending on the endpoint.
pub fn unwrap_list(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Some(items),
            Some(Value::Object(mut inner)) => match inner.remove("items") {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            },
            Some(Value::Null) => Some(Vec::new()),
            _ => None,
        },
        _ => None,
    }
}

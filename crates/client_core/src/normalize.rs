//! Boundary translation from loosely-shaped server payloads to the canonical
//! [`Invitation`] and [`Application`] records. Every function here is total:
//! missing or malformed fields fall back to defaults instead of failing.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use shared::domain::{
    Application, ApplicationId, GroupId, Invitation, InvitationId, InvitationKind,
    InvitationStatus, UserId,
};

const INVITATION_ID_KEYS: &[&str] = &["invitationId", "id"];
const GROUP_ID_KEYS: &[&str] = &["groupId", "group.id", "group.groupId"];
const GROUP_NAME_KEYS: &[&str] = &["groupName", "group.name", "teamName"];
const POST_ID_KEYS: &[&str] = &["postId", "profilePostId"];
const CANDIDATE_ID_KEYS: &[&str] = &["candidateId"];
const POST_TITLE_KEYS: &[&str] = &["postTitle", "post.title"];
const INVITER_NAME_KEYS: &[&str] = &[
    "invitedByName",
    "invitedBy",
    "leaderDisplayName",
    "leaderName",
    "senderName",
    "senderDisplayName",
    "inviterName",
    "inviterDisplayName",
];
const INVITER_AVATAR_KEYS: &[&str] = &[
    "invitedByAvatar",
    "leaderAvatarUrl",
    "leaderAvatar",
    "senderAvatarUrl",
    "inviterAvatarUrl",
];
const KIND_KEYS: &[&str] = &["type", "invitationType"];
const INVITED_AT_KEYS: &[&str] = &["createdAt", "invitedAt", "sentAt"];

const APPLICATION_ID_KEYS: &[&str] = &["applicationId", "joinRequestId", "id"];
const APPLICANT_ID_KEYS: &[&str] = &["userId", "candidateId", "studentId", "user.id"];
const APPLICANT_NAME_KEYS: &[&str] = &[
    "userName",
    "displayName",
    "fullName",
    "name",
    "user.displayName",
    "user.name",
];
const APPLICANT_EMAIL_KEYS: &[&str] = &["userEmail", "email", "user.email"];
const APPLICANT_AVATAR_KEYS: &[&str] = &["userAvatar", "avatarUrl", "avatar", "user.avatarUrl"];
const APPLIED_AT_KEYS: &[&str] = &["appliedAt", "createdAt", "requestedAt"];
const SKILLS_KEYS: &[&str] = &["skills", "user.skills"];
const MAJOR_KEYS: &[&str] = &["major", "majorName", "user.major"];

fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(raw, |value, key| value.get(key))
}

/// First non-empty string (or number rendered as string) among `keys`, in
/// priority order.
fn first_text(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match lookup(raw, key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn timestamp(raw: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| match lookup(raw, key)? {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Zone-less server timestamps are UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn status(raw: &Value) -> InvitationStatus {
    first_text(raw, &["status"])
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

/// Stable id for payloads that carry no identifying field at all.
fn content_id(prefix: &str, raw: &Value) -> String {
    let digest = Sha256::digest(raw.to_string().as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{hex}")
}

pub fn normalize_invitation(raw: &Value) -> Invitation {
    normalize_invitation_at(raw, Utc::now())
}

/// Like [`normalize_invitation`], with `now` used when the payload carries
/// no creation timestamp.
pub fn normalize_invitation_at(raw: &Value, now: DateTime<Utc>) -> Invitation {
    let group_id = first_text(raw, GROUP_ID_KEYS);
    let post_id = first_text(raw, POST_ID_KEYS);
    let candidate_id = first_text(raw, CANDIDATE_ID_KEYS);

    let id = first_text(raw, INVITATION_ID_KEYS)
        .or_else(|| match (&post_id, &candidate_id) {
            (Some(post), Some(candidate)) => Some(format!("{post}-{candidate}")),
            _ => None,
        })
        .or_else(|| candidate_id.clone())
        .or_else(|| group_id.clone())
        .unwrap_or_else(|| content_id("inv", raw));

    let kind = first_text(raw, KIND_KEYS)
        .and_then(|k| k.parse().ok())
        .unwrap_or(if post_id.is_some() {
            InvitationKind::ProfilePost
        } else {
            InvitationKind::Direct
        });

    Invitation {
        id: InvitationId::new(id),
        group_id: group_id.map(GroupId::new),
        group_name: first_text(raw, GROUP_NAME_KEYS),
        post_id,
        candidate_id,
        post_title: first_text(raw, POST_TITLE_KEYS),
        invited_by_name: first_text(raw, INVITER_NAME_KEYS),
        invited_by_avatar: first_text(raw, INVITER_AVATAR_KEYS),
        kind,
        status: status(raw),
        created_at: timestamp(raw, INVITED_AT_KEYS).unwrap_or(now),
    }
}

pub fn normalize_application(raw: &Value, group_id: Option<&GroupId>) -> Application {
    normalize_application_at(raw, group_id, Utc::now())
}

/// `group_id` overrides whatever group the payload names; `PendingUpdated`
/// candidates carry their group only on the envelope.
pub fn normalize_application_at(
    raw: &Value,
    group_id: Option<&GroupId>,
    now: DateTime<Utc>,
) -> Application {
    let group_id = group_id
        .cloned()
        .or_else(|| first_text(raw, GROUP_ID_KEYS).map(GroupId::new))
        .unwrap_or_else(|| GroupId::new(""));
    let user_id = first_text(raw, APPLICANT_ID_KEYS);

    let id = first_text(raw, APPLICATION_ID_KEYS)
        .or_else(|| {
            user_id
                .as_ref()
                .filter(|_| !group_id.as_str().is_empty())
                .map(|user| format!("{group_id}-{user}"))
        })
        .or_else(|| user_id.clone())
        .unwrap_or_else(|| content_id("app", raw));

    Application {
        id: ApplicationId::new(id),
        group_id,
        user_id: user_id.map(UserId::new),
        user_name: first_text(raw, APPLICANT_NAME_KEYS).unwrap_or_default(),
        user_email: first_text(raw, APPLICANT_EMAIL_KEYS).unwrap_or_default(),
        user_avatar: first_text(raw, APPLICANT_AVATAR_KEYS),
        status: status(raw),
        applied_at: timestamp(raw, APPLIED_AT_KEYS).unwrap_or(now),
        skills: skills(raw),
        major: first_text(raw, MAJOR_KEYS),
    }
}

fn skills(raw: &Value) -> Vec<String> {
    let Some(value) = SKILLS_KEYS.iter().find_map(|key| lookup(raw, key)) else {
        return Vec::new();
    };
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(_) => first_text(item, &["name", "skillName"]),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;

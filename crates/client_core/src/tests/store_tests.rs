use super::*;
use crate::normalize::{normalize_application, normalize_invitation};
use serde_json::json;

fn invitation(id: &str) -> Invitation {
    normalize_invitation(&json!({ "id": id, "status": "pending" }))
}

fn application(group: &str, user: &str) -> Application {
    normalize_application(&json!({ "userId": user }), Some(&GroupId::new(group)))
}

#[test]
fn adding_the_same_id_twice_is_a_no_op() {
    let mut state = InvitationsState::default();
    assert!(reduce_invitations(
        &mut state,
        InvitationAction::AddPending(invitation("inv-1"))
    ));
    assert!(!reduce_invitations(
        &mut state,
        InvitationAction::AddPending(invitation("inv-1"))
    ));

    assert_eq!(state.pending.len(), 1);
    assert_eq!(state.unread_count, 1);
}

#[test]
fn newest_invitation_is_prepended() {
    let mut state = InvitationsState::default();
    reduce_invitations(&mut state, InvitationAction::AddPending(invitation("a")));
    reduce_invitations(&mut state, InvitationAction::AddPending(invitation("b")));
    let ids: Vec<&str> = state.pending.iter().map(|inv| inv.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
}

#[test]
fn unread_count_never_goes_negative() {
    let mut state = InvitationsState::default();
    reduce_invitations(&mut state, InvitationAction::AddPending(invitation("inv-1")));
    for status in [
        InvitationStatus::Accepted,
        InvitationStatus::Rejected,
        InvitationStatus::Accepted,
    ] {
        reduce_invitations(
            &mut state,
            InvitationAction::UpdateStatus {
                invitation_id: InvitationId::new("inv-1"),
                status,
            },
        );
    }
    assert_eq!(state.unread_count, 0);

    reduce_invitations(&mut state, InvitationAction::MarkAsRead);
    reduce_invitations(&mut state, InvitationAction::AddPending(invitation("inv-2")));
    reduce_invitations(&mut state, InvitationAction::MarkAsRead);
    reduce_invitations(
        &mut state,
        InvitationAction::UpdateStatus {
            invitation_id: InvitationId::new("inv-2"),
            status: InvitationStatus::Rejected,
        },
    );
    assert_eq!(state.unread_count, 0);
}

#[test]
fn unknown_ids_are_ignored() {
    let mut state = InvitationsState::default();
    reduce_invitations(&mut state, InvitationAction::AddPending(invitation("known")));
    let before = state.clone();

    assert!(!reduce_invitations(
        &mut state,
        InvitationAction::UpdateStatus {
            invitation_id: InvitationId::new("missing"),
            status: InvitationStatus::Accepted,
        }
    ));
    assert!(!reduce_invitations(
        &mut state,
        InvitationAction::Remove(InvitationId::new("missing"))
    ));
    assert_eq!(state, before);
}

#[test]
fn set_pending_is_a_full_replace() {
    let mut state = InvitationsState::default();
    reduce_invitations(
        &mut state,
        InvitationAction::SetPending(vec![invitation("A"), invitation("B")]),
    );
    reduce_invitations(&mut state, InvitationAction::SetPending(vec![invitation("A")]));

    assert_eq!(state.pending.len(), 1);
    assert!(state.contains("A"));
    assert!(!state.contains("B"));
    assert_eq!(state.unread_count, 1);
}

#[test]
fn set_pending_counts_only_pending_and_drops_duplicate_ids() {
    let mut state = InvitationsState::default();
    let mut accepted = invitation("done");
    accepted.status = InvitationStatus::Accepted;
    reduce_invitations(
        &mut state,
        InvitationAction::SetPending(vec![invitation("x"), invitation("x"), accepted]),
    );
    assert_eq!(state.pending.len(), 2);
    assert_eq!(state.unread_count, 1);
}

#[test]
fn mark_as_read_keeps_records() {
    let mut state = InvitationsState::default();
    reduce_invitations(&mut state, InvitationAction::AddPending(invitation("a")));
    reduce_invitations(&mut state, InvitationAction::MarkAsRead);
    assert_eq!(state.unread_count, 0);
    assert_eq!(state.pending.len(), 1);
}

#[test]
fn applying_a_terminal_status_removes_the_invitation() {
    let store = ClientStore::new();
    store.add_pending_invitation(invitation("p9-c9"));
    assert_eq!(store.unread_count(), 1);

    store.apply_invitation_status(InvitationId::new("p9-c9"), InvitationStatus::Accepted);

    let state = store.invitations();
    assert!(state.pending.is_empty());
    assert_eq!(state.unread_count, 0);
}

#[tokio::test]
async fn watchers_observe_every_change() {
    let store = ClientStore::new();
    let mut first = store.watch_invitations();
    let mut second = store.watch_invitations();

    store.add_pending_invitation(invitation("inv-1"));

    first.changed().await.expect("first watcher");
    second.changed().await.expect("second watcher");
    assert_eq!(first.borrow().pending.len(), 1);
    assert_eq!(second.borrow().unread_count, 1);

    assert!(!store.add_pending_invitation(invitation("inv-1")));
    assert!(!first.has_changed().expect("sender alive"));
}

#[test]
fn applications_are_grouped_and_deduplicated() {
    let mut state = ApplicationsState::default();
    reduce_applications(&mut state, ApplicationAction::Add(application("g1", "u1")));
    reduce_applications(&mut state, ApplicationAction::Add(application("g1", "u1")));
    reduce_applications(&mut state, ApplicationAction::Add(application("g1", "u2")));
    reduce_applications(&mut state, ApplicationAction::Add(application("g2", "u1")));

    assert_eq!(state.for_group(&GroupId::new("g1")).len(), 2);
    assert_eq!(state.for_group(&GroupId::new("g2")).len(), 1);
    assert!(state.for_group(&GroupId::new("g3")).is_empty());
    assert_eq!(state.pending_count(), 3);
}

#[test]
fn application_status_updates_in_place() {
    let mut state = ApplicationsState::default();
    reduce_applications(&mut state, ApplicationAction::Add(application("g1", "u1")));

    assert!(reduce_applications(
        &mut state,
        ApplicationAction::UpdateStatus {
            application_id: ApplicationId::new("g1-u1"),
            status: InvitationStatus::Accepted,
        }
    ));
    assert!(!reduce_applications(
        &mut state,
        ApplicationAction::UpdateStatus {
            application_id: ApplicationId::new("nope"),
            status: InvitationStatus::Accepted,
        }
    ));
    assert_eq!(
        state.for_group(&GroupId::new("g1"))[0].status,
        InvitationStatus::Accepted
    );
    assert_eq!(state.pending_count(), 0);
}

#[test]
fn set_group_replaces_only_that_group() {
    let mut state = ApplicationsState::default();
    reduce_applications(&mut state, ApplicationAction::Add(application("g1", "u1")));
    reduce_applications(&mut state, ApplicationAction::Add(application("g2", "u9")));

    reduce_applications(
        &mut state,
        ApplicationAction::SetGroup {
            group_id: GroupId::new("g1"),
            applications: vec![application("g1", "u5")],
        },
    );
    let g1: Vec<&str> = state
        .for_group(&GroupId::new("g1"))
        .iter()
        .map(|app| app.id.as_str())
        .collect();
    assert_eq!(g1, vec!["g1-u5"]);
    assert_eq!(state.for_group(&GroupId::new("g2")).len(), 1);

    reduce_applications(
        &mut state,
        ApplicationAction::SetGroup {
            group_id: GroupId::new("g2"),
            applications: Vec::new(),
        },
    );
    assert!(!state.by_group.contains_key(&GroupId::new("g2")));
}

#[test]
fn removing_last_application_drops_the_group() {
    let mut state = ApplicationsState::default();
    reduce_applications(&mut state, ApplicationAction::Add(application("g1", "u1")));
    assert!(reduce_applications(
        &mut state,
        ApplicationAction::Remove(ApplicationId::new("g1-u1"))
    ));
    assert!(state.by_group.is_empty());
}

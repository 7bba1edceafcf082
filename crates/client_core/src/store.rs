use std::collections::{BTreeMap, HashSet};

use shared::domain::{
    Application, ApplicationId, GroupId, Invitation, InvitationId, InvitationStatus,
};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvitationsState {
    /// Newest first. Ids are unique.
    pub pending: Vec<Invitation>,
    pub unread_count: usize,
}

impl InvitationsState {
    pub fn get(&self, id: &str) -> Option<&Invitation> {
        self.pending.iter().find(|inv| inv.id.as_str() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

#[derive(Debug, Clone)]
pub enum InvitationAction {
    AddPending(Invitation),
    UpdateStatus {
        invitation_id: InvitationId,
        status: InvitationStatus,
    },
    SetPending(Vec<Invitation>),
    MarkAsRead,
    Remove(InvitationId),
}

/// Applies `action` and reports whether anything changed.
pub fn reduce_invitations(state: &mut InvitationsState, action: InvitationAction) -> bool {
    match action {
        InvitationAction::AddPending(invitation) => {
            if state.contains(invitation.id.as_str()) {
                return false;
            }
            state.pending.insert(0, invitation);
            state.unread_count += 1;
            true
        }
        InvitationAction::UpdateStatus {
            invitation_id,
            status,
        } => {
            let Some(entry) = state.pending.iter_mut().find(|inv| inv.id == invitation_id) else {
                return false;
            };
            if entry.status == status {
                return false;
            }
            let was_pending = entry.status.is_pending();
            entry.status = status;
            if was_pending && !status.is_pending() {
                state.unread_count = state.unread_count.saturating_sub(1);
            }
            true
        }
        InvitationAction::SetPending(list) => {
            let mut seen = HashSet::new();
            let pending: Vec<Invitation> = list
                .into_iter()
                .filter(|inv| seen.insert(inv.id.clone()))
                .collect();
            let unread_count = pending.iter().filter(|inv| inv.status.is_pending()).count();
            let next = InvitationsState {
                pending,
                unread_count,
            };
            if *state == next {
                return false;
            }
            *state = next;
            true
        }
        InvitationAction::MarkAsRead => {
            let changed = state.unread_count != 0;
            state.unread_count = 0;
            changed
        }
        InvitationAction::Remove(id) => {
            let before = state.pending.len();
            state.pending.retain(|inv| inv.id != id);
            state.pending.len() != before
        }
    }
}

/// Join requests grouped by the group they target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationsState {
    pub by_group: BTreeMap<GroupId, Vec<Application>>,
}

impl ApplicationsState {
    pub fn for_group(&self, group_id: &GroupId) -> &[Application] {
        self.by_group
            .get(group_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.by_group
            .values()
            .flatten()
            .filter(|app| app.status.is_pending())
            .count()
    }

    fn find_mut(&mut self, id: &ApplicationId) -> Option<&mut Application> {
        self.by_group
            .values_mut()
            .flat_map(|apps| apps.iter_mut())
            .find(|app| &app.id == id)
    }
}

#[derive(Debug, Clone)]
pub enum ApplicationAction {
    Add(Application),
    UpdateStatus {
        application_id: ApplicationId,
        status: InvitationStatus,
    },
    SetGroup {
        group_id: GroupId,
        applications: Vec<Application>,
    },
    Remove(ApplicationId),
}

pub fn reduce_applications(state: &mut ApplicationsState, action: ApplicationAction) -> bool {
    match action {
        ApplicationAction::Add(application) => {
            let group = state
                .by_group
                .entry(application.group_id.clone())
                .or_default();
            if group.iter().any(|app| app.id == application.id) {
                return false;
            }
            group.insert(0, application);
            true
        }
        ApplicationAction::UpdateStatus {
            application_id,
            status,
        } => match state.find_mut(&application_id) {
            Some(app) if app.status != status => {
                app.status = status;
                true
            }
            _ => false,
        },
        ApplicationAction::SetGroup {
            group_id,
            applications,
        } => {
            let mut seen = HashSet::new();
            let applications: Vec<Application> = applications
                .into_iter()
                .filter(|app| seen.insert(app.id.clone()))
                .map(|mut app| {
                    app.group_id = group_id.clone();
                    app
                })
                .collect();
            if applications.is_empty() {
                return state.by_group.remove(&group_id).is_some();
            }
            if state.by_group.get(&group_id) == Some(&applications) {
                return false;
            }
            state.by_group.insert(group_id, applications);
            true
        }
        ApplicationAction::Remove(id) => {
            let mut removed = false;
            state.by_group.retain(|_, apps| {
                let before = apps.len();
                apps.retain(|app| app.id != id);
                removed |= apps.len() != before;
                !apps.is_empty()
            });
            removed
        }
    }
}

/// Observable client state. Each reducer application that changes state
/// publishes a new snapshot to every watcher.
pub struct ClientStore {
    invitations: watch::Sender<InvitationsState>,
    applications: watch::Sender<ApplicationsState>,
}

impl Default for ClientStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStore {
    pub fn new() -> Self {
        let (invitations, _) = watch::channel(InvitationsState::default());
        let (applications, _) = watch::channel(ApplicationsState::default());
        Self {
            invitations,
            applications,
        }
    }

    pub fn dispatch_invitation(&self, action: InvitationAction) -> bool {
        let label = invitation_action_label(&action);
        let changed = self
            .invitations
            .send_if_modified(|state| reduce_invitations(state, action));
        debug!(action = label, changed, "store: invitation action applied");
        changed
    }

    pub fn dispatch_application(&self, action: ApplicationAction) -> bool {
        self.applications
            .send_if_modified(|state| reduce_applications(state, action))
    }

    pub fn add_pending_invitation(&self, invitation: Invitation) -> bool {
        self.dispatch_invitation(InvitationAction::AddPending(invitation))
    }

    pub fn update_invitation_status(
        &self,
        invitation_id: InvitationId,
        status: InvitationStatus,
    ) -> bool {
        self.dispatch_invitation(InvitationAction::UpdateStatus {
            invitation_id,
            status,
        })
    }

    pub fn set_pending_invitations(&self, list: Vec<Invitation>) -> bool {
        self.dispatch_invitation(InvitationAction::SetPending(list))
    }

    pub fn mark_as_read(&self) -> bool {
        self.dispatch_invitation(InvitationAction::MarkAsRead)
    }

    pub fn remove_invitation(&self, invitation_id: InvitationId) -> bool {
        self.dispatch_invitation(InvitationAction::Remove(invitation_id))
    }

    /// The transition a pushed status change or a local accept/decline
    /// produces: record the new status, then drop the entry from the
    /// pending collection once it is no longer pending.
    pub fn apply_invitation_status(&self, invitation_id: InvitationId, status: InvitationStatus) {
        self.update_invitation_status(invitation_id.clone(), status);
        if !status.is_pending() {
            self.remove_invitation(invitation_id);
        }
    }

    pub fn add_application(&self, application: Application) -> bool {
        self.dispatch_application(ApplicationAction::Add(application))
    }

    pub fn update_application_status(
        &self,
        application_id: ApplicationId,
        status: InvitationStatus,
    ) -> bool {
        self.dispatch_application(ApplicationAction::UpdateStatus {
            application_id,
            status,
        })
    }

    pub fn set_group_applications(
        &self,
        group_id: GroupId,
        applications: Vec<Application>,
    ) -> bool {
        self.dispatch_application(ApplicationAction::SetGroup {
            group_id,
            applications,
        })
    }

    pub fn remove_application(&self, application_id: ApplicationId) -> bool {
        self.dispatch_application(ApplicationAction::Remove(application_id))
    }

    pub fn invitations(&self) -> InvitationsState {
        self.invitations.borrow().clone()
    }

    pub fn applications(&self) -> ApplicationsState {
        self.applications.borrow().clone()
    }

    pub fn unread_count(&self) -> usize {
        self.invitations.borrow().unread_count
    }

    pub fn watch_invitations(&self) -> watch::Receiver<InvitationsState> {
        self.invitations.subscribe()
    }

    pub fn watch_applications(&self) -> watch::Receiver<ApplicationsState> {
        self.applications.subscribe()
    }
}

fn invitation_action_label(action: &InvitationAction) -> &'static str {
    match action {
        InvitationAction::AddPending(_) => "add_pending",
        InvitationAction::UpdateStatus { .. } => "update_status",
        InvitationAction::SetPending(_) => "set_pending",
        InvitationAction::MarkAsRead => "mark_as_read",
        InvitationAction::Remove(_) => "remove",
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

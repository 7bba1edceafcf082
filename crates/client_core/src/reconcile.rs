use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use shared::domain::{GroupId, Invitation, InvitationStatus};
use tracing::{debug, info, warn};

use crate::{
    api::InvitationApi,
    error::SyncError,
    normalize::{normalize_application, normalize_invitation},
    store::ClientStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { pending: usize },
    /// Another sync was in flight; this call did nothing.
    AlreadyRunning,
    Failed,
}

/// Pull-based correction of the pending-invitation collection.
pub struct Reconciler {
    api: Arc<dyn InvitationApi>,
    store: Arc<ClientStore>,
    in_flight: AtomicBool,
}

/// Releases the in-flight flag on every exit path, including cancellation.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new(api: Arc<dyn InvitationApi>, store: Arc<ClientStore>) -> Self {
        Self {
            api,
            store,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetches both invitation lists concurrently and replaces the pending
    /// collection with their merged, normalized contents. Overlapping calls
    /// return [`SyncOutcome::AlreadyRunning`] without touching the network.
    /// On failure the store is left as it was.
    pub async fn sync_pending_invitations(&self) -> SyncOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync: already in flight; skipping");
            return SyncOutcome::AlreadyRunning;
        }
        let _guard = InFlightGuard(&self.in_flight);

        match self.fetch_pending().await {
            Ok(invitations) => {
                let pending = invitations.len();
                self.store.set_pending_invitations(invitations);
                info!(pending, "sync: pending invitations reconciled");
                SyncOutcome::Synced { pending }
            }
            Err(err) => {
                warn!("sync: keeping last known invitations: {err:#}");
                SyncOutcome::Failed
            }
        }
    }

    async fn fetch_pending(&self) -> Result<Vec<Invitation>, SyncError> {
        let (direct, posts) = tokio::join!(
            self.api.list_direct_invitations(InvitationStatus::Pending),
            self.api
                .list_profile_post_invitations(InvitationStatus::Pending),
        );
        let direct = direct.map_err(SyncError::DirectList)?;
        let posts = posts.map_err(SyncError::PostList)?;

        Ok(direct
            .iter()
            .chain(posts.iter())
            .map(normalize_invitation)
            .collect())
    }

    /// Replaces one group's join requests with the server's current list.
    pub async fn refresh_group_applications(&self, group_id: &GroupId) -> Result<usize> {
        let raw = self.api.list_group_applications(group_id).await?;
        let applications: Vec<_> = raw
            .iter()
            .map(|item| normalize_application(item, Some(group_id)))
            .collect();
        let count = applications.len();
        self.store
            .set_group_applications(group_id.clone(), applications);
        info!(group_id = %group_id, count, "sync: group applications refreshed");
        Ok(count)
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;

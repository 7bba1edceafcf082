use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    config::{load_settings, Settings},
    credentials::{CredentialStore, Credentials, FileCredentialStore},
    ConnectionState, InvitationsState, NotificationHub, SyncOutcome,
};
use shared::{
    domain::{GroupId, InvitationDecision, InvitationId},
    protocol::event_names,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "teammy", about = "Teammy realtime invitation client")]
struct Cli {
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    hub_url: Option<String>,
    /// Falls back to the persisted credentials file when omitted.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print invitation updates until Ctrl-C.
    Watch {
        #[arg(long)]
        group: Vec<String>,
    },
    /// Reconcile once and print the pending invitations.
    Sync,
    Respond {
        invitation_id: String,
        decision: Decision,
    },
    Applications {
        group_id: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Decision {
    Accept,
    Decline,
}

impl From<Decision> for InvitationDecision {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Accept => InvitationDecision::Accept,
            Decision::Decline => InvitationDecision::Decline,
        }
    }
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = load_settings();
        if let Some(api_url) = &self.api_url {
            settings.api_base_url = api_url.clone();
        }
        if let Some(hub_url) = &self.hub_url {
            settings.hub_url = hub_url.clone();
        }
        if let Some(delay) = self.reconnect_delay_ms {
            settings.reconnect_delay_ms = delay;
        }
        settings
    }

    fn credentials(&self, settings: &Settings) -> Option<Credentials> {
        let persisted = settings
            .credentials_path
            .as_ref()
            .and_then(|path| FileCredentialStore::new(path).load());
        let token = self
            .token
            .as_deref()
            .or(persisted.as_ref().map(|c| c.token.as_str()));
        let user_id = self
            .user_id
            .as_deref()
            .or(persisted.as_ref().map(|c| c.user_id.as_str()));
        Credentials::from_parts(token, user_id)
    }
}

fn or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}

fn print_invitations(state: &InvitationsState) {
    println!(
        "pending={} unread={}",
        state.pending.len(),
        state.unread_count
    );
    for invitation in &state.pending {
        println!(
            "  {} [{}] group={} from={} status={}",
            invitation.id,
            invitation.kind.as_str(),
            invitation.group_name.as_deref().unwrap_or("-"),
            invitation.invited_by_name.as_deref().unwrap_or("-"),
            invitation.status
        );
    }
}

async fn watch(
    hub: Arc<NotificationHub>,
    credentials: Option<Credentials>,
    groups: Vec<String>,
) -> Result<()> {
    let (token, user_id) = match &credentials {
        Some(c) => (Some(c.token.as_str()), Some(c.user_id.as_str())),
        None => {
            warn!("no credentials; the hub connection stays closed");
            (None, None)
        }
    };
    let mut subscriber = hub.attach("cli", token, user_id);
    for event in [
        event_names::MEMBER_JOINED,
        event_names::MEMBER_REMOVED,
        event_names::MEMBER_ROLE_CHANGED,
        event_names::GROUP_UPDATED,
        event_names::USER_ONLINE,
        event_names::USER_OFFLINE,
    ] {
        subscriber.on(event, move |payload| {
            println!("{event}: {payload}");
            Ok(())
        });
    }

    let mut invitations = subscriber.invitations();
    let mut states = subscriber.connection_state();
    let groups: Vec<GroupId> = groups.into_iter().map(GroupId::new).collect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = invitations.changed() => {
                if changed.is_err() {
                    break;
                }
                print_invitations(&invitations.borrow_and_update());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("connection: {state:?}");
                if state == ConnectionState::Connected {
                    for group in &groups {
                        hub.join_group(group);
                    }
                }
            }
        }
    }

    info!("shutting down");
    subscriber.detach();
    hub.shutdown();
    Ok(())
}

/// Makes the credentials available to REST calls without opening the hub.
fn sign_in(hub: &NotificationHub, credentials: Option<Credentials>) -> Result<()> {
    let credentials =
        credentials.ok_or_else(|| anyhow!("--token and --user-id are required"))?;
    hub.credentials().set(Some(credentials));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = cli.settings();
    let credentials = cli.credentials(&settings);
    let hub = NotificationHub::from_settings(&settings)?;

    match cli.command.unwrap_or(Command::Watch { group: Vec::new() }) {
        Command::Watch { group } => watch(hub, credentials, group).await?,
        Command::Sync => {
            sign_in(&hub, credentials)?;
            match hub.sync_pending_invitations().await {
                SyncOutcome::Synced { .. } => print_invitations(&hub.store().invitations()),
                other => return Err(anyhow!("sync did not complete: {other:?}")),
            }
        }
        Command::Respond {
            invitation_id,
            decision,
        } => {
            sign_in(&hub, credentials)?;
            hub.respond_to_invitation(&InvitationId::new(invitation_id), decision.into())
                .await?;
            println!("done");
        }
        Command::Applications { group_id } => {
            sign_in(&hub, credentials)?;
            let group_id = GroupId::new(group_id);
            let count = hub.refresh_group_applications(&group_id).await?;
            println!("{count} pending application(s) for {group_id}");
            for application in hub.store().applications().for_group(&group_id) {
                println!(
                    "  {} {} {}",
                    application.id,
                    or_dash(&application.user_name),
                    or_dash(&application.skills.join(","))
                );
            }
        }
    }
    Ok(())
}

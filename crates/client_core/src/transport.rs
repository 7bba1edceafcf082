use std::{ops::ControlFlow, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::{
    encode_frame, handshake_request, parse_frames, parse_handshake_response, HubMessage,
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::HubConnectError;

/// One server-to-client invocation: the event name and its first argument.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub target: String,
    pub payload: Value,
}

/// A live hub connection. Dropping `outbound` closes the socket; `inbound`
/// yields `None` once the server side is gone.
pub struct HubLink {
    pub outbound: mpsc::UnboundedSender<HubMessage>,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Opens a connection and completes the hub handshake. A rejected token
    /// surfaces as [`HubConnectError::Unauthorized`].
    async fn connect(&self, access_token: &str) -> Result<HubLink>;
}

pub struct WebSocketConnector {
    hub_url: Url,
    keepalive: Duration,
}

impl WebSocketConnector {
    pub fn new(hub_url: &str, keepalive: Duration) -> Result<Self> {
        if keepalive.is_zero() {
            return Err(anyhow!("keep-alive interval must be non-zero"));
        }
        let mut url =
            Url::parse(hub_url).with_context(|| format!("invalid hub url: {hub_url}"))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(anyhow!("hub url must be http(s) or ws(s), got {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|()| anyhow!("cannot switch {hub_url} to {scheme}"))?;
        Ok(Self {
            hub_url: url,
            keepalive,
        })
    }

    fn endpoint(&self, access_token: &str) -> Url {
        let mut url = self.hub_url.clone();
        url.query_pairs_mut()
            .append_pair("access_token", access_token);
        url
    }
}

#[async_trait]
impl HubConnector for WebSocketConnector {
    async fn connect(&self, access_token: &str) -> Result<HubLink> {
        let endpoint = self.endpoint(access_token);
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(classify_connect_error)?;
        let (mut writer, mut reader) = ws_stream.split();

        writer
            .send(Message::Text(handshake_request()))
            .await
            .map_err(|err| HubConnectError::Handshake(err.to_string()))?;
        let trailing = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    let rest = parse_handshake_response(&text)
                        .map_err(|err| HubConnectError::Handshake(err.to_string()))?;
                    break rest.to_string();
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(HubConnectError::Handshake(
                        "connection closed before handshake reply".to_string(),
                    )
                    .into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(HubConnectError::Transport(err.to_string()).into()),
            }
        };
        info!(hub = %self.hub_url, "hub: handshake complete");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<HubMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let keepalive_every = self.keepalive;
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(keepalive_every);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            keepalive.tick().await;
            loop {
                let message = tokio::select! {
                    next = outbound_rx.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                    _ = keepalive.tick() => HubMessage::Ping,
                };
                let frame = match encode_frame(&message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("hub: dropping unencodable message: {err}");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(frame)).await {
                    warn!("hub: send failed: {err}");
                    break;
                }
            }
            let _ = writer.close().await;
            debug!("hub: writer finished");
        });

        tokio::spawn(async move {
            if relay_frames(&trailing, &inbound_tx).is_break() {
                return;
            }
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if relay_frames(&text, &inbound_tx).is_break() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("hub: receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("hub: reader finished");
        });

        Ok(HubLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn classify_connect_error(err: WsError) -> anyhow::Error {
    match &err {
        WsError::Http(response) if response.status().as_u16() == 401 => {
            HubConnectError::Unauthorized.into()
        }
        _ => HubConnectError::Transport(err.to_string()).into(),
    }
}

/// Forwards invocations to the link; breaks on a server close or once the
/// receiving side is gone.
fn relay_frames(text: &str, inbound: &mpsc::UnboundedSender<InboundEvent>) -> ControlFlow<()> {
    for frame in parse_frames(text) {
        match frame {
            Ok(HubMessage::Invocation {
                target, arguments, ..
            }) => {
                let payload = arguments.into_iter().next().unwrap_or(Value::Null);
                if inbound.send(InboundEvent { target, payload }).is_err() {
                    return ControlFlow::Break(());
                }
            }
            Ok(HubMessage::Close {
                error,
                allow_reconnect,
            }) => {
                info!(?error, allow_reconnect, "hub: server closed the connection");
                return ControlFlow::Break(());
            }
            Ok(HubMessage::Ping | HubMessage::Other(_)) => {}
            Err(err) => warn!("hub: dropping malformed frame: {err}"),
        }
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
